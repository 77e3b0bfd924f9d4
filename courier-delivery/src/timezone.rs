use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use courier_common::internal;

/// `now` in the user's IANA zone. Unknown zones fall back to UTC.
#[must_use]
pub fn local_time(zone: &str, now: DateTime<Utc>) -> DateTime<Tz> {
    let tz = zone.parse::<Tz>().unwrap_or_else(|_| {
        internal!(level = DEBUG, "Unknown timezone '{zone}', using UTC");
        chrono_tz::UTC
    });

    now.with_timezone(&tz)
}
