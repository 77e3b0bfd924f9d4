//! Wiring tests for the assembled engine.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::time::Duration;

use courier::{Config, Courier};
use courier_common::model::{EventType, NotificationItem};
use courier_delivery::SubmitOutcome;
use pretty_assertions::assert_eq;
use tokio_util::sync::CancellationToken;

const SAMPLE: &str = include_str!("../../courier.config.ron");

#[test]
fn sample_config_is_valid() {
    let config = Config::parse(SAMPLE).unwrap();

    config.validate().unwrap();
    assert_eq!(config.smtp.port, 587);
    assert_eq!(config.batch.brand, "Courier");
    assert_eq!(config.templates.templates.len(), 1);
}

#[tokio::test]
async fn submitted_events_reach_the_inbox() {
    let courier = Courier::new(Config::default()).unwrap();

    let item = NotificationItem::new(
        "reader",
        EventType::SystemAlert,
        "system",
        "maintenance-1",
        "Scheduled maintenance",
    )
    .with_description("Back at 03:00 UTC");
    let outcome = courier.notifications().submit(item).await.unwrap();

    assert!(matches!(outcome, SubmitOutcome::Delivered(_)));
    let entries = courier.inbox().entries("reader");
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].text, "Back at 03:00 UTC");
}

#[tokio::test]
async fn serve_stops_when_cancelled() {
    let courier = Courier::new(Config::default()).unwrap();
    let token = CancellationToken::new();

    let canceller = {
        let token = token.clone();
        async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            token.cancel();
        }
    };

    let (served, ()) = tokio::join!(courier.serve(token), canceller);
    served.unwrap();
}
