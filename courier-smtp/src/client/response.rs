//! SMTP reply parsing.

use super::error::{ClientError, Result};

/// One line of a (possibly multi-line) reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseLine {
    pub code: u16,
    /// `true` for `250 text`, `false` for `250-text`.
    pub is_last: bool,
    pub message: String,
}

/// A complete SMTP reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub code: u16,
    pub lines: Vec<String>,
}

impl Response {
    #[must_use]
    pub const fn new(code: u16, lines: Vec<String>) -> Self {
        Self { code, lines }
    }

    /// All lines joined with newlines.
    #[must_use]
    pub fn message(&self) -> String {
        self.lines.join("\n")
    }

    #[must_use]
    pub const fn is_success(&self) -> bool {
        self.code >= 200 && self.code < 300
    }

    #[must_use]
    pub const fn is_intermediate(&self) -> bool {
        self.code >= 300 && self.code < 400
    }

    #[must_use]
    pub const fn is_temporary_error(&self) -> bool {
        self.code >= 400 && self.code < 500
    }

    #[must_use]
    pub const fn is_permanent_error(&self) -> bool {
        self.code >= 500 && self.code < 600
    }

    #[must_use]
    pub const fn is_error(&self) -> bool {
        self.is_temporary_error() || self.is_permanent_error()
    }

    /// The RFC 3463 enhanced status code at the start of the reply text,
    /// e.g. `5.1.1`.
    #[must_use]
    pub fn enhanced_code(&self) -> Option<String> {
        let first = self.lines.first()?;
        let token = first.split_whitespace().next()?;

        let mut parts = token.split('.');
        let class = parts.next()?;
        let subject = parts.next()?;
        let detail = parts.next()?;

        let valid_class = matches!(class, "2" | "4" | "5");
        let numeric = |s: &str| (1..=3).contains(&s.len()) && s.bytes().all(|b| b.is_ascii_digit());

        (valid_class && numeric(subject) && numeric(detail) && parts.next().is_none())
            .then(|| token.to_string())
    }

    /// EHLO keywords, upper-cased, excluding the greeting line.
    #[must_use]
    pub fn extensions(&self) -> Vec<String> {
        self.lines
            .iter()
            .skip(1)
            .map(|line| line.to_ascii_uppercase())
            .collect()
    }

    /// Parses a single reply line (without its line terminator).
    ///
    /// # Errors
    ///
    /// Returns `ClientError::ParseError` if the line is not `NNN[ -]text`.
    pub fn parse_line(line: &str) -> Result<ResponseLine> {
        let Some(code_str) = line.get(..3) else {
            return Err(ClientError::ParseError(format!(
                "Response line too short: '{line}'"
            )));
        };

        let code = code_str
            .parse::<u16>()
            .map_err(|_| ClientError::ParseError(format!("Invalid status code: '{code_str}'")))?;

        let rest = &line[3..];
        let (is_last, message) = match rest.chars().next() {
            None => (true, ""),
            Some(' ') => (true, &rest[1..]),
            Some('-') => (false, &rest[1..]),
            Some(c) => {
                return Err(ClientError::ParseError(format!(
                    "Invalid separator character: '{c}'"
                )));
            }
        };

        Ok(ResponseLine {
            code,
            is_last,
            message: message.to_string(),
        })
    }

    /// Parses one complete reply from the front of `buffer`.
    ///
    /// Returns the reply and the number of bytes it occupied, or `None` when
    /// more data is needed.
    ///
    /// # Errors
    ///
    /// Returns `ClientError::ParseError` for malformed lines or a multi-line
    /// reply whose codes disagree.
    pub fn parse_response(buffer: &[u8]) -> Result<Option<(Self, usize)>> {
        let mut consumed = 0;
        let mut code = None;
        let mut lines = Vec::new();

        while let Some(end) = buffer[consumed..].iter().position(|&b| b == b'\n') {
            let raw = &buffer[consumed..consumed + end];
            consumed += end + 1;

            let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
            if raw.is_empty() {
                continue;
            }

            let line = Self::parse_line(std::str::from_utf8(raw)?)?;

            match code {
                Some(expected) if expected != line.code => {
                    return Err(ClientError::ParseError(format!(
                        "Status code mismatch in multi-line response: expected {expected}, got {}",
                        line.code
                    )));
                }
                None => code = Some(line.code),
                Some(_) => {}
            }

            lines.push(line.message);

            if line.is_last {
                return Ok(code.map(|code| (Self::new(code, lines), consumed)));
            }
        }

        Ok(None)
    }
}
