//! Global position cursor codec.
//!
//! A [`GlobalPosition`] is the opaque, resumable token handed to readers of the
//! global log. Its text form is `"<commit>-<prepare>"`; the empty token means
//! "start of the log". A [`LogPosition`] is the decoded, totally ordered form
//! used by backing logs.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{EventideError, Result};

/// Decoded position in the backing log, ordered by commit then prepare.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LogPosition {
    pub commit: u64,
    pub prepare: u64,
}

impl LogPosition {
    /// The position before the first committed event.
    pub const START: LogPosition = LogPosition { commit: 0, prepare: 0 };

    /// The position past the last committed event ("not yet known").
    pub const END: LogPosition = LogPosition {
        commit: u64::MAX,
        prepare: u64::MAX,
    };

    pub const fn new(commit: u64, prepare: u64) -> Self {
        Self { commit, prepare }
    }

    pub fn is_end(&self) -> bool {
        *self == Self::END
    }
}

impl fmt::Display for LogPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.commit, self.prepare)
    }
}

impl FromStr for LogPosition {
    type Err = EventideError;

    fn from_str(value: &str) -> Result<Self> {
        let malformed = || {
            EventideError::invalid_argument(format!(
                "Unknown structure for global position '{}'. Expected it to be empty or in the form 'L-L'",
                value
            ))
            .with_context("global_position", value)
        };

        let mut parts = value.split('-');
        let (commit, prepare) = match (parts.next(), parts.next(), parts.next()) {
            (Some(commit), Some(prepare), None) => (commit, prepare),
            _ => return Err(malformed()),
        };

        let commit = commit.parse::<u64>().map_err(|_| malformed())?;
        let prepare = prepare.parse::<u64>().map_err(|_| malformed())?;
        Ok(Self::new(commit, prepare))
    }
}

/// Opaque cursor over the global log.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GlobalPosition(String);

impl GlobalPosition {
    /// The distinguished "start of log" token.
    pub fn start() -> Self {
        Self(String::new())
    }

    /// The distinguished "end of log" token.
    pub fn end() -> Self {
        LogPosition::END.into()
    }

    /// Wrap a raw token without validating it. Decoding happens on use.
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn value(&self) -> &str {
        &self.0
    }

    pub fn is_start(&self) -> bool {
        self.0.trim().is_empty()
    }

    pub fn is_end(&self) -> bool {
        matches!(self.position(), Ok(p) if p.is_end())
    }

    /// Decode into a log position. Malformed tokens are an `InvalidArgument` error.
    pub fn position(&self) -> Result<LogPosition> {
        if self.is_start() {
            return Ok(LogPosition::START);
        }
        self.0.parse()
    }
}

impl From<LogPosition> for GlobalPosition {
    fn from(position: LogPosition) -> Self {
        Self(position.to_string())
    }
}

impl FromStr for GlobalPosition {
    type Err = EventideError;

    /// Validating parse: rejects anything that is not empty or `"<u64>-<u64>"`.
    fn from_str(value: &str) -> Result<Self> {
        let token = Self::new(value);
        token.position()?;
        Ok(token)
    }
}

impl fmt::Display for GlobalPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;

    #[test]
    fn test_decode_components() {
        let position: GlobalPosition = "7-3".parse().unwrap();
        assert_eq!(position.position().unwrap(), LogPosition::new(7, 3));
    }

    #[test]
    fn test_round_trip() {
        let original = LogPosition::new(18_446_744_073_709_551_000, 42);
        let token = GlobalPosition::from(original);
        assert_eq!(token.value(), "18446744073709551000-42");
        let decoded: GlobalPosition = token.value().parse().unwrap();
        assert_eq!(decoded, token);
        assert_eq!(decoded.position().unwrap(), original);
    }

    #[test]
    fn test_malformed_tokens_are_invalid_argument() {
        for raw in ["abc", "1-2-3", "1-", "-1", "x-1", "1--2", "1_2"] {
            let err = raw.parse::<GlobalPosition>().unwrap_err();
            assert_eq!(err.code(), ErrorCode::InvalidArgument, "token {:?}", raw);
        }
    }

    #[test]
    fn test_start_and_end() {
        let start = GlobalPosition::start();
        assert!(start.is_start());
        assert_eq!(start.position().unwrap(), LogPosition::START);

        let end = GlobalPosition::end();
        assert!(end.is_end());
        assert!(!end.is_start());
        assert_eq!(end.value(), format!("{}-{}", u64::MAX, u64::MAX));
    }

    #[test]
    fn test_log_position_ordering() {
        assert!(LogPosition::new(1, 9) < LogPosition::new(2, 0));
        assert!(LogPosition::new(2, 0) < LogPosition::new(2, 1));
        assert!(LogPosition::START < LogPosition::END);
    }
}
