//! Transaction log positions.
//!
//! A [`Position`] is an opaque, serialisable token. Only the backend that
//! produced it knows how to order it, so every comparison goes through an
//! [`XLog`] implementation.

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Errors raised when a position cannot be interpreted.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum XLogError {
    /// The position does not match the backend's encoding.
    #[error("malformed xlog position: {0:?}")]
    Malformed(String),

    /// Incrementing the position would overflow.
    #[error("xlog position overflow: {0}")]
    Overflow(String),
}

/// An opaque transaction log position.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Position(String);

impl Position {
    /// Wrap a backend-encoded position.
    #[must_use]
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// The raw encoded position.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether the position is unset.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Position {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for Position {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// A database-specific transaction log encoding.
///
/// Callers treat a comparison error as "cannot compare yet" and retry later.
pub trait XLog: Send + Sync + fmt::Debug {
    /// The position every fresh cluster starts from.
    fn zero(&self) -> Position;

    /// Order two positions.
    ///
    /// # Errors
    ///
    /// Returns [`XLogError::Malformed`] if either position cannot be parsed.
    fn compare(&self, a: &Position, b: &Position) -> Result<Ordering, XLogError>;

    /// Advance a position by `n` units. Only the simulator needs this.
    ///
    /// # Errors
    ///
    /// Returns an error if `pos` cannot be parsed or the result overflows.
    fn increment(&self, pos: &Position, n: u64) -> Result<Position, XLogError>;
}

/// PostgreSQL log sequence numbers, encoded as `HI/LO` in upper-case hex with
/// the low word padded to eight digits (`0/0000000A`).
#[derive(Debug, Clone, Copy, Default)]
pub struct PgXLog;

impl PgXLog {
    fn parse(pos: &Position) -> Result<u64, XLogError> {
        let malformed = || XLogError::Malformed(pos.as_str().to_owned());
        let (hi, lo) = pos.as_str().split_once('/').ok_or_else(malformed)?;
        let hi = u32::from_str_radix(hi, 16).map_err(|_| malformed())?;
        let lo = u32::from_str_radix(lo, 16).map_err(|_| malformed())?;
        Ok((u64::from(hi) << 32) | u64::from(lo))
    }

    fn format(value: u64) -> Position {
        Position(format!("{:X}/{:08X}", value >> 32, value & 0xFFFF_FFFF))
    }
}

impl XLog for PgXLog {
    fn zero(&self) -> Position {
        Position::new("0/00000000")
    }

    fn compare(&self, a: &Position, b: &Position) -> Result<Ordering, XLogError> {
        Ok(Self::parse(a)?.cmp(&Self::parse(b)?))
    }

    fn increment(&self, pos: &Position, n: u64) -> Result<Position, XLogError> {
        let value = Self::parse(pos)?;
        value
            .checked_add(n)
            .map(Self::format)
            .ok_or_else(|| XLogError::Overflow(pos.to_string()))
    }
}
