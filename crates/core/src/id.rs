//! Strongly-typed identifiers used across the domain.

use core::str::FromStr;
use serde::{Deserialize, Serialize};

use crate::error::DomainError;

/// Identifier of a booking.
///
/// Assigned by the booking store on create (monotonic integer) and immutable
/// afterwards.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BookingId(i64);

impl BookingId {
    pub fn new(value: i64) -> Self {
        Self(value)
    }

    pub fn get(&self) -> i64 {
        self.0
    }

    /// Key under which the single fulfillment job of this booking is enqueued.
    pub fn job_dedupe_key(&self) -> String {
        format!("booking:{}", self.0)
    }
}

impl core::fmt::Display for BookingId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

impl From<i64> for BookingId {
    fn from(value: i64) -> Self {
        Self(value)
    }
}

impl From<BookingId> for i64 {
    fn from(value: BookingId) -> Self {
        value.0
    }
}

impl FromStr for BookingId {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let value = s
            .parse::<i64>()
            .map_err(|e| DomainError::invalid_id(format!("BookingId: {e}")))?;
        if value < 1 {
            return Err(DomainError::invalid_id(format!(
                "BookingId: must be positive, got {value}"
            )));
        }
        Ok(Self(value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_positive_integers() {
        let id: BookingId = "42".parse().unwrap();
        assert_eq!(id.get(), 42);
        assert_eq!(id.to_string(), "42");
    }

    #[test]
    fn rejects_garbage_and_non_positive() {
        assert!(matches!("abc".parse::<BookingId>(), Err(DomainError::InvalidId(_))));
        assert!(matches!("0".parse::<BookingId>(), Err(DomainError::InvalidId(_))));
        assert!(matches!("-3".parse::<BookingId>(), Err(DomainError::InvalidId(_))));
    }

    #[test]
    fn dedupe_key_is_stable() {
        assert_eq!(BookingId::new(7).job_dedupe_key(), "booking:7");
    }
}
