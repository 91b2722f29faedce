//! Durable record type

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A short code to long URL mapping as stored in the durable tier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    /// Short code, unique across the table
    pub short: String,
    /// Target URL
    pub long: String,
    /// Insert time
    pub created_at: DateTime<Utc>,
}

impl Record {
    /// Create a record stamped with the current time
    pub fn new(short: impl Into<String>, long: impl Into<String>) -> Self {
        Self {
            short: short.into(),
            long: long.into(),
            created_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_serializes_with_timestamp() {
        let record = Record::new("abc1234", "https://example.com/landing");
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["short"], "abc1234");
        assert_eq!(json["long"], "https://example.com/landing");
        assert!(json["created_at"].is_string());
    }
}
