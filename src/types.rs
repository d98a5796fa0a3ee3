// Validated Types
// Strongly-typed wrappers that enforce invariants at construction time.
// These types cannot be built from invalid data, so downstream code never
// re-checks them.

use anyhow::{ensure, Result};
use chrono::{DateTime, Datelike, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// An email address that passed shape validation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ValidatedEmail {
    inner: String,
}

impl ValidatedEmail {
    /// # Invariants
    /// - Non-empty after trimming
    /// - Contains exactly one `@` with non-empty local and domain parts
    /// - Length <= 320 characters
    pub fn new(email: impl Into<String>) -> Result<Self> {
        let email = email.into();
        let trimmed = email.trim();

        ensure!(!trimmed.is_empty(), "Email cannot be empty");
        ensure!(trimmed.len() <= 320, "Email exceeds maximum length");

        let mut parts = trimmed.splitn(2, '@');
        let local = parts.next().unwrap_or_default();
        let domain = parts.next().unwrap_or_default();
        ensure!(
            !local.is_empty() && !domain.is_empty() && domain.contains('.'),
            "Invalid email address: {trimmed}"
        );

        Ok(Self {
            inner: trimmed.to_ascii_lowercase(),
        })
    }

    pub fn as_str(&self) -> &str {
        &self.inner
    }
}

impl fmt::Display for ValidatedEmail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.inner)
    }
}

/// A retrieval result-set size bounded to a sane range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidatedTopK {
    inner: usize,
}

impl ValidatedTopK {
    const MAX: usize = 100;

    /// # Invariants
    /// - 1 <= k <= 100
    pub fn new(k: usize) -> Result<Self> {
        ensure!(k > 0, "top_k must be positive");
        ensure!(k <= Self::MAX, "top_k must be <= {}", Self::MAX);
        Ok(Self { inner: k })
    }

    pub fn get(&self) -> usize {
        self.inner
    }

    /// Recall budget for the first-stage passes: max(50, k * 10).
    pub fn recall_k(&self) -> usize {
        (self.inner * 10).max(50)
    }
}

/// Chunking parameters for a knowledge base.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkParams {
    size: usize,
    overlap: usize,
}

impl ChunkParams {
    /// # Invariants
    /// - size > 0
    /// - overlap < size (otherwise the splitter cannot advance)
    pub fn new(size: usize, overlap: usize) -> Result<Self> {
        ensure!(size > 0, "chunk_size must be positive");
        ensure!(
            overlap < size,
            "chunk_overlap ({overlap}) must be smaller than chunk_size ({size})"
        );
        Ok(Self { size, overlap })
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn overlap(&self) -> usize {
        self.overlap
    }
}

/// A UTC calendar day, the key space for daily quota counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UtcDay {
    year: i32,
    ordinal: u32,
}

impl UtcDay {
    pub fn today() -> Self {
        Self::from_datetime(Utc::now())
    }

    pub fn from_datetime(at: DateTime<Utc>) -> Self {
        Self {
            year: at.year(),
            ordinal: at.ordinal(),
        }
    }

    /// Start of the next day, where counters for this day expire.
    pub fn next_midnight(&self) -> DateTime<Utc> {
        let start = Utc
            .with_ymd_and_hms(self.year, 1, 1, 0, 0, 0)
            .single()
            .expect("valid year start");
        start + chrono::Duration::days(self.ordinal as i64)
    }
}

impl fmt::Display for UtcDay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{:03}", self.year, self.ordinal)
    }
}

/// The logical index name owned by a knowledge base.
pub fn index_name_for(knowledge_id: i64) -> String {
    format!("kb_{knowledge_id}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_email_validation() {
        assert!(ValidatedEmail::new("user@example.com").is_ok());
        assert_eq!(
            ValidatedEmail::new(" User@Example.COM ").unwrap().as_str(),
            "user@example.com"
        );
        assert!(ValidatedEmail::new("").is_err());
        assert!(ValidatedEmail::new("no-at-sign").is_err());
        assert!(ValidatedEmail::new("user@").is_err());
        assert!(ValidatedEmail::new("@example.com").is_err());
        assert!(ValidatedEmail::new("user@nodot").is_err());
    }

    #[test]
    fn test_top_k_bounds() {
        assert!(ValidatedTopK::new(0).is_err());
        assert!(ValidatedTopK::new(101).is_err());
        assert_eq!(ValidatedTopK::new(5).unwrap().get(), 5);
    }

    #[test]
    fn test_recall_k_floor() {
        assert_eq!(ValidatedTopK::new(1).unwrap().recall_k(), 50);
        assert_eq!(ValidatedTopK::new(4).unwrap().recall_k(), 50);
        assert_eq!(ValidatedTopK::new(10).unwrap().recall_k(), 100);
    }

    #[test]
    fn test_chunk_params() {
        assert!(ChunkParams::new(500, 50).is_ok());
        assert!(ChunkParams::new(0, 0).is_err());
        assert!(ChunkParams::new(100, 100).is_err());
        assert!(ChunkParams::new(100, 200).is_err());
    }

    #[test]
    fn test_utc_day_rollover() {
        let day = UtcDay::from_datetime(Utc.with_ymd_and_hms(2026, 3, 1, 23, 59, 59).unwrap());
        let midnight = day.next_midnight();
        assert_eq!(midnight, Utc.with_ymd_and_hms(2026, 3, 2, 0, 0, 0).unwrap());

        let same_day = UtcDay::from_datetime(Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 1).unwrap());
        assert_eq!(day, same_day);
    }

    #[test]
    fn test_index_name() {
        assert_eq!(index_name_for(42), "kb_42");
    }
}
