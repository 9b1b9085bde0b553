//! Core domain model for the housing counter tracker.

use std::fmt;

use chrono::{DateTime, NaiveDate, Utc};

pub const CRATE_NAME: &str = "bostad-core";

/// The two primary counters pulled out of one page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CounterPair {
    pub for_sale: u64,
    pub soon_to_be_sold: u64,
}

/// Counters from the auxiliary source. Both are absent when that source was
/// not scraped during the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SecondaryCounts {
    pub for_sale: Option<u64>,
    pub coming: Option<u64>,
}

impl From<CounterPair> for SecondaryCounts {
    fn from(pair: CounterPair) -> Self {
        Self {
            for_sale: Some(pair.for_sale),
            coming: Some(pair.soon_to_be_sold),
        }
    }
}

/// One persisted daily record. `date` is the identity; `recorded_at` is informational.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub date: NaiveDate,
    pub for_sale: u64,
    pub soon_to_be_sold: u64,
    pub secondary_for_sale: Option<u64>,
    pub secondary_coming: Option<u64>,
    pub recorded_at: DateTime<Utc>,
}

impl Snapshot {
    pub fn date_key(&self) -> String {
        format_date(self.date)
    }
}

impl fmt::Display for Snapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} for_sale={} soon_to_be_sold={}",
            self.date_key(),
            self.for_sale,
            self.soon_to_be_sold
        )?;
        if let Some(v) = self.secondary_for_sale {
            write!(f, " secondary_for_sale={v}")?;
        }
        if let Some(v) = self.secondary_coming {
            write!(f, " secondary_coming={v}")?;
        }
        Ok(())
    }
}

/// Stamp extracted counters with the UTC calendar date of `now`.
///
/// The stored key must compare lexicographically across runs, so the local
/// timezone of the scheduler never leaks into it.
pub fn build_snapshot(
    extracted: CounterPair,
    secondary: SecondaryCounts,
    now: DateTime<Utc>,
) -> Snapshot {
    Snapshot {
        date: now.date_naive(),
        for_sale: extracted.for_sale,
        soon_to_be_sold: extracted.soon_to_be_sold,
        secondary_for_sale: secondary.for_sale,
        secondary_coming: secondary.coming,
        recorded_at: now,
    }
}

/// ISO 8601 `YYYY-MM-DD`.
pub fn format_date(date: NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}
