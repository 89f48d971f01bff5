//! Migration ranges: contiguous id partitions with a processing lifecycle.

use core::str::FromStr;

use chrono::{DateTime, Duration, NaiveTime, Utc};
use serde::{Deserialize, Serialize};

use crate::entity::Entity;
use crate::error::DomainError;
use crate::id::RangeId;

/// Processing state of a range.
///
/// The status is advisory; exclusive processing is enforced by the per-range
/// distributed lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RangeStatus {
    Pending,
    Processing,
    Complete,
}

impl RangeStatus {
    pub const fn as_str(&self) -> &'static str {
        match self {
            RangeStatus::Pending => "PENDING",
            RangeStatus::Processing => "PROCESSING",
            RangeStatus::Complete => "COMPLETE",
        }
    }
}

impl core::fmt::Display for RangeStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RangeStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(RangeStatus::Pending),
            "PROCESSING" => Ok(RangeStatus::Processing),
            "COMPLETE" => Ok(RangeStatus::Complete),
            other => Err(DomainError::unknown_status("range", other)),
        }
    }
}

/// A persisted range row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationRange {
    pub id: RangeId,
    pub span: IdSpan,
    pub status: RangeStatus,
    pub last_updated: DateTime<Utc>,
}

impl MigrationRange {
    /// Whether a `Processing` range has gone without updates for longer than
    /// `threshold` and should be handed back to `Pending`.
    pub fn is_stale(&self, now: DateTime<Utc>, threshold: Duration) -> bool {
        self.status == RangeStatus::Processing && self.last_updated < now - threshold
    }
}

impl Entity for MigrationRange {
    type Id = RangeId;

    fn id(&self) -> RangeId {
        self.id
    }
}

/// Inclusive `[min, max]` span of source-file ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IdSpan {
    pub min: i64,
    pub max: i64,
}

impl IdSpan {
    pub fn new(min: i64, max: i64) -> Result<Self, DomainError> {
        if min > max {
            return Err(DomainError::invariant(format!(
                "span minimum {min} exceeds maximum {max}"
            )));
        }
        Ok(Self { min, max })
    }

    pub fn width(&self) -> u64 {
        self.max.abs_diff(self.min) + 1
    }
}

/// Split `[min, max]` into consecutive spans no wider than `batch_size`.
///
/// Ids are assumed positive; non-positive bounds mean the source had no rows
/// and nothing is planned.
pub fn plan_ranges(min: i64, max: i64, batch_size: u32) -> Vec<IdSpan> {
    if min <= 0 || max <= 0 || max < min || batch_size == 0 {
        return Vec::new();
    }

    let step = i64::from(batch_size);
    let mut spans = Vec::with_capacity(((max - min) / step + 1) as usize);
    let mut start = min;
    while start <= max {
        let end = start.saturating_add(step - 1).min(max);
        spans.push(IdSpan {
            min: start,
            max: end,
        });
        match start.checked_add(step) {
            Some(next) => start = next,
            None => break,
        }
    }
    spans
}

/// Span that extends existing coverage up to `next_max`, if anything is new.
pub fn expansion_span(current_max: i64, next_max: Option<i64>) -> Option<IdSpan> {
    match next_max {
        Some(next) if current_max > 0 && next > current_max => Some(IdSpan {
            min: current_max + 1,
            max: next,
        }),
        _ => None,
    }
}

/// Earliest creation date considered for the initial seed: `now` minus the
/// retention period, truncated to the start of that (UTC) day.
pub fn retention_cutoff(now: DateTime<Utc>, retention_minutes: u64) -> DateTime<Utc> {
    let minutes = i64::try_from(retention_minutes).unwrap_or(i64::MAX);
    let shifted = now
        .checked_sub_signed(Duration::try_minutes(minutes).unwrap_or(Duration::MAX))
        .unwrap_or(DateTime::<Utc>::MIN_UTC);
    shifted.date_naive().and_time(NaiveTime::MIN).and_utc()
}
