//! Priority score: `-priority + t_ms / 1e13`.
//!
//! Min-ordered: the smallest score is dequeued first. Priority dominates
//! (one priority step outweighs ~317 years of timestamp drift), and among
//! equal priorities an earlier enqueue yields a smaller score.
//!
//! Resolution limit: `t_ms` is whole milliseconds, so equal-priority entries
//! enqueued within the same millisecond get identical scores. Large
//! priorities also shrink the f64 precision left for the time fraction.
//! Ties fall back to the store's tie-break (task id), which is not causal.

use chrono::{DateTime, Utc};

const TIME_SCALE: f64 = 1e13;

pub fn score(priority: i32, enqueued_at_ms: i64) -> f64 {
    -(priority as f64) + (enqueued_at_ms as f64) / TIME_SCALE
}

pub fn score_at(priority: i32, at: DateTime<Utc>) -> f64 {
    score(priority, at.timestamp_millis())
}
