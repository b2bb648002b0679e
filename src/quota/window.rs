//! Rolling per-tenant usage counters.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

const MINUTE_RETENTION_SECS: i64 = 24 * 60 * 60;
const DAY_RETENTION_SECS: i64 = 2 * 24 * 60 * 60;

#[derive(Debug, Clone, Copy, Default)]
struct Bucket {
    success: u64,
    failure: u64,
    tokens: u64,
}

/// Success/failure/token counters bucketed by minute and by day.
///
/// Buckets older than the retention horizon are dropped before every read,
/// so a dedicated background sweep is an optimization, not a requirement.
#[derive(Debug, Default)]
pub struct UsageWindow {
    minutes: BTreeMap<i64, Bucket>,
    days: BTreeMap<i64, Bucket>,
}

impl UsageWindow {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, success: bool, tokens: u64) {
        self.record_at(Utc::now(), success, tokens);
    }

    pub fn record_at(&mut self, at: DateTime<Utc>, success: bool, tokens: u64) {
        self.prune_at(at);
        let minute = self.minutes.entry(at.timestamp() / 60).or_default();
        let day = self.days.entry(at.timestamp() / 86_400).or_default();
        for bucket in [minute, day] {
            if success {
                bucket.success += 1;
            } else {
                bucket.failure += 1;
            }
            bucket.tokens += tokens;
        }
    }

    pub fn requests_this_minute(&mut self, now: DateTime<Utc>) -> u64 {
        self.prune_at(now);
        self.minutes
            .get(&(now.timestamp() / 60))
            .map(|b| b.success + b.failure)
            .unwrap_or(0)
    }

    pub fn requests_today(&mut self, now: DateTime<Utc>) -> u64 {
        self.prune_at(now);
        self.days
            .get(&(now.timestamp() / 86_400))
            .map(|b| b.success + b.failure)
            .unwrap_or(0)
    }

    pub fn tokens_today(&mut self, now: DateTime<Utc>) -> u64 {
        self.prune_at(now);
        self.days
            .get(&(now.timestamp() / 86_400))
            .map(|b| b.tokens)
            .unwrap_or(0)
    }

    pub fn failures_today(&mut self, now: DateTime<Utc>) -> u64 {
        self.prune_at(now);
        self.days
            .get(&(now.timestamp() / 86_400))
            .map(|b| b.failure)
            .unwrap_or(0)
    }

    /// Drop counters older than the retention horizon.
    pub fn prune_at(&mut self, now: DateTime<Utc>) {
        let minute_floor = (now.timestamp() - MINUTE_RETENTION_SECS) / 60;
        let day_floor = (now.timestamp() - DAY_RETENTION_SECS) / 86_400;
        self.minutes = self.minutes.split_off(&minute_floor);
        self.days = self.days.split_off(&day_floor);
    }
}
