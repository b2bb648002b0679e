//! Call bookkeeping for rate limiter diagnostics.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;

const RETENTION: Duration = Duration::from_secs(60 * 60);

/// Time-ordered record of provider call timestamps, success and error
/// alike, bounded to the last hour.
///
/// Entries older than the retention horizon are purged before every read
/// that depends on recency.
#[derive(Debug, Default)]
pub struct CallLedger {
    calls: Mutex<VecDeque<Instant>>,
}

impl CallLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self) {
        let now = Instant::now();
        let mut calls = self.calls.lock().unwrap_or_else(|e| e.into_inner());
        Self::prune(&mut calls, now);
        calls.push_back(now);
    }

    fn prune(calls: &mut VecDeque<Instant>, now: Instant) {
        while let Some(front) = calls.front() {
            if now.duration_since(*front) > RETENTION {
                calls.pop_front();
            } else {
                break;
            }
        }
    }

    fn calls_since(&self, window: Duration) -> usize {
        let now = Instant::now();
        let mut calls = self.calls.lock().unwrap_or_else(|e| e.into_inner());
        Self::prune(&mut calls, now);
        calls
            .iter()
            .rev()
            .take_while(|t| now.duration_since(**t) <= window)
            .count()
    }

    pub fn calls_last_minute(&self) -> usize {
        self.calls_since(Duration::from_secs(60))
    }

    pub fn calls_last_hour(&self) -> usize {
        self.calls_since(RETENTION)
    }
}
