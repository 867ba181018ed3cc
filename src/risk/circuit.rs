//! Stop-loss circuit breaker
//!
//! Rolling window of SL-hit timestamps. Reaching the threshold inside the
//! window pauses new entries for `pause` and clears the window.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tracing::warn;

/// Persisted breaker state
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CircuitState {
    pub hits: Vec<DateTime<Utc>>,
    pub pause_until: Option<DateTime<Utc>>,
}

/// Observable breaker status
#[derive(Debug, Clone, PartialEq)]
pub struct CircuitStatus {
    pub paused: bool,
    pub remaining: Option<Duration>,
    pub recent_hits: usize,
    pub threshold: usize,
    pub window: Duration,
}

#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    threshold: usize,
    window: Duration,
    pause: Duration,
    hits: VecDeque<DateTime<Utc>>,
    pause_until: Option<DateTime<Utc>>,
}

pub fn format_remaining(d: Duration) -> String {
    let secs = d.num_seconds().max(0);
    format!("{}m{}s", secs / 60, secs % 60)
}

impl CircuitBreaker {
    pub fn new(threshold: usize, window_mins: i64, pause_mins: i64) -> Self {
        Self {
            threshold: threshold.max(1),
            window: Duration::minutes(window_mins.max(0)),
            pause: Duration::minutes(pause_mins.max(0)),
            hits: VecDeque::new(),
            pause_until: None,
        }
    }

    fn prune(&mut self, now: DateTime<Utc>) {
        while let Some(first) = self.hits.front() {
            if now - *first > self.window {
                self.hits.pop_front();
            } else {
                break;
            }
        }
    }

    /// Record one SL exit; returns true if this hit tripped the breaker
    pub fn record_sl_hit(&mut self, now: DateTime<Utc>) -> bool {
        self.hits.push_back(now);
        self.prune(now);
        if self.hits.len() >= self.threshold {
            let until = now + self.pause;
            self.pause_until = Some(until);
            self.hits.clear();
            warn!(
                threshold = self.threshold,
                until = %until,
                "🚨 [CIRCUIT] SL threshold reached, pausing new entries"
            );
            return true;
        }
        false
    }

    pub fn is_paused(&self, now: DateTime<Utc>) -> bool {
        self.pause_until.map_or(false, |until| now < until)
    }

    pub fn remaining(&self, now: DateTime<Utc>) -> Option<Duration> {
        self.pause_until
            .filter(|until| now < *until)
            .map(|until| until - now)
    }

    /// C5 reason while paused
    pub fn block_reason(&self, now: DateTime<Utc>) -> Option<String> {
        self.remaining(now)
            .map(|left| format!("circuit pause {} left", format_remaining(left)))
    }

    pub fn reset(&mut self) {
        self.hits.clear();
        self.pause_until = None;
    }

    pub fn status(&self, now: DateTime<Utc>) -> CircuitStatus {
        let recent_hits = self
            .hits
            .iter()
            .filter(|t| now - **t <= self.window)
            .count();
        CircuitStatus {
            paused: self.is_paused(now),
            remaining: self.remaining(now),
            recent_hits,
            threshold: self.threshold,
            window: self.window,
        }
    }

    pub fn export(&self) -> CircuitState {
        CircuitState {
            hits: self.hits.iter().copied().collect(),
            pause_until: self.pause_until,
        }
    }

    pub fn import(&mut self, state: &CircuitState) {
        self.hits = state.hits.iter().copied().collect();
        self.pause_until = state.pause_until;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 2, 5, 0, 0).unwrap()
    }

    #[test]
    fn trips_on_third_hit_within_window() {
        let mut cb = CircuitBreaker::new(3, 15, 20);
        assert!(!cb.record_sl_hit(t0()));
        assert!(!cb.record_sl_hit(t0() + Duration::minutes(5)));
        assert!(cb.record_sl_hit(t0() + Duration::minutes(10)));

        let now = t0() + Duration::minutes(11);
        assert!(cb.is_paused(now));
        assert_eq!(cb.block_reason(now).unwrap(), "circuit pause 19m0s left");
        assert_eq!(cb.status(now).recent_hits, 0);

        assert!(!cb.is_paused(t0() + Duration::minutes(30)));
    }

    #[test]
    fn hits_outside_window_expire() {
        let mut cb = CircuitBreaker::new(3, 15, 20);
        cb.record_sl_hit(t0());
        cb.record_sl_hit(t0() + Duration::minutes(1));
        assert!(!cb.record_sl_hit(t0() + Duration::minutes(20)));
        assert!(!cb.is_paused(t0() + Duration::minutes(20)));
    }

    #[test]
    fn manual_reset_clears_pause() {
        let mut cb = CircuitBreaker::new(1, 15, 20);
        assert!(cb.record_sl_hit(t0()));
        cb.reset();
        assert!(!cb.is_paused(t0()));
        assert_eq!(cb.remaining(t0()), None);
    }

    #[test]
    fn export_import_keeps_pause() {
        let mut cb = CircuitBreaker::new(1, 15, 20);
        cb.record_sl_hit(t0());
        let state = cb.export();

        let mut restored = CircuitBreaker::new(1, 15, 20);
        restored.import(&state);
        assert!(restored.is_paused(t0() + Duration::minutes(1)));
    }
}
