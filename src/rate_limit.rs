//! Daily request budget per upstream source
//!
//! The upstream quotas reset at midnight UTC, so the window is a calendar
//! day rather than a rolling 24 hours. `check` decides whether a request may
//! go out; `record_request` counts one that actually does. Callers sharing a
//! limiter across threads use `try_acquire`, which does both under one lock.

use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::NaiveDate;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

use crate::clock::{Clock, SystemClock};
use crate::config::SourceConfig;
use crate::error::CacheError;

/// Counter state for the current UTC day
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitState {
    /// Requests issued in the window
    pub count: u32,
    /// UTC calendar day the window covers
    pub window_start_date: NaiveDate,
    /// Whether the warning for this window has been emitted
    pub warned: bool,
    /// Warnings emitted in this window
    #[serde(default)]
    pub warnings: u32,
}

impl RateLimitState {
    fn fresh(today: NaiveDate) -> Self {
        Self {
            count: 0,
            window_start_date: today,
            warned: false,
            warnings: 0,
        }
    }
}

/// Budget usage snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitStats {
    pub source: String,
    pub count: u32,
    pub budget: u32,
    pub remaining: u32,
    pub warned: bool,
    pub warnings: u32,
    pub window_start_date: NaiveDate,
}

/// Tracks one source's daily request budget
#[derive(Debug)]
pub struct RateLimiter {
    source: String,
    budget: u32,
    warn_threshold: u32,
    clock: Arc<dyn Clock>,
    state: Mutex<RateLimitState>,
    state_path: Option<PathBuf>,
}

impl RateLimiter {
    /// Creates a memory-only limiter
    pub fn new(source: impl Into<String>, budget: u32, warn_threshold: u32) -> Self {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let today = clock.now().date_naive();
        Self {
            source: source.into(),
            budget,
            warn_threshold,
            clock,
            state: Mutex::new(RateLimitState::fresh(today)),
            state_path: None,
        }
    }

    /// Creates a limiter from a source's configuration
    pub fn from_config(source: impl Into<String>, config: &SourceConfig) -> Self {
        Self::new(source, config.daily_budget, config.warn_threshold)
    }

    /// Replaces the time source, starting a fresh window on its current day
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        let today = clock.now().date_naive();
        self.clock = clock;
        *self.state.lock() = RateLimitState::fresh(today);
        self
    }

    /// Loads saved state from `path` and remembers it for [`RateLimiter::save`]
    ///
    /// A missing or unreadable state file starts a fresh window.
    pub async fn restore(mut self, path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let read_path = path.clone();
        let loaded = tokio::task::spawn_blocking(move || load_state(&read_path))
            .await
            .map_err(CacheError::from)
            .and_then(|result| result);

        match loaded {
            Ok(Some(state)) => {
                debug!(source = %self.source, count = state.count, "Restored rate limit state");
                *self.state.lock() = state;
            }
            Ok(None) => {}
            Err(e) => {
                warn!(source = %self.source, path = %path.display(), error = %e, "Ignoring unreadable rate limit state");
            }
        }

        self.state_path = Some(path);
        self
    }

    /// Whether a request may be issued now
    ///
    /// Starts a new window when the UTC date has changed. Does not count
    /// the request; call [`RateLimiter::record_request`] when issuing it.
    pub fn check(&self) -> bool {
        let today = self.clock.now().date_naive();
        let mut state = self.state.lock();
        self.admit(&mut state, today)
    }

    /// Counts one issued request
    pub fn record_request(&self) {
        self.state.lock().count += 1;
    }

    /// Checks and counts a request in one step
    ///
    /// Returns `false` without counting when the budget is spent. Concurrent
    /// callers can never push the count past the budget.
    pub fn try_acquire(&self) -> bool {
        let today = self.clock.now().date_naive();
        let mut state = self.state.lock();
        if !self.admit(&mut state, today) {
            return false;
        }
        state.count += 1;
        true
    }

    /// Usage for the current window
    pub fn stats(&self) -> RateLimitStats {
        let today = self.clock.now().date_naive();
        let mut state = self.state.lock();
        self.roll_window(&mut state, today);

        RateLimitStats {
            source: self.source.clone(),
            count: state.count,
            budget: self.budget,
            remaining: self.budget.saturating_sub(state.count),
            warned: state.warned,
            warnings: state.warnings,
            window_start_date: state.window_start_date,
        }
    }

    /// Current raw state
    pub fn state(&self) -> RateLimitState {
        self.state.lock().clone()
    }

    /// Overwrites the raw state
    pub fn set_state(&self, state: RateLimitState) {
        *self.state.lock() = state;
    }

    /// Writes the state to the restore path, if one was set
    pub async fn save(&self) -> Result<(), CacheError> {
        let Some(path) = self.state_path.clone() else {
            return Ok(());
        };
        let state = self.state();
        tokio::task::spawn_blocking(move || save_state(&path, &state)).await??;
        Ok(())
    }

    fn admit(&self, state: &mut RateLimitState, today: NaiveDate) -> bool {
        self.roll_window(state, today);

        if state.count >= self.budget {
            debug!(source = %self.source, count = state.count, budget = self.budget, "Daily request budget exhausted");
            return false;
        }

        if state.count >= self.warn_threshold && !state.warned {
            state.warned = true;
            state.warnings += 1;
            warn!(
                source = %self.source,
                count = state.count,
                budget = self.budget,
                "Approaching daily request budget"
            );
        }

        true
    }

    fn roll_window(&self, state: &mut RateLimitState, today: NaiveDate) {
        if state.window_start_date != today {
            info!(
                source = %self.source,
                previous_count = state.count,
                date = %today,
                "Starting new daily request window"
            );
            *state = RateLimitState::fresh(today);
        }
    }
}

fn load_state(path: &Path) -> Result<Option<RateLimitState>, CacheError> {
    match fs::read(path) {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn save_state(path: &Path, state: &RateLimitState) -> Result<(), CacheError> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(dir)?;
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(&serde_json::to_vec_pretty(state)?)?;
    tmp.persist(path).map_err(|e| CacheError::Io(e.error))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use chrono::{Duration, TimeZone, Utc};
    use std::sync::Barrier;
    use tempfile::TempDir;

    fn test_clock() -> Arc<ManualClock> {
        Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 7, 15, 18, 30, 0).unwrap(),
        ))
    }

    fn limiter(budget: u32, warn_threshold: u32) -> (RateLimiter, Arc<ManualClock>) {
        let clock = test_clock();
        let limiter = RateLimiter::new("weather", budget, warn_threshold).with_clock(clock.clone());
        (limiter, clock)
    }

    #[test]
    fn test_check_does_not_count() {
        let (limiter, _clock) = limiter(10, 8);

        assert!(limiter.check());
        assert!(limiter.check());

        assert_eq!(limiter.stats().count, 0);
    }

    #[test]
    fn test_blocks_at_budget() {
        let (limiter, _clock) = limiter(3, 2);
        for _ in 0..3 {
            assert!(limiter.check());
            limiter.record_request();
        }

        assert!(!limiter.check());
        let stats = limiter.stats();
        assert_eq!(stats.count, 3);
        assert_eq!(stats.remaining, 0);
    }

    #[test]
    fn test_day_change_resets_window() {
        let (limiter, clock) = limiter(3000, 2500);
        let today = clock.now().date_naive();
        limiter.set_state(RateLimitState {
            count: 2500,
            window_start_date: today - Duration::days(1),
            warned: true,
            warnings: 1,
        });

        assert!(limiter.check());

        let state = limiter.state();
        assert_eq!(state.count, 0);
        assert!(!state.warned);
        assert_eq!(state.window_start_date, today);
    }

    #[test]
    fn test_midnight_utc_unblocks() {
        let (limiter, clock) = limiter(1, 1);
        limiter.record_request();
        assert!(!limiter.check());

        // 18:30 -> 00:00 next day
        clock.advance(Duration::hours(5) + Duration::minutes(30));

        assert!(limiter.check());
        assert_eq!(limiter.stats().remaining, 1);
    }

    #[test]
    fn test_warning_fires_once() {
        let (limiter, _clock) = limiter(10, 5);
        limiter.set_state(RateLimitState {
            count: 4,
            window_start_date: test_clock().now().date_naive(),
            warned: false,
            warnings: 0,
        });

        assert!(limiter.check());
        assert_eq!(limiter.stats().warnings, 0);

        limiter.record_request();
        assert!(limiter.check());
        assert_eq!(limiter.stats().warnings, 1);
        assert!(limiter.stats().warned);

        for _ in 0..4 {
            limiter.record_request();
            assert!(limiter.check());
        }
        assert_eq!(limiter.stats().warnings, 1);
        assert_eq!(limiter.stats().count, 9);
    }

    #[test]
    fn test_try_acquire_counts_and_blocks() {
        let (limiter, _clock) = limiter(2, 1);

        assert!(limiter.try_acquire());
        assert_eq!(limiter.stats().warnings, 1);
        assert!(limiter.try_acquire());
        assert!(!limiter.try_acquire());

        let stats = limiter.stats();
        assert_eq!(stats.count, 2);
        assert_eq!(stats.warnings, 1);
    }

    #[test]
    fn test_parallel_acquire_never_exceeds_budget() {
        let (limiter, _clock) = limiter(1, 1);
        let start = Barrier::new(8);

        let admitted = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..8)
                .map(|_| {
                    scope.spawn(|| {
                        start.wait();
                        limiter.try_acquire()
                    })
                })
                .collect();
            handles
                .into_iter()
                .map(|handle| handle.join().unwrap())
                .filter(|ok| *ok)
                .count()
        });

        assert_eq!(admitted, 1);
        assert_eq!(limiter.stats().count, 1);
    }

    #[test]
    fn test_stats_remaining_never_negative() {
        let (limiter, _clock) = limiter(2, 1);
        for _ in 0..5 {
            limiter.record_request();
        }

        let stats = limiter.stats();
        assert_eq!(stats.remaining, 0);
        assert_eq!(stats.budget, 2);
        assert_eq!(stats.source, "weather");
    }

    #[tokio::test]
    async fn test_save_and_restore_state() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("limits").join("weather.json");
        let clock = test_clock();

        let limiter = RateLimiter::new("weather", 100, 80)
            .with_clock(clock.clone())
            .restore(&path)
            .await;
        for _ in 0..7 {
            limiter.record_request();
        }
        limiter.save().await.expect("save should succeed");

        let restored = RateLimiter::new("weather", 100, 80)
            .with_clock(clock)
            .restore(&path)
            .await;

        assert_eq!(restored.stats().count, 7);
    }

    #[tokio::test]
    async fn test_restore_ignores_corrupt_state() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("notam.json");
        fs::write(&path, "garbage").unwrap();

        let limiter = RateLimiter::new("notam", 10, 8)
            .with_clock(test_clock())
            .restore(&path)
            .await;

        assert_eq!(limiter.stats().count, 0);
    }

    #[tokio::test]
    async fn test_save_without_path_is_noop() {
        let (limiter, _clock) = limiter(10, 8);
        assert!(limiter.save().await.is_ok());
    }
}
