use std::sync::atomic::{AtomicU64, Ordering};

/// Counters shared by every operator that tunes through one [`crate::Tuner`].
pub struct TuningMetrics {
    hits: AtomicU64,
    misses: AtomicU64,
    untuned: AtomicU64,
    trial_runs: AtomicU64,
    last_session_micros: AtomicU64,
}

/// Point-in-time copy of [`TuningMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct TuningCounters {
    pub hits: u64,
    pub misses: u64,
    pub untuned: u64,
    pub trial_runs: u64,
}

impl Default for TuningMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl TuningMetrics {
    pub fn new() -> Self {
        Self {
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            untuned: AtomicU64::new(0),
            trial_runs: AtomicU64::new(0),
            last_session_micros: AtomicU64::new(0),
        }
    }

    pub fn inc_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    /// A key seen for the first time; a benchmark session follows.
    pub fn inc_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_untuned(&self) {
        self.untuned.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_trial_runs(&self, runs: u64) {
        self.trial_runs.fetch_add(runs, Ordering::Relaxed);
    }

    pub fn counters(&self) -> TuningCounters {
        TuningCounters {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            untuned: self.untuned.load(Ordering::Relaxed),
            trial_runs: self.trial_runs.load(Ordering::Relaxed),
        }
    }

    pub fn reset(&self) {
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
        self.untuned.store(0, Ordering::Relaxed);
        self.trial_runs.store(0, Ordering::Relaxed);
        self.last_session_micros.store(0, Ordering::Relaxed);
    }

    pub fn set_last_session_micros(&self, micros: u64) {
        self.last_session_micros.store(micros, Ordering::Relaxed);
    }

    pub fn last_session_micros(&self) -> u64 {
        self.last_session_micros.load(Ordering::Relaxed)
    }
}
