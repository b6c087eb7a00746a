//! A/V synchronization metrics and drift tracking.
//!
//! The scheduler records, for every presented picture, the drift between the
//! video clock and the master clock, together with counts of presented,
//! dropped and duplicated pictures. The audio pipeline records its device
//! callbacks. All updates are lock-free so any thread may record.
//!
//! # Usage
//!
//! ```ignore
//! let metrics = SyncMetrics::new();
//! metrics.record_drift(video_clock, master_clock);
//! println!("{}", metrics.snapshot());
//! ```

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

/// Threshold for acceptable A/V drift.
pub const SYNC_DRIFT_THRESHOLD_MS: i64 = 100;

/// Threshold for warning-level drift.
pub const SYNC_DRIFT_WARNING_MS: i64 = 150;

/// Threshold for severe drift.
pub const SYNC_DRIFT_SEVERE_MS: i64 = 200;

/// Samples skipped for max-drift tracking after a seek.
const SEEK_GRACE_SAMPLES: u64 = 5;

/// A/V synchronization metrics tracker.
///
/// Cloning yields a handle to the same counters.
#[derive(Clone)]
pub struct SyncMetrics {
    inner: Arc<SyncMetricsInner>,
}

struct SyncMetricsInner {
    enabled: AtomicBool,

    /// Current drift in microseconds (video - master, positive = video ahead)
    current_drift_us: AtomicI64,
    max_drift_ahead_us: AtomicI64,
    max_drift_behind_us: AtomicI64,
    /// Sum of absolute drift values for average calculation
    total_drift_us: AtomicU64,
    sample_count: AtomicU64,
    out_of_sync_count: AtomicU64,

    frames_presented: AtomicU64,
    frames_dropped: AtomicU64,
    /// Pictures held for an extra delay by the duplication branch
    frames_duplicated: AtomicU64,
    /// Scheduler ticks that found no picture ready
    retries: AtomicU64,

    audio_callbacks: AtomicU64,
    audio_bytes_written: AtomicU64,
    /// Audio callbacks that found nothing to write
    audio_underruns: AtomicU64,
    audio_clock_updates: AtomicU64,

    seeks: AtomicU64,
    grace_samples: AtomicU64,
}

impl SyncMetrics {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(SyncMetricsInner {
                enabled: AtomicBool::new(true),
                current_drift_us: AtomicI64::new(0),
                max_drift_ahead_us: AtomicI64::new(0),
                max_drift_behind_us: AtomicI64::new(0),
                total_drift_us: AtomicU64::new(0),
                sample_count: AtomicU64::new(0),
                out_of_sync_count: AtomicU64::new(0),
                frames_presented: AtomicU64::new(0),
                frames_dropped: AtomicU64::new(0),
                frames_duplicated: AtomicU64::new(0),
                retries: AtomicU64::new(0),
                audio_callbacks: AtomicU64::new(0),
                audio_bytes_written: AtomicU64::new(0),
                audio_underruns: AtomicU64::new(0),
                audio_clock_updates: AtomicU64::new(0),
                seeks: AtomicU64::new(0),
                grace_samples: AtomicU64::new(0),
            }),
        }
    }

    /// Enables or disables drift collection. Counters are always kept.
    pub fn set_enabled(&self, enabled: bool) {
        self.inner.enabled.store(enabled, Ordering::Relaxed);
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.enabled.load(Ordering::Relaxed)
    }

    /// Records the drift of the video clock against the master clock.
    ///
    /// Both values are in seconds. NaN values (stale or unset clocks) are
    /// ignored. Returns the signed drift in milliseconds if recorded.
    pub fn record_drift(&self, video_clock: f64, master_clock: f64) -> Option<i64> {
        if !self.is_enabled() || video_clock.is_nan() || master_clock.is_nan() {
            return None;
        }

        let drift_us = ((video_clock - master_clock) * 1_000_000.0).round() as i64;

        // Skip extreme tracking during post-seek warmup to avoid transient spikes
        let in_grace = self
            .inner
            .grace_samples
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| v.checked_sub(1))
            .is_ok();

        self.inner.current_drift_us.store(drift_us, Ordering::Relaxed);
        if !in_grace {
            if drift_us > 0 {
                self.inner
                    .max_drift_ahead_us
                    .fetch_max(drift_us, Ordering::Relaxed);
            } else {
                self.inner
                    .max_drift_behind_us
                    .fetch_min(drift_us, Ordering::Relaxed);
            }
        }

        self.inner
            .total_drift_us
            .fetch_add(drift_us.unsigned_abs(), Ordering::Relaxed);
        self.inner.sample_count.fetch_add(1, Ordering::Relaxed);

        let drift_ms = drift_us / 1000;
        if drift_ms.abs() > SYNC_DRIFT_THRESHOLD_MS {
            self.inner.out_of_sync_count.fetch_add(1, Ordering::Relaxed);
            if drift_ms.abs() > SYNC_DRIFT_WARNING_MS && !in_grace {
                let direction = if drift_us > 0 { "ahead of" } else { "behind" };
                tracing::warn!(
                    "A/V sync: video {}ms {} master (video={:.3}s, master={:.3}s)",
                    drift_ms.abs(),
                    direction,
                    video_clock,
                    master_clock
                );
            }
        }

        Some(drift_ms)
    }

    pub fn record_presented(&self) {
        self.inner.frames_presented.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dropped(&self) {
        self.inner.frames_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_duplicated(&self) {
        self.inner.frames_duplicated.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_retry(&self) {
        self.inner.retries.fetch_add(1, Ordering::Relaxed);
    }

    /// Records one audio device callback and the bytes it received.
    pub fn record_audio_callback(&self, bytes_written: usize) {
        self.inner.audio_callbacks.fetch_add(1, Ordering::Relaxed);
        self.inner
            .audio_bytes_written
            .fetch_add(bytes_written as u64, Ordering::Relaxed);
        if bytes_written == 0 {
            self.inner.audio_underruns.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_audio_clock_update(&self) {
        self.inner.audio_clock_updates.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a seek and arms the post-seek grace period.
    pub fn record_seek(&self) {
        self.inner.seeks.fetch_add(1, Ordering::Relaxed);
        self.inner
            .grace_samples
            .store(SEEK_GRACE_SAMPLES, Ordering::Relaxed);
    }

    /// Returns true if the last recorded drift is within threshold.
    pub fn is_in_sync(&self) -> bool {
        let drift_us = self.inner.current_drift_us.load(Ordering::Relaxed);
        drift_us.abs() <= SYNC_DRIFT_THRESHOLD_MS * 1000
    }

    /// Resets all metrics.
    pub fn reset(&self) {
        let inner = &self.inner;
        for counter in [
            &inner.total_drift_us,
            &inner.sample_count,
            &inner.out_of_sync_count,
            &inner.frames_presented,
            &inner.frames_dropped,
            &inner.frames_duplicated,
            &inner.retries,
            &inner.audio_callbacks,
            &inner.audio_bytes_written,
            &inner.audio_underruns,
            &inner.audio_clock_updates,
            &inner.seeks,
            &inner.grace_samples,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
        inner.current_drift_us.store(0, Ordering::Relaxed);
        inner.max_drift_ahead_us.store(0, Ordering::Relaxed);
        inner.max_drift_behind_us.store(0, Ordering::Relaxed);
    }

    /// Returns a snapshot of current metrics.
    pub fn snapshot(&self) -> SyncMetricsSnapshot {
        let inner = &self.inner;
        let sample_count = inner.sample_count.load(Ordering::Relaxed);
        let total_drift = inner.total_drift_us.load(Ordering::Relaxed);
        let avg_drift_us = if sample_count > 0 {
            (total_drift / sample_count) as i64
        } else {
            0
        };

        SyncMetricsSnapshot {
            current_drift_us: inner.current_drift_us.load(Ordering::Relaxed),
            max_drift_ahead_us: inner.max_drift_ahead_us.load(Ordering::Relaxed),
            max_drift_behind_us: inner.max_drift_behind_us.load(Ordering::Relaxed),
            avg_drift_us,
            sample_count,
            out_of_sync_count: inner.out_of_sync_count.load(Ordering::Relaxed),
            frames_presented: inner.frames_presented.load(Ordering::Relaxed),
            frames_dropped: inner.frames_dropped.load(Ordering::Relaxed),
            frames_duplicated: inner.frames_duplicated.load(Ordering::Relaxed),
            retries: inner.retries.load(Ordering::Relaxed),
            audio_callbacks: inner.audio_callbacks.load(Ordering::Relaxed),
            audio_bytes_written: inner.audio_bytes_written.load(Ordering::Relaxed),
            audio_underruns: inner.audio_underruns.load(Ordering::Relaxed),
            audio_clock_updates: inner.audio_clock_updates.load(Ordering::Relaxed),
            seeks: inner.seeks.load(Ordering::Relaxed),
        }
    }

    /// Logs current sync status at debug level.
    pub fn log_status(&self) {
        tracing::debug!("{}", self.snapshot());
    }
}

impl Default for SyncMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of sync metrics at a point in time.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncMetricsSnapshot {
    pub current_drift_us: i64,
    pub max_drift_ahead_us: i64,
    pub max_drift_behind_us: i64,
    pub avg_drift_us: i64,
    pub sample_count: u64,
    pub out_of_sync_count: u64,
    pub frames_presented: u64,
    pub frames_dropped: u64,
    pub frames_duplicated: u64,
    pub retries: u64,
    pub audio_callbacks: u64,
    pub audio_bytes_written: u64,
    pub audio_underruns: u64,
    pub audio_clock_updates: u64,
    pub seeks: u64,
}

impl SyncMetricsSnapshot {
    /// Minimum samples required for a valid sync test.
    const MIN_SYNC_SAMPLES: u64 = 10;

    pub fn current_drift_ms(&self) -> i64 {
        self.current_drift_us / 1000
    }

    /// Maximum absolute drift in milliseconds.
    pub fn max_drift_ms(&self) -> i64 {
        self.max_drift_ahead_us
            .abs()
            .max(self.max_drift_behind_us.abs())
            / 1000
    }

    pub fn out_of_sync_percentage(&self) -> f64 {
        if self.sample_count == 0 {
            0.0
        } else {
            (self.out_of_sync_count as f64 / self.sample_count as f64) * 100.0
        }
    }

    /// Pictures that left the queue, presented or dropped.
    pub fn frames_advanced(&self) -> u64 {
        self.frames_presented + self.frames_dropped
    }

    /// True if enough samples were recorded, max drift stayed below the
    /// severe threshold and fewer than 5% of samples were out of sync.
    pub fn passed_sync_test(&self) -> bool {
        self.sample_count >= Self::MIN_SYNC_SAMPLES
            && self.max_drift_ms() < SYNC_DRIFT_SEVERE_MS
            && self.out_of_sync_percentage() < 5.0
    }

    pub fn quality_summary(&self) -> String {
        let max_drift = self.max_drift_ms();
        let quality = if max_drift < SYNC_DRIFT_THRESHOLD_MS {
            "Excellent"
        } else if max_drift < SYNC_DRIFT_WARNING_MS {
            "Good"
        } else if max_drift < SYNC_DRIFT_SEVERE_MS {
            "Fair"
        } else {
            "Poor"
        };
        format!(
            "{quality} (max drift: {max_drift:+}ms, avg: {:+}ms, {:.1}% out of sync, {} dropped)",
            self.avg_drift_us / 1000,
            self.out_of_sync_percentage(),
            self.frames_dropped
        )
    }
}

impl std::fmt::Display for SyncMetricsSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "A/V Sync: drift={:+}ms (max ahead={:+}ms, behind={:+}ms), {} samples, {:.1}% out of sync, presented={} dropped={} duplicated={} retries={}",
            self.current_drift_ms(),
            self.max_drift_ahead_us / 1000,
            self.max_drift_behind_us / 1000,
            self.sample_count,
            self.out_of_sync_percentage(),
            self.frames_presented,
            self.frames_dropped,
            self.frames_duplicated,
            self.retries
        )
    }
}
