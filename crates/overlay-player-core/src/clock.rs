//! Driftable playback clocks with generation tagging.
//!
//! A [`Clock`] records the last observed presentation time together with the
//! wall-clock instant of that observation, and extrapolates between
//! observations. Every observation carries the serial of the decode queue
//! it came from; once that queue is flushed (a seek), the clock reads as
//! NaN until a unit of the new serial is observed.
//!
//! Fields are stored in atomics so readers never take a lock. A torn read
//! across fields can at worst produce a value that the serial check rejects
//! on the next read.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Clocks further apart than this (seconds) are not corrected, they are snapped.
pub const AV_NOSYNC_THRESHOLD: f64 = 10.0;

/// Source of wall-clock time in seconds.
///
/// The origin is arbitrary; only differences are meaningful.
pub trait TimeSource: Send + Sync {
    /// Returns the current time in seconds.
    fn now(&self) -> f64;
}

/// Monotonic time measured from the moment the source was created.
#[derive(Debug, Clone, Copy)]
pub struct MonotonicTime {
    origin: Instant,
}

impl MonotonicTime {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for MonotonicTime {
    fn default() -> Self {
        Self::new()
    }
}

impl TimeSource for MonotonicTime {
    fn now(&self) -> f64 {
        self.origin.elapsed().as_secs_f64()
    }
}

/// Manually advanced time for deterministic simulation.
///
/// Cloning yields a handle to the same underlying time.
#[derive(Debug, Clone, Default)]
pub struct ManualTime {
    bits: Arc<AtomicU64>,
}

impl ManualTime {
    /// Creates a manual time source starting at `start` seconds.
    pub fn new(start: f64) -> Self {
        Self {
            bits: Arc::new(AtomicU64::new(start.to_bits())),
        }
    }

    /// Sets the current time.
    pub fn set(&self, seconds: f64) {
        self.bits.store(seconds.to_bits(), Ordering::Release);
    }

    /// Advances the current time by `seconds`.
    pub fn advance(&self, seconds: f64) {
        let now = self.now();
        self.set(now + seconds);
    }
}

impl TimeSource for ManualTime {
    fn now(&self) -> f64 {
        f64::from_bits(self.bits.load(Ordering::Acquire))
    }
}

/// Generation counter of a decode queue, shared with the clocks bound to it.
///
/// Written only by the owning pipeline under its mutex; read lock-free.
#[derive(Debug, Clone)]
pub struct QueueSerial(Arc<AtomicU64>);

impl QueueSerial {
    pub fn new(initial: u64) -> Self {
        Self(Arc::new(AtomicU64::new(initial)))
    }

    /// Returns the current serial.
    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Acquire)
    }

    /// Increments the serial and returns the new value.
    pub(crate) fn bump(&self) -> u64 {
        self.0.fetch_add(1, Ordering::AcqRel) + 1
    }
}

/// An f64 stored in an `AtomicU64`.
#[derive(Debug)]
struct AtomicF64(AtomicU64);

impl AtomicF64 {
    fn new(value: f64) -> Self {
        Self(AtomicU64::new(value.to_bits()))
    }

    fn load(&self) -> f64 {
        f64::from_bits(self.0.load(Ordering::Acquire))
    }

    fn store(&self, value: f64) {
        self.0.store(value.to_bits(), Ordering::Release);
    }
}

/// A playback clock.
///
/// # Staleness
///
/// [`Clock::get`] returns NaN when the serial of the last observation no
/// longer matches the bound queue serial, or when no observation has been
/// made since [`Clock::init`]. NaN is an expected value, callers must check
/// for it.
pub struct Clock {
    /// Last observed presentation time in seconds (NaN = unset)
    pts: AtomicF64,
    /// `pts` minus the wall-clock time of the observation
    pts_drift: AtomicF64,
    /// Wall-clock time of the last observation
    last_updated: AtomicF64,
    /// Playback rate multiplier
    speed: AtomicF64,
    paused: AtomicBool,
    /// Serial of the unit the last observation came from
    serial: AtomicU64,
    /// Serial of the owning queue; `None` binds the clock to its own serial
    queue_serial: Option<QueueSerial>,
    time: Arc<dyn TimeSource>,
}

impl Clock {
    /// Creates a clock bound to a queue serial.
    pub fn new(queue_serial: QueueSerial, time: Arc<dyn TimeSource>) -> Self {
        Self::with_binding(Some(queue_serial), time)
    }

    /// Creates a clock bound to its own serial, so it never reads as stale.
    ///
    /// Used for the external clock.
    pub fn free_running(time: Arc<dyn TimeSource>) -> Self {
        Self::with_binding(None, time)
    }

    fn with_binding(queue_serial: Option<QueueSerial>, time: Arc<dyn TimeSource>) -> Self {
        let clock = Self {
            pts: AtomicF64::new(f64::NAN),
            pts_drift: AtomicF64::new(f64::NAN),
            last_updated: AtomicF64::new(0.0),
            speed: AtomicF64::new(1.0),
            paused: AtomicBool::new(false),
            serial: AtomicU64::new(0),
            queue_serial,
            time,
        };
        clock.init();
        clock
    }

    /// Resets the clock to the unset state with serial 0.
    pub fn init(&self) {
        self.speed.store(1.0);
        self.paused.store(false, Ordering::Release);
        self.set(f64::NAN, 0);
    }

    /// Returns the current time, or NaN if unset or stale.
    pub fn get(&self) -> f64 {
        if !self.is_current() {
            return f64::NAN;
        }
        if self.paused.load(Ordering::Acquire) {
            return self.pts.load();
        }
        let now = self.time.now();
        let last_updated = self.last_updated.load();
        let speed = self.speed.load();
        self.pts_drift.load() + now - (now - last_updated) * (1.0 - speed)
    }

    /// Records an observation made now.
    pub fn set(&self, pts: f64, serial: u64) {
        let now = self.time.now();
        self.set_at(pts, serial, now);
    }

    /// Records an observation made at wall-clock `time`.
    pub fn set_at(&self, pts: f64, serial: u64, time: f64) {
        self.pts.store(pts);
        self.last_updated.store(time);
        self.pts_drift.store(pts - time);
        self.serial.store(serial, Ordering::Release);
    }

    /// Changes the playback rate, re-anchoring at the current value first.
    pub fn set_speed(&self, speed: f64) {
        self.set(self.get(), self.serial());
        self.speed.store(speed);
    }

    /// Freezes or resumes the clock.
    ///
    /// Pausing freezes at the current extrapolated value. Resuming re-anchors
    /// at the frozen value so paused time is not counted.
    pub fn set_paused(&self, paused: bool) {
        if paused != self.is_paused() {
            let current = if paused { self.get() } else { self.pts.load() };
            if !current.is_nan() {
                self.set(current, self.serial());
            }
        }
        self.paused.store(paused, Ordering::Release);
    }

    /// Snaps this clock to `slave` if this clock is unset or the two differ by
    /// more than [`AV_NOSYNC_THRESHOLD`].
    pub fn sync_to_slave(&self, slave: &Clock) {
        let clock = self.get();
        let slave_clock = slave.get();
        if !slave_clock.is_nan()
            && (clock.is_nan() || (clock - slave_clock).abs() > AV_NOSYNC_THRESHOLD)
        {
            tracing::trace!(
                "sync_to_slave: snapping {:.3} -> {:.3} (serial {})",
                clock,
                slave_clock,
                slave.serial()
            );
            self.set(slave_clock, slave.serial());
        }
    }

    /// Returns true if the last observation belongs to the bound queue's current serial.
    pub fn is_current(&self) -> bool {
        match &self.queue_serial {
            Some(queue) => self.serial() == queue.get(),
            None => true,
        }
    }

    pub fn serial(&self) -> u64 {
        self.serial.load(Ordering::Acquire)
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    pub fn speed(&self) -> f64 {
        self.speed.load()
    }

    /// Wall-clock time of the last observation.
    pub fn last_updated(&self) -> f64 {
        self.last_updated.load()
    }

    /// Returns the time source this clock reads.
    pub fn time_source(&self) -> &Arc<dyn TimeSource> {
        &self.time
    }
}

impl std::fmt::Debug for Clock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Clock")
            .field("pts", &self.pts.load())
            .field("last_updated", &self.last_updated.load())
            .field("speed", &self.speed.load())
            .field("paused", &self.is_paused())
            .field("serial", &self.serial())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manual() -> (ManualTime, Arc<dyn TimeSource>) {
        let time = ManualTime::new(100.0);
        let source: Arc<dyn TimeSource> = Arc::new(time.clone());
        (time, source)
    }

    #[test]
    fn test_clock_unset_after_init() {
        let (_time, source) = manual();
        let serial = QueueSerial::new(1);
        let clock = Clock::new(serial, source);
        assert!(clock.get().is_nan());
        assert_eq!(clock.serial(), 0);
    }

    #[test]
    fn test_clock_advances_between_updates() {
        let (time, source) = manual();
        let serial = QueueSerial::new(1);
        let clock = Clock::new(serial, source);

        clock.set(5.0, 1);
        assert_eq!(clock.get(), 5.0);

        time.advance(0.25);
        assert!((clock.get() - 5.25).abs() < 1e-9);
    }

    #[test]
    fn test_clock_stale_after_serial_bump() {
        let (_time, source) = manual();
        let serial = QueueSerial::new(1);
        let clock = Clock::new(serial.clone(), source);

        clock.set(2.0, 1);
        assert!(!clock.get().is_nan());

        serial.bump();
        assert!(clock.get().is_nan());

        clock.set(7.0, 2);
        assert_eq!(clock.get(), 7.0);
    }

    #[test]
    fn test_clock_paused_is_frozen() {
        let (time, source) = manual();
        let clock = Clock::free_running(source);

        clock.set(1.0, 0);
        time.advance(0.5);
        clock.set_paused(true);
        let frozen = clock.get();
        assert!((frozen - 1.5).abs() < 1e-9);

        time.advance(3.0);
        assert_eq!(clock.get(), frozen);

        clock.set_paused(false);
        time.advance(0.5);
        assert!((clock.get() - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_clock_speed() {
        let (time, source) = manual();
        let clock = Clock::free_running(source);

        clock.set(10.0, 0);
        clock.set_speed(2.0);
        time.advance(1.0);
        assert!((clock.get() - 12.0).abs() < 1e-9);

        clock.set_speed(0.5);
        time.advance(1.0);
        assert!((clock.get() - 12.5).abs() < 1e-9);
    }

    #[test]
    fn test_sync_to_slave_snaps_when_unset() {
        let (_time, source) = manual();
        let serial = QueueSerial::new(3);
        let audio = Clock::new(serial, source.clone());
        let external = Clock::free_running(source);

        audio.set(42.0, 3);
        external.sync_to_slave(&audio);
        assert_eq!(external.get(), 42.0);
        assert_eq!(external.serial(), 3);
    }

    #[test]
    fn test_sync_to_slave_ignores_small_difference() {
        let (_time, source) = manual();
        let serial = QueueSerial::new(1);
        let audio = Clock::new(serial, source.clone());
        let external = Clock::free_running(source);

        external.set(40.0, 0);
        audio.set(45.0, 1);
        external.sync_to_slave(&audio);
        assert_eq!(external.get(), 40.0);

        audio.set(60.0, 1);
        external.sync_to_slave(&audio);
        assert_eq!(external.get(), 60.0);
    }

    #[test]
    fn test_sync_to_slave_ignores_stale_slave() {
        let (_time, source) = manual();
        let serial = QueueSerial::new(1);
        let video = Clock::new(serial.clone(), source.clone());
        let external = Clock::free_running(source);

        video.set(80.0, 1);
        serial.bump();
        external.sync_to_slave(&video);
        assert!(external.get().is_nan());
    }
}
