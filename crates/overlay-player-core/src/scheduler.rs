//! Display refresh scheduling and A/V drift correction.
//!
//! [`SyncScheduler`] runs on the playback thread, one step per timer firing.
//! Each step presents the current picture, advances `frame_timer` by the
//! corrected inter-picture delay, and schedules the next firing at
//! `frame_timer`. When video is not the master clock, the delay is shrunk
//! or grown by the drift between the video clock and the master.

use std::sync::Arc;
use std::time::Duration;

use crate::clock::TimeSource;
use crate::master_clock::MasterClock;
use crate::media::{Picture, TimeBase};
use crate::player::PlayerConfig;
use crate::sync_metrics::SyncMetrics;
use crate::timer::{Timer, TimerHandle};
use crate::video_pipeline::VideoPipeline;

/// Lower bound of the drift correction threshold (seconds).
pub const AV_SYNC_THRESHOLD_MIN: f64 = 0.04;

/// Upper bound of the drift correction threshold (seconds).
pub const AV_SYNC_THRESHOLD_MAX: f64 = 0.1;

/// Delays above this are stretched by the drift instead of doubled.
pub const AV_SYNC_FRAMEDUP_THRESHOLD: f64 = 0.1;

/// Shortest time between two scheduler steps.
const MIN_REFRESH_DELAY: f64 = 0.01;

/// Inter-picture gaps at or beyond this are treated as discontinuities.
const MAX_COHERENT_DELAY: f64 = 1.0;

/// How the delay was adjusted for drift.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Correction {
    None,
    CatchUp,
    SlowDown,
    Duplicate,
}

fn correct_delay(delay: f64, diff: f64, max_frame_duration: f64) -> (f64, Correction) {
    let threshold = delay.clamp(AV_SYNC_THRESHOLD_MIN, AV_SYNC_THRESHOLD_MAX);
    if diff.is_nan() || diff.abs() >= max_frame_duration {
        return (delay, Correction::None);
    }

    if diff <= -threshold {
        ((delay + diff).max(0.0), Correction::CatchUp)
    } else if diff >= threshold && delay > AV_SYNC_FRAMEDUP_THRESHOLD {
        (delay + diff, Correction::SlowDown)
    } else if diff >= threshold {
        (2.0 * delay, Correction::Duplicate)
    } else {
        (delay, Correction::None)
    }
}

/// Corrects the nominal inter-picture `delay` for the drift `diff` of the
/// video clock against the master clock (video minus master, seconds).
///
/// Video behind the master by more than the threshold shrinks the delay,
/// floored at zero. Video ahead grows it by `diff` when the delay is long,
/// or doubles it when short so the current picture stays up for one more
/// slot. A NaN drift or one beyond `max_frame_duration` is not corrected.
pub fn compute_target_delay(delay: f64, diff: f64, max_frame_duration: f64) -> f64 {
    correct_delay(delay, diff, max_frame_duration).0
}

/// Display duration of `current`, taken from the gap to `next`.
///
/// Falls back to the picture's own duration when the two belong to
/// different serials or the gap is not in `(0, max_frame_duration]`.
pub fn vp_duration(
    current: &Picture,
    next: &Picture,
    time_base: TimeBase,
    max_frame_duration: f64,
) -> f64 {
    if current.serial != next.serial {
        return current.duration;
    }
    let gap = time_base.to_seconds(next.pts - current.pts);
    if gap.is_nan() || gap <= 0.0 || gap > max_frame_duration {
        current.duration
    } else {
        gap
    }
}

/// Outcome of one scheduler step.
#[derive(Debug, Clone, PartialEq)]
pub enum Tick {
    /// The firing was cancelled, superseded, or playback is paused
    Ignored,
    /// No picture was ready; a short retry was scheduled
    Retry,
    /// The picture was presented and the next step scheduled
    Presented(Picture),
    /// End of stream reached; nothing was scheduled
    Finished,
}

/// Cooperative display scheduler.
pub struct SyncScheduler {
    timer: Arc<dyn Timer>,
    time: Arc<dyn TimeSource>,
    metrics: SyncMetrics,
    max_frame_duration: f64,
    drop_late_frames: bool,
    retry_interval: Duration,
    /// Wall-clock time the current picture is due (seconds)
    frame_timer: f64,
    frame_last_pts: f64,
    frame_last_delay: f64,
    /// Serial of the last picture handled; a change re-anchors `frame_timer`
    last_serial: Option<u64>,
    pending: Option<TimerHandle>,
    active: bool,
    paused_at: Option<f64>,
    finished: bool,
    last_presented: Option<f64>,
}

impl SyncScheduler {
    pub fn new(
        config: &PlayerConfig,
        timer: Arc<dyn Timer>,
        time: Arc<dyn TimeSource>,
        metrics: SyncMetrics,
    ) -> Self {
        Self {
            timer,
            time,
            metrics,
            max_frame_duration: config.max_frame_duration,
            drop_late_frames: config.drop_late_frames,
            retry_interval: config.retry_interval,
            frame_timer: 0.0,
            frame_last_pts: f64::NAN,
            frame_last_delay: 0.0,
            last_serial: None,
            pending: None,
            active: false,
            paused_at: None,
            finished: false,
            last_presented: None,
        }
    }

    /// Arms the first step. Does nothing while a step is pending.
    pub fn start(&mut self) {
        self.active = true;
        self.finished = false;
        if self.paused_at.is_none() && self.pending.is_none() {
            self.schedule(Duration::ZERO);
        }
    }

    /// Cancels the pending step and records the pause instant.
    pub fn pause(&mut self) {
        if self.paused_at.is_some() {
            return;
        }
        self.paused_at = Some(self.time.now());
        self.cancel_pending();
    }

    /// Shifts `frame_timer` by the paused interval and re-arms.
    pub fn resume(&mut self) {
        let Some(paused_at) = self.paused_at.take() else {
            return;
        };
        let now = self.time.now();
        self.frame_timer += now - paused_at;
        if self.active && !self.finished {
            let remaining = (self.frame_timer - now).max(0.0);
            self.schedule(self.duration_from_secs(remaining));
        }
    }

    /// Forgets the frame history after a seek and re-arms a finished scheduler.
    pub fn reset_for_seek(&mut self) {
        self.cancel_pending();
        self.last_serial = None;
        self.frame_last_pts = f64::NAN;
        self.finished = false;
        if self.active && self.paused_at.is_none() {
            self.schedule(Duration::ZERO);
        }
    }

    /// Cancels the pending step; the scheduler stays idle until `start()`.
    pub fn stop(&mut self) {
        self.cancel_pending();
        self.active = false;
    }

    /// Runs one step for the firing `handle`.
    pub fn on_timer(
        &mut self,
        handle: TimerHandle,
        video: &VideoPipeline,
        master: &MasterClock,
    ) -> Tick {
        if self.pending != Some(handle) {
            tracing::trace!("Scheduler: ignoring stale timer {:?}", handle);
            return Tick::Ignored;
        }
        self.pending = None;
        if !self.active || self.paused_at.is_some() {
            return Tick::Ignored;
        }

        let now = self.time.now();
        let time_base = video.time_base();
        let video_clock = video.clock();

        loop {
            let Some(current) = video.get_frame() else {
                if video.is_end_of_stream() {
                    self.finished = true;
                    tracing::debug!("Scheduler: end of stream, stopping refresh");
                    return Tick::Finished;
                }
                self.metrics.record_retry();
                self.schedule(self.retry_interval);
                return Tick::Retry;
            };
            let pts = time_base.to_seconds(current.pts);

            if self.last_serial != Some(current.serial) {
                tracing::debug!(
                    "Scheduler: first picture of serial {} at {:.3}s",
                    current.serial,
                    pts
                );
                self.last_serial = Some(current.serial);
                self.frame_timer = now;
                self.frame_last_pts = f64::NAN;
                if current.duration > 0.0 {
                    self.frame_last_delay = current.duration;
                }
            }

            if self.drop_late_frames && !master.is_video_master() {
                if let Some(next) = video.get_next_frame() {
                    let duration = vp_duration(&current, &next, time_base, self.max_frame_duration);
                    if now > self.frame_timer + duration {
                        tracing::debug!(
                            "Scheduler: dropping late picture at {:.3}s ({:.3}s behind)",
                            pts,
                            now - self.frame_timer
                        );
                        if video.next_frame(&current) {
                            self.frame_last_pts = pts;
                            self.frame_timer += duration;
                            self.metrics.record_dropped();
                        }
                        continue;
                    }
                }
            }

            let mut delay = pts - self.frame_last_pts;
            if !(delay > 0.0 && delay < MAX_COHERENT_DELAY) {
                delay = self.frame_last_delay;
            }
            self.frame_last_delay = delay;
            self.frame_last_pts = pts;

            let (target_delay, correction) = if master.is_video_master() {
                (delay, Correction::None)
            } else {
                let diff = video_clock.get() - master.get();
                correct_delay(delay, diff, self.max_frame_duration)
            };
            if correction != Correction::None {
                tracing::trace!(
                    "Scheduler: {:?} delay {:.3}s -> {:.3}s",
                    correction,
                    delay,
                    target_delay
                );
            }

            // A seek may have flushed `current` since it was read
            if !video.next_frame(&current) {
                self.metrics.record_retry();
                self.schedule(Duration::ZERO);
                return Tick::Retry;
            }
            if correction == Correction::Duplicate {
                self.metrics.record_duplicated();
            }

            self.frame_timer += target_delay;
            if now - self.frame_timer > AV_SYNC_THRESHOLD_MAX {
                self.frame_timer = now;
            }
            let real_delay = (self.frame_timer - now).max(MIN_REFRESH_DELAY);
            self.schedule(self.duration_from_secs(real_delay));

            video_clock.set_at(pts, current.serial, now);
            master.external().sync_to_slave(video_clock);
            self.metrics.record_drift(video_clock.get(), master.get());
            self.metrics.record_presented();
            self.last_presented = Some(pts);

            tracing::trace!("Scheduler: presented {:.3}s, next in {:.3}s", pts, real_delay);
            return Tick::Presented(current);
        }
    }

    /// Presentation time of the last presented picture, in seconds.
    pub fn position(&self) -> Option<f64> {
        self.last_presented
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn is_paused(&self) -> bool {
        self.paused_at.is_some()
    }

    pub fn pending(&self) -> Option<TimerHandle> {
        self.pending
    }

    fn schedule(&mut self, delay: Duration) {
        self.cancel_pending();
        self.pending = Some(self.timer.schedule_once(delay));
    }

    fn cancel_pending(&mut self) {
        if let Some(handle) = self.pending.take() {
            self.timer.cancel(handle);
        }
    }

    fn duration_from_secs(&self, seconds: f64) -> Duration {
        Duration::try_from_secs_f64(seconds).unwrap_or(self.retry_interval)
    }
}

impl Drop for SyncScheduler {
    fn drop(&mut self) {
        self.cancel_pending();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualTime};
    use crate::error::DecodeError;
    use crate::master_clock::SyncMode;
    use crate::media::{Container, Decoder, PictureBuffer, StreamInfo, StreamKind};
    use parking_lot::Mutex;
    use std::time::Instant;

    const MAX: f64 = 10.0;

    #[test]
    fn test_target_delay_within_threshold_unchanged() {
        assert_eq!(compute_target_delay(0.04, 0.0, MAX), 0.04);
        assert_eq!(compute_target_delay(0.04, 0.039, MAX), 0.04);
        assert_eq!(compute_target_delay(0.04, -0.039, MAX), 0.04);
        assert_eq!(compute_target_delay(0.04, f64::NAN, MAX), 0.04);
        // Threshold clamps to 0.1 for long delays
        assert_eq!(compute_target_delay(0.5, 0.09, MAX), 0.5);
    }

    #[test]
    fn test_target_delay_corrections() {
        // Video behind: catch up
        assert!((compute_target_delay(0.04, -0.03 - 0.02, MAX) - 0.0).abs() < 1e-12);
        assert!((compute_target_delay(0.2, -0.15, MAX) - 0.05).abs() < 1e-12);
        // Video ahead with a long delay: slow down by the drift
        assert!((compute_target_delay(0.2, 0.15, MAX) - 0.35).abs() < 1e-12);
        // Video ahead with a short delay: double
        assert_eq!(compute_target_delay(0.04, 0.05, MAX), 0.08);
        // Drift beyond the max frame duration is not corrected
        assert_eq!(compute_target_delay(0.04, 12.0, MAX), 0.04);
    }

    #[test]
    fn test_target_delay_never_negative() {
        let delays = [0.001, 0.01, 0.04, 0.1, 0.5, 0.99];
        for &delay in &delays {
            let mut diff = -MAX;
            while diff <= MAX {
                let target = compute_target_delay(delay, diff, MAX);
                assert!(target >= 0.0, "delay={delay} diff={diff} -> {target}");
                let threshold = delay.clamp(AV_SYNC_THRESHOLD_MIN, AV_SYNC_THRESHOLD_MAX);
                if diff.abs() < threshold {
                    assert_eq!(target, delay);
                }
                diff += 0.013;
            }
        }
    }

    #[test]
    fn test_vp_duration() {
        let tb = TimeBase::MILLISECONDS;
        let mut a = Picture::new(1000, 0.05);
        let mut b = Picture::new(1040, 0.05);
        a.serial = 1;
        b.serial = 1;
        assert!((vp_duration(&a, &b, tb, MAX) - 0.04).abs() < 1e-12);

        b.serial = 2;
        assert_eq!(vp_duration(&a, &b, tb, MAX), 0.05);

        b.serial = 1;
        b.pts = 900;
        assert_eq!(vp_duration(&a, &b, tb, MAX), 0.05);
        b.pts = 30_000;
        assert_eq!(vp_duration(&a, &b, tb, MAX), 0.05);
    }

    /// Timer that records requests; tests fire them by hand.
    #[derive(Default)]
    struct RecordingTimer {
        next: Mutex<u64>,
        scheduled: Mutex<Vec<(TimerHandle, Duration)>>,
    }

    impl Timer for RecordingTimer {
        fn schedule_once(&self, delay: Duration) -> TimerHandle {
            let mut next = self.next.lock();
            *next += 1;
            let handle = TimerHandle(*next);
            self.scheduled.lock().push((handle, delay));
            handle
        }

        fn cancel(&self, _handle: TimerHandle) {}
    }

    struct Ramp {
        next: i64,
        count: i64,
    }

    impl Decoder for Ramp {
        fn seek(&mut self, timestamp: i64) -> Result<(), DecodeError> {
            self.next = timestamp / 40;
            Ok(())
        }

        fn retrieve_video(
            &mut self,
            _target: Option<f64>,
            _buffer: &mut PictureBuffer,
        ) -> Result<Option<Picture>, DecodeError> {
            if self.next >= self.count {
                return Ok(None);
            }
            let picture = Picture::new(self.next * 40, 0.04);
            self.next += 1;
            Ok(Some(picture))
        }

        fn is_eof(&self) -> bool {
            self.next >= self.count
        }
    }

    struct RampContainer;

    impl Container for RampContainer {
        fn video_stream(&self) -> Option<StreamInfo> {
            Some(StreamInfo {
                index: 0,
                kind: StreamKind::Video,
                time_base: TimeBase::MILLISECONDS,
                duration: None,
            })
        }

        fn audio_stream(&self) -> Option<StreamInfo> {
            None
        }

        fn open_decoder(&self, _stream: &StreamInfo) -> Result<Box<dyn Decoder>, DecodeError> {
            Ok(Box::new(Ramp { next: 0, count: 10 }))
        }
    }

    struct Fixture {
        time: ManualTime,
        timer: Arc<RecordingTimer>,
        video: VideoPipeline,
        master: MasterClock,
        scheduler: SyncScheduler,
        metrics: SyncMetrics,
    }

    fn fixture() -> Fixture {
        let time = ManualTime::new(0.0);
        let source: Arc<dyn TimeSource> = Arc::new(time.clone());
        let timer = Arc::new(RecordingTimer::default());
        let Ok(Some(mut video)) = VideoPipeline::open(&RampContainer, 5, Arc::clone(&source))
        else {
            panic!("expected video");
        };
        video.run().unwrap();
        let external = Arc::new(Clock::free_running(Arc::clone(&source)));
        let master = MasterClock::new(
            SyncMode::AudioMaster,
            None,
            Some(Arc::clone(video.clock())),
            external,
        );
        let metrics = SyncMetrics::new();
        let scheduler = SyncScheduler::new(
            &PlayerConfig::default(),
            Arc::clone(&timer) as Arc<dyn Timer>,
            source,
            metrics.clone(),
        );
        Fixture {
            time,
            timer,
            video,
            master,
            scheduler,
            metrics,
        }
    }

    fn wait_full(video: &VideoPipeline) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            let status = video.status();
            if status.eof || status.queued == status.capacity {
                return;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        panic!("video pipeline did not fill");
    }

    fn last_scheduled(timer: &RecordingTimer) -> (TimerHandle, Duration) {
        let Some(last) = timer.scheduled.lock().last().copied() else {
            panic!("nothing scheduled");
        };
        last
    }

    #[test]
    fn test_presents_at_frame_cadence() {
        let mut f = fixture();
        wait_full(&f.video);
        f.scheduler.start();

        let (handle, delay) = last_scheduled(&f.timer);
        assert_eq!(delay, Duration::ZERO);
        let Tick::Presented(first) = f.scheduler.on_timer(handle, &f.video, &f.master) else {
            panic!("expected a presented picture");
        };
        assert_eq!(first.pts, 0);

        let (handle, delay) = last_scheduled(&f.timer);
        assert!((delay.as_secs_f64() - 0.04).abs() < 1e-9);
        // A superseded handle is ignored
        assert_eq!(
            f.scheduler.on_timer(TimerHandle(0), &f.video, &f.master),
            Tick::Ignored
        );

        f.time.advance(0.04);
        wait_full(&f.video);
        let Tick::Presented(second) = f.scheduler.on_timer(handle, &f.video, &f.master) else {
            panic!("expected a presented picture");
        };
        assert_eq!(second.pts, 40);
        assert_eq!(f.scheduler.position(), Some(0.04));
        assert_eq!(f.metrics.snapshot().frames_presented, 2);
    }

    #[test]
    fn test_late_pictures_are_dropped() {
        let mut f = fixture();
        wait_full(&f.video);
        f.scheduler.start();
        let (handle, _) = last_scheduled(&f.timer);
        f.scheduler.on_timer(handle, &f.video, &f.master);

        let (handle, _) = last_scheduled(&f.timer);
        f.time.set(0.2);
        let Tick::Presented(picture) = f.scheduler.on_timer(handle, &f.video, &f.master) else {
            panic!("expected a presented picture");
        };
        assert!(picture.pts >= 160);
        assert!(f.metrics.snapshot().frames_dropped >= 3);
    }

    #[test]
    fn test_pause_shifts_frame_timer() {
        let mut f = fixture();
        wait_full(&f.video);
        f.scheduler.start();
        let (handle, _) = last_scheduled(&f.timer);
        f.scheduler.on_timer(handle, &f.video, &f.master);
        let (pending, _) = last_scheduled(&f.timer);

        f.time.advance(0.01);
        f.scheduler.pause();
        assert!(f.scheduler.is_paused());
        assert_eq!(
            f.scheduler.on_timer(pending, &f.video, &f.master),
            Tick::Ignored
        );

        f.time.advance(5.0);
        f.scheduler.resume();
        let (_, delay) = last_scheduled(&f.timer);
        // 30ms of the 40ms slot were left when paused
        assert!((delay.as_secs_f64() - 0.03).abs() < 1e-9);
    }
}
