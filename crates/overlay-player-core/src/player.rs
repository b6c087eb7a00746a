//! Headless player core: stream binding, lifecycle and seek coordination.
//!
//! [`CorePlayer`] owns the audio and video pipelines of one open container,
//! the three clocks, and the display scheduler. It does not render: the
//! surrounding application drives it with timer firings and reads pictures
//! back through [`CorePlayer::get_frame`] and friends.
//!
//! # State Machine
//!
//! ```text
//! new()                        → Idle
//! open(container) succeeds     → Opened
//! play()   [Opened/Paused]     → Playing
//! toggle_pause() [Playing]     → Paused
//! toggle_pause() [Paused]      → Playing
//! seek()   [Opened/Playing/Paused] → stays in current state
//! stop()                       → Stopped (terminal)
//! ```

use std::sync::Arc;
use std::time::Duration;

use parking_lot::MutexGuard;

use crate::audio_pipeline::AudioPipeline;
use crate::clock::{Clock, TimeSource};
use crate::error::{DecodeError, PlayerError};
use crate::master_clock::{MasterClock, SyncMode};
use crate::media::{AudioOutput, Container, Picture, PictureBuffer};
use crate::pipeline::PipelineStatus;
use crate::scheduler::{SyncScheduler, Tick};
use crate::sync_metrics::{SyncMetrics, SyncMetricsSnapshot};
use crate::timer::{Timer, TimerHandle};
use crate::video_pipeline::VideoPipeline;

/// Player configuration, fixed at `open()`.
#[derive(Debug, Clone, PartialEq)]
pub struct PlayerConfig {
    /// Which clock drives timing when the stream has it
    pub sync_mode: SyncMode,
    /// Sample buffers decoded ahead (default: 20)
    pub audio_queue_depth: usize,
    /// Backing picture buffers; also the video queue capacity (default: 5)
    pub video_picture_slots: usize,
    /// Longest plausible gap between pictures, in seconds (default: 10.0)
    pub max_frame_duration: f64,
    /// Skip pictures whose display slot already passed (default: true)
    pub drop_late_frames: bool,
    /// Scheduler retry interval when no picture is ready (default: 10ms)
    pub retry_interval: Duration,
}

impl Default for PlayerConfig {
    fn default() -> Self {
        Self {
            sync_mode: SyncMode::AudioMaster,
            audio_queue_depth: 20,
            video_picture_slots: 5,
            max_frame_duration: 10.0,
            drop_late_frames: true,
            retry_interval: Duration::from_millis(10),
        }
    }
}

/// Playback state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayerState {
    Idle,
    Opened,
    Playing,
    Paused,
    Stopped,
}

/// Capabilities found at `open()`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StreamCaps {
    pub has_audio: bool,
    pub has_video: bool,
    /// Container duration in seconds, if known
    pub duration: Option<f64>,
}

/// Headless A/V player core.
pub struct CorePlayer {
    config: PlayerConfig,
    state: PlayerState,
    time: Arc<dyn TimeSource>,
    /// Output device waiting for an audio stream at `open()`
    audio_output: Option<Box<dyn AudioOutput>>,
    container: Option<Arc<dyn Container>>,
    audio: Option<AudioPipeline>,
    video: Option<VideoPipeline>,
    external: Arc<Clock>,
    master: Option<MasterClock>,
    scheduler: SyncScheduler,
    metrics: SyncMetrics,
}

impl CorePlayer {
    /// Creates an idle player that reads time from `time` and schedules
    /// display refreshes on `timer`.
    pub fn new(config: PlayerConfig, time: Arc<dyn TimeSource>, timer: Arc<dyn Timer>) -> Self {
        let metrics = SyncMetrics::new();
        let scheduler = SyncScheduler::new(&config, timer, Arc::clone(&time), metrics.clone());
        let external = Arc::new(Clock::free_running(Arc::clone(&time)));
        Self {
            config,
            state: PlayerState::Idle,
            time,
            audio_output: None,
            container: None,
            audio: None,
            video: None,
            external,
            master: None,
            scheduler,
            metrics,
        }
    }

    /// Sets the audio output device used if the container has audio.
    pub fn with_audio_output(mut self, output: Box<dyn AudioOutput>) -> Self {
        self.audio_output = Some(output);
        self
    }

    /// Binds the audio and video streams of `container`.
    ///
    /// A stream whose decoder fails to open is skipped. Fails only if
    /// neither stream is usable.
    pub fn open(&mut self, container: Arc<dyn Container>) -> Result<StreamCaps, PlayerError> {
        if self.state != PlayerState::Idle {
            return Err(PlayerError::AlreadyOpen);
        }

        let mut open_error: Option<DecodeError> = None;

        let video = match VideoPipeline::open(
            container.as_ref(),
            self.config.video_picture_slots,
            Arc::clone(&self.time),
        ) {
            Ok(video) => video,
            Err(e) => {
                tracing::warn!("Video stream unusable: {}", e);
                open_error = Some(e);
                None
            }
        };

        let audio = match self.audio_output.take() {
            Some(output) => match AudioPipeline::open(
                container.as_ref(),
                output,
                Arc::clone(&self.external),
                self.config.audio_queue_depth,
                Arc::clone(&self.time),
                self.metrics.clone(),
            ) {
                Ok(audio) => audio,
                Err(e) => {
                    tracing::warn!("Audio stream unusable: {}", e);
                    open_error = Some(e);
                    None
                }
            },
            None => {
                if container.audio_stream().is_some() {
                    tracing::info!("No audio output device, audio disabled");
                }
                None
            }
        };

        if audio.is_none() && video.is_none() {
            return Err(match open_error {
                Some(e) => PlayerError::Decoder(e),
                None => PlayerError::NoStreams,
            });
        }

        let master = MasterClock::new(
            self.config.sync_mode,
            audio.as_ref().map(|a| Arc::clone(a.clock())),
            video.as_ref().map(|v| Arc::clone(v.clock())),
            Arc::clone(&self.external),
        );

        let caps = StreamCaps {
            has_audio: audio.is_some(),
            has_video: video.is_some(),
            duration: container.duration(),
        };
        tracing::info!(
            "Opened container: audio={} video={} duration={:?} master={:?}",
            caps.has_audio,
            caps.has_video,
            caps.duration,
            master.kind()
        );

        self.audio = audio;
        self.video = video;
        self.master = Some(master);
        self.container = Some(container);
        self.state = PlayerState::Opened;
        Ok(caps)
    }

    /// Starts or resumes playback.
    ///
    /// Returns false if the player is not open, was stopped, or a worker
    /// thread could not be started.
    pub fn play(&mut self) -> bool {
        match self.try_play() {
            Ok(()) => true,
            Err(PlayerError::NotOpen) => {
                tracing::debug!("Play ignored in state {:?}", self.state);
                false
            }
            Err(e) => {
                tracing::error!("{}", e);
                false
            }
        }
    }

    /// Like [`play`](Self::play), reporting why playback did not start.
    ///
    /// A worker that fails to start stops the player.
    pub fn try_play(&mut self) -> Result<(), PlayerError> {
        match self.state {
            PlayerState::Playing => Ok(()),
            PlayerState::Paused => {
                self.toggle_pause();
                Ok(())
            }
            PlayerState::Idle | PlayerState::Stopped => Err(PlayerError::NotOpen),
            PlayerState::Opened => {
                if let Err(e) = self.start_pipelines() {
                    self.stop();
                    return Err(e);
                }
                if self.video.is_some() {
                    self.scheduler.start();
                }
                self.state = PlayerState::Playing;
                tracing::info!("Playback started");
                Ok(())
            }
        }
    }

    fn start_pipelines(&mut self) -> Result<(), PlayerError> {
        if let Some(video) = self.video.as_mut() {
            video
                .run()
                .map_err(|e| PlayerError::ThreadSpawn(format!("video: {e}")))?;
        }
        if let Some(audio) = self.audio.as_mut() {
            audio
                .run()
                .map_err(|e| PlayerError::ThreadSpawn(format!("audio: {e}")))?;
        }
        Ok(())
    }

    /// Stops both pipelines and joins their workers. Terminal.
    pub fn stop(&mut self) {
        if matches!(self.state, PlayerState::Idle | PlayerState::Stopped) {
            return;
        }
        self.scheduler.stop();
        if let Some(audio) = self.audio.as_mut() {
            audio.stop();
        }
        if let Some(video) = self.video.as_mut() {
            video.stop();
        }
        self.state = PlayerState::Stopped;
        tracing::info!("Playback stopped");
    }

    /// Repositions both streams to `position_ms`.
    ///
    /// Each worker flushes its queue on its next iteration, which
    /// invalidates clocks bound to the old serial. Requests issued before a
    /// worker gets to them coalesce into the last position.
    pub fn seek(&mut self, position_ms: i64) {
        if !matches!(
            self.state,
            PlayerState::Opened | PlayerState::Playing | PlayerState::Paused
        ) {
            return;
        }
        let seconds = position_ms as f64 / 1000.0;
        tracing::debug!("Seek to {:.3}s from {:?}", seconds, self.state);

        self.metrics.record_seek();
        if let Some(video) = &self.video {
            video.seek(seconds);
        }
        if let Some(audio) = &self.audio {
            audio.seek(seconds);
        }
        self.external.set(seconds, self.external.serial());
        self.scheduler.reset_for_seek();
    }

    /// Flips between playing and paused.
    pub fn toggle_pause(&mut self) {
        let pausing = match self.state {
            PlayerState::Playing => true,
            PlayerState::Paused => false,
            _ => return,
        };

        if pausing {
            self.scheduler.pause();
        }
        if let Some(video) = &self.video {
            video.clock().set_paused(pausing);
        }
        self.external.set_paused(pausing);
        if let Some(audio) = self.audio.as_mut() {
            audio.toggle_pause();
        }
        if !pausing {
            self.scheduler.resume();
        }

        self.state = if pausing {
            PlayerState::Paused
        } else {
            PlayerState::Playing
        };
        tracing::debug!("Playback {:?}", self.state);
    }

    /// Runs the scheduler step for a timer firing.
    pub fn on_timer(&mut self, handle: TimerHandle) -> Tick {
        match (&self.video, &self.master) {
            (Some(video), Some(master)) => self.scheduler.on_timer(handle, video, master),
            _ => Tick::Ignored,
        }
    }

    /// The next picture to present.
    pub fn get_frame(&self) -> Option<Picture> {
        self.video.as_ref().and_then(|v| v.get_frame())
    }

    /// The picture after [`get_frame`](Self::get_frame).
    pub fn get_next_frame(&self) -> Option<Picture> {
        self.video.as_ref().and_then(|v| v.get_next_frame())
    }

    /// The picture currently on screen.
    pub fn get_last_frame(&self) -> Option<Picture> {
        self.video.as_ref().and_then(|v| v.get_last_frame())
    }

    /// Locks the pixels of `picture` for upload.
    pub fn lock_picture(&self, picture: &Picture) -> Option<MutexGuard<'_, PictureBuffer>> {
        self.video.as_ref().and_then(|v| v.lock_picture(picture))
    }

    pub fn state(&self) -> PlayerState {
        self.state
    }

    pub fn config(&self) -> &PlayerConfig {
        &self.config
    }

    pub fn has_audio(&self) -> bool {
        self.audio.is_some()
    }

    pub fn has_video(&self) -> bool {
        self.video.is_some()
    }

    /// Current playback position in seconds.
    ///
    /// Reads the master clock, falling back to the last presented picture.
    pub fn position(&self) -> Option<f64> {
        let master = self.master.as_ref().map_or(f64::NAN, |m| m.get());
        if master.is_nan() {
            self.scheduler.position()
        } else {
            Some(master)
        }
    }

    /// Container duration in seconds, if known.
    pub fn duration(&self) -> Option<f64> {
        self.container.as_ref().and_then(|c| c.duration())
    }

    /// True once playback ran out of media.
    ///
    /// With video this is the scheduler presenting the last picture. Audio-only
    /// playback is finished once the container is fully demuxed and the audio
    /// queue has drained to the device.
    pub fn is_finished(&self) -> bool {
        if self.video.is_some() {
            return self.scheduler.is_finished();
        }
        let demuxed = self.container.as_ref().is_some_and(|c| c.is_eof());
        match &self.audio {
            Some(audio) => {
                let status = audio.status();
                demuxed && status.eof && status.queued == 0
            }
            None => false,
        }
    }

    pub fn master_clock(&self) -> Option<&MasterClock> {
        self.master.as_ref()
    }

    pub fn audio(&self) -> Option<&AudioPipeline> {
        self.audio.as_ref()
    }

    pub fn video(&self) -> Option<&VideoPipeline> {
        self.video.as_ref()
    }

    pub fn video_status(&self) -> Option<PipelineStatus> {
        self.video.as_ref().map(|v| v.status())
    }

    pub fn audio_status(&self) -> Option<PipelineStatus> {
        self.audio.as_ref().map(|a| a.status())
    }

    /// Returns the A/V sync metrics tracker.
    pub fn sync_metrics(&self) -> &SyncMetrics {
        &self.metrics
    }

    /// Returns a snapshot of current A/V sync metrics.
    pub fn sync_metrics_snapshot(&self) -> SyncMetricsSnapshot {
        self.metrics.snapshot()
    }
}

impl Drop for CorePlayer {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualTime;
    use crate::media::{Decoder, StreamInfo};
    use crate::timer::DeadlineTimer;

    struct EmptyContainer;

    impl Container for EmptyContainer {
        fn video_stream(&self) -> Option<StreamInfo> {
            None
        }

        fn audio_stream(&self) -> Option<StreamInfo> {
            None
        }

        fn open_decoder(&self, _stream: &StreamInfo) -> Result<Box<dyn Decoder>, DecodeError> {
            Err(DecodeError::OpenFailed("no streams".into()))
        }
    }

    fn player() -> CorePlayer {
        CorePlayer::new(
            PlayerConfig::default(),
            Arc::new(ManualTime::new(0.0)),
            Arc::new(DeadlineTimer::new()),
        )
    }

    #[test]
    fn test_default_config() {
        let config = PlayerConfig::default();
        assert_eq!(config.sync_mode, SyncMode::AudioMaster);
        assert_eq!(config.audio_queue_depth, 20);
        assert_eq!(config.video_picture_slots, 5);
        assert_eq!(config.max_frame_duration, 10.0);
        assert_eq!(config.retry_interval, Duration::from_millis(10));
    }

    #[test]
    fn test_open_without_streams_fails() {
        let mut player = player();
        let result = player.open(Arc::new(EmptyContainer));
        assert!(matches!(result, Err(PlayerError::NoStreams)));
        assert_eq!(player.state(), PlayerState::Idle);
        assert!(!player.has_audio());
        assert!(!player.has_video());
    }

    #[test]
    fn test_controls_before_open_are_inert() {
        let mut player = player();
        assert!(!player.play());
        assert!(matches!(player.try_play(), Err(PlayerError::NotOpen)));
        player.seek(1000);
        player.toggle_pause();
        assert_eq!(player.state(), PlayerState::Idle);
        assert!(player.get_frame().is_none());
        assert!(player.position().is_none());
    }
}
