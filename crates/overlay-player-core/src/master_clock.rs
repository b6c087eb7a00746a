//! Master clock selection.

use std::sync::Arc;

use crate::clock::Clock;

/// Configured synchronization policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncMode {
    /// Audio drives timing; video is corrected to it
    #[default]
    AudioMaster,
    /// Video presentation drives timing
    VideoMaster,
    /// A free-running wall clock drives timing
    ExternalClock,
}

/// Which clock is authoritative.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockKind {
    Audio,
    Video,
    External,
}

/// Picks the authoritative clock for a sync mode and the streams present.
///
/// Video master falls back to the audio rule without video; audio master
/// falls back to the external clock without audio.
pub fn select_master(mode: SyncMode, has_audio: bool, has_video: bool) -> ClockKind {
    match mode {
        SyncMode::VideoMaster if has_video => ClockKind::Video,
        SyncMode::VideoMaster | SyncMode::AudioMaster if has_audio => ClockKind::Audio,
        _ => ClockKind::External,
    }
}

/// The three clocks of an open stream and the one chosen as master.
#[derive(Debug, Clone)]
pub struct MasterClock {
    kind: ClockKind,
    audio: Option<Arc<Clock>>,
    video: Option<Arc<Clock>>,
    external: Arc<Clock>,
}

impl MasterClock {
    pub fn new(
        mode: SyncMode,
        audio: Option<Arc<Clock>>,
        video: Option<Arc<Clock>>,
        external: Arc<Clock>,
    ) -> Self {
        let kind = select_master(mode, audio.is_some(), video.is_some());
        tracing::debug!("Master clock: {:?} (mode {:?})", kind, mode);
        Self {
            kind,
            audio,
            video,
            external,
        }
    }

    pub fn kind(&self) -> ClockKind {
        self.kind
    }

    /// Current master time in seconds, NaN if the master is stale or unset.
    pub fn get(&self) -> f64 {
        match self.kind {
            ClockKind::Audio => self.audio.as_ref().map_or(f64::NAN, |c| c.get()),
            ClockKind::Video => self.video.as_ref().map_or(f64::NAN, |c| c.get()),
            ClockKind::External => self.external.get(),
        }
    }

    pub fn is_video_master(&self) -> bool {
        self.kind == ClockKind::Video
    }

    pub fn audio(&self) -> Option<&Arc<Clock>> {
        self.audio.as_ref()
    }

    pub fn video(&self) -> Option<&Arc<Clock>> {
        self.video.as_ref()
    }

    pub fn external(&self) -> &Arc<Clock> {
        &self.external
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{ManualTime, QueueSerial, TimeSource};

    #[test]
    fn test_select_master() {
        use ClockKind::*;
        use SyncMode::*;

        assert_eq!(select_master(AudioMaster, true, true), Audio);
        assert_eq!(select_master(AudioMaster, false, true), External);
        assert_eq!(select_master(VideoMaster, true, true), Video);
        assert_eq!(select_master(VideoMaster, true, false), Audio);
        assert_eq!(select_master(VideoMaster, false, false), External);
        assert_eq!(select_master(ExternalClock, true, true), External);
        assert_eq!(SyncMode::default(), AudioMaster);
    }

    #[test]
    fn test_master_reads_selected_clock() {
        let time: Arc<dyn TimeSource> = Arc::new(ManualTime::new(0.0));
        let audio = Arc::new(Clock::new(QueueSerial::new(1), Arc::clone(&time)));
        let external = Arc::new(Clock::free_running(time));
        audio.set(3.0, 1);
        external.set(9.0, 0);

        let master = MasterClock::new(
            SyncMode::AudioMaster,
            Some(Arc::clone(&audio)),
            None,
            Arc::clone(&external),
        );
        assert_eq!(master.kind(), ClockKind::Audio);
        assert_eq!(master.get(), 3.0);

        let fallback = MasterClock::new(SyncMode::AudioMaster, None, None, external);
        assert_eq!(fallback.get(), 9.0);
    }
}
