//! overlay-player-core: playback synchronization core.
//!
//! Decodes audio and video ahead of real time on worker threads, keeps both
//! locked to one authoritative clock, and schedules display refreshes that
//! neither race ahead of decoding nor drift from audio. It contains:
//!
//! - Clocks and time: [`clock`], [`master_clock`]
//! - Decode-ahead: [`decode_queue`], [`audio_pipeline`], [`video_pipeline`]
//! - Display timing: [`scheduler`], [`timer`], [`sync_metrics`]
//! - Public API and seek coordination: [`player`]
//! - Collaborator contracts: [`media`] (container, decoder, audio output)
//!
//! Container parsing, decoding, pixel conversion and rendering live outside
//! this crate behind the traits in [`media`] and [`timer`].

pub mod audio_pipeline;
pub mod clock;
pub mod decode_queue;
pub mod error;
pub mod master_clock;
pub mod media;
pub mod pipeline;
pub mod player;
pub mod scheduler;
pub mod sync_metrics;
pub mod timer;
pub mod video_pipeline;

pub use clock::{Clock, ManualTime, MonotonicTime, QueueSerial, TimeSource};
pub use error::{DecodeError, PlayerError};
pub use master_clock::{ClockKind, MasterClock, SyncMode};
pub use media::{
    AudioOutput, AudioParams, Container, Decoder, Picture, PictureBuffer, SampleBuffer,
    StreamInfo, StreamKind, TimeBase,
};
pub use pipeline::{PipelineStatus, RunState};
pub use player::{CorePlayer, PlayerConfig, PlayerState, StreamCaps};
pub use scheduler::{compute_target_delay, Tick};
pub use sync_metrics::{SyncMetrics, SyncMetricsSnapshot};
pub use timer::{DeadlineTimer, Timer, TimerHandle};
