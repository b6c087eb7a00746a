//! Decoded unit types and the contracts of the external media collaborators.
//!
//! The core does not parse containers or decode bitstreams. It drives a
//! [`Container`] that hands out one [`Decoder`] per stream, and an
//! [`AudioOutput`] device that pulls bytes. Everything in this module is
//! either a plain data type or a trait implemented outside the core.

use crate::error::DecodeError;

/// Rational time base: one timestamp unit equals `num / den` seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeBase {
    pub num: i64,
    pub den: i64,
}

impl TimeBase {
    pub const fn new(num: i64, den: i64) -> Self {
        Self { num, den }
    }

    /// Millisecond time base.
    pub const MILLISECONDS: TimeBase = TimeBase::new(1, 1000);

    /// Converts a timestamp in this time base to seconds.
    pub fn to_seconds(self, ts: i64) -> f64 {
        if self.den == 0 {
            return f64::NAN;
        }
        ts as f64 * self.num as f64 / self.den as f64
    }

    /// Converts seconds to a timestamp in this time base, rounding to nearest.
    pub fn from_seconds(self, seconds: f64) -> i64 {
        if self.num == 0 {
            return 0;
        }
        (seconds * self.den as f64 / self.num as f64).round() as i64
    }
}

/// Kind of elementary stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamKind {
    Audio,
    Video,
}

/// Description of an elementary stream in an opened container.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamInfo {
    pub index: usize,
    pub kind: StreamKind,
    pub time_base: TimeBase,
    /// Stream duration in time-base units, if known
    pub duration: Option<i64>,
}

impl StreamInfo {
    /// Duration in seconds, if known.
    pub fn duration_seconds(&self) -> Option<f64> {
        self.duration.map(|d| self.time_base.to_seconds(d))
    }
}

/// Output sample layout requested from audio decoders.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioParams {
    pub sample_rate: u32,
    pub channels: u16,
    /// Bytes per sample per channel (2 for s16)
    pub bytes_per_sample: u16,
}

impl AudioParams {
    /// Bytes consumed per second of playback.
    pub fn bytes_per_second(&self) -> usize {
        self.sample_rate as usize * self.channels as usize * self.bytes_per_sample as usize
    }

    /// Duration in seconds of `len` bytes.
    pub fn duration_of(&self, len: usize) -> f64 {
        let bps = self.bytes_per_second();
        if bps == 0 {
            0.0
        } else {
            len as f64 / bps as f64
        }
    }
}

impl Default for AudioParams {
    fn default() -> Self {
        Self {
            sample_rate: 48_000,
            channels: 2,
            bytes_per_sample: 2,
        }
    }
}

/// A unit that lives in a [`DecodeQueue`](crate::decode_queue::DecodeQueue).
///
/// Units are tagged with the queue serial they were decoded under.
pub trait DecodedUnit: Send + Clone {
    fn serial(&self) -> u64;
    fn set_serial(&mut self, serial: u64);
}

/// Backing storage for one decoded picture.
///
/// Owned by the video pipeline's picture arena and reused slot by slot.
#[derive(Debug, Default)]
pub struct PictureBuffer {
    pub width: u32,
    pub height: u32,
    pub stride: usize,
    pub data: Vec<u8>,
}

/// A decoded picture.
///
/// The pixels live in the arena slot named by `slot`; a `Picture` is only the
/// timing and location record, so cloning it is cheap.
#[derive(Debug, Clone, PartialEq)]
pub struct Picture {
    /// Presentation timestamp in stream time-base units
    pub pts: i64,
    /// Display duration in seconds (0.0 if unknown)
    pub duration: f64,
    /// Index of the backing buffer in the picture arena
    pub slot: usize,
    pub serial: u64,
}

impl Picture {
    /// Creates a picture record; the pipeline fills in slot and serial.
    pub fn new(pts: i64, duration: f64) -> Self {
        Self {
            pts,
            duration,
            slot: 0,
            serial: 0,
        }
    }
}

impl DecodedUnit for Picture {
    fn serial(&self) -> u64 {
        self.serial
    }

    fn set_serial(&mut self, serial: u64) {
        self.serial = serial;
    }
}

/// Decoded audio in the output device's format.
#[derive(Clone, PartialEq)]
pub struct SampleBuffer {
    /// Presentation timestamp in stream time-base units
    pub pts: i64,
    /// Interleaved raw bytes in the requested [`AudioParams`] layout
    pub data: Vec<u8>,
    pub serial: u64,
}

impl SampleBuffer {
    pub fn new(pts: i64, data: Vec<u8>) -> Self {
        Self {
            pts,
            data,
            serial: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl std::fmt::Debug for SampleBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SampleBuffer")
            .field("pts", &self.pts)
            .field("data_len", &self.data.len())
            .field("serial", &self.serial)
            .finish()
    }
}

impl DecodedUnit for SampleBuffer {
    fn serial(&self) -> u64 {
        self.serial
    }

    fn set_serial(&mut self, serial: u64) {
        self.serial = serial;
    }
}

/// An already-probed media container.
pub trait Container: Send + Sync {
    /// Returns the primary video stream, if any.
    fn video_stream(&self) -> Option<StreamInfo>;

    /// Returns the primary audio stream, if any.
    fn audio_stream(&self) -> Option<StreamInfo>;

    /// Creates a decoder bound to `stream`.
    fn open_decoder(&self, stream: &StreamInfo) -> Result<Box<dyn Decoder>, DecodeError>;

    /// Returns true once the demuxer has delivered every packet.
    fn is_eof(&self) -> bool {
        false
    }

    /// Total duration in seconds, if known.
    fn duration(&self) -> Option<f64> {
        let video = self.video_stream().and_then(|s| s.duration_seconds());
        let audio = self.audio_stream().and_then(|s| s.duration_seconds());
        match (video, audio) {
            (Some(v), Some(a)) => Some(v.max(a)),
            (v, a) => v.or(a),
        }
    }
}

/// Decode-and-seek service for one stream.
///
/// `Ok(None)` from a retrieve call means "nothing available right now";
/// callers consult [`Decoder::is_eof`] to tell end-of-stream from a stall.
pub trait Decoder: Send {
    /// Repositions to `timestamp` in the stream's time base.
    fn seek(&mut self, timestamp: i64) -> Result<(), DecodeError>;

    /// Decodes the next picture into `buffer`.
    ///
    /// When `target` is set (seconds), pictures before it may be skipped.
    fn retrieve_video(
        &mut self,
        _target: Option<f64>,
        _buffer: &mut PictureBuffer,
    ) -> Result<Option<Picture>, DecodeError> {
        Err(DecodeError::Unsupported("not a video decoder".to_string()))
    }

    /// Decodes the next block of samples converted to `params`.
    ///
    /// When `target` is set (seconds), samples before it may be skipped.
    fn retrieve_audio(
        &mut self,
        _params: &AudioParams,
        _target: Option<f64>,
    ) -> Result<Option<SampleBuffer>, DecodeError> {
        Err(DecodeError::Unsupported("not an audio decoder".to_string()))
    }

    /// Returns true if the decoder has delivered its last unit.
    fn is_eof(&self) -> bool;
}

/// Push-style audio output device.
///
/// The device pulls data by sending the number of bytes it wants on the
/// channel returned by [`AudioOutput::data_requests`].
pub trait AudioOutput: Send {
    /// Output format the pipeline must decode to.
    fn params(&self) -> AudioParams;

    /// Writes bytes and returns how many were accepted.
    fn write(&mut self, bytes: &[u8]) -> usize;

    /// Discards everything buffered in the device.
    fn flush(&mut self);

    /// Suspends (`true`) or resumes (`false`) output.
    fn suspend(&mut self, suspended: bool);

    /// Number of bytes the device currently wants.
    fn data_length_required(&self) -> usize;

    /// Bytes written but not yet audible (the buffer-length hint).
    fn buffered_bytes(&self) -> usize;

    /// Notification channel carrying data requests, if the device pushes them.
    fn data_requests(&self) -> Option<crossbeam_channel::Receiver<usize>> {
        None
    }
}
