//! Video decode-ahead pipeline.
//!
//! Pictures are decoded into a fixed set of backing buffers (the
//! [`PictureArena`]) in index order. The decode queue capacity equals the
//! number of slots and the worker only decodes when the queue has room, so
//! the slot being written is never referenced by a queued picture.
//!
//! The queue keeps the picture currently on screen after it was presented
//! (see [`VideoPipeline::next_frame`]) so the renderer can redraw it until
//! its successor is presented. That picture survives a seek flush, and the
//! decoder resumes at the slot after it so its pixels are not overwritten.

use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};

use crate::clock::{Clock, TimeSource};
use crate::error::DecodeError;
use crate::media::{Container, Decoder, Picture, PictureBuffer, StreamInfo, TimeBase};
use crate::pipeline::{PipelineShared, PipelineStatus, RunState, UnitSource, Worker};

/// One slot holds the picture on screen, at least one more is needed to decode into.
const MIN_PICTURE_SLOTS: usize = 2;

/// Fixed-size pool of picture buffers addressed by slot index.
pub struct PictureArena {
    slots: Vec<Mutex<PictureBuffer>>,
}

impl PictureArena {
    pub fn new(slots: usize) -> Self {
        Self {
            slots: (0..slots.max(MIN_PICTURE_SLOTS))
                .map(|_| Mutex::new(PictureBuffer::default()))
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Locks the buffer of `slot`. Returns `None` for an out-of-range slot.
    pub fn lock(&self, slot: usize) -> Option<MutexGuard<'_, PictureBuffer>> {
        self.slots.get(slot).map(|buffer| buffer.lock())
    }
}

/// Adapts a video [`Decoder`] to the shared decode loop.
struct VideoSource {
    decoder: Box<dyn Decoder>,
    arena: Arc<PictureArena>,
    next_slot: usize,
    time_base: TimeBase,
}

impl UnitSource for VideoSource {
    type Unit = Picture;

    fn seek(&mut self, timestamp: i64) -> Result<(), DecodeError> {
        self.decoder.seek(timestamp)
    }

    fn decode(&mut self, target: Option<f64>) -> Result<Option<Picture>, DecodeError> {
        let slot = self.next_slot;
        let decoded = {
            let Some(mut buffer) = self.arena.lock(slot) else {
                return Err(DecodeError::DecodeFailed(format!(
                    "picture slot {slot} out of range"
                )));
            };
            self.decoder.retrieve_video(target, &mut buffer)?
        };

        Ok(decoded.map(|mut picture| {
            picture.slot = slot;
            self.next_slot = (slot + 1) % self.arena.len();
            picture
        }))
    }

    fn is_eof(&self) -> bool {
        self.decoder.is_eof()
    }

    fn to_seconds(&self, timestamp: i64) -> f64 {
        self.time_base.to_seconds(timestamp)
    }

    fn on_flush(&mut self, kept: Option<&Picture>) {
        if let Some(picture) = kept {
            self.next_slot = (picture.slot + 1) % self.arena.len();
        }
    }
}

/// Decode-ahead pipeline for the video stream.
pub struct VideoPipeline {
    shared: Arc<PipelineShared<Picture>>,
    arena: Arc<PictureArena>,
    clock: Arc<Clock>,
    stream: StreamInfo,
    /// Decoder adapter waiting for `run()`
    source: Option<VideoSource>,
    worker: Option<Worker<VideoSource>>,
    state: RunState,
}

impl VideoPipeline {
    /// Binds a decoder for the container's video stream.
    ///
    /// Returns `Ok(None)` if the container has no video stream.
    pub fn open(
        container: &dyn Container,
        slots: usize,
        time: Arc<dyn TimeSource>,
    ) -> Result<Option<Self>, DecodeError> {
        let Some(stream) = container.video_stream() else {
            return Ok(None);
        };
        let decoder = container.open_decoder(&stream)?;

        let arena = Arc::new(PictureArena::new(slots));
        let shared = Arc::new(PipelineShared::new("video-decode", arena.len(), true));
        let clock = Arc::new(Clock::new(shared.serial_ref(), time));

        tracing::info!(
            "Video pipeline opened: stream {} time base {}/{}, {} picture slots",
            stream.index,
            stream.time_base.num,
            stream.time_base.den,
            arena.len()
        );

        Ok(Some(Self {
            source: Some(VideoSource {
                decoder,
                arena: Arc::clone(&arena),
                next_slot: 0,
                time_base: stream.time_base,
            }),
            shared,
            arena,
            clock,
            stream,
            worker: None,
            state: RunState::Opened,
        }))
    }

    /// Starts the decode-ahead worker. Does nothing unless freshly opened.
    pub fn run(&mut self) -> std::io::Result<()> {
        if self.state != RunState::Opened {
            return Ok(());
        }
        let Some(source) = self.source.take() else {
            return Ok(());
        };
        match Worker::spawn("video-decode", Arc::clone(&self.shared), source) {
            Ok(worker) => {
                self.worker = Some(worker);
                self.state = RunState::Running;
                Ok(())
            }
            Err(e) => {
                self.state = RunState::Stopped;
                Err(e)
            }
        }
    }

    /// Requests a reposition to `seconds`. The worker flushes and seeks.
    pub fn seek(&self, seconds: f64) {
        let timestamp = self.stream.time_base.from_seconds(seconds);
        tracing::debug!("Video seek requested: {:.3}s (ts {})", seconds, timestamp);
        self.shared.request_seek(timestamp);
    }

    /// Stops and joins the worker.
    pub fn stop(&mut self) {
        if self.state == RunState::Stopped {
            return;
        }
        self.shared.request_stop();
        if let Some(mut worker) = self.worker.take() {
            worker.join();
        }
        self.state = RunState::Stopped;
        tracing::debug!("Video pipeline stopped");
    }

    /// The next picture to present.
    pub fn get_frame(&self) -> Option<Picture> {
        self.shared.lock().queue.peek_current().cloned()
    }

    /// The picture after [`get_frame`](Self::get_frame).
    pub fn get_next_frame(&self) -> Option<Picture> {
        self.shared.lock().queue.peek_next().cloned()
    }

    /// The picture currently on screen, retained for redraw.
    pub fn get_last_frame(&self) -> Option<Picture> {
        self.shared.lock().queue.shown_unit().cloned()
    }

    /// Marks `presented` as on screen and wakes the worker.
    ///
    /// The first call only flags the picture as shown; later calls retire the
    /// previously shown one, freeing its slot. Returns false, leaving the
    /// queue untouched, if `presented` is no longer the current picture
    /// because a seek flushed it after it was read.
    pub fn next_frame(&self, presented: &Picture) -> bool {
        let mut state = self.shared.lock();
        if state.queue.peek_current() != Some(presented) {
            tracing::debug!(
                "Picture pts={} serial={} flushed before presentation",
                presented.pts,
                presented.serial
            );
            return false;
        }
        let retired = state.queue.advance();
        drop(state);
        if let Some(picture) = retired {
            tracing::trace!("Retired picture pts={} slot={}", picture.pts, picture.slot);
        }
        self.shared.notify();
        true
    }

    /// Number of pictures not yet presented.
    pub fn remaining(&self) -> usize {
        self.shared.lock().queue.remaining()
    }

    /// True once the decoder hit end of stream and every picture was presented.
    pub fn is_end_of_stream(&self) -> bool {
        let state = self.shared.lock();
        state.eof && state.pending_seek.is_none() && state.queue.remaining() == 0
    }

    /// Current queue serial.
    pub fn serial(&self) -> u64 {
        self.shared.lock().queue.serial()
    }

    pub fn status(&self) -> PipelineStatus {
        self.shared.status()
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn clock(&self) -> &Arc<Clock> {
        &self.clock
    }

    pub fn stream(&self) -> &StreamInfo {
        &self.stream
    }

    pub fn time_base(&self) -> TimeBase {
        self.stream.time_base
    }

    /// Locks the backing buffer of a picture for upload or redraw.
    pub fn lock_picture(&self, picture: &Picture) -> Option<MutexGuard<'_, PictureBuffer>> {
        self.arena.lock(picture.slot)
    }
}

impl Drop for VideoPipeline {
    fn drop(&mut self) {
        self.stop();
    }
}
