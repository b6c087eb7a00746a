//! Decode-ahead machinery shared by the audio and video pipelines.
//!
//! Each pipeline owns a [`PipelineShared`]: one mutex guarding the decode
//! queue together with the pending-seek, end-of-stream and stop flags, and one
//! condition variable that parks the worker when the queue is full or the
//! stream has ended. The worker is woken by `seek()`, by consumers retiring
//! units, and by `stop()`.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::clock::QueueSerial;
use crate::decode_queue::DecodeQueue;
use crate::error::DecodeError;
use crate::media::DecodedUnit;

/// How long the worker backs off when the decoder has nothing yet but is not at EOF.
const STARVED_BACKOFF: Duration = Duration::from_millis(5);

/// State guarded by the pipeline mutex.
pub(crate) struct PipelineState<U> {
    pub(crate) queue: DecodeQueue<U>,
    /// Pending reposition in stream time-base units (latest request wins)
    pub(crate) pending_seek: Option<i64>,
    /// Decoder reported end-of-stream and no seek has been serviced since
    pub(crate) eof: bool,
    /// Worker loop exited on a fatal decode error
    pub(crate) failed: bool,
    pub(crate) stopped: bool,
}

/// Queue, flags and wake-up signal shared between a worker and its consumers.
pub(crate) struct PipelineShared<U> {
    name: &'static str,
    state: Mutex<PipelineState<U>>,
    wake: Condvar,
}

impl<U: DecodedUnit> PipelineShared<U> {
    pub(crate) fn new(name: &'static str, capacity: usize, keep_last: bool) -> Self {
        Self {
            name,
            state: Mutex::new(PipelineState {
                queue: DecodeQueue::new(capacity, keep_last),
                pending_seek: None,
                eof: false,
                failed: false,
                stopped: false,
            }),
            wake: Condvar::new(),
        }
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, PipelineState<U>> {
        self.state.lock()
    }

    /// Wakes the worker (queue has room, seek requested, or stop).
    pub(crate) fn notify(&self) {
        self.wake.notify_all();
    }

    pub(crate) fn serial_ref(&self) -> QueueSerial {
        self.state.lock().queue.serial_ref()
    }

    /// Records a seek request and wakes the worker.
    ///
    /// Only one request is outstanding at a time; a newer position replaces
    /// a pending one, so a flood of requests costs a single reposition.
    pub(crate) fn request_seek(&self, timestamp: i64) {
        let mut state = self.state.lock();
        if let Some(previous) = state.pending_seek.replace(timestamp) {
            tracing::debug!(
                "{}: coalescing seek {} into pending request (was {})",
                self.name,
                timestamp,
                previous
            );
        }
        drop(state);
        self.wake.notify_all();
    }

    /// Sets the stop flag and wakes a blocked worker so it observes it.
    pub(crate) fn request_stop(&self) {
        self.state.lock().stopped = true;
        self.wake.notify_all();
    }

    pub(crate) fn status(&self) -> PipelineStatus {
        let state = self.state.lock();
        PipelineStatus {
            queued: state.queue.len(),
            capacity: state.queue.capacity(),
            serial: state.queue.serial(),
            eof: state.eof,
            failed: state.failed,
            seek_pending: state.pending_seek.is_some(),
        }
    }
}

/// Lifecycle of a pipeline. A container without the stream never gets one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    /// Decoder bound, worker not started
    Opened,
    /// Worker decoding ahead, output active
    Running,
    /// Output suspended, worker still decoding ahead
    Paused,
    /// Worker joined; terminal
    Stopped,
}

/// Point-in-time view of a pipeline for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineStatus {
    pub queued: usize,
    pub capacity: usize,
    pub serial: u64,
    pub eof: bool,
    pub failed: bool,
    pub seek_pending: bool,
}

/// Decoder adapter that produces one kind of unit for the shared loop.
pub(crate) trait UnitSource: Send + 'static {
    type Unit: DecodedUnit + 'static;

    /// Repositions the underlying decoder.
    fn seek(&mut self, timestamp: i64) -> Result<(), DecodeError>;

    /// Decodes the next unit; `target` is the pending seek position in seconds.
    fn decode(&mut self, target: Option<f64>) -> Result<Option<Self::Unit>, DecodeError>;

    fn is_eof(&self) -> bool;

    /// Converts a time-base timestamp to seconds.
    fn to_seconds(&self, timestamp: i64) -> f64;

    /// Called after the queue was flushed for a seek, outside the pipeline lock.
    ///
    /// `kept` is the unit the flush retained for redraw, if any.
    fn on_flush(&mut self, _kept: Option<&Self::Unit>) {}
}

/// What the worker decided to do after inspecting the shared state.
enum Step<U> {
    Seek(i64, Option<U>),
    Decode(u64),
    Exit,
}

/// The decode-ahead loop run on each pipeline's worker thread.
///
/// Returns the source so the caller can reuse the decoder after a join.
pub(crate) fn run_decode_loop<S: UnitSource>(
    shared: Arc<PipelineShared<S::Unit>>,
    mut source: S,
) -> S {
    let name = shared.name;
    tracing::debug!("{}: decode loop started", name);
    let mut seek_target: Option<f64> = None;

    loop {
        let step = {
            let mut state = shared.lock();
            loop {
                if state.stopped {
                    break Step::Exit;
                }
                if let Some(timestamp) = state.pending_seek.take() {
                    let dropped = state.queue.flush();
                    let kept = state.queue.shown_unit().cloned();
                    state.eof = false;
                    tracing::debug!(
                        "{}: servicing seek to {} (dropped {} units, serial {})",
                        name,
                        timestamp,
                        dropped,
                        state.queue.serial()
                    );
                    break Step::Seek(timestamp, kept);
                }
                if state.queue.is_full() || state.eof {
                    shared.wake.wait(&mut state);
                    continue;
                }
                break Step::Decode(state.queue.serial());
            }
        };

        match step {
            Step::Exit => break,
            Step::Seek(timestamp, kept) => {
                source.on_flush(kept.as_ref());
                if let Err(e) = source.seek(timestamp) {
                    tracing::warn!("{}: {}", name, e);
                }
                seek_target = Some(source.to_seconds(timestamp));
            }
            Step::Decode(serial) => match source.decode(seek_target) {
                Ok(Some(mut unit)) => {
                    seek_target = None;
                    unit.set_serial(serial);
                    let mut state = shared.lock();
                    if state.stopped
                        || state.pending_seek.is_some()
                        || state.queue.serial() != serial
                    {
                        tracing::trace!("{}: discarding unit decoded before seek", name);
                        continue;
                    }
                    if state.queue.push(unit).is_err() {
                        // Only the worker pushes and it checked for room before decoding
                        tracing::warn!("{}: queue unexpectedly full, unit dropped", name);
                    }
                    tracing::trace!("{}: queued unit ({} buffered)", name, state.queue.len());
                }
                Ok(None) if source.is_eof() => {
                    let mut state = shared.lock();
                    if state.queue.serial() == serial && state.pending_seek.is_none() {
                        tracing::debug!("{}: end of stream", name);
                        state.eof = true;
                    }
                }
                Ok(None) => thread::sleep(STARVED_BACKOFF),
                Err(e) if e.is_recoverable() => {
                    tracing::warn!("{}: {}", name, e);
                }
                Err(e) => {
                    tracing::error!("{}: decode loop terminated: {}", name, e);
                    shared.lock().failed = true;
                    break;
                }
            },
        }
    }

    tracing::debug!("{}: decode loop exited", name);
    source
}

/// Handle to a running worker thread.
pub(crate) struct Worker<S> {
    handle: Option<JoinHandle<S>>,
}

impl<S: UnitSource> Worker<S> {
    /// Spawns the decode loop on a named thread.
    pub(crate) fn spawn(
        name: &'static str,
        shared: Arc<PipelineShared<S::Unit>>,
        source: S,
    ) -> std::io::Result<Self> {
        let handle = thread::Builder::new()
            .name(name.into())
            .spawn(move || run_decode_loop(shared, source))?;
        Ok(Self {
            handle: Some(handle),
        })
    }

    /// Joins the thread and returns the source. The stop flag must be set first.
    pub(crate) fn join(&mut self) -> Option<S> {
        let handle = self.handle.take()?;
        match handle.join() {
            Ok(source) => Some(source),
            Err(e) => {
                tracing::warn!("Decode worker join failed: {:?}", e);
                None
            }
        }
    }
}
