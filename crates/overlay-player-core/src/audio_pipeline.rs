//! Audio decode-ahead pipeline and output feeding.
//!
//! The worker thread decodes sample buffers into the pipeline queue. The
//! output device asks for data by sending a byte count on its request
//! channel; a feeder thread receives those requests and calls
//! [`AudioFeed::on_data_requested`], which drains the queue into the device
//! and is the only place the audio clock is updated.
//!
//! Lock order: output device, then tail, then pipeline state.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;

use crate::clock::{Clock, TimeSource};
use crate::error::DecodeError;
use crate::media::{
    AudioOutput, AudioParams, Container, Decoder, SampleBuffer, StreamInfo, TimeBase,
};
use crate::pipeline::{PipelineShared, PipelineStatus, RunState, UnitSource, Worker};
use crate::sync_metrics::SyncMetrics;

/// Output device shared between the feeder, the worker and the player.
pub type SharedOutput = Arc<Mutex<Box<dyn AudioOutput>>>;

/// Adapts an audio [`Decoder`] to the shared decode loop.
struct AudioSource {
    decoder: Box<dyn Decoder>,
    params: AudioParams,
    time_base: TimeBase,
    output: SharedOutput,
}

impl UnitSource for AudioSource {
    type Unit = SampleBuffer;

    fn seek(&mut self, timestamp: i64) -> Result<(), DecodeError> {
        self.decoder.seek(timestamp)
    }

    fn decode(&mut self, target: Option<f64>) -> Result<Option<SampleBuffer>, DecodeError> {
        self.decoder.retrieve_audio(&self.params, target)
    }

    fn is_eof(&self) -> bool {
        self.decoder.is_eof()
    }

    fn to_seconds(&self, timestamp: i64) -> f64 {
        self.time_base.to_seconds(timestamp)
    }

    fn on_flush(&mut self, _kept: Option<&SampleBuffer>) {
        // Pre-seek audio already handed to the device must not play out
        self.output.lock().flush();
    }
}

/// Unwritten remainder of a buffer the device only partly accepted.
struct PendingTail {
    data: Vec<u8>,
    offset: usize,
    /// Presentation time of the first byte of `data`, in seconds
    start: f64,
    serial: u64,
}

/// Consumer side of the audio pipeline, driven by device data requests.
pub struct AudioFeed {
    shared: Arc<PipelineShared<SampleBuffer>>,
    output: SharedOutput,
    clock: Arc<Clock>,
    external: Arc<Clock>,
    params: AudioParams,
    time_base: TimeBase,
    playing: AtomicBool,
    tail: Mutex<Option<PendingTail>>,
    metrics: SyncMetrics,
}

impl AudioFeed {
    /// Writes queued audio to the device in response to a request for
    /// `length` bytes.
    ///
    /// Writes up to twice the requested length so the device does not
    /// underrun before the next request. Updates the audio clock once, from
    /// the position of the last byte written minus the device latency, and
    /// slaves the external clock to it. Returns the number of bytes written.
    pub fn on_data_requested(&self, length: usize) -> usize {
        if !self.playing.load(Ordering::Acquire) {
            return 0;
        }

        let callback_time = self.clock.time_source().now();
        let wanted = length.saturating_mul(2);
        let mut written = 0;
        // Presentation time just past the last byte written, and its serial
        let mut last_written: Option<(f64, u64)> = None;

        let mut output = self.output.lock();
        let mut tail = self.tail.lock();

        if let Some(mut pending) = tail.take() {
            if pending.serial != self.shared.serial_ref().get() {
                tracing::trace!("Discarding audio tail from serial {}", pending.serial);
            } else {
                let accepted = output.write(&pending.data[pending.offset..]);
                pending.offset += accepted;
                written += accepted;
                last_written = Some((
                    pending.start + self.params.duration_of(pending.offset),
                    pending.serial,
                ));
                if pending.offset < pending.data.len() {
                    *tail = Some(pending);
                }
            }
        }

        while tail.is_none() && written < wanted {
            let Some(buffer) = self.shared.lock().queue.pop_front() else {
                break;
            };
            self.shared.notify();

            let start = self.time_base.to_seconds(buffer.pts);
            let accepted = output.write(&buffer.data);
            written += accepted;
            last_written = Some((start + self.params.duration_of(accepted), buffer.serial));
            tracing::trace!(
                "Wrote {}/{} audio bytes at {:.3}s",
                accepted,
                buffer.len(),
                start
            );

            if accepted < buffer.len() {
                *tail = Some(PendingTail {
                    data: buffer.data,
                    offset: accepted,
                    start,
                    serial: buffer.serial,
                });
            }
        }
        drop(tail);

        if let Some((position, serial)) = last_written {
            let latency = self.params.duration_of(output.buffered_bytes());
            self.clock.set_at(position - latency, serial, callback_time);
            self.external.sync_to_slave(&self.clock);
            self.metrics.record_audio_clock_update();
        }
        drop(output);

        self.metrics.record_audio_callback(written);
        written
    }

    pub fn is_playing(&self) -> bool {
        self.playing.load(Ordering::Acquire)
    }

    fn set_playing(&self, playing: bool) {
        self.playing.store(playing, Ordering::Release);
    }
}

/// Thread forwarding device data requests to the feed.
struct Feeder {
    stop_tx: Sender<()>,
    handle: Option<JoinHandle<()>>,
}

impl Feeder {
    fn spawn(feed: Arc<AudioFeed>, requests: Receiver<usize>) -> std::io::Result<Self> {
        let (stop_tx, stop_rx) = crossbeam_channel::bounded::<()>(1);
        let handle = thread::Builder::new()
            .name("audio-feed".into())
            .spawn(move || {
                tracing::debug!("audio-feed: started");
                loop {
                    crossbeam_channel::select! {
                        recv(requests) -> msg => {
                            let Ok(length) = msg else { break };
                            feed.on_data_requested(length);
                        }
                        recv(stop_rx) -> _ => break,
                    }
                }
                tracing::debug!("audio-feed: exited");
            })?;
        Ok(Self {
            stop_tx,
            handle: Some(handle),
        })
    }

    fn stop(&mut self) {
        let _ = self.stop_tx.try_send(());
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                tracing::warn!("audio-feed: thread panicked");
            }
        }
    }
}

/// Decode-ahead pipeline for the audio stream.
pub struct AudioPipeline {
    shared: Arc<PipelineShared<SampleBuffer>>,
    feed: Arc<AudioFeed>,
    stream: StreamInfo,
    source: Option<AudioSource>,
    worker: Option<Worker<AudioSource>>,
    feeder: Option<Feeder>,
    state: RunState,
}

impl AudioPipeline {
    /// Binds a decoder for the container's audio stream to `output`.
    ///
    /// Returns `Ok(None)` if the container has no audio stream.
    pub fn open(
        container: &dyn Container,
        output: Box<dyn AudioOutput>,
        external: Arc<Clock>,
        queue_depth: usize,
        time: Arc<dyn TimeSource>,
        metrics: SyncMetrics,
    ) -> Result<Option<Self>, DecodeError> {
        let Some(stream) = container.audio_stream() else {
            return Ok(None);
        };
        let decoder = container.open_decoder(&stream)?;

        let params = output.params();
        let output: SharedOutput = Arc::new(Mutex::new(output));
        let shared = Arc::new(PipelineShared::new("audio-decode", queue_depth, false));
        let clock = Arc::new(Clock::new(shared.serial_ref(), time));

        tracing::info!(
            "Audio pipeline opened: stream {} at {} Hz x{} ch, queue depth {}",
            stream.index,
            params.sample_rate,
            params.channels,
            queue_depth
        );

        let feed = Arc::new(AudioFeed {
            shared: Arc::clone(&shared),
            output: Arc::clone(&output),
            clock,
            external,
            params,
            time_base: stream.time_base,
            playing: AtomicBool::new(false),
            tail: Mutex::new(None),
            metrics,
        });

        Ok(Some(Self {
            source: Some(AudioSource {
                decoder,
                params,
                time_base: stream.time_base,
                output,
            }),
            shared,
            feed,
            stream,
            worker: None,
            feeder: None,
            state: RunState::Opened,
        }))
    }

    /// Starts the decode worker and the request feeder, and resumes the device.
    pub fn run(&mut self) -> std::io::Result<()> {
        if self.state != RunState::Opened {
            return Ok(());
        }
        let Some(source) = self.source.take() else {
            return Ok(());
        };

        let requests = self.feed.output.lock().data_requests();
        let worker = match Worker::spawn("audio-decode", Arc::clone(&self.shared), source) {
            Ok(worker) => worker,
            Err(e) => {
                self.state = RunState::Stopped;
                return Err(e);
            }
        };
        self.worker = Some(worker);

        if let Some(requests) = requests {
            match Feeder::spawn(Arc::clone(&self.feed), requests) {
                Ok(feeder) => self.feeder = Some(feeder),
                Err(e) => {
                    self.stop();
                    return Err(e);
                }
            }
        } else {
            tracing::debug!("Audio output has no request channel; caller drives the feed");
        }

        self.feed.set_playing(true);
        self.feed.output.lock().suspend(false);
        self.state = RunState::Running;
        Ok(())
    }

    /// Flips between running and paused.
    ///
    /// On resume the device is asked for data immediately instead of waiting
    /// for its next request.
    pub fn toggle_pause(&mut self) {
        let paused = match self.state {
            RunState::Running => true,
            RunState::Paused => false,
            RunState::Opened | RunState::Stopped => return,
        };

        self.feed.set_playing(!paused);
        self.feed.output.lock().suspend(paused);
        self.feed.clock.set_paused(paused);
        self.state = if paused {
            RunState::Paused
        } else {
            RunState::Running
        };
        tracing::debug!("Audio pipeline {}", if paused { "paused" } else { "resumed" });

        if !paused {
            let length = self.feed.output.lock().data_length_required();
            if length > 0 {
                self.feed.on_data_requested(length);
            }
        }
    }

    /// Requests a reposition to `seconds`. The worker flushes queue and device.
    pub fn seek(&self, seconds: f64) {
        let timestamp = self.stream.time_base.from_seconds(seconds);
        tracing::debug!("Audio seek requested: {:.3}s (ts {})", seconds, timestamp);
        self.shared.request_seek(timestamp);
    }

    /// Stops the feeder and the worker and suspends the device.
    pub fn stop(&mut self) {
        if self.state == RunState::Stopped {
            return;
        }
        self.feed.set_playing(false);
        if let Some(mut feeder) = self.feeder.take() {
            feeder.stop();
        }
        self.shared.request_stop();
        if let Some(mut worker) = self.worker.take() {
            worker.join();
        }
        self.feed.output.lock().suspend(true);
        self.state = RunState::Stopped;
        tracing::debug!("Audio pipeline stopped");
    }

    /// Handle for delivering data requests directly.
    pub fn feed(&self) -> &Arc<AudioFeed> {
        &self.feed
    }

    pub fn clock(&self) -> &Arc<Clock> {
        &self.feed.clock
    }

    pub fn output(&self) -> &SharedOutput {
        &self.feed.output
    }

    pub fn params(&self) -> AudioParams {
        self.feed.params
    }

    pub fn status(&self) -> PipelineStatus {
        self.shared.status()
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn stream(&self) -> &StreamInfo {
        &self.stream
    }
}

impl Drop for AudioPipeline {
    fn drop(&mut self) {
        self.stop();
    }
}
