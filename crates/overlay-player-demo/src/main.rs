//! overlay-player Demo Application
//!
//! Plays a synthetic stream through overlay-player-core without a window:
//! a 25 fps gradient video and a 440 Hz tone, fed to a simulated audio
//! device that pulls data on its own clock. Sync metrics are logged once a
//! second.
//!
//! Usage: `overlay-player-demo [seconds] [--seek-ms <ms>] [--pause-at-ms <ms>]`

use std::f64::consts::TAU;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender};
use overlay_player_core::{
    AudioOutput, AudioParams, Container, CorePlayer, DeadlineTimer, DecodeError, Decoder,
    MonotonicTime, Picture, PictureBuffer, PlayerConfig, SampleBuffer, StreamInfo, StreamKind,
    Tick, TimeBase, Timer,
};
use parking_lot::Mutex;

const FPS: i64 = 25;
const WIDTH: u32 = 64;
const HEIGHT: u32 = 36;
/// Audio block length produced by the synthetic decoder
const AUDIO_BLOCK_MS: i64 = 20;
const TONE_HZ: f64 = 440.0;
/// Simulated device period between data requests
const DEVICE_PERIOD: Duration = Duration::from_millis(20);
/// Simulated device buffer capacity
const DEVICE_BUFFER_MS: usize = 100;

#[derive(Debug, Clone)]
struct Options {
    seconds: i64,
    seek_ms: Option<i64>,
    pause_at_ms: Option<i64>,
}

impl Options {
    fn from_args() -> Result<Self, String> {
        let mut options = Options {
            seconds: 5,
            seek_ms: None,
            pause_at_ms: None,
        };
        let mut args = std::env::args().skip(1);
        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--seek-ms" => options.seek_ms = Some(parse_value(&arg, args.next())?),
                "--pause-at-ms" => options.pause_at_ms = Some(parse_value(&arg, args.next())?),
                other => {
                    options.seconds = other
                        .parse()
                        .map_err(|_| format!("invalid duration: {other}"))?
                }
            }
        }
        if options.seconds <= 0 {
            return Err("duration must be positive".into());
        }
        Ok(options)
    }
}

fn parse_value(flag: &str, value: Option<String>) -> Result<i64, String> {
    let value = value.ok_or_else(|| format!("{flag} needs a value"))?;
    value
        .parse()
        .map_err(|_| format!("invalid value for {flag}: {value}"))
}

// =========================================================================
// Synthetic media
// =========================================================================

struct SyntheticContainer {
    duration_ms: i64,
}

impl Container for SyntheticContainer {
    fn video_stream(&self) -> Option<StreamInfo> {
        Some(StreamInfo {
            index: 0,
            kind: StreamKind::Video,
            time_base: TimeBase::new(1, FPS),
            duration: Some(self.duration_ms * FPS / 1000),
        })
    }

    fn audio_stream(&self) -> Option<StreamInfo> {
        Some(StreamInfo {
            index: 1,
            kind: StreamKind::Audio,
            time_base: TimeBase::MILLISECONDS,
            duration: Some(self.duration_ms),
        })
    }

    fn open_decoder(&self, stream: &StreamInfo) -> Result<Box<dyn Decoder>, DecodeError> {
        match stream.kind {
            StreamKind::Video => Ok(Box::new(GradientDecoder {
                frame: 0,
                frames: stream.duration.unwrap_or(0),
            })),
            StreamKind::Audio => Ok(Box::new(ToneDecoder {
                position_ms: 0,
                duration_ms: self.duration_ms,
            })),
        }
    }
}

/// Produces one RGBA gradient per frame, shifted by the frame index.
struct GradientDecoder {
    frame: i64,
    frames: i64,
}

impl Decoder for GradientDecoder {
    fn seek(&mut self, timestamp: i64) -> Result<(), DecodeError> {
        self.frame = timestamp.clamp(0, self.frames);
        Ok(())
    }

    fn retrieve_video(
        &mut self,
        target: Option<f64>,
        buffer: &mut PictureBuffer,
    ) -> Result<Option<Picture>, DecodeError> {
        if let Some(target) = target {
            let first = (target * FPS as f64).floor() as i64;
            self.frame = self.frame.max(first);
        }
        if self.frame >= self.frames {
            return Ok(None);
        }

        buffer.width = WIDTH;
        buffer.height = HEIGHT;
        buffer.stride = WIDTH as usize * 4;
        buffer.data.resize(buffer.stride * HEIGHT as usize, 0);
        let shift = (self.frame * 4) as usize;
        for (i, pixel) in buffer.data.chunks_exact_mut(4).enumerate() {
            let x = i % WIDTH as usize;
            let y = i / WIDTH as usize;
            pixel[0] = ((x * 4 + shift) % 256) as u8;
            pixel[1] = ((y * 7) % 256) as u8;
            pixel[2] = (shift % 256) as u8;
            pixel[3] = 0xff;
        }

        let picture = Picture::new(self.frame, 1.0 / FPS as f64);
        self.frame += 1;
        Ok(Some(picture))
    }

    fn is_eof(&self) -> bool {
        self.frame >= self.frames
    }
}

/// Produces a sine tone in fixed-length blocks.
struct ToneDecoder {
    position_ms: i64,
    duration_ms: i64,
}

impl Decoder for ToneDecoder {
    fn seek(&mut self, timestamp: i64) -> Result<(), DecodeError> {
        let aligned = timestamp - timestamp.rem_euclid(AUDIO_BLOCK_MS);
        self.position_ms = aligned.clamp(0, self.duration_ms);
        Ok(())
    }

    fn retrieve_audio(
        &mut self,
        params: &AudioParams,
        _target: Option<f64>,
    ) -> Result<Option<SampleBuffer>, DecodeError> {
        if params.bytes_per_sample != 2 {
            return Err(DecodeError::Unsupported(format!(
                "{}-byte samples",
                params.bytes_per_sample
            )));
        }
        if self.position_ms >= self.duration_ms {
            return Ok(None);
        }

        let rate = params.sample_rate as i64;
        let first = self.position_ms * rate / 1000;
        let count = AUDIO_BLOCK_MS * rate / 1000;
        let mut data = Vec::with_capacity(count as usize * params.channels as usize * 2);
        for n in first..first + count {
            let phase = TAU * TONE_HZ * n as f64 / rate as f64;
            let sample = (phase.sin() * i16::MAX as f64 * 0.25) as i16;
            for _ in 0..params.channels {
                data.extend_from_slice(&sample.to_le_bytes());
            }
        }

        let buffer = SampleBuffer::new(self.position_ms, data);
        self.position_ms += AUDIO_BLOCK_MS;
        Ok(Some(buffer))
    }

    fn is_eof(&self) -> bool {
        self.position_ms >= self.duration_ms
    }
}

// =========================================================================
// Simulated audio device
// =========================================================================

struct DeviceState {
    /// Bytes accepted but not yet played
    queued: usize,
    last_drain: Instant,
    suspended: bool,
}

/// Audio device that plays bytes in real time and asks for more every period.
struct SimulatedOutput {
    params: AudioParams,
    capacity: usize,
    state: Arc<Mutex<DeviceState>>,
    requests: Receiver<usize>,
}

impl SimulatedOutput {
    /// Creates the device and starts its request thread.
    fn start(params: AudioParams) -> std::io::Result<Self> {
        let capacity = params.bytes_per_second() * DEVICE_BUFFER_MS / 1000;
        let period_bytes = params.bytes_per_second() * DEVICE_PERIOD.as_millis() as usize / 1000;
        let state = Arc::new(Mutex::new(DeviceState {
            queued: 0,
            last_drain: Instant::now(),
            suspended: true,
        }));
        let (tx, rx) = crossbeam_channel::bounded(4);

        let device_state = Arc::clone(&state);
        std::thread::Builder::new()
            .name("sim-audio-device".into())
            .spawn(move || request_loop(device_state, tx, params, capacity, period_bytes))?;

        Ok(Self {
            params,
            capacity,
            state,
            requests: rx,
        })
    }
}

fn request_loop(
    state: Arc<Mutex<DeviceState>>,
    requests: Sender<usize>,
    params: AudioParams,
    capacity: usize,
    period_bytes: usize,
) {
    let ticker = crossbeam_channel::tick(DEVICE_PERIOD);
    loop {
        if ticker.recv().is_err() {
            break;
        }
        let wanted = {
            let mut state = state.lock();
            drain(&mut state, params);
            if state.suspended {
                continue;
            }
            if state.queued == 0 {
                tracing::debug!("Simulated device ran dry");
            }
            capacity.saturating_sub(state.queued).min(period_bytes)
        };
        if wanted == 0 {
            continue;
        }
        match requests.try_send(wanted) {
            Ok(()) => {}
            Err(crossbeam_channel::TrySendError::Full(_)) => {
                tracing::trace!("Simulated device: request backlog full");
            }
            Err(crossbeam_channel::TrySendError::Disconnected(_)) => break,
        }
    }
    tracing::debug!("Simulated device stopped");
}

fn drain(state: &mut DeviceState, params: AudioParams) {
    let now = Instant::now();
    if !state.suspended {
        let played = now.duration_since(state.last_drain).as_secs_f64()
            * params.bytes_per_second() as f64;
        state.queued = state.queued.saturating_sub(played as usize);
    }
    state.last_drain = now;
}

impl AudioOutput for SimulatedOutput {
    fn params(&self) -> AudioParams {
        self.params
    }

    fn write(&mut self, bytes: &[u8]) -> usize {
        let mut state = self.state.lock();
        drain(&mut state, self.params);
        let accepted = bytes.len().min(self.capacity.saturating_sub(state.queued));
        state.queued += accepted;
        accepted
    }

    fn flush(&mut self) {
        self.state.lock().queued = 0;
    }

    fn suspend(&mut self, suspended: bool) {
        let mut state = self.state.lock();
        drain(&mut state, self.params);
        state.suspended = suspended;
    }

    fn data_length_required(&self) -> usize {
        let mut state = self.state.lock();
        drain(&mut state, self.params);
        self.capacity.saturating_sub(state.queued)
    }

    fn buffered_bytes(&self) -> usize {
        let mut state = self.state.lock();
        drain(&mut state, self.params);
        state.queued
    }

    fn data_requests(&self) -> Option<Receiver<usize>> {
        Some(self.requests.clone())
    }
}

// =========================================================================
// Playback loop
// =========================================================================

fn main() -> ExitCode {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("overlay_player_core=info".parse().unwrap())
                .add_directive("overlay_player_demo=debug".parse().unwrap()),
        )
        .init();

    let options = match Options::from_args() {
        Ok(options) => options,
        Err(e) => {
            tracing::error!("{}", e);
            return ExitCode::FAILURE;
        }
    };

    match run(&options) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(options: &Options) -> Result<(), Box<dyn std::error::Error>> {
    let output = SimulatedOutput::start(AudioParams::default())?;
    let timer = Arc::new(DeadlineTimer::new());
    let mut player = CorePlayer::new(
        PlayerConfig::default(),
        Arc::new(MonotonicTime::new()),
        Arc::clone(&timer) as Arc<dyn Timer>,
    )
    .with_audio_output(Box::new(output));

    let caps = player.open(Arc::new(SyntheticContainer {
        duration_ms: options.seconds * 1000,
    }))?;
    tracing::info!(
        "Synthetic stream: audio={} video={} duration={:?}",
        caps.has_audio,
        caps.has_video,
        caps.duration
    );

    if !player.play() {
        return Err("playback failed to start".into());
    }

    let started = Instant::now();
    let mut last_report = Instant::now();
    let mut seek_done = options.seek_ms.is_none();
    let mut paused_since: Option<Instant> = None;
    let mut pause_done = options.pause_at_ms.is_none();
    let mut checksum: u64 = 0;

    loop {
        if let Some(handle) = timer.wait_timeout(Duration::from_millis(50)) {
            match player.on_timer(handle) {
                Tick::Presented(picture) => {
                    if let Some(buffer) = player.lock_picture(&picture) {
                        let sum: u64 = buffer.data.iter().map(|b| *b as u64).sum();
                        checksum = checksum.wrapping_add(sum);
                    }
                }
                Tick::Finished => break,
                Tick::Retry | Tick::Ignored => {}
            }
        }

        let elapsed_ms = started.elapsed().as_millis() as i64;
        if !pause_done && options.pause_at_ms.is_some_and(|at| elapsed_ms >= at) {
            tracing::info!("Pausing for one second");
            player.toggle_pause();
            paused_since = Some(Instant::now());
            pause_done = true;
        }
        if paused_since.is_some_and(|since| since.elapsed() >= Duration::from_secs(1)) {
            tracing::info!("Resuming");
            player.toggle_pause();
            paused_since = None;
        }
        if !seek_done && elapsed_ms >= options.seconds * 1000 / 3 {
            if let Some(target) = options.seek_ms {
                tracing::info!("Seeking to {} ms", target);
                player.seek(target);
            }
            seek_done = true;
        }

        if last_report.elapsed() >= Duration::from_secs(1) {
            let snapshot = player.sync_metrics_snapshot();
            tracing::info!(
                "position={:.3}s {} | presented={} dropped={} audio={}B underruns={}",
                player.position().unwrap_or(f64::NAN),
                snapshot,
                snapshot.frames_presented,
                snapshot.frames_dropped,
                snapshot.audio_bytes_written,
                snapshot.audio_underruns
            );
            last_report = Instant::now();
        }
    }

    player.sync_metrics().log_status();
    let snapshot = player.sync_metrics_snapshot();
    tracing::info!("{}", snapshot.quality_summary());
    tracing::debug!("Picture checksum {:#x}", checksum);
    player.stop();
    Ok(())
}
