//! FFmpeg-based decoding service for clipplayer
//!
//! [`FfmpegService`] is started once per process. It owns the thread pool on
//! which decode jobs run and completions are delivered; every
//! [`FfmpegFrameDecoder`] it opens schedules at most one job at a time on
//! that pool.

use crate::audio::{load_audio_file, AudioBuffer};
use crate::decoder::{
    probe_input, DecodedFrame, FrameDecoder, MediaService, MediaSource, SampleEvent, SampleSink,
    BYTES_PER_PIXEL,
};
use crate::utils::config::DecoderConfig;
use crate::utils::error::{DecodeError, LoadError, QueryError};
use crate::utils::timestamp_to_duration;
use ffmpeg_next as ffmpeg;
use ffmpeg_next::format::Pixel;
use ffmpeg_next::software::scaling;
use log::{debug, info, warn};
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Result of the one-time FFmpeg global initialization
static FFMPEG_INIT: OnceCell<Result<(), String>> = OnceCell::new();

/// How long shutdown waits for decode jobs still running
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(2);

/// Pool on which decode jobs run
struct DecodePool {
    handle: tokio::runtime::Handle,
    running: AtomicBool,
}

impl DecodePool {
    fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }
}

/// Process-scoped FFmpeg media service
pub struct FfmpegService {
    pool: Arc<DecodePool>,
    runtime: Mutex<Option<tokio::runtime::Runtime>>,
}

impl FfmpegService {
    /// Initialize FFmpeg and start the decode pool
    ///
    /// FFmpeg's global initialization runs at most once per process, even if
    /// the service is started again after a shutdown.
    pub fn startup(config: &DecoderConfig) -> Result<Arc<Self>, DecodeError> {
        FFMPEG_INIT
            .get_or_init(|| ffmpeg::init().map_err(|e| e.to_string()))
            .clone()
            .map_err(|e| DecodeError::Backend(format!("FFmpeg initialization failed: {}", e)))?;
        ffmpeg::log::set_level(ffmpeg_log_level(&config.ffmpeg_log_level));

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .max_blocking_threads(config.decode_threads.max(1))
            .thread_name("clipplayer-decode")
            .enable_all()
            .build()
            .map_err(|e| DecodeError::Backend(format!("Failed to start decode pool: {}", e)))?;

        info!("Media service started ({} decode threads)", config.decode_threads);

        Ok(Arc::new(Self {
            pool: Arc::new(DecodePool {
                handle: runtime.handle().clone(),
                running: AtomicBool::new(true),
            }),
            runtime: Mutex::new(Some(runtime)),
        }))
    }

    /// Stop the decode pool
    ///
    /// Decoders opened from this service fail with `Closed` afterwards. Jobs
    /// still running get a bounded grace period.
    pub fn shutdown(&self) {
        self.pool.running.store(false, Ordering::Release);
        if let Some(runtime) = self.runtime.lock().take() {
            runtime.shutdown_timeout(SHUTDOWN_TIMEOUT);
            info!("Media service stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.pool.is_running()
    }
}

impl Drop for FfmpegService {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl MediaService for FfmpegService {
    fn open(
        &self,
        source: &str,
        sink: Arc<dyn SampleSink>,
    ) -> Result<Box<dyn FrameDecoder>, DecodeError> {
        if !self.pool.is_running() {
            return Err(DecodeError::Closed);
        }
        let decoder = FfmpegFrameDecoder::open(source, sink, Arc::clone(&self.pool))?;
        Ok(Box::new(decoder))
    }

    fn load_audio(&self, source: &str) -> Result<AudioBuffer, LoadError> {
        load_audio_file(source)
    }

    fn probe(&self, source: &str) -> Result<MediaSource, DecodeError> {
        let input = open_input(source)?;
        probe_input(&input, source)
    }
}

/// FFmpeg state touched by decode jobs and seeks
struct DecodeState {
    input: ffmpeg::format::context::Input,
    decoder: ffmpeg::decoder::Video,
    scaler: Option<scaling::Context>,
    stream_index: usize,
    time_base: ffmpeg::Rational,
}

// SAFETY: the FFmpeg contexts are only ever used through the owning mutex,
// so no two threads touch them at once.
unsafe impl Send for DecodeState {}

impl DecodeState {
    /// Decode until one frame or the end of the stream
    fn next_sample(&mut self, ticket: u64) -> Result<SampleEvent, DecodeError> {
        let mut frame = ffmpeg::frame::Video::empty();
        loop {
            match self.decoder.receive_frame(&mut frame) {
                Ok(()) => {
                    let decoded = self.convert(&frame)?;
                    return Ok(SampleEvent::frame(ticket, self.stream_index, decoded));
                }
                Err(ffmpeg::Error::Eof) => {
                    return Ok(SampleEvent::end_of_stream(ticket, self.stream_index));
                }
                Err(ffmpeg::Error::Other { errno }) if errno == ffmpeg::util::error::EAGAIN => {
                    self.feed()?;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Send the next packet of our stream, or end-of-stream once the input is drained
    fn feed(&mut self) -> Result<(), DecodeError> {
        loop {
            let next = self
                .input
                .packets()
                .next()
                .map(|(stream, packet)| (stream.index(), packet));

            match next {
                Some((index, packet)) if index == self.stream_index => {
                    match self.decoder.send_packet(&packet) {
                        Ok(()) => return Ok(()),
                        Err(ffmpeg::Error::InvalidData) => {
                            debug!("Skipping corrupt video packet");
                        }
                        Err(e) => return Err(e.into()),
                    }
                }
                Some(_) => {}
                None => {
                    self.decoder.send_eof()?;
                    return Ok(());
                }
            }
        }
    }

    /// Convert to tightly packed BGRA
    fn convert(&mut self, frame: &ffmpeg::frame::Video) -> Result<DecodedFrame, DecodeError> {
        let stale = match &self.scaler {
            Some(scaler) => {
                let input = scaler.input();
                input.format != frame.format()
                    || input.width != frame.width()
                    || input.height != frame.height()
            }
            None => true,
        };
        if stale {
            self.scaler = Some(bgra_scaler(frame.format(), frame.width(), frame.height())?);
        }

        let mut bgra = ffmpeg::frame::Video::empty();
        if let Some(scaler) = self.scaler.as_mut() {
            scaler.run(frame, &mut bgra)?;
        }

        let timestamp = frame
            .timestamp()
            .map(|ts| timestamp_to_duration(ts, self.time_base.numerator(), self.time_base.denominator()))
            .unwrap_or_default();

        let data = pack_rows(bgra.data(0), bgra.stride(0), bgra.width(), bgra.height());
        Ok(DecodedFrame::packed(data, bgra.width(), bgra.height(), timestamp))
    }
}

/// Frame decoder over one FFmpeg input
pub struct FfmpegFrameDecoder {
    media: MediaSource,
    state: Arc<Mutex<DecodeState>>,
    sink: Option<Arc<dyn SampleSink>>,
    pool: Arc<DecodePool>,
    in_flight: Arc<AtomicBool>,
    closed: Arc<AtomicBool>,
}

impl FfmpegFrameDecoder {
    fn open(
        source: &str,
        sink: Arc<dyn SampleSink>,
        pool: Arc<DecodePool>,
    ) -> Result<Self, DecodeError> {
        let input = open_input(source)?;
        let media = probe_input(&input, source)?;

        let (stream_index, time_base, decoder) = {
            let stream = input
                .streams()
                .best(ffmpeg::media::Type::Video)
                .ok_or_else(|| DecodeError::UnsupportedFormat(format!("{}: no video stream", source)))?;
            let context = ffmpeg::codec::context::Context::from_parameters(stream.parameters())?;
            let decoder = context
                .decoder()
                .video()
                .map_err(|e| DecodeError::UnsupportedFormat(format!("{}: {}", source, e)))?;
            (stream.index(), stream.time_base(), decoder)
        };

        // Negotiate BGRA now when the codec already knows its pixel format;
        // otherwise the first frame does.
        let scaler = match decoder.format() {
            Pixel::None => None,
            format => Some(bgra_scaler(format, decoder.width(), decoder.height())?),
        };

        info!(
            "Opened {} ({}x{}, {:?})",
            source, media.width, media.height, media.duration
        );

        Ok(Self {
            media,
            state: Arc::new(Mutex::new(DecodeState {
                input,
                decoder,
                scaler,
                stream_index,
                time_base,
            })),
            sink: Some(sink),
            pool,
            in_flight: Arc::new(AtomicBool::new(false)),
            closed: Arc::new(AtomicBool::new(false)),
        })
    }
}

impl FrameDecoder for FfmpegFrameDecoder {
    fn media(&self) -> &MediaSource {
        &self.media
    }

    fn request_next_sample(&mut self, ticket: u64) -> Result<(), DecodeError> {
        let sink = match &self.sink {
            Some(sink) if !self.closed.load(Ordering::Acquire) => Arc::clone(sink),
            _ => return Err(DecodeError::Closed),
        };
        if !self.pool.is_running() {
            return Err(DecodeError::Closed);
        }
        if self.in_flight.swap(true, Ordering::AcqRel) {
            return Err(DecodeError::RequestPending);
        }

        let state = Arc::clone(&self.state);
        let in_flight = Arc::clone(&self.in_flight);
        let closed = Arc::clone(&self.closed);

        self.pool.handle.spawn_blocking(move || {
            let result = state.lock().next_sample(ticket);
            // Cleared before delivery so the sink may request again from inside the callback.
            in_flight.store(false, Ordering::Release);

            if closed.load(Ordering::Acquire) {
                debug!("Decoder closed, dropping completion for ticket {}", ticket);
                return;
            }
            sink.on_sample_ready(result);
        });

        Ok(())
    }

    fn duration(&self) -> Result<Duration, QueryError> {
        self.media.duration.ok_or(QueryError::Unknown)
    }

    fn seek(&mut self, position: Duration) -> Result<(), DecodeError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(DecodeError::Closed);
        }
        let micros = i64::try_from(position.as_micros()).unwrap_or(i64::MAX);

        let mut state = self.state.lock();
        state.input.seek(micros, ..micros)?;
        state.decoder.flush();
        debug!("Seeked to {:?}", position);
        Ok(())
    }

    fn close(&mut self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.sink = None;
        if self.in_flight.load(Ordering::Acquire) {
            debug!("Closing {} with a request in flight", self.media.source);
        }
    }
}

impl Drop for FfmpegFrameDecoder {
    fn drop(&mut self) {
        self.close();
    }
}

fn open_input(source: &str) -> Result<ffmpeg::format::context::Input, DecodeError> {
    ffmpeg::format::input(&source)
        .map_err(|e| DecodeError::SourceNotFound(format!("{}: {}", source, e)))
}

fn bgra_scaler(format: Pixel, width: u32, height: u32) -> Result<scaling::Context, DecodeError> {
    scaling::Context::get(
        format,
        width,
        height,
        Pixel::BGRA,
        width,
        height,
        scaling::Flags::BILINEAR,
    )
    .map_err(|e| {
        warn!("No BGRA conversion from {:?}: {}", format, e);
        DecodeError::UnsupportedFormat(format!("cannot convert {:?} to BGRA: {}", format, e))
    })
}

/// Copy `height` rows of `width` BGRA pixels out of a strided plane
fn pack_rows(plane: &[u8], stride: usize, width: u32, height: u32) -> Vec<u8> {
    let row = width as usize * BYTES_PER_PIXEL;
    let mut out = Vec::with_capacity(row * height as usize);
    for y in 0..height as usize {
        let start = y * stride;
        match plane.get(start..start + row) {
            Some(bytes) => out.extend_from_slice(bytes),
            None => break,
        }
    }
    out
}

fn ffmpeg_log_level(name: &str) -> ffmpeg::log::Level {
    use ffmpeg::log::Level;

    match name.to_ascii_lowercase().as_str() {
        "quiet" => Level::Quiet,
        "panic" => Level::Panic,
        "fatal" => Level::Fatal,
        "error" => Level::Error,
        "info" => Level::Info,
        "verbose" => Level::Verbose,
        "debug" => Level::Debug,
        "trace" => Level::Trace,
        _ => Level::Warning,
    }
}
