//! Decoder module for clipplayer
//!
//! This module defines the media decoding service the playback core talks to:
//! opening media, single-flight asynchronous sample delivery, duration and
//! seek queries. The FFmpeg-backed implementation lives in
//! [`ffmpeg_decoder`].

mod ffmpeg_decoder;
mod stream_info;

pub use ffmpeg_decoder::{FfmpegFrameDecoder, FfmpegService};
pub use stream_info::probe_input;
pub(crate) use stream_info::audio_format;

use crate::audio::{AudioBuffer, AudioFormat};
use crate::utils::error::{DecodeError, LoadError, QueryError};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

/// Bytes per pixel of the negotiated output format
pub const BYTES_PER_PIXEL: usize = 4;

/// Process-scoped media decoding service
///
/// Implementations are started once per process and shared by every
/// playback session; a session never starts or stops the service.
pub trait MediaService: Send + Sync {
    /// Open `source` for frame decoding, registering `sink` for completions
    ///
    /// The returned decoder has negotiated 32-bit packed RGB output. The
    /// service keeps `sink` alive until the decoder is closed.
    fn open(
        &self,
        source: &str,
        sink: Arc<dyn SampleSink>,
    ) -> Result<Box<dyn FrameDecoder>, DecodeError>;

    /// Decode the whole audio track of `source` into memory
    fn load_audio(&self, source: &str) -> Result<AudioBuffer, LoadError>;

    /// Read stream metadata without starting a decoder
    fn probe(&self, source: &str) -> Result<MediaSource, DecodeError>;
}

/// An opened video stream with single-flight asynchronous sample delivery
pub trait FrameDecoder: Send {
    /// Metadata negotiated at open time
    fn media(&self) -> &MediaSource;

    /// Schedule decoding of the next frame
    ///
    /// Never blocks, and never calls the sink before returning. The result
    /// arrives later through [`SampleSink::on_sample_ready`] carrying the
    /// same `ticket`. Calling this while a request is outstanding is a
    /// caller error.
    fn request_next_sample(&mut self, ticket: u64) -> Result<(), DecodeError>;

    /// Presentation duration of the media
    fn duration(&self) -> Result<Duration, QueryError>;

    /// Move the decode position; later samples resume from `position`
    fn seek(&mut self, position: Duration) -> Result<(), DecodeError>;

    /// Cancel any outstanding request and release the completion sink
    ///
    /// A completion already running on the pool may still be delivered;
    /// callers must tolerate it.
    fn close(&mut self);
}

/// Receiver of asynchronous decode completions
///
/// Called from a thread pool the caller does not control, possibly
/// concurrently with calls made on the controlling thread.
pub trait SampleSink: Send + Sync {
    fn on_sample_ready(&self, result: Result<SampleEvent, DecodeError>);
}

/// Metadata of an opened media
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MediaSource {
    /// Path or URL the media was opened from
    pub source: String,

    /// Total presentation duration, if the container reports one
    pub duration: Option<Duration>,

    /// Native frame width
    pub width: u32,

    /// Native frame height
    pub height: u32,

    /// Average frame rate, if known
    pub frame_rate: Option<f32>,

    /// Format of the audio track, if the media has one
    pub audio: Option<AudioFormat>,
}

/// A decoded frame in 32-bit packed RGB (BGRA byte order, alpha ignored)
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedFrame {
    /// Pixel rows, `stride` bytes apart
    pub data: Vec<u8>,

    /// Frame width in pixels
    pub width: u32,

    /// Frame height in pixels
    pub height: u32,

    /// Bytes between the starts of consecutive rows
    pub stride: usize,

    /// Presentation timestamp
    pub timestamp: Duration,
}

impl DecodedFrame {
    /// Build a tightly packed frame
    pub fn packed(data: Vec<u8>, width: u32, height: u32, timestamp: Duration) -> Self {
        Self {
            data,
            width,
            height,
            stride: width as usize * BYTES_PER_PIXEL,
            timestamp,
        }
    }

    /// Whether the buffer is large enough for the declared geometry
    pub fn is_well_formed(&self) -> bool {
        if self.width == 0 || self.height == 0 {
            return false;
        }
        let Some(row) = (self.width as usize).checked_mul(BYTES_PER_PIXEL) else {
            return false;
        };
        let needed = self
            .stride
            .checked_mul(self.height as usize - 1)
            .and_then(|rows| rows.checked_add(row));
        self.stride >= row && needed.is_some_and(|needed| self.data.len() >= needed)
    }

    /// Row `y` without stride padding
    pub fn row(&self, y: u32) -> &[u8] {
        let start = y as usize * self.stride;
        &self.data[start..start + self.width as usize * BYTES_PER_PIXEL]
    }
}

/// Flags reported with each completion
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StreamFlags(u32);

impl StreamFlags {
    pub const NONE: Self = Self(0);

    /// No further samples exist
    pub const END_OF_STREAM: Self = Self(1 << 0);

    /// The decoder skipped over a gap; the event carries no frame
    pub const STREAM_TICK: Self = Self(1 << 1);

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    pub const fn is_end_of_stream(self) -> bool {
        self.contains(Self::END_OF_STREAM)
    }
}

/// One completed decode request
#[derive(Debug, Clone)]
pub struct SampleEvent {
    /// Ticket passed to the request this completes
    pub ticket: u64,

    /// Index of the stream the sample came from
    pub stream_index: usize,

    pub flags: StreamFlags,

    /// Presentation timestamp of the sample
    pub timestamp: Duration,

    /// Decoded frame; `None` at end of stream or on a stream tick
    pub frame: Option<DecodedFrame>,
}

impl SampleEvent {
    /// Completion reporting the end of the stream
    pub fn end_of_stream(ticket: u64, stream_index: usize) -> Self {
        Self {
            ticket,
            stream_index,
            flags: StreamFlags::END_OF_STREAM,
            timestamp: Duration::ZERO,
            frame: None,
        }
    }

    /// Completion carrying a decoded frame
    pub fn frame(ticket: u64, stream_index: usize, frame: DecodedFrame) -> Self {
        Self {
            ticket,
            stream_index,
            flags: StreamFlags::NONE,
            timestamp: frame.timestamp,
            frame: Some(frame),
        }
    }
}
