//! Error types for clipplayer
//!
//! This module defines every error kind used throughout the crate.
//! We use thiserror for the library error types and anyhow only at the
//! binary's top level.

use thiserror::Error;

use crate::player::PlaybackState;

/// Main error type for clipplayer
#[derive(Error, Debug)]
pub enum PlayerError {
    /// Opening media failed; the session stays Stopped
    #[error("Open failed: {0}")]
    OpenFailed(#[source] DecodeError),

    /// No usable audio engine; playback continues silently
    #[error("Audio unavailable: {0}")]
    AudioUnavailable(#[from] AudioError),

    /// Mid-stream decode failure
    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    /// The presentation surface could not be created
    #[error("Renderer initialization failed: {0}")]
    RenderInit(String),

    /// Upload or present failed
    #[error("Renderer error: {0}")]
    Render(String),

    /// Operation not valid in the current playback state
    #[error("Invalid state: cannot {operation} while {state:?}")]
    InvalidState {
        operation: &'static str,
        state: PlaybackState,
    },

    /// Duration or position query failed
    #[error("Query error: {0}")]
    Query(#[from] QueryError),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// File I/O errors
    #[error("File error: {0}")]
    FileIO(#[from] std::io::Error),

    /// Invalid input errors
    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

/// Errors raised by the media decoding service
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// The media could not be opened
    #[error("source not found: {0}")]
    SourceNotFound(String),

    /// No 32-bit packed RGB output could be negotiated, or no video stream
    #[error("unsupported format: {0}")]
    UnsupportedFormat(String),

    /// A request was made while a previous one is still outstanding
    #[error("a sample request is already outstanding")]
    RequestPending,

    /// The decoder has been closed
    #[error("decoder is closed")]
    Closed,

    /// Any other backend failure
    #[error("{0}")]
    Backend(String),
}

/// Errors raised by the audio engine or while loading an audio payload
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AudioError {
    /// No output device
    #[error("no audio output device")]
    NoDevice,

    /// The device cannot play the requested format
    #[error("unsupported audio format: {0}")]
    UnsupportedFormat(String),

    /// Stream creation or control failed
    #[error("audio stream error: {0}")]
    Stream(String),

    /// The media has no decodable audio track
    #[error("failed to load audio: {0}")]
    Load(String),
}

/// Errors loading the audio payload share the audio taxonomy
pub type LoadError = AudioError;

/// Errors answering duration/position queries
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryError {
    /// No media is open
    #[error("no media is open")]
    NoMedia,

    /// The media does not report this value
    #[error("value is unknown for this media")]
    Unknown,
}

impl From<ffmpeg_next::Error> for DecodeError {
    fn from(err: ffmpeg_next::Error) -> Self {
        DecodeError::Backend(format!("FFmpeg error: {}", err))
    }
}

impl From<ffmpeg_next::Error> for AudioError {
    fn from(err: ffmpeg_next::Error) -> Self {
        AudioError::Load(format!("FFmpeg error: {}", err))
    }
}

/// Convenience type alias for Results in clipplayer
pub type Result<T> = std::result::Result<T, PlayerError>;

/// Extension trait for converting other errors to PlayerError
pub trait IntoPlayerError<T> {
    /// Convert this error into a PlayerError with the given context
    fn renderer_err(self, context: &str) -> Result<T>;
    fn render_init_err(self, context: &str) -> Result<T>;
    fn config_err(self, context: &str) -> Result<T>;
}

impl<T, E: std::fmt::Display> IntoPlayerError<T> for std::result::Result<T, E> {
    fn renderer_err(self, context: &str) -> Result<T> {
        self.map_err(|e| PlayerError::Render(format!("{}: {}", context, e)))
    }

    fn render_init_err(self, context: &str) -> Result<T> {
        self.map_err(|e| PlayerError::RenderInit(format!("{}: {}", context, e)))
    }

    fn config_err(self, context: &str) -> Result<T> {
        self.map_err(|e| PlayerError::Config(format!("{}: {}", context, e)))
    }
}

/// Audio-side counterpart of [`IntoPlayerError`]
pub trait IntoAudioError<T> {
    fn stream_err(self, context: &str) -> std::result::Result<T, AudioError>;
}

impl<T, E: std::fmt::Display> IntoAudioError<T> for std::result::Result<T, E> {
    fn stream_err(self, context: &str) -> std::result::Result<T, AudioError> {
        self.map_err(|e| AudioError::Stream(format!("{}: {}", context, e)))
    }
}
