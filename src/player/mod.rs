//! Playback module for clipplayer
//!
//! This module holds the [`PlaybackController`], which opens media, runs the
//! single-flight decode/render pull loop and keeps audio and video in one
//! play/pause state, together with the events it reports to the shell.

mod controller;

pub use controller::PlaybackController;

use crate::decoder::MediaSource;
use crate::utils::config::Config;
use std::fmt;
use std::time::Duration;

/// Playback state of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PlaybackState {
    /// No media, or playback ended
    #[default]
    Stopped,

    /// Media is being opened
    Opening,

    /// The pull loop is running
    Playing,

    /// The pull loop is stalled until resumed
    Paused,
}

impl PlaybackState {
    /// Whether a media session is live
    pub fn is_active(self) -> bool {
        matches!(self, Self::Playing | Self::Paused)
    }
}

impl fmt::Display for PlaybackState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Stopped => "stopped",
            Self::Opening => "opening",
            Self::Playing => "playing",
            Self::Paused => "paused",
        };
        f.write_str(name)
    }
}

/// Session preferences applied on every open
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlayerConfig {
    /// Initial volume (0.0 to 1.0)
    pub initial_volume: f32,

    /// Start muted
    pub muted: bool,
}

impl Default for PlayerConfig {
    fn default() -> Self {
        Self {
            initial_volume: 1.0,
            muted: false,
        }
    }
}

impl From<&Config> for PlayerConfig {
    fn from(config: &Config) -> Self {
        Self {
            initial_volume: config.audio.volume,
            muted: config.audio.muted,
        }
    }
}

/// Counters of the pull loop
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PlaybackStats {
    /// Frames uploaded and presented
    pub frames_rendered: u64,

    /// Completions dropped because they predate a seek or arrived paused
    pub frames_discarded: u64,

    /// Decode requests issued
    pub requests_issued: u64,
}

/// Notifications for the UI shell
#[derive(Debug, Clone, PartialEq)]
pub enum PlayerEvent {
    /// Media opened and playback started
    MediaOpened { media: MediaSource },

    /// Playback state changed
    StateChanged { state: PlaybackState },

    /// A frame was presented
    PositionChanged { position: Duration },

    /// The stream ended, or a mid-stream decode failure ended it
    PlaybackEnded,

    /// A failure with no synchronous caller to report to
    Error { message: String },
}

/// Receiver of player events
pub trait PlayerEventHandler: Send + Sync {
    /// Handle a player event
    fn handle_event(&mut self, event: PlayerEvent);
}
