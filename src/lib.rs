//! clipplayer: a desktop media-playback core
//!
//! Decodes video frames asynchronously, renders them scaled to fit a window
//! surface and plays the audio track alongside, all under one play/pause
//! state owned by [`player::PlaybackController`].

pub mod audio;
pub mod decoder;
pub mod player;
pub mod renderer;
pub mod utils;

pub use player::{PlaybackController, PlaybackState, PlayerEvent};
pub use utils::error::{PlayerError, Result};
