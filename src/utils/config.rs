//! Player settings
//!
//! Settings come from `config.toml` in the user config directory (or a file
//! given on the command line), then `CLIPPLAYER_*` environment variables.
//! Missing keys keep their defaults.

use crate::renderer::Color;
use crate::utils::error::{IntoPlayerError, PlayerError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;

const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Every section of the settings file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub window: WindowConfig,
    pub decoder: DecoderConfig,
    pub audio: AudioConfig,
    pub renderer: RendererConfig,
    pub general: GeneralConfig,
}

/// `[window]`: the shell window opened by the binary
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WindowConfig {
    pub width: u32,
    pub height: u32,
    pub title: String,
}

/// `[decoder]`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DecoderConfig {
    /// Upper bound on threads in the decode completion pool
    pub decode_threads: usize,

    /// FFmpeg's own log level (quiet, error, warning, info, debug)
    pub ffmpeg_log_level: String,
}

/// `[audio]`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    /// When false no output device is opened and playback is silent
    pub enabled: bool,

    /// Starting gain, 0.0 to 1.0
    pub volume: f32,

    pub muted: bool,
}

/// `[renderer]`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RendererConfig {
    /// Hex color filling the letterbox bars
    pub background: String,

    pub vsync: bool,

    /// Accept a software rasterizer when no GPU adapter is available
    pub allow_software_fallback: bool,
}

/// `[general]`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// One of trace, debug, info, warn, error
    pub log_level: String,

    /// Arrow-key seek step in seconds
    pub seek_step_secs: u64,
}

impl Default for WindowConfig {
    fn default() -> Self {
        WindowConfig {
            width: 1280,
            height: 720,
            title: String::from("clipplayer"),
        }
    }
}

impl Default for DecoderConfig {
    fn default() -> Self {
        DecoderConfig {
            decode_threads: 4,
            ffmpeg_log_level: String::from("warning"),
        }
    }
}

impl Default for AudioConfig {
    fn default() -> Self {
        AudioConfig { enabled: true, volume: 1.0, muted: false }
    }
}

impl Default for RendererConfig {
    fn default() -> Self {
        RendererConfig {
            background: String::from("#FFFFFF"),
            vsync: true,
            allow_software_fallback: true,
        }
    }
}

impl Default for GeneralConfig {
    fn default() -> Self {
        GeneralConfig {
            log_level: String::from("info"),
            seek_step_secs: 10,
        }
    }
}

impl Config {
    /// Defaults, overlaid by the user's `config.toml` when present, then by
    /// `CLIPPLAYER_*` variables
    pub fn load() -> Result<Self> {
        let base = match Self::user_config_path() {
            Some(path) if path.exists() => Self::read_file(&path)?,
            _ => Self::default(),
        };
        base.finish_loading()
    }

    /// Like [`Config::load`] but reads `path` instead of the user file
    pub fn load_from(path: &Path) -> Result<Self> {
        Self::read_file(path)?.finish_loading()
    }

    fn finish_loading(mut self) -> Result<Self> {
        self.apply_env_overrides()?;
        self.validate()?;
        Ok(self)
    }

    /// Writes the settings to the user's `config.toml`
    pub fn save(&self) -> Result<()> {
        match Self::user_config_path() {
            Some(path) => self.save_to(&path),
            None => Err(PlayerError::Config("No user config directory on this platform".to_string())),
        }
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir).config_err("Failed to create config directory")?;
        }
        let text = toml::to_string_pretty(self).config_err("Failed to serialize config")?;
        std::fs::write(path, text).config_err("Failed to write config file")
    }

    fn read_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).config_err("Failed to read config file")?;
        toml::from_str(&text).config_err("Failed to parse config file")
    }

    fn apply_env_overrides(&mut self) -> Result<()> {
        env_override("CLIPPLAYER_WINDOW_WIDTH", &mut self.window.width)?;
        env_override("CLIPPLAYER_WINDOW_HEIGHT", &mut self.window.height)?;
        env_override("CLIPPLAYER_AUDIO_VOLUME", &mut self.audio.volume)?;
        env_override("CLIPPLAYER_LOG_LEVEL", &mut self.general.log_level)?;
        Ok(())
    }

    /// Rejects settings the player cannot start with
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(PlayerError::Config(msg));

        if self.window.width == 0 || self.window.height == 0 {
            return invalid(format!(
                "Window size {}x{} has a zero dimension",
                self.window.width, self.window.height
            ));
        }
        if !(0.0..=1.0).contains(&self.audio.volume) {
            return invalid(format!("Volume {} is outside 0.0..=1.0", self.audio.volume));
        }
        if self.decoder.decode_threads == 0 {
            return invalid("decode_threads must be at least 1".to_string());
        }
        if Color::from_hex(&self.renderer.background).is_err() {
            return invalid(format!("Background '{}' is not a #RRGGBB color", self.renderer.background));
        }
        if !LOG_LEVELS.contains(&self.general.log_level.as_str()) {
            return invalid(format!(
                "Log level '{}' is not one of {}",
                self.general.log_level,
                LOG_LEVELS.join(", ")
            ));
        }
        Ok(())
    }

    /// `<config dir>/clipplayer/config.toml`
    pub fn user_config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("clipplayer").join("config.toml"))
    }
}

/// Replaces `slot` with the parsed value of `var` when it is set
fn env_override<T: FromStr>(var: &str, slot: &mut T) -> Result<()> {
    if let Ok(raw) = std::env::var(var) {
        *slot = raw
            .parse()
            .map_err(|_| PlayerError::Config(format!("{} has unparseable value '{}'", var, raw)))?;
    }
    Ok(())
}
