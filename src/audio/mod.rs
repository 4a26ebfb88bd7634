//! Audio module for clipplayer
//!
//! The whole audio track of a media is decoded into memory once at open time
//! and handed to an [`AudioTrack`], which plays it through a source voice
//! created by an [`AudioEngine`]. When no engine is available the track is
//! `Unavailable` and every playback call is a no-op, so video keeps playing
//! silently.

mod cpal_output;
mod loader;
mod resample;

pub use cpal_output::CpalEngine;
pub use loader::load_audio_file;

use crate::decoder::MediaService;
use crate::utils::error::{AudioError, LoadError};
use log::{debug, info, warn};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

/// Audio mastering endpoint able to create voices for a given format
pub trait AudioEngine: Send + Sync {
    /// Create a stopped source voice that accepts buffers in `format`
    fn create_source_voice(&self, format: &AudioFormat) -> Result<Box<dyn SourceVoice>, AudioError>;
}

/// A single playback voice
///
/// A voice plays one submitted buffer from a start frame until its end. It
/// starts stopped; `stop` keeps the play cursor, `flush` discards the
/// submitted buffer.
pub trait SourceVoice: Send {
    /// Queue `samples` (interleaved, in the voice's format) starting at `start_frame`
    fn submit(&mut self, samples: Arc<[f32]>, start_frame: usize) -> Result<(), AudioError>;

    fn start(&mut self) -> Result<(), AudioError>;

    fn stop(&mut self) -> Result<(), AudioError>;

    fn flush(&mut self) -> Result<(), AudioError>;

    /// Output gain, 0.0 (silent) to 1.0 (unity)
    fn set_volume(&mut self, volume: f32) -> Result<(), AudioError>;

    /// Frame index of the play cursor within the submitted buffer
    fn position_frames(&self) -> usize;

    /// Format the voice wants buffers in, when it differs from the one it was
    /// created for
    fn output_format(&self) -> Option<AudioFormat> {
        None
    }
}

/// Audio format specification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AudioFormat {
    /// Sample rate in Hz
    pub sample_rate: u32,

    /// Number of interleaved channels
    pub channels: u16,

    /// Sample format
    pub sample_format: SampleFormat,
}

impl Default for AudioFormat {
    fn default() -> Self {
        Self {
            sample_rate: 48000,
            channels: 2,
            sample_format: SampleFormat::F32,
        }
    }
}

impl AudioFormat {
    /// Bit depth of one sample
    pub fn bits_per_sample(&self) -> u32 {
        self.sample_format.bits()
    }

    /// Bytes in one frame (one sample per channel)
    pub fn bytes_per_frame(&self) -> usize {
        self.channels as usize * self.bits_per_sample() as usize / 8
    }

    /// Frame index at `position`
    pub fn frames_at(&self, position: Duration) -> usize {
        (position.as_secs_f64() * f64::from(self.sample_rate)).round() as usize
    }

    /// Playing time of `frames` frames
    pub fn duration_of(&self, frames: usize) -> Duration {
        if self.sample_rate == 0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(frames as f64 / f64::from(self.sample_rate))
    }
}

/// Audio sample format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SampleFormat {
    /// 8-bit unsigned integer
    U8,

    /// 16-bit signed integer
    I16,

    /// 32-bit signed integer
    I32,

    /// 32-bit floating point
    F32,

    /// 64-bit floating point
    F64,
}

impl SampleFormat {
    pub fn bits(&self) -> u32 {
        match self {
            Self::U8 => 8,
            Self::I16 => 16,
            Self::I32 | Self::F32 => 32,
            Self::F64 => 64,
        }
    }
}

/// A fully decoded audio payload
///
/// Samples are interleaved f32; the format always reports `SampleFormat::F32`.
#[derive(Debug, Clone)]
pub struct AudioBuffer {
    samples: Arc<[f32]>,
    format: AudioFormat,
}

impl AudioBuffer {
    pub fn new(samples: Vec<f32>, format: AudioFormat) -> Self {
        Self {
            samples: samples.into(),
            format: AudioFormat {
                sample_format: SampleFormat::F32,
                ..format
            },
        }
    }

    pub fn format(&self) -> &AudioFormat {
        &self.format
    }

    pub fn samples(&self) -> &Arc<[f32]> {
        &self.samples
    }

    /// The payload as an opaque byte sequence
    pub fn as_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.samples)
    }

    /// Number of frames (samples per channel)
    pub fn frames(&self) -> usize {
        match self.format.channels {
            0 => 0,
            channels => self.samples.len() / channels as usize,
        }
    }

    pub fn duration(&self) -> Duration {
        self.format.duration_of(self.frames())
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// This payload at `format`'s rate and channel count
    pub fn converted_to(&self, format: &AudioFormat) -> Result<AudioBuffer, LoadError> {
        let from = (self.format.channels, self.format.sample_rate);
        let to = (format.channels, format.sample_rate);
        if from == to {
            return Ok(self.clone());
        }
        info!("Converting audio {} Hz/{} ch to {} Hz/{} ch", from.1, from.0, to.1, to.0);
        let samples = resample::convert_interleaved(&self.samples, from, to)?;
        Ok(AudioBuffer::new(samples, *format))
    }
}

/// Outcome of binding a track to an engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackStatus {
    Ready,
    Unavailable,
}

/// The audio side of a playback session
///
/// Owns the decoded payload exclusively once initialized. Every playback
/// call is a no-op while the track is `Unavailable`; voice failures are
/// logged rather than returned because audio never fails a session.
pub struct AudioTrack {
    buffer: Option<AudioBuffer>,
    voice: Option<Box<dyn SourceVoice>>,
    volume: f32,
    muted: bool,
    running: bool,
}

impl AudioTrack {
    /// An unbound track that will apply `volume` and `muted` once initialized
    pub fn new(volume: f32, muted: bool) -> Self {
        Self {
            buffer: None,
            voice: None,
            volume: volume.clamp(0.0, 1.0),
            muted,
            running: false,
        }
    }

    /// Read the entire audio stream of `source` into memory
    ///
    /// Blocking; intended for short-form media only.
    pub fn load(service: &dyn MediaService, source: &str) -> Result<AudioBuffer, LoadError> {
        let buffer = service.load_audio(source)?;
        info!(
            "Loaded audio: {} frames, {} Hz, {} channels ({:.2}s)",
            buffer.frames(),
            buffer.format().sample_rate,
            buffer.format().channels,
            buffer.duration().as_secs_f64()
        );
        Ok(buffer)
    }

    /// Bind `buffer` to a voice of `engine`
    ///
    /// Without an engine, or when the engine refuses the format, the track
    /// becomes `Unavailable` and the buffer is dropped.
    pub fn initialize(&mut self, engine: Option<&dyn AudioEngine>, buffer: AudioBuffer) -> TrackStatus {
        self.release();

        let Some(engine) = engine else {
            warn!("No audio engine, continuing without sound");
            return TrackStatus::Unavailable;
        };

        match engine.create_source_voice(buffer.format()) {
            Ok(mut voice) => {
                let buffer = match voice.output_format() {
                    Some(output) => match buffer.converted_to(&output) {
                        Ok(converted) => converted,
                        Err(e) => {
                            warn!("Audio conversion failed, continuing without sound: {}", e);
                            return TrackStatus::Unavailable;
                        }
                    },
                    None => buffer,
                };
                if let Err(e) = voice.set_volume(self.effective_volume()) {
                    warn!("Failed to set initial volume: {}", e);
                }
                self.voice = Some(voice);
                self.buffer = Some(buffer);
                TrackStatus::Ready
            }
            Err(e) => {
                warn!("Audio unavailable, continuing without sound: {}", e);
                TrackStatus::Unavailable
            }
        }
    }

    pub fn status(&self) -> TrackStatus {
        if self.voice.is_some() {
            TrackStatus::Ready
        } else {
            TrackStatus::Unavailable
        }
    }

    /// Submit the buffer and start the voice
    ///
    /// Always interrupts: a playing voice is stopped and flushed first.
    /// `from_start == false` continues from the current cursor.
    pub fn play(&mut self, from_start: bool) {
        let Some(voice) = self.voice.as_mut() else { return };
        let Some(buffer) = self.buffer.as_ref() else { return };

        let start_frame = if from_start { 0 } else { voice.position_frames() };
        let result = voice
            .stop()
            .and_then(|_| voice.flush())
            .and_then(|_| voice.submit(Arc::clone(buffer.samples()), start_frame))
            .and_then(|_| voice.start());

        match result {
            Ok(()) => self.running = true,
            Err(e) => warn!("Audio play failed: {}", e),
        }
    }

    /// Stop the voice, keeping its position
    pub fn pause(&mut self) {
        let Some(voice) = self.voice.as_mut() else { return };
        if let Err(e) = voice.stop() {
            warn!("Audio pause failed: {}", e);
        }
        self.running = false;
    }

    /// Restart the voice where it was paused
    pub fn resume(&mut self) {
        let Some(voice) = self.voice.as_mut() else { return };
        match voice.start() {
            Ok(()) => self.running = true,
            Err(e) => warn!("Audio resume failed: {}", e),
        }
    }

    /// Stop the voice and discard what it had queued
    pub fn stop(&mut self) {
        let Some(voice) = self.voice.as_mut() else { return };
        if let Err(e) = voice.stop().and_then(|_| voice.flush()) {
            warn!("Audio stop failed: {}", e);
        }
        self.running = false;
    }

    /// Move the play cursor to `position`, keeping the running/paused state
    pub fn seek(&mut self, position: Duration) {
        let Some(voice) = self.voice.as_mut() else { return };
        let Some(buffer) = self.buffer.as_ref() else { return };

        let frame = buffer.format().frames_at(position).min(buffer.frames());
        debug!("Audio seek to frame {}", frame);

        let mut result = voice
            .stop()
            .and_then(|_| voice.flush())
            .and_then(|_| voice.submit(Arc::clone(buffer.samples()), frame));
        if self.running {
            result = result.and_then(|_| voice.start());
        }
        if let Err(e) = result {
            warn!("Audio seek failed: {}", e);
        }
    }

    /// Set the output level, clamped to [0, 1]
    pub fn set_volume(&mut self, volume: f32) {
        if self.voice.is_none() {
            return;
        }
        self.volume = volume.clamp(0.0, 1.0);
        self.apply_volume();
    }

    /// Silence the output (volume 0)
    pub fn mute(&mut self) {
        if self.voice.is_none() {
            return;
        }
        self.muted = true;
        self.apply_volume();
    }

    /// Restore the output at full volume
    pub fn unmute(&mut self) {
        if self.voice.is_none() {
            return;
        }
        self.muted = false;
        self.volume = 1.0;
        self.apply_volume();
    }

    pub fn toggle_mute(&mut self) {
        if self.muted {
            self.unmute();
        } else {
            self.mute();
        }
    }

    pub fn volume(&self) -> f32 {
        self.volume
    }

    pub fn is_muted(&self) -> bool {
        self.muted
    }

    /// Drop the voice and the payload
    pub fn release(&mut self) {
        self.stop();
        self.voice = None;
        self.buffer = None;
    }

    fn effective_volume(&self) -> f32 {
        if self.muted {
            0.0
        } else {
            self.volume
        }
    }

    fn apply_volume(&mut self) {
        let volume = self.effective_volume();
        if let Some(voice) = self.voice.as_mut() {
            if let Err(e) = voice.set_volume(volume) {
                warn!("Failed to set volume: {}", e);
            }
        }
    }
}
