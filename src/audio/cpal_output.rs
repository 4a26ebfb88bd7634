//! CPAL audio engine for clipplayer
//!
//! The mastering endpoint is the default cpal output device. Each source
//! voice owns a dedicated thread holding its cpal stream (streams are not
//! `Send` on every host); the voice controls playback through atomics shared
//! with the stream callback. When the device cannot run the source format the
//! voice reports the format it does run, and the track converts its buffer.

use crate::audio::{AudioEngine, AudioFormat, SampleFormat, SourceVoice};
use crate::utils::error::{AudioError, IntoAudioError};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleRate, StreamConfig};
use crossbeam_channel::{bounded, Sender};
use log::{debug, error, info};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

/// Audio engine backed by the default cpal output device
pub struct CpalEngine {
    device_name: String,
}

impl CpalEngine {
    /// Bind to the default output device
    pub fn new() -> Result<Self, AudioError> {
        let host = cpal::default_host();
        let device = host.default_output_device().ok_or(AudioError::NoDevice)?;
        let device_name = device.name().unwrap_or_else(|_| "unknown".to_string());
        info!("Audio output device: {} ({:?})", device_name, host.id());
        Ok(Self { device_name })
    }

    pub fn device_name(&self) -> &str {
        &self.device_name
    }
}

impl AudioEngine for CpalEngine {
    fn create_source_voice(&self, format: &AudioFormat) -> Result<Box<dyn SourceVoice>, AudioError> {
        let voice = CpalVoice::spawn(*format)?;
        Ok(Box::new(voice))
    }
}

/// Rate and channel count the device stream actually runs at
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct OutputFormat {
    sample_rate: u32,
    channels: u16,
}

/// State shared between a voice and its stream callback
struct VoiceShared {
    /// Buffer in the output format
    samples: Mutex<Arc<[f32]>>,

    /// Next output frame to play
    cursor: AtomicUsize,

    playing: AtomicBool,

    /// f32 gain stored as bits
    volume: AtomicU32,
}

impl VoiceShared {
    fn new() -> Self {
        Self {
            samples: Mutex::new(Arc::from(Vec::new())),
            cursor: AtomicUsize::new(0),
            playing: AtomicBool::new(false),
            volume: AtomicU32::new(1.0f32.to_bits()),
        }
    }

    /// Stream callback body
    fn render(&self, data: &mut [f32], channels: usize) {
        if !self.playing.load(Ordering::Acquire) {
            data.fill(0.0);
            return;
        }
        // Never block the device thread; a submit in progress costs one period of silence.
        let Some(samples) = self.samples.try_lock() else {
            data.fill(0.0);
            return;
        };
        let volume = f32::from_bits(self.volume.load(Ordering::Relaxed));
        let cursor = self.cursor.load(Ordering::Relaxed);
        let frames = fill(data, &samples, cursor, channels, volume);
        self.cursor.store(cursor + frames, Ordering::Relaxed);
    }
}

/// Copy frames from `samples` at `cursor` into `data`, scaled by `volume`,
/// padding with silence; returns the frames consumed
fn fill(data: &mut [f32], samples: &[f32], cursor: usize, channels: usize, volume: f32) -> usize {
    if channels == 0 {
        data.fill(0.0);
        return 0;
    }
    let start = (cursor * channels).min(samples.len());
    let available = samples.len() - start;
    let count = available.min(data.len()) / channels * channels;

    for (out, sample) in data[..count].iter_mut().zip(&samples[start..start + count]) {
        *out = sample * volume;
    }
    data[count..].fill(0.0);
    count / channels
}

/// A source voice playing through its own cpal stream
struct CpalVoice {
    shared: Arc<VoiceShared>,
    source: AudioFormat,
    output: OutputFormat,
    shutdown: Option<Sender<()>>,
    thread: Option<thread::JoinHandle<()>>,
}

impl CpalVoice {
    fn spawn(source: AudioFormat) -> Result<Self, AudioError> {
        let shared = Arc::new(VoiceShared::new());
        let (ready_tx, ready_rx) = bounded::<Result<OutputFormat, AudioError>>(1);
        let (shutdown_tx, shutdown_rx) = bounded::<()>(0);

        let thread_shared = Arc::clone(&shared);
        let thread = thread::Builder::new()
            .name("clipplayer-audio".to_string())
            .spawn(move || {
                let stream = match build_stream(&source, thread_shared) {
                    Ok((stream, output)) => {
                        let _ = ready_tx.send(Ok(output));
                        stream
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                // Parked until the voice drops its sender.
                let _ = shutdown_rx.recv();
                drop(stream);
            })
            .stream_err("Failed to spawn audio thread")?;

        let output = ready_rx
            .recv()
            .map_err(|_| AudioError::Stream("audio thread exited during setup".to_string()))??;

        if output.sample_rate != source.sample_rate || output.channels != source.channels {
            info!(
                "Device runs {} Hz/{} ch for {} Hz/{} ch audio",
                output.sample_rate, output.channels, source.sample_rate, source.channels
            );
        }

        Ok(Self {
            shared,
            source,
            output,
            shutdown: Some(shutdown_tx),
            thread: Some(thread),
        })
    }
}

impl SourceVoice for CpalVoice {
    fn submit(&mut self, samples: Arc<[f32]>, start_frame: usize) -> Result<(), AudioError> {
        let mut guard = self.shared.samples.lock();
        *guard = samples;
        self.shared.cursor.store(start_frame, Ordering::Relaxed);
        Ok(())
    }

    fn start(&mut self) -> Result<(), AudioError> {
        self.shared.playing.store(true, Ordering::Release);
        Ok(())
    }

    fn stop(&mut self) -> Result<(), AudioError> {
        self.shared.playing.store(false, Ordering::Release);
        Ok(())
    }

    fn flush(&mut self) -> Result<(), AudioError> {
        let mut guard = self.shared.samples.lock();
        *guard = Arc::from(Vec::new());
        self.shared.cursor.store(0, Ordering::Relaxed);
        Ok(())
    }

    fn set_volume(&mut self, volume: f32) -> Result<(), AudioError> {
        self.shared
            .volume
            .store(volume.clamp(0.0, 1.0).to_bits(), Ordering::Relaxed);
        Ok(())
    }

    fn position_frames(&self) -> usize {
        self.shared.cursor.load(Ordering::Relaxed)
    }

    fn output_format(&self) -> Option<AudioFormat> {
        let same = self.output.sample_rate == self.source.sample_rate && self.output.channels == self.source.channels;
        (!same).then_some(AudioFormat {
            sample_rate: self.output.sample_rate,
            channels: self.output.channels,
            sample_format: SampleFormat::F32,
        })
    }
}

impl Drop for CpalVoice {
    fn drop(&mut self) {
        self.shared.playing.store(false, Ordering::Release);
        self.shutdown = None;
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
        debug!("Audio voice released");
    }
}

/// Open the default device at the best format for `source` and start an f32 stream
fn build_stream(
    source: &AudioFormat,
    shared: Arc<VoiceShared>,
) -> Result<(cpal::Stream, OutputFormat), AudioError> {
    let host = cpal::default_host();
    let device = host.default_output_device().ok_or(AudioError::NoDevice)?;

    let supported: Vec<(u16, u32, u32)> = device
        .supported_output_configs()
        .stream_err("Failed to query output configs")?
        .filter(|range| range.sample_format() == cpal::SampleFormat::F32)
        .map(|range| (range.channels(), range.min_sample_rate().0, range.max_sample_rate().0))
        .collect();
    let default = device
        .default_output_config()
        .stream_err("Failed to query default output config")?;

    let output = choose_output(
        source,
        &supported,
        OutputFormat {
            sample_rate: default.sample_rate().0,
            channels: default.channels(),
        },
    )
    .ok_or_else(|| {
        AudioError::UnsupportedFormat(format!(
            "device has no f32 output for {} Hz/{} ch",
            source.sample_rate, source.channels
        ))
    })?;

    let config = StreamConfig {
        channels: output.channels,
        sample_rate: SampleRate(output.sample_rate),
        buffer_size: cpal::BufferSize::Default,
    };
    let channels = output.channels as usize;

    let stream = device
        .build_output_stream(
            &config,
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| shared.render(data, channels),
            |err| error!("Audio stream error: {}", err),
            None,
        )
        .stream_err("Failed to create audio stream")?;
    stream.play().stream_err("Failed to start audio stream")?;

    Ok((stream, output))
}

/// Pick the stream format: the source's own when the device supports it,
/// otherwise the device default
fn choose_output(
    source: &AudioFormat,
    supported: &[(u16, u32, u32)],
    default: OutputFormat,
) -> Option<OutputFormat> {
    let supports = |channels: u16, rate: u32| {
        supported
            .iter()
            .any(|&(ch, min, max)| ch == channels && (min..=max).contains(&rate))
    };

    if supports(source.channels, source.sample_rate) {
        return Some(OutputFormat {
            sample_rate: source.sample_rate,
            channels: source.channels,
        });
    }
    if supports(source.channels, default.sample_rate) {
        return Some(OutputFormat {
            sample_rate: default.sample_rate,
            channels: source.channels,
        });
    }
    supports(default.channels, default.sample_rate).then_some(default)
}
