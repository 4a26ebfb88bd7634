//! Integration test utilities for clipplayer
//!
//! Scripted collaborators for driving a [`PlaybackController`] without
//! FFmpeg, an audio device or a window:
//! - [`ScriptedService`] opens [`ScriptedDecoder`]s whose completions are
//!   delivered by the test through a [`DecoderHandle`]
//! - [`RecordingEngine`] records every call made on its voices
//! - [`Harness`] wires them to a controller drawing on a software surface

use clipplayer::audio::{AudioBuffer, AudioEngine, AudioFormat, SourceVoice};
use clipplayer::decoder::{
    DecodedFrame, FrameDecoder, MediaService, MediaSource, SampleEvent, SampleSink, StreamFlags,
};
use clipplayer::player::{PlaybackController, PlayerConfig, PlayerEvent};
use clipplayer::renderer::{Color, Renderer, SoftwareCanvas, SoftwareSurface};
use clipplayer::utils::{AudioError, DecodeError, LoadError, QueryError};
use crossbeam_channel::Receiver;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

/// BGRA color of every scripted frame
pub const FRAME_BGRA: [u8; 4] = [255, 0, 0, 255];

/// Media description of a clip with an audio track
pub fn clip(width: u32, height: u32, duration: Duration) -> MediaSource {
    MediaSource {
        source: "clip.mp4".to_string(),
        duration: Some(duration),
        width,
        height,
        frame_rate: Some(25.0),
        audio: Some(AudioFormat::default()),
    }
}

struct DecoderState {
    media: MediaSource,
    sink: Option<Arc<dyn SampleSink>>,

    /// Outstanding requests: ticket and the timestamp the frame will carry
    pending: VecDeque<(u64, Duration)>,
    requests: u64,
    max_outstanding: usize,
    seeks: Vec<Duration>,
    closed: bool,
    next_timestamp: Duration,
    frame_interval: Duration,
}

/// Test-side view of a [`ScriptedDecoder`]
#[derive(Clone)]
pub struct DecoderHandle {
    state: Arc<Mutex<DecoderState>>,
}

impl DecoderHandle {
    fn new(media: MediaSource, sink: Arc<dyn SampleSink>) -> Self {
        let frame_interval = media
            .frame_rate
            .map(|fps| Duration::from_secs_f32(1.0 / fps))
            .unwrap_or(Duration::from_millis(40));
        Self {
            state: Arc::new(Mutex::new(DecoderState {
                media,
                sink: Some(sink),
                pending: VecDeque::new(),
                requests: 0,
                max_outstanding: 0,
                seeks: Vec::new(),
                closed: false,
                next_timestamp: Duration::ZERO,
                frame_interval,
            })),
        }
    }

    /// Requests issued and not yet delivered
    pub fn outstanding(&self) -> usize {
        self.state.lock().pending.len()
    }

    /// Highest number of simultaneously outstanding requests ever seen
    pub fn max_outstanding(&self) -> usize {
        self.state.lock().max_outstanding
    }

    pub fn requests(&self) -> u64 {
        self.state.lock().requests
    }

    pub fn seeks(&self) -> Vec<Duration> {
        self.state.lock().seeks.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// The registered completion sink, as an in-flight job would hold it
    pub fn sink(&self) -> Option<Arc<dyn SampleSink>> {
        self.state.lock().sink.clone()
    }

    /// Complete the oldest request with a frame; false if none is pending
    pub fn deliver_frame(&self) -> bool {
        self.complete(|ticket, timestamp, media| {
            let data = FRAME_BGRA.repeat((media.width * media.height) as usize);
            Ok(SampleEvent::frame(
                ticket,
                0,
                DecodedFrame::packed(data, media.width, media.height, timestamp),
            ))
        })
    }

    /// Complete the oldest request with end-of-stream
    pub fn deliver_end_of_stream(&self) -> bool {
        self.complete(|ticket, _, _| Ok(SampleEvent::end_of_stream(ticket, 0)))
    }

    /// Complete the oldest request with a frameless stream tick
    pub fn deliver_tick(&self) -> bool {
        self.complete(|ticket, timestamp, _| {
            Ok(SampleEvent {
                ticket,
                stream_index: 0,
                flags: StreamFlags::STREAM_TICK,
                timestamp,
                frame: None,
            })
        })
    }

    /// Fail the oldest request
    pub fn deliver_error(&self, err: DecodeError) -> bool {
        self.complete(move |_, _, _| Err(err))
    }

    fn complete<F>(&self, build: F) -> bool
    where
        F: FnOnce(u64, Duration, &MediaSource) -> Result<SampleEvent, DecodeError>,
    {
        // The sink is called without the decoder lock, as a pool thread would.
        let (sink, result) = {
            let mut state = self.state.lock();
            let Some(sink) = state.sink.clone() else {
                return false;
            };
            let Some((ticket, timestamp)) = state.pending.pop_front() else {
                return false;
            };
            let result = build(ticket, timestamp, &state.media);
            (sink, result)
        };
        sink.on_sample_ready(result);
        true
    }
}

/// Frame decoder whose completions are delivered by the test
pub struct ScriptedDecoder {
    media: MediaSource,
    handle: DecoderHandle,
}

impl FrameDecoder for ScriptedDecoder {
    fn media(&self) -> &MediaSource {
        &self.media
    }

    fn request_next_sample(&mut self, ticket: u64) -> Result<(), DecodeError> {
        let mut state = self.handle.state.lock();
        if state.closed {
            return Err(DecodeError::Closed);
        }

        let timestamp = state.next_timestamp;
        state.next_timestamp = timestamp + state.frame_interval;
        state.pending.push_back((ticket, timestamp));
        state.requests += 1;
        state.max_outstanding = state.max_outstanding.max(state.pending.len());
        Ok(())
    }

    fn duration(&self) -> Result<Duration, QueryError> {
        self.media.duration.ok_or(QueryError::Unknown)
    }

    fn seek(&mut self, position: Duration) -> Result<(), DecodeError> {
        let mut state = self.handle.state.lock();
        state.seeks.push(position);
        state.next_timestamp = position;
        Ok(())
    }

    fn close(&mut self) {
        let mut state = self.handle.state.lock();
        state.closed = true;
        state.sink = None;
    }
}

/// Media service opening [`ScriptedDecoder`]s
pub struct ScriptedService {
    media: MediaSource,
    open_error: Option<DecodeError>,
    audio_fails: bool,
    opened: Mutex<Vec<DecoderHandle>>,
}

impl ScriptedService {
    /// Handles of every decoder opened so far, oldest first
    pub fn opened(&self) -> Vec<DecoderHandle> {
        self.opened.lock().clone()
    }
}

impl MediaService for ScriptedService {
    fn open(&self, source: &str, sink: Arc<dyn SampleSink>) -> Result<Box<dyn FrameDecoder>, DecodeError> {
        if let Some(err) = &self.open_error {
            return Err(err.clone());
        }

        let media = MediaSource {
            source: source.to_string(),
            ..self.media.clone()
        };
        let handle = DecoderHandle::new(media.clone(), sink);
        self.opened.lock().push(handle.clone());
        Ok(Box::new(ScriptedDecoder { media, handle }))
    }

    fn load_audio(&self, _source: &str) -> Result<AudioBuffer, LoadError> {
        if self.audio_fails {
            return Err(LoadError::Load("scripted load failure".to_string()));
        }
        let format = self.media.audio.unwrap_or_default();
        let samples = vec![0.0; format.sample_rate as usize * format.channels as usize];
        Ok(AudioBuffer::new(samples, format))
    }

    fn probe(&self, _source: &str) -> Result<MediaSource, DecodeError> {
        Ok(self.media.clone())
    }
}

/// A call made on a recorded voice
#[derive(Debug, Clone, PartialEq)]
pub enum VoiceCall {
    Submit(usize),
    Start,
    Stop,
    Flush,
    Volume(f32),
}

struct RecordingVoice {
    calls: Arc<Mutex<Vec<VoiceCall>>>,
    cursor: usize,
}

impl SourceVoice for RecordingVoice {
    fn submit(&mut self, _samples: Arc<[f32]>, start_frame: usize) -> Result<(), AudioError> {
        self.cursor = start_frame;
        self.calls.lock().push(VoiceCall::Submit(start_frame));
        Ok(())
    }

    fn start(&mut self) -> Result<(), AudioError> {
        self.calls.lock().push(VoiceCall::Start);
        Ok(())
    }

    fn stop(&mut self) -> Result<(), AudioError> {
        self.calls.lock().push(VoiceCall::Stop);
        Ok(())
    }

    fn flush(&mut self) -> Result<(), AudioError> {
        self.calls.lock().push(VoiceCall::Flush);
        Ok(())
    }

    fn set_volume(&mut self, volume: f32) -> Result<(), AudioError> {
        self.calls.lock().push(VoiceCall::Volume(volume));
        Ok(())
    }

    fn position_frames(&self) -> usize {
        self.cursor
    }
}

/// Audio engine recording the calls made on its voices
pub struct RecordingEngine {
    calls: Arc<Mutex<Vec<VoiceCall>>>,
    refuse: bool,
}

impl AudioEngine for RecordingEngine {
    fn create_source_voice(&self, _format: &AudioFormat) -> Result<Box<dyn SourceVoice>, AudioError> {
        if self.refuse {
            return Err(AudioError::UnsupportedFormat("scripted refusal".to_string()));
        }
        Ok(Box::new(RecordingVoice {
            calls: Arc::clone(&self.calls),
            cursor: 0,
        }))
    }
}

/// How the audio side of a [`Harness`] behaves
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioSetup {
    Available,
    NoEngine,
    EngineRefuses,
    LoadFails,
}

/// Builder for [`Harness`]
pub struct HarnessBuilder {
    media: MediaSource,
    surface: (u32, u32),
    audio: AudioSetup,
    open_error: Option<DecodeError>,
    config: PlayerConfig,
}

impl HarnessBuilder {
    pub fn media(mut self, media: MediaSource) -> Self {
        self.media = media;
        self
    }

    pub fn surface(mut self, width: u32, height: u32) -> Self {
        self.surface = (width, height);
        self
    }

    pub fn audio(mut self, audio: AudioSetup) -> Self {
        self.audio = audio;
        self
    }

    pub fn open_error(mut self, err: DecodeError) -> Self {
        self.open_error = Some(err);
        self
    }

    pub fn config(mut self, config: PlayerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> Harness {
        let service = Arc::new(ScriptedService {
            media: self.media,
            open_error: self.open_error,
            audio_fails: self.audio == AudioSetup::LoadFails,
            opened: Mutex::new(Vec::new()),
        });

        let voice_calls = Arc::new(Mutex::new(Vec::new()));
        let engine: Option<Arc<dyn AudioEngine>> = match self.audio {
            AudioSetup::NoEngine => None,
            setup => Some(Arc::new(RecordingEngine {
                calls: Arc::clone(&voice_calls),
                refuse: setup == AudioSetup::EngineRefuses,
            })),
        };

        let surface = SoftwareSurface::new(self.surface.0, self.surface.1);
        let canvas = surface.canvas();
        let renderer = Renderer::with_surface(Box::new(surface), Color::WHITE);

        let media_service: Arc<dyn MediaService> = service.clone();
        let controller = PlaybackController::new(media_service, engine, renderer, self.config);
        let events = controller.subscribe();

        Harness {
            controller: Arc::new(controller),
            service,
            canvas,
            voice_calls,
            events,
        }
    }
}

/// A controller wired to scripted collaborators
pub struct Harness {
    /// Shared so event handlers can hold a weak handle back to it
    pub controller: Arc<PlaybackController>,
    pub service: Arc<ScriptedService>,
    pub canvas: Arc<Mutex<SoftwareCanvas>>,
    pub voice_calls: Arc<Mutex<Vec<VoiceCall>>>,
    events: Receiver<PlayerEvent>,
}

impl Harness {
    /// A 10 s 640x360 clip with audio, shown on an 800x600 surface
    pub fn builder() -> HarnessBuilder {
        HarnessBuilder {
            media: clip(640, 360, Duration::from_secs(10)),
            surface: (800, 600),
            audio: AudioSetup::Available,
            open_error: None,
            config: PlayerConfig::default(),
        }
    }

    /// Most recently opened decoder
    pub fn decoder(&self) -> DecoderHandle {
        self.service
            .opened()
            .pop()
            .expect("no decoder has been opened")
    }

    /// Events emitted since the last call
    pub fn take_events(&self) -> Vec<PlayerEvent> {
        self.events.try_iter().collect()
    }

    /// Voice calls recorded since the last call
    pub fn take_voice_calls(&self) -> Vec<VoiceCall> {
        std::mem::take(&mut *self.voice_calls.lock())
    }

    pub fn presents(&self) -> u64 {
        self.canvas.lock().presents()
    }

    pub fn pixel(&self, x: u32, y: u32) -> Option<[u8; 4]> {
        self.canvas.lock().pixel(x, y)
    }
}
