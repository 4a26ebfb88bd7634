//! Playback controller
//!
//! Runs the pull loop: exactly one decode request is outstanding while
//! playing, each completion renders its frame and issues the next request,
//! and a pause stalls the loop by not re-arming it. Completions arrive on
//! the decode pool, so all session state sits behind one mutex that is also
//! held while uploading and presenting.

use super::{PlaybackState, PlaybackStats, PlayerConfig, PlayerEvent, PlayerEventHandler};
use crate::audio::{AudioEngine, AudioTrack, TrackStatus};
use crate::decoder::{DecodedFrame, FrameDecoder, MediaService, MediaSource, SampleEvent, SampleSink};
use crate::renderer::{RenderStats, Renderer};
use crate::utils::error::{DecodeError, PlayerError, QueryError, Result};
use crossbeam_channel::{unbounded, Receiver, Sender};
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

/// Everything the state lock guards
struct Session {
    /// Identity of the current open; completions from older opens carry a
    /// different id and are ignored
    id: u64,
    state: PlaybackState,
    media: Option<MediaSource>,
    duration: std::result::Result<Duration, QueryError>,
    decoder: Option<Box<dyn FrameDecoder>>,
    renderer: Renderer,
    audio: AudioTrack,
    video_stream_index: Option<usize>,

    /// Ticket of the outstanding decode request
    pending: Option<u64>,
    next_ticket: u64,

    /// First ticket issued after the last seek
    seek_mark: u64,
    position: Duration,
    stats: PlaybackStats,
}

impl Session {
    fn request_next(&mut self) -> std::result::Result<(), DecodeError> {
        if self.pending.is_some() {
            return Err(DecodeError::RequestPending);
        }
        let decoder = self.decoder.as_mut().ok_or(DecodeError::Closed)?;
        let ticket = self.next_ticket;
        decoder.request_next_sample(ticket)?;

        self.next_ticket += 1;
        self.pending = Some(ticket);
        self.stats.requests_issued += 1;
        Ok(())
    }

    /// Stop playback, returning the decoder so it is closed outside the lock
    fn finish(&mut self, events: &mut Vec<PlayerEvent>) -> Option<Box<dyn FrameDecoder>> {
        self.audio.stop();
        self.state = PlaybackState::Stopped;
        self.pending = None;
        self.id += 1;
        events.push(PlayerEvent::StateChanged {
            state: PlaybackState::Stopped,
        });
        events.push(PlayerEvent::PlaybackEnded);
        self.decoder.take()
    }

    fn fail(&mut self, err: DecodeError, events: &mut Vec<PlayerEvent>) -> Option<Box<dyn FrameDecoder>> {
        let err = PlayerError::Decode(err);
        error!("{}, ending playback", err);
        events.push(PlayerEvent::Error {
            message: err.to_string(),
        });
        self.finish(events)
    }

    /// Issue the next request, ending playback if the decoder refuses
    fn rearm(&mut self, events: &mut Vec<PlayerEvent>) -> Option<Box<dyn FrameDecoder>> {
        match self.request_next() {
            Ok(()) => None,
            Err(e) => self.fail(e, events),
        }
    }

    /// Handle a completion that arrived while playing
    fn complete(
        &mut self,
        result: std::result::Result<SampleEvent, DecodeError>,
        events: &mut Vec<PlayerEvent>,
    ) -> Option<Box<dyn FrameDecoder>> {
        self.pending = None;

        let sample = match result {
            Ok(sample) => sample,
            Err(e) => return self.fail(e, events),
        };

        if sample.ticket < self.seek_mark {
            debug!("Discarding completion {} issued before the last seek", sample.ticket);
            self.stats.frames_discarded += 1;
            return self.rearm(events);
        }

        if sample.flags.is_end_of_stream() {
            info!("End of stream at {:?}", self.position);
            return self.finish(events);
        }

        self.video_stream_index = Some(sample.stream_index);
        if let Some(frame) = sample.frame {
            match self.render(&frame) {
                Ok(()) => {
                    self.position = frame.timestamp;
                    self.stats.frames_rendered += 1;
                    events.push(PlayerEvent::PositionChanged {
                        position: frame.timestamp,
                    });
                }
                Err(e) => warn!("Dropping frame at {:?}: {}", frame.timestamp, e),
            }
        }

        self.rearm(events)
    }

    fn render(&mut self, frame: &DecodedFrame) -> Result<()> {
        let image = self.renderer.upload_frame(frame)?;
        self.renderer.present(&image)
    }
}

/// State shared with the decode pool
struct Shared {
    session: Mutex<Session>,
    service: Arc<dyn MediaService>,
    audio_engine: Option<Arc<dyn AudioEngine>>,
    config: PlayerConfig,
    handlers: Mutex<Vec<Box<dyn PlayerEventHandler>>>,
    subscribers: Mutex<Vec<Sender<PlayerEvent>>>,
    dispatch: Mutex<Dispatch>,
}

/// Events waiting for delivery
///
/// One thread delivers at a time; events raised meanwhile, including by a
/// handler calling back into the controller, are queued behind it.
#[derive(Default)]
struct Dispatch {
    queue: VecDeque<PlayerEvent>,
    busy: bool,
}

impl Shared {
    fn on_sample_ready(&self, session_id: u64, result: std::result::Result<SampleEvent, DecodeError>) {
        let mut events = Vec::new();
        let finished = {
            let mut session = self.session.lock();
            if session.id != session_id || session.pending.is_none() {
                debug!("Ignoring completion for a closed session");
                return;
            }

            match session.state {
                PlaybackState::Playing => session.complete(result, &mut events),
                PlaybackState::Paused => {
                    // Stall the loop; resuming issues the next request.
                    session.pending = None;
                    if matches!(&result, Ok(sample) if sample.frame.is_some()) {
                        session.stats.frames_discarded += 1;
                    }
                    debug!("Completion arrived while paused");
                    None
                }
                _ => None,
            }
        };

        if let Some(mut decoder) = finished {
            decoder.close();
        }
        self.send_events(events);
    }

    /// Deliver events to handlers and subscribers; never called with the
    /// state lock held
    fn send_events(&self, events: Vec<PlayerEvent>) {
        {
            let mut dispatch = self.dispatch.lock();
            dispatch.queue.extend(events);
            if dispatch.busy || dispatch.queue.is_empty() {
                return;
            }
            dispatch.busy = true;
        }

        loop {
            let event = {
                let mut dispatch = self.dispatch.lock();
                match dispatch.queue.pop_front() {
                    Some(event) => event,
                    None => {
                        dispatch.busy = false;
                        return;
                    }
                }
            };

            self.subscribers.lock().retain(|tx| tx.send(event.clone()).is_ok());

            // Handlers run unlocked so they may add handlers themselves.
            let mut handlers = std::mem::take(&mut *self.handlers.lock());
            for handler in handlers.iter_mut() {
                handler.handle_event(event.clone());
            }
            let mut slot = self.handlers.lock();
            let added = std::mem::replace(&mut *slot, handlers);
            slot.extend(added);
        }
    }
}

/// Completion sink registered with the decoder for one open
///
/// Holds a strong reference, so the shared state outlives every completion
/// the backend can still deliver.
struct DecodeCompletion {
    shared: Arc<Shared>,
    session_id: u64,
}

impl SampleSink for DecodeCompletion {
    fn on_sample_ready(&self, result: std::result::Result<SampleEvent, DecodeError>) {
        self.shared.on_sample_ready(self.session_id, result);
    }
}

/// Orchestrates decoding, rendering and audio for one media at a time
pub struct PlaybackController {
    shared: Arc<Shared>,
}

impl PlaybackController {
    /// Create a controller drawing into `renderer`
    ///
    /// Without an audio engine every session plays silently.
    pub fn new(
        service: Arc<dyn MediaService>,
        audio_engine: Option<Arc<dyn AudioEngine>>,
        renderer: Renderer,
        config: PlayerConfig,
    ) -> Self {
        let session = Session {
            id: 0,
            state: PlaybackState::Stopped,
            media: None,
            duration: Err(QueryError::NoMedia),
            decoder: None,
            renderer,
            audio: AudioTrack::new(config.initial_volume, config.muted),
            video_stream_index: None,
            pending: None,
            next_ticket: 1,
            seek_mark: 1,
            position: Duration::ZERO,
            stats: PlaybackStats::default(),
        };

        Self {
            shared: Arc::new(Shared {
                session: Mutex::new(session),
                service,
                audio_engine,
                config,
                handlers: Mutex::new(Vec::new()),
                subscribers: Mutex::new(Vec::new()),
                dispatch: Mutex::new(Dispatch::default()),
            }),
        }
    }

    /// Open `source` and start playing it
    ///
    /// Closes the current media first. Decoder failures return `OpenFailed`
    /// and leave the controller stopped; audio failures only mean silence.
    pub fn open(&self, source: &str) -> Result<MediaSource> {
        self.close();

        let session_id = {
            let mut session = self.shared.session.lock();
            session.id += 1;
            session.state = PlaybackState::Opening;
            session.id
        };
        self.shared.send_events(vec![PlayerEvent::StateChanged {
            state: PlaybackState::Opening,
        }]);
        info!("Opening {}", source);

        let sink = Arc::new(DecodeCompletion {
            shared: Arc::clone(&self.shared),
            session_id,
        });
        let mut decoder = match self.shared.service.open(source, sink) {
            Ok(decoder) => decoder,
            Err(e) => return Err(self.abort_open(session_id, None, e)),
        };

        let media = decoder.media().clone();
        let duration = decoder.duration();
        info!(
            "Video {}x{}, duration {:?}",
            media.width,
            media.height,
            duration.as_ref().ok()
        );

        let audio_buffer = match media.audio {
            Some(_) => match AudioTrack::load(&*self.shared.service, source) {
                Ok(buffer) => Some(buffer),
                Err(e) => {
                    warn!("{}", PlayerError::AudioUnavailable(e));
                    None
                }
            },
            None => {
                info!("{} has no audio stream", source);
                None
            }
        };

        let mut session = self.shared.session.lock();
        if session.id != session_id || session.state != PlaybackState::Opening {
            let state = session.state;
            drop(session);
            decoder.close();
            return Err(PlayerError::InvalidState {
                operation: "open",
                state,
            });
        }

        if let Err(e) = session.renderer.clear() {
            warn!("Failed to clear the surface: {}", e);
        }

        match audio_buffer {
            Some(buffer) => {
                let engine = self.shared.audio_engine.as_deref();
                if session.audio.initialize(engine, buffer) == TrackStatus::Ready {
                    session.audio.play(true);
                }
            }
            None => session.audio.release(),
        }

        session.decoder = Some(decoder);
        session.media = Some(media.clone());
        session.duration = duration;
        session.video_stream_index = None;
        session.position = Duration::ZERO;
        session.pending = None;
        session.seek_mark = session.next_ticket;
        session.stats = PlaybackStats::default();

        if let Err(e) = session.request_next() {
            let decoder = session.decoder.take();
            session.audio.release();
            drop(session);
            return Err(self.abort_open(session_id, decoder, e));
        }
        session.state = PlaybackState::Playing;
        drop(session);

        self.shared.send_events(vec![
            PlayerEvent::MediaOpened { media: media.clone() },
            PlayerEvent::StateChanged {
                state: PlaybackState::Playing,
            },
        ]);
        Ok(media)
    }

    fn abort_open(
        &self,
        session_id: u64,
        decoder: Option<Box<dyn FrameDecoder>>,
        err: DecodeError,
    ) -> PlayerError {
        {
            let mut session = self.shared.session.lock();
            if session.id == session_id {
                session.id += 1;
                session.state = PlaybackState::Stopped;
                session.media = None;
                session.duration = Err(QueryError::NoMedia);
            }
        }
        if let Some(mut decoder) = decoder {
            decoder.close();
        }

        let err = PlayerError::OpenFailed(err);
        error!("{}", err);
        self.shared.send_events(vec![
            PlayerEvent::Error {
                message: err.to_string(),
            },
            PlayerEvent::StateChanged {
                state: PlaybackState::Stopped,
            },
        ]);
        err
    }

    /// Toggle between playing and paused, returning the new state
    ///
    /// Pausing leaves the outstanding request to complete unrendered.
    /// Resuming re-arms the loop only if no request is still outstanding.
    pub fn play_pause(&self) -> Result<PlaybackState> {
        let mut events = Vec::new();
        let mut finished = None;
        let result = {
            let mut session = self.shared.session.lock();
            match session.state {
                PlaybackState::Playing => {
                    session.audio.pause();
                    session.state = PlaybackState::Paused;
                    events.push(PlayerEvent::StateChanged {
                        state: PlaybackState::Paused,
                    });
                    info!("Paused at {:?}", session.position);
                    Ok(PlaybackState::Paused)
                }
                PlaybackState::Paused => {
                    session.audio.resume();
                    session.state = PlaybackState::Playing;
                    events.push(PlayerEvent::StateChanged {
                        state: PlaybackState::Playing,
                    });
                    info!("Resumed at {:?}", session.position);

                    match session.pending {
                        Some(_) => Ok(PlaybackState::Playing),
                        None => match session.request_next() {
                            Ok(()) => Ok(PlaybackState::Playing),
                            Err(e) => {
                                finished = session.fail(e.clone(), &mut events);
                                Err(PlayerError::Decode(e))
                            }
                        },
                    }
                }
                state => Err(PlayerError::InvalidState {
                    operation: "toggle playback",
                    state,
                }),
            }
        };

        self.after_unlock(finished, events, result)
    }

    fn after_unlock<T>(
        &self,
        finished: Option<Box<dyn FrameDecoder>>,
        events: Vec<PlayerEvent>,
        result: Result<T>,
    ) -> Result<T> {
        if let Some(mut decoder) = finished {
            decoder.close();
        }
        self.shared.send_events(events);
        result
    }

    /// Move playback to `position`, clamped to the duration when known
    ///
    /// Valid while playing or paused; a paused session stays paused.
    /// Completions of requests issued before the seek are discarded.
    pub fn seek(&self, position: Duration) -> Result<()> {
        let mut session = self.shared.session.lock();
        let state = session.state;
        if !state.is_active() {
            return Err(PlayerError::InvalidState {
                operation: "seek",
                state,
            });
        }

        let target = match session.duration {
            Ok(duration) => position.min(duration),
            Err(_) => position,
        };
        session
            .decoder
            .as_mut()
            .ok_or(PlayerError::InvalidState {
                operation: "seek",
                state,
            })?
            .seek(target)?;

        session.seek_mark = session.next_ticket;
        session.position = target;
        session.audio.seek(target);
        info!("Seeked to {:?}", target);
        Ok(())
    }

    /// Stop playback and release the media
    ///
    /// A completion already running on the decode pool finds the session
    /// closed and returns without touching renderer or audio.
    pub fn close(&self) {
        let (decoder, previous) = {
            let mut session = self.shared.session.lock();
            let previous = session.state;
            session.id += 1;
            session.state = PlaybackState::Stopped;
            session.pending = None;
            session.audio.release();
            session.media = None;
            session.duration = Err(QueryError::NoMedia);
            session.video_stream_index = None;
            session.position = Duration::ZERO;
            if previous != PlaybackState::Stopped {
                if let Err(e) = session.renderer.clear() {
                    warn!("Failed to clear the surface: {}", e);
                }
            }
            (session.decoder.take(), previous)
        };

        if let Some(mut decoder) = decoder {
            decoder.close();
            info!("Closed media");
        }
        if previous != PlaybackState::Stopped {
            self.shared.send_events(vec![PlayerEvent::StateChanged {
                state: PlaybackState::Stopped,
            }]);
        }
    }

    /// Presentation duration of the open media
    pub fn duration(&self) -> std::result::Result<Duration, QueryError> {
        self.shared.session.lock().duration
    }

    /// Timestamp of the last presented frame, or the last seek target
    pub fn position(&self) -> Duration {
        self.shared.session.lock().position
    }

    pub fn state(&self) -> PlaybackState {
        self.shared.session.lock().state
    }

    pub fn media(&self) -> Option<MediaSource> {
        self.shared.session.lock().media.clone()
    }

    /// Stream index reported by the last completion
    pub fn video_stream_index(&self) -> Option<usize> {
        self.shared.session.lock().video_stream_index
    }

    /// Resize the surface and redraw the last frame
    ///
    /// Holds the state lock, so it never overlaps a present.
    pub fn resize(&self, width: u32, height: u32) -> Result<()> {
        let mut session = self.shared.session.lock();
        session.renderer.resize(width, height)?;
        session.renderer.redraw()
    }

    /// Present the last frame again
    pub fn redraw(&self) -> Result<()> {
        self.shared.session.lock().renderer.redraw()
    }

    pub fn set_volume(&self, volume: f32) {
        self.shared.session.lock().audio.set_volume(volume);
    }

    pub fn mute(&self) {
        self.shared.session.lock().audio.mute();
    }

    pub fn unmute(&self) {
        self.shared.session.lock().audio.unmute();
    }

    pub fn toggle_mute(&self) {
        self.shared.session.lock().audio.toggle_mute();
    }

    pub fn volume(&self) -> f32 {
        self.shared.session.lock().audio.volume()
    }

    pub fn is_muted(&self) -> bool {
        self.shared.session.lock().audio.is_muted()
    }

    /// Whether the current session has sound
    pub fn audio_status(&self) -> TrackStatus {
        self.shared.session.lock().audio.status()
    }

    /// Whether a decode request is outstanding
    pub fn request_outstanding(&self) -> bool {
        self.shared.session.lock().pending.is_some()
    }

    pub fn stats(&self) -> PlaybackStats {
        self.shared.session.lock().stats
    }

    pub fn render_stats(&self) -> RenderStats {
        self.shared.session.lock().renderer.stats()
    }

    /// Preferences applied to new sessions
    pub fn config(&self) -> PlayerConfig {
        self.shared.config
    }

    /// Receive every event emitted from now on
    pub fn subscribe(&self) -> Receiver<PlayerEvent> {
        let (tx, rx) = unbounded();
        self.shared.subscribers.lock().push(tx);
        rx
    }

    /// Add event handler
    ///
    /// Handlers run on whichever thread raised the event, after the state
    /// lock is released, and may call back into the controller.
    pub fn add_event_handler(&self, handler: Box<dyn PlayerEventHandler>) {
        self.shared.handlers.lock().push(handler);
    }
}

impl Drop for PlaybackController {
    fn drop(&mut self) {
        self.close();
    }
}
