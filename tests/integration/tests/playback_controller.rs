//! Integration tests for the playback controller
//!
//! These drive the controller through scripted collaborators:
//! - Opening media and starting the pull loop
//! - Play/pause, seek and close against outstanding decode requests
//! - End of stream, decode failures and audio downgrades
//! - Completions delivered from other threads

use anyhow::Result;
use clipplayer::audio::TrackStatus;
use clipplayer::decoder::{DecodedFrame, SampleEvent};
use clipplayer::player::{PlaybackController, PlaybackState, PlayerEvent, PlayerEventHandler};
use clipplayer::utils::{DecodeError, PlayerError, QueryError};
use clipplayer_integration_tests::{clip, AudioSetup, Harness, VoiceCall, FRAME_BGRA};
use parking_lot::Mutex;
use proptest::prelude::*;
use std::sync::{Arc, Weak};
use std::thread;
use std::time::Duration;

const WHITE: [u8; 4] = [255; 4];

#[test]
fn test_open_starts_pull_loop() -> Result<()> {
    let harness = Harness::builder().build();
    let media = harness.controller.open("clip.mp4")?;

    assert_eq!((media.width, media.height), (640, 360));
    assert_eq!(harness.controller.state(), PlaybackState::Playing);
    assert_eq!(harness.decoder().outstanding(), 1);
    assert_eq!(harness.decoder().requests(), 1);
    assert_eq!(harness.controller.audio_status(), TrackStatus::Ready);

    assert_eq!(
        harness.take_events(),
        vec![
            PlayerEvent::StateChanged {
                state: PlaybackState::Opening
            },
            PlayerEvent::MediaOpened { media },
            PlayerEvent::StateChanged {
                state: PlaybackState::Playing
            },
        ]
    );
    assert_eq!(
        harness.take_voice_calls(),
        vec![
            VoiceCall::Volume(1.0),
            VoiceCall::Stop,
            VoiceCall::Flush,
            VoiceCall::Submit(0),
            VoiceCall::Start,
        ]
    );
    Ok(())
}

#[test]
fn test_ten_second_clip_scaled_into_800x600() -> Result<()> {
    let harness = Harness::builder().build();
    harness.controller.open("clip.mp4")?;
    assert_eq!(harness.controller.duration(), Ok(Duration::from_secs(10)));
    harness.take_events();

    assert!(harness.decoder().deliver_frame());

    // 640x360 at scale 1.25 is 800x450, with 75px bars above and below
    assert_eq!(harness.controller.render_stats().frames_presented, 1);
    assert_eq!(harness.pixel(400, 300), Some(FRAME_BGRA));
    assert_eq!(harness.pixel(0, 76), Some(FRAME_BGRA));
    assert_eq!(harness.pixel(799, 523), Some(FRAME_BGRA));
    assert_eq!(harness.pixel(400, 30), Some(WHITE));
    assert_eq!(harness.pixel(400, 570), Some(WHITE));

    assert_eq!(
        harness.take_events(),
        vec![PlayerEvent::PositionChanged {
            position: Duration::ZERO
        }]
    );
    assert_eq!(harness.controller.video_stream_index(), Some(0));

    // The completion immediately re-armed the loop
    assert_eq!(harness.decoder().outstanding(), 1);
    assert_eq!(harness.decoder().requests(), 2);
    Ok(())
}

#[test]
fn test_frames_advance_position() -> Result<()> {
    let harness = Harness::builder().build();
    harness.controller.open("clip.mp4")?;

    let decoder = harness.decoder();
    for _ in 0..5 {
        assert!(decoder.deliver_frame());
    }

    let stats = harness.controller.stats();
    assert_eq!(stats.frames_rendered, 5);
    assert_eq!(stats.requests_issued, 6);
    assert!(harness.controller.position() > Duration::from_millis(150));
    assert_eq!(decoder.max_outstanding(), 1);
    Ok(())
}

#[test]
fn test_pause_stalls_loop() -> Result<()> {
    let harness = Harness::builder().build();
    harness.controller.open("clip.mp4")?;
    harness.take_voice_calls();

    assert_eq!(harness.controller.play_pause()?, PlaybackState::Paused);
    assert_eq!(harness.take_voice_calls(), vec![VoiceCall::Stop]);

    // The in-flight completion is acknowledged but not rendered or re-armed
    let decoder = harness.decoder();
    assert!(decoder.deliver_frame());
    assert_eq!(decoder.outstanding(), 0);
    assert_eq!(decoder.requests(), 1);
    assert_eq!(harness.controller.stats().frames_rendered, 0);
    assert_eq!(harness.controller.stats().frames_discarded, 1);
    assert!(!harness.controller.request_outstanding());
    Ok(())
}

#[test]
fn test_resume_issues_exactly_one_request() -> Result<()> {
    let harness = Harness::builder().build();
    harness.controller.open("clip.mp4")?;
    harness.controller.play_pause()?;
    harness.decoder().deliver_frame();
    harness.take_voice_calls();

    assert_eq!(harness.controller.play_pause()?, PlaybackState::Playing);

    let decoder = harness.decoder();
    assert_eq!(decoder.outstanding(), 1);
    assert_eq!(decoder.requests(), 2);
    assert_eq!(harness.take_voice_calls(), vec![VoiceCall::Start]);

    assert!(decoder.deliver_frame());
    assert_eq!(harness.controller.stats().frames_rendered, 1);
    Ok(())
}

#[test]
fn test_play_pause_twice_keeps_one_request() -> Result<()> {
    let harness = Harness::builder().build();
    harness.controller.open("clip.mp4")?;

    harness.controller.play_pause()?;
    harness.controller.play_pause()?;

    // The original request is still in flight, so resuming issues none
    let decoder = harness.decoder();
    assert_eq!(harness.controller.state(), PlaybackState::Playing);
    assert_eq!(decoder.outstanding(), 1);
    assert_eq!(decoder.requests(), 1);

    // Its completion renders and re-arms as usual
    assert!(decoder.deliver_frame());
    assert_eq!(harness.controller.stats().frames_rendered, 1);
    assert_eq!(decoder.outstanding(), 1);
    assert_eq!(decoder.max_outstanding(), 1);
    Ok(())
}

#[test]
fn test_end_of_stream_stops_playback() -> Result<()> {
    let harness = Harness::builder().build();
    harness.controller.open("clip.mp4")?;
    let decoder = harness.decoder();
    decoder.deliver_frame();
    harness.take_events();
    harness.take_voice_calls();

    assert!(decoder.deliver_end_of_stream());

    assert_eq!(harness.controller.state(), PlaybackState::Stopped);
    assert_eq!(
        harness.take_events(),
        vec![
            PlayerEvent::StateChanged {
                state: PlaybackState::Stopped
            },
            PlayerEvent::PlaybackEnded,
        ]
    );
    assert_eq!(harness.take_voice_calls(), vec![VoiceCall::Stop, VoiceCall::Flush]);
    assert!(decoder.is_closed());

    // No further decode activity without a new open
    let requests = decoder.requests();
    assert!(matches!(
        harness.controller.play_pause(),
        Err(PlayerError::InvalidState { .. })
    ));
    assert!(harness.controller.seek(Duration::from_secs(1)).is_err());
    assert_eq!(decoder.requests(), requests);
    assert_eq!(decoder.outstanding(), 0);

    // The media stays known so the shell can replay it
    assert!(harness.controller.media().is_some());
    Ok(())
}

#[test]
fn test_replay_after_end_of_stream() -> Result<()> {
    let harness = Harness::builder().build();
    harness.controller.open("clip.mp4")?;
    harness.decoder().deliver_end_of_stream();

    harness.controller.open("clip.mp4")?;
    assert_eq!(harness.service.opened().len(), 2);
    assert_eq!(harness.controller.state(), PlaybackState::Playing);
    assert_eq!(harness.decoder().outstanding(), 1);
    Ok(())
}

#[test]
fn test_decode_error_ends_playback() -> Result<()> {
    let harness = Harness::builder().build();
    harness.controller.open("clip.mp4")?;
    harness.take_events();

    let decoder = harness.decoder();
    assert!(decoder.deliver_error(DecodeError::Backend("corrupt packet".to_string())));

    assert_eq!(harness.controller.state(), PlaybackState::Stopped);
    let events = harness.take_events();
    assert!(matches!(events.first(), Some(PlayerEvent::Error { message }) if message.contains("corrupt packet")));
    assert_eq!(events.last(), Some(&PlayerEvent::PlaybackEnded));
    assert!(decoder.is_closed());
    assert_eq!(decoder.requests(), 1);
    Ok(())
}

#[test]
fn test_stream_tick_rearms_without_rendering() -> Result<()> {
    let harness = Harness::builder().build();
    harness.controller.open("clip.mp4")?;

    let decoder = harness.decoder();
    assert!(decoder.deliver_tick());
    assert_eq!(harness.controller.stats().frames_rendered, 0);
    assert_eq!(decoder.outstanding(), 1);
    assert_eq!(decoder.requests(), 2);
    Ok(())
}

#[test]
fn test_seek_while_paused_stays_paused() -> Result<()> {
    let harness = Harness::builder().build();
    harness.controller.open("clip.mp4")?;
    harness.controller.play_pause()?;
    harness.take_events();
    harness.take_voice_calls();

    harness.controller.seek(Duration::from_secs(4))?;

    assert_eq!(harness.controller.state(), PlaybackState::Paused);
    assert_eq!(harness.decoder().seeks(), vec![Duration::from_secs(4)]);
    assert_eq!(harness.controller.position(), Duration::from_secs(4));
    assert!(harness.take_events().is_empty());

    // Audio is repositioned but not restarted
    let calls = harness.take_voice_calls();
    assert!(calls.iter().any(|call| matches!(call, VoiceCall::Submit(_))));
    assert!(!calls.contains(&VoiceCall::Start));
    Ok(())
}

#[test]
fn test_seek_discards_pre_seek_completion() -> Result<()> {
    let harness = Harness::builder().build();
    harness.controller.open("clip.mp4")?;
    harness.controller.seek(Duration::from_secs(5))?;
    harness.take_events();

    // The request issued before the seek completes with a stale frame
    let decoder = harness.decoder();
    assert!(decoder.deliver_frame());
    assert_eq!(harness.controller.stats().frames_rendered, 0);
    assert_eq!(harness.controller.stats().frames_discarded, 1);
    assert_eq!(decoder.outstanding(), 1);
    assert!(harness.take_events().is_empty());

    // The re-armed request resumes from the new position
    assert!(decoder.deliver_frame());
    assert_eq!(harness.controller.position(), Duration::from_secs(5));
    assert_eq!(
        harness.take_events(),
        vec![PlayerEvent::PositionChanged {
            position: Duration::from_secs(5)
        }]
    );
    Ok(())
}

#[test]
fn test_stale_end_of_stream_after_seek_is_ignored() -> Result<()> {
    let harness = Harness::builder().build();
    harness.controller.open("clip.mp4")?;
    harness.controller.seek(Duration::from_secs(2))?;

    let decoder = harness.decoder();
    assert!(decoder.deliver_end_of_stream());
    assert_eq!(harness.controller.state(), PlaybackState::Playing);
    assert_eq!(decoder.outstanding(), 1);
    assert!(!decoder.is_closed());
    Ok(())
}

#[test]
fn test_seek_clamps_to_duration() -> Result<()> {
    let harness = Harness::builder().build();
    harness.controller.open("clip.mp4")?;
    harness.controller.seek(Duration::from_secs(60))?;

    assert_eq!(harness.decoder().seeks(), vec![Duration::from_secs(10)]);
    assert_eq!(harness.controller.position(), Duration::from_secs(10));
    Ok(())
}

#[test]
fn test_unknown_duration() -> Result<()> {
    let mut media = clip(64, 36, Duration::ZERO);
    media.duration = None;
    let harness = Harness::builder().media(media).build();
    harness.controller.open("live.ts")?;

    assert_eq!(harness.controller.duration(), Err(QueryError::Unknown));
    harness.controller.seek(Duration::from_secs(60))?;
    assert_eq!(harness.decoder().seeks(), vec![Duration::from_secs(60)]);
    Ok(())
}

#[test]
fn test_seek_requires_open_media() {
    let harness = Harness::builder().build();
    let err = harness.controller.seek(Duration::from_secs(1)).unwrap_err();
    assert!(matches!(
        err,
        PlayerError::InvalidState {
            operation: "seek",
            state: PlaybackState::Stopped
        }
    ));
}

#[test]
fn test_audio_unavailable_never_blocks_video() -> Result<()> {
    for setup in [AudioSetup::NoEngine, AudioSetup::EngineRefuses, AudioSetup::LoadFails] {
        let harness = Harness::builder().audio(setup).build();
        harness.controller.open("clip.mp4")?;

        assert_eq!(harness.controller.state(), PlaybackState::Playing, "{:?}", setup);
        assert_eq!(harness.controller.audio_status(), TrackStatus::Unavailable);

        assert!(harness.decoder().deliver_frame());
        assert_eq!(harness.controller.stats().frames_rendered, 1, "{:?}", setup);
        assert!(harness.take_voice_calls().is_empty());

        // Controls stay usable without sound
        assert_eq!(harness.controller.play_pause()?, PlaybackState::Paused);
        harness.controller.mute();
        harness.controller.set_volume(0.2);
    }
    Ok(())
}

#[test]
fn test_media_without_audio_stream() -> Result<()> {
    let mut media = clip(64, 36, Duration::from_secs(3));
    media.audio = None;
    let harness = Harness::builder().media(media).build();

    harness.controller.open("silent.mp4")?;
    assert_eq!(harness.controller.audio_status(), TrackStatus::Unavailable);
    assert!(harness.take_voice_calls().is_empty());
    Ok(())
}

#[test]
fn test_open_failure_returns_to_stopped() {
    let harness = Harness::builder()
        .open_error(DecodeError::SourceNotFound("clip.mp4".to_string()))
        .build();

    let err = harness.controller.open("clip.mp4").unwrap_err();
    assert!(matches!(err, PlayerError::OpenFailed(DecodeError::SourceNotFound(_))));
    assert_eq!(harness.controller.state(), PlaybackState::Stopped);
    assert!(harness.controller.media().is_none());
    assert!(harness.service.opened().is_empty());

    let events = harness.take_events();
    assert!(events.iter().any(|e| matches!(e, PlayerEvent::Error { .. })));
    assert_eq!(
        events.last(),
        Some(&PlayerEvent::StateChanged {
            state: PlaybackState::Stopped
        })
    );
}

#[test]
fn test_close_while_request_in_flight() -> Result<()> {
    let harness = Harness::builder().build();
    harness.controller.open("clip.mp4")?;

    let decoder = harness.decoder();
    let in_flight = decoder.sink().expect("sink registered at open");
    harness.controller.close();

    assert_eq!(harness.controller.state(), PlaybackState::Stopped);
    assert!(decoder.is_closed());
    assert!(harness.controller.media().is_none());
    assert_eq!(harness.controller.duration(), Err(QueryError::NoMedia));

    // A completion the pool was already running arrives after close
    let presents = harness.presents();
    let frame = DecodedFrame::packed(FRAME_BGRA.repeat(640 * 360), 640, 360, Duration::ZERO);
    in_flight.on_sample_ready(Ok(SampleEvent::frame(1, 0, frame)));

    assert_eq!(harness.presents(), presents);
    assert_eq!(harness.controller.stats().frames_rendered, 0);
    assert_eq!(decoder.requests(), 1);
    Ok(())
}

#[test]
fn test_reopen_ignores_previous_session_completion() -> Result<()> {
    let harness = Harness::builder().build();
    harness.controller.open("first.mp4")?;
    let first = harness.decoder();
    let stale_sink = first.sink().expect("sink registered at open");

    harness.controller.open("second.mp4")?;
    assert!(first.is_closed());
    let second = harness.decoder();

    let frame = DecodedFrame::packed(FRAME_BGRA.repeat(640 * 360), 640, 360, Duration::ZERO);
    stale_sink.on_sample_ready(Ok(SampleEvent::frame(1, 0, frame)));

    assert_eq!(harness.controller.stats().frames_rendered, 0);
    assert_eq!(second.outstanding(), 1);
    assert_eq!(second.requests(), 1);
    assert_eq!(harness.controller.media().map(|m| m.source), Some("second.mp4".to_string()));
    Ok(())
}

#[test]
fn test_resize_redraws_last_frame_while_paused() -> Result<()> {
    let harness = Harness::builder().build();
    harness.controller.open("clip.mp4")?;
    harness.decoder().deliver_frame();
    harness.controller.play_pause()?;

    harness.controller.resize(360, 640)?;

    // 640x360 into 360x640: scale 0.5625, 202.5px tall, centered vertically
    let stats = harness.controller.render_stats();
    assert_eq!((stats.render_width, stats.render_height), (360, 640));
    assert_eq!(stats.frames_presented, 2);
    assert_eq!(harness.pixel(180, 320), Some(FRAME_BGRA));
    assert_eq!(harness.pixel(180, 100), Some(WHITE));
    assert_eq!(harness.pixel(180, 540), Some(WHITE));
    Ok(())
}

#[test]
fn test_volume_passthrough() -> Result<()> {
    let harness = Harness::builder().build();
    harness.controller.open("clip.mp4")?;
    harness.take_voice_calls();

    harness.controller.set_volume(0.5);
    harness.controller.mute();
    assert!(harness.controller.is_muted());
    harness.controller.unmute();

    assert_eq!(
        harness.take_voice_calls(),
        vec![VoiceCall::Volume(0.5), VoiceCall::Volume(0.0), VoiceCall::Volume(1.0)]
    );
    assert_eq!(harness.controller.volume(), 1.0);

    harness.controller.toggle_mute();
    assert!(harness.controller.is_muted());
    Ok(())
}

struct Recorder(Arc<Mutex<Vec<PlayerEvent>>>);

impl PlayerEventHandler for Recorder {
    fn handle_event(&mut self, event: PlayerEvent) {
        self.0.lock().push(event);
    }
}

#[test]
fn test_event_handler_receives_events() -> Result<()> {
    let harness = Harness::builder().build();
    let recorded = Arc::new(Mutex::new(Vec::new()));
    harness.controller.add_event_handler(Box::new(Recorder(Arc::clone(&recorded))));

    harness.controller.open("clip.mp4")?;
    harness.decoder().deliver_frame();
    harness.decoder().deliver_end_of_stream();

    let recorded = recorded.lock();
    assert_eq!(recorded.len(), 6);
    assert_eq!(
        recorded.iter().filter(|e| **e == PlayerEvent::PlaybackEnded).count(),
        1
    );
    Ok(())
}

/// Toggles playback from inside the first `PositionChanged` it sees
struct PauseOnFirstFrame {
    controller: Weak<PlaybackController>,
    outcome: Arc<Mutex<Option<clipplayer::Result<PlaybackState>>>>,
}

impl PlayerEventHandler for PauseOnFirstFrame {
    fn handle_event(&mut self, event: PlayerEvent) {
        if !matches!(event, PlayerEvent::PositionChanged { .. }) || self.outcome.lock().is_some() {
            return;
        }
        if let Some(controller) = self.controller.upgrade() {
            let result = controller.play_pause();
            *self.outcome.lock() = Some(result);
        }
    }
}

#[test]
fn test_handler_can_call_back_into_controller() -> Result<()> {
    let harness = Harness::builder().build();
    let outcome = Arc::new(Mutex::new(None));
    let recorded = Arc::new(Mutex::new(Vec::new()));
    harness.controller.add_event_handler(Box::new(PauseOnFirstFrame {
        controller: Arc::downgrade(&harness.controller),
        outcome: Arc::clone(&outcome),
    }));
    harness.controller.add_event_handler(Box::new(Recorder(Arc::clone(&recorded))));
    harness.controller.open("clip.mp4")?;

    let decoder = harness.decoder();
    let (done_tx, done_rx) = crossbeam_channel::bounded(1);
    let worker = {
        let decoder = decoder.clone();
        thread::spawn(move || {
            decoder.deliver_frame();
            let _ = done_tx.send(());
        })
    };
    done_rx
        .recv_timeout(Duration::from_secs(5))
        .expect("completion blocked inside the event handler");
    worker.join().expect("delivery thread panicked");

    assert!(matches!(*outcome.lock(), Some(Ok(PlaybackState::Paused))));
    assert_eq!(harness.controller.state(), PlaybackState::Paused);
    // The re-armed request stays in flight; nothing more is requested.
    assert_eq!(decoder.requests(), 2);
    assert_eq!(decoder.outstanding(), 1);

    // The pause raised mid-dispatch is delivered after the frame's event.
    let recorded = recorded.lock();
    let tail = &recorded[recorded.len() - 2..];
    assert!(matches!(tail[0], PlayerEvent::PositionChanged { .. }));
    assert_eq!(
        tail[1],
        PlayerEvent::StateChanged {
            state: PlaybackState::Paused
        }
    );
    Ok(())
}

#[test]
fn test_handler_replays_after_end_of_stream() -> Result<()> {
    struct Replay(Weak<PlaybackController>, Arc<Mutex<usize>>);

    impl PlayerEventHandler for Replay {
        fn handle_event(&mut self, event: PlayerEvent) {
            let mut replays = self.1.lock();
            if event != PlayerEvent::PlaybackEnded || *replays > 0 {
                return;
            }
            *replays += 1;
            drop(replays);
            if let Some(controller) = self.0.upgrade() {
                let media = controller.media().map(|media| media.source);
                if let Some(source) = media {
                    let _ = controller.open(&source);
                }
            }
        }
    }

    let harness = Harness::builder().build();
    let replays = Arc::new(Mutex::new(0));
    harness.controller.add_event_handler(Box::new(Replay(
        Arc::downgrade(&harness.controller),
        Arc::clone(&replays),
    )));
    harness.controller.open("clip.mp4")?;
    harness.decoder().deliver_end_of_stream();

    assert_eq!(*replays.lock(), 1);
    assert_eq!(harness.service.opened().len(), 2);
    assert_eq!(harness.controller.state(), PlaybackState::Playing);
    assert_eq!(harness.decoder().outstanding(), 1);
    Ok(())
}

#[test]
fn test_completions_from_foreign_thread() -> Result<()> {
    let harness = Harness::builder().media(clip(64, 36, Duration::from_secs(10))).build();
    harness.controller.open("clip.mp4")?;

    let decoder = harness.decoder();
    let worker = {
        let decoder = decoder.clone();
        thread::spawn(move || {
            let mut delivered = 0;
            while delivered < 50 {
                if decoder.deliver_frame() {
                    delivered += 1;
                } else {
                    thread::yield_now();
                }
            }
        })
    };

    // Resizes on this thread interleave with presents on the worker
    for i in 0..20 {
        harness.controller.resize(100 + i, 80 + i)?;
    }
    worker.join().expect("delivery thread panicked");

    assert_eq!(harness.controller.stats().frames_rendered, 50);
    assert_eq!(decoder.max_outstanding(), 1);
    assert_eq!(decoder.outstanding(), 1);
    assert_eq!(harness.controller.state(), PlaybackState::Playing);
    Ok(())
}

#[test]
fn test_drop_closes_decoder() -> Result<()> {
    let harness = Harness::builder().build();
    harness.controller.open("clip.mp4")?;
    let decoder = harness.decoder();

    drop(harness);
    assert!(decoder.is_closed());
    assert!(decoder.sink().is_none());
    Ok(())
}

#[derive(Debug, Clone, Copy)]
enum Op {
    PlayPause,
    Deliver,
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_play_pause_keeps_single_flight(
        ops in prop::collection::vec(prop_oneof![Just(Op::PlayPause), Just(Op::Deliver)], 0..40)
    ) {
        let harness = Harness::builder()
            .media(clip(16, 9, Duration::from_secs(10)))
            .surface(32, 32)
            .build();
        harness.controller.open("clip.mp4").unwrap();
        let decoder = harness.decoder();

        for op in ops {
            match op {
                Op::PlayPause => {
                    let was_idle = decoder.outstanding() == 0;
                    let requests = decoder.requests();
                    let state = harness.controller.play_pause().unwrap();
                    if state == PlaybackState::Playing {
                        // Resuming re-arms exactly one request, and only when none is in flight
                        let expected = if was_idle { requests + 1 } else { requests };
                        prop_assert_eq!(decoder.requests(), expected);
                    }
                }
                Op::Deliver => {
                    decoder.deliver_frame();
                }
            }

            prop_assert!(decoder.max_outstanding() <= 1);
            if harness.controller.state() == PlaybackState::Playing {
                prop_assert_eq!(decoder.outstanding(), 1);
            }
        }

        // Once the in-flight completion lands: 0 when paused, 1 when playing
        decoder.deliver_frame();
        let expected = match harness.controller.state() {
            PlaybackState::Paused => 0,
            _ => 1,
        };
        prop_assert_eq!(decoder.outstanding(), expected);
    }
}
