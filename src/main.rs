use anyhow::{Context, Result};
use clap::Parser;
use clipplayer::audio::{AudioEngine, CpalEngine};
use clipplayer::decoder::{FfmpegService, MediaService};
use clipplayer::player::{PlaybackController, PlaybackState, PlayerConfig, PlayerEvent, PlayerEventHandler};
use clipplayer::renderer::Renderer;
use clipplayer::utils::{format_duration, Config};
use crossbeam_channel::Receiver;
use env_logger::Env;
use log::{debug, error, info, warn};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use winit::application::ApplicationHandler;
use winit::dpi::LogicalSize;
use winit::event::{ElementState, KeyEvent, WindowEvent};
use winit::event_loop::{ActiveEventLoop, ControlFlow, EventLoop};
use winit::keyboard::{KeyCode, PhysicalKey};
use winit::window::{Window, WindowId};

/// How often pending player events are drained when the window is idle
const EVENT_POLL_INTERVAL: Duration = Duration::from_millis(100);

const VOLUME_STEP: f32 = 0.05;

/// clipplayer - plays a short video with its audio track
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Media file to play
    #[arg(value_name = "FILE")]
    file: Option<PathBuf>,

    /// Set initial volume (0-100)
    #[arg(short, long, value_name = "VOLUME", value_parser = clap::value_parser!(u8).range(0..=100))]
    volume: Option<u8>,

    /// Start muted
    #[arg(short, long)]
    mute: bool,

    /// Play without sound
    #[arg(long)]
    no_audio: bool,

    /// Window width
    #[arg(long)]
    width: Option<u32>,

    /// Window height
    #[arg(long)]
    height: Option<u32>,

    /// Configuration file to use instead of the user config
    #[arg(short, long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// Print the media metadata as JSON and exit
    #[arg(long, requires = "file")]
    probe: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };
    if let Some(volume) = args.volume {
        config.audio.volume = f32::from(volume) / 100.0;
    }
    config.audio.muted |= args.mute;
    config.audio.enabled &= !args.no_audio;
    config.window.width = args.width.unwrap_or(config.window.width);
    config.window.height = args.height.unwrap_or(config.window.height);

    let log_level = if args.debug { "debug" } else { config.general.log_level.as_str() };
    env_logger::Builder::from_env(Env::default().default_filter_or(log_level))
        .format_timestamp_millis()
        .init();

    info!("Starting clipplayer v{}", env!("CARGO_PKG_VERSION"));

    let service = FfmpegService::startup(&config.decoder)?;
    let source = args.file.as_ref().map(|path| path.to_string_lossy().into_owned());

    if args.probe {
        let source = source.context("--probe needs a FILE")?;
        let result = service.probe(&source);
        service.shutdown();
        println!("{}", serde_json::to_string_pretty(&result?)?);
        return Ok(());
    }

    let audio_engine: Option<Arc<dyn AudioEngine>> = if config.audio.enabled {
        match CpalEngine::new() {
            Ok(engine) => {
                info!("Audio output: {}", engine.device_name());
                Some(Arc::new(engine))
            }
            Err(e) => {
                warn!("Audio unavailable, playing without sound: {}", e);
                None
            }
        }
    } else {
        info!("Audio disabled");
        None
    };

    let event_loop = EventLoop::new().context("Failed to create event loop")?;
    event_loop.set_control_flow(ControlFlow::Wait);

    let mut app = App {
        config,
        service: Arc::clone(&service),
        audio_engine,
        initial_source: source,
        window: None,
        controller: None,
        events: None,
        error: None,
    };
    let run = event_loop.run_app(&mut app);

    // Close the session before the pool that delivers its completions.
    drop(app.controller.take());
    service.shutdown();

    run.context("Event loop error")?;
    match app.error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

/// The window shell around a [`PlaybackController`]
struct App {
    config: Config,
    service: Arc<FfmpegService>,
    audio_engine: Option<Arc<dyn AudioEngine>>,
    initial_source: Option<String>,
    window: Option<Arc<Window>>,
    controller: Option<PlaybackController>,
    events: Option<Receiver<PlayerEvent>>,
    error: Option<anyhow::Error>,
}

impl App {
    fn start(&mut self, event_loop: &ActiveEventLoop) -> Result<()> {
        let attributes = Window::default_attributes()
            .with_title(self.config.window.title.clone())
            .with_inner_size(LogicalSize::new(
                f64::from(self.config.window.width),
                f64::from(self.config.window.height),
            ));
        let window = Arc::new(
            event_loop
                .create_window(attributes)
                .context("Failed to create window")?,
        );

        let size = window.inner_size();
        let renderer = Renderer::initialize(Arc::clone(&window), (size.width, size.height), &self.config.renderer)?;

        let service: Arc<dyn MediaService> = self.service.clone();
        let controller = PlaybackController::new(
            service,
            self.audio_engine.clone(),
            renderer,
            PlayerConfig::from(&self.config),
        );
        controller.add_event_handler(Box::new(PositionLogger::default()));
        self.events = Some(controller.subscribe());

        let opened = match self.initial_source.take() {
            Some(source) => open_initial(&controller, &source),
            None => false,
        };
        if !opened {
            if let Err(e) = controller.redraw() {
                warn!("Initial redraw failed: {}", e);
            }
        }

        self.window = Some(window);
        self.controller = Some(controller);
        Ok(())
    }

    fn handle_key(&mut self, code: KeyCode, event_loop: &ActiveEventLoop) {
        let Some(controller) = self.controller.as_ref() else { return };

        let result = match code {
            KeyCode::Space => match (controller.state(), controller.media()) {
                // Replay after the stream ended
                (PlaybackState::Stopped, Some(media)) => controller.open(&media.source).map(|_| ()),
                _ => controller.play_pause().map(|_| ()),
            },
            KeyCode::ArrowLeft | KeyCode::ArrowRight => {
                let step = Duration::from_secs(self.config.general.seek_step_secs);
                let position = controller.position();
                let target = if code == KeyCode::ArrowLeft {
                    position.saturating_sub(step)
                } else {
                    position + step
                };
                controller.seek(target)
            }
            KeyCode::ArrowUp => {
                controller.set_volume(controller.volume() + VOLUME_STEP);
                Ok(())
            }
            KeyCode::ArrowDown => {
                controller.set_volume(controller.volume() - VOLUME_STEP);
                Ok(())
            }
            KeyCode::KeyM => {
                controller.toggle_mute();
                Ok(())
            }
            KeyCode::Escape | KeyCode::KeyQ => {
                event_loop.exit();
                Ok(())
            }
            _ => Ok(()),
        };

        if let Err(e) = result {
            warn!("{:?}: {}", code, e);
        }
    }

    fn drain_events(&self) {
        let Some(events) = self.events.as_ref() else { return };

        for event in events.try_iter() {
            match event {
                PlayerEvent::MediaOpened { media } => info!(
                    "Media opened: {} ({}x{}, {})",
                    media.source,
                    media.width,
                    media.height,
                    media
                        .duration
                        .map(format_duration)
                        .unwrap_or_else(|| "unknown duration".to_string())
                ),
                PlayerEvent::StateChanged { state } => {
                    info!("Playback {}", state);
                    if let Some(window) = &self.window {
                        window.set_title(&format!("{} - {}", self.config.window.title, state));
                    }
                }
                PlayerEvent::PlaybackEnded => info!("End of media reached"),
                PlayerEvent::Error { message } => error!("Player error: {}", message),
                PlayerEvent::PositionChanged { .. } => {}
            }
        }
    }
}

impl ApplicationHandler for App {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_some() {
            return;
        }
        if let Err(e) = self.start(event_loop) {
            error!("{:#}", e);
            self.error = Some(e);
            event_loop.exit();
        }
    }

    fn window_event(&mut self, event_loop: &ActiveEventLoop, _id: WindowId, event: WindowEvent) {
        match event {
            WindowEvent::CloseRequested => event_loop.exit(),
            WindowEvent::Resized(size) => {
                if let Some(controller) = &self.controller {
                    if let Err(e) = controller.resize(size.width, size.height) {
                        warn!("Resize failed: {}", e);
                    }
                }
            }
            WindowEvent::RedrawRequested => {
                if let Some(controller) = &self.controller {
                    if let Err(e) = controller.redraw() {
                        warn!("Redraw failed: {}", e);
                    }
                }
            }
            WindowEvent::DroppedFile(path) => {
                if let Some(controller) = &self.controller {
                    // Failures are reported through the event channel.
                    let _ = controller.open(&path.to_string_lossy());
                }
            }
            WindowEvent::KeyboardInput {
                event:
                    KeyEvent {
                        physical_key: PhysicalKey::Code(code),
                        state: ElementState::Pressed,
                        ..
                    },
                ..
            } => self.handle_key(code, event_loop),
            _ => {}
        }
    }

    fn about_to_wait(&mut self, event_loop: &ActiveEventLoop) {
        self.drain_events();
        event_loop.set_control_flow(ControlFlow::WaitUntil(Instant::now() + EVENT_POLL_INTERVAL));
    }
}

/// Open the file named on the command line
///
/// A failure leaves the session stopped with the window open, ready for a
/// dropped file.
fn open_initial(controller: &PlaybackController, source: &str) -> bool {
    match controller.open(source) {
        Ok(_) => true,
        Err(e) => {
            error!("Could not open {}: {}", source, e);
            false
        }
    }
}

/// Logs playback position about once per second
#[derive(Default)]
struct PositionLogger {
    last_second: Option<u64>,
}

impl PlayerEventHandler for PositionLogger {
    fn handle_event(&mut self, event: PlayerEvent) {
        if let PlayerEvent::PositionChanged { position } = event {
            let second = position.as_secs();
            if self.last_second != Some(second) {
                self.last_second = Some(second);
                debug!("Position: {}", format_duration(position));
            }
        }
    }
}
