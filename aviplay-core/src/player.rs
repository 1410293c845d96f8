//! # Playback Controller
//!
//! Session lifecycle: INIT → PLAYING → STOPPED.
//!
//! ```text
//!  open(container) ─► start(display, audio) ─► run(events) ─► teardown
//!                          │                       │
//!                          ├─ aviplay-video thread: SyncEngine::run
//!                          └─ device callback:      AudioPull::fill
//! ```
//!
//! The two execution paths share only the `StatusFlag` and the
//! `AudioPosition`. Teardown joins the video thread before the display and
//! the audio device go away.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use thiserror::Error;

use crate::audio::{AudioOutput, AudioPull, AudioSpec};
use crate::config::PlaybackConfig;
use crate::container::open_avi;
use crate::display::{DisplayError, DisplaySurface, OverlayFormat, Presenter};
use crate::events::{EventSource, PlayerEvent};
use crate::stream::{AudioStream, Container, PixelFormat, VideoInfo, VideoStream};
use crate::sync::{AudioPosition, PlaybackClock, StatusFlag, SyncEngine, SyncStats};

#[derive(Debug, Error)]
pub enum SetupError {
    #[error("File not found: {}", .0.display())]
    NotFound(PathBuf),
    #[error("Invalid container: {0}")]
    InvalidContainer(String),
    #[error("No video stream")]
    NoVideoStream,
    #[error("No decoder: {0}")]
    NoDecoder(String),
    #[error("Display setup failed: {0}")]
    Display(#[from] DisplayError),
    #[error("Playback already started")]
    AlreadyStarted,
    #[error("Failed to spawn video thread: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Why `run` returned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackExit {
    /// The video stream ended
    Finished,
    /// Confirm key or mouse click
    Skipped,
    Quit,
}

/// What the video thread hands back when it ends
struct Production {
    video: Box<dyn VideoStream>,
    presenter: Presenter,
    stats: SyncStats,
}

struct Session {
    worker: Option<JoinHandle<Production>>,
    audio: Option<Box<dyn AudioOutput>>,
}

pub struct PlaybackController {
    config: PlaybackConfig,
    container: Box<dyn Container>,
    video: Option<Box<dyn VideoStream>>,
    info: VideoInfo,
    status: Arc<StatusFlag>,
    session: Option<Session>,
    stats: Option<SyncStats>,
}

impl PlaybackController {
    /// Take video stream 0 of `container`
    pub fn open(mut container: Box<dyn Container>, config: PlaybackConfig) -> Result<Self, SetupError> {
        let video = container.video_stream(0).ok_or(SetupError::NoVideoStream)?;
        let info = video.info();
        tracing::debug!("Video {}x{} @ {:.3} fps", info.width, info.height, info.fps);
        info.validate().map_err(SetupError::InvalidContainer)?;

        Ok(Self {
            config,
            container,
            video: Some(video),
            info,
            status: Arc::new(StatusFlag::new()),
            session: None,
            stats: None,
        })
    }

    pub fn video_info(&self) -> VideoInfo {
        self.info
    }

    pub fn status(&self) -> Arc<StatusFlag> {
        self.status.clone()
    }

    /// Counters of the finished session
    pub fn stats(&self) -> Option<&SyncStats> {
        self.stats.as_ref()
    }

    /// Set up the overlay and audio, then start both execution paths.
    /// Audio problems leave playback muted; everything else is fatal.
    pub fn start(
        &mut self,
        display: Box<dyn DisplaySurface>,
        audio_output: Option<Box<dyn AudioOutput>>,
    ) -> Result<(), SetupError> {
        let mut video = self.video.take().ok_or(SetupError::AlreadyStarted)?;

        video
            .start_streaming()
            .map_err(|e| SetupError::NoDecoder(e.to_string()))?;

        let overlay_format = match negotiate_format(video.as_mut()) {
            Ok(format) => format,
            Err(e) => {
                video.stop_streaming();
                return Err(e);
            }
        };
        tracing::debug!(
            "Decoder output {:?} onto {:?} overlay",
            video.output_format(),
            overlay_format
        );

        let presenter = match Presenter::new(display, self.info.width, self.info.height, overlay_format) {
            Ok(presenter) => presenter,
            Err(e) => {
                video.stop_streaming();
                return Err(e.into());
            }
        };

        let position = Arc::new(AudioPosition::new());
        let audio = match (self.config.audio, audio_output) {
            (true, Some(output)) => self.open_audio(output),
            (true, None) => {
                tracing::debug!("No audio output device, playing muted");
                None
            }
            (false, _) => None,
        };

        let clock = match &audio {
            Some(_) => PlaybackClock::audio(position.clone()),
            None => PlaybackClock::wall(),
        };

        let status = self.status.clone();
        let worker = thread::Builder::new()
            .name("aviplay-video".into())
            .spawn(move || {
                let mut video = video;
                let mut presenter = presenter;
                let stats = SyncEngine::new().run(video.as_mut(), &mut presenter, &clock, &status, &mut thread::sleep);
                Production {
                    video,
                    presenter,
                    stats,
                }
            })?;

        let audio = audio.map(|(mut output, stream)| {
            let mut pull = AudioPull::new(stream, self.status.clone(), position);
            output.register_pull(Box::new(move |buf: &mut [u8]| {
                pull.fill(buf);
            }));
            output
        });

        self.session = Some(Session {
            worker: Some(worker),
            audio,
        });
        Ok(())
    }

    /// Audio stream 0 on an opened device, or `None` to play muted
    fn open_audio(&mut self, mut output: Box<dyn AudioOutput>) -> Option<(Box<dyn AudioOutput>, Box<dyn AudioStream>)> {
        let mut stream = self.container.audio_stream(0)?;

        if let Err(e) = stream.start_streaming() {
            tracing::warn!("Audio stream failed to start, playing muted: {}", e);
            return None;
        }

        let format = stream.output_format();
        let spec = AudioSpec {
            sample_rate: format.sample_rate,
            channels: format.channels,
            format: format.tag,
            buffer_samples: self.config.audio_buffer_samples,
        };

        match output.open(&spec) {
            Ok(()) => {
                tracing::debug!("Audio: {} Hz, {} ch, {:?}", spec.sample_rate, spec.channels, spec.format);
                Some((output, stream))
            }
            Err(e) => {
                tracing::warn!("Audio device unavailable, playing muted: {}", e);
                stream.stop_streaming();
                None
            }
        }
    }

    /// Pump events until playback ends, then tear the session down
    pub fn run(&mut self, events: &mut dyn EventSource) -> PlaybackExit {
        if self.session.is_none() {
            self.status.stop();
            return PlaybackExit::Finished;
        }

        let poll = self.config.poll_interval();
        let mut exit = PlaybackExit::Finished;

        'playing: while self.status.is_playing() {
            while let Some(event) = events.poll_event() {
                if !event.stops_playback(self.config.skippable) {
                    tracing::trace!("Ignoring {:?}, playback not skippable", event);
                    continue;
                }
                // Lost race with the end of the stream: still Finished
                if self.status.stop() {
                    exit = match event {
                        PlayerEvent::Quit => PlaybackExit::Quit,
                        _ => PlaybackExit::Skipped,
                    };
                }
                break 'playing;
            }
            thread::sleep(poll);
        }

        self.teardown();
        tracing::info!("Playback ended: {:?}", exit);
        exit
    }

    fn teardown(&mut self) {
        self.status.stop();
        let Some(mut session) = self.session.take() else {
            return;
        };

        if let Some(worker) = session.worker.take() {
            match worker.join() {
                Ok(production) => {
                    let Production {
                        mut video,
                        presenter,
                        stats,
                    } = production;
                    video.stop_streaming();
                    drop(presenter);
                    self.stats = Some(stats);
                }
                Err(_) => tracing::warn!("Video thread panicked"),
            }
        }

        // Dropping the callback drops the AudioPull, which stops the stream
        if let Some(mut output) = session.audio.take() {
            output.unregister_pull();
        }
    }
}

impl Drop for PlaybackController {
    fn drop(&mut self) {
        self.teardown();
    }
}

/// Prefer YV12, then YUY2; anything else is converted from BGR
fn negotiate_format(video: &mut dyn VideoStream) -> Result<OverlayFormat, SetupError> {
    let caps = video.decoder_capabilities();
    let no_decoder = |e: crate::stream::DecodeError| SetupError::NoDecoder(e.to_string());

    for (pixel, overlay) in [
        (PixelFormat::Yv12, OverlayFormat::Yv12),
        (PixelFormat::Yuy2, OverlayFormat::Yuy2),
    ] {
        if caps.contains(&pixel) {
            video.set_output_format(pixel).map_err(no_decoder)?;
            return Ok(overlay);
        }
    }

    if video.output_format() != PixelFormat::Bgr24 {
        if !caps.contains(&PixelFormat::Bgr24) {
            return Err(SetupError::NoDecoder(format!(
                "no displayable output among {:?}",
                caps
            )));
        }
        video.set_output_format(PixelFormat::Bgr24).map_err(no_decoder)?;
    }
    Ok(OverlayFormat::Yv12)
}

/// Play an AVI file start to finish
pub fn play_file<P: AsRef<Path>>(
    path: P,
    config: PlaybackConfig,
    display: Box<dyn DisplaySurface>,
    audio_output: Option<Box<dyn AudioOutput>>,
    events: &mut dyn EventSource,
) -> Result<(PlaybackExit, Option<SyncStats>), SetupError> {
    let container = open_avi(path)?;
    let mut controller = PlaybackController::open(Box::new(container), config)?;
    controller.start(display, audio_output)?;
    let exit = controller.run(events);
    Ok((exit, controller.stats.take()))
}

// ============================================================================
// Tests
// ============================================================================
