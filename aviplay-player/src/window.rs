//! # Window Playback (eframe)
//!
//! The session runs on its own thread. Blits land in a shared slot that the
//! UI thread uploads as a texture; input goes back over a channel.

use anyhow::Result;
use eframe::egui::{self, ColorImage, TextureHandle, TextureOptions};
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use aviplay_core::{
    play_file, DisplayError, DisplaySurface, Overlay, OverlayFormat, PlaybackConfig, PlayerEvent, Rect,
};

use crate::surface::{letterbox, OverlayConverter, RgbFrame};
use crate::{AudioFactory, SessionOutcome};

// ============================================================================
// Shared State (between session thread and UI)
// ============================================================================

#[derive(Default)]
struct WindowShared {
    /// Latest blitted frame not yet uploaded
    frame: Mutex<Option<RgbFrame>>,
    /// Window size in physical pixels
    size: Mutex<(u32, u32)>,
    finished: AtomicBool,
}

// ============================================================================
// Display Surface
// ============================================================================

pub struct WindowDisplay {
    shared: Arc<WindowShared>,
    ctx: egui::Context,
    converter: OverlayConverter,
}

impl DisplaySurface for WindowDisplay {
    fn surface_size(&self) -> (u32, u32) {
        *self.shared.size.lock()
    }

    fn create_overlay(&mut self, width: u32, height: u32, format: OverlayFormat) -> Result<Overlay, DisplayError> {
        tracing::debug!("Window overlay {}x{} {:?}", width, height, format);
        Ok(Overlay::new(width, height, format))
    }

    /// The UI letterboxes into its own panel, so `dest` only matters for size
    fn blit(&mut self, overlay: &Overlay, _dest: Rect) -> Result<(), DisplayError> {
        let rgb = self.converter.to_rgb(overlay);
        *self.shared.frame.lock() = Some(rgb);
        self.ctx.request_repaint();
        Ok(())
    }
}

// ============================================================================
// Application
// ============================================================================

struct PlayerApp {
    shared: Arc<WindowShared>,
    events: Sender<PlayerEvent>,
    texture: Option<TextureHandle>,
    frame_size: (u32, u32),
}

impl PlayerApp {
    fn upload(&mut self, ctx: &egui::Context) {
        let Some(frame) = self.shared.frame.lock().take() else {
            return;
        };
        let image = ColorImage::from_rgb([frame.width as usize, frame.height as usize], &frame.data);
        match &mut self.texture {
            Some(texture) => texture.set(image, TextureOptions::LINEAR),
            None => self.texture = Some(ctx.load_texture("video_frame", image, TextureOptions::LINEAR)),
        }
        self.frame_size = (frame.width, frame.height);
    }

    fn forward_input(&self, ctx: &egui::Context) {
        let (close, confirm, click) = ctx.input(|i| {
            (
                i.viewport().close_requested(),
                i.key_pressed(egui::Key::Enter) || i.key_pressed(egui::Key::Space) || i.key_pressed(egui::Key::Escape),
                i.pointer.any_pressed(),
            )
        });
        // The session may already be gone; nothing left to tell it then
        if close {
            let _ = self.events.send(PlayerEvent::Quit);
        }
        if confirm {
            let _ = self.events.send(PlayerEvent::ConfirmKey);
        }
        if click {
            let _ = self.events.send(PlayerEvent::MouseDown);
        }
    }
}

impl eframe::App for PlayerApp {
    fn update(&mut self, ctx: &egui::Context, _frame: &mut eframe::Frame) {
        let screen = ctx.screen_rect();
        let ppp = ctx.pixels_per_point();
        *self.shared.size.lock() = ((screen.width() * ppp) as u32, (screen.height() * ppp) as u32);

        self.upload(ctx);
        self.forward_input(ctx);

        if self.shared.finished.load(Ordering::Acquire) {
            ctx.send_viewport_cmd(egui::ViewportCommand::Close);
        }

        egui::CentralPanel::default()
            .frame(egui::Frame::none().fill(egui::Color32::BLACK))
            .show(ctx, |ui| {
                let rect = ui.max_rect();
                if let Some(texture) = &self.texture {
                    let (x, y, w, h) = letterbox(self.frame_size, (rect.width(), rect.height()));
                    let video_rect = egui::Rect::from_min_size(egui::pos2(rect.min.x + x, rect.min.y + y), egui::vec2(w, h));
                    ui.painter().image(
                        texture.id(),
                        video_rect,
                        egui::Rect::from_min_max(egui::pos2(0.0, 0.0), egui::pos2(1.0, 1.0)),
                        egui::Color32::WHITE,
                    );
                }
            });
    }
}

// ============================================================================
// Entry
// ============================================================================

pub fn run_window(path: PathBuf, config: PlaybackConfig, make_audio: AudioFactory) -> Result<SessionOutcome> {
    let title = format!(
        "aviplay - {}",
        path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default()
    );
    let session: Arc<Mutex<Option<JoinHandle<SessionOutcome>>>> = Arc::new(Mutex::new(None));
    let session_slot = session.clone();

    let options = eframe::NativeOptions {
        viewport: egui::ViewportBuilder::default()
            .with_title(title.as_str())
            .with_inner_size([640.0, 480.0])
            .with_min_inner_size([320.0, 200.0]),
        ..Default::default()
    };

    eframe::run_native(
        "aviplay",
        options,
        Box::new(move |cc| {
            let shared = Arc::new(WindowShared::default());
            let (tx, rx) = mpsc::channel();
            let display = WindowDisplay {
                shared: shared.clone(),
                ctx: cc.egui_ctx.clone(),
                converter: OverlayConverter::new(),
            };

            let thread_shared = shared.clone();
            let ctx = cc.egui_ctx.clone();
            let handle = thread::Builder::new().name("aviplay-session".into()).spawn(move || {
                let mut events = rx;
                let audio = if config.audio { make_audio() } else { None };
                let outcome = play_file(&path, config, Box::new(display), audio, &mut events);
                thread_shared.finished.store(true, Ordering::Release);
                ctx.request_repaint();
                outcome
            })?;
            *session_slot.lock() = Some(handle);

            Ok(Box::new(PlayerApp {
                shared,
                events: tx,
                texture: None,
                frame_size: (0, 0),
            }))
        }),
    )
    .map_err(|e| anyhow::anyhow!("eframe error: {}", e))?;

    let handle = session
        .lock()
        .take()
        .ok_or_else(|| anyhow::anyhow!("Window closed before playback started"))?;
    handle
        .join()
        .map_err(|_| anyhow::anyhow!("Playback thread panicked"))
}
