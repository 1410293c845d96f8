//! Terminal playback: no window, optional PNG dumps

use std::io::BufRead;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread;

use aviplay_core::{DisplayError, DisplaySurface, Overlay, OverlayFormat, PlayerEvent, Rect};

use crate::surface::OverlayConverter;

/// Write every `every`-th blitted frame into `dir`
#[derive(Debug, Clone)]
pub struct DumpSettings {
    pub dir: PathBuf,
    pub every: u64,
}

pub struct HeadlessDisplay {
    size: (u32, u32),
    converter: OverlayConverter,
    dump: Option<DumpSettings>,
    blits: Arc<AtomicU64>,
}

impl HeadlessDisplay {
    pub fn new(dump: Option<DumpSettings>) -> Self {
        Self {
            size: (0, 0),
            converter: OverlayConverter::new(),
            dump,
            blits: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Shared blit counter, readable after the display moved into a session
    pub fn counter(&self) -> Arc<AtomicU64> {
        self.blits.clone()
    }

    fn dump_frame(&self, overlay: &Overlay, index: u64, dump: &DumpSettings) -> Result<(), DisplayError> {
        let rgb = self.converter.to_rgb(overlay);
        let image = image::RgbImage::from_raw(rgb.width, rgb.height, rgb.data)
            .ok_or_else(|| DisplayError::Surface("overlay size does not match image buffer".into()))?;
        let path = dump.dir.join(format!("frame_{:06}.png", index));
        image
            .save(&path)
            .map_err(|e| DisplayError::Surface(format!("{}: {}", path.display(), e)))?;
        tracing::trace!("Dumped {}", path.display());
        Ok(())
    }
}

impl DisplaySurface for HeadlessDisplay {
    /// Native size of the movie once an overlay exists
    fn surface_size(&self) -> (u32, u32) {
        self.size
    }

    fn create_overlay(&mut self, width: u32, height: u32, format: OverlayFormat) -> Result<Overlay, DisplayError> {
        if let Some(dump) = &self.dump {
            std::fs::create_dir_all(&dump.dir)
                .map_err(|e| DisplayError::Surface(format!("{}: {}", dump.dir.display(), e)))?;
        }
        self.size = (width, height);
        Ok(Overlay::new(width, height, format))
    }

    fn blit(&mut self, overlay: &Overlay, _dest: Rect) -> Result<(), DisplayError> {
        let index = self.blits.fetch_add(1, Ordering::Relaxed);
        match &self.dump {
            Some(dump) if index % dump.every.max(1) == 0 => self.dump_frame(overlay, index, dump),
            _ => Ok(()),
        }
    }
}

/// Ctrl-C quits, a line on stdin confirms
pub fn terminal_events() -> anyhow::Result<Receiver<PlayerEvent>> {
    let (tx, rx) = mpsc::channel();

    let quit = tx.clone();
    ctrlc::set_handler(move || {
        let _ = quit.send(PlayerEvent::Quit);
    })?;

    thread::Builder::new()
        .name("aviplay-stdin".into())
        .spawn(move || forward_lines(std::io::stdin().lock(), tx))?;

    Ok(rx)
}

fn forward_lines<R: BufRead>(input: R, tx: Sender<PlayerEvent>) {
    for line in input.lines() {
        if line.is_err() || tx.send(PlayerEvent::ConfirmKey).is_err() {
            break;
        }
    }
}
