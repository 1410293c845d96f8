//! # Display Surface and Pixel Hand-off
//!
//! The sync engine draws into a YUV overlay and asks the display to blit it.
//! Locking the overlay is the `&mut Overlay` borrow; freeing it is `Drop`.
//!
//! Decoders that can only produce BGR are converted here to planar 4:2:0.
//! That is the one colour conversion this crate does; everything else is a
//! straight copy.

use thiserror::Error;

use crate::stream::{PixelFormat, VideoFrame};

#[derive(Debug, Error)]
pub enum DisplayError {
    #[error("Frame {got:?} does not fit overlay {expected:?} ({width}x{height})")]
    FrameFormat {
        got: PixelFormat,
        expected: OverlayFormat,
        width: u32,
        height: u32,
    },
    #[error("Frame data too short: {got} bytes, need {need}")]
    FrameSize { got: usize, need: usize },
    #[error("Display surface error: {0}")]
    Surface(String),
}

// ============================================================================
// Overlay
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverlayFormat {
    /// Planes: Y, V, U
    Yv12,
    /// One packed plane
    Yuy2,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Rect {
    pub x: i32,
    pub y: i32,
    pub w: u32,
    pub h: u32,
}

/// YUV overlay in system memory
#[derive(Debug, Clone)]
pub struct Overlay {
    format: OverlayFormat,
    width: u32,
    height: u32,
    planes: Vec<Vec<u8>>,
}

impl Overlay {
    pub fn new(width: u32, height: u32, format: OverlayFormat) -> Self {
        let w = width as usize;
        let h = height as usize;
        let planes = match format {
            OverlayFormat::Yv12 => {
                let chroma = (w / 2) * (h / 2);
                vec![vec![16; w * h], vec![128; chroma], vec![128; chroma]]
            }
            OverlayFormat::Yuy2 => {
                let mut packed = vec![0u8; w * h * 2];
                for pair in packed.chunks_exact_mut(2) {
                    pair[0] = 16;
                    pair[1] = 128;
                }
                vec![packed]
            }
        };
        Self {
            format,
            width,
            height,
            planes,
        }
    }

    pub fn format(&self) -> OverlayFormat {
        self.format
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn planes(&self) -> &[Vec<u8>] {
        &self.planes
    }

    pub fn planes_mut(&mut self) -> &mut [Vec<u8>] {
        &mut self.planes
    }
}

pub trait DisplaySurface: Send {
    /// Size of the target surface in pixels
    fn surface_size(&self) -> (u32, u32);

    fn create_overlay(&mut self, width: u32, height: u32, format: OverlayFormat) -> Result<Overlay, DisplayError>;

    /// Scale the overlay onto the surface
    fn blit(&mut self, overlay: &Overlay, dest: Rect) -> Result<(), DisplayError>;
}

/// Anything the sync engine can show a frame on
pub trait FrameSink {
    fn show(&mut self, frame: &VideoFrame) -> Result<(), DisplayError>;
}

// ============================================================================
// Presenter
// ============================================================================

/// Display plus the overlay allocated for this session
pub struct Presenter {
    display: Box<dyn DisplaySurface>,
    overlay: Overlay,
    dest: Rect,
}

impl Presenter {
    pub fn new(mut display: Box<dyn DisplaySurface>, width: u32, height: u32, format: OverlayFormat) -> Result<Self, DisplayError> {
        let overlay = display.create_overlay(width, height, format)?;
        let (w, h) = display.surface_size();
        Ok(Self {
            display,
            overlay,
            dest: Rect { x: 0, y: 0, w, h },
        })
    }

    pub fn overlay(&self) -> &Overlay {
        &self.overlay
    }

    pub fn dest(&self) -> Rect {
        self.dest
    }
}

impl FrameSink for Presenter {
    fn show(&mut self, frame: &VideoFrame) -> Result<(), DisplayError> {
        draw_frame(&mut self.overlay, frame)?;
        self.display.blit(&self.overlay, self.dest)
    }
}

/// Copy (or convert) a decoded frame into the overlay
pub fn draw_frame(overlay: &mut Overlay, frame: &VideoFrame) -> Result<(), DisplayError> {
    let (expected, width, height) = (overlay.format, overlay.width, overlay.height);
    let mismatch = || DisplayError::FrameFormat {
        got: frame.format,
        expected,
        width,
        height,
    };
    if frame.width != overlay.width || frame.height != overlay.height {
        return Err(mismatch());
    }

    match (frame.format, overlay.format) {
        (PixelFormat::Bgr24, OverlayFormat::Yv12) => {
            let need = PixelFormat::Bgr24.frame_size(frame.width, frame.height).ok_or_else(mismatch)?;
            check_len(&frame.data, need)?;
            bgr_to_yv12(&frame.data, frame.width as usize, frame.height as usize, &mut overlay.planes);
        }
        (PixelFormat::Yuy2, OverlayFormat::Yuy2) => {
            let need = PixelFormat::Yuy2.frame_size(frame.width, frame.height).ok_or_else(mismatch)?;
            check_len(&frame.data, need)?;
            overlay.planes[0].copy_from_slice(&frame.data[..need]);
        }
        (PixelFormat::Yv12, OverlayFormat::Yv12) => {
            let need = PixelFormat::Yv12.frame_size(frame.width, frame.height).ok_or_else(mismatch)?;
            check_len(&frame.data, need)?;
            let mut offset = 0;
            for plane in overlay.planes.iter_mut() {
                let len = plane.len();
                plane.copy_from_slice(&frame.data[offset..offset + len]);
                offset += len;
            }
        }
        _ => return Err(mismatch()),
    }
    Ok(())
}

fn check_len(data: &[u8], need: usize) -> Result<(), DisplayError> {
    if data.len() < need {
        return Err(DisplayError::FrameSize { got: data.len(), need });
    }
    Ok(())
}

/// BT.601 studio range, integer
fn bgr_to_yuv(b: u8, g: u8, r: u8) -> (u8, u8, u8) {
    let (r, g, b) = (r as i32, g as i32, b as i32);
    let y = ((66 * r + 129 * g + 25 * b + 128) >> 8) + 16;
    let u = ((-38 * r - 74 * g + 112 * b + 128) >> 8) + 128;
    let v = ((112 * r - 94 * g - 18 * b + 128) >> 8) + 128;
    (y.clamp(0, 255) as u8, u.clamp(0, 255) as u8, v.clamp(0, 255) as u8)
}

fn bgr_to_yv12(bgr: &[u8], width: usize, height: usize, planes: &mut [Vec<u8>]) {
    let (luma, chroma) = planes.split_at_mut(1);
    let (v_plane, u_plane) = chroma.split_at_mut(1);
    let (y_plane, v_plane, u_plane) = (&mut luma[0], &mut v_plane[0], &mut u_plane[0]);

    for (i, px) in bgr.chunks_exact(3).take(width * height).enumerate() {
        y_plane[i] = bgr_to_yuv(px[0], px[1], px[2]).0;
    }

    // Chroma comes from the top-left pixel of each 2x2 block
    let cw = width / 2;
    for i in 0..height / 2 {
        for j in 0..cw {
            let src = ((i * 2) * width + j * 2) * 3;
            let (_, u, v) = bgr_to_yuv(bgr[src], bgr[src + 1], bgr[src + 2]);
            v_plane[i * cw + j] = v;
            u_plane[i * cw + j] = u;
        }
    }
}
