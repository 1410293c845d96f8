//! Overlay to RGB24 for presentation
//!
//! Both surfaces keep the overlay in YUV and only convert when a frame is
//! blitted. BT.601 studio range with precomputed fixed-point tables.

use aviplay_core::{Overlay, OverlayFormat};

/// Packed RGB24 image ready for a texture or a PNG
#[derive(Debug, Clone, PartialEq)]
pub struct RgbFrame {
    pub width: u32,
    pub height: u32,
    pub data: Vec<u8>,
}

pub struct OverlayConverter {
    y_table: [i32; 256],
    v_table_r: [i32; 256],
    u_table_g: [i32; 256],
    v_table_g: [i32; 256],
    u_table_b: [i32; 256],
}

impl Default for OverlayConverter {
    fn default() -> Self {
        Self::new()
    }
}

impl OverlayConverter {
    pub fn new() -> Self {
        let mut converter = Self {
            y_table: [0; 256],
            v_table_r: [0; 256],
            u_table_g: [0; 256],
            v_table_g: [0; 256],
            u_table_b: [0; 256],
        };
        // Coefficients scaled by 256
        for i in 0..256 {
            let y = i as i32 - 16;
            let c = i as i32 - 128;
            converter.y_table[i] = 298 * y + 128;
            converter.v_table_r[i] = 409 * c;
            converter.u_table_g[i] = -100 * c;
            converter.v_table_g[i] = -208 * c;
            converter.u_table_b[i] = 516 * c;
        }
        converter
    }

    #[inline]
    fn pixel(&self, y: u8, u: u8, v: u8, out: &mut [u8]) {
        let luma = self.y_table[y as usize];
        let (u, v) = (u as usize, v as usize);
        out[0] = ((luma + self.v_table_r[v]) >> 8).clamp(0, 255) as u8;
        out[1] = ((luma + self.u_table_g[u] + self.v_table_g[v]) >> 8).clamp(0, 255) as u8;
        out[2] = ((luma + self.u_table_b[u]) >> 8).clamp(0, 255) as u8;
    }

    pub fn to_rgb(&self, overlay: &Overlay) -> RgbFrame {
        let width = overlay.width() as usize;
        let height = overlay.height() as usize;
        let mut data = vec![0u8; width * height * 3];
        let planes = overlay.planes();

        match overlay.format() {
            OverlayFormat::Yv12 => {
                let (y_plane, v_plane, u_plane) = (&planes[0], &planes[1], &planes[2]);
                let cw = width / 2;
                let ch = height / 2;
                for row in 0..height {
                    // Odd trailing rows and columns reuse the last chroma sample
                    let crow = (row / 2).min(ch.saturating_sub(1));
                    for col in 0..width {
                        let ccol = (col / 2).min(cw.saturating_sub(1));
                        let (u, v) = if cw == 0 || ch == 0 {
                            (128, 128)
                        } else {
                            (u_plane[crow * cw + ccol], v_plane[crow * cw + ccol])
                        };
                        let dst = (row * width + col) * 3;
                        self.pixel(y_plane[row * width + col], u, v, &mut data[dst..dst + 3]);
                    }
                }
            }
            OverlayFormat::Yuy2 => {
                // Y0 U Y1 V
                let packed = &planes[0];
                for (i, quad) in packed.chunks_exact(4).take(width * height / 2).enumerate() {
                    let dst = i * 6;
                    self.pixel(quad[0], quad[1], quad[3], &mut data[dst..dst + 3]);
                    self.pixel(quad[2], quad[1], quad[3], &mut data[dst + 3..dst + 6]);
                }
            }
        }

        RgbFrame {
            width: width as u32,
            height: height as u32,
            data,
        }
    }
}

/// Largest rectangle with the frame's aspect ratio centred in the target
pub fn letterbox(frame: (u32, u32), target: (f32, f32)) -> (f32, f32, f32, f32) {
    let (fw, fh) = (frame.0.max(1) as f32, frame.1.max(1) as f32);
    let (tw, th) = target;
    let aspect = fw / fh;
    let (w, h) = if aspect > tw / th { (tw, tw / aspect) } else { (th * aspect, th) };
    ((tw - w) / 2.0, (th - h) / 2.0, w, h)
}
