//! # Stream Source
//!
//! The decode-side collaborators the sync engine depends on. A `Container`
//! hands out independent video and audio streams; each stream is driven by
//! exactly one thread (video by the production loop, audio by the device
//! pull callback).

use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("Unsupported format: {0}")]
    Unsupported(String),
    #[error("Corrupt data: {0}")]
    Corrupt(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

// ============================================================================
// Video
// ============================================================================

/// Pixel layout of a decoded video frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PixelFormat {
    /// Packed B, G, R triplets, top-down rows
    Bgr24,
    /// Packed 4:2:2 (Y0 U Y1 V)
    Yuy2,
    /// Planar 4:2:0, plane order Y, V, U
    Yv12,
}

impl PixelFormat {
    /// Bytes needed for one frame of this format, `None` if it overflows
    pub fn frame_size(&self, width: u32, height: u32) -> Option<usize> {
        let w = width as usize;
        let h = height as usize;
        let luma = w.checked_mul(h)?;
        match self {
            Self::Bgr24 => luma.checked_mul(3),
            Self::Yuy2 => luma.checked_mul(2),
            Self::Yv12 => luma.checked_add((w / 2).checked_mul(h / 2)?.checked_mul(2)?),
        }
    }
}

/// A decoded video frame
///
/// Frames travel as `Arc<VideoFrame>`: the production loop and the frame
/// cache may both hold one, and the image is released with the last of them.
#[derive(Debug, Clone)]
pub struct VideoFrame {
    /// Unique frame ID for tracking
    pub id: u64,
    pub data: Vec<u8>,
    pub format: PixelFormat,
    pub width: u32,
    pub height: u32,
    /// Presentation time in seconds
    pub pts: f64,
}

impl VideoFrame {
    pub fn new(data: Vec<u8>, format: PixelFormat, width: u32, height: u32, pts: f64) -> Self {
        static FRAME_COUNTER: AtomicU64 = AtomicU64::new(0);
        Self {
            id: FRAME_COUNTER.fetch_add(1, Ordering::Relaxed),
            data,
            format,
            width,
            height,
            pts,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VideoInfo {
    pub width: u32,
    pub height: u32,
    pub fps: f64,
}

/// Largest width or height taken from a container header
pub const MAX_DIMENSION: u32 = 16384;

impl VideoInfo {
    /// Header sanity: nonzero bounded size and a positive finite rate
    pub fn validate(&self) -> Result<(), String> {
        if self.width == 0 || self.height == 0 || self.width > MAX_DIMENSION || self.height > MAX_DIMENSION {
            return Err(format!(
                "frame size {}x{} outside 1..={}",
                self.width, self.height, MAX_DIMENSION
            ));
        }
        if !self.fps.is_finite() || self.fps <= 0.0 {
            return Err(format!("frame rate {} is not usable", self.fps));
        }
        Ok(())
    }
}

pub trait VideoStream: Send {
    fn info(&self) -> VideoInfo;

    /// Prepare the decoder. Fails when no decoder exists for the stream.
    fn start_streaming(&mut self) -> Result<(), DecodeError>;

    fn stop_streaming(&mut self);

    /// Output formats the decoder can produce, in no particular order
    fn decoder_capabilities(&self) -> Vec<PixelFormat>;

    fn set_output_format(&mut self, format: PixelFormat) -> Result<(), DecodeError>;

    /// Current output format
    fn output_format(&self) -> PixelFormat;

    /// Next decoded frame, `None` at end of stream
    fn next_frame(&mut self, blocking: bool) -> Result<Option<VideoFrame>, DecodeError>;

    /// Presentation time of the last frame returned
    fn current_time(&self) -> f64;

    fn at_end(&self) -> bool;
}

// ============================================================================
// Audio
// ============================================================================

/// Sample encoding of decoded PCM
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleTag {
    U8,
    S16Le,
}

impl SampleTag {
    /// Byte value that plays as silence
    pub fn silence(&self) -> u8 {
        match self {
            Self::U8 => 0x80,
            Self::S16Le => 0x00,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioFormat {
    pub sample_rate: u32,
    pub channels: u16,
    pub bits_per_sample: u16,
    pub tag: SampleTag,
}

impl AudioFormat {
    pub fn bytes_per_frame(&self) -> usize {
        self.channels as usize * (self.bits_per_sample as usize / 8)
    }

    pub fn bytes_per_sec(&self) -> f64 {
        self.sample_rate as f64 * self.bytes_per_frame() as f64
    }
}

/// Result of one `read_frames` call
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReadFrames {
    /// Sample frames produced (one per channel group)
    pub samples: usize,
    pub bytes: usize,
}

pub trait AudioStream: Send {
    fn start_streaming(&mut self) -> Result<(), DecodeError>;

    fn stop_streaming(&mut self);

    fn output_format(&self) -> AudioFormat;

    /// Decode the next packets toward `requested_bytes` of PCM, replacing the
    /// contents of `dst`. A decoder works in whole packets, so `dst` may end
    /// up shorter or longer than requested. Zero bytes means end of stream.
    fn read_frames(&mut self, dst: &mut Vec<u8>, requested_bytes: usize) -> Result<ReadFrames, DecodeError>;

    /// Stream time of everything decoded so far, in seconds
    fn current_time(&self) -> f64;

    fn at_end(&self) -> bool;
}

// ============================================================================
// Container
// ============================================================================

pub trait Container: Send {
    fn video_stream(&mut self, index: usize) -> Option<Box<dyn VideoStream>>;

    fn audio_stream(&mut self, index: usize) -> Option<Box<dyn AudioStream>>;
}
