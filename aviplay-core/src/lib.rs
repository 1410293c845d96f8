//! # aviplay Core
//!
//! AVI playback engine: demuxing, decoding, audio pull and the
//! audio-clocked video sync loop.

// ============================================================================
// Container / Decoding
// ============================================================================
pub mod avi_demux;
pub mod container;
pub mod decode;
pub mod stream;

// ============================================================================
// Playback
// ============================================================================
pub mod audio;
pub mod display;
pub mod frame_cache;
pub mod sync;

// ============================================================================
// Session
// ============================================================================
pub mod config;
pub mod events;
pub mod player;

#[cfg(test)]
mod testing;

pub use audio::{AudioOutput, AudioSpec, DeviceError, PullCallback, AUDIO_BUFFER_SAMPLES};
pub use avi_demux::{probe, AviInfo};
pub use config::PlaybackConfig;
pub use container::{open_avi, AviContainer};
pub use display::{DisplayError, DisplaySurface, Overlay, OverlayFormat, Rect};
pub use events::{EventSource, PlayerEvent};
pub use player::{play_file, PlaybackController, PlaybackExit, SetupError};
pub use stream::{PixelFormat, VideoFrame, VideoInfo};
pub use sync::SyncStats;

#[cfg(feature = "audio")]
pub use audio::CpalOutput;
