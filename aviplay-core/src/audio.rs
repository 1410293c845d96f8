// Audio pull path
// Decoded PCM -> residue buffer -> device pull callback
//
// The device asks for exactly N bytes per callback. Decoders work in whole
// packets, so whatever a packet yields beyond N is carried in the residue
// block until the next callback.

use std::sync::Arc;
use thiserror::Error;

use crate::stream::{AudioStream, SampleTag};
use crate::sync::{AudioPosition, StatusFlag};

/// Device buffer size in sample frames
pub const AUDIO_BUFFER_SAMPLES: u16 = 4096;

/// Residue capacity in bytes
pub const RESIDUE_CAPACITY: usize = AUDIO_BUFFER_SAMPLES as usize * 4;

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("No audio output device")]
    NoDevice,
    #[error("Unsupported audio format: {0}")]
    UnsupportedFormat(String),
    #[error("Failed to open audio device: {0}")]
    Open(String),
}

// ============================================================================
// Residue
// ============================================================================

/// Fixed-capacity block of decoded bytes not yet delivered to the device
#[derive(Debug)]
pub struct AudioResidue {
    buf: Box<[u8]>,
    len: usize,
    overflows: u64,
}

impl Default for AudioResidue {
    fn default() -> Self {
        Self::with_capacity(RESIDUE_CAPACITY)
    }
}

impl AudioResidue {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: vec![0u8; capacity].into_boxed_slice(),
            len: 0,
            overflows: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// Overruns discarded because they did not fit
    pub fn overflows(&self) -> u64 {
        self.overflows
    }

    /// Move up to `dst.len()` bytes out. What is left moves to the front.
    pub fn drain_into(&mut self, dst: &mut [u8]) -> usize {
        let n = self.len.min(dst.len());
        dst[..n].copy_from_slice(&self.buf[..n]);
        self.buf.copy_within(n..self.len, 0);
        self.len -= n;
        n
    }

    /// Keep `bytes` for the next pull. An overrun larger than the capacity
    /// is discarded whole and counted.
    pub fn store(&mut self, bytes: &[u8]) -> bool {
        debug_assert!(self.is_empty(), "residue refilled before it was drained");
        if bytes.len() > self.capacity() {
            self.overflows += 1;
            self.len = 0;
            return false;
        }
        self.buf[..bytes.len()].copy_from_slice(bytes);
        self.len = bytes.len();
        true
    }
}

// ============================================================================
// Pull callback state
// ============================================================================

/// Everything the device callback needs. Owned by the registered closure;
/// the device never runs two callbacks at once.
pub struct AudioPull {
    stream: Box<dyn AudioStream>,
    residue: AudioResidue,
    decoded: Vec<u8>,
    silence: u8,
    status: Arc<StatusFlag>,
    position: Arc<AudioPosition>,
    ended: bool,
}

impl AudioPull {
    pub fn new(stream: Box<dyn AudioStream>, status: Arc<StatusFlag>, position: Arc<AudioPosition>) -> Self {
        let silence = stream.output_format().tag.silence();
        Self {
            stream,
            residue: AudioResidue::default(),
            decoded: Vec::with_capacity(RESIDUE_CAPACITY),
            silence,
            status,
            position,
            ended: false,
        }
    }

    pub fn residue(&self) -> &AudioResidue {
        &self.residue
    }

    /// Fill `dst` with PCM. Returns the bytes of real audio written; the rest
    /// of `dst` is silence. An empty request means the device is shutting
    /// down and stops playback.
    pub fn fill(&mut self, dst: &mut [u8]) -> usize {
        if dst.is_empty() {
            self.status.stop();
            return 0;
        }

        let mut count = self.residue.drain_into(dst);

        while count < dst.len() && !self.ended && !self.stream.at_end() {
            let want = dst.len() - count;
            let read = match self.stream.read_frames(&mut self.decoded, want) {
                Ok(read) => read,
                Err(e) => {
                    tracing::warn!("Audio decode failed, ending audio: {}", e);
                    self.ended = true;
                    break;
                }
            };
            self.position.set(self.stream.current_time());

            let produced = read.bytes.min(self.decoded.len());
            if produced == 0 {
                self.ended = true;
                break;
            }

            if produced <= want {
                dst[count..count + produced].copy_from_slice(&self.decoded[..produced]);
                count += produced;
            } else {
                dst[count..].copy_from_slice(&self.decoded[..want]);
                count += want;
                if !self.residue.store(&self.decoded[want..produced]) {
                    tracing::trace!(
                        "Audio overrun of {} bytes exceeds residue capacity, dropped",
                        produced - want
                    );
                }
            }
        }

        dst[count..].fill(self.silence);
        count
    }
}

impl Drop for AudioPull {
    fn drop(&mut self) {
        self.stream.stop_streaming();
    }
}

// ============================================================================
// Output device
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioSpec {
    pub sample_rate: u32,
    pub channels: u16,
    pub format: SampleTag,
    pub buffer_samples: u16,
}

/// Device pull callback: fill the whole slice with PCM bytes
pub type PullCallback = Box<dyn FnMut(&mut [u8]) + Send + 'static>;

pub trait AudioOutput {
    fn open(&mut self, spec: &AudioSpec) -> Result<(), DeviceError>;

    /// Install the callback. Until one is registered the device plays silence.
    fn register_pull(&mut self, callback: PullCallback);

    /// Remove the callback. Returns once no callback is running.
    fn unregister_pull(&mut self);
}

#[cfg(feature = "audio")]
pub use cpal_output::CpalOutput;

#[cfg(feature = "audio")]
mod cpal_output {
    use super::*;
    use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
    use cpal::{BufferSize, Device, FromSample, SampleFormat, SizedSample, Stream, StreamConfig};
    use parking_lot::Mutex;

    type CallbackSlot = Arc<Mutex<Option<PullCallback>>>;

    /// Default output device via cpal
    pub struct CpalOutput {
        stream: Option<Stream>,
        slot: CallbackSlot,
    }

    impl Default for CpalOutput {
        fn default() -> Self {
            Self::new()
        }
    }

    impl CpalOutput {
        pub fn new() -> Self {
            Self {
                stream: None,
                slot: Arc::new(Mutex::new(None)),
            }
        }

        fn build(&self, device: &Device, config: &StreamConfig, format: SampleTag) -> Result<Stream, DeviceError> {
            let device_format = device
                .default_output_config()
                .map(|c| c.sample_format())
                .unwrap_or(SampleFormat::I16);

            match device_format {
                SampleFormat::F32 => build_stream::<f32>(device, config, format, self.slot.clone()),
                _ => build_stream::<i16>(device, config, format, self.slot.clone()),
            }
        }
    }

    fn build_stream<T>(device: &Device, config: &StreamConfig, format: SampleTag, slot: CallbackSlot) -> Result<Stream, DeviceError>
    where
        T: SizedSample + FromSample<i16>,
    {
        let bytes_per_sample = match format {
            SampleTag::U8 => 1,
            SampleTag::S16Le => 2,
        };
        let silence = format.silence();
        let mut scratch: Vec<u8> = Vec::new();

        device
            .build_output_stream(
                config,
                move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
                    scratch.clear();
                    scratch.resize(data.len() * bytes_per_sample, silence);
                    if let Some(pull) = slot.lock().as_mut() {
                        pull(&mut scratch);
                    }
                    match format {
                        SampleTag::S16Le => {
                            for (out, b) in data.iter_mut().zip(scratch.chunks_exact(2)) {
                                *out = T::from_sample(i16::from_le_bytes([b[0], b[1]]));
                            }
                        }
                        SampleTag::U8 => {
                            for (out, &b) in data.iter_mut().zip(scratch.iter()) {
                                *out = T::from_sample((b as i16 - 128) << 8);
                            }
                        }
                    }
                },
                |err| tracing::warn!("Audio stream error: {}", err),
                None,
            )
            .map_err(|e| DeviceError::Open(e.to_string()))
    }

    impl AudioOutput for CpalOutput {
        fn open(&mut self, spec: &AudioSpec) -> Result<(), DeviceError> {
            let device = cpal::default_host()
                .default_output_device()
                .ok_or(DeviceError::NoDevice)?;

            if spec.channels == 0 || spec.sample_rate == 0 {
                return Err(DeviceError::UnsupportedFormat(format!(
                    "{} Hz, {} channels",
                    spec.sample_rate, spec.channels
                )));
            }

            let mut config = StreamConfig {
                channels: spec.channels,
                sample_rate: cpal::SampleRate(spec.sample_rate),
                buffer_size: BufferSize::Fixed(spec.buffer_samples as u32),
            };

            let stream = match self.build(&device, &config, spec.format) {
                Ok(stream) => stream,
                Err(e) => {
                    tracing::debug!("Fixed audio buffer rejected ({}), using device default", e);
                    config.buffer_size = BufferSize::Default;
                    self.build(&device, &config, spec.format)?
                }
            };
            stream.play().map_err(|e| DeviceError::Open(e.to_string()))?;

            tracing::debug!(
                "Audio device open: {} Hz, {} ch, {:?}",
                spec.sample_rate,
                spec.channels,
                spec.format
            );
            self.stream = Some(stream);
            Ok(())
        }

        fn register_pull(&mut self, callback: PullCallback) {
            *self.slot.lock() = Some(callback);
        }

        fn unregister_pull(&mut self) {
            // Taking the lock waits out a running callback
            self.slot.lock().take();
        }
    }

    impl Drop for CpalOutput {
        fn drop(&mut self) {
            self.unregister_pull();
            if let Some(stream) = self.stream.take() {
                let _ = stream.pause();
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::PlaybackStatus;
    use crate::testing::ScriptedAudio;

    fn pull(audio: ScriptedAudio) -> (AudioPull, Arc<StatusFlag>, Arc<AudioPosition>) {
        let status = Arc::new(StatusFlag::new());
        let position = Arc::new(AudioPosition::new());
        let pull = AudioPull::new(Box::new(audio), status.clone(), position.clone());
        (pull, status, position)
    }

    #[test]
    fn test_residue_drain_keeps_remainder() {
        let mut residue = AudioResidue::with_capacity(8);
        assert!(residue.store(&[1, 2, 3, 4, 5]));

        let mut out = [0u8; 2];
        assert_eq!(residue.drain_into(&mut out), 2);
        assert_eq!(out, [1, 2]);
        assert_eq!(residue.len(), 3);

        let mut out = [0u8; 8];
        assert_eq!(residue.drain_into(&mut out), 3);
        assert_eq!(&out[..3], &[3, 4, 5]);
        assert!(residue.is_empty());
    }

    #[test]
    fn test_residue_overflow_discards_whole_overrun() {
        let mut residue = AudioResidue::with_capacity(4);
        assert!(!residue.store(&[9; 5]));
        assert!(residue.is_empty());
        assert_eq!(residue.overflows(), 1);

        // Exactly at capacity fits
        assert!(residue.store(&[7; 4]));
        assert_eq!(residue.len(), 4);
    }

    #[test]
    fn test_zero_length_pull_stops_playback() {
        let (mut pull, status, _) = pull(ScriptedAudio::with_chunks(vec![vec![1; 16]]));
        let mut empty: [u8; 0] = [];
        assert_eq!(pull.fill(&mut empty), 0);
        assert_eq!(status.get(), PlaybackStatus::Stopped);
        assert!(pull.residue().is_empty());
    }

    #[test]
    fn test_overrun_carried_to_next_pull() {
        let chunk: Vec<u8> = (0..10).collect();
        let (mut pull, status, _) = pull(ScriptedAudio::with_chunks(vec![chunk]));

        let mut out = [0u8; 4];
        assert_eq!(pull.fill(&mut out), 4);
        assert_eq!(out, [0, 1, 2, 3]);
        assert_eq!(pull.residue().len(), 6);

        let mut out = [0u8; 4];
        assert_eq!(pull.fill(&mut out), 4);
        assert_eq!(out, [4, 5, 6, 7]);
        assert_eq!(pull.residue().len(), 2);
        assert!(status.is_playing());
    }

    #[test]
    fn test_residue_then_decode_in_one_pull() {
        let (mut pull, _, _) = pull(ScriptedAudio::with_chunks(vec![vec![1; 6], vec![2; 6]]));

        let mut out = [0u8; 4];
        pull.fill(&mut out);
        assert_eq!(pull.residue().len(), 2);

        // 2 residue bytes, then 4 of the next 6-byte chunk
        let mut out = [0u8; 6];
        assert_eq!(pull.fill(&mut out), 6);
        assert_eq!(out, [1, 1, 2, 2, 2, 2]);
        assert_eq!(pull.residue().len(), 2);
    }

    #[test]
    fn test_end_of_stream_pads_silence() {
        let audio = ScriptedAudio::with_chunks(vec![vec![5; 3]]).with_tag(SampleTag::U8);
        let (mut pull, status, _) = pull(audio);

        let mut out = [0u8; 6];
        assert_eq!(pull.fill(&mut out), 3);
        assert_eq!(out, [5, 5, 5, 0x80, 0x80, 0x80]);

        // Nothing left: all silence, playback status untouched
        let mut out = [1u8; 4];
        assert_eq!(pull.fill(&mut out), 0);
        assert_eq!(out, [0x80; 4]);
        assert!(status.is_playing());
    }

    #[test]
    fn test_oversized_overrun_dropped_deterministically() {
        let big = vec![3u8; RESIDUE_CAPACITY + 8];
        let run = || {
            let (mut pull, _, _) = pull(ScriptedAudio::with_chunks(vec![big.clone(), vec![4; 8]]));
            let mut out = [0u8; 4];
            pull.fill(&mut out);
            let overflowed = pull.residue().overflows();
            let mut next = [0u8; 4];
            pull.fill(&mut next);
            (out, overflowed, next)
        };

        let first = run();
        // Overrun of RESIDUE_CAPACITY + 4 bytes does not fit: next pull decodes fresh data
        assert_eq!(first, ([3; 4], 1, [4; 4]));
        assert_eq!(first, run());
    }

    #[test]
    fn test_position_published_after_decode() {
        let audio = ScriptedAudio::with_chunks(vec![vec![0; 8], vec![0; 8]]).with_bytes_per_sec(16.0);
        let (mut pull, _, position) = pull(audio);
        assert_eq!(position.get(), 0.0);

        let mut out = [0u8; 8];
        pull.fill(&mut out);
        assert_eq!(position.get(), 0.5);

        pull.fill(&mut out);
        assert_eq!(position.get(), 1.0);
    }

    #[test]
    fn test_decode_error_ends_audio_quietly() {
        let audio = ScriptedAudio::with_chunks(vec![vec![1; 2]]).failing_after(1);
        let (mut pull, status, _) = pull(audio);

        let mut out = [9u8; 4];
        assert_eq!(pull.fill(&mut out), 2);
        assert_eq!(out, [1, 1, 0, 0]);
        assert!(status.is_playing());
    }

    #[test]
    fn test_drop_stops_stream() {
        let audio = ScriptedAudio::with_chunks(vec![]);
        let stopped = audio.stopped_flag();
        let (pull, _, _) = pull(audio);
        drop(pull);
        assert!(stopped.load(std::sync::atomic::Ordering::SeqCst));
    }
}
