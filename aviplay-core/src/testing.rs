//! Scripted collaborators for unit tests

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::audio::{AudioOutput, AudioSpec, DeviceError, PullCallback};
use crate::display::{DisplayError, DisplaySurface, FrameSink, Overlay, OverlayFormat, Rect};
use crate::events::{EventSource, PlayerEvent};
use crate::stream::{
    AudioFormat, AudioStream, Container, DecodeError, PixelFormat, ReadFrames, SampleTag, VideoFrame, VideoInfo,
    VideoStream,
};
use crate::sync::MasterClock;

// ============================================================================
// Video
// ============================================================================

pub struct ScriptedVideo {
    /// `None`: endless stream at `info.fps`
    times: Option<Vec<f64>>,
    next: usize,
    fail_after: Option<usize>,
    info: VideoInfo,
    caps: Vec<PixelFormat>,
    output: PixelFormat,
    start_error: bool,
    /// Sleep one frame interval per decode, like a real-time source
    paced: bool,
    current: f64,
    stopped: Arc<AtomicBool>,
}

impl ScriptedVideo {
    pub fn with_times(times: &[f64]) -> Self {
        Self {
            times: Some(times.to_vec()),
            next: 0,
            fail_after: None,
            info: VideoInfo {
                width: 4,
                height: 2,
                fps: 25.0,
            },
            caps: vec![PixelFormat::Yv12],
            output: PixelFormat::Yv12,
            start_error: false,
            paced: false,
            current: 0.0,
            stopped: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Frames every 40 ms until stopped
    pub fn endless() -> Self {
        Self {
            times: None,
            ..Self::with_times(&[])
        }
    }

    /// `frames` frames at `fps`
    pub fn at_fps(fps: f64, frames: usize) -> Self {
        let times: Vec<f64> = (0..frames).map(|i| i as f64 / fps).collect();
        let mut video = Self::with_times(&times);
        video.info.fps = fps;
        video
    }

    pub fn failing_after(mut self, frames: usize) -> Self {
        self.fail_after = Some(frames);
        self
    }

    /// Decoder output formats; the first is the initial output
    pub fn with_capabilities(mut self, caps: &[PixelFormat]) -> Self {
        self.caps = caps.to_vec();
        self.output = caps.first().copied().unwrap_or(PixelFormat::Bgr24);
        self
    }

    pub fn paced(mut self) -> Self {
        self.paced = true;
        self
    }

    pub fn without_decoder(mut self) -> Self {
        self.start_error = true;
        self
    }

    pub fn stopped_flag(&self) -> Arc<AtomicBool> {
        self.stopped.clone()
    }

    fn time_of(&self, i: usize) -> Option<f64> {
        match &self.times {
            Some(times) => times.get(i).copied(),
            None => Some(i as f64 / self.info.fps),
        }
    }
}

impl VideoStream for ScriptedVideo {
    fn info(&self) -> VideoInfo {
        self.info
    }

    fn start_streaming(&mut self) -> Result<(), DecodeError> {
        if self.start_error {
            return Err(DecodeError::Unsupported("scripted codec".into()));
        }
        Ok(())
    }

    fn stop_streaming(&mut self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    fn decoder_capabilities(&self) -> Vec<PixelFormat> {
        self.caps.clone()
    }

    fn set_output_format(&mut self, format: PixelFormat) -> Result<(), DecodeError> {
        if !self.caps.contains(&format) {
            return Err(DecodeError::Unsupported(format!("{:?}", format)));
        }
        self.output = format;
        Ok(())
    }

    fn output_format(&self) -> PixelFormat {
        self.output
    }

    fn next_frame(&mut self, _blocking: bool) -> Result<Option<VideoFrame>, DecodeError> {
        if self.fail_after == Some(self.next) {
            return Err(DecodeError::Corrupt("scripted failure".into()));
        }
        let Some(pts) = self.time_of(self.next) else {
            return Ok(None);
        };
        if self.paced {
            std::thread::sleep(std::time::Duration::from_secs_f64(1.0 / self.info.fps));
        }
        self.next += 1;
        self.current = pts;
        let size = self.output.frame_size(self.info.width, self.info.height).unwrap();
        Ok(Some(VideoFrame::new(
            vec![self.next as u8; size],
            self.output,
            self.info.width,
            self.info.height,
            pts,
        )))
    }

    fn current_time(&self) -> f64 {
        self.current
    }

    fn at_end(&self) -> bool {
        self.time_of(self.next).is_none() && self.fail_after != Some(self.next)
    }
}

// ============================================================================
// Audio
// ============================================================================

pub struct ScriptedAudio {
    chunks: VecDeque<Vec<u8>>,
    reads: usize,
    fail_after: Option<usize>,
    format: AudioFormat,
    bytes_per_sec: f64,
    consumed: usize,
    stopped: Arc<AtomicBool>,
}

impl ScriptedAudio {
    /// One chunk per `read_frames` call, 22.05 kHz stereo S16
    pub fn with_chunks(chunks: Vec<Vec<u8>>) -> Self {
        let format = AudioFormat {
            sample_rate: 22050,
            channels: 2,
            bits_per_sample: 16,
            tag: SampleTag::S16Le,
        };
        Self {
            chunks: chunks.into(),
            reads: 0,
            fail_after: None,
            bytes_per_sec: format.bytes_per_sec(),
            format,
            consumed: 0,
            stopped: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_tag(mut self, tag: SampleTag) -> Self {
        self.format.tag = tag;
        self.format.bits_per_sample = match tag {
            SampleTag::U8 => 8,
            SampleTag::S16Le => 16,
        };
        self.bytes_per_sec = self.format.bytes_per_sec();
        self
    }

    pub fn with_bytes_per_sec(mut self, rate: f64) -> Self {
        self.bytes_per_sec = rate;
        self
    }

    pub fn failing_after(mut self, reads: usize) -> Self {
        self.fail_after = Some(reads);
        self
    }

    pub fn stopped_flag(&self) -> Arc<AtomicBool> {
        self.stopped.clone()
    }
}

impl AudioStream for ScriptedAudio {
    fn start_streaming(&mut self) -> Result<(), DecodeError> {
        Ok(())
    }

    fn stop_streaming(&mut self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    fn output_format(&self) -> AudioFormat {
        self.format
    }

    fn read_frames(&mut self, dst: &mut Vec<u8>, _requested_bytes: usize) -> Result<ReadFrames, DecodeError> {
        if self.fail_after == Some(self.reads) {
            return Err(DecodeError::Corrupt("scripted failure".into()));
        }
        self.reads += 1;
        dst.clear();
        if let Some(chunk) = self.chunks.pop_front() {
            dst.extend_from_slice(&chunk);
        }
        self.consumed += dst.len();
        Ok(ReadFrames {
            samples: dst.len() / self.format.bytes_per_frame().max(1),
            bytes: dst.len(),
        })
    }

    fn current_time(&self) -> f64 {
        self.consumed as f64 / self.bytes_per_sec
    }

    fn at_end(&self) -> bool {
        self.chunks.is_empty() && self.fail_after.is_none()
    }
}

// ============================================================================
// Container
// ============================================================================

#[derive(Default)]
pub struct ScriptedContainer {
    pub video: Option<ScriptedVideo>,
    pub audio: Option<ScriptedAudio>,
}

impl ScriptedContainer {
    pub fn new(video: ScriptedVideo) -> Self {
        Self {
            video: Some(video),
            audio: None,
        }
    }

    pub fn with_audio(mut self, audio: ScriptedAudio) -> Self {
        self.audio = Some(audio);
        self
    }
}

impl Container for ScriptedContainer {
    fn video_stream(&mut self, index: usize) -> Option<Box<dyn VideoStream>> {
        if index != 0 {
            return None;
        }
        self.video.take().map(|v| Box::new(v) as Box<dyn VideoStream>)
    }

    fn audio_stream(&mut self, index: usize) -> Option<Box<dyn AudioStream>> {
        if index != 0 {
            return None;
        }
        self.audio.take().map(|a| Box::new(a) as Box<dyn AudioStream>)
    }
}

// ============================================================================
// Clocks
// ============================================================================

pub struct FixedClock(pub f64);

impl MasterClock for FixedClock {
    fn time(&self, _video_time: f64) -> f64 {
        self.0
    }
}

/// Returns the readings in order, then repeats the last
pub struct ScriptedClock {
    readings: Mutex<(Vec<f64>, usize)>,
}

impl ScriptedClock {
    pub fn new(readings: Vec<f64>) -> Self {
        Self {
            readings: Mutex::new((readings, 0)),
        }
    }
}

impl MasterClock for ScriptedClock {
    fn time(&self, _video_time: f64) -> f64 {
        let mut guard = self.readings.lock();
        let (readings, next) = &mut *guard;
        let i = (*next).min(readings.len().saturating_sub(1));
        *next += 1;
        readings.get(i).copied().unwrap_or(0.0)
    }
}

// ============================================================================
// Display
// ============================================================================

#[derive(Default)]
pub struct RecordingSink {
    pub shown: Vec<(u64, f64)>,
}

impl RecordingSink {
    pub fn times(&self) -> Vec<f64> {
        self.shown.iter().map(|(_, t)| *t).collect()
    }
}

impl FrameSink for RecordingSink {
    fn show(&mut self, frame: &VideoFrame) -> Result<(), DisplayError> {
        self.shown.push((frame.id, frame.pts));
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct DisplayLog {
    pub overlays: Vec<(u32, u32, OverlayFormat)>,
    pub blits: Vec<Rect>,
    /// First luma byte of each blitted overlay
    pub first_luma: Vec<u8>,
}

pub struct RecordingDisplay {
    size: (u32, u32),
    fail: bool,
    log: Arc<Mutex<DisplayLog>>,
}

impl RecordingDisplay {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            size: (width, height),
            fail: false,
            log: Arc::default(),
        }
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::new(640, 480)
        }
    }

    pub fn log(&self) -> Arc<Mutex<DisplayLog>> {
        self.log.clone()
    }
}

impl DisplaySurface for RecordingDisplay {
    fn surface_size(&self) -> (u32, u32) {
        self.size
    }

    fn create_overlay(&mut self, width: u32, height: u32, format: OverlayFormat) -> Result<Overlay, DisplayError> {
        if self.fail {
            return Err(DisplayError::Surface("scripted overlay failure".into()));
        }
        self.log.lock().overlays.push((width, height, format));
        Ok(Overlay::new(width, height, format))
    }

    fn blit(&mut self, overlay: &Overlay, dest: Rect) -> Result<(), DisplayError> {
        let mut log = self.log.lock();
        log.blits.push(dest);
        log.first_luma.push(overlay.planes()[0].first().copied().unwrap_or(0));
        Ok(())
    }
}

// ============================================================================
// Audio device
// ============================================================================

#[derive(Default)]
pub struct OutputLog {
    pub opened: Option<AudioSpec>,
    pub callback: Option<PullCallback>,
    pub unregistered: bool,
}

pub struct RecordingOutput {
    fail: bool,
    log: Arc<Mutex<OutputLog>>,
}

impl RecordingOutput {
    pub fn new() -> Self {
        Self {
            fail: false,
            log: Arc::default(),
        }
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            log: Arc::default(),
        }
    }

    pub fn log(&self) -> Arc<Mutex<OutputLog>> {
        self.log.clone()
    }
}

/// Run the registered callback once, as the device would
pub fn pull_device(log: &Mutex<OutputLog>, len: usize) -> Option<Vec<u8>> {
    let mut log = log.lock();
    let callback = log.callback.as_mut()?;
    let mut buf = vec![0xAA; len];
    callback(&mut buf);
    Some(buf)
}

impl AudioOutput for RecordingOutput {
    fn open(&mut self, spec: &AudioSpec) -> Result<(), DeviceError> {
        if self.fail {
            return Err(DeviceError::NoDevice);
        }
        self.log.lock().opened = Some(*spec);
        Ok(())
    }

    fn register_pull(&mut self, callback: PullCallback) {
        self.log.lock().callback = Some(callback);
    }

    fn unregister_pull(&mut self) {
        let mut log = self.log.lock();
        log.callback = None;
        log.unregistered = true;
    }
}

// ============================================================================
// Events
// ============================================================================

/// Returns each scripted poll result in turn, then `None`
pub struct ScriptedEvents(VecDeque<Option<PlayerEvent>>);

impl ScriptedEvents {
    /// `event` on the poll after `idle` empty polls
    pub fn after(idle: usize, event: PlayerEvent) -> Self {
        let mut polls: VecDeque<_> = std::iter::repeat(None).take(idle).collect();
        polls.push_back(Some(event));
        Self(polls)
    }

    pub fn none() -> Self {
        Self(VecDeque::new())
    }
}

impl EventSource for ScriptedEvents {
    fn poll_event(&mut self) -> Option<PlayerEvent> {
        self.0.pop_front().flatten()
    }
}

// ============================================================================
// AVI files
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexMode {
    /// idx1 offsets from the 'movi' fourcc
    Relative,
    /// idx1 offsets from the start of the file
    Absolute,
    None,
}

#[derive(Debug, Clone)]
pub struct AudioTrack {
    pub format_tag: u16,
    pub channels: u16,
    pub sample_rate: u32,
    pub bits: u16,
    pub chunks: Vec<Vec<u8>>,
}

impl AudioTrack {
    pub fn pcm_s16(sample_rate: u32, channels: u16, chunks: Vec<Vec<u8>>) -> Self {
        Self {
            format_tag: 0x0001,
            channels,
            sample_rate,
            bits: 16,
            chunks,
        }
    }

    pub fn pcm_u8(sample_rate: u32, channels: u16, chunks: Vec<Vec<u8>>) -> Self {
        Self {
            bits: 8,
            ..Self::pcm_s16(sample_rate, channels, chunks)
        }
    }

    fn block_align(&self) -> u16 {
        (self.channels * self.bits / 8).max(1)
    }
}

/// In-memory AVI writer
#[derive(Debug, Clone)]
pub struct AviFixture {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    /// biCompression; all zero for BI_RGB
    pub compression: [u8; 4],
    pub bit_count: u16,
    pub top_down: bool,
    pub video_frames: Vec<Vec<u8>>,
    pub audio: Option<AudioTrack>,
    pub index: IndexMode,
    pub rec_lists: bool,
    /// avih dwMicroSecPerFrame; derived from `fps` when unset
    pub frame_period: Option<u32>,
}

impl AviFixture {
    pub fn new(compression: [u8; 4], bit_count: u16, width: u32, height: u32, fps: u32, frames: Vec<Vec<u8>>) -> Self {
        Self {
            width,
            height,
            fps,
            compression,
            bit_count,
            top_down: false,
            video_frames: frames,
            audio: None,
            index: IndexMode::Relative,
            rec_lists: false,
            frame_period: None,
        }
    }

    /// `frames` YV12 frames, frame i filled with i + 1
    pub fn yv12(width: u32, height: u32, fps: u32, frames: usize) -> Self {
        let size = PixelFormat::Yv12.frame_size(width, height).unwrap();
        let data = (0..frames).map(|i| vec![i as u8 + 1; size]).collect();
        Self::new(*b"YV12", 12, width, height, fps, data)
    }

    pub fn with_audio(mut self, audio: AudioTrack) -> Self {
        self.audio = Some(audio);
        self
    }

    pub fn with_index(mut self, index: IndexMode) -> Self {
        self.index = index;
        self
    }

    pub fn with_rec_lists(mut self) -> Self {
        self.rec_lists = true;
        self
    }

    pub fn with_frame_period(mut self, micros: u32) -> Self {
        self.frame_period = Some(micros);
        self
    }

    pub fn top_down(mut self) -> Self {
        self.top_down = true;
        self
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let streams = 1 + self.audio.is_some() as u32;
        let frames = self.video_frames.len() as u32;

        let mut hdrl = Vec::new();
        let mut avih = Vec::new();
        let period = self.frame_period.unwrap_or(1_000_000 / self.fps.max(1));
        for v in [period, 0, 0, 0x10, frames, 0, streams, 0, self.width, self.height, 0, 0, 0, 0] {
            put_u32(&mut avih, v);
        }
        chunk(&mut hdrl, b"avih", &avih);

        // Video stream
        let mut strl = Vec::new();
        let mut strh = Vec::new();
        strh.extend_from_slice(b"vids");
        strh.extend_from_slice(&self.compression);
        put_u32(&mut strh, 0);
        put_u16(&mut strh, 0);
        put_u16(&mut strh, 0);
        for v in [0, 1, self.fps, 0, frames, 0, 0, 0] {
            put_u32(&mut strh, v);
        }
        strh.extend_from_slice(&[0; 8]);
        chunk(&mut strl, b"strh", &strh);

        let mut strf = Vec::new();
        let height = if self.top_down { -(self.height as i32) } else { self.height as i32 };
        put_u32(&mut strf, 40);
        put_u32(&mut strf, self.width);
        strf.extend_from_slice(&height.to_le_bytes());
        put_u16(&mut strf, 1);
        put_u16(&mut strf, self.bit_count);
        strf.extend_from_slice(&self.compression);
        for _ in 0..5 {
            put_u32(&mut strf, 0);
        }
        chunk(&mut strl, b"strf", &strf);
        chunk(&mut strl, b"strn", b"video\0");
        list(&mut hdrl, b"strl", &strl);

        // Audio stream
        if let Some(audio) = &self.audio {
            let align = audio.block_align() as u32;
            let total: usize = audio.chunks.iter().map(Vec::len).sum();
            let mut strl = Vec::new();
            let mut strh = Vec::new();
            strh.extend_from_slice(b"auds");
            put_u32(&mut strh, 0);
            put_u32(&mut strh, 0);
            put_u16(&mut strh, 0);
            put_u16(&mut strh, 0);
            for v in [0, align, audio.sample_rate * align, 0, total as u32 / align, 0, 0, align] {
                put_u32(&mut strh, v);
            }
            strh.extend_from_slice(&[0; 8]);
            chunk(&mut strl, b"strh", &strh);

            let mut strf = Vec::new();
            put_u16(&mut strf, audio.format_tag);
            put_u16(&mut strf, audio.channels);
            put_u32(&mut strf, audio.sample_rate);
            put_u32(&mut strf, audio.sample_rate * align);
            put_u16(&mut strf, align as u16);
            put_u16(&mut strf, audio.bits);
            put_u16(&mut strf, 0);
            chunk(&mut strl, b"strf", &strf);
            list(&mut hdrl, b"strl", &strl);
        }

        let mut out = Vec::new();
        out.extend_from_slice(b"RIFF");
        put_u32(&mut out, 0);
        out.extend_from_slice(b"AVI ");
        list(&mut out, b"hdrl", &hdrl);

        // movi body, interleaved
        let mut movi = Vec::new();
        let mut entries: Vec<([u8; 4], u32, u32)> = Vec::new();
        let audio_chunks = self.audio.as_ref().map_or(0, |a| a.chunks.len());
        for i in 0..self.video_frames.len().max(audio_chunks) {
            let rec_start = movi.len();
            if self.rec_lists {
                movi.extend_from_slice(b"LIST");
                put_u32(&mut movi, 0);
                movi.extend_from_slice(b"rec ");
            }
            if let Some(frame) = self.video_frames.get(i) {
                data_chunk(&mut movi, &mut entries, *b"00dc", frame);
            }
            if let Some(samples) = self.audio.as_ref().and_then(|a| a.chunks.get(i)) {
                data_chunk(&mut movi, &mut entries, *b"01wb", samples);
            }
            if self.rec_lists {
                let size = (movi.len() - rec_start - 8) as u32;
                movi[rec_start + 4..rec_start + 8].copy_from_slice(&size.to_le_bytes());
            }
        }

        let movi_fourcc = out.len() as u32 + 8;
        list(&mut out, b"movi", &movi);

        if self.index != IndexMode::None {
            let base = if self.index == IndexMode::Absolute { movi_fourcc } else { 0 };
            let mut idx1 = Vec::new();
            for (id, offset, size) in &entries {
                idx1.extend_from_slice(id);
                put_u32(&mut idx1, 0x10);
                put_u32(&mut idx1, base + offset);
                put_u32(&mut idx1, *size);
            }
            chunk(&mut out, b"idx1", &idx1);
        }

        let riff_size = out.len() as u32 - 8;
        out[4..8].copy_from_slice(&riff_size.to_le_bytes());
        out
    }

    pub fn write_temp(&self) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new()
            .suffix(".avi")
            .tempfile()
            .expect("create temp file");
        file.write_all(&self.to_bytes()).expect("write avi");
        file.flush().expect("flush avi");
        file
    }
}

fn put_u16(out: &mut Vec<u8>, v: u16) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn put_u32(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn chunk(out: &mut Vec<u8>, id: &[u8; 4], data: &[u8]) {
    out.extend_from_slice(id);
    put_u32(out, data.len() as u32);
    out.extend_from_slice(data);
    if data.len() % 2 == 1 {
        out.push(0);
    }
}

fn list(out: &mut Vec<u8>, kind: &[u8; 4], body: &[u8]) {
    let mut data = kind.to_vec();
    data.extend_from_slice(body);
    chunk(out, b"LIST", &data);
}

/// Offsets are from the 'movi' fourcc, which sits 4 bytes before the body
fn data_chunk(movi: &mut Vec<u8>, entries: &mut Vec<([u8; 4], u32, u32)>, id: [u8; 4], data: &[u8]) {
    entries.push((id, movi.len() as u32 + 4, data.len() as u32));
    chunk(movi, &id, data);
}
