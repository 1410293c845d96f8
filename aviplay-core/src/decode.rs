//! # Stream Decoders
//!
//! Video and audio streams over one AVI stream each. Every stream owns its
//! own demuxer (and file handle) and skips the other streams' packets.
//!
//! ## Video
//! - BI_RGB 24-bit: rows flipped to top-down, stride padding removed
//! - YUY2, YV12: copied
//! - I420/IYUV: U and V planes swapped into YV12 order
//! - MJPEG: decoded with `image`, output as BGR
//!
//! ## Audio
//! - PCM unsigned 8-bit and signed 16-bit: passed through
//! - MP3: split into frames and decoded with symphonia to signed 16-bit

use std::fs::File;
use std::io::{BufReader, Read, Seek};

use symphonia::core::audio::{Channels, SampleBuffer};
use symphonia::core::codecs::{CodecParameters, Decoder, DecoderOptions, CODEC_TYPE_MP3};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::Packet;

use crate::avi_demux::{AviDemuxer, AviStream, CodecType, DemuxError};
use crate::stream::{
    AudioFormat, AudioStream, DecodeError, PixelFormat, ReadFrames, SampleTag, VideoFrame, VideoInfo, VideoStream,
};

impl From<DemuxError> for DecodeError {
    fn from(e: DemuxError) -> Self {
        match e {
            DemuxError::Io(io) => DecodeError::Io(io),
            other => DecodeError::Corrupt(other.to_string()),
        }
    }
}

// ============================================================================
// Video
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum VideoCodec {
    Bgr { bottom_up: bool },
    Yuy2,
    Yv12,
    I420,
    Mjpeg,
}

impl VideoCodec {
    fn for_stream(stream: &AviStream) -> Option<Self> {
        match stream.codec {
            CodecType::RawRgb if stream.bit_depth == Some(24) => Some(Self::Bgr {
                bottom_up: !stream.top_down,
            }),
            CodecType::Yuy2 => Some(Self::Yuy2),
            CodecType::Yv12 => Some(Self::Yv12),
            CodecType::I420 => Some(Self::I420),
            CodecType::MJPEG => Some(Self::Mjpeg),
            _ => None,
        }
    }

    fn output(&self) -> PixelFormat {
        match self {
            Self::Bgr { .. } | Self::Mjpeg => PixelFormat::Bgr24,
            Self::Yuy2 => PixelFormat::Yuy2,
            Self::Yv12 | Self::I420 => PixelFormat::Yv12,
        }
    }
}

pub struct AviVideoStream<R: Read + Seek + Send = BufReader<File>> {
    demuxer: AviDemuxer<R>,
    stream_index: u32,
    fourcc: String,
    codec: Option<VideoCodec>,
    info: VideoInfo,
    current_time: f64,
    frames: u64,
    dropped: u64,
    at_end: bool,
}

impl<R: Read + Seek + Send> AviVideoStream<R> {
    pub fn new(demuxer: AviDemuxer<R>, stream: &AviStream) -> Self {
        let info = VideoInfo {
            width: stream.width.unwrap_or(demuxer.info().width),
            height: stream.height.unwrap_or(demuxer.info().height),
            fps: stream.fps.filter(|f| *f > 0.0).unwrap_or(demuxer.info().fps),
        };
        Self {
            demuxer,
            stream_index: stream.index,
            fourcc: stream.codec_fourcc.clone(),
            codec: VideoCodec::for_stream(stream),
            info,
            current_time: 0.0,
            frames: 0,
            dropped: 0,
            at_end: false,
        }
    }

    fn decode(&self, codec: VideoCodec, data: &[u8]) -> Result<Vec<u8>, DecodeError> {
        let w = self.info.width as usize;
        let h = self.info.height as usize;

        match codec {
            VideoCodec::Bgr { bottom_up } => {
                let stride = (w * 3 + 3) & !3;
                check_len(data, stride * h)?;
                let mut out = Vec::with_capacity(w * h * 3);
                for row in 0..h {
                    let src = if bottom_up { h - 1 - row } else { row };
                    out.extend_from_slice(&data[src * stride..src * stride + w * 3]);
                }
                Ok(out)
            }
            VideoCodec::Yuy2 | VideoCodec::Yv12 => {
                let need = codec
                    .output()
                    .frame_size(self.info.width, self.info.height)
                    .ok_or_else(|| DecodeError::Corrupt("frame size overflows".into()))?;
                check_len(data, need)?;
                Ok(data[..need].to_vec())
            }
            VideoCodec::I420 => {
                let luma = w * h;
                let chroma = (w / 2) * (h / 2);
                check_len(data, luma + 2 * chroma)?;
                let mut out = Vec::with_capacity(luma + 2 * chroma);
                out.extend_from_slice(&data[..luma]);
                out.extend_from_slice(&data[luma + chroma..luma + 2 * chroma]);
                out.extend_from_slice(&data[luma..luma + chroma]);
                Ok(out)
            }
            VideoCodec::Mjpeg => {
                let image = image::load_from_memory_with_format(data, image::ImageFormat::Jpeg)
                    .map_err(|e| DecodeError::Corrupt(format!("MJPEG: {}", e)))?
                    .to_rgb8();
                if image.dimensions() != (self.info.width, self.info.height) {
                    return Err(DecodeError::Corrupt(format!(
                        "MJPEG frame is {}x{}, stream is {}x{}",
                        image.width(),
                        image.height(),
                        self.info.width,
                        self.info.height
                    )));
                }
                let mut bgr = image.into_raw();
                for px in bgr.chunks_exact_mut(3) {
                    px.swap(0, 2);
                }
                Ok(bgr)
            }
        }
    }
}

fn check_len(data: &[u8], need: usize) -> Result<(), DecodeError> {
    if data.len() < need {
        return Err(DecodeError::Corrupt(format!(
            "frame is {} bytes, need {}",
            data.len(),
            need
        )));
    }
    Ok(())
}

impl<R: Read + Seek + Send> VideoStream for AviVideoStream<R> {
    fn info(&self) -> VideoInfo {
        self.info
    }

    fn start_streaming(&mut self) -> Result<(), DecodeError> {
        self.info.validate().map_err(DecodeError::Corrupt)?;
        match self.codec {
            Some(codec) => {
                tracing::debug!("Video stream {}: {} -> {:?}", self.stream_index, self.fourcc, codec.output());
                Ok(())
            }
            None => Err(DecodeError::Unsupported(format!("video codec '{}'", self.fourcc))),
        }
    }

    fn stop_streaming(&mut self) {
        if !self.at_end {
            tracing::debug!(
                "Video stream {} stopped after {} frames ({} drop frames)",
                self.stream_index,
                self.frames,
                self.dropped
            );
        }
        self.at_end = true;
    }

    fn decoder_capabilities(&self) -> Vec<PixelFormat> {
        self.codec.map(|c| vec![c.output()]).unwrap_or_default()
    }

    fn set_output_format(&mut self, format: PixelFormat) -> Result<(), DecodeError> {
        if self.codec.map(|c| c.output()) == Some(format) {
            Ok(())
        } else {
            Err(DecodeError::Unsupported(format!("{} cannot produce {:?}", self.fourcc, format)))
        }
    }

    fn output_format(&self) -> PixelFormat {
        self.codec.map_or(PixelFormat::Bgr24, |c| c.output())
    }

    fn next_frame(&mut self, _blocking: bool) -> Result<Option<VideoFrame>, DecodeError> {
        let codec = self
            .codec
            .ok_or_else(|| DecodeError::Unsupported(format!("video codec '{}'", self.fourcc)))?;

        while !self.at_end {
            let Some(packet) = self.demuxer.read_stream_packet(self.stream_index)? else {
                self.at_end = true;
                break;
            };
            // Zero-length chunk: drop frame, time still advances
            if packet.data.is_empty() {
                self.dropped += 1;
                continue;
            }

            let data = self.decode(codec, &packet.data)?;
            let pts = packet.sequence as f64 / self.info.fps;
            self.current_time = pts;
            self.frames += 1;
            return Ok(Some(VideoFrame::new(
                data,
                codec.output(),
                self.info.width,
                self.info.height,
                pts,
            )));
        }
        Ok(None)
    }

    fn current_time(&self) -> f64 {
        self.current_time
    }

    fn at_end(&self) -> bool {
        self.at_end
    }
}

// ============================================================================
// Audio
// ============================================================================

enum AudioCodec {
    Pcm,
    Mp3(Mp3Decoder),
}

struct Mp3Decoder {
    decoder: Box<dyn Decoder>,
    pending: Vec<u8>,
    ts: u64,
}

impl Mp3Decoder {
    fn new(sample_rate: u32, channels: u16) -> Result<Self, DecodeError> {
        let layout = match channels {
            1 => Channels::FRONT_CENTRE,
            _ => Channels::FRONT_LEFT | Channels::FRONT_RIGHT,
        };
        let mut params = CodecParameters::new();
        params
            .for_codec(CODEC_TYPE_MP3)
            .with_sample_rate(sample_rate)
            .with_channels(layout);

        let decoder = symphonia::default::get_codecs()
            .make(&params, &DecoderOptions::default())
            .map_err(|e| DecodeError::Unsupported(format!("MP3 decoder: {}", e)))?;

        Ok(Self {
            decoder,
            pending: Vec::new(),
            ts: 0,
        })
    }

    /// Decode every whole frame buffered so far, appending S16LE to `dst`
    fn push(&mut self, data: &[u8], dst: &mut Vec<u8>) -> Result<(), DecodeError> {
        self.pending.extend_from_slice(data);

        while let Some(frame) = split_mp3_frame(&mut self.pending) {
            let packet = Packet::new_from_slice(0, self.ts, 0, &frame);
            let decoded = match self.decoder.decode(&packet) {
                Ok(decoded) => decoded,
                Err(SymphoniaError::DecodeError(e)) => {
                    tracing::trace!("Skipping bad MP3 frame: {}", e);
                    continue;
                }
                Err(e) => return Err(DecodeError::Corrupt(format!("MP3: {}", e))),
            };

            let spec = *decoded.spec();
            self.ts += decoded.frames() as u64;
            let mut samples = SampleBuffer::<i16>::new(decoded.capacity() as u64, spec);
            samples.copy_interleaved_ref(decoded);
            for s in samples.samples() {
                dst.extend_from_slice(&s.to_le_bytes());
            }
        }
        Ok(())
    }
}

/// Length in bytes of the MPEG audio Layer III frame starting with `h`
fn mp3_frame_len(h: &[u8]) -> Option<usize> {
    const BITRATES_V1: [u32; 15] = [0, 32, 40, 48, 56, 64, 80, 96, 112, 128, 160, 192, 224, 256, 320];
    const BITRATES_V2: [u32; 15] = [0, 8, 16, 24, 32, 40, 48, 56, 64, 80, 96, 112, 128, 144, 160];
    const RATES: [u32; 3] = [44100, 48000, 32000];

    if h.len() < 4 || h[0] != 0xFF || h[1] & 0xE0 != 0xE0 {
        return None;
    }
    // 3: MPEG-1, 2: MPEG-2, 0: MPEG-2.5
    let version = (h[1] >> 3) & 0x03;
    let layer = (h[1] >> 1) & 0x03;
    if version == 1 || layer != 1 {
        return None;
    }
    let bitrate_index = (h[2] >> 4) as usize;
    let rate_index = ((h[2] >> 2) & 0x03) as usize;
    let padding = ((h[2] >> 1) & 0x01) as u32;
    if bitrate_index == 0 || bitrate_index == 15 || rate_index == 3 {
        return None;
    }

    let (kbps, rate, coefficient) = match version {
        3 => (BITRATES_V1[bitrate_index], RATES[rate_index], 144),
        2 => (BITRATES_V2[bitrate_index], RATES[rate_index] / 2, 72),
        _ => (BITRATES_V2[bitrate_index], RATES[rate_index] / 4, 72),
    };
    Some((coefficient * kbps * 1000 / rate + padding) as usize)
}

/// Take the next whole frame off the front of `pending`, dropping any
/// bytes before the first frame header
fn split_mp3_frame(pending: &mut Vec<u8>) -> Option<Vec<u8>> {
    let Some(start) = pending.windows(4).position(|h| mp3_frame_len(h).is_some()) else {
        let keep = pending.len().min(3);
        pending.drain(..pending.len() - keep);
        return None;
    };
    pending.drain(..start);
    let len = mp3_frame_len(pending)?;
    if pending.len() < len {
        return None;
    }
    Some(pending.drain(..len).collect())
}

pub struct AviAudioStream<R: Read + Seek + Send = BufReader<File>> {
    demuxer: AviDemuxer<R>,
    stream_index: u32,
    format: AudioFormat,
    codec: AudioCodec,
    /// Sample frames handed out so far
    frames_out: u64,
    at_end: bool,
}

impl<R: Read + Seek + Send> AviAudioStream<R> {
    pub fn new(demuxer: AviDemuxer<R>, stream: &AviStream) -> Result<Self, DecodeError> {
        let sample_rate = stream.sample_rate.unwrap_or(0);
        let channels = stream.channels.unwrap_or(0);
        if sample_rate == 0 || channels == 0 {
            return Err(DecodeError::Corrupt("audio stream without rate or channels".into()));
        }

        let (codec, tag) = match (stream.codec, stream.bits_per_sample) {
            (CodecType::PCM, Some(8)) => (AudioCodec::Pcm, SampleTag::U8),
            (CodecType::PCM, Some(16)) => (AudioCodec::Pcm, SampleTag::S16Le),
            (CodecType::PCM, bits) => {
                return Err(DecodeError::Unsupported(format!("{:?}-bit PCM", bits)));
            }
            (CodecType::MP3, _) => (AudioCodec::Mp3(Mp3Decoder::new(sample_rate, channels)?), SampleTag::S16Le),
            (other, _) => {
                return Err(DecodeError::Unsupported(format!(
                    "audio codec {:?} (tag {:#06x})",
                    other,
                    stream.format_tag.unwrap_or(0)
                )));
            }
        };

        let format = AudioFormat {
            sample_rate,
            channels,
            bits_per_sample: match tag {
                SampleTag::U8 => 8,
                SampleTag::S16Le => 16,
            },
            tag,
        };

        Ok(Self {
            demuxer,
            stream_index: stream.index,
            format,
            codec,
            frames_out: 0,
            at_end: false,
        })
    }
}

impl<R: Read + Seek + Send> AudioStream for AviAudioStream<R> {
    fn start_streaming(&mut self) -> Result<(), DecodeError> {
        tracing::debug!(
            "Audio stream {}: {} Hz, {} ch, {:?}",
            self.stream_index,
            self.format.sample_rate,
            self.format.channels,
            self.format.tag
        );
        Ok(())
    }

    fn stop_streaming(&mut self) {
        self.at_end = true;
    }

    fn output_format(&self) -> AudioFormat {
        self.format
    }

    fn read_frames(&mut self, dst: &mut Vec<u8>, requested_bytes: usize) -> Result<ReadFrames, DecodeError> {
        dst.clear();
        while dst.len() < requested_bytes.max(1) && !self.at_end {
            let Some(packet) = self.demuxer.read_stream_packet(self.stream_index)? else {
                self.at_end = true;
                break;
            };
            match &mut self.codec {
                AudioCodec::Pcm => dst.extend_from_slice(&packet.data),
                AudioCodec::Mp3(mp3) => mp3.push(&packet.data, dst)?,
            }
        }

        // Keep whole sample frames; a torn trailing frame is noise
        let frame = self.format.bytes_per_frame().max(1);
        dst.truncate(dst.len() / frame * frame);
        let samples = dst.len() / frame;
        self.frames_out += samples as u64;

        Ok(ReadFrames {
            samples,
            bytes: dst.len(),
        })
    }

    fn current_time(&self) -> f64 {
        self.frames_out as f64 / self.format.sample_rate as f64
    }

    fn at_end(&self) -> bool {
        self.at_end
    }
}

// ============================================================================
// Tests
// ============================================================================
