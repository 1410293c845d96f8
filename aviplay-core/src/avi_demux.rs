// AVI DEMUXER - RIFF/AVI Parser
//
// RIFF 'AVI '
// ├── LIST 'hdrl'
// │   ├── avih (main header)
// │   └── LIST 'strl' (per stream)
// │       ├── strh (stream header)
// │       ├── strf (BITMAPINFOHEADER / WAVEFORMATEX)
// │       └── strn (optional name)
// ├── LIST 'movi'
// │   ├── 00dc (video data)
// │   ├── 01wb (audio data)
// │   └── LIST 'rec ' (optional grouping)
// └── idx1 (optional index)

use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::Path;
use thiserror::Error;

// ============================================================================
// RIFF/AVI Constants
// ============================================================================

const RIFF: u32 = 0x46464952; // "RIFF" little-endian
const AVI_: u32 = 0x20495641; // "AVI "
const LIST: u32 = 0x5453494C; // "LIST"
const HDRL: u32 = 0x6C726468; // "hdrl"
const AVIH: u32 = 0x68697661; // "avih"
const STRL: u32 = 0x6C727473; // "strl"
const STRH: u32 = 0x68727473; // "strh"
const STRF: u32 = 0x66727473; // "strf"
const STRN: u32 = 0x6E727473; // "strn"
const MOVI: u32 = 0x69766F6D; // "movi"
const IDX1: u32 = 0x31786469; // "idx1"

const VIDS: u32 = 0x73646976; // "vids"
const AUDS: u32 = 0x73647561; // "auds"
const TXTS: u32 = 0x73747874; // "txts"

// Video codecs (FourCC)
const XVID: u32 = 0x44495658;
const DIVX: u32 = 0x58564944;
const DX50: u32 = 0x30355844;
const H264: u32 = 0x34363248;
const AVC1: u32 = 0x31435641;
const X264: u32 = 0x34363278;
const MJPG: u32 = 0x47504A4D;
const I420: u32 = 0x30323449;
const IYUV: u32 = 0x56555949;
const YV12: u32 = 0x32315659;
const YUY2: u32 = 0x32595559;
const DIB_: u32 = 0x20424944; // "DIB "
const CVID: u32 = 0x64697663;
const IV50: u32 = 0x30355649;

const AVIIF_KEYFRAME: u32 = 0x10;

#[derive(Debug, Error)]
pub enum DemuxError {
    #[error("Not a RIFF file")]
    NotRiff,
    #[error("Not an AVI file")]
    NotAvi,
    #[error("No movi list")]
    NoMovi,
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

// ============================================================================
// Structures
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AviInfo {
    pub duration_us: i64,
    pub width: u32,
    pub height: u32,
    pub fps: f64,
    pub total_frames: u32,
    pub streams: Vec<AviStream>,
    pub has_index: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AviStream {
    pub index: u32,
    pub stream_type: StreamType,
    pub codec_fourcc: String,
    pub codec: CodecType,
    pub name: Option<String>,
    /// Samples per second is `rate / scale`
    pub scale: u32,
    pub rate: u32,
    pub length: u32,
    // Video-specific
    pub width: Option<u32>,
    pub height: Option<u32>,
    /// Negative BITMAPINFOHEADER height: rows stored top row first
    pub top_down: bool,
    pub fps: Option<f64>,
    pub bit_depth: Option<u16>,
    // Audio-specific
    pub format_tag: Option<u16>,
    pub sample_rate: Option<u32>,
    pub channels: Option<u16>,
    pub bits_per_sample: Option<u16>,
    pub block_align: Option<u16>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum StreamType {
    Video,
    Audio,
    Subtitle,
    #[default]
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum CodecType {
    // Video
    H264,
    MPEG4, // DivX/Xvid
    MJPEG,
    /// Uncompressed BI_RGB
    RawRgb,
    Yuy2,
    Yv12,
    I420,
    Cinepak,
    Indeo,
    // Audio
    PCM,
    MP3,
    AC3,
    AAC,
    #[default]
    Unknown,
}

#[derive(Debug, Clone)]
pub struct AviPacket {
    pub stream_index: u32,
    /// Packets of this stream read before this one
    pub sequence: u64,
    pub keyframe: bool,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone)]
struct IndexEntry {
    stream_id: u16,
    flags: u32,
    offset: u64,
}

// ============================================================================
// AVI Demuxer
// ============================================================================

pub struct AviDemuxer<R: Read + Seek> {
    reader: R,
    info: AviInfo,
    /// Position of the 'movi' list type fourcc
    movi_fourcc: u64,
    movi_end: u64,
    index: Vec<IndexEntry>,
    /// Base added to idx1 offsets
    index_base: u64,
    index_position: usize,
    /// Sequential read cursor inside movi
    cursor: u64,
    packet_counts: Vec<u64>,
}

impl AviDemuxer<BufReader<File>> {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, DemuxError> {
        let file = File::open(path)?;
        Self::new(BufReader::new(file))
    }
}

impl<R: Read + Seek> AviDemuxer<R> {
    pub fn new(mut reader: R) -> Result<Self, DemuxError> {
        reader.seek(SeekFrom::Start(0))?;
        if read_u32_le(&mut reader)? != RIFF {
            return Err(DemuxError::NotRiff);
        }
        let _riff_size = read_u32_le(&mut reader)?;
        if read_u32_le(&mut reader)? != AVI_ {
            return Err(DemuxError::NotAvi);
        }

        let mut demuxer = Self {
            reader,
            info: AviInfo {
                duration_us: 0,
                width: 0,
                height: 0,
                fps: 0.0,
                total_frames: 0,
                streams: Vec::new(),
                has_index: false,
            },
            movi_fourcc: 0,
            movi_end: 0,
            index: Vec::new(),
            index_base: 0,
            index_position: 0,
            cursor: 0,
            packet_counts: Vec::new(),
        };

        demuxer.parse_chunks()?;
        if demuxer.movi_fourcc == 0 {
            return Err(DemuxError::NoMovi);
        }
        demuxer.resolve_index_base();
        demuxer.build_info();
        demuxer.cursor = demuxer.movi_fourcc + 4;
        demuxer.packet_counts = vec![0; demuxer.info.streams.len()];

        tracing::debug!(
            "AVI: {}x{} @ {:.3} fps, {} streams, index={}",
            demuxer.info.width,
            demuxer.info.height,
            demuxer.info.fps,
            demuxer.info.streams.len(),
            demuxer.info.has_index
        );

        Ok(demuxer)
    }

    fn parse_chunks(&mut self) -> Result<(), DemuxError> {
        let file_size = self.reader.seek(SeekFrom::End(0))?;
        let mut pos = self.reader.seek(SeekFrom::Start(12))?;

        while pos + 8 <= file_size {
            let fourcc = read_u32_le(&mut self.reader)?;
            let size = read_u32_le(&mut self.reader)? as u64;
            let end = pos + 8 + size;

            match fourcc {
                LIST if size >= 4 => {
                    let list_type = read_u32_le(&mut self.reader)?;
                    match list_type {
                        HDRL => self.parse_hdrl(end.min(file_size))?,
                        MOVI => {
                            self.movi_fourcc = pos + 8;
                            // Truncated recordings: keep what is there
                            self.movi_end = end.min(file_size);
                        }
                        _ => {}
                    }
                }
                IDX1 => self.parse_idx1(size)?,
                _ => {}
            }

            pos = self.reader.seek(SeekFrom::Start(end + (size & 1)))?;
        }

        Ok(())
    }

    fn parse_hdrl(&mut self, end: u64) -> Result<(), DemuxError> {
        let mut pos = self.reader.stream_position()?;

        while pos + 8 <= end {
            let fourcc = read_u32_le(&mut self.reader)?;
            let size = read_u32_le(&mut self.reader)? as u64;

            match fourcc {
                AVIH => self.parse_avih()?,
                LIST if size >= 4 => {
                    if read_u32_le(&mut self.reader)? == STRL {
                        self.parse_strl(pos + 8 + size)?;
                    }
                }
                _ => {}
            }

            pos = self.reader.seek(SeekFrom::Start(pos + 8 + size + (size & 1)))?;
        }

        Ok(())
    }

    fn parse_avih(&mut self) -> Result<(), DemuxError> {
        let microsec_per_frame = read_u32_le(&mut self.reader)?;
        let _max_bytes_per_sec = read_u32_le(&mut self.reader)?;
        let _padding_granularity = read_u32_le(&mut self.reader)?;
        let _flags = read_u32_le(&mut self.reader)?;
        let total_frames = read_u32_le(&mut self.reader)?;
        let _initial_frames = read_u32_le(&mut self.reader)?;
        let _streams = read_u32_le(&mut self.reader)?;
        let _suggested_buffer_size = read_u32_le(&mut self.reader)?;
        let width = read_u32_le(&mut self.reader)?;
        let height = read_u32_le(&mut self.reader)?;

        self.info.width = width;
        self.info.height = height;
        self.info.total_frames = total_frames;

        if microsec_per_frame > 0 {
            self.info.fps = 1_000_000.0 / microsec_per_frame as f64;
            self.info.duration_us = total_frames as i64 * microsec_per_frame as i64;
        }

        Ok(())
    }

    fn parse_strl(&mut self, end: u64) -> Result<(), DemuxError> {
        let mut stream = AviStream {
            index: self.info.streams.len() as u32,
            ..Default::default()
        };
        let mut pos = self.reader.stream_position()?;

        while pos + 8 <= end {
            let fourcc = read_u32_le(&mut self.reader)?;
            let size = read_u32_le(&mut self.reader)? as u64;

            match fourcc {
                STRH => self.parse_strh(&mut stream)?,
                STRF => match stream.stream_type {
                    StreamType::Video => self.parse_video_format(&mut stream)?,
                    StreamType::Audio => self.parse_audio_format(&mut stream)?,
                    _ => {}
                },
                STRN => {
                    let mut name = vec![0u8; size.min(256) as usize];
                    self.reader.read_exact(&mut name)?;
                    // Trim null terminator
                    if let Some(pos) = name.iter().position(|&b| b == 0) {
                        name.truncate(pos);
                    }
                    stream.name = String::from_utf8(name).ok();
                }
                _ => {}
            }

            pos = self.reader.seek(SeekFrom::Start(pos + 8 + size + (size & 1)))?;
        }

        self.info.streams.push(stream);
        Ok(())
    }

    fn parse_strh(&mut self, stream: &mut AviStream) -> Result<(), DemuxError> {
        let fcc_type = read_u32_le(&mut self.reader)?;
        let fcc_handler = read_u32_le(&mut self.reader)?;
        let _flags = read_u32_le(&mut self.reader)?;
        let _priority = read_u16_le(&mut self.reader)?;
        let _language = read_u16_le(&mut self.reader)?;
        let _initial_frames = read_u32_le(&mut self.reader)?;
        let scale = read_u32_le(&mut self.reader)?;
        let rate = read_u32_le(&mut self.reader)?;
        let _start = read_u32_le(&mut self.reader)?;
        let length = read_u32_le(&mut self.reader)?;

        stream.stream_type = match fcc_type {
            VIDS => StreamType::Video,
            AUDS => StreamType::Audio,
            TXTS => StreamType::Subtitle,
            _ => StreamType::Unknown,
        };
        stream.codec_fourcc = fourcc_to_string(fcc_handler);
        stream.codec = identify_codec(fcc_handler, stream.stream_type);
        stream.scale = scale;
        stream.rate = rate;
        stream.length = length;

        if scale > 0 && rate > 0 {
            stream.fps = Some(rate as f64 / scale as f64);
        }
        Ok(())
    }

    fn parse_video_format(&mut self, stream: &mut AviStream) -> Result<(), DemuxError> {
        // BITMAPINFOHEADER
        let _bih_size = read_u32_le(&mut self.reader)?;
        stream.width = Some(read_u32_le(&mut self.reader)?);
        let height = read_u32_le(&mut self.reader)? as i32;
        stream.height = Some(height.unsigned_abs());
        stream.top_down = height < 0;
        let _planes = read_u16_le(&mut self.reader)?;
        stream.bit_depth = Some(read_u16_le(&mut self.reader)?);
        let compression = read_u32_le(&mut self.reader)?;

        // biCompression is authoritative; the strh handler is often blank
        // or names the capture codec
        let codec = match compression {
            0 => CodecType::RawRgb,
            other => identify_codec(other, StreamType::Video),
        };
        if codec != CodecType::Unknown || stream.codec == CodecType::Unknown {
            stream.codec = codec;
            if compression != 0 {
                stream.codec_fourcc = fourcc_to_string(compression);
            }
        }
        Ok(())
    }

    fn parse_audio_format(&mut self, stream: &mut AviStream) -> Result<(), DemuxError> {
        // WAVEFORMATEX
        let format_tag = read_u16_le(&mut self.reader)?;
        stream.channels = Some(read_u16_le(&mut self.reader)?);
        stream.sample_rate = Some(read_u32_le(&mut self.reader)?);
        let _avg_bytes_per_sec = read_u32_le(&mut self.reader)?;
        stream.block_align = Some(read_u16_le(&mut self.reader)?);
        stream.bits_per_sample = Some(read_u16_le(&mut self.reader)?);
        stream.format_tag = Some(format_tag);

        stream.codec = match format_tag {
            0x0001 => CodecType::PCM,
            0x0055 => CodecType::MP3,
            0x2000 => CodecType::AC3,
            0x00FF => CodecType::AAC,
            _ => CodecType::Unknown,
        };
        Ok(())
    }

    fn parse_idx1(&mut self, size: u64) -> Result<(), DemuxError> {
        let entries = size / 16;
        self.index.reserve(entries as usize);

        for _ in 0..entries {
            let chunk_id = read_u32_le(&mut self.reader)?;
            let flags = read_u32_le(&mut self.reader)?;
            let offset = read_u32_le(&mut self.reader)?;
            let _size = read_u32_le(&mut self.reader)?;

            // 'rec ' and other non-stream entries carry no stream number
            let Some(stream_id) = parse_stream_id(chunk_id) else {
                continue;
            };
            self.index.push(IndexEntry {
                stream_id,
                flags,
                offset: offset as u64,
            });
        }

        self.info.has_index = !self.index.is_empty();
        Ok(())
    }

    /// idx1 offsets normally count from the 'movi' fourcc. Some muxers
    /// write absolute file offsets instead.
    fn resolve_index_base(&mut self) {
        self.index_base = match self.index.first() {
            Some(first) if first.offset >= self.movi_fourcc => 0,
            _ => self.movi_fourcc,
        };
    }

    fn build_info(&mut self) {
        let video = self
            .info
            .streams
            .iter()
            .find(|s| s.stream_type == StreamType::Video);

        if let Some(stream) = video {
            if let Some(fps) = stream.fps.filter(|fps| *fps > 0.0) {
                // Stream rate is exact; avih only has whole microseconds
                self.info.fps = fps;
                if self.info.duration_us == 0 {
                    let frames = if stream.length > 0 { stream.length } else { self.info.total_frames };
                    self.info.duration_us = (frames as f64 / fps * 1_000_000.0) as i64;
                }
            }
            if self.info.width == 0 {
                self.info.width = stream.width.unwrap_or(0);
                self.info.height = stream.height.unwrap_or(0);
            }
        }
    }

    pub fn info(&self) -> &AviInfo {
        &self.info
    }

    /// Next packet of any stream, `None` at the end of movi
    pub fn read_packet(&mut self) -> Result<Option<AviPacket>, DemuxError> {
        self.next_packet(None)
    }

    /// Next packet of `stream`; packets of other streams are skipped unread
    pub fn read_stream_packet(&mut self, stream: u32) -> Result<Option<AviPacket>, DemuxError> {
        self.next_packet(Some(stream))
    }

    fn next_packet(&mut self, wanted: Option<u32>) -> Result<Option<AviPacket>, DemuxError> {
        if self.index.is_empty() {
            self.read_packet_sequential(wanted)
        } else {
            self.read_packet_indexed(wanted)
        }
    }

    fn read_packet_indexed(&mut self, wanted: Option<u32>) -> Result<Option<AviPacket>, DemuxError> {
        while let Some(entry) = self.index.get(self.index_position) {
            self.index_position += 1;
            let stream_index = entry.stream_id as u32;
            if wanted.is_some_and(|w| w != stream_index) {
                continue;
            }
            let keyframe = entry.flags & AVIIF_KEYFRAME != 0;

            self.reader.seek(SeekFrom::Start(self.index_base + entry.offset))?;
            let _chunk_id = read_u32_le(&mut self.reader)?;
            let chunk_size = read_u32_le(&mut self.reader)?;
            let data = self.read_payload(chunk_size)?;

            return Ok(Some(self.packet(stream_index, keyframe, data)));
        }
        Ok(None)
    }

    fn read_packet_sequential(&mut self, wanted: Option<u32>) -> Result<Option<AviPacket>, DemuxError> {
        while self.cursor + 8 <= self.movi_end {
            self.reader.seek(SeekFrom::Start(self.cursor))?;
            let chunk_id = read_u32_le(&mut self.reader)?;
            let chunk_size = read_u32_le(&mut self.reader)?;

            if chunk_id == LIST {
                // Descend into 'rec ' groups
                self.cursor += 12;
                continue;
            }

            let padded = chunk_size as u64 + (chunk_size as u64 & 1);
            self.cursor += 8 + padded;

            let Some(stream_id) = parse_stream_id(chunk_id) else {
                continue;
            };
            let stream_index = stream_id as u32;
            if wanted.is_some_and(|w| w != stream_index) {
                continue;
            }

            let data = self.read_payload(chunk_size)?;
            // Keyframe flags live only in idx1
            return Ok(Some(self.packet(stream_index, true, data)));
        }
        Ok(None)
    }

    fn read_payload(&mut self, size: u32) -> Result<Vec<u8>, DemuxError> {
        let mut data = Vec::new();
        (&mut self.reader).take(size as u64).read_to_end(&mut data)?;
        if data.len() < size as usize {
            tracing::debug!("Short chunk: {} of {} bytes", data.len(), size);
        }
        Ok(data)
    }

    fn packet(&mut self, stream_index: u32, keyframe: bool, data: Vec<u8>) -> AviPacket {
        let sequence = match self.packet_counts.get_mut(stream_index as usize) {
            Some(count) => {
                *count += 1;
                *count - 1
            }
            None => 0,
        };
        AviPacket {
            stream_index,
            sequence,
            keyframe,
            data,
        }
    }
}

/// Read the headers of an AVI file
pub fn probe<P: AsRef<Path>>(path: P) -> Result<AviInfo, DemuxError> {
    Ok(AviDemuxer::open(path)?.info().clone())
}

// ============================================================================
// Helper Functions
// ============================================================================

fn read_u16_le<R: Read>(reader: &mut R) -> Result<u16, DemuxError> {
    let mut buf = [0u8; 2];
    reader.read_exact(&mut buf)?;
    Ok(u16::from_le_bytes(buf))
}

fn read_u32_le<R: Read>(reader: &mut R) -> Result<u32, DemuxError> {
    let mut buf = [0u8; 4];
    reader.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

/// "01wb" -> 1
fn parse_stream_id(chunk_id: u32) -> Option<u16> {
    let [b0, b1, _, _] = chunk_id.to_le_bytes();
    if b0.is_ascii_digit() && b1.is_ascii_digit() {
        Some(((b0 - b'0') * 10 + (b1 - b'0')) as u16)
    } else {
        None
    }
}

fn fourcc_to_string(fourcc: u32) -> String {
    fourcc
        .to_le_bytes()
        .iter()
        .filter(|&&b| b.is_ascii_graphic() || b == b' ')
        .map(|&b| b as char)
        .collect()
}

fn identify_codec(fourcc: u32, stream_type: StreamType) -> CodecType {
    if stream_type != StreamType::Video {
        // Audio codecs come from the WAVEFORMATEX tag
        return CodecType::Unknown;
    }
    match ascii_uppercase(fourcc) {
        H264 | AVC1 | X264 => CodecType::H264,
        XVID | DIVX | DX50 => CodecType::MPEG4,
        MJPG => CodecType::MJPEG,
        I420 | IYUV => CodecType::I420,
        YV12 => CodecType::Yv12,
        YUY2 => CodecType::Yuy2,
        DIB_ => CodecType::RawRgb,
        CVID => CodecType::Cinepak,
        IV50 => CodecType::Indeo,
        _ => CodecType::Unknown,
    }
}

fn ascii_uppercase(fourcc: u32) -> u32 {
    u32::from_le_bytes(fourcc.to_le_bytes().map(|b| b.to_ascii_uppercase()))
}

// ============================================================================
// Tests
// ============================================================================
