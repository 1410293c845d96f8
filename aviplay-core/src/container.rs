// AVI container: one file, independently opened streams

use std::path::{Path, PathBuf};

use crate::avi_demux::{AviDemuxer, AviInfo, AviStream, StreamType};
use crate::decode::{AviAudioStream, AviVideoStream};
use crate::player::SetupError;
use crate::stream::{AudioStream, Container, VideoStream};

pub struct AviContainer {
    path: PathBuf,
    info: AviInfo,
}

impl AviContainer {
    pub fn info(&self) -> &AviInfo {
        &self.info
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The `index`-th stream of the given kind
    fn nth_stream(&self, kind: StreamType, index: usize) -> Option<AviStream> {
        self.info
            .streams
            .iter()
            .filter(|s| s.stream_type == kind)
            .nth(index)
            .cloned()
    }

    fn demuxer(&self) -> Option<AviDemuxer<std::io::BufReader<std::fs::File>>> {
        match AviDemuxer::open(&self.path) {
            Ok(demuxer) => Some(demuxer),
            Err(e) => {
                tracing::warn!("Failed to reopen {}: {}", self.path.display(), e);
                None
            }
        }
    }
}

/// Open an AVI file and read its headers
pub fn open_avi<P: AsRef<Path>>(path: P) -> Result<AviContainer, SetupError> {
    let path = path.as_ref();
    if !path.is_file() {
        return Err(SetupError::NotFound(path.to_path_buf()));
    }

    let demuxer = AviDemuxer::open(path).map_err(|e| SetupError::InvalidContainer(e.to_string()))?;
    let info = demuxer.info().clone();

    tracing::debug!(
        "Opened {}: {} streams, {:.1}s",
        path.display(),
        info.streams.len(),
        info.duration_us as f64 / 1_000_000.0
    );

    Ok(AviContainer {
        path: path.to_path_buf(),
        info,
    })
}

impl Container for AviContainer {
    fn video_stream(&mut self, index: usize) -> Option<Box<dyn VideoStream>> {
        let stream = self.nth_stream(StreamType::Video, index)?;
        let demuxer = self.demuxer()?;
        Some(Box::new(AviVideoStream::new(demuxer, &stream)))
    }

    fn audio_stream(&mut self, index: usize) -> Option<Box<dyn AudioStream>> {
        let stream = self.nth_stream(StreamType::Audio, index)?;
        let demuxer = self.demuxer()?;
        match AviAudioStream::new(demuxer, &stream) {
            Ok(audio) => Some(Box::new(audio)),
            Err(e) => {
                tracing::warn!("Audio track {} not playable: {}", index, e);
                None
            }
        }
    }
}
