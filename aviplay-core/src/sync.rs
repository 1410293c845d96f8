//! Audio/Video Synchronization
//!
//! Uses audio as master clock. Video adjusts to match: frames that arrive
//! early are parked in the frame cache, and when the cache is full the
//! production thread sleeps until audio catches up. Frames are never dropped
//! for being late.

use once_cell::sync::OnceCell;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::display::FrameSink;
use crate::frame_cache::FrameCache;
use crate::stream::{VideoFrame, VideoStream};

/// Video may run this far ahead of the clock (seconds) before it is held back
pub const SYNC_THRESHOLD: f64 = 0.01;

// ============================================================================
// Playback Status
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackStatus {
    Playing,
    Stopped,
}

/// Cancellation token shared by the controller, the production thread and
/// the audio callback. Starts as `Playing` and can only move to `Stopped`.
#[derive(Debug)]
pub struct StatusFlag(AtomicU8);

const PLAYING: u8 = 0;
const STOPPED: u8 = 1;

impl Default for StatusFlag {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusFlag {
    pub fn new() -> Self {
        Self(AtomicU8::new(PLAYING))
    }

    pub fn get(&self) -> PlaybackStatus {
        match self.0.load(Ordering::SeqCst) {
            PLAYING => PlaybackStatus::Playing,
            _ => PlaybackStatus::Stopped,
        }
    }

    pub fn is_playing(&self) -> bool {
        self.get() == PlaybackStatus::Playing
    }

    /// Returns true if this call performed the transition
    pub fn stop(&self) -> bool {
        self.0.swap(STOPPED, Ordering::SeqCst) == PLAYING
    }
}

// ============================================================================
// Clocks
// ============================================================================

/// Audio stream time, published by the audio callback
#[derive(Debug, Default)]
pub struct AudioPosition(AtomicU64);

impl AudioPosition {
    pub fn new() -> Self {
        Self(AtomicU64::new(0f64.to_bits()))
    }

    pub fn set(&self, secs: f64) {
        self.0.store(secs.to_bits(), Ordering::Release);
    }

    pub fn get(&self) -> f64 {
        f64::from_bits(self.0.load(Ordering::Acquire))
    }
}

pub trait MasterClock: Send + Sync {
    /// Current master time in seconds. `video_time` is the presentation time
    /// of the frame being scheduled; clocks without their own time source
    /// anchor on it the first time they are asked.
    fn time(&self, video_time: f64) -> f64;
}

#[derive(Debug, Clone)]
enum ClockSource {
    Audio(Arc<AudioPosition>),
    Wall,
}

/// Audio stream time when an audio track plays, wall time otherwise
#[derive(Debug)]
pub struct PlaybackClock {
    source: ClockSource,
    /// Wall instant and video time of the first query
    anchor: OnceCell<(Instant, f64)>,
}

impl PlaybackClock {
    pub fn audio(position: Arc<AudioPosition>) -> Self {
        Self {
            source: ClockSource::Audio(position),
            anchor: OnceCell::new(),
        }
    }

    pub fn wall() -> Self {
        Self {
            source: ClockSource::Wall,
            anchor: OnceCell::new(),
        }
    }

    pub fn is_audio(&self) -> bool {
        matches!(self.source, ClockSource::Audio(_))
    }
}

impl MasterClock for PlaybackClock {
    fn time(&self, video_time: f64) -> f64 {
        let (start, frame_start) = *self.anchor.get_or_init(|| (Instant::now(), video_time));
        match &self.source {
            ClockSource::Audio(position) => position.get(),
            ClockSource::Wall => frame_start + start.elapsed().as_secs_f64(),
        }
    }
}

// ============================================================================
// Sync Engine
// ============================================================================

/// Which frame to put on screen this iteration
#[derive(Debug, Clone)]
pub enum Show {
    /// The oldest cached frame is due
    Cached(Arc<VideoFrame>),
    /// The frame just decoded
    Fresh,
}

#[derive(Debug, Clone)]
pub struct SyncDecision {
    /// Master time minus `minimum_time`. Negative: video ahead.
    pub drift: f64,
    /// Earliest of the new frame and the oldest cached frame
    pub minimum_time: f64,
    /// Sleep before presenting, equal to `-drift`
    pub stall: Option<Duration>,
    /// The new frame was parked in the cache
    pub cached: bool,
    pub show: Option<Show>,
}

impl SyncDecision {
    /// The new frame is neither cached nor shown
    pub fn discards_fresh(&self) -> bool {
        !self.cached && !matches!(self.show, Some(Show::Fresh))
    }
}

#[derive(Debug, Clone, Default)]
pub struct SyncStats {
    pub pulled: u64,
    pub displayed_fresh: u64,
    pub displayed_cached: u64,
    /// Parked in the cache because video ran ahead
    pub deferred: u64,
    /// Released without display because the cache had no room
    pub discarded: u64,
    pub stalls: u64,
    pub stall_time: Duration,
    /// Still cached when playback ended
    pub flushed: u64,
}

impl SyncStats {
    pub fn displayed(&self) -> u64 {
        self.displayed_fresh + self.displayed_cached
    }
}

/// Per-session pacing state, owned by the production thread
#[derive(Debug, Default)]
pub struct SyncEngine {
    cache: FrameCache,
    stats: SyncStats,
}

impl SyncEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cache(&self) -> &FrameCache {
        &self.cache
    }

    pub fn stats(&self) -> &SyncStats {
        &self.stats
    }

    /// Decide what to do with a freshly decoded frame given the master time.
    /// Updates the cache and the counters; performs no I/O and no sleeping.
    pub fn decide(&mut self, frame: &Arc<VideoFrame>, master_time: f64) -> SyncDecision {
        let current_time = frame.pts;
        let nearest = self.cache.nearest();
        let minimum_time = nearest.map_or(current_time, |n| current_time.min(n.time));

        let drift = master_time - minimum_time;
        let ahead = drift < -SYNC_THRESHOLD;

        // A non-finite timestamp must not reach `Duration`
        let stall = if ahead && self.cache.is_full() {
            Duration::try_from_secs_f64(-drift).ok()
        } else {
            None
        };
        if let Some(d) = stall {
            self.stats.stalls += 1;
            self.stats.stall_time = self.stats.stall_time.saturating_add(d);
        }

        let mut decision = SyncDecision {
            drift,
            minimum_time,
            stall,
            cached: false,
            show: None,
        };

        if (ahead && !self.cache.is_full()) || nearest.is_some() {
            decision.cached = self.cache.insert(frame.clone(), current_time);
            if ahead {
                if decision.cached {
                    self.stats.deferred += 1;
                } else {
                    self.stats.discarded += 1;
                }
                return decision;
            }
        }

        match nearest {
            Some(n) if n.time == minimum_time => {
                if let Some(shown) = self.cache.take(n.slot) {
                    self.stats.displayed_cached += 1;
                    decision.show = Some(Show::Cached(shown));
                }
                if !decision.cached {
                    self.stats.discarded += 1;
                }
            }
            _ => {
                if decision.cached {
                    // Out-of-order timestamp: the new frame is older than
                    // everything cached. Show it now instead of twice.
                    self.uncache(frame);
                    decision.cached = false;
                }
                self.stats.displayed_fresh += 1;
                decision.show = Some(Show::Fresh);
            }
        }

        decision
    }

    fn uncache(&mut self, frame: &Arc<VideoFrame>) {
        if let Some(n) = self.cache.nearest() {
            if n.time == frame.pts {
                self.cache.take(n.slot);
            }
        }
    }

    /// Frame production loop. Runs until the stream ends, a decode fails, or
    /// `status` leaves `Playing`; then empties the cache and sets `Stopped`.
    pub fn run<S: FrameSink + ?Sized>(
        &mut self,
        video: &mut dyn VideoStream,
        sink: &mut S,
        clock: &dyn MasterClock,
        status: &StatusFlag,
        stall: &mut dyn FnMut(Duration),
    ) -> SyncStats {
        while status.is_playing() && !video.at_end() {
            let frame = match video.next_frame(true) {
                Ok(Some(frame)) => Arc::new(frame),
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!("Video decode failed, ending stream: {}", e);
                    break;
                }
            };
            self.stats.pulled += 1;

            let master = clock.time(frame.pts);
            let decision = self.decide(&frame, master);
            tracing::trace!(
                "frame {} pts={:.3} master={:.3} drift={:.3} cached={} cache_free={}",
                frame.id,
                frame.pts,
                master,
                decision.drift,
                decision.cached,
                self.cache.free_slots()
            );

            if let Some(d) = decision.stall {
                stall(d);
            }

            let shown = match &decision.show {
                Some(Show::Cached(cached)) => sink.show(cached),
                Some(Show::Fresh) => sink.show(&frame),
                None => Ok(()),
            };
            if let Err(e) = shown {
                tracing::warn!("Failed to present frame {}: {}", frame.id, e);
            }
        }

        self.stats.flushed += self.cache.flush() as u64;
        status.stop();

        tracing::info!(
            "Video finished: pulled={} displayed={} (cached {}) discarded={} stalls={} ({:?}) flushed={}",
            self.stats.pulled,
            self.stats.displayed(),
            self.stats.displayed_cached,
            self.stats.discarded,
            self.stats.stalls,
            self.stats.stall_time,
            self.stats.flushed
        );

        self.stats.clone()
    }
}

// ============================================================================
// Tests
// ============================================================================
