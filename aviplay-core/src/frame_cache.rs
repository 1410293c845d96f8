//! # Frame Cache - Bounded Lookahead for Early Frames
//!
//! Decoding runs faster than real time, so frames that arrive ahead of the
//! master clock are parked here instead of stalling the decoder. The cache
//! is owned by the production thread alone; nothing here is shared.
//!
//! ```text
//! ┌─────────┐  early   ┌────────────┐  due   ┌─────────┐
//! │ Decoder │─────────►│ FrameCache │───────►│ Overlay │
//! └─────────┘          │  3 slots   │        └─────────┘
//!      │               └────────────┘             ▲
//!      └──────────────── on time ─────────────────┘
//! ```

use std::sync::Arc;

use crate::stream::VideoFrame;

/// Number of cache slots
pub const CACHE_SIZE: usize = 3;

#[derive(Debug, Clone)]
struct CacheSlot {
    frame: Arc<VideoFrame>,
    time: f64,
}

/// Oldest cached frame, by presentation time
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Nearest {
    pub slot: usize,
    pub time: f64,
}

#[derive(Debug)]
pub struct FrameCache {
    slots: [Option<CacheSlot>; CACHE_SIZE],
    /// Free slot count; the single source of truth for remaining capacity
    free: usize,
}

impl Default for FrameCache {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameCache {
    pub fn new() -> Self {
        Self {
            slots: std::array::from_fn(|_| None),
            free: CACHE_SIZE,
        }
    }

    pub fn free_slots(&self) -> usize {
        self.free
    }

    pub fn occupied(&self) -> usize {
        CACHE_SIZE - self.free
    }

    pub fn is_full(&self) -> bool {
        self.free == 0
    }

    /// Occupied slot with the smallest time. Ties keep the lower slot.
    pub fn nearest(&self) -> Option<Nearest> {
        let mut nearest: Option<Nearest> = None;
        for (slot, entry) in self.slots.iter().enumerate() {
            if let Some(entry) = entry {
                if nearest.map_or(true, |n| entry.time < n.time) {
                    nearest = Some(Nearest { slot, time: entry.time });
                }
            }
        }
        nearest
    }

    /// Park a frame in the first free slot. Returns false when full.
    pub fn insert(&mut self, frame: Arc<VideoFrame>, time: f64) -> bool {
        let Some(slot) = self.slots.iter_mut().find(|s| s.is_none()) else {
            return false;
        };
        *slot = Some(CacheSlot { frame, time });
        self.free -= 1;
        self.check();
        true
    }

    /// Remove the frame held in `slot`
    pub fn take(&mut self, slot: usize) -> Option<Arc<VideoFrame>> {
        let entry = self.slots.get_mut(slot)?.take()?;
        self.free += 1;
        self.check();
        Some(entry.frame)
    }

    /// Release every cached frame. Returns how many were held.
    pub fn flush(&mut self) -> usize {
        let held = self.occupied();
        for slot in &mut self.slots {
            *slot = None;
        }
        self.free = CACHE_SIZE;
        held
    }

    fn check(&self) {
        debug_assert!(self.free <= CACHE_SIZE);
        debug_assert_eq!(
            self.free,
            self.slots.iter().filter(|s| s.is_none()).count()
        );
    }
}
