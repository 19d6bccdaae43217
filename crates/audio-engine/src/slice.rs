//! Data slices: the fixed ring of buffers cycled between the decoder and the renderer.
//!
//! A slice is owned by the engine for its whole life. While scheduled, the renderer holds a
//! transient `Arc` to it and reports back through [`DataSlice::finish_render`]. Every field lives
//! behind the slice's own mutex; nothing reads or writes slice state without holding it.

use std::cmp::Ordering;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use crate::engine::EngineCore;
use crate::format::{AudioBuffers, StreamFormat};
use crate::sync::{AtomicCounter, lock};

/// Render progress flags written by the renderer.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SliceFlags(u8);

impl SliceFlags {
    pub const BEGAN_TO_RENDER: Self = Self(0b01);
    pub const COMPLETE: Self = Self(0b10);

    pub const fn empty() -> Self {
        Self(0)
    }

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }
}

/// Mutable part of a slice.
#[derive(Debug, Default)]
pub struct SliceState {
    /// Planar sample storage; capacity is fixed for a given stream format.
    pub buffers: AudioBuffers,
    /// Format the buffers were allocated for.
    pub buffers_format: Option<StreamFormat>,
    /// Frames requested from the fill handler on each fill.
    pub frames_to_read: usize,
    /// Schedule sample time of the first frame held.
    pub timestamp: i64,
    /// Valid frames at the front of `buffers`.
    pub frame_count: usize,
    pub has_data: bool,
    pub invalidated: bool,
    pub flags: SliceFlags,
    /// Bumped whenever queued fills for this slice become stale (pause, stop).
    pub generation: u64,
}

impl SliceState {
    /// Frame offset of `sample_time` inside this slice, or `None` when outside
    /// `[timestamp, timestamp + frame_count)`.
    pub fn buffer_offset_for(&self, sample_time: i64) -> Option<usize> {
        let offset = sample_time.checked_sub(self.timestamp)?;
        if offset < 0 || offset >= self.frame_count as i64 {
            return None;
        }
        usize::try_from(offset).ok()
    }

    /// Exclusive end of the slice window in schedule sample time.
    pub fn end_time(&self) -> i64 {
        self.timestamp.saturating_add(self.frame_count as i64)
    }

    /// Drop the first `offset` frames, keeping the rest at the front of every channel.
    ///
    /// Returns `false` without touching anything when `offset` exceeds the frame count.
    pub fn shift_left(&mut self, offset: usize) -> bool {
        if offset > self.frame_count {
            return false;
        }
        self.buffers.shift_left(offset, self.frame_count);
        self.frame_count -= offset;
        true
    }

    /// Mark the slice as not schedulable and orphan every fill already queued for it.
    pub fn invalidate(&mut self) {
        self.invalidated = true;
        self.generation = self.generation.wrapping_add(1);
    }

    /// Make sure the buffers match `format` and hold `frames` frames.
    pub fn ensure_buffers(&mut self, format: &StreamFormat, frames: usize) {
        let reusable = self.frames_to_read > 0
            && self.buffers_format.as_ref() == Some(format)
            && self.buffers.capacity_frames() >= self.frames_to_read;
        if !reusable {
            self.buffers = AudioBuffers::for_format(format, frames);
            self.buffers_format = Some(*format);
            self.frames_to_read = frames;
        }
    }
}

/// One slot of the engine's slice ring.
pub struct DataSlice {
    index: usize,
    owner: Weak<EngineCore>,
    active_slices: Arc<AtomicCounter>,
    state: Mutex<SliceState>,
}

impl DataSlice {
    pub(crate) fn new(
        index: usize,
        owner: Weak<EngineCore>,
        active_slices: Arc<AtomicCounter>,
    ) -> Self {
        Self {
            index,
            owner,
            active_slices,
            state: Mutex::new(SliceState::default()),
        }
    }

    /// A slice with no owning engine; completions are dropped.
    #[cfg(test)]
    pub(crate) fn detached(index: usize) -> Self {
        Self::new(index, Weak::new(), Arc::new(AtomicCounter::new(0)))
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn lock(&self) -> MutexGuard<'_, SliceState> {
        lock(&self.state)
    }

    /// Return the slice to its idle state and zero the shared active count.
    ///
    /// Takes the caller's guard: the slice lock must already be held.
    pub fn reset(&self, state: &mut SliceState) {
        state.timestamp = 0;
        state.frame_count = 0;
        state.has_data = false;
        state.invalidated = false;
        state.flags = SliceFlags::empty();
        self.active_slices.set(0);
    }

    /// Timestamp-ascending ordering of two slices.
    pub fn compare(a: &DataSlice, b: &DataSlice) -> Ordering {
        let ta = a.lock().timestamp;
        let tb = b.lock().timestamp;
        ta.cmp(&tb)
    }

    /// Called by the renderer once it is done with the slice.
    ///
    /// Must be called without the slice lock held.
    pub fn finish_render(self: &Arc<Self>, flags: SliceFlags) {
        if let Some(owner) = self.owner.upgrade() {
            owner.slice_did_finish(self, flags);
        }
    }

    pub(crate) fn owner(&self) -> Option<Arc<EngineCore>> {
        self.owner.upgrade()
    }
}

impl std::fmt::Debug for DataSlice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataSlice").field("index", &self.index).finish_non_exhaustive()
    }
}
