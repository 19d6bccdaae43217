//! Decoder interface.
//!
//! Decoders are not re-entrant: the engine only calls them from its task queue thread, one
//! call at a time. They deliver planar `f32` frames in their own [`StreamFormat`]; anything
//! that is not canonical goes through a [`crate::convert::FormatConverter`] first.

mod file;
mod memory;

use crate::error::EngineError;
use crate::format::{AudioBuffers, StreamFormat};

pub use file::{SourceInfo, SymphoniaDecoder};
pub use memory::MemoryDecoder;

pub trait Decoder: Send {
    /// Human-readable source identifier (usually a path).
    fn location(&self) -> String;

    fn stream_format(&self) -> StreamFormat;

    /// Total frames in the source, or 0 when unknown.
    fn total_frames(&self) -> u64;

    /// Index of the next frame [`Decoder::fill_buffers`] will produce.
    fn current_frame(&self) -> u64;

    fn can_seek(&self) -> bool;

    fn set_current_frame(&mut self, frame: u64) -> Result<(), EngineError>;

    /// Write up to `max_frames` frames to the front of `buffers`.
    ///
    /// `Ok(0)` means the source is exhausted.
    fn fill_buffers(
        &mut self,
        buffers: &mut AudioBuffers,
        max_frames: usize,
    ) -> Result<usize, EngineError>;
}
