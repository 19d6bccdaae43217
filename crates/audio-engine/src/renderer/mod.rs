//! Rendering back ends.
//!
//! The engine only needs a scheduled-slice player plus graph start/stop from its renderer:
//! - [`ScheduledPlayer`] is the shared core that turns a FIFO of slices into output frames
//! - [`OfflineRenderer`] drives that core from the caller's thread
//! - [`CpalRenderer`] drives it from a cpal output callback

mod offline;
mod output;
mod scheduled;

use std::sync::Arc;

use crate::error::EngineError;
use crate::format::StreamFormat;
use crate::slice::DataSlice;

pub use offline::OfflineRenderer;
pub use output::CpalRenderer;
pub use scheduled::ScheduledPlayer;

/// Called after each render pass with the number of frames taken from slices.
pub type RenderObserver = Arc<dyn Fn(usize) + Send + Sync>;

pub trait Renderer: Send + Sync {
    /// Queue `slice` behind everything already scheduled.
    ///
    /// The slice lock is held by the caller; implementations must not lock it here.
    fn schedule_slice(&self, slice: Arc<DataSlice>) -> Result<(), EngineError>;

    /// Schedule sample time of the next frame to be rendered.
    fn current_play_time(&self) -> i64;

    /// Drop every scheduled slice and restart schedule time at zero.
    fn reset_schedule(&self);

    /// Clear any internal render state so stale audio is not heard after a stop.
    fn reset_render_state(&self) -> Result<(), EngineError>;

    fn start(&self) -> Result<(), EngineError>;

    /// Stop rendering. No render pass is in progress once this returns.
    fn stop(&self) -> Result<(), EngineError>;

    fn is_running(&self) -> bool;

    /// (Re)configure the output for `format`, e.g. after the output device changed.
    fn apply_stream_format(&self, format: &StreamFormat) -> Result<(), EngineError>;

    fn set_render_observer(&self, observer: Option<RenderObserver>);

    fn set_volume(&self, volume: f32) -> Result<(), EngineError>;

    fn volume(&self) -> f32;
}
