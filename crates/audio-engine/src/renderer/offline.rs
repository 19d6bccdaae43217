use std::sync::{Arc, Mutex};

use super::{RenderObserver, Renderer, ScheduledPlayer};
use crate::error::EngineError;
use crate::format::StreamFormat;
use crate::slice::DataSlice;
use crate::sync::{AtomicCounter, lock};

/// Pull-driven renderer: every [`OfflineRenderer::render`] call is one render pass on the
/// caller's thread.
///
/// Useful for bouncing to memory and for driving the engine deterministically.
pub struct OfflineRenderer {
    player: ScheduledPlayer,
    format: Mutex<StreamFormat>,
    render_resets: AtomicCounter,
    format_changes: AtomicCounter,
}

impl Default for OfflineRenderer {
    fn default() -> Self {
        Self::new()
    }
}

impl OfflineRenderer {
    pub fn new() -> Self {
        Self {
            player: ScheduledPlayer::new(),
            format: Mutex::new(StreamFormat::canonical()),
            render_resets: AtomicCounter::new(0),
            format_changes: AtomicCounter::new(0),
        }
    }

    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Render `frames` frames of interleaved output in the current channel layout.
    pub fn render(&self, frames: usize) -> Vec<f32> {
        let channels = lock(&self.format).channel_count();
        let mut out = vec![0.0; frames * channels];
        self.player.render_interleaved(&mut out, channels);
        out
    }

    pub fn scheduled_len(&self) -> usize {
        self.player.scheduled_len()
    }

    pub fn render_resets(&self) -> i64 {
        self.render_resets.get()
    }

    pub fn format_changes(&self) -> i64 {
        self.format_changes.get()
    }
}

impl Renderer for OfflineRenderer {
    fn schedule_slice(&self, slice: Arc<DataSlice>) -> Result<(), EngineError> {
        self.player.schedule(slice);
        Ok(())
    }

    fn current_play_time(&self) -> i64 {
        self.player.play_time()
    }

    fn reset_schedule(&self) {
        self.player.reset_schedule();
    }

    fn reset_render_state(&self) -> Result<(), EngineError> {
        self.player.reset_schedule();
        self.render_resets.increment();
        Ok(())
    }

    fn start(&self) -> Result<(), EngineError> {
        self.player.set_running(true);
        Ok(())
    }

    fn stop(&self) -> Result<(), EngineError> {
        self.player.set_running(false);
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.player.is_running()
    }

    fn apply_stream_format(&self, format: &StreamFormat) -> Result<(), EngineError> {
        *lock(&self.format) = *format;
        self.format_changes.increment();
        Ok(())
    }

    fn set_render_observer(&self, observer: Option<RenderObserver>) {
        self.player.set_observer(observer);
    }

    fn set_volume(&self, volume: f32) -> Result<(), EngineError> {
        self.player.set_gain(volume);
        Ok(())
    }

    fn volume(&self) -> f32 {
        self.player.gain()
    }
}
