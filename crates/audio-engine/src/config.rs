use std::time::Duration;

/// Scheduler tuning shared by the engine and the player.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// Number of slices kept in flight between the decoder and the renderer.
    pub slice_count: usize,
    /// Capacity of every slice in frames.
    ///
    /// Larger values mean fewer fills per second but a longer pause/seek turnaround.
    pub chunk_frames: usize,
    /// Thread name for the decoder task queue.
    pub queue_name: String,
}

impl Default for EngineConfig {
    /// Eight slices of ten kibiframes each, a little under two seconds of canonical audio.
    fn default() -> Self {
        Self {
            slice_count: 8,
            chunk_frames: 10 * 1024,
            queue_name: "audio-engine-queue".to_string(),
        }
    }
}

/// Output device settings for the cpal renderer.
#[derive(Clone, Debug)]
pub struct OutputConfig {
    /// Substring match on the output device name; `None` selects the host default.
    pub device: Option<String>,
    /// How often the default output device is polled for changes.
    pub device_poll_interval: Duration,
    /// Initial output gain in `0.0..=1.0`.
    pub volume: f32,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            device: None,
            device_poll_interval: Duration::from_millis(500),
            volume: 1.0,
        }
    }
}
