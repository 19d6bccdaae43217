use std::fmt;

use crate::decoder::SourceInfo;
use crate::engine::EngineState;

/// Per-track details captured when a decoder is installed.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TrackStatus {
    /// Source identifier, usually a path.
    pub location: Option<String>,
    /// Source codec name (for example, FLAC/MP3).
    pub source_codec: Option<String>,
    /// Source bit depth when available.
    pub source_bit_depth: Option<u16>,
    /// Container format name.
    pub container: Option<String>,
    /// Source sample rate before conversion.
    pub source_rate_hz: Option<u32>,
    /// Source channel count before conversion.
    pub source_channels: Option<u16>,
    /// Whether the converter resamples this track.
    pub resampling: bool,
    /// Total track duration in milliseconds when known.
    pub duration_ms: Option<u64>,
}

impl TrackStatus {
    pub fn apply_source_info(&mut self, info: &SourceInfo) {
        self.source_codec = info.codec.clone();
        self.source_bit_depth = info.bit_depth;
        self.container = info.container.clone();
        if self.duration_ms.is_none() {
            self.duration_ms = info.duration_ms;
        }
    }

    /// Clear track-specific fields when the decoder goes away.
    pub fn clear(&mut self) {
        *self = Self::default();
    }
}

/// Point-in-time view of a player, suitable for logging or a UI.
#[derive(Clone, Debug, PartialEq)]
pub struct PlayerStatus {
    pub state: EngineState,
    /// True while the output is actually rendering.
    pub rendering: bool,
    pub track: TrackStatus,
    /// Output device name, when rendering to hardware.
    pub device: Option<String>,
    /// Output sample rate in Hz.
    pub sample_rate: u32,
    /// Output channel count.
    pub channels: u16,
    pub elapsed_ms: u64,
    pub active_slices: i64,
    pub volume: f32,
}

/// Milliseconds covered by `frames` at `sample_rate`.
pub fn frames_to_ms(frames: u64, sample_rate: u32) -> u64 {
    if sample_rate == 0 {
        return 0;
    }
    frames.saturating_mul(1000) / u64::from(sample_rate)
}

fn clock(ms: u64) -> String {
    let secs = ms / 1000;
    format!("{}:{:02}.{}", secs / 60, secs % 60, (ms % 1000) / 100)
}

impl fmt::Display for PlayerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self.state {
            EngineState::Stopped => "stopped",
            EngineState::Running => "playing",
            EngineState::Paused => "paused",
        };
        write!(f, "{state} {}", clock(self.elapsed_ms))?;
        if let Some(total) = self.track.duration_ms {
            write!(f, " / {}", clock(total))?;
        }
        write!(f, " [{} slices, vol {:.2}]", self.active_slices, self.volume)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status(state: EngineState, elapsed_ms: u64) -> PlayerStatus {
        PlayerStatus {
            state,
            rendering: state == EngineState::Running,
            track: TrackStatus::default(),
            device: None,
            sample_rate: 44_100,
            channels: 2,
            elapsed_ms,
            active_slices: 8,
            volume: 1.0,
        }
    }

    #[test]
    fn frames_convert_to_milliseconds() {
        assert_eq!(frames_to_ms(88_200, 44_100), 2000);
        assert_eq!(frames_to_ms(441, 44_100), 10);
        assert_eq!(frames_to_ms(1, 0), 0);
    }

    #[test]
    fn display_shows_position_and_duration() {
        let mut snap = status(EngineState::Running, 83_456);
        assert_eq!(snap.to_string(), "playing 1:23.4 [8 slices, vol 1.00]");
        snap.track.duration_ms = Some(200_000);
        snap.state = EngineState::Paused;
        assert_eq!(snap.to_string(), "paused 1:23.4 / 3:20.0 [8 slices, vol 1.00]");
    }

    #[test]
    fn source_info_fills_track_fields() {
        let mut track = TrackStatus {
            duration_ms: Some(5),
            ..TrackStatus::default()
        };
        track.apply_source_info(&SourceInfo {
            codec: Some("FLAC".to_string()),
            bit_depth: Some(24),
            container: Some("flac".to_string()),
            duration_ms: Some(9),
        });
        assert_eq!(track.source_codec.as_deref(), Some("FLAC"));
        assert_eq!(track.source_bit_depth, Some(24));
        assert_eq!(track.duration_ms, Some(5));

        track.clear();
        assert_eq!(track, TrackStatus::default());
    }
}
