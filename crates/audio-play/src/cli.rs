use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use audio_engine::{EngineConfig, OutputConfig};
use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "audio-play", version)]
pub struct Args {
    #[command(subcommand)]
    pub cmd: Option<Command>,

    /// List output devices and exit
    #[arg(long)]
    pub list_devices: bool,

    /// Use a specific output device by substring match
    #[arg(long)]
    pub device: Option<String>,

    /// Slices kept in flight between the decoder and the output
    #[arg(long, default_value_t = 8)]
    pub slices: usize,

    /// Frames per slice (higher => fewer decoder wakeups, slower pause/seek)
    #[arg(long, default_value_t = 10 * 1024)]
    pub chunk_frames: usize,

    /// Initial volume in 0.0..=1.0
    #[arg(long, default_value_t = 1.0)]
    pub volume: f32,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Play a local file
    Play {
        /// Path to audio file
        path: PathBuf,

        /// Start position in seconds
        #[arg(long)]
        start: Option<f64>,
    },
}

impl Args {
    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            slice_count: self.slices,
            chunk_frames: self.chunk_frames,
            ..EngineConfig::default()
        }
    }

    pub fn output_config(&self) -> OutputConfig {
        OutputConfig {
            device: self.device.clone(),
            volume: self.volume,
            ..OutputConfig::default()
        }
    }
}

/// Interactive command read from stdin while playing.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Control {
    TogglePause,
    Seek(f64),
    Volume(f32),
    Quit,
}

pub fn parse_control(line: &str) -> Result<Control> {
    let mut parts = line.split_whitespace();
    let Some(cmd) = parts.next() else {
        bail!("empty command");
    };
    let arg = parts.next();
    match (cmd, arg) {
        ("p", None) => Ok(Control::TogglePause),
        ("q", None) => Ok(Control::Quit),
        ("s", Some(secs)) => {
            let secs: f64 = secs.parse().with_context(|| format!("bad seek position {secs:?}"))?;
            Ok(Control::Seek(secs))
        }
        ("v", Some(level)) => {
            let level: f32 = level.parse().with_context(|| format!("bad volume {level:?}"))?;
            if !(0.0..=1.0).contains(&level) {
                bail!("volume must be within 0..1");
            }
            Ok(Control::Volume(level))
        }
        _ => bail!("unknown command {line:?} (p | s <secs> | v <0..1> | q)"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_controls() {
        assert_eq!(parse_control("p").unwrap(), Control::TogglePause);
        assert_eq!(parse_control(" q ").unwrap(), Control::Quit);
        assert_eq!(parse_control("s 12.5").unwrap(), Control::Seek(12.5));
        assert_eq!(parse_control("v 0.25").unwrap(), Control::Volume(0.25));
    }

    #[test]
    fn rejects_bad_controls() {
        assert!(parse_control("").is_err());
        assert!(parse_control("s").is_err());
        assert!(parse_control("s ten").is_err());
        assert!(parse_control("v 2").is_err());
        assert!(parse_control("x").is_err());
    }

    #[test]
    fn args_map_to_configs() {
        let args = Args::parse_from([
            "audio-play",
            "--slices",
            "4",
            "--device",
            "usb",
            "play",
            "a.flac",
        ]);
        assert_eq!(args.engine_config().slice_count, 4);
        assert_eq!(args.engine_config().chunk_frames, 10 * 1024);
        assert_eq!(args.output_config().device.as_deref(), Some("usb"));
        assert!(matches!(args.cmd, Some(Command::Play { start: None, .. })));
    }
}
