//! audio-play: play a local file through the slice-scheduled engine.
//!
//! The file is decoded with Symphonia on the engine's task queue, converted to 44.1 kHz stereo
//! when needed and rendered via CPAL. While playing, stdin accepts:
//! - `p`: pause/resume
//! - `s <secs>`: seek
//! - `v <0..1>`: volume
//! - `q`: stop and exit

mod cli;

use std::io::BufRead;
use std::path::Path;
use std::thread;

use anyhow::{Context, Result, anyhow};
use audio_engine::device;
use audio_engine::{Player, PlayerEvent};
use clap::Parser;
use crossbeam_channel::{Receiver, select};
use tracing_subscriber::EnvFilter;

use cli::Control;

fn main() -> Result<()> {
    let args = cli::Args::parse();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new("info,audio_engine=info")
        }))
        .init();

    if args.list_devices {
        let host = cpal::default_host();
        for (idx, name) in device::list_output_devices(&host)?.iter().enumerate() {
            println!("#{idx}: {name}");
        }
        return Ok(());
    }

    match &args.cmd {
        Some(cli::Command::Play { path, start }) => play_file(&args, path, *start),
        None => Err(anyhow!("nothing to do; try `audio-play play <PATH>` or --list-devices")),
    }
}

fn play_file(args: &cli::Args, path: &Path, start: Option<f64>) -> Result<()> {
    let player = Player::with_output(args.engine_config(), args.output_config())
        .context("open output device")?;
    player
        .open(path)
        .with_context(|| format!("open {}", path.display()))?;
    if let Some(start) = start {
        if !player.seek(start)? {
            tracing::warn!("source is not seekable; starting from the beginning");
        }
    }

    let (quit_tx, quit_rx) = crossbeam_channel::bounded::<()>(1);
    ctrlc::set_handler(move || {
        let _ = quit_tx.try_send(());
    })
    .context("install Ctrl-C handler")?;

    let mut controls = spawn_stdin_reader();
    let events = player.events();

    player.play()?;
    let status = player.status();
    tracing::info!(
        path = %path.display(),
        device = status.device.as_deref().unwrap_or("default"),
        codec = status.track.source_codec.as_deref().unwrap_or("unknown"),
        source_rate_hz = status.track.source_rate_hz,
        resampling = status.track.resampling,
        "playing"
    );

    loop {
        select! {
            recv(events) -> event => match event {
                Ok(PlayerEvent::Pulse) => tracing::info!("{}", player.status()),
                Ok(PlayerEvent::Finished { completed }) => {
                    tracing::info!(completed, "playback finished");
                    return Ok(());
                }
                Ok(PlayerEvent::Error(err)) => {
                    return Err(anyhow::Error::new(err).context("playback failed"));
                }
                Ok(PlayerEvent::OutputDeviceChanged) => {
                    tracing::info!(device = ?player.status().device, "output device changed");
                }
                Err(_) => return Ok(()),
            },
            recv(controls) -> control => match control {
                Ok(control) => apply_control(&player, control)?,
                Err(_) => controls = crossbeam_channel::never(),
            },
            recv(quit_rx) -> _ => {
                tracing::info!("interrupted");
                player.stop()?;
            }
        }
    }
}

fn apply_control(player: &Player, control: Control) -> Result<()> {
    match control {
        Control::TogglePause => {
            if player.is_paused() {
                player.resume()?;
            } else {
                player.pause()?;
            }
        }
        Control::Seek(secs) => {
            if !player.seek(secs)? {
                tracing::warn!("source is not seekable");
            }
        }
        Control::Volume(level) => player.set_volume(level)?,
        Control::Quit => player.stop()?,
    }
    tracing::info!("{}", player.status());
    Ok(())
}

fn spawn_stdin_reader() -> Receiver<Control> {
    let (tx, rx) = crossbeam_channel::unbounded();
    let spawned = thread::Builder::new()
        .name("stdin-controls".to_string())
        .spawn(move || {
            for line in std::io::stdin().lock().lines() {
                let Ok(line) = line else { break };
                if line.trim().is_empty() {
                    continue;
                }
                match cli::parse_control(&line) {
                    Ok(control) => {
                        if tx.send(control).is_err() {
                            break;
                        }
                    }
                    Err(e) => tracing::warn!("{e:#}"),
                }
            }
        });
    if let Err(e) = spawned {
        tracing::warn!("stdin controls unavailable: {e}");
    }
    rx
}
