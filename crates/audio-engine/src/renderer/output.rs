//! Device output (cpal).
//!
//! cpal streams cannot move between threads, so the stream lives on a dedicated output thread
//! and every control call is a command sent over a crossbeam channel with a one-shot reply.
//! The audio callback renders from the shared [`ScheduledPlayer`] and converts `f32` samples
//! to the device sample format.

use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use cpal::traits::{DeviceTrait, StreamTrait};
use crossbeam_channel::{Receiver, Sender};

use super::{RenderObserver, Renderer, ScheduledPlayer};
use crate::config::OutputConfig;
use crate::device;
use crate::error::{EngineError, codes};
use crate::format::StreamFormat;
use crate::slice::DataSlice;
use crate::sync::lock;

type Reply<T> = Sender<Result<T, EngineError>>;

enum OutputCommand {
    Open {
        format: StreamFormat,
        reply: Reply<String>,
    },
    Play {
        reply: Reply<()>,
    },
    Pause {
        reply: Reply<()>,
    },
    Shutdown,
}

/// Renderer backed by a cpal output stream.
pub struct CpalRenderer {
    player: Arc<ScheduledPlayer>,
    commands: Sender<OutputCommand>,
    worker: Mutex<Option<JoinHandle<()>>>,
    device_name: Mutex<Option<String>>,
}

impl CpalRenderer {
    /// Start the output thread and open a stream for `format` on the configured device.
    pub fn open(config: &OutputConfig, format: &StreamFormat) -> Result<Self, EngineError> {
        let player = Arc::new(ScheduledPlayer::new());
        player.set_gain(config.volume);

        let (commands, rx) = crossbeam_channel::unbounded();
        let needle = config.device.clone();
        let player_thread = player.clone();
        let worker = thread::Builder::new()
            .name("audio-output".to_string())
            .spawn(move || output_thread_main(needle, player_thread, rx))
            .map_err(|e| output_error(format!("spawn output thread: {e}")))?;

        let renderer = Self {
            player,
            commands,
            worker: Mutex::new(Some(worker)),
            device_name: Mutex::new(None),
        };
        renderer.apply_stream_format(format)?;
        Ok(renderer)
    }

    /// Name of the device the current stream was opened on.
    pub fn device_name(&self) -> Option<String> {
        lock(&self.device_name).clone()
    }

    fn request<T>(&self, make: impl FnOnce(Reply<T>) -> OutputCommand) -> Result<T, EngineError> {
        let (reply, response) = crossbeam_channel::bounded(1);
        self.commands
            .send(make(reply))
            .map_err(|_| output_thread_gone())?;
        response.recv().map_err(|_| output_thread_gone())?
    }
}

impl Renderer for CpalRenderer {
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
        Ok(())
    }

    fn start(&self) -> Result<(), EngineError> {
        self.request(|reply| OutputCommand::Play { reply })
    }

    fn stop(&self) -> Result<(), EngineError> {
        self.request(|reply| OutputCommand::Pause { reply })
    }

    fn is_running(&self) -> bool {
        self.player.is_running()
    }

    fn apply_stream_format(&self, format: &StreamFormat) -> Result<(), EngineError> {
        let format = *format;
        let name = self.request(|reply| OutputCommand::Open { format, reply })?;
        *lock(&self.device_name) = Some(name);
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

impl Drop for CpalRenderer {
    fn drop(&mut self) {
        let _ = self.commands.send(OutputCommand::Shutdown);
        if let Some(worker) = lock(&self.worker).take() {
            if worker.join().is_err() {
                tracing::warn!("output thread exited by panic");
            }
        }
    }
}

fn output_thread_gone() -> EngineError {
    EngineError::precondition(codes::OUTPUT_DEVICE, "output thread is not running")
}

fn output_thread_main(
    needle: Option<String>,
    player: Arc<ScheduledPlayer>,
    commands: Receiver<OutputCommand>,
) {
    let host = cpal::default_host();
    let mut stream: Option<cpal::Stream> = None;

    while let Ok(command) = commands.recv() {
        match command {
            OutputCommand::Open { format, reply } => {
                let was_running = player.is_running();
                player.set_running(false);
                stream = None;
                let result = open_stream(&host, needle.as_deref(), &format, &player)
                    .map(|(s, name)| {
                        stream = Some(s);
                        name
                    });
                if result.is_ok() && was_running {
                    if let Some(s) = &stream {
                        player.set_running(true);
                        if let Err(e) = s.play() {
                            tracing::warn!("restart output stream: {e}");
                            player.set_running(false);
                        }
                    }
                }
                let _ = reply.send(result);
            }
            OutputCommand::Play { reply } => {
                let result = match &stream {
                    Some(s) => {
                        player.set_running(true);
                        s.play().map_err(|e| {
                            player.set_running(false);
                            output_error(format!("play output stream: {e}"))
                        })
                    }
                    None => Err(output_error("no output stream open")),
                };
                let _ = reply.send(result);
            }
            OutputCommand::Pause { reply } => {
                player.set_running(false);
                if let Some(s) = &stream {
                    if let Err(e) = s.pause() {
                        // Some hosts cannot pause; the callback already renders silence.
                        tracing::debug!("pause output stream: {e}");
                    }
                }
                let _ = reply.send(Ok(()));
            }
            OutputCommand::Shutdown => break,
        }
    }

    player.set_running(false);
    drop(stream);
    tracing::debug!("output thread stopped");
}

fn open_stream(
    host: &cpal::Host,
    needle: Option<&str>,
    format: &StreamFormat,
    player: &Arc<ScheduledPlayer>,
) -> Result<(cpal::Stream, String), EngineError> {
    let device_err = |e: anyhow::Error| output_error(format!("{e:#}"));

    let device = device::pick_device(host, needle).map_err(device_err)?;
    let name = device
        .description()
        .map(|d| d.to_string())
        .unwrap_or_else(|_| "unknown device".to_string());

    let supported = device::pick_output_config(&device, format.sample_rate).map_err(device_err)?;
    if supported.sample_rate() != format.sample_rate {
        return Err(EngineError::precondition(
            codes::INCOMPATIBLE_FORMAT,
            format!(
                "{name} cannot run at {} Hz (closest is {} Hz)",
                format.sample_rate,
                supported.sample_rate()
            ),
        ));
    }

    let sample_format = supported.sample_format();
    let mut config: cpal::StreamConfig = supported.config();
    if let Some(buffer_size) = device::pick_buffer_size(&supported) {
        config.buffer_size = buffer_size;
    }

    let stream = build_output_stream(&device, &config, sample_format, player.clone())?;
    // Streams may start on creation; stay silent until the engine starts the graph.
    let _ = stream.pause();

    tracing::info!(
        device = %name,
        sample_rate = config.sample_rate,
        channels = config.channels,
        sample_format = ?sample_format,
        "output stream opened"
    );
    Ok((stream, name))
}

fn build_output_stream(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    sample_format: cpal::SampleFormat,
    player: Arc<ScheduledPlayer>,
) -> Result<cpal::Stream, EngineError> {
    match sample_format {
        cpal::SampleFormat::F32 => build_stream::<f32>(device, config, player),
        cpal::SampleFormat::I16 => build_stream::<i16>(device, config, player),
        cpal::SampleFormat::I32 => build_stream::<i32>(device, config, player),
        cpal::SampleFormat::U16 => build_stream::<u16>(device, config, player),
        other => Err(EngineError::precondition(
            codes::INCOMPATIBLE_FORMAT,
            format!("unsupported sample format: {other:?}"),
        )),
    }
}

fn build_stream<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    player: Arc<ScheduledPlayer>,
) -> Result<cpal::Stream, EngineError>
where
    T: cpal::Sample + cpal::SizedSample + cpal::FromSample<f32>,
{
    let channels_out = config.channels as usize;
    let mut scratch: Vec<f32> = Vec::new();

    let err_fn = |err| tracing::warn!("stream error: {err}");

    device
        .build_output_stream(
            config,
            move |data: &mut [T], _| {
                if scratch.len() < data.len() {
                    scratch.resize(data.len(), 0.0);
                }
                let rendered = &mut scratch[..data.len()];
                player.render_interleaved(rendered, channels_out);
                for (dst, src) in data.iter_mut().zip(rendered.iter()) {
                    *dst = <T as cpal::Sample>::from_sample::<f32>(*src);
                }
            },
            err_fn,
            None,
        )
        .map_err(|e| output_error(format!("build output stream: {e}")))
}

fn output_error(message: impl Into<String>) -> EngineError {
    EngineError::precondition(codes::OUTPUT_DEVICE, message)
}
