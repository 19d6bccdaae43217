//! Player facade over one [`PlaybackEngine`].
//!
//! Owns the engine, the current decoder and an event channel. Engine callbacks only flip a few
//! flags and post [`PlayerEvent`]s; everything that touches the decoder runs on the engine's
//! task queue.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crossbeam_channel::{Receiver, Sender, TrySendError};

use crate::config::{EngineConfig, OutputConfig};
use crate::convert::{DEFAULT_CONVERTER_CHUNK_FRAMES, FormatConverter};
use crate::decoder::{Decoder, SymphoniaDecoder};
use crate::device::DeviceWatcher;
use crate::engine::{EngineState, PlaybackEngine};
use crate::error::{EngineError, codes};
use crate::format::{CANONICAL_CHANNELS, CANONICAL_SAMPLE_RATE, StreamFormat};
use crate::renderer::{CpalRenderer, Renderer};
use crate::status::{PlayerStatus, TrackStatus, frames_to_ms};
use crate::sync::{AtomicFlag, lock};

const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
pub enum PlayerEvent {
    /// Playback ended; `completed` is false when it was stopped early.
    Finished { completed: bool },
    Error(EngineError),
    OutputDeviceChanged,
    /// Once per rendered second.
    Pulse,
}

type SharedDecoder = Arc<Mutex<Box<dyn Decoder>>>;

struct Loaded {
    decoder: SharedDecoder,
    location: String,
    total_frames: u64,
    can_seek: bool,
}

#[derive(Default)]
struct PlayerFlags {
    /// Next `play` starts from the top (after an error or a natural end).
    rewind_pending: AtomicFlag,
    /// Cleared by a seek while paused: the buffered slices no longer match the decoder.
    preserve_on_resume: AtomicFlag,
}

pub struct Player {
    engine: PlaybackEngine,
    flags: Arc<PlayerFlags>,
    loaded: Mutex<Option<Loaded>>,
    track: Mutex<TrackStatus>,
    events_tx: Sender<PlayerEvent>,
    events: Receiver<PlayerEvent>,
    output: Option<Arc<CpalRenderer>>,
    watcher: Option<DeviceWatcher>,
    origin_frame: AtomicU64,
    base_rendered: AtomicU64,
}

impl Player {
    pub fn new(renderer: Arc<dyn Renderer>, config: EngineConfig) -> Result<Self, EngineError> {
        let engine = PlaybackEngine::new(renderer, config)?;
        let (events_tx, events) = crossbeam_channel::bounded(EVENT_CAPACITY);
        let flags = Arc::new(PlayerFlags::default());
        flags.preserve_on_resume.set(true);

        {
            let tx = events_tx.clone();
            let flags = flags.clone();
            engine.set_error_handler(move |err| {
                flags.rewind_pending.set(true);
                emit(&tx, PlayerEvent::Error(err));
            });
        }
        {
            let tx = events_tx.clone();
            let flags = flags.clone();
            engine.set_end_of_playback_handler(move || {
                flags.rewind_pending.set(true);
                emit(&tx, PlayerEvent::Finished { completed: true });
            });
        }
        {
            let tx = events_tx.clone();
            engine.set_output_device_changed_handler(move || {
                emit(&tx, PlayerEvent::OutputDeviceChanged)
            });
        }
        {
            let tx = events_tx.clone();
            engine.set_pulse_handler(move || emit(&tx, PlayerEvent::Pulse));
        }

        Ok(Self {
            engine,
            flags,
            loaded: Mutex::new(None),
            track: Mutex::new(TrackStatus::default()),
            events_tx,
            events,
            output: None,
            watcher: None,
            origin_frame: AtomicU64::new(0),
            base_rendered: AtomicU64::new(0),
        })
    }

    /// Player rendering to a cpal output device, rebuilt when the default device changes.
    pub fn with_output(config: EngineConfig, output: OutputConfig) -> Result<Self, EngineError> {
        let renderer = Arc::new(CpalRenderer::open(&output, &StreamFormat::canonical())?);
        let mut player = Self::new(renderer.clone(), config)?;
        player.output = Some(renderer);

        if output.device.is_none() {
            let engine = player.engine.clone();
            let watcher = DeviceWatcher::spawn(output.device_poll_interval, move || {
                if let Err(err) = engine.output_device_did_change() {
                    tracing::warn!("output device change failed: {err}");
                }
            });
            match watcher {
                Ok(watcher) => player.watcher = Some(watcher),
                Err(err) => tracing::warn!("device watcher unavailable: {err:#}"),
            }
        }
        Ok(player)
    }

    pub fn engine(&self) -> &PlaybackEngine {
        &self.engine
    }

    /// Event stream; clone freely.
    pub fn events(&self) -> Receiver<PlayerEvent> {
        self.events.clone()
    }

    /// Replace the current decoder, stopping playback first.
    ///
    /// Sources that are not 44.1 kHz stereo go through a [`FormatConverter`].
    pub fn set_decoder(&self, decoder: Box<dyn Decoder>) -> Result<(), EngineError> {
        let _guard = self.engine.lock();
        self.halt()?;

        let source_format = decoder.stream_format();
        let location = decoder.location();
        let direct = source_format.sample_rate == CANONICAL_SAMPLE_RATE
            && source_format.channels == CANONICAL_CHANNELS;
        let (decoder, resampling): (Box<dyn Decoder>, bool) = if direct {
            (decoder, false)
        } else {
            let converter = FormatConverter::new(
                decoder,
                StreamFormat::canonical(),
                DEFAULT_CONVERTER_CHUNK_FRAMES,
            )?;
            let resampling = converter.is_resampling();
            (Box::new(converter), resampling)
        };

        let total_frames = decoder.total_frames();
        let can_seek = decoder.can_seek();
        let shared: SharedDecoder = Arc::new(Mutex::new(decoder));
        let fill_decoder = shared.clone();
        self.engine.set_fill_handler(move |buffers, max_frames| {
            lock(&fill_decoder).fill_buffers(buffers, max_frames)
        });

        tracing::info!(
            location = %location,
            rate_hz = source_format.sample_rate,
            channels = source_format.channels,
            converted = !direct,
            resampling,
            "decoder installed"
        );

        *lock(&self.track) = TrackStatus {
            location: Some(location.clone()),
            source_rate_hz: Some(source_format.sample_rate),
            source_channels: Some(source_format.channels),
            resampling,
            duration_ms: (total_frames > 0)
                .then(|| frames_to_ms(total_frames, CANONICAL_SAMPLE_RATE)),
            ..TrackStatus::default()
        };
        *lock(&self.loaded) = Some(Loaded {
            decoder: shared,
            location,
            total_frames,
            can_seek,
        });
        self.flags.rewind_pending.set(false);
        self.flags.preserve_on_resume.set(true);
        self.set_position(0, 0);
        Ok(())
    }

    /// Open a local file with Symphonia and install it as the current decoder.
    pub fn open(&self, path: impl AsRef<Path>) -> Result<(), EngineError> {
        let decoder = SymphoniaDecoder::open(path)?;
        let info = decoder.source_info().clone();
        self.set_decoder(Box::new(decoder))?;
        lock(&self.track).apply_source_info(&info);
        Ok(())
    }

    pub fn play(&self) -> Result<(), EngineError> {
        let _guard = self.engine.lock();
        let (decoder, can_seek) = self.loaded_decoder()?;
        match self.engine.state() {
            EngineState::Running => {
                if !self.engine.is_running() {
                    self.engine.start_graph()?;
                }
                Ok(())
            }
            EngineState::Paused => self.resume(),
            EngineState::Stopped => {
                if self.flags.rewind_pending.swap(false) && can_seek {
                    self.seek_decoder(&decoder, 0)?;
                }
                let start = self.engine.run_on_queue(move || lock(&decoder).current_frame())?;
                self.set_position(start, 0);
                self.flags.preserve_on_resume.set(true);

                self.engine.start_processing()?;
                if self.engine.state() == EngineState::Stopped {
                    return Ok(());
                }
                self.engine.start_graph()?;
                tracing::info!(start_frame = start, "playback started");
                Ok(())
            }
        }
    }

    pub fn pause(&self) -> Result<(), EngineError> {
        let _guard = self.engine.lock();
        if self.engine.state() != EngineState::Running {
            return Ok(());
        }
        self.engine.pause_processing()
    }

    pub fn resume(&self) -> Result<(), EngineError> {
        let _guard = self.engine.lock();
        if self.engine.state() != EngineState::Paused {
            return Ok(());
        }
        let preserve = self.flags.preserve_on_resume.swap(true);
        self.engine.resume_processing(preserve)?;
        self.engine.start_graph()
    }

    /// Stop and rewind. Posts `Finished { completed: false }` when something was playing.
    pub fn stop(&self) -> Result<(), EngineError> {
        let _guard = self.engine.lock();
        let was_active = self.halt()?;
        if let Ok((decoder, can_seek)) = self.loaded_decoder() {
            if can_seek {
                self.seek_decoder(&decoder, 0)?;
            } else {
                self.flags.rewind_pending.set(true);
            }
        }
        self.flags.preserve_on_resume.set(true);
        self.set_position(0, self.engine.rendered_frames());
        if was_active {
            emit(&self.events_tx, PlayerEvent::Finished { completed: false });
        }
        Ok(())
    }

    pub fn is_playing(&self) -> bool {
        self.engine.state() == EngineState::Running && self.engine.is_running()
    }

    pub fn is_paused(&self) -> bool {
        self.engine.state() == EngineState::Paused
    }

    /// Seek to `seconds`. Returns `Ok(false)` when the decoder cannot seek.
    pub fn seek(&self, seconds: f64) -> Result<bool, EngineError> {
        let _guard = self.engine.lock();
        let (decoder, can_seek) = self.loaded_decoder()?;
        if !can_seek {
            return Ok(false);
        }
        let total = lock(&self.loaded).as_ref().map(|l| l.total_frames).unwrap_or(0);
        let mut target = (seconds.max(0.0) * f64::from(CANONICAL_SAMPLE_RATE)).round() as u64;
        if total > 0 {
            target = target.min(total);
        }

        match self.engine.state() {
            EngineState::Running => {
                let graph_running = self.engine.is_running();
                self.engine.pause_processing()?;
                self.seek_decoder(&decoder, target)?;
                self.set_position(target, self.engine.rendered_frames());
                self.engine.resume_processing(false)?;
                if graph_running {
                    self.engine.start_graph()?;
                }
            }
            EngineState::Paused => {
                self.seek_decoder(&decoder, target)?;
                self.set_position(target, self.engine.rendered_frames());
                self.flags.preserve_on_resume.set(false);
            }
            EngineState::Stopped => {
                self.seek_decoder(&decoder, target)?;
                self.set_position(target, self.engine.rendered_frames());
                self.flags.rewind_pending.set(false);
            }
        }
        tracing::debug!(target_frame = target, "seek");
        Ok(true)
    }

    /// Playback position in seconds.
    pub fn current_time(&self) -> f64 {
        self.position_frames() as f64 / f64::from(CANONICAL_SAMPLE_RATE)
    }

    /// Track length in seconds, 0 when unknown.
    pub fn duration(&self) -> f64 {
        let total = lock(&self.loaded).as_ref().map(|l| l.total_frames).unwrap_or(0);
        total as f64 / f64::from(CANONICAL_SAMPLE_RATE)
    }

    pub fn location(&self) -> Option<String> {
        lock(&self.loaded).as_ref().map(|l| l.location.clone())
    }

    pub fn set_volume(&self, volume: f32) -> Result<(), EngineError> {
        self.engine.set_volume(volume)
    }

    pub fn volume(&self) -> f32 {
        self.engine.volume()
    }

    pub fn status(&self) -> PlayerStatus {
        let format = self.engine.stream_format();
        PlayerStatus {
            state: self.engine.state(),
            rendering: self.engine.is_running(),
            track: lock(&self.track).clone(),
            device: self.output.as_ref().and_then(|o| o.device_name()),
            sample_rate: format.sample_rate,
            channels: format.channels,
            elapsed_ms: frames_to_ms(self.position_frames(), CANONICAL_SAMPLE_RATE),
            active_slices: self.engine.active_slices(),
            volume: self.engine.volume(),
        }
    }

    fn loaded_decoder(&self) -> Result<(SharedDecoder, bool), EngineError> {
        lock(&self.loaded)
            .as_ref()
            .map(|l| (l.decoder.clone(), l.can_seek))
            .ok_or_else(|| EngineError::precondition(codes::NO_DECODER, "no decoder installed"))
    }

    fn seek_decoder(&self, decoder: &SharedDecoder, frame: u64) -> Result<(), EngineError> {
        let decoder = decoder.clone();
        self.engine
            .run_on_queue(move || lock(&decoder).set_current_frame(frame))?
    }

    /// Stop the graph and processing; returns whether anything was active.
    fn halt(&self) -> Result<bool, EngineError> {
        let active = self.engine.state() != EngineState::Stopped || self.engine.is_running();
        if active {
            self.engine.stop_graph()?;
            self.engine.stop_processing();
        }
        Ok(active)
    }

    fn set_position(&self, origin: u64, base: u64) {
        self.origin_frame.store(origin, Ordering::SeqCst);
        self.base_rendered.store(base, Ordering::SeqCst);
    }

    fn position_frames(&self) -> u64 {
        let rendered = self
            .engine
            .rendered_frames()
            .saturating_sub(self.base_rendered.load(Ordering::SeqCst));
        self.origin_frame.load(Ordering::SeqCst) + rendered
    }
}

impl Drop for Player {
    fn drop(&mut self) {
        self.watcher.take();
        if let Err(err) = self.halt() {
            tracing::warn!("stop on drop: {err}");
        }
        self.engine.clear_fill_handler();
    }
}

fn emit(tx: &Sender<PlayerEvent>, event: PlayerEvent) {
    match tx.try_send(event) {
        Ok(()) => {}
        Err(TrySendError::Full(event)) => tracing::debug!(?event, "event channel full; dropping"),
        Err(TrySendError::Disconnected(_)) => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::MemoryDecoder;
    use crate::format::AudioBuffers;
    use crate::renderer::OfflineRenderer;

    fn ramp(frames: usize) -> MemoryDecoder {
        let ramp: Vec<f32> = (0..frames).map(|i| i as f32).collect();
        MemoryDecoder::new(StreamFormat::canonical(), vec![ramp.clone(), ramp]).unwrap()
    }

    fn player_with(decoder: Box<dyn Decoder>) -> (Player, Arc<OfflineRenderer>) {
        let renderer = OfflineRenderer::shared();
        let config = EngineConfig {
            slice_count: 3,
            chunk_frames: 1024,
            ..EngineConfig::default()
        };
        let player = Player::new(renderer.clone(), config).unwrap();
        player.set_decoder(decoder).unwrap();
        (player, renderer)
    }

    fn render_left(player: &Player, renderer: &OfflineRenderer, frames: usize) -> Vec<f32> {
        let out = renderer.render(frames);
        player.engine().flush_scheduler().unwrap();
        out.iter().step_by(2).copied().collect()
    }

    fn expected(range: std::ops::Range<usize>) -> Vec<f32> {
        range.map(|i| i as f32).collect()
    }

    fn saw_finished(player: &Player, completed: bool) -> bool {
        player
            .events()
            .try_iter()
            .any(|e| matches!(e, PlayerEvent::Finished { completed: c } if c == completed))
    }

    struct Unseekable(MemoryDecoder);

    impl Decoder for Unseekable {
        fn location(&self) -> String {
            self.0.location()
        }
        fn stream_format(&self) -> StreamFormat {
            self.0.stream_format()
        }
        fn total_frames(&self) -> u64 {
            self.0.total_frames()
        }
        fn current_frame(&self) -> u64 {
            self.0.current_frame()
        }
        fn can_seek(&self) -> bool {
            false
        }
        fn set_current_frame(&mut self, _frame: u64) -> Result<(), EngineError> {
            Err(EngineError::decode(codes::SEEK_FAILED, "not seekable"))
        }
        fn fill_buffers(
            &mut self,
            buffers: &mut AudioBuffers,
            max: usize,
        ) -> Result<usize, EngineError> {
            self.0.fill_buffers(buffers, max)
        }
    }

    struct Broken;

    impl Decoder for Broken {
        fn location(&self) -> String {
            "broken".to_string()
        }
        fn stream_format(&self) -> StreamFormat {
            StreamFormat::canonical()
        }
        fn total_frames(&self) -> u64 {
            0
        }
        fn current_frame(&self) -> u64 {
            0
        }
        fn can_seek(&self) -> bool {
            true
        }
        fn set_current_frame(&mut self, _frame: u64) -> Result<(), EngineError> {
            Ok(())
        }
        fn fill_buffers(&mut self, _: &mut AudioBuffers, _: usize) -> Result<usize, EngineError> {
            Err(EngineError::decode(codes::DECODE_FAILED, "bad packet"))
        }
    }

    #[test]
    fn play_requires_a_decoder() {
        let player = Player::new(OfflineRenderer::shared(), EngineConfig::default()).unwrap();
        let err = player.play().unwrap_err();
        assert_eq!(err.code(), codes::NO_DECODER);
        assert!(player.location().is_none());
    }

    #[test]
    fn finishing_rewinds_on_next_play() {
        let (player, renderer) = player_with(Box::new(ramp(2500)));
        player.play().unwrap();
        assert!(player.is_playing());

        let mut played = Vec::new();
        for _ in 0..3 {
            played.extend(render_left(&player, &renderer, 1024));
        }
        assert_eq!(&played[..2500], expected(0..2500).as_slice());
        assert!(saw_finished(&player, true));
        assert!(!player.is_playing());

        player.play().unwrap();
        assert_eq!(render_left(&player, &renderer, 8), expected(0..8));
    }

    #[test]
    fn pause_and_resume_continue_where_they_left_off() {
        let (player, renderer) = player_with(Box::new(ramp(100_000)));
        player.play().unwrap();
        render_left(&player, &renderer, 1500);

        player.pause().unwrap();
        assert!(player.is_paused());
        assert!(!player.is_playing());
        player.pause().unwrap();

        player.resume().unwrap();
        assert!(player.is_playing());
        assert_eq!(render_left(&player, &renderer, 10), expected(1500..1510));
    }

    #[test]
    fn seek_while_playing_jumps_to_target() {
        let (player, renderer) = player_with(Box::new(ramp(100_000)));
        player.play().unwrap();
        render_left(&player, &renderer, 100);

        assert!(player.seek(1.0).unwrap());
        assert!(player.is_playing());
        assert_eq!(render_left(&player, &renderer, 10), expected(44_100..44_110));
        assert!((player.current_time() - 44_110.0 / 44_100.0).abs() < 1e-9);
    }

    #[test]
    fn seek_while_paused_refills_on_resume() {
        let (player, renderer) = player_with(Box::new(ramp(100_000)));
        player.play().unwrap();
        render_left(&player, &renderer, 1500);
        player.pause().unwrap();

        assert!(player.seek(0.5).unwrap());
        assert!(player.is_paused());
        player.resume().unwrap();
        assert_eq!(render_left(&player, &renderer, 5), expected(22_050..22_055));
    }

    #[test]
    fn seek_reports_unseekable_sources() {
        let (player, _renderer) = player_with(Box::new(Unseekable(ramp(1000))));
        assert!(!player.seek(0.01).unwrap());
    }

    #[test]
    fn stop_rewinds_and_reports_early_finish() {
        let (player, renderer) = player_with(Box::new(ramp(100_000)));
        player.play().unwrap();
        render_left(&player, &renderer, 2000);

        player.stop().unwrap();
        assert!(!player.is_playing());
        assert!(saw_finished(&player, false));
        assert_eq!(player.current_time(), 0.0);

        player.play().unwrap();
        assert_eq!(render_left(&player, &renderer, 4), expected(0..4));
    }

    #[test]
    fn decode_error_is_posted_and_stops_playback() {
        let (player, _renderer) = player_with(Box::new(Broken));
        player.play().unwrap();
        assert!(!player.is_playing());
        let errors: Vec<_> = player
            .events()
            .try_iter()
            .filter_map(|e| match e {
                PlayerEvent::Error(err) => Some(err),
                _ => None,
            })
            .collect();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].code(), codes::DECODE_FAILED);
    }

    #[test]
    fn mono_sources_are_upmixed() {
        let mono: Vec<f32> = (0..4096).map(|i| i as f32).collect();
        let decoder = MemoryDecoder::new(StreamFormat::planar_f32(44_100, 1), vec![mono]).unwrap();
        let (player, renderer) = player_with(Box::new(decoder));
        let status = player.status();
        assert_eq!(status.track.source_channels, Some(1));
        assert!(!status.track.resampling);

        player.play().unwrap();
        let out = renderer.render(3);
        assert_eq!(out, vec![0.0, 0.0, 1.0, 1.0, 2.0, 2.0]);
    }

    #[test]
    fn reports_track_details() {
        let (player, renderer) = player_with(Box::new(ramp(88_200).with_location("ramp.raw")));
        assert_eq!(player.location().as_deref(), Some("ramp.raw"));
        assert_eq!(player.duration(), 2.0);

        player.set_volume(0.5).unwrap();
        assert_eq!(player.volume(), 0.5);

        player.play().unwrap();
        render_left(&player, &renderer, 441);
        let status = player.status();
        assert_eq!(status.elapsed_ms, 10);
        assert_eq!(status.track.duration_ms, Some(2000));
        assert_eq!(status.state, EngineState::Running);
        assert!(player.events().try_iter().any(|e| matches!(e, PlayerEvent::Pulse)));
    }
}
