//! Slice scheduler and engine state machine.
//!
//! The engine owns a fixed ring of [`DataSlice`]s and keeps them cycling:
//! 1. **Fill + schedule** (task queue thread): the fill handler writes decoded frames into an
//!    idle slice, the slice is stamped with the sample-time cursor and handed to the renderer.
//! 2. **Render** (render thread): the renderer plays the slice and reports completion.
//! 3. **Complete** (render thread): the slice goes back to idle and a refill is queued
//!    asynchronously. The render thread never calls the decoder.
//!
//! A counter shared by all slices tracks how many are in flight; it reaching zero after the
//! fill handler reports no more frames is the end of the stream.
//!
//! ## Pause and resume
//! Pausing stops the renderer, reads its play position and trims the slice that was playing so
//! it starts exactly at the first unheard frame. The remaining slices are kept, sorted by
//! timestamp, and rescheduled on resume without touching the decoder again.
//!
//! ## Locking
//! Control operations hold the engine's re-entrant lock and take slice locks one at a time.
//! Terminal transitions raised on the queue thread (end of stream, errors) do not take the engine
//! lock: a control thread may be holding it while blocked on a synchronous fill.


use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};

use crate::config::EngineConfig;
use crate::error::{EngineError, ErrorKind, codes};
use crate::format::{AudioBuffers, StreamFormat};
use crate::renderer::Renderer;
use crate::slice::{DataSlice, SliceFlags};
use crate::sync::{AtomicCounter, AtomicFlag, ReentrantGuard, ReentrantLock, lock};
use crate::task_queue::{TaskQueue, panic_message};

pub type ErrorHandler = Arc<dyn Fn(EngineError) + Send + Sync>;
pub type EventHandler = Arc<dyn Fn() + Send + Sync>;

/// Writes up to `max_frames` frames into the slice buffers and returns how many it wrote.
///
/// `Ok(0)` means the source is exhausted.
pub type FillHandler =
    Box<dyn FnMut(&mut AudioBuffers, usize) -> Result<usize, EngineError> + Send>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EngineState {
    Stopped,
    Running,
    Paused,
}

#[derive(Default)]
struct Handlers {
    error: Option<ErrorHandler>,
    end_of_playback: Option<EventHandler>,
    output_device_changed: Option<EventHandler>,
    pulse: Option<EventHandler>,
}

/// Cloneable handle to a playback engine.
#[derive(Clone)]
pub struct PlaybackEngine {
    core: Arc<EngineCore>,
}

pub struct EngineCore {
    lock: ReentrantLock,
    config: EngineConfig,
    queue: TaskQueue,
    renderer: Arc<dyn Renderer>,
    slices: Vec<Arc<DataSlice>>,
    active_slices: Arc<AtomicCounter>,
    sample_time: AtomicCounter,
    processing: AtomicFlag,
    paused: AtomicFlag,
    error_occurred: AtomicFlag,
    paused_slices: Mutex<Option<Vec<Arc<DataSlice>>>>,
    handlers: RwLock<Handlers>,
    fill_handler: Mutex<Option<FillHandler>>,
    format: Mutex<StreamFormat>,
    sample_rate: AtomicU32,
    rendered_frames: AtomicU64,
    last_pulse_second: AtomicCounter,
}

impl PlaybackEngine {
    pub fn new(renderer: Arc<dyn Renderer>, config: EngineConfig) -> Result<Self, EngineError> {
        if config.slice_count == 0 || config.chunk_frames == 0 {
            return Err(EngineError::precondition(
                codes::INVALID_STATE,
                format!(
                    "slice_count ({}) and chunk_frames ({}) must be non-zero",
                    config.slice_count, config.chunk_frames
                ),
            ));
        }

        let format = StreamFormat::canonical();
        let core = Arc::new_cyclic(|owner: &Weak<EngineCore>| {
            let active_slices = Arc::new(AtomicCounter::new(0));
            let slices = (0..config.slice_count)
                .map(|index| Arc::new(DataSlice::new(index, owner.clone(), active_slices.clone())))
                .collect();
            EngineCore {
                lock: ReentrantLock::new(),
                queue: TaskQueue::new(config.queue_name.clone()),
                renderer: renderer.clone(),
                slices,
                active_slices,
                sample_time: AtomicCounter::new(0),
                processing: AtomicFlag::new(false),
                paused: AtomicFlag::new(false),
                error_occurred: AtomicFlag::new(false),
                paused_slices: Mutex::new(None),
                handlers: RwLock::new(Handlers::default()),
                fill_handler: Mutex::new(None),
                format: Mutex::new(format),
                sample_rate: AtomicU32::new(format.sample_rate),
                rendered_frames: AtomicU64::new(0),
                last_pulse_second: AtomicCounter::new(-1),
                config,
            }
        });

        let observer_owner = Arc::downgrade(&core);
        renderer.set_render_observer(Some(Arc::new(move |frames| {
            if let Some(core) = observer_owner.upgrade() {
                core.frames_rendered(frames);
            }
        })));

        tracing::debug!(
            slices = core.config.slice_count,
            chunk_frames = core.config.chunk_frames,
            "playback engine created"
        );
        Ok(Self { core })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.core.config
    }

    /// Acquire the engine lock. Re-entrant: engine operations can be called while holding it.
    pub fn lock(&self) -> ReentrantGuard<'_> {
        self.core.lock.lock()
    }

    pub fn set_error_handler<F>(&self, handler: F)
    where
        F: Fn(EngineError) + Send + Sync + 'static,
    {
        self.core.write_handlers().error = Some(Arc::new(handler));
    }

    pub fn set_end_of_playback_handler<F>(&self, handler: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.core.write_handlers().end_of_playback = Some(Arc::new(handler));
    }

    pub fn set_output_device_changed_handler<F>(&self, handler: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.core.write_handlers().output_device_changed = Some(Arc::new(handler));
    }

    /// Called from the render thread once per elapsed second of rendered audio.
    pub fn set_pulse_handler<F>(&self, handler: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.core.write_handlers().pulse = Some(Arc::new(handler));
    }

    pub fn set_fill_handler<F>(&self, handler: F)
    where
        F: FnMut(&mut AudioBuffers, usize) -> Result<usize, EngineError> + Send + 'static,
    {
        *lock(&self.core.fill_handler) = Some(Box::new(handler));
    }

    pub fn clear_fill_handler(&self) {
        *lock(&self.core.fill_handler) = None;
    }

    pub fn start_processing(&self) -> Result<(), EngineError> {
        self.core.start_processing()
    }

    pub fn stop_processing(&self) {
        self.core.stop_processing();
    }

    pub fn pause_processing(&self) -> Result<(), EngineError> {
        self.core.pause_processing()
    }

    pub fn resume_processing(&self, preserve_buffers: bool) -> Result<(), EngineError> {
        self.core.resume_processing(preserve_buffers)
    }

    pub fn output_device_did_change(&self) -> Result<(), EngineError> {
        self.core.output_device_did_change()
    }

    pub fn start_graph(&self) -> Result<(), EngineError> {
        let _guard = self.core.lock.lock();
        tracing::debug!("starting render graph");
        self.core.renderer.start()
    }

    pub fn stop_graph(&self) -> Result<(), EngineError> {
        let _guard = self.core.lock.lock();
        tracing::debug!("stopping render graph");
        self.core.renderer.stop()
    }

    pub fn is_running(&self) -> bool {
        self.core.renderer.is_running()
    }

    pub fn state(&self) -> EngineState {
        self.core.state()
    }

    pub fn is_processing(&self) -> bool {
        self.core.processing.get()
    }

    pub fn is_paused(&self) -> bool {
        self.core.paused.get()
    }

    pub fn stream_format(&self) -> StreamFormat {
        *lock(&self.core.format)
    }

    /// Change the stream format. Slice buffers are reallocated on the next start.
    pub fn set_stream_format(&self, format: StreamFormat) -> Result<(), EngineError> {
        let _guard = self.core.lock.lock();
        if self.core.processing.get() {
            return Err(EngineError::precondition(
                codes::SET_STREAM_FORMAT,
                "stream format cannot change while processing",
            ));
        }
        if format.sample_rate == 0 || format.channels == 0 {
            return Err(EngineError::precondition(
                codes::SET_STREAM_FORMAT,
                format!("invalid stream format {format:?}"),
            ));
        }
        self.core.renderer.apply_stream_format(&format)?;
        *lock(&self.core.format) = format;
        self.core.sample_rate.store(format.sample_rate, Ordering::SeqCst);
        Ok(())
    }

    pub fn set_volume(&self, volume: f32) -> Result<(), EngineError> {
        self.core.renderer.set_volume(volume)
    }

    pub fn volume(&self) -> f32 {
        self.core.renderer.volume()
    }

    /// Schedule sample time of the next frame the fill cycle will stamp.
    pub fn sample_time(&self) -> i64 {
        self.core.sample_time.get()
    }

    pub fn active_slices(&self) -> i64 {
        self.core.active_slices.get()
    }

    /// Frames rendered from slices since processing last started.
    pub fn rendered_frames(&self) -> u64 {
        self.core.rendered_frames.load(Ordering::SeqCst)
    }

    /// Block until every fill queued before this call has run.
    pub fn flush_scheduler(&self) -> Result<(), EngineError> {
        Ok(self.core.queue.flush()?)
    }

    /// Run `work` on the decoder thread, serialized with fills.
    pub fn run_on_queue<R, F>(&self, work: F) -> Result<R, EngineError>
    where
        R: Send + 'static,
        F: FnOnce() -> R + Send + 'static,
    {
        Ok(self.core.queue.call(work)?)
    }
}

impl EngineCore {
    fn write_handlers(&self) -> std::sync::RwLockWriteGuard<'_, Handlers> {
        self.handlers.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn handler<T: Clone>(&self, pick: impl FnOnce(&Handlers) -> Option<T>) -> Option<T> {
        pick(&self.handlers.read().unwrap_or_else(PoisonError::into_inner))
    }

    fn state(&self) -> EngineState {
        if !self.processing.get() {
            EngineState::Stopped
        } else if self.paused.get() {
            EngineState::Paused
        } else {
            EngineState::Running
        }
    }

    fn require_handlers(&self) -> Result<(), EngineError> {
        let missing = {
            let handlers = self.handlers.read().unwrap_or_else(PoisonError::into_inner);
            if handlers.error.is_none() {
                Some("error")
            } else if handlers.end_of_playback.is_none() {
                Some("end-of-playback")
            } else if lock(&self.fill_handler).is_none() {
                Some("fill")
            } else {
                None
            }
        };
        match missing {
            Some(name) => Err(EngineError::precondition(
                codes::MISSING_HANDLER,
                format!("no {name} handler installed"),
            )),
            None => Ok(()),
        }
    }

    fn start_processing(&self) -> Result<(), EngineError> {
        let _guard = self.lock.lock();
        self.require_handlers()?;
        if self.processing.get() {
            return Err(EngineError::precondition(
                codes::INVALID_STATE,
                "processing is already active",
            ));
        }

        self.renderer.reset_schedule();
        self.sample_time.set(0);
        self.error_occurred.set(false);
        self.rendered_frames.store(0, Ordering::SeqCst);
        self.last_pulse_second.set(-1);
        self.paused.set(false);
        *lock(&self.paused_slices) = None;

        let format = *lock(&self.format);
        for slice in &self.slices {
            let mut state = slice.lock();
            slice.reset(&mut state);
            state.ensure_buffers(&format, self.config.chunk_frames);
        }

        self.processing.set(true);
        tracing::info!(
            slices = self.slices.len(),
            chunk_frames = self.config.chunk_frames,
            "processing started"
        );

        for slice in &self.slices {
            if let Err(err) = self.fill_sync(slice) {
                self.halt_processing();
                return Err(err);
            }
        }
        Ok(())
    }

    fn stop_processing(&self) {
        let _guard = self.lock.lock();
        self.halt_processing();
        tracing::info!("processing stopped");
    }

    /// Stop the fill cycle without taking the engine lock.
    fn halt_processing(&self) {
        self.processing.set(false);
        for slice in &self.slices {
            let mut state = slice.lock();
            slice.reset(&mut state);
            state.invalidate();
        }
        if let Err(err) = self.renderer.reset_render_state() {
            tracing::warn!("reset render state: {err}");
        }
        self.paused.set(false);
        *lock(&self.paused_slices) = None;
    }

    fn pause_processing(&self) -> Result<(), EngineError> {
        let _guard = self.lock.lock();
        if self.paused.get() {
            return Ok(());
        }
        if !self.processing.get() {
            return Err(EngineError::precondition(
                codes::INVALID_STATE,
                "pause requested while stopped",
            ));
        }

        self.paused.set(true);
        if self.renderer.is_running() {
            self.renderer.stop()?;
        }

        let play_time = self.renderer.current_play_time();
        for slice in &self.slices {
            let mut state = slice.lock();
            state.invalidate();
            if state.end_time() <= play_time {
                state.has_data = false;
            } else if state.flags.contains(SliceFlags::BEGAN_TO_RENDER) {
                if let Some(offset) = state.buffer_offset_for(play_time) {
                    if !state.shift_left(offset) {
                        drop(state);
                        self.halt_processing();
                        return Err(EngineError::precondition(
                            codes::BUFFER_TRIM,
                            format!("cannot trim {offset} frames from slice {}", slice.index()),
                        ));
                    }
                    state.has_data = true;
                    tracing::debug!(
                        slice = slice.index(),
                        offset,
                        remaining = state.frame_count,
                        "trimmed partially played slice"
                    );
                }
            }
        }

        self.active_slices.set(0);
        let mut ordered = self.slices.clone();
        ordered.sort_by(|a, b| DataSlice::compare(a, b));
        *lock(&self.paused_slices) = Some(ordered);
        self.renderer.reset_schedule();
        self.sample_time.set(0);

        tracing::info!(play_time, "processing paused");
        Ok(())
    }

    fn resume_processing(&self, preserve_buffers: bool) -> Result<(), EngineError> {
        let _guard = self.lock.lock();
        if !self.paused.get() {
            return Ok(());
        }
        let snapshot = lock(&self.paused_slices).take().ok_or_else(|| {
            EngineError::precondition(codes::INVALID_STATE, "paused without a slice snapshot")
        })?;
        if !self.processing.get() {
            self.paused.set(false);
            return Ok(());
        }

        let mut deferred = Vec::new();
        let mut preserved = 0usize;
        for slice in &snapshot {
            let mut state = slice.lock();
            state.invalidated = false;
            if !(preserve_buffers && state.has_data) {
                state.has_data = false;
                deferred.push(slice.clone());
                continue;
            }
            state.timestamp = self.sample_time.fetch_add(state.frame_count as i64);
            state.flags = SliceFlags::empty();
            self.active_slices.increment();
            if let Err(err) = self.renderer.schedule_slice(slice.clone()) {
                self.active_slices.decrement();
                state.has_data = false;
                drop(state);
                let err = as_schedule_error(err);
                self.fail(err.clone());
                return Err(err);
            }
            preserved += 1;
        }

        self.paused.set(false);
        self.error_occurred.set(false);
        for slice in &deferred {
            if let Err(err) = self.fill_sync(slice) {
                self.fail(err.clone());
                return Err(err);
            }
        }
        if !self.processing.get() {
            return Ok(());
        }

        tracing::info!(
            preserve_buffers,
            preserved,
            refilled = deferred.len(),
            "processing resumed"
        );
        Ok(())
    }

    fn output_device_did_change(&self) -> Result<(), EngineError> {
        let _guard = self.lock.lock();
        let resume =
            self.renderer.is_running() && self.processing.get() && !self.paused.get();
        if resume {
            self.renderer.stop()?;
            self.pause_processing()?;
        }

        let format = *lock(&self.format);
        self.renderer.apply_stream_format(&format)?;

        if resume {
            self.resume_processing(true)?;
            self.renderer.start()?;
        }
        tracing::info!(resumed = resume, "output device changed");

        if let Some(handler) = self.handler(|h| h.output_device_changed.clone()) {
            invoke_handler("output-device-changed", || handler());
        }
        Ok(())
    }

    fn fill_sync(&self, slice: &Arc<DataSlice>) -> Result<(), EngineError> {
        let generation = slice.lock().generation;
        let slice = slice.clone();
        self.queue.run_sync(move || {
            fill_and_schedule(&slice, generation);
            Ok(())
        })?;
        Ok(())
    }

    /// Fill `slice` from the fill handler and hand it to the renderer. Queue thread only.
    ///
    /// `generation` is the slice generation seen when the fill was queued; a pause or stop in
    /// between makes the fill stale and it is dropped.
    fn schedule_slice(&self, slice: &Arc<DataSlice>, generation: u64) {
        if !self.processing.get() {
            return;
        }
        let mut state = slice.lock();
        if state.generation != generation || state.invalidated || state.has_data {
            return;
        }

        let max_frames = state.frames_to_read;
        let result = {
            let mut fill = lock(&self.fill_handler);
            match fill.as_mut() {
                Some(fill) => panic::catch_unwind(AssertUnwindSafe(|| {
                    fill(&mut state.buffers, max_frames)
                }))
                .unwrap_or_else(|payload| {
                    Err(EngineError::decode(
                        codes::DECODE_FAILED,
                        format!("fill handler panicked: {}", panic_message(payload.as_ref())),
                    ))
                }),
                None => Err(EngineError::precondition(
                    codes::MISSING_HANDLER,
                    "no fill handler installed",
                )),
            }
        };

        match result {
            Err(err) => {
                drop(state);
                self.fail(err);
            }
            Ok(0) => {
                drop(state);
                if self.active_slices.get() == 0 {
                    self.finish();
                }
            }
            Ok(frames) => {
                let frames = frames.min(max_frames);
                state.timestamp = self.sample_time.fetch_add(frames as i64);
                state.frame_count = frames;
                state.has_data = true;
                state.flags = SliceFlags::empty();
                self.active_slices.increment();
                if let Err(err) = self.renderer.schedule_slice(slice.clone()) {
                    self.active_slices.decrement();
                    state.has_data = false;
                    drop(state);
                    self.fail(as_schedule_error(err));
                    return;
                }
                tracing::trace!(
                    slice = slice.index(),
                    frames,
                    timestamp = state.timestamp,
                    "slice scheduled"
                );
            }
        }
    }

    /// Completion callback. Render thread: never touches the decoder.
    pub(crate) fn slice_did_finish(&self, slice: &Arc<DataSlice>, flags: SliceFlags) {
        if !self.processing.get() {
            return;
        }
        let generation = {
            let mut state = slice.lock();
            if self.paused.get() && state.invalidated {
                return;
            }
            if !state.has_data {
                return;
            }
            self.active_slices.decrement();
            state.has_data = false;
            state.generation
        };

        if flags.contains(SliceFlags::COMPLETE) {
            let slice = slice.clone();
            if let Err(err) = self.queue.run_async(move || {
                fill_and_schedule(&slice, generation);
                Ok(())
            }) {
                tracing::warn!("could not queue refill: {err}");
            }
        }
    }

    fn fail(&self, err: EngineError) {
        if !self.error_occurred.compare_and_set(false, true) {
            tracing::debug!("suppressing repeated error: {err}");
            return;
        }
        tracing::error!(kind = ?err.kind(), code = err.code(), "playback failed: {err}");
        self.halt_processing();
        if let Err(stop_err) = self.renderer.stop() {
            tracing::warn!("stop renderer after failure: {stop_err}");
        }
        if let Some(handler) = self.handler(|h| h.error.clone()) {
            invoke_handler("error", || handler(err));
        }
    }

    fn finish(&self) {
        tracing::info!(frames = self.sample_time.get(), "end of stream");
        self.halt_processing();
        if let Err(err) = self.renderer.stop() {
            tracing::warn!("stop renderer at end of stream: {err}");
        }
        if let Some(handler) = self.handler(|h| h.end_of_playback.clone()) {
            invoke_handler("end-of-playback", || handler());
        }
    }

    fn frames_rendered(&self, frames: usize) {
        let total = self.rendered_frames.fetch_add(frames as u64, Ordering::SeqCst) + frames as u64;
        let rate = u64::from(self.sample_rate.load(Ordering::SeqCst).max(1));
        let second = i64::try_from(total / rate).unwrap_or(i64::MAX);
        if self.last_pulse_second.get() == second {
            return;
        }
        self.last_pulse_second.set(second);
        if let Some(handler) = self.handler(|h| h.pulse.clone()) {
            invoke_handler("pulse", || handler());
        }
    }
}

impl Drop for EngineCore {
    fn drop(&mut self) {
        self.renderer.set_render_observer(None);
        self.queue.shutdown();
    }
}

fn fill_and_schedule(slice: &Arc<DataSlice>, generation: u64) {
    if let Some(owner) = slice.owner() {
        owner.schedule_slice(slice, generation);
    }
}

/// Renderer rejections are reported as schedule failures whatever the renderer returned.
fn as_schedule_error(err: EngineError) -> EngineError {
    match err.kind() {
        ErrorKind::Schedule => err,
        _ => EngineError::schedule(codes::SCHEDULE_FAILED, err.to_string()),
    }
}

fn invoke_handler(name: &str, call: impl FnOnce()) {
    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(call)) {
        let panic = panic_message(payload.as_ref());
        tracing::error!(handler = name, panic = %panic, "handler panicked");
    }
}
