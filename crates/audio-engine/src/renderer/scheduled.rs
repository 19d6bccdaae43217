//! Scheduled-slice player core.
//!
//! Keeps the slices handed over by the engine in schedule order and copies their frames into
//! interleaved output buffers:
//! - the play position only advances over frames taken from slices
//! - an empty schedule renders silence without moving the play position
//! - channel mapping follows the usual mono↔stereo rules, best-effort otherwise

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use super::RenderObserver;
use crate::format::AudioBuffers;
use crate::slice::{DataSlice, SliceFlags};
use crate::sync::{AtomicCounter, AtomicFlag, lock};

pub struct ScheduledPlayer {
    scheduled: Mutex<VecDeque<Arc<DataSlice>>>,
    play_time: AtomicCounter,
    running: AtomicFlag,
    render_gate: Mutex<()>,
    observer: Mutex<Option<RenderObserver>>,
    gain_bits: AtomicU32,
}

impl Default for ScheduledPlayer {
    fn default() -> Self {
        Self::new()
    }
}

impl ScheduledPlayer {
    pub fn new() -> Self {
        Self {
            scheduled: Mutex::new(VecDeque::new()),
            play_time: AtomicCounter::new(0),
            running: AtomicFlag::new(false),
            render_gate: Mutex::new(()),
            observer: Mutex::new(None),
            gain_bits: AtomicU32::new(1.0f32.to_bits()),
        }
    }

    pub fn schedule(&self, slice: Arc<DataSlice>) {
        lock(&self.scheduled).push_back(slice);
    }

    pub fn scheduled_len(&self) -> usize {
        lock(&self.scheduled).len()
    }

    pub fn play_time(&self) -> i64 {
        self.play_time.get()
    }

    pub fn reset_schedule(&self) {
        let dropped = {
            let mut scheduled = lock(&self.scheduled);
            std::mem::take(&mut *scheduled)
        };
        self.play_time.set(0);
        if !dropped.is_empty() {
            tracing::debug!(slices = dropped.len(), "schedule reset");
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.get()
    }

    pub fn set_running(&self, running: bool) {
        self.running.set(running);
        if !running {
            // Wait out a pass that may have started before the flag flipped.
            drop(lock(&self.render_gate));
        }
    }

    pub fn set_observer(&self, observer: Option<RenderObserver>) {
        *lock(&self.observer) = observer;
    }

    pub fn set_gain(&self, gain: f32) {
        let gain = if gain.is_finite() { gain.clamp(0.0, 1.0) } else { 1.0 };
        self.gain_bits.store(gain.to_bits(), Ordering::Relaxed);
    }

    pub fn gain(&self) -> f32 {
        f32::from_bits(self.gain_bits.load(Ordering::Relaxed))
    }

    /// Fill `out` (interleaved, `channels_out` wide) from the schedule.
    ///
    /// Returns the number of frames taken from slices; the rest of `out` is silence.
    pub fn render_interleaved(&self, out: &mut [f32], channels_out: usize) -> usize {
        let _pass = lock(&self.render_gate);
        if channels_out == 0 || !self.running.get() {
            out.fill(0.0);
            return 0;
        }

        let frames = out.len() / channels_out;
        let gain = self.gain();
        let mut written = 0usize;

        while written < frames {
            let Some(slice) = self.front() else {
                break;
            };

            let mut state = slice.lock();
            if state.timestamp > self.play_time.get() {
                self.play_time.set(state.timestamp);
            }
            let offset = usize::try_from(self.play_time.get() - state.timestamp).unwrap_or(0);

            if offset >= state.frame_count {
                state.flags.insert(SliceFlags::COMPLETE);
                let flags = state.flags;
                drop(state);
                self.pop_if_front(&slice);
                slice.finish_render(flags);
                continue;
            }

            state.flags.insert(SliceFlags::BEGAN_TO_RENDER);
            let n = (state.frame_count - offset).min(frames - written);
            let dst = &mut out[written * channels_out..(written + n) * channels_out];
            copy_mapped(&state.buffers, offset, n, dst, channels_out, gain);

            self.play_time.fetch_add(n as i64);
            written += n;

            let finished = offset + n == state.frame_count;
            if finished {
                state.flags.insert(SliceFlags::COMPLETE);
            }
            let flags = state.flags;
            drop(state);

            if finished {
                self.pop_if_front(&slice);
                slice.finish_render(flags);
            }
        }

        out[written * channels_out..].fill(0.0);

        if written > 0 {
            let observer = lock(&self.observer).clone();
            if let Some(observer) = observer {
                observer(written);
            }
        }
        written
    }

    fn front(&self) -> Option<Arc<DataSlice>> {
        lock(&self.scheduled).front().cloned()
    }

    fn pop_if_front(&self, slice: &Arc<DataSlice>) {
        let mut scheduled = lock(&self.scheduled);
        if scheduled.front().is_some_and(|f| Arc::ptr_eq(f, slice)) {
            scheduled.pop_front();
        }
    }
}

/// Copy `frames` frames starting at `offset` into interleaved `dst`.
///
/// Mapping rules:
/// - mono → stereo: duplicate channel 0
/// - stereo → mono: average L/R
/// - matching layouts: pass-through
/// - other layouts: clamp to the last available source channel
fn copy_mapped(
    src: &AudioBuffers,
    offset: usize,
    frames: usize,
    dst: &mut [f32],
    dst_channels: usize,
    gain: f32,
) {
    let src_channels = src.channel_count();
    if src_channels == 0 {
        dst.fill(0.0);
        return;
    }

    for dst_ch in 0..dst_channels {
        let samples = match (src_channels, dst_channels) {
            (2, 1) => None,
            _ => Some(src.channel(dst_ch.min(src_channels - 1))),
        };
        for frame in 0..frames {
            let value = match samples {
                Some(ch) => ch[offset + frame],
                None => 0.5 * (src.channel(0)[offset + frame] + src.channel(1)[offset + frame]),
            };
            dst[frame * dst_channels + dst_ch] = value * gain;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::StreamFormat;

    fn ramp_slice(index: usize, start: f32, frames: usize) -> Arc<DataSlice> {
        let slice = Arc::new(DataSlice::detached(index));
        {
            let mut state = slice.lock();
            state.ensure_buffers(&StreamFormat::canonical(), frames);
            for ch in 0..2 {
                for (i, s) in state.buffers.channel_mut(ch).iter_mut().enumerate() {
                    *s = start + i as f32;
                }
            }
            state.frame_count = frames;
            state.has_data = true;
        }
        slice
    }

    #[test]
    fn renders_silence_when_stopped() {
        let player = ScheduledPlayer::new();
        player.schedule(ramp_slice(0, 1.0, 4));
        let mut out = vec![1.0; 8];
        assert_eq!(player.render_interleaved(&mut out, 2), 0);
        assert!(out.iter().all(|s| *s == 0.0));
        assert_eq!(player.play_time(), 0);
    }

    #[test]
    fn renders_across_slice_boundaries() {
        let player = ScheduledPlayer::new();
        player.set_running(true);
        let a = ramp_slice(0, 0.0, 3);
        let b = ramp_slice(1, 3.0, 3);
        b.lock().timestamp = 3;
        player.schedule(a.clone());
        player.schedule(b.clone());

        let mut out = vec![0.0; 8];
        assert_eq!(player.render_interleaved(&mut out, 2), 4);
        assert_eq!(out, vec![0.0, 0.0, 1.0, 1.0, 2.0, 2.0, 3.0, 3.0]);
        assert!(a.lock().flags.contains(SliceFlags::COMPLETE));
        assert!(b.lock().flags.contains(SliceFlags::BEGAN_TO_RENDER));
        assert!(!b.lock().flags.contains(SliceFlags::COMPLETE));
        assert_eq!(player.scheduled_len(), 1);
        assert_eq!(player.play_time(), 4);
    }

    #[test]
    fn underrun_pads_with_silence_and_holds_position() {
        let player = ScheduledPlayer::new();
        player.set_running(true);
        player.schedule(ramp_slice(0, 5.0, 2));
        let mut out = vec![9.0; 8];
        assert_eq!(player.render_interleaved(&mut out, 2), 2);
        assert_eq!(&out[4..], &[0.0; 4]);
        assert_eq!(player.play_time(), 2);
        assert_eq!(player.scheduled_len(), 0);
    }

    #[test]
    fn stereo_to_mono_averages_and_applies_gain() {
        let player = ScheduledPlayer::new();
        player.set_running(true);
        player.set_gain(0.5);
        let slice = ramp_slice(0, 2.0, 1);
        slice.lock().buffers.channel_mut(1)[0] = 4.0;
        player.schedule(slice);
        let mut out = vec![0.0; 1];
        player.render_interleaved(&mut out, 1);
        assert_eq!(out[0], 1.5);
    }

    #[test]
    fn reset_schedule_clears_queue_and_position() {
        let player = ScheduledPlayer::new();
        player.set_running(true);
        player.schedule(ramp_slice(0, 0.0, 4));
        let mut out = vec![0.0; 2];
        player.render_interleaved(&mut out, 2);
        player.reset_schedule();
        assert_eq!(player.play_time(), 0);
        assert_eq!(player.scheduled_len(), 0);
    }

    #[test]
    fn observer_sees_slice_frames_only() {
        let player = ScheduledPlayer::new();
        player.set_running(true);
        let seen = Arc::new(AtomicCounter::new(0));
        let seen_cb = seen.clone();
        player.set_observer(Some(Arc::new(move |frames| {
            seen_cb.fetch_add(frames as i64);
        })));
        player.schedule(ramp_slice(0, 0.0, 3));
        let mut out = vec![0.0; 20];
        player.render_interleaved(&mut out, 2);
        assert_eq!(seen.get(), 3);
    }

    #[test]
    fn gain_is_clamped() {
        let player = ScheduledPlayer::new();
        player.set_gain(3.0);
        assert_eq!(player.gain(), 1.0);
        player.set_gain(f32::NAN);
        assert_eq!(player.gain(), 1.0);
        player.set_gain(-1.0);
        assert_eq!(player.gain(), 0.0);
    }
}
