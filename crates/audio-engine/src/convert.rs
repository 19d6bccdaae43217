//! Format conversion stage.
//!
//! Wraps a decoder whose native format is not canonical and presents it as a canonical one:
//! - channel mapping (mono duplicated, extra channels dropped)
//! - Rubato sinc resampling to the target rate
//! - resampler delay trimmed at the start and flushed at the end, so frame positions line up
//!   with the source and seeks stay accurate
//!
//! Runs on the engine's task queue like any other decoder.

use std::collections::VecDeque;

use audioadapter_buffers::direct::InterleavedSlice;
use rubato::{
    Async, FixedAsync, Indexing, Resampler, SincInterpolationParameters, SincInterpolationType,
    WindowFunction, calculate_cutoff,
};

use crate::decoder::Decoder;
use crate::error::{EngineError, codes};
use crate::format::{AudioBuffers, StreamFormat};

/// Source chunk pulled from the wrapped decoder per conversion step.
pub const DEFAULT_CONVERTER_CHUNK_FRAMES: usize = 1024;

pub struct FormatConverter {
    source: Box<dyn Decoder>,
    source_format: StreamFormat,
    target: StreamFormat,
    chunk_frames: usize,
    ratio: f64,
    resampler: Option<Async<f32>>,
    input: AudioBuffers,
    staged: Vec<f32>,
    resampled: Vec<f32>,
    pending: VecDeque<f32>,
    skip_frames: usize,
    consumed_frames: u64,
    emitted_frames: u64,
    source_done: bool,
    flushed: bool,
    current_frame: u64,
}

impl FormatConverter {
    pub fn new(
        source: Box<dyn Decoder>,
        target: StreamFormat,
        chunk_frames: usize,
    ) -> Result<Self, EngineError> {
        let source_format = source.stream_format();
        if source_format.sample_rate == 0 || source_format.channels == 0 {
            return Err(EngineError::precondition(
                codes::INCOMPATIBLE_FORMAT,
                format!("cannot convert from {source_format:?}"),
            ));
        }

        let chunk_frames = chunk_frames.max(1);
        let channels = target.channel_count();
        let ratio = f64::from(target.sample_rate) / f64::from(source_format.sample_rate);

        let resampler = if source_format.sample_rate == target.sample_rate {
            None
        } else {
            Some(build_resampler(ratio, chunk_frames, channels)?)
        };
        let (skip_frames, out_max) = match &resampler {
            Some(r) => (r.output_delay(), r.output_frames_max()),
            None => (0, 0),
        };

        tracing::debug!(
            from_rate = source_format.sample_rate,
            from_channels = source_format.channels,
            to_rate = target.sample_rate,
            to_channels = target.channels,
            "format converter ready"
        );

        Ok(Self {
            source_format,
            target,
            chunk_frames,
            ratio,
            input: AudioBuffers::for_format(&source_format, chunk_frames),
            staged: Vec::with_capacity(chunk_frames * channels * 2),
            resampled: vec![0.0; out_max * channels],
            pending: VecDeque::new(),
            skip_frames,
            consumed_frames: 0,
            emitted_frames: 0,
            source_done: false,
            flushed: false,
            current_frame: 0,
            resampler,
            source,
        })
    }

    pub fn source_format(&self) -> StreamFormat {
        self.source_format
    }

    pub fn is_resampling(&self) -> bool {
        self.resampler.is_some()
    }

    fn channels(&self) -> usize {
        self.target.channel_count()
    }

    fn pending_frames(&self) -> usize {
        self.pending.len() / self.channels()
    }

    /// Frames the whole consumed input should produce at the target rate.
    fn expected_frames(&self) -> u64 {
        (self.consumed_frames as f64 * self.ratio).round() as u64
    }

    /// Pull one chunk from the source and convert everything that is ready.
    fn pump(&mut self) -> Result<(), EngineError> {
        if !self.source_done {
            let n = self
                .source
                .fill_buffers(&mut self.input, self.chunk_frames)?;
            if n == 0 {
                self.source_done = true;
            } else {
                self.consumed_frames += n as u64;
                map_channels(&self.input, n, self.target.channel_count(), &mut self.staged);
            }
        }

        if self.resampler.is_none() {
            let staged = std::mem::take(&mut self.staged);
            self.emit(&staged);
            self.flushed = self.source_done;
            return Ok(());
        }

        let channels = self.channels();
        let chunk_samples = self.chunk_frames * channels;
        while self.staged.len() >= chunk_samples {
            let chunk: Vec<f32> = self.staged.drain(..chunk_samples).collect();
            self.resample(&chunk, None)?;
        }

        if self.source_done && !self.flushed {
            let tail = std::mem::take(&mut self.staged);
            let tail_frames = tail.len() / channels;
            if tail_frames > 0 {
                self.resample(&tail, Some(tail_frames))?;
            }
            // Push the resampler's delay line out with one chunk of silence.
            let silence = vec![0.0; chunk_samples];
            while self.emitted_frames < self.expected_frames() {
                let before = self.emitted_frames;
                self.resample(&silence, None)?;
                if self.emitted_frames == before && self.skip_frames == 0 {
                    break;
                }
            }
            let excess = self.emitted_frames.saturating_sub(self.expected_frames()) as usize;
            let keep = self.pending.len().saturating_sub(excess * channels);
            self.pending.truncate(keep);
            self.emitted_frames -= excess as u64;
            self.flushed = true;
        }
        Ok(())
    }

    fn resample(
        &mut self,
        interleaved: &[f32],
        partial_len: Option<usize>,
    ) -> Result<(), EngineError> {
        let channels = self.channels();
        let Some(resampler) = self.resampler.as_mut() else {
            return Ok(());
        };

        let frames = interleaved.len() / channels;
        let input = InterleavedSlice::new(interleaved, channels, frames)
            .map_err(|e| resample_error("input buffer", &e))?;
        let out_frames = self.resampled.len() / channels;
        let mut output = InterleavedSlice::new_mut(&mut self.resampled, channels, out_frames)
            .map_err(|e| resample_error("output buffer", &e))?;

        let indexing = Indexing {
            input_offset: 0,
            output_offset: 0,
            active_channels_mask: None,
            partial_len,
        };
        let (_nbr_in, nbr_out) = resampler
            .process_into_buffer(&input, &mut output, Some(&indexing))
            .map_err(|e| resample_error("process", &e))?;

        let produced = std::mem::take(&mut self.resampled);
        self.emit(&produced[..nbr_out * channels]);
        self.resampled = produced;
        Ok(())
    }

    /// Queue converted interleaved frames, dropping any leading resampler delay.
    fn emit(&mut self, interleaved: &[f32]) {
        let channels = self.channels();
        let frames = interleaved.len() / channels;
        let skip = self.skip_frames.min(frames);
        self.skip_frames -= skip;
        self.pending.extend(&interleaved[skip * channels..]);
        self.emitted_frames += (frames - skip) as u64;
    }
}

impl Decoder for FormatConverter {
    fn location(&self) -> String {
        self.source.location()
    }

    fn stream_format(&self) -> StreamFormat {
        self.target
    }

    fn total_frames(&self) -> u64 {
        (self.source.total_frames() as f64 * self.ratio).round() as u64
    }

    fn current_frame(&self) -> u64 {
        self.current_frame
    }

    fn can_seek(&self) -> bool {
        self.source.can_seek()
    }

    fn set_current_frame(&mut self, frame: u64) -> Result<(), EngineError> {
        let source_frame = (frame as f64 / self.ratio).round() as u64;
        self.source.set_current_frame(source_frame)?;

        self.staged.clear();
        self.pending.clear();
        self.consumed_frames = 0;
        self.emitted_frames = 0;
        self.source_done = false;
        self.flushed = false;
        self.skip_frames = match self.resampler.as_mut() {
            Some(r) => {
                r.reset();
                r.output_delay()
            }
            None => 0,
        };
        self.current_frame = frame;
        Ok(())
    }

    fn fill_buffers(
        &mut self,
        buffers: &mut AudioBuffers,
        max_frames: usize,
    ) -> Result<usize, EngineError> {
        let wanted = max_frames.min(buffers.capacity_frames());
        while self.pending_frames() < wanted && !self.flushed {
            self.pump()?;
        }

        let frames = self.pending_frames().min(wanted);
        if frames == 0 {
            return Ok(0);
        }
        let channels = self.channels();
        let samples = frames * channels;
        let interleaved = self.pending.make_contiguous();
        buffers.write_interleaved(0, &interleaved[..samples], channels);
        self.pending.drain(..samples);
        self.current_frame += frames as u64;
        Ok(frames)
    }
}

fn build_resampler(
    ratio: f64,
    chunk_frames: usize,
    channels: usize,
) -> Result<Async<f32>, EngineError> {
    let sinc_len = 128;
    let window = WindowFunction::BlackmanHarris2;
    let params = SincInterpolationParameters {
        sinc_len,
        f_cutoff: calculate_cutoff(sinc_len, window),
        interpolation: SincInterpolationType::Cubic,
        oversampling_factor: 256,
        window,
    };

    Async::<f32>::new_sinc(ratio, 1.1, &params, chunk_frames, channels, FixedAsync::Input)
        .map_err(|e| {
            EngineError::precondition(codes::INCOMPATIBLE_FORMAT, format!("resampler init: {e}"))
        })
}

fn resample_error(stage: &str, err: &dyn std::fmt::Display) -> EngineError {
    EngineError::decode(codes::DECODE_FAILED, format!("resample {stage}: {err}"))
}

/// Append `frames` frames of `input` to `out` as interleaved `dst_channels`-wide audio.
///
/// Mapping rules:
/// - mono → N: duplicate channel 0
/// - more source channels than destination: keep the leading ones
/// - otherwise clamp to the last available source channel
fn map_channels(input: &AudioBuffers, frames: usize, dst_channels: usize, out: &mut Vec<f32>) {
    let src_channels = input.channel_count();
    out.reserve(frames * dst_channels);
    for frame in 0..frames {
        for ch in 0..dst_channels {
            let src = ch.min(src_channels.saturating_sub(1));
            out.push(input.channel(src)[frame]);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::MemoryDecoder;

    fn mono(rate: u32, samples: Vec<f32>) -> MemoryDecoder {
        MemoryDecoder::new(StreamFormat::planar_f32(rate, 1), vec![samples]).unwrap()
    }

    fn drain(converter: &mut FormatConverter) -> Vec<Vec<f32>> {
        let mut buffers = AudioBuffers::allocate(2, 4096);
        let mut out = vec![Vec::new(), Vec::new()];
        loop {
            let n = converter.fill_buffers(&mut buffers, 4096).unwrap();
            if n == 0 {
                break;
            }
            for (ch, dst) in out.iter_mut().enumerate() {
                dst.extend_from_slice(&buffers.channel(ch)[..n]);
            }
        }
        out
    }

    #[test]
    fn mono_passthrough_duplicates_channel() {
        let samples: Vec<f32> = (0..3000).map(|i| i as f32).collect();
        let source = mono(44_100, samples);
        let mut converter =
            FormatConverter::new(Box::new(source), StreamFormat::canonical(), 1024).unwrap();
        assert!(!converter.is_resampling());
        assert_eq!(converter.total_frames(), 3000);

        let out = drain(&mut converter);
        assert_eq!(out[0].len(), 3000);
        assert_eq!(out[0], out[1]);
        assert_eq!(out[1][2999], 2999.0);
    }

    #[test]
    fn upsampling_produces_exact_frame_count() {
        let source = mono(22_050, vec![0.5; 22_050]);
        let mut converter =
            FormatConverter::new(Box::new(source), StreamFormat::canonical(), 1024).unwrap();
        assert!(converter.is_resampling());
        assert_eq!(converter.total_frames(), 44_100);

        let out = drain(&mut converter);
        assert_eq!(out[0].len(), 44_100);
        assert_eq!(converter.current_frame(), 44_100);
        assert!((out[0][20_000] - 0.5).abs() < 0.01);
        assert!((out[1][30_000] - 0.5).abs() < 0.01);
    }

    #[test]
    fn stereo_downmix_keeps_leading_channels() {
        let mut input = AudioBuffers::allocate(3, 2);
        input.channel_mut(0).copy_from_slice(&[1.0, 2.0]);
        input.channel_mut(1).copy_from_slice(&[3.0, 4.0]);
        input.channel_mut(2).copy_from_slice(&[9.0, 9.0]);
        let mut out = Vec::new();
        map_channels(&input, 2, 2, &mut out);
        assert_eq!(out, vec![1.0, 3.0, 2.0, 4.0]);
    }

    #[test]
    fn seek_translates_to_source_frames() {
        let samples: Vec<f32> = (0..8000).map(|i| i as f32).collect();
        let source = mono(44_100, samples);
        let mut converter =
            FormatConverter::new(Box::new(source), StreamFormat::canonical(), 512).unwrap();
        converter.set_current_frame(5000).unwrap();

        let mut buffers = AudioBuffers::allocate(2, 16);
        assert_eq!(converter.fill_buffers(&mut buffers, 16).unwrap(), 16);
        assert_eq!(buffers.channel(0)[0], 5000.0);
        assert_eq!(converter.current_frame(), 5016);
    }

    #[test]
    fn rejects_degenerate_source() {
        let source = MemoryDecoder::new(StreamFormat::planar_f32(0, 1), vec![vec![]]).unwrap();
        assert!(FormatConverter::new(Box::new(source), StreamFormat::canonical(), 1024).is_err());
    }
}
