use super::Decoder;
use crate::error::{EngineError, codes};
use crate::format::{AudioBuffers, StreamFormat};

/// Decoder over planar PCM already held in memory.
#[derive(Clone, Debug)]
pub struct MemoryDecoder {
    location: String,
    format: StreamFormat,
    channels: Vec<Vec<f32>>,
    position: usize,
}

impl MemoryDecoder {
    /// `channels` must all have the same length; the channel count must match `format`.
    pub fn new(format: StreamFormat, channels: Vec<Vec<f32>>) -> Result<Self, EngineError> {
        if channels.len() != format.channel_count() {
            return Err(EngineError::precondition(
                codes::STREAM_FORMAT,
                format!(
                    "{} channel buffers for a {}-channel format",
                    channels.len(),
                    format.channels
                ),
            ));
        }
        let frames = channels.first().map(Vec::len).unwrap_or(0);
        if channels.iter().any(|ch| ch.len() != frames) {
            return Err(EngineError::precondition(
                codes::STREAM_FORMAT,
                "channel buffers differ in length",
            ));
        }
        Ok(Self {
            location: "memory".to_string(),
            format,
            channels,
            position: 0,
        })
    }

    pub fn from_interleaved(format: StreamFormat, samples: &[f32]) -> Result<Self, EngineError> {
        let channels = format.channel_count().max(1);
        let mut planar = vec![Vec::with_capacity(samples.len() / channels); channels];
        for frame in samples.chunks_exact(channels) {
            for (ch, sample) in frame.iter().enumerate() {
                planar[ch].push(*sample);
            }
        }
        Self::new(format, planar)
    }

    pub fn with_location(mut self, location: impl Into<String>) -> Self {
        self.location = location.into();
        self
    }

    fn len(&self) -> usize {
        self.channels.first().map(Vec::len).unwrap_or(0)
    }
}

impl Decoder for MemoryDecoder {
    fn location(&self) -> String {
        self.location.clone()
    }

    fn stream_format(&self) -> StreamFormat {
        self.format
    }

    fn total_frames(&self) -> u64 {
        self.len() as u64
    }

    fn current_frame(&self) -> u64 {
        self.position as u64
    }

    fn can_seek(&self) -> bool {
        true
    }

    fn set_current_frame(&mut self, frame: u64) -> Result<(), EngineError> {
        let frame = usize::try_from(frame).unwrap_or(usize::MAX);
        if frame > self.len() {
            return Err(EngineError::decode(
                codes::SEEK_FAILED,
                format!("frame {frame} is past the end ({})", self.len()),
            ));
        }
        self.position = frame;
        Ok(())
    }

    fn fill_buffers(
        &mut self,
        buffers: &mut AudioBuffers,
        max_frames: usize,
    ) -> Result<usize, EngineError> {
        let frames = max_frames
            .min(buffers.capacity_frames())
            .min(self.len() - self.position);
        if frames == 0 {
            return Ok(0);
        }
        let range = self.position..self.position + frames;
        for (ch, dst) in buffers.channels_mut().enumerate() {
            match self.channels.get(ch) {
                Some(src) => dst[..frames].copy_from_slice(&src[range.clone()]),
                None => dst[..frames].fill(0.0),
            }
        }
        self.position += frames;
        Ok(frames)
    }
}
