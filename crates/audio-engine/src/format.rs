//! Stream formats and planar sample buffers.

/// Sample rate every slice is rendered at.
pub const CANONICAL_SAMPLE_RATE: u32 = 44_100;
/// Channel count every slice is rendered with.
pub const CANONICAL_CHANNELS: u16 = 2;

/// Description of a PCM stream.
///
/// Only 32-bit float samples are produced by decoders; `interleaved` records the layout the
/// source delivered before it was split into planar buffers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StreamFormat {
    pub sample_rate: u32,
    pub channels: u16,
    pub bits_per_sample: u16,
    pub is_float: bool,
    pub interleaved: bool,
}

impl StreamFormat {
    /// 44.1 kHz stereo, non-interleaved, 32-bit float.
    pub const fn canonical() -> Self {
        Self {
            sample_rate: CANONICAL_SAMPLE_RATE,
            channels: CANONICAL_CHANNELS,
            bits_per_sample: 32,
            is_float: true,
            interleaved: false,
        }
    }

    /// Planar float format at an arbitrary rate and channel count.
    pub const fn planar_f32(sample_rate: u32, channels: u16) -> Self {
        Self {
            sample_rate,
            channels,
            bits_per_sample: 32,
            is_float: true,
            interleaved: false,
        }
    }

    pub fn is_canonical(&self) -> bool {
        *self == Self::canonical()
    }

    pub fn channel_count(&self) -> usize {
        usize::from(self.channels)
    }
}

impl Default for StreamFormat {
    fn default() -> Self {
        Self::canonical()
    }
}

/// One `f32` buffer per channel, each holding `capacity` frames.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct AudioBuffers {
    channels: Vec<Vec<f32>>,
}

impl AudioBuffers {
    pub fn allocate(channels: usize, frames: usize) -> Self {
        Self {
            channels: (0..channels).map(|_| vec![0.0; frames]).collect(),
        }
    }

    pub fn for_format(format: &StreamFormat, frames: usize) -> Self {
        Self::allocate(format.channel_count(), frames)
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    pub fn capacity_frames(&self) -> usize {
        self.channels.first().map(Vec::len).unwrap_or(0)
    }

    pub fn channel(&self, index: usize) -> &[f32] {
        &self.channels[index]
    }

    pub fn channel_mut(&mut self, index: usize) -> &mut [f32] {
        &mut self.channels[index]
    }

    pub fn channels_mut(&mut self) -> impl Iterator<Item = &mut Vec<f32>> {
        self.channels.iter_mut()
    }

    /// Move frames `offset..len` to the front of every channel.
    pub fn shift_left(&mut self, offset: usize, len: usize) {
        for ch in &mut self.channels {
            ch.copy_within(offset..len, 0);
        }
    }

    /// Write `frames` frames of interleaved samples starting at frame `at`.
    ///
    /// Source channels beyond the buffer count are dropped; missing ones are zeroed.
    pub fn write_interleaved(&mut self, at: usize, interleaved: &[f32], src_channels: usize) {
        if src_channels == 0 {
            return;
        }
        let frames = interleaved.len() / src_channels;
        for (ch, buf) in self.channels.iter_mut().enumerate() {
            let dst = &mut buf[at..at + frames];
            if ch < src_channels {
                for (frame, sample) in dst.iter_mut().enumerate() {
                    *sample = interleaved[frame * src_channels + ch];
                }
            } else {
                dst.fill(0.0);
            }
        }
    }

    pub fn silence(&mut self) {
        for ch in &mut self.channels {
            ch.fill(0.0);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_format_matches_constants() {
        let format = StreamFormat::canonical();
        assert!(format.is_canonical());
        assert_eq!(format.sample_rate, CANONICAL_SAMPLE_RATE);
        assert_eq!(format.bits_per_sample, 32);
        assert!(!StreamFormat::planar_f32(48_000, 2).is_canonical());
    }

    #[test]
    fn shift_left_moves_tail_to_front() {
        let mut buffers = AudioBuffers::allocate(2, 6);
        for (i, s) in buffers.channel_mut(0).iter_mut().enumerate() {
            *s = i as f32;
        }
        buffers.shift_left(4, 6);
        assert_eq!(&buffers.channel(0)[..2], &[4.0, 5.0]);
    }

    #[test]
    fn write_interleaved_splits_channels() {
        let mut buffers = AudioBuffers::allocate(2, 4);
        buffers.write_interleaved(1, &[1.0, -1.0, 2.0, -2.0], 2);
        assert_eq!(buffers.channel(0), &[0.0, 1.0, 2.0, 0.0]);
        assert_eq!(buffers.channel(1), &[0.0, -1.0, -2.0, 0.0]);
    }

    #[test]
    fn write_interleaved_zeroes_missing_channels() {
        let mut buffers = AudioBuffers::allocate(2, 2);
        buffers.channel_mut(1).fill(9.0);
        buffers.write_interleaved(0, &[0.5, 0.25], 1);
        assert_eq!(buffers.channel(0), &[0.5, 0.25]);
        assert_eq!(buffers.channel(1), &[0.0, 0.0]);
    }
}
