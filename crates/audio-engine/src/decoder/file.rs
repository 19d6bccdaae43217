//! File decoding with Symphonia.
//!
//! Probes the container, decodes packets of the default track to interleaved `f32` and hands
//! them out in planar chunks of whatever size the engine asks for. Frames decoded beyond the
//! request are kept for the next fill.
//!
//! Seeking is sample accurate: Symphonia lands on the packet at or before the target and the
//! surplus leading frames are dropped from the next decoded packets. Track timestamps are assumed
//! to be in frames, which holds for the PCM and compressed formats enabled in this workspace.

use std::collections::VecDeque;
use std::fs::File;
use std::path::Path;

use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{CodecParameters, DecoderOptions};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::{FormatOptions, FormatReader, SeekMode, SeekTo};
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;

use super::Decoder;
use crate::error::{EngineError, codes};
use crate::format::{AudioBuffers, StreamFormat};

/// Metadata captured while probing the source.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SourceInfo {
    /// Codec name (best-effort).
    pub codec: Option<String>,
    /// Source bit depth (best-effort).
    pub bit_depth: Option<u16>,
    /// Container/extension hint (best-effort).
    pub container: Option<String>,
    /// Duration from container metadata, when present.
    pub duration_ms: Option<u64>,
}

pub struct SymphoniaDecoder {
    location: String,
    reader: Box<dyn FormatReader>,
    decoder: Box<dyn symphonia::core::codecs::Decoder>,
    track_id: u32,
    format: StreamFormat,
    total_frames: u64,
    current_frame: u64,
    pending: VecDeque<f32>,
    skip_frames: u64,
    exhausted: bool,
    info: SourceInfo,
}

impl SymphoniaDecoder {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, EngineError> {
        let path = path.as_ref();
        let location = path.display().to_string();
        let file = File::open(path).map_err(|e| {
            EngineError::precondition(codes::OPEN_FILE, format!("open {location}: {e}"))
        })?;

        let mut hint = Hint::new();
        let container = path.extension().and_then(|e| e.to_str()).map(str::to_lowercase);
        if let Some(ext) = &container {
            hint.with_extension(ext);
        }

        let mss = MediaSourceStream::new(Box::new(file), Default::default());
        let probed = symphonia::default::get_probe()
            .format(
                &hint,
                mss,
                &FormatOptions::default(),
                &MetadataOptions::default(),
            )
            .map_err(|e| {
                EngineError::precondition(codes::NO_DECODER, format!("probe {location}: {e}"))
            })?;
        let reader = probed.format;

        let track = reader.default_track().ok_or_else(|| {
            let message = format!("{location}: no default audio track");
            EngineError::precondition(codes::NO_DECODER, message)
        })?;
        let track_id = track.id;
        let params: CodecParameters = track.codec_params.clone();

        let format = stream_format_from_params(&params).ok_or_else(|| {
            EngineError::precondition(
                codes::STREAM_FORMAT,
                format!("{location}: unknown sample rate or channel layout"),
            )
        })?;

        let decoder = symphonia::default::get_codecs()
            .make(&params, &DecoderOptions::default())
            .map_err(|e| {
                EngineError::precondition(codes::NO_DECODER, format!("{location}: {e}"))
            })?;

        let info = SourceInfo {
            codec: codec_name_from_params(&params),
            bit_depth: params
                .bits_per_sample
                .or(params.bits_per_coded_sample)
                .and_then(|v| u16::try_from(v).ok()),
            container,
            duration_ms: duration_ms_from_codec_params(&params),
        };

        tracing::debug!(
            location = %location,
            sample_rate = format.sample_rate,
            channels = format.channels,
            codec = ?info.codec,
            "decoder opened"
        );

        Ok(Self {
            location,
            reader,
            decoder,
            track_id,
            format,
            total_frames: params.n_frames.unwrap_or(0),
            current_frame: 0,
            pending: VecDeque::new(),
            skip_frames: 0,
            exhausted: false,
            info,
        })
    }

    pub fn source_info(&self) -> &SourceInfo {
        &self.info
    }

    fn pending_frames(&self) -> usize {
        self.pending.len() / self.format.channel_count()
    }

    /// Decode one packet into `pending`. Sets `exhausted` at end of stream.
    fn decode_next(&mut self) -> Result<(), EngineError> {
        let packet = match self.reader.next_packet() {
            Ok(packet) => packet,
            Err(SymphoniaError::IoError(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                self.exhausted = true;
                return Ok(());
            }
            Err(SymphoniaError::ResetRequired) => {
                tracing::warn!(location = %self.location, "stream reset required; ending playback");
                self.exhausted = true;
                return Ok(());
            }
            Err(e) => {
                return Err(EngineError::decode(
                    codes::DECODE_FAILED,
                    format!("{}: read packet: {e}", self.location),
                ));
            }
        };

        if packet.track_id() != self.track_id {
            return Ok(());
        }

        let decoded = match self.decoder.decode(&packet) {
            Ok(decoded) => decoded,
            Err(SymphoniaError::DecodeError(msg)) => {
                tracing::warn!(location = %self.location, "skipping corrupt packet: {msg}");
                return Ok(());
            }
            Err(e) => {
                return Err(EngineError::decode(
                    codes::DECODE_FAILED,
                    format!("{}: decode packet: {e}", self.location),
                ));
            }
        };

        let mut sample_buf = SampleBuffer::<f32>::new(decoded.capacity() as u64, *decoded.spec());
        sample_buf.copy_interleaved_ref(decoded);

        let channels = self.format.channel_count();
        let samples = sample_buf.samples();
        let frames = (samples.len() / channels) as u64;
        let skip = self.skip_frames.min(frames);
        self.skip_frames -= skip;
        self.pending
            .extend(&samples[(skip as usize) * channels..]);
        Ok(())
    }
}

impl Decoder for SymphoniaDecoder {
    fn location(&self) -> String {
        self.location.clone()
    }

    fn stream_format(&self) -> StreamFormat {
        self.format
    }

    fn total_frames(&self) -> u64 {
        self.total_frames
    }

    fn current_frame(&self) -> u64 {
        self.current_frame
    }

    fn can_seek(&self) -> bool {
        true
    }

    fn set_current_frame(&mut self, frame: u64) -> Result<(), EngineError> {
        let seeked = self
            .reader
            .seek(
                SeekMode::Accurate,
                SeekTo::TimeStamp {
                    ts: frame,
                    track_id: self.track_id,
                },
            )
            .map_err(|e| {
                EngineError::decode(
                    codes::SEEK_FAILED,
                    format!("{}: seek to frame {frame}: {e}", self.location),
                )
            })?;

        self.decoder.reset();
        self.pending.clear();
        self.exhausted = false;
        self.skip_frames = seeked.required_ts.saturating_sub(seeked.actual_ts);
        self.current_frame = seeked.required_ts;
        tracing::debug!(
            location = %self.location,
            frame,
            actual = seeked.actual_ts,
            "decoder seeked"
        );
        Ok(())
    }

    fn fill_buffers(
        &mut self,
        buffers: &mut AudioBuffers,
        max_frames: usize,
    ) -> Result<usize, EngineError> {
        let channels = self.format.channel_count();
        let wanted = max_frames.min(buffers.capacity_frames());

        while self.pending_frames() < wanted && !self.exhausted {
            self.decode_next()?;
        }

        let frames = self.pending_frames().min(wanted);
        if frames == 0 {
            return Ok(0);
        }

        let samples = frames * channels;
        let interleaved = self.pending.make_contiguous();
        buffers.write_interleaved(0, &interleaved[..samples], channels);
        self.pending.drain(..samples);
        self.current_frame += frames as u64;
        Ok(frames)
    }
}

fn stream_format_from_params(params: &CodecParameters) -> Option<StreamFormat> {
    let rate = params.sample_rate.filter(|r| *r > 0)?;
    let channels = u16::try_from(params.channels?.count()).ok().filter(|c| *c > 0)?;
    Some(StreamFormat::planar_f32(rate, channels))
}

/// Best-effort duration in milliseconds from codec metadata.
fn duration_ms_from_codec_params(codec_params: &CodecParameters) -> Option<u64> {
    let frames = codec_params.n_frames?;
    let rate = codec_params.sample_rate? as u64;
    if rate == 0 {
        return None;
    }
    Some(frames.saturating_mul(1000) / rate)
}

/// Best-effort codec label for logs and status.
fn codec_name_from_params(params: &CodecParameters) -> Option<String> {
    use symphonia::core::codecs::*;
    let name = match params.codec {
        CODEC_TYPE_FLAC => "FLAC",
        CODEC_TYPE_MP3 => "MP3",
        CODEC_TYPE_AAC => "AAC",
        CODEC_TYPE_ALAC => "ALAC",
        CODEC_TYPE_VORBIS => "VORBIS",
        CODEC_TYPE_PCM_S16LE | CODEC_TYPE_PCM_S16BE => "PCM_S16",
        CODEC_TYPE_PCM_S24LE | CODEC_TYPE_PCM_S24BE => "PCM_S24",
        CODEC_TYPE_PCM_S32LE | CODEC_TYPE_PCM_S32BE => "PCM_S32",
        CODEC_TYPE_PCM_F32LE | CODEC_TYPE_PCM_F32BE => "PCM_F32",
        _ => return None,
    };
    Some(name.to_string())
}
