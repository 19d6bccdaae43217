//! Slice-scheduled audio playback engine.
//!
//! Decoded audio flows through a fixed ring of slices: a single task-queue thread fills them
//! from a [`decoder::Decoder`], the renderer plays them in timestamp order and hands them back
//! for refilling. Pause trims the slice under the play head so resume is sample accurate.
//!
//! [`player::Player`] wraps one engine with decoder management, seeking and an event channel;
//! [`engine::PlaybackEngine`] is the scheduler itself.

pub mod config;
pub mod convert;
pub mod decoder;
pub mod device;
pub mod engine;
pub mod error;
pub mod format;
pub mod player;
pub mod renderer;
pub mod slice;
pub mod status;
pub mod sync;
pub mod task_queue;

pub use config::{EngineConfig, OutputConfig};
pub use decoder::{Decoder, MemoryDecoder, SymphoniaDecoder};
pub use engine::{EngineState, PlaybackEngine};
pub use error::{EngineError, ErrorKind};
pub use format::{AudioBuffers, StreamFormat};
pub use player::{Player, PlayerEvent};
pub use status::PlayerStatus;
