//! Engine error type.
//!
//! Every failure surfaced by the engine carries one of three kinds plus a numeric code:
//! - **precondition**: a call made in the wrong state or with missing setup; returned at once
//! - **decode**: the decoder failed; reported once per session through the error handler
//! - **schedule**: the renderer refused a slice; handled like a decode failure

use thiserror::Error;

/// Stable numeric error codes.
pub mod codes {
    pub const NO_DECODER: i32 = -100_001;
    pub const FILE_HANDLE: i32 = -100_002;
    pub const OPEN_FILE: i32 = -100_003;
    pub const STREAM_FORMAT: i32 = -100_004;
    pub const SET_STREAM_FORMAT: i32 = -100_005;
    pub const INCOMPATIBLE_FORMAT: i32 = -300_001;
    pub const MISSING_HANDLER: i32 = -400_001;
    pub const INVALID_STATE: i32 = -400_002;
    pub const QUEUE_CANCELLED: i32 = -400_003;
    pub const BUFFER_TRIM: i32 = -400_004;
    pub const OUTPUT_DEVICE: i32 = -400_005;
    pub const DECODE_FAILED: i32 = -500_001;
    pub const SEEK_FAILED: i32 = -500_002;
    pub const SCHEDULE_FAILED: i32 = -600_001;
}

/// Coarse classification of an [`EngineError`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    Precondition,
    Decode,
    Schedule,
}

#[derive(Debug, Clone, Error)]
pub enum EngineError {
    #[error("precondition failed ({code}): {message}")]
    Precondition { code: i32, message: String },
    #[error("decode failed ({code}): {message}")]
    Decode { code: i32, message: String },
    #[error("schedule failed ({code}): {message}")]
    Schedule { code: i32, message: String },
}

impl EngineError {
    pub fn precondition(code: i32, message: impl Into<String>) -> Self {
        Self::Precondition {
            code,
            message: message.into(),
        }
    }

    pub fn decode(code: i32, message: impl Into<String>) -> Self {
        Self::Decode {
            code,
            message: message.into(),
        }
    }

    pub fn schedule(code: i32, message: impl Into<String>) -> Self {
        Self::Schedule {
            code,
            message: message.into(),
        }
    }

    /// Wrap an arbitrary decoder-side failure, keeping the full context chain.
    pub fn from_decoder(code: i32, err: &anyhow::Error) -> Self {
        Self::decode(code, format!("{err:#}"))
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Precondition { .. } => ErrorKind::Precondition,
            Self::Decode { .. } => ErrorKind::Decode,
            Self::Schedule { .. } => ErrorKind::Schedule,
        }
    }

    pub fn code(&self) -> i32 {
        match self {
            Self::Precondition { code, .. }
            | Self::Decode { code, .. }
            | Self::Schedule { code, .. } => *code,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            Self::Precondition { message, .. }
            | Self::Decode { message, .. }
            | Self::Schedule { message, .. } => message,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn kind_and_code_follow_variant() {
        let err = EngineError::schedule(codes::SCHEDULE_FAILED, "renderer full");
        assert_eq!(err.kind(), ErrorKind::Schedule);
        assert_eq!(err.code(), codes::SCHEDULE_FAILED);
        assert_eq!(err.message(), "renderer full");
    }

    #[test]
    fn display_includes_code_and_message() {
        let err = EngineError::precondition(codes::MISSING_HANDLER, "no fill handler");
        assert_eq!(
            err.to_string(),
            "precondition failed (-400001): no fill handler"
        );
    }

    #[test]
    fn from_decoder_keeps_context_chain() {
        let inner: anyhow::Result<()> = Err(anyhow::anyhow!("bad frame"));
        let err = inner.context("decode packet").unwrap_err();
        let wrapped = EngineError::from_decoder(codes::DECODE_FAILED, &err);
        assert_eq!(wrapped.kind(), ErrorKind::Decode);
        assert_eq!(wrapped.message(), "decode packet: bad frame");
    }
}
