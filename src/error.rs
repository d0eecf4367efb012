use thiserror::Error;

/// Everything that can go wrong between picking a voice and hearing it.
#[derive(Debug, Error)]
pub enum VoiceError {
    /// The requested voice is not offered by any backend that was asked.
    #[error("voice not found: {0:?}")]
    NotFound(String),

    /// Listing voices failed. Never memoized, so the next call retries.
    #[error("failed to enumerate {backend} voices: {reason}")]
    EnumerationFailed {
        backend: &'static str,
        reason: String,
    },

    /// Dial or handshake with the synthesis endpoint failed.
    #[error("connection failed: {reason}")]
    ConnectionFailed {
        status: Option<u16>,
        reason: String,
    },

    #[error("audio stream failed: {0}")]
    StreamFailed(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("operation timed out")]
    TimedOut,

    /// The backend finished without producing a single audio byte.
    #[error("synthesis produced no audio")]
    EmptyResult,

    #[error("transcode failed: {0}")]
    TranscodeFailed(String),

    #[error("playback failed: {0}")]
    PlaybackFailed(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl VoiceError {
    /// True for both an explicit cancel and an elapsed deadline.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, VoiceError::Cancelled | VoiceError::TimedOut)
    }
}

pub type Result<T> = std::result::Result<T, VoiceError>;
