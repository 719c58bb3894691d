use std::io;

use thiserror::Error;

/// Terminal conditions of the sample channel. Neither is retryable.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum ChannelError {
    #[error("sample channel reached end of stream: the producer is gone")]
    EndOfStream,

    #[error("sample channel closed")]
    Closed,
}

#[derive(Debug, Error)]
pub enum CaptureError {
    /// A single frame could not be read or decoded; the next one may succeed.
    #[error("failed to capture frame: {0}")]
    Frame(String),

    /// The capture device cannot be opened or has gone away.
    #[error("capture device unavailable: {0}")]
    Unavailable(String),
}

impl CaptureError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, CaptureError::Unavailable(_))
    }
}

#[derive(Debug, Error)]
pub enum SendError {
    #[error("client disconnected")]
    Disconnected,

    #[error("transient send failure: {0}")]
    Transient(String),
}

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind {addr}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },
}

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("sending frequency must be a finite number above zero, got {0}")]
    InvalidFrequency(f64),

    #[error("source frame rate must be above zero")]
    InvalidSourceFps,
}
