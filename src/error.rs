use std::{io, result};

/// Result type of all filtercam library calls.
pub type Result<T, E = Error> = result::Result<T, E>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    // ---- GPU / display ----
    #[error("Resource unavailable: {0}")]
    ResourceUnavailable(String),

    #[error("No compatible pixel format: {0}")]
    ConfigurationUnavailable(String),

    #[error("{stage} shader compile error: {log}")]
    ShaderCompile { stage: ShaderStage, log: String },

    // ---- Programming errors ----
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Frame size rejected: {0}")]
    GeometryRejected(String),

    // ---- Encoder / muxer ----
    #[error("Encoder/muxer protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("Encoder unavailable: {0}")]
    EncoderUnavailable(String),

    #[error("FFmpeg error: {0}")]
    Ffmpeg(#[from] ffmpeg_next::Error),

    #[error("IO error:{0}")]
    IO(#[from] io::Error),

    #[error("Render thread exited")]
    ChannelClosed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShaderStage {
    Vertex,
    Fragment,
    Link,
}

impl std::fmt::Display for ShaderStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ShaderStage::Vertex => f.write_str("vertex"),
            ShaderStage::Fragment => f.write_str("fragment"),
            ShaderStage::Link => f.write_str("link"),
        }
    }
}

impl Error {
    /// Fatal errors end the recording session and are reported to the shell.
    /// Everything else is a local, per-call failure.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::ResourceUnavailable(_)
                | Error::ConfigurationUnavailable(_)
                | Error::EncoderUnavailable(_)
                | Error::ProtocolViolation(_)
                | Error::InvalidState(_)
                | Error::InvalidArgument(_)
        )
    }

    /// The failure kind without its payload, for status reporting and tests.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::ResourceUnavailable(_) => ErrorKind::ResourceUnavailable,
            Error::ConfigurationUnavailable(_) => ErrorKind::ConfigurationUnavailable,
            Error::ShaderCompile { .. } => ErrorKind::ShaderCompile,
            Error::InvalidArgument(_) => ErrorKind::InvalidArgument,
            Error::InvalidState(_) => ErrorKind::InvalidState,
            Error::GeometryRejected(_) => ErrorKind::GeometryRejected,
            Error::ProtocolViolation(_) => ErrorKind::ProtocolViolation,
            Error::EncoderUnavailable(_) => ErrorKind::EncoderUnavailable,
            Error::Ffmpeg(_) => ErrorKind::Ffmpeg,
            Error::IO(_) => ErrorKind::IO,
            Error::ChannelClosed => ErrorKind::ChannelClosed,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    ResourceUnavailable,
    ConfigurationUnavailable,
    ShaderCompile,
    InvalidArgument,
    InvalidState,
    GeometryRejected,
    ProtocolViolation,
    EncoderUnavailable,
    Ffmpeg,
    IO,
    ChannelClosed,
}
