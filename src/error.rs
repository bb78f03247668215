use std::io;
use std::os::fd::RawFd;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Frame error: {0}")]
    FrameError(#[from] FrameError),

    #[error("Handshake error: {0}")]
    HandshakeError(#[from] HandshakeError),

    #[error("Server error: {0}")]
    ServerError(#[from] ServerError),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Internal server error: {0}")]
    InternalError(String),
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::ConfigError(err.to_string())
    }
}

impl From<io::Error> for AppError {
    fn from(err: io::Error) -> Self {
        AppError::InternalError(err.to_string())
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum FrameError {
    #[error("Frame truncated: need {needed} bytes, got {available}")]
    Truncated { needed: usize, available: usize },

    #[error("Payload of {0} bytes does not fit a single-byte length (max 125)")]
    PayloadTooLarge(usize),
}

#[derive(Error, Debug)]
pub enum HandshakeError {
    #[error("Read failed: {0}")]
    Read(#[source] io::Error),

    #[error("Peer closed the connection before completing the handshake")]
    ConnectionClosed,

    #[error("No complete request after {0} read attempts")]
    RetriesExhausted(u32),

    #[error("Request exceeded the {0} byte budget")]
    RequestTooLarge(usize),

    #[error("Missing Sec-WebSocket-Key header")]
    MissingKey,

    #[error("Write failed: {0}")]
    Write(#[source] io::Error),

    #[error("Socket configuration failed: {0}")]
    Socket(#[source] io::Error),
}

/// Failure of the readiness poll. Displays as `[code] message`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("[{code}] {message}")]
pub struct PollError {
    pub code: i32,
    pub message: String,
}

impl From<nix::errno::Errno> for PollError {
    fn from(errno: nix::errno::Errno) -> Self {
        PollError {
            code: errno as i32,
            message: errno.desc().to_string(),
        }
    }
}

#[derive(Error, Debug)]
pub enum ServerError {
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("Poll failed: {0}")]
    Poll(#[from] PollError),

    #[error("Unknown event: {0}")]
    UnknownEvent(String),

    #[error("Handler does not match event {event}")]
    HandlerMismatch { event: String },

    #[error("Socket {0} is already registered")]
    DuplicateSocket(RawFd),

    #[error("Message sending failed: {0}")]
    Send(#[from] io::Error),

    #[error("Connection is closed")]
    ConnectionClosed,

    #[error("Invalid configuration: {0}")]
    Config(#[from] config::ConfigError),
}

/// Formats an I/O error the same way poll failures are reported.
pub(crate) fn format_io_error(err: &io::Error) -> String {
    match err.raw_os_error() {
        Some(code) => format!("[{}] {}", code, err),
        None => format!("[0] {}", err),
    }
}
