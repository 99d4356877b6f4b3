//! # Error Types
//!
//! Custom error types for FC Link using `thiserror`.
//!
//! Layer-local errors ([`TransportError`], [`FrameError`](crate::msp::FrameError),
//! [`DecodeError`](crate::blackbox::DecodeError)) live next to the code that
//! produces them. Frame and decode errors are absorbed by rescanning; the
//! variants here are the ones that reach the caller.

use thiserror::Error;

/// Failures at the OS/device boundary. Never retried: the endpoint may be gone.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The serial device could not be opened
    #[error("Failed to open {path}: {message}")]
    OpenFailed { path: String, message: String },

    /// A write to the device failed
    #[error("Write failed: {0}")]
    WriteFailed(String),

    /// A read from the device failed
    #[error("Read failed: {0}")]
    ReadFailed(String),

    /// The device went away (EOF on the stream)
    #[error("Device disconnected")]
    Disconnected,

    /// The link was already closed
    #[error("Serial link is closed")]
    Closed,
}

/// Why a chunked download stopped early.
///
/// Carries every byte received before the failure, in address order, so the
/// caller can decide whether the partial log is still useful.
#[derive(Debug)]
pub struct PartialDownload {
    /// Bytes received so far, starting at address 0
    pub data: Vec<u8>,

    /// Address of the chunk that could not be read
    pub failed_address: u32,

    /// Number of bytes the download was expected to produce
    pub expected_size: u32,

    /// Last error seen for the failing chunk
    pub cause: FcLinkError,
}

/// Main error type for FC Link
#[derive(Debug, Error)]
pub enum FcLinkError {
    /// Link-level failure
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Request retries exhausted without a valid response
    #[error("No response to MSP command {command} after {attempts} attempts")]
    Communication { command: u16, attempts: u32 },

    /// The FC answered with an error-direction frame
    #[error("Firmware rejected MSP command {command} (unsupported)")]
    UnsupportedCommand { command: u16 },

    /// A response decoded but its content made no sense
    #[error("Invalid response to MSP command {command}: {reason}")]
    InvalidResponse { command: u16, reason: String },

    /// Dataflash read came back for a different address
    #[error("Chunk misaligned: requested 0x{requested:08X}, got 0x{returned:08X}")]
    ChunkMisaligned { requested: u32, returned: u32 },

    /// Chunked download could not complete
    #[error(
        "Download incomplete: {} of {} bytes, failed at 0x{:08X}: {}",
        .0.data.len(), .0.expected_size, .0.failed_address, .0.cause
    )]
    PartialDownload(Box<PartialDownload>),

    /// CLI echoed something other than the command we sent
    #[error("CLI echo mismatch: sent {sent:?}, got {echoed:?}")]
    CliEchoMismatch { sent: String, echoed: String },

    /// CLI accepted the line but reported an error for it
    #[error("CLI rejected {command:?}: {output}")]
    CliRejected { command: String, output: String },

    /// CLI prompt never came back
    #[error("CLI prompt not seen within {timeout_ms}ms")]
    CliTimeout { timeout_ms: u64 },

    /// No candidate serial device answered as a flight controller
    #[error("No flight controller found (tried: {0})")]
    NoDeviceFound(String),

    /// Blackbox header could not be used
    #[error("Blackbox header error: {0}")]
    Header(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] toml::de::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl FcLinkError {
    /// Whether a chunk read failing with this error is worth retrying.
    ///
    /// Only per-frame faults and timeouts qualify; a dead link or a command
    /// the firmware refuses will not get better on the next attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            FcLinkError::Communication { .. }
                | FcLinkError::ChunkMisaligned { .. }
                | FcLinkError::InvalidResponse { .. }
        )
    }
}

/// Result type alias for FC Link
pub type Result<T> = std::result::Result<T, FcLinkError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(FcLinkError::Communication { command: 71, attempts: 3 }.is_retryable());
        assert!(FcLinkError::ChunkMisaligned { requested: 0, returned: 4 }.is_retryable());
        assert!(!FcLinkError::Transport(TransportError::Disconnected).is_retryable());
        assert!(!FcLinkError::UnsupportedCommand { command: 71 }.is_retryable());
    }

    #[test]
    fn test_partial_download_message() {
        let err = FcLinkError::PartialDownload(Box::new(PartialDownload {
            data: vec![0u8; 512],
            failed_address: 512,
            expected_size: 2048,
            cause: FcLinkError::Communication { command: 71, attempts: 4 },
        }));

        let msg = err.to_string();
        assert!(msg.contains("512 of 2048"));
        assert!(msg.contains("0x00000200"));
    }
}
