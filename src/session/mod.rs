//! # MSP Session Module
//!
//! Request/response exchange with one flight controller over one link.
//!
//! This module handles:
//! - Pairing each request with its response by command id
//! - Per-attempt timeout and bounded retransmission
//! - Dataflash summary, chunked download and erase ([`storage`])
//! - CLI command execution ([`cli`])
//! - Device identification ([`info`])
//!
//! Exactly one request is outstanding at a time and nothing runs in the
//! background. The link is released when the session is closed or dropped.

pub mod cli;
pub mod info;
pub mod storage;

pub use cli::{BatchFailure, BatchOutcome, CommandChannel, CommandResult};
pub use info::DeviceInfo;
pub use storage::{DataflashSummary, DownloadProgress};

use bytes::{Buf, BytesMut};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::{FcLinkError, Result};
use crate::msp::decoder::{scan, ScanOutcome};
use crate::msp::encoder::encode;
use crate::msp::protocol::{Direction, MspFrame};
use crate::serial::{discover, PortPreference, SerialLink, Transport};

/// Largest read requested from the transport at once
const READ_CHUNK_SIZE: usize = 4096;

/// Upper bound on a single transport read while waiting for a response
const READ_SLICE: Duration = Duration::from_millis(50);

/// Pause before re-polling when a partial frame is buffered and nothing new
/// arrived. Polling without it starves USB interrupt servicing on a loaded host.
pub const PARTIAL_FRAME_BACKOFF: Duration = Duration::from_micros(200);

/// FC variants [`connect`] accepts
const ACCEPTED_VARIANTS: &[&str] = &["INAV"];

/// What the FC is believed to be doing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceMode {
    /// Answering MSP requests
    Msp,
    /// In the text CLI
    Cli,
    /// An operation was interrupted or the FC rebooted; nothing is assumed
    Unknown,
}

/// Timing and retry knobs for a session
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Time to wait for one response
    pub request_timeout: Duration,
    /// Retransmissions after the first attempt
    pub retries: u32,
    /// Bytes requested per dataflash read
    pub chunk_size: u16,
    /// Extra attempts per chunk
    pub chunk_retries: u32,
    /// Time to wait for the CLI prompt
    pub cli_timeout: Duration,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

impl From<&Config> for SessionOptions {
    fn from(config: &Config) -> Self {
        Self {
            request_timeout: config.serial.timeout(),
            retries: config.serial.retries,
            chunk_size: config.download.chunk_size,
            chunk_retries: config.download.chunk_retries,
            cli_timeout: Duration::from_millis(config.cli.timeout_ms),
        }
    }
}

/// A session with one flight controller
pub struct Session<T: Transport> {
    transport: T,
    rx: BytesMut,
    options: SessionOptions,
    mode: DeviceMode,
}

impl<T: Transport> std::fmt::Debug for Session<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("mode", &self.mode)
            .field("buffered", &self.rx.len())
            .field("open", &self.transport.is_open())
            .finish_non_exhaustive()
    }
}

impl<T: Transport> Session<T> {
    /// Start a session over an open transport
    pub fn new(transport: T, options: SessionOptions) -> Self {
        Self {
            transport,
            rx: BytesMut::with_capacity(READ_CHUNK_SIZE * 2),
            options,
            mode: DeviceMode::Msp,
        }
    }

    /// Current belief about the FC's mode
    pub fn device_mode(&self) -> DeviceMode {
        self.mode
    }

    /// Session options
    pub fn options(&self) -> &SessionOptions {
        &self.options
    }

    /// Release the link. Safe to call more than once.
    pub fn close(&mut self) {
        self.transport.close();
        self.rx.clear();
    }

    /// Whether the link is still held
    pub fn is_open(&self) -> bool {
        self.transport.is_open()
    }

    /// Send a request and wait for its response
    ///
    /// The identical request is retransmitted after each timeout, up to the
    /// configured retry count.
    ///
    /// # Errors
    ///
    /// - [`FcLinkError::Transport`] immediately on a link failure
    /// - [`FcLinkError::UnsupportedCommand`] if the FC answers with an error frame
    /// - [`FcLinkError::Communication`] once every attempt has timed out
    pub async fn send_request(&mut self, command: u16, payload: &[u8]) -> Result<MspFrame> {
        self.send_request_matching(command, payload, |_| true).await
    }

    /// [`Session::send_request`], also discarding responses `accept` rejects
    ///
    /// Anything already buffered is dropped before each transmission. A late
    /// answer to a timed-out attempt can still arrive afterwards; `accept`
    /// lets the caller recognize and skip it.
    pub(crate) async fn send_request_matching<F>(
        &mut self,
        command: u16,
        payload: &[u8],
        accept: F,
    ) -> Result<MspFrame>
    where
        F: Fn(&MspFrame) -> bool,
    {
        let request = encode(Direction::Request, 0, command, payload);
        let attempts = self.options.retries + 1;

        for attempt in 1..=attempts {
            if !self.rx.is_empty() {
                debug!("Dropping {} stale bytes before MSP {}", self.rx.len(), command);
                self.rx.clear();
            }
            self.transport.write(&request).await?;

            match self.receive(command, self.options.request_timeout, &accept).await? {
                Some(frame) if frame.direction == Direction::Error => {
                    warn!("FC rejected MSP command {}", command);
                    return Err(FcLinkError::UnsupportedCommand { command });
                }
                Some(frame) => {
                    debug!(
                        "MSP {} answered with {} bytes (attempt {})",
                        command,
                        frame.payload.len(),
                        attempt
                    );
                    return Ok(frame);
                }
                None => {
                    warn!("MSP {} timed out (attempt {}/{})", command, attempt, attempts);
                }
            }
        }

        Err(FcLinkError::Communication { command, attempts })
    }

    /// Wait for a response to `command` until `timeout` elapses
    ///
    /// Frames for other commands, and responses `accept` rejects, are discarded.
    async fn receive<F>(
        &mut self,
        command: u16,
        timeout: Duration,
        accept: &F,
    ) -> Result<Option<MspFrame>>
    where
        F: Fn(&MspFrame) -> bool,
    {
        let deadline = Instant::now() + timeout;

        loop {
            while let Some(frame) = self.next_buffered_frame() {
                if frame.direction == Direction::Request || frame.command != command {
                    debug!("Discarding unexpected MSP frame for command {}", frame.command);
                    continue;
                }
                if frame.direction == Direction::Error || accept(&frame) {
                    return Ok(Some(frame));
                }
                debug!("Discarding stale response to MSP {}", command);
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }

            let bytes = self
                .transport
                .read(READ_CHUNK_SIZE, (deadline - now).min(READ_SLICE))
                .await?;

            if bytes.is_empty() {
                if !self.rx.is_empty() {
                    tokio::time::sleep(PARTIAL_FRAME_BACKOFF).await;
                }
            } else {
                self.rx.extend_from_slice(&bytes);
            }
        }
    }

    /// Pop the next valid frame from the receive buffer, dropping junk before it
    fn next_buffered_frame(&mut self) -> Option<MspFrame> {
        match scan(&self.rx) {
            ScanOutcome::Frame { frame, start, end } => {
                if start > 0 {
                    debug!("Skipped {} bytes before MSP frame", start);
                }
                self.rx.advance(end);
                Some(frame)
            }
            ScanOutcome::NeedMore { discard } => {
                if discard > 0 {
                    self.rx.advance(discard);
                }
                None
            }
        }
    }

    /// Write raw bytes, bypassing MSP framing (CLI traffic)
    async fn write_raw(&mut self, data: &[u8]) -> Result<()> {
        self.transport.write(data).await?;
        Ok(())
    }

    /// Read raw bytes into the receive buffer until it ends with `marker`
    /// and the line stays quiet for `quiet`, or `timeout` elapses.
    ///
    /// Returns the buffered text (marker included) and clears the buffer, or
    /// `None` on timeout.
    async fn read_until_quiet(
        &mut self,
        marker: &[u8],
        timeout: Duration,
        quiet: Duration,
    ) -> Result<Option<Vec<u8>>> {
        let deadline = Instant::now() + timeout;

        loop {
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }

            let at_marker = self.rx.ends_with(marker);
            let wait = if at_marker { quiet } else { READ_SLICE };
            let bytes = self
                .transport
                .read(READ_CHUNK_SIZE, (deadline - now).min(wait))
                .await?;

            if bytes.is_empty() {
                if at_marker {
                    let text = self.rx.split().to_vec();
                    return Ok(Some(text));
                }
                if !self.rx.is_empty() {
                    tokio::time::sleep(PARTIAL_FRAME_BACKOFF).await;
                }
            } else {
                self.rx.extend_from_slice(&bytes);
            }
        }
    }
}

impl<T: Transport> Drop for Session<T> {
    fn drop(&mut self) {
        self.transport.close();
    }
}

/// Open a session with the first flight controller that answers
///
/// With [`PortPreference::Auto`], ranked candidates are tried in order and
/// the first one identifying as INAV wins. An explicit port must identify
/// as INAV too.
///
/// # Errors
///
/// Returns [`FcLinkError::NoDeviceFound`] if no candidate answered
pub async fn connect(
    preference: &PortPreference,
    config: &Config,
) -> Result<(Session<SerialLink>, DeviceInfo)> {
    let candidates = discover(preference);
    let options = SessionOptions::from(config);
    let mut tried = Vec::with_capacity(candidates.len());

    for candidate in candidates {
        tried.push(candidate.name.clone());
        debug!("Trying {} ({})", candidate.name, candidate.reason);

        let link = match SerialLink::open(&candidate.name, config.serial.baud_rate) {
            Ok(link) => link,
            Err(e) => {
                warn!("{}", e);
                continue;
            }
        };

        let mut session = Session::new(link, options.clone());
        match session.identify().await {
            Ok(info) if ACCEPTED_VARIANTS.contains(&info.fc_variant.as_str()) => {
                info!("Connected to {} on {}", info, candidate.name);
                return Ok((session, info));
            }
            Ok(info) => {
                warn!("{} answered as {}, not INAV", candidate.name, info.fc_variant);
            }
            Err(e) => {
                warn!("{} did not identify: {}", candidate.name, e);
            }
        }
    }

    Err(FcLinkError::NoDeviceFound(if tried.is_empty() {
        "no candidate ports".to_string()
    } else {
        tried.join(", ")
    }))
}
