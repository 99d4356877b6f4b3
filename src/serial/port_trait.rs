//! Trait abstraction for the byte link to the flight controller

use async_trait::async_trait;
use std::time::Duration;

use crate::error::TransportError;

/// Byte-stream endpoint operations. No framing happens at this level.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Transport: Send {
    /// Read up to `max_bytes`, waiting at most `timeout`.
    ///
    /// Returns an empty buffer when the timeout elapses without data.
    async fn read(&mut self, max_bytes: usize, timeout: Duration) -> Result<Vec<u8>, TransportError>;

    /// Write all data and flush it to the device
    async fn write(&mut self, data: &[u8]) -> Result<(), TransportError>;

    /// Release the endpoint. Calling it again is a no-op.
    fn close(&mut self);

    /// Whether the endpoint is still held
    fn is_open(&self) -> bool;
}

#[cfg(test)]
pub mod mocks {
    //! Simulated INAV flight controller for session tests.

    use super::*;
    use crate::msp::decoder::{scan, ScanOutcome};
    use crate::msp::encoder::encode;
    use crate::msp::protocol::*;
    use std::collections::{HashMap, HashSet, VecDeque};
    use std::sync::{Arc, Mutex};

    /// What the fake does when asked for a dataflash chunk
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum ChunkFault {
        /// Never answer (request times out)
        Silent,
        /// Answer with a corrupted CRC
        BadChecksum,
        /// Answer for the wrong address
        WrongAddress,
        /// Hold the answer back until a read of another address arrives
        Late,
    }

    /// Shared state so tests can inspect traffic after handing the fake to a session
    #[derive(Debug, Default)]
    pub struct FakeState {
        pub requests: Vec<MspFrame>,
        pub raw_writes: Vec<Vec<u8>>,
        pub closed: bool,
    }

    /// Scripted flight controller speaking MSP v2 and the INAV CLI
    #[derive(Debug)]
    pub struct FakeFlightController {
        pub variant: String,
        pub craft_name: String,
        pub flash: Vec<u8>,
        pub flash_total: u32,
        pub flash_flags: u8,
        pub unsupported: HashSet<u16>,
        pub chunk_faults: HashMap<u32, ChunkFault>,
        /// Number of times each faulty chunk misbehaves before answering; `None` = forever
        pub fault_limit: Option<u32>,
        pub fault_counts: HashMap<u32, u32>,
        pub silent_commands: HashSet<u16>,
        pub cli_outputs: HashMap<String, String>,
        pub cli_echo_overrides: HashMap<String, String>,
        /// CLI lines that get no answer at all
        pub cli_silent_lines: HashSet<String>,
        pub noise_before_response: Vec<u8>,
        pub state: Arc<Mutex<FakeState>>,
        late: Option<(u32, Vec<u8>)>,
        in_cli: bool,
        pending: VecDeque<u8>,
        rx: Vec<u8>,
    }

    impl FakeFlightController {
        pub fn new() -> Self {
            Self {
                variant: "INAV".to_string(),
                craft_name: "QUAD5".to_string(),
                flash: Vec::new(),
                flash_total: 0,
                flash_flags: 0x03,
                unsupported: HashSet::new(),
                chunk_faults: HashMap::new(),
                fault_limit: None,
                fault_counts: HashMap::new(),
                silent_commands: HashSet::new(),
                cli_outputs: HashMap::new(),
                cli_echo_overrides: HashMap::new(),
                cli_silent_lines: HashSet::new(),
                noise_before_response: Vec::new(),
                state: Arc::new(Mutex::new(FakeState::default())),
                late: None,
                in_cli: false,
                pending: VecDeque::new(),
                rx: Vec::new(),
            }
        }

        /// Fake with `used` bytes of patterned log data on a flash of `total` bytes
        pub fn with_flash(used: usize, total: u32) -> Self {
            let mut fake = Self::new();
            fake.flash = (0..used).map(|i| (i * 7 + i / 251) as u8).collect();
            fake.flash_total = total;
            fake
        }

        pub fn state(&self) -> Arc<Mutex<FakeState>> {
            Arc::clone(&self.state)
        }

        fn respond(&mut self, command: u16, payload: &[u8]) {
            let noise = self.noise_before_response.clone();
            self.pending.extend(noise);
            self.pending.extend(encode(Direction::Response, 0, command, payload));
        }

        fn handle_request(&mut self, request: MspFrame) {
            let command = request.command;
            self.state.lock().unwrap().requests.push(request.clone());

            if self.silent_commands.contains(&command) {
                return;
            }
            if self.unsupported.contains(&command) {
                self.pending.extend(encode(Direction::Error, 0, command, &[]));
                return;
            }

            match command {
                MSP_API_VERSION => self.respond(command, &[0, 2, 5]),
                MSP_FC_VARIANT => {
                    let variant = self.variant.clone();
                    self.respond(command, variant.as_bytes());
                }
                MSP_FC_VERSION => self.respond(command, &[8, 0, 1]),
                MSP_BOARD_INFO => self.respond(command, b"MTKS\x00\x00\x00"),
                MSP_NAME => {
                    let name = self.craft_name.clone();
                    self.respond(command, name.as_bytes());
                }
                MSP_DATAFLASH_SUMMARY => {
                    let mut payload = vec![self.flash_flags];
                    payload.extend_from_slice(&64u32.to_le_bytes());
                    payload.extend_from_slice(&self.flash_total.to_le_bytes());
                    payload.extend_from_slice(&(self.flash.len() as u32).to_le_bytes());
                    self.respond(command, &payload);
                }
                MSP_DATAFLASH_READ => self.handle_read(&request.payload),
                MSP_DATAFLASH_ERASE => {
                    self.flash.clear();
                    self.respond(command, &[]);
                }
                _ => self.pending.extend(encode(Direction::Error, 0, command, &[])),
            }
        }

        fn handle_read(&mut self, payload: &[u8]) {
            let address = u32::from_le_bytes([payload[0], payload[1], payload[2], payload[3]]);
            let size = u16::from_le_bytes([payload[4], payload[5]]) as usize;

            if let Some((held, frame)) = self.late.take() {
                if held == address {
                    self.late = Some((held, frame));
                } else {
                    self.pending.extend(frame);
                }
            }

            // Real flash pads past the used area with erased bytes
            let mut response = address.to_le_bytes().to_vec();
            for offset in 0..size {
                let index = address as usize + offset;
                response.push(self.flash.get(index).copied().unwrap_or(0xFF));
            }

            if let Some(fault) = self.chunk_faults.get(&address).copied() {
                let seen = self.fault_counts.entry(address).or_insert(0);
                *seen += 1;
                let active = self.fault_limit.map_or(true, |limit| *seen <= limit);
                if active {
                    match fault {
                        ChunkFault::Silent => {}
                        ChunkFault::BadChecksum => {
                            let mut frame = encode(Direction::Response, 0, MSP_DATAFLASH_READ, &response);
                            let last = frame.len() - 1;
                            frame[last] ^= 0x5A;
                            self.pending.extend(frame);
                        }
                        ChunkFault::WrongAddress => {
                            response[..4].copy_from_slice(&(address + 1).to_le_bytes());
                            self.respond(MSP_DATAFLASH_READ, &response);
                        }
                        ChunkFault::Late => {
                            let frame = encode(Direction::Response, 0, MSP_DATAFLASH_READ, &response);
                            self.late = Some((address, frame));
                        }
                    }
                    return;
                }
            }

            self.respond(MSP_DATAFLASH_READ, &response);
        }

        fn handle_cli_line(&mut self, line: &str) {
            if self.cli_silent_lines.contains(line) {
                return;
            }
            let echo = self
                .cli_echo_overrides
                .get(line)
                .cloned()
                .unwrap_or_else(|| line.to_string());
            let output = self.cli_outputs.get(line).cloned().unwrap_or_default();

            let mut text = format!("{}\r\n", echo);
            if !output.is_empty() {
                text.push_str(&output);
                text.push_str("\r\n");
            }
            if line == "save" || line == "exit" {
                text.push_str("Rebooting\r\n");
                self.in_cli = false;
            } else {
                text.push_str("\r\n# ");
            }
            self.pending.extend(text.into_bytes());
        }
    }

    #[async_trait]
    impl Transport for FakeFlightController {
        async fn read(&mut self, max_bytes: usize, timeout: Duration) -> Result<Vec<u8>, TransportError> {
            if self.state.lock().unwrap().closed {
                return Err(TransportError::Closed);
            }
            if self.pending.is_empty() {
                tokio::time::sleep(timeout).await;
                return Ok(Vec::new());
            }
            let n = max_bytes.min(self.pending.len());
            Ok(self.pending.drain(..n).collect())
        }

        async fn write(&mut self, data: &[u8]) -> Result<(), TransportError> {
            if self.state.lock().unwrap().closed {
                return Err(TransportError::Closed);
            }
            self.state.lock().unwrap().raw_writes.push(data.to_vec());

            if self.in_cli {
                self.rx.extend_from_slice(data);
                while let Some(end) = self.rx.iter().position(|&b| b == b'\n') {
                    let line: Vec<u8> = self.rx.drain(..=end).collect();
                    let line = String::from_utf8_lossy(&line).trim().to_string();
                    self.handle_cli_line(&line);
                }
                return Ok(());
            }

            if data == b"#" {
                self.in_cli = true;
                self.pending
                    .extend(b"\r\nEntering CLI Mode, type 'exit' to return, or 'help'\r\n\r\n# ".iter());
                return Ok(());
            }

            self.rx.extend_from_slice(data);
            while let ScanOutcome::Frame { frame, end, .. } = scan(&self.rx) {
                self.rx.drain(..end);
                self.handle_request(frame);
            }
            Ok(())
        }

        fn close(&mut self) {
            self.state.lock().unwrap().closed = true;
        }

        fn is_open(&self) -> bool {
            !self.state.lock().unwrap().closed
        }
    }
}
