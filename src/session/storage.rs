//! # Dataflash Storage
//!
//! Summary query, chunked reads and erase of the FC's onboard log flash.

use tracing::{debug, info, warn};

use super::{DeviceMode, Session};
use crate::error::{FcLinkError, PartialDownload, Result};
use crate::msp::encoder::encode_dataflash_read;
use crate::msp::protocol::{
    MSP_DATAFLASH_ADDRESS_SIZE, MSP_DATAFLASH_ERASE, MSP_DATAFLASH_READ, MSP_DATAFLASH_SUMMARY,
    MSP_MAX_CHUNK_SIZE,
};
use crate::serial::Transport;

/// Flag bit set once the flash chip is ready
const FLAG_READY: u8 = 0x01;
/// Flag bit set when the board has dataflash at all
const FLAG_SUPPORTED: u8 = 0x02;

/// Size of a summary response payload
const SUMMARY_PAYLOAD_SIZE: usize = 13;

/// Answer to MSP_DATAFLASH_SUMMARY
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataflashSummary {
    pub flags: u8,
    pub sectors: u32,
    /// Capacity in bytes
    pub total_size: u32,
    /// Bytes holding log data
    pub used_size: u32,
}

impl DataflashSummary {
    /// Parse a summary payload: `[flags][sectors LE32][total LE32][used LE32]`
    ///
    /// # Errors
    ///
    /// Returns [`FcLinkError::InvalidResponse`] for a short payload
    pub fn parse(payload: &[u8]) -> Result<Self> {
        if payload.len() < SUMMARY_PAYLOAD_SIZE {
            return Err(FcLinkError::InvalidResponse {
                command: MSP_DATAFLASH_SUMMARY,
                reason: format!("{} byte summary, expected {}", payload.len(), SUMMARY_PAYLOAD_SIZE),
            });
        }

        let le32 = |at: usize| {
            u32::from_le_bytes([payload[at], payload[at + 1], payload[at + 2], payload[at + 3]])
        };

        Ok(Self {
            flags: payload[0],
            sectors: le32(1),
            total_size: le32(5),
            used_size: le32(9),
        })
    }

    /// Whether the firmware set the ready bit
    pub fn ready_flag(&self) -> bool {
        self.flags & FLAG_READY != 0
    }

    /// Whether the firmware reported any capacity
    pub fn has_capacity(&self) -> bool {
        self.total_size > 0
    }

    /// Ready if either the flag bit is set or capacity is reported.
    ///
    /// Some firmware never sets the bit; neither check overrides the other.
    pub fn is_ready(&self) -> bool {
        self.ready_flag() || self.has_capacity()
    }

    /// Whether the board has dataflash
    pub fn is_supported(&self) -> bool {
        self.flags & FLAG_SUPPORTED != 0 || self.has_capacity()
    }
}

/// Download progress after each chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DownloadProgress {
    pub received: u32,
    pub total: u32,
}

impl DownloadProgress {
    /// Completed fraction in `0.0..=1.0`
    pub fn fraction(&self) -> f64 {
        if self.total == 0 {
            1.0
        } else {
            f64::from(self.received) / f64::from(self.total)
        }
    }
}

impl<T: Transport> Session<T> {
    /// Query dataflash capacity, usage and readiness
    pub async fn query_summary(&mut self) -> Result<DataflashSummary> {
        let frame = self.send_request(MSP_DATAFLASH_SUMMARY, &[]).await?;
        let summary = DataflashSummary::parse(&frame.payload)?;
        debug!(
            "Dataflash: {} of {} bytes used, flags 0x{:02X}",
            summary.used_size, summary.total_size, summary.flags
        );
        Ok(summary)
    }

    /// Read one chunk of flash
    ///
    /// # Arguments
    ///
    /// * `address` - Flash address to start at
    /// * `size` - Bytes wanted
    /// * `limit` - End of the readable area (the used size); nothing at or
    ///   past it is returned
    ///
    /// # Returns
    ///
    /// At most `min(size, limit - address)` bytes, and never more than
    /// [`MSP_MAX_CHUNK_SIZE`] so the response fits one frame. Empty if
    /// `address` is already at the limit.
    ///
    /// # Errors
    ///
    /// - [`FcLinkError::ChunkMisaligned`] if the response is for another address
    /// - [`FcLinkError::InvalidResponse`] for a short or empty response
    /// - Anything [`Session::send_request`] returns
    pub async fn read_chunk(&mut self, address: u32, size: u16, limit: u32) -> Result<Vec<u8>> {
        if address >= limit || size == 0 {
            return Ok(Vec::new());
        }

        let wanted = u32::from(size.min(MSP_MAX_CHUNK_SIZE)).min(limit - address) as usize;
        let request = encode_dataflash_read(address, wanted as u16);
        // A late answer for an earlier chunk carries a lower address
        let frame = self
            .send_request_matching(MSP_DATAFLASH_READ, &request, |frame| {
                response_address(&frame.payload).map_or(true, |returned| returned >= address)
            })
            .await?;

        if frame.payload.len() < MSP_DATAFLASH_ADDRESS_SIZE {
            return Err(FcLinkError::InvalidResponse {
                command: MSP_DATAFLASH_READ,
                reason: format!("{} byte chunk response", frame.payload.len()),
            });
        }

        let returned = response_address(&frame.payload).unwrap_or_default();
        if returned != address {
            return Err(FcLinkError::ChunkMisaligned {
                requested: address,
                returned,
            });
        }

        let mut data = frame.payload;
        data.drain(..MSP_DATAFLASH_ADDRESS_SIZE);
        data.truncate(wanted);

        if data.is_empty() {
            return Err(FcLinkError::InvalidResponse {
                command: MSP_DATAFLASH_READ,
                reason: format!("no data at 0x{:08X}", address),
            });
        }

        Ok(data)
    }

    /// Download the used part of the flash
    ///
    /// Chunks are read in address order. A failing chunk is retried up to
    /// the configured count; after that everything received so far comes
    /// back inside [`FcLinkError::PartialDownload`].
    ///
    /// The device mode is [`DeviceMode::Unknown`] while the download runs and
    /// stays that way if the future is dropped before it finishes.
    ///
    /// # Arguments
    ///
    /// * `progress` - Called after every chunk
    ///
    /// # Errors
    ///
    /// - [`FcLinkError::UnsupportedCommand`] if the board has no dataflash
    /// - [`FcLinkError::InvalidResponse`] if the flash is not ready
    /// - [`FcLinkError::PartialDownload`] if a chunk could not be read
    pub async fn download<F>(&mut self, mut progress: F) -> Result<Vec<u8>>
    where
        F: FnMut(DownloadProgress),
    {
        let summary = self.query_summary().await?;
        if !summary.is_supported() {
            return Err(FcLinkError::UnsupportedCommand {
                command: MSP_DATAFLASH_READ,
            });
        }
        if !summary.is_ready() {
            return Err(FcLinkError::InvalidResponse {
                command: MSP_DATAFLASH_SUMMARY,
                reason: "dataflash not ready".to_string(),
            });
        }

        let total = summary.used_size;
        let chunk_size = self.options.chunk_size;
        let attempts = self.options.chunk_retries + 1;
        let mut data = Vec::with_capacity(total as usize);

        info!("Downloading {} bytes of dataflash in {} byte chunks", total, chunk_size);
        self.mode = DeviceMode::Unknown;

        while (data.len() as u32) < total {
            let address = data.len() as u32;
            let mut last_error = None;

            for attempt in 1..=attempts {
                match self.read_chunk(address, chunk_size, total).await {
                    Ok(chunk) => {
                        debug!("Chunk 0x{:08X}: {} bytes", address, chunk.len());
                        data.extend_from_slice(&chunk);
                        break;
                    }
                    Err(e) if e.is_retryable() && attempt < attempts => {
                        warn!(
                            "Chunk 0x{:08X} failed (attempt {}/{}): {}",
                            address, attempt, attempts, e
                        );
                    }
                    Err(e) => {
                        last_error = Some(e);
                        break;
                    }
                }
            }

            if let Some(cause) = last_error {
                warn!(
                    "Download stopped at 0x{:08X} with {} of {} bytes",
                    address,
                    data.len(),
                    total
                );
                return Err(FcLinkError::PartialDownload(Box::new(PartialDownload {
                    data,
                    failed_address: address,
                    expected_size: total,
                    cause,
                })));
            }

            progress(DownloadProgress {
                received: data.len() as u32,
                total,
            });
        }

        self.mode = DeviceMode::Msp;
        info!("Download complete: {} bytes", data.len());
        Ok(data)
    }

    /// Ask the FC to erase its dataflash
    ///
    /// The FC acknowledges immediately and erases in the background; poll
    /// [`Session::query_summary`] until `used_size` reads zero.
    pub async fn erase(&mut self) -> Result<()> {
        self.send_request(MSP_DATAFLASH_ERASE, &[]).await?;
        info!("Dataflash erase started");
        Ok(())
    }
}

/// Address echoed at the start of a chunk response
fn response_address(payload: &[u8]) -> Option<u32> {
    let bytes = payload.get(..MSP_DATAFLASH_ADDRESS_SIZE)?;
    Some(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}
