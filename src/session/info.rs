//! Device identification

use std::fmt;
use tracing::debug;

use super::Session;
use crate::error::{FcLinkError, Result};
use crate::msp::protocol::{MSP_API_VERSION, MSP_BOARD_INFO, MSP_FC_VARIANT, MSP_FC_VERSION, MSP_NAME};
use crate::serial::Transport;

/// What the FC says about itself
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    /// MSP API version as (major, minor)
    pub api_version: (u8, u8),
    /// Four-letter firmware id, e.g. "INAV"
    pub fc_variant: String,
    /// Firmware version as (major, minor, patch)
    pub fc_version: (u8, u8, u8),
    /// Four-letter board id
    pub board_id: String,
    /// Empty when unset or unsupported
    pub craft_name: String,
}

impl fmt::Display for DeviceInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (major, minor, patch) = self.fc_version;
        write!(f, "{} {}.{}.{} on {}", self.fc_variant, major, minor, patch, self.board_id)?;
        if !self.craft_name.is_empty() {
            write!(f, " ({})", self.craft_name)?;
        }
        Ok(())
    }
}

fn require(command: u16, payload: &[u8], len: usize) -> Result<()> {
    if payload.len() < len {
        return Err(FcLinkError::InvalidResponse {
            command,
            reason: format!("{} bytes, expected at least {}", payload.len(), len),
        });
    }
    Ok(())
}

fn ascii(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes)
        .trim_end_matches('\0')
        .trim()
        .to_string()
}

impl<T: Transport> Session<T> {
    /// Ask the FC for its API version, firmware, board and craft name
    pub async fn identify(&mut self) -> Result<DeviceInfo> {
        let api = self.send_request(MSP_API_VERSION, &[]).await?.payload;
        require(MSP_API_VERSION, &api, 3)?;

        let variant = self.send_request(MSP_FC_VARIANT, &[]).await?.payload;
        require(MSP_FC_VARIANT, &variant, 4)?;

        let version = self.send_request(MSP_FC_VERSION, &[]).await?.payload;
        require(MSP_FC_VERSION, &version, 3)?;

        let board = self.send_request(MSP_BOARD_INFO, &[]).await?.payload;
        require(MSP_BOARD_INFO, &board, 4)?;

        // Older firmware has no craft name
        let craft_name = match self.send_request(MSP_NAME, &[]).await {
            Ok(frame) => ascii(&frame.payload),
            Err(FcLinkError::UnsupportedCommand { .. }) => String::new(),
            Err(e) => return Err(e),
        };

        let info = DeviceInfo {
            api_version: (api[1], api[2]),
            fc_variant: ascii(&variant[..4]),
            fc_version: (version[0], version[1], version[2]),
            board_id: ascii(&board[..4]),
            craft_name,
        };
        debug!("Identified {}", info);
        Ok(info)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::serial::port_trait::mocks::FakeFlightController;
    use crate::session::SessionOptions;

    #[tokio::test(start_paused = true)]
    async fn test_identify() {
        let fake = FakeFlightController::new();
        let mut session = Session::new(fake, SessionOptions::default());

        let info = session.identify().await.unwrap();
        assert_eq!(info.api_version, (2, 5));
        assert_eq!(info.fc_variant, "INAV");
        assert_eq!(info.fc_version, (8, 0, 1));
        assert_eq!(info.board_id, "MTKS");
        assert_eq!(info.craft_name, "QUAD5");
        assert_eq!(info.to_string(), "INAV 8.0.1 on MTKS (QUAD5)");
    }

    #[tokio::test(start_paused = true)]
    async fn test_identify_without_craft_name() {
        let mut fake = FakeFlightController::new();
        fake.unsupported.insert(MSP_NAME);
        let mut session = Session::new(fake, SessionOptions::default());

        let info = session.identify().await.unwrap();
        assert!(info.craft_name.is_empty());
        assert_eq!(info.to_string(), "INAV 8.0.1 on MTKS");
    }

    #[tokio::test(start_paused = true)]
    async fn test_identify_other_variant() {
        let mut fake = FakeFlightController::new();
        fake.variant = "BTFL".to_string();
        let mut session = Session::new(fake, SessionOptions::default());

        assert_eq!(session.identify().await.unwrap().fc_variant, "BTFL");
    }

    #[test]
    fn test_ascii_trims_padding() {
        assert_eq!(ascii(b"MTKS\0\0"), "MTKS");
        assert_eq!(ascii(b" name "), "name");
    }
}
