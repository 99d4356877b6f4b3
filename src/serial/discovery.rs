//! # Port Discovery
//!
//! Enumerates serial ports and orders them by how likely they are to be a
//! flight controller. The heuristics are plain tables; [`rank_ports`] is the
//! only code that reads them.

use tracing::{debug, warn};

/// Which port to use
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PortPreference {
    /// Scan and rank every port the OS reports
    Auto,
    /// Use exactly this port
    Explicit(String),
}

impl PortPreference {
    /// Interpret a `port` setting: `"auto"` (any case) or empty means scan
    pub fn from_setting(setting: &str) -> Self {
        let trimmed = setting.trim();
        if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("auto") {
            PortPreference::Auto
        } else {
            PortPreference::Explicit(trimmed.to_string())
        }
    }
}

/// Platform a name pattern applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    Linux,
    MacOs,
    Windows,
}

impl Platform {
    /// Platform this binary was built for
    pub fn current() -> Self {
        if cfg!(target_os = "windows") {
            Platform::Windows
        } else if cfg!(target_os = "macos") {
            Platform::MacOs
        } else {
            Platform::Linux
        }
    }
}

/// A port as reported by the OS
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortInfo {
    pub name: String,
    pub vid: Option<u16>,
    pub product: Option<String>,
}

/// A ranked port worth trying
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortCandidate {
    pub name: String,
    pub vid: Option<u16>,
    /// Why this port made the list
    pub reason: String,
}

/// USB vendor ids of MCUs and USB-serial bridges found on flight controllers
const KNOWN_VENDORS: &[(u16, &str)] = &[
    (0x0483, "STMicroelectronics VCP"),
    (0x2E3C, "Artery AT32 VCP"),
    (0x10C4, "Silicon Labs CP210x"),
    (0x1A86, "WCH CH340"),
    (0x0403, "FTDI"),
];

/// USB product string fragments of the same bridges, matched case-insensitively
///
/// Covers ports whose vendor id is hidden or rebranded.
const PRODUCT_FRAGMENTS: &[&str] = &[
    "STM32",
    "AT32",
    "Virtual COM",
    "CP210",
    "CH340",
    "CH341",
    "FT232",
];

/// Name fragments per platform, most specific first
const NAME_PATTERNS: &[(Platform, &str)] = &[
    (Platform::Linux, "ttyACM"),
    (Platform::Linux, "ttyUSB"),
    (Platform::MacOs, "cu.usbmodem"),
    (Platform::MacOs, "tty.usbmodem"),
    (Platform::MacOs, "cu.SLAB_USBtoUART"),
    (Platform::MacOs, "cu.wchusbserial"),
    (Platform::MacOs, "cu.usbserial"),
    (Platform::Windows, "COM"),
];

/// Order ports for connection attempts
///
/// Known vendor ids come first (in table order), then known USB product
/// strings, then ports matching a name pattern for `platform` (each in table
/// order). Ports matching none are left out rather than guessed at.
pub fn rank_ports(ports: &[PortInfo], platform: Platform) -> Vec<PortCandidate> {
    let mut ranked: Vec<(usize, PortCandidate)> = Vec::new();

    for port in ports {
        let vendor_rank = port
            .vid
            .and_then(|vid| KNOWN_VENDORS.iter().position(|(known, _)| *known == vid));

        if let Some(rank) = vendor_rank {
            ranked.push((
                rank,
                PortCandidate {
                    name: port.name.clone(),
                    vid: port.vid,
                    reason: KNOWN_VENDORS[rank].1.to_string(),
                },
            ));
            continue;
        }

        let product_rank = port.product.as_deref().and_then(|product| {
            let product = product.to_ascii_lowercase();
            PRODUCT_FRAGMENTS
                .iter()
                .position(|fragment| product.contains(&fragment.to_ascii_lowercase()))
        });

        if let Some(rank) = product_rank {
            ranked.push((
                KNOWN_VENDORS.len() + rank,
                PortCandidate {
                    name: port.name.clone(),
                    vid: port.vid,
                    reason: format!("product matches {}", PRODUCT_FRAGMENTS[rank]),
                },
            ));
            continue;
        }

        let pattern_rank = NAME_PATTERNS
            .iter()
            .enumerate()
            .filter(|(_, (p, _))| *p == platform)
            .find(|(_, (_, fragment))| port.name.contains(fragment))
            .map(|(i, (_, fragment))| (i, *fragment));

        if let Some((rank, fragment)) = pattern_rank {
            ranked.push((
                KNOWN_VENDORS.len() + PRODUCT_FRAGMENTS.len() + rank,
                PortCandidate {
                    name: port.name.clone(),
                    vid: port.vid,
                    reason: format!("name matches {}", fragment),
                },
            ));
        }
    }

    // Stable sort keeps OS order within a rank
    ranked.sort_by_key(|(rank, _)| *rank);
    ranked.into_iter().map(|(_, candidate)| candidate).collect()
}

/// Enumerate ports through the OS
fn enumerate_ports() -> Vec<PortInfo> {
    match tokio_serial::available_ports() {
        Ok(ports) => ports
            .into_iter()
            .map(|p| {
                let (vid, product) = match p.port_type {
                    tokio_serial::SerialPortType::UsbPort(usb) => (Some(usb.vid), usb.product),
                    _ => (None, None),
                };
                PortInfo {
                    name: p.port_name,
                    vid,
                    product,
                }
            })
            .collect(),
        Err(e) => {
            warn!("Serial port enumeration failed: {}", e);
            Vec::new()
        }
    }
}

/// Candidate ports for a preference
///
/// An explicit port is returned as-is. In auto mode an empty list means no
/// plausible device is attached.
pub fn discover(preference: &PortPreference) -> Vec<PortCandidate> {
    match preference {
        PortPreference::Explicit(name) => vec![PortCandidate {
            name: name.clone(),
            vid: None,
            reason: "configured".to_string(),
        }],
        PortPreference::Auto => {
            let ports = enumerate_ports();
            debug!("OS reports {} serial ports", ports.len());
            rank_ports(&ports, Platform::current())
        }
    }
}
