//! Core types used throughout meshlink.
//!
//! These types provide a protocol-family-agnostic abstraction layer over
//! the various module firmwares (ZigBee, DigiMesh, 802.15.4, point-to-
//! multipoint).

use std::fmt;
use std::time::Duration;

/// The wire-level framing convention currently in effect for a connection.
///
/// Determined once per connection open by the operating-mode probe and
/// stored for the life of the connection. Only [`Framed`](OperatingMode::Framed)
/// and [`FramedEscaped`](OperatingMode::FramedEscaped) support framed
/// operations; sends in the other modes fail with
/// [`Error::InvalidOperatingMode`](crate::error::Error::InvalidOperatingMode).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperatingMode {
    /// The mode could not be determined. Fatal during open.
    Unknown,
    /// The module is in unframed, human-readable command mode.
    LegacyCommand,
    /// Binary framed mode without byte escaping.
    Framed,
    /// Binary framed mode with control-byte escaping.
    FramedEscaped,
}

impl OperatingMode {
    /// Returns `true` if framed operations can be sent in this mode.
    pub fn is_sendable(self) -> bool {
        matches!(self, OperatingMode::Framed | OperatingMode::FramedEscaped)
    }
}

impl fmt::Display for OperatingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OperatingMode::Unknown => "unknown mode",
            OperatingMode::LegacyCommand => "legacy command mode",
            OperatingMode::Framed => "framed mode",
            OperatingMode::FramedEscaped => "framed mode (escaped)",
        };
        write!(f, "{s}")
    }
}

/// The protocol family a module's firmware implements.
///
/// Rather than modeling each family as its own device type, meshlink
/// carries one device type tagged with its protocol plus an explicit
/// [`Capabilities`] set; operations check the relevant capability and
/// return [`Error::Unsupported`](crate::error::Error::Unsupported) when
/// it is absent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RadioProtocol {
    /// ZigBee mesh firmware.
    ZigBee,
    /// DigiMesh firmware (64-bit addressing only).
    DigiMesh,
    /// Raw 802.15.4 firmware (legacy, end-of-scan-terminated discovery).
    Raw802154,
    /// Point-to-multipoint firmware.
    PointToMultipoint,
    /// Protocol not yet determined.
    Unknown,
}

impl RadioProtocol {
    /// Return the capability set for this protocol family.
    pub fn capabilities(self) -> Capabilities {
        match self {
            RadioProtocol::ZigBee => Capabilities {
                supports_16bit_addressing: true,
                supports_explicit_addressing: true,
                supports_io_sampling: true,
                end_of_scan_terminated: false,
                discovery_pad: Duration::ZERO,
            },
            RadioProtocol::DigiMesh => Capabilities {
                supports_16bit_addressing: false,
                supports_explicit_addressing: true,
                supports_io_sampling: true,
                end_of_scan_terminated: false,
                discovery_pad: Duration::from_millis(3_000),
            },
            RadioProtocol::Raw802154 => Capabilities {
                supports_16bit_addressing: true,
                supports_explicit_addressing: false,
                supports_io_sampling: true,
                end_of_scan_terminated: true,
                discovery_pad: Duration::ZERO,
            },
            RadioProtocol::PointToMultipoint => Capabilities {
                supports_16bit_addressing: true,
                supports_explicit_addressing: false,
                supports_io_sampling: false,
                end_of_scan_terminated: false,
                discovery_pad: Duration::from_millis(8_000),
            },
            RadioProtocol::Unknown => Capabilities {
                supports_16bit_addressing: true,
                supports_explicit_addressing: false,
                supports_io_sampling: false,
                end_of_scan_terminated: false,
                discovery_pad: Duration::ZERO,
            },
        }
    }
}

impl fmt::Display for RadioProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RadioProtocol::ZigBee => "ZigBee",
            RadioProtocol::DigiMesh => "DigiMesh",
            RadioProtocol::Raw802154 => "802.15.4",
            RadioProtocol::PointToMultipoint => "point-to-multipoint",
            RadioProtocol::Unknown => "unknown",
        };
        write!(f, "{s}")
    }
}

/// Feature set of a protocol family.
///
/// Checked by operations instead of relying on per-family device types.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Capabilities {
    /// Whether peers have a 16-bit network address.
    pub supports_16bit_addressing: bool,
    /// Whether explicit (endpoint/cluster) addressing frames are available.
    pub supports_explicit_addressing: bool,
    /// Whether the firmware emits IO sample frames.
    pub supports_io_sampling: bool,
    /// Whether network discovery terminates on an explicit end-of-scan
    /// frame rather than a computed deadline.
    pub end_of_scan_terminated: bool,
    /// Propagation-delay pad added to the computed discovery deadline.
    pub discovery_pad: Duration,
}

/// Delivery status reported in a transmit status frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransmitStatus {
    /// Delivered successfully.
    Success,
    /// No acknowledgement received from the destination.
    NoAck,
    /// Clear-channel assessment failed.
    CcaFailure,
    /// The frame addressed this module itself.
    SelfAddressed,
    /// The destination address could not be resolved.
    AddressNotFound,
    /// No route to the destination was found.
    RouteNotFound,
    /// The payload exceeded the maximum frame size.
    PayloadTooLarge,
    /// A status code not otherwise modeled.
    Unknown(u8),
}

impl TransmitStatus {
    /// Decode a delivery status byte.
    pub fn from_code(code: u8) -> Self {
        match code {
            0x00 => TransmitStatus::Success,
            0x01 => TransmitStatus::NoAck,
            0x02 => TransmitStatus::CcaFailure,
            0x23 => TransmitStatus::SelfAddressed,
            0x24 => TransmitStatus::AddressNotFound,
            0x25 => TransmitStatus::RouteNotFound,
            0x74 => TransmitStatus::PayloadTooLarge,
            other => TransmitStatus::Unknown(other),
        }
    }

    /// Return the raw status code.
    pub fn code(self) -> u8 {
        match self {
            TransmitStatus::Success => 0x00,
            TransmitStatus::NoAck => 0x01,
            TransmitStatus::CcaFailure => 0x02,
            TransmitStatus::SelfAddressed => 0x23,
            TransmitStatus::AddressNotFound => 0x24,
            TransmitStatus::RouteNotFound => 0x25,
            TransmitStatus::PayloadTooLarge => 0x74,
            TransmitStatus::Unknown(code) => code,
        }
    }

    /// Returns `true` for the statuses a checked send treats as success:
    /// delivered, or addressed to the sending module itself.
    pub fn is_success(self) -> bool {
        matches!(self, TransmitStatus::Success | TransmitStatus::SelfAddressed)
    }
}

impl fmt::Display for TransmitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransmitStatus::Success => write!(f, "success"),
            TransmitStatus::NoAck => write!(f, "no acknowledgement"),
            TransmitStatus::CcaFailure => write!(f, "CCA failure"),
            TransmitStatus::SelfAddressed => write!(f, "self addressed"),
            TransmitStatus::AddressNotFound => write!(f, "address not found"),
            TransmitStatus::RouteNotFound => write!(f, "route not found"),
            TransmitStatus::PayloadTooLarge => write!(f, "payload too large"),
            TransmitStatus::Unknown(code) => write!(f, "unknown status 0x{code:02X}"),
        }
    }
}

/// Status byte carried in an AT command response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AtStatus {
    /// Command accepted.
    Ok,
    /// Generic failure.
    Error,
    /// The command name was not recognized.
    InvalidCommand,
    /// The parameter value was rejected.
    InvalidParameter,
    /// A remote command could not be delivered.
    TxFailure,
    /// A status code not otherwise modeled.
    Unknown(u8),
}

impl AtStatus {
    /// Decode an AT response status byte.
    pub fn from_code(code: u8) -> Self {
        match code {
            0x00 => AtStatus::Ok,
            0x01 => AtStatus::Error,
            0x02 => AtStatus::InvalidCommand,
            0x03 => AtStatus::InvalidParameter,
            0x04 => AtStatus::TxFailure,
            other => AtStatus::Unknown(other),
        }
    }

    /// Returns `true` if the command was accepted.
    pub fn is_ok(self) -> bool {
        matches!(self, AtStatus::Ok)
    }
}

impl fmt::Display for AtStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AtStatus::Ok => write!(f, "OK"),
            AtStatus::Error => write!(f, "error"),
            AtStatus::InvalidCommand => write!(f, "invalid command"),
            AtStatus::InvalidParameter => write!(f, "invalid parameter"),
            AtStatus::TxFailure => write!(f, "transmission failure"),
            AtStatus::Unknown(code) => write!(f, "unknown status 0x{code:02X}"),
        }
    }
}

/// Modem status reported in an unsolicited modem status frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModemStatus {
    /// The module completed a hardware reset.
    HardwareReset,
    /// The module reset due to its watchdog timer.
    WatchdogReset,
    /// The module joined a network.
    JoinedNetwork,
    /// The module left or was removed from its network.
    Disassociated,
    /// A status code not otherwise modeled.
    Unknown(u8),
}

impl ModemStatus {
    /// Decode a modem status byte.
    pub fn from_code(code: u8) -> Self {
        match code {
            0x00 => ModemStatus::HardwareReset,
            0x01 => ModemStatus::WatchdogReset,
            0x02 => ModemStatus::JoinedNetwork,
            0x03 => ModemStatus::Disassociated,
            other => ModemStatus::Unknown(other),
        }
    }

    /// Returns `true` if this status marks the completion of a module reset.
    pub fn is_reset(self) -> bool {
        matches!(self, ModemStatus::HardwareReset | ModemStatus::WatchdogReset)
    }
}

impl fmt::Display for ModemStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModemStatus::HardwareReset => write!(f, "hardware reset"),
            ModemStatus::WatchdogReset => write!(f, "watchdog reset"),
            ModemStatus::JoinedNetwork => write!(f, "joined network"),
            ModemStatus::Disassociated => write!(f, "disassociated"),
            ModemStatus::Unknown(code) => write!(f, "unknown status 0x{code:02X}"),
        }
    }
}
