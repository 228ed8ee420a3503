//! The DHCP options this engine reads and writes.
//!
//! The engine only reads the client hostname (Option 12) and writes the
//! address lease time (Option 51). Every other option belongs to other
//! handlers in the chain and passes through untouched as
//! [`DhcpOption::Unknown`].
//!
//! # References
//!
//! - RFC 2132: DHCP Options and BOOTP Vendor Extensions

use std::time::Duration;

/// DHCP option codes handled here, as defined in RFC 2132.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OptionCode {
    /// Client hostname (RFC 2132 §3.14).
    Hostname = 12,
    /// IP address lease time in seconds (RFC 2132 §9.2).
    LeaseTime = 51,
}

impl TryFrom<u8> for OptionCode {
    type Error = u8;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            12 => Ok(Self::Hostname),
            51 => Ok(Self::LeaseTime),
            other => Err(other),
        }
    }
}

/// A DHCP option attached to a request or response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DhcpOption {
    /// Client hostname (Option 12).
    Hostname(String),
    /// Lease time in seconds (Option 51).
    LeaseTime(u32),
    /// Any other option, kept as raw code and data.
    Unknown(u8, Vec<u8>),
}

impl DhcpOption {
    /// Builds Option 51 from a lease duration, rounded to whole seconds and
    /// saturated at `u32::MAX` ("infinite" per RFC 2132).
    pub fn lease_time(duration: Duration) -> Self {
        let seconds = duration
            .saturating_add(Duration::from_millis(500))
            .as_secs();
        Self::LeaseTime(u32::try_from(seconds).unwrap_or(u32::MAX))
    }

    /// Returns the RFC 2132 option code for this option.
    pub fn option_code(&self) -> u8 {
        match self {
            Self::Hostname(_) => OptionCode::Hostname as u8,
            Self::LeaseTime(_) => OptionCode::LeaseTime as u8,
            Self::Unknown(code, _) => *code,
        }
    }

    /// Parses an option from its code and raw data.
    ///
    /// Malformed data for a known code is kept as [`DhcpOption::Unknown`]
    /// rather than rejected; the option is not this engine's to police.
    pub fn parse(code: u8, data: &[u8]) -> Self {
        match OptionCode::try_from(code) {
            Ok(OptionCode::Hostname) if !data.is_empty() => {
                Self::Hostname(String::from_utf8_lossy(data).into_owned())
            }
            Ok(OptionCode::LeaseTime) => match <[u8; 4]>::try_from(data) {
                Ok(bytes) => Self::LeaseTime(u32::from_be_bytes(bytes)),
                Err(_) => Self::Unknown(code, data.to_vec()),
            },
            _ => Self::Unknown(code, data.to_vec()),
        }
    }

    /// Returns the option data bytes (without code and length).
    pub fn data(&self) -> Vec<u8> {
        match self {
            Self::Hostname(name) => name.as_bytes().to_vec(),
            Self::LeaseTime(seconds) => seconds.to_be_bytes().to_vec(),
            Self::Unknown(_, data) => data.clone(),
        }
    }
}
