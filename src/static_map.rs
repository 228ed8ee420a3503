//! Deterministic MAC-to-IP mapping.
//!
//! A hardware address whose first two octets equal the configured
//! [`MacPrefix`] carries its IPv4 address in the remaining four octets:
//! `02:00:c0:a8:01:07` maps to `192.168.1.7` under prefix `02:00`.
//!
//! Derivation only proposes an address. The engine still has to reserve it
//! in the [`AddressPool`](crate::pool::AddressPool).

use std::collections::HashSet;
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use crate::error::{Error, Result};
use crate::lease::encode_client_id;
use crate::pool::AddressRange;

/// Length of a hardware address eligible for mapping (EUI-48).
const MAC_LEN: usize = 6;

/// Two-octet hardware address prefix, written `XX:XX`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MacPrefix(pub [u8; 2]);

impl Default for MacPrefix {
    fn default() -> Self {
        Self([0x02, 0x00])
    }
}

impl FromStr for MacPrefix {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || Error::InvalidConfig(format!("invalid MAC prefix format: {:?}", s));

        let (first, second) = s.split_once(':').ok_or_else(invalid)?;
        let parse_octet = |part: &str| {
            if part.len() != 2 || !part.bytes().all(|byte| byte.is_ascii_hexdigit()) {
                return Err(invalid());
            }
            u8::from_str_radix(part, 16).map_err(|_| invalid())
        };

        Ok(Self([parse_octet(first)?, parse_octet(second)?]))
    }
}

impl fmt::Display for MacPrefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02x}:{:02x}", self.0[0], self.0[1])
    }
}

/// Maps prefixed hardware addresses onto pool addresses.
#[derive(Debug, Clone)]
pub struct StaticAddressDeriver {
    prefix: MacPrefix,
    range: AddressRange,
    excluded: HashSet<Ipv4Addr>,
}

impl StaticAddressDeriver {
    pub fn new(
        prefix: MacPrefix,
        range: AddressRange,
        excluded: impl IntoIterator<Item = Ipv4Addr>,
    ) -> Self {
        Self {
            prefix,
            range,
            excluded: excluded.into_iter().collect(),
        }
    }

    pub fn prefix(&self) -> MacPrefix {
        self.prefix
    }

    /// Derives the candidate address for `hardware_address`.
    ///
    /// Returns `Ok(None)` when the prefix does not match: the caller should
    /// fall through to pool allocation.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidHardwareAddress`] unless the address is 6 octets
    /// - [`Error::ExcludedAddress`] if the candidate is excluded
    /// - [`Error::AddressOutOfRange`] if the candidate is outside the range
    pub fn derive(&self, hardware_address: &[u8]) -> Result<Option<Ipv4Addr>> {
        let octets: &[u8; MAC_LEN] = hardware_address.try_into().map_err(|_| {
            Error::InvalidHardwareAddress(format!(
                "expected {} octets, got {} ({:?})",
                MAC_LEN,
                hardware_address.len(),
                encode_client_id(hardware_address)
            ))
        })?;

        if octets[..2] != self.prefix.0 {
            return Ok(None);
        }

        let ip = Ipv4Addr::new(octets[2], octets[3], octets[4], octets[5]);

        if self.excluded.contains(&ip) {
            return Err(Error::ExcludedAddress(ip));
        }

        if !self.range.contains(ip) {
            return Err(Error::AddressOutOfRange(ip));
        }

        Ok(Some(ip))
    }
}
