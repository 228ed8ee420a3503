//! Request and response objects exchanged with the hosting server.
//!
//! Packet framing lives outside this crate. The hosting server decodes a
//! packet into a [`DhcpRequest`], hands each handler in its chain the
//! request and the [`DhcpResponse`] built so far, and encodes whatever
//! comes back.

use std::net::Ipv4Addr;

use crate::options::{DhcpOption, OptionCode};

/// Longest hostname label kept from Option 12.
const MAX_HOSTNAME_LEN: usize = 63;

/// Strips a client-supplied hostname down to `[A-Za-z0-9.-]`, at most 63
/// characters.
pub fn sanitize_hostname(hostname: &str) -> String {
    hostname
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '.')
        .take(MAX_HOSTNAME_LEN)
        .collect()
}

/// The parts of a DHCPv4 request this engine consumes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DhcpRequest {
    /// Client hardware address (`chaddr`, trimmed to `hlen`).
    pub chaddr: Vec<u8>,
    pub options: Vec<DhcpOption>,
}

impl DhcpRequest {
    pub fn new(chaddr: impl Into<Vec<u8>>) -> Self {
        Self {
            chaddr: chaddr.into(),
            options: Vec::new(),
        }
    }

    pub fn with_hostname(mut self, hostname: impl Into<String>) -> Self {
        self.options.push(DhcpOption::Hostname(hostname.into()));
        self
    }

    /// Adds an option from the raw code and data bytes the server decoded.
    pub fn with_raw_option(mut self, code: u8, data: &[u8]) -> Self {
        self.options.push(DhcpOption::parse(code, data));
        self
    }

    /// Returns the client hostname (Option 12), sanitized. An option that
    /// sanitizes to nothing counts as absent.
    pub fn hostname(&self) -> Option<String> {
        self.options
            .iter()
            .find_map(|opt| match opt {
                DhcpOption::Hostname(name) => Some(sanitize_hostname(name)),
                _ => None,
            })
            .filter(|name| !name.is_empty())
    }
}

/// The response under construction.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DhcpResponse {
    /// Address assigned to the client (`yiaddr`). `None` leaves the field
    /// to downstream defaults.
    pub yiaddr: Option<Ipv4Addr>,
    pub options: Vec<DhcpOption>,
}

impl DhcpResponse {
    /// Adds `option`, replacing any existing option with the same code.
    pub fn update_option(&mut self, option: DhcpOption) {
        let code = option.option_code();
        match self.options.iter_mut().find(|opt| opt.option_code() == code) {
            Some(existing) => *existing = option,
            None => self.options.push(option),
        }
    }

    pub fn option(&self, code: u8) -> Option<&DhcpOption> {
        self.options.iter().find(|opt| opt.option_code() == code)
    }

    /// Returns every option as raw code and data, ready for the server to
    /// encode.
    pub fn raw_options(&self) -> Vec<(u8, Vec<u8>)> {
        self.options
            .iter()
            .map(|opt| (opt.option_code(), opt.data()))
            .collect()
    }

    /// Returns the lease time (Option 51) if present.
    pub fn lease_time(&self) -> Option<u32> {
        match self.option(OptionCode::LeaseTime as u8) {
            Some(DhcpOption::LeaseTime(seconds)) => Some(*seconds),
            _ => None,
        }
    }
}
