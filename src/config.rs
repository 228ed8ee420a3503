//! Engine configuration.
//!
//! A [`Config`] file lists one [`RangeConfig`] per listening interface.
//! Each range is served by its own [`LeaseEngine`](crate::LeaseEngine) with
//! its own pool, lease table and lease file.
//!
//! A range can also be described by a single argument line, the form used
//! when the engine is wired into a handler chain:
//!
//! ```text
//! leases-eth0.json 192.168.1.2 192.168.1.254 3600s --excluded-ips 192.168.1.10 --mac2ip --mac2ip-prefix 02:00
//! ```

use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::TimeDelta;
use clap::Parser;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::pool::AddressRange;
use crate::static_map::MacPrefix;

const DEFAULT_MAC_PREFIX: &str = "02:00";

fn default_mac_prefix() -> String {
    DEFAULT_MAC_PREFIX.to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub ranges: Vec<RangeConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            ranges: vec![RangeConfig::new(
                "eth0",
                Ipv4Addr::new(192, 168, 1, 100),
                Ipv4Addr::new(192, 168, 1, 200),
                Duration::from_secs(3600),
                "leases-eth0.json",
            )],
        }
    }
}

impl Config {
    pub fn load_or_create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: Config = serde_json::from_str(&content)?;
            config.validate()?;
            Ok(config)
        } else {
            let config = Config::default();
            config.save(path)?;
            Ok(config)
        }
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        let mut interfaces = HashSet::new();
        let mut lease_files = HashSet::new();

        for range in &self.ranges {
            range.validate()?;

            if !interfaces.insert(range.interface.as_str()) {
                return Err(Error::InvalidConfig(format!(
                    "interface {} is configured more than once",
                    range.interface
                )));
            }
            if !lease_files.insert(range.leases_file.as_path()) {
                return Err(Error::InvalidConfig(format!(
                    "lease file {} is shared by more than one range",
                    range.leases_file.display()
                )));
            }
        }

        Ok(())
    }

    pub fn range(&self, interface: &str) -> Option<&RangeConfig> {
        self.ranges.iter().find(|range| range.interface == interface)
    }
}

/// Settings for one lease engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RangeConfig {
    /// Interface (or other label) this range serves.
    pub interface: String,
    pub range_start: Ipv4Addr,
    pub range_end: Ipv4Addr,
    /// Lease lifetime handed to clients. Zero means every request renews.
    #[serde(with = "humantime_serde")]
    pub lease_duration: Duration,
    /// Addresses never handed out dynamically.
    #[serde(default)]
    pub excluded_addresses: Vec<Ipv4Addr>,
    /// Derive addresses from prefixed hardware addresses.
    #[serde(default)]
    pub static_mapping: bool,
    /// Two-octet hardware prefix, `XX:XX`. Only read when `static_mapping`
    /// is set.
    #[serde(default = "default_mac_prefix")]
    pub static_mapping_prefix: String,
    /// Durable lease store location.
    pub leases_file: PathBuf,
}

impl RangeConfig {
    pub fn new(
        interface: impl Into<String>,
        range_start: Ipv4Addr,
        range_end: Ipv4Addr,
        lease_duration: Duration,
        leases_file: impl Into<PathBuf>,
    ) -> Self {
        Self {
            interface: interface.into(),
            range_start,
            range_end,
            lease_duration,
            excluded_addresses: Vec::new(),
            static_mapping: false,
            static_mapping_prefix: default_mac_prefix(),
            leases_file: leases_file.into(),
        }
    }

    /// Builds a range from a plugin argument list:
    /// `<leases_file> <start> <end> <lease_duration> [--excluded-ips a,b]
    /// [--mac2ip] [--mac2ip-prefix XX:XX]`.
    pub fn from_args<I, T>(interface: impl Into<String>, args: I) -> Result<Self>
    where
        I: IntoIterator<Item = T>,
        T: Into<std::ffi::OsString> + Clone,
    {
        let args = PluginArgs::try_parse_from(args)
            .map_err(|error| Error::InvalidConfig(error.to_string().trim().to_string()))?;

        if args.leases_file.is_empty() {
            return Err(Error::InvalidConfig("file name cannot be empty".to_string()));
        }

        let range_start = parse_ipv4(&args.range_start)?;
        let range_end = parse_ipv4(&args.range_end)?;
        AddressRange::new(range_start, range_end)?;

        let mut range = Self::new(
            interface,
            range_start,
            range_end,
            parse_lease_duration(&args.lease_duration)?,
            args.leases_file,
        );

        if let Some(excluded) = args.excluded_ips.as_deref()
            && !excluded.is_empty()
        {
            range.excluded_addresses = parse_excluded_addresses(excluded)?;
        }

        range.static_mapping = args.mac2ip;
        range.static_mapping_prefix = args.mac2ip_prefix;

        range.validate()?;
        Ok(range)
    }

    /// Splits an argument line on whitespace and delegates to
    /// [`RangeConfig::from_args`].
    pub fn from_arg_line(interface: impl Into<String>, line: &str) -> Result<Self> {
        Self::from_args(interface, line.split_whitespace())
    }

    pub fn validate(&self) -> Result<()> {
        self.address_range()?;
        self.lease_delta()?;
        self.mac_prefix()?;

        if self.leases_file.as_os_str().is_empty() {
            return Err(Error::InvalidConfig(format!(
                "leases_file for interface {} cannot be empty",
                self.interface
            )));
        }

        Ok(())
    }

    pub fn address_range(&self) -> Result<AddressRange> {
        AddressRange::new(self.range_start, self.range_end)
    }

    /// The static-mapping prefix, or `None` when static mapping is off.
    pub fn mac_prefix(&self) -> Result<Option<MacPrefix>> {
        if !self.static_mapping {
            return Ok(None);
        }
        self.static_mapping_prefix.parse().map(Some)
    }

    /// Lease duration rounded to whole seconds, as carried by option 51.
    pub fn lease_seconds(&self) -> Result<u32> {
        let seconds = self
            .lease_duration
            .saturating_add(Duration::from_millis(500))
            .as_secs();
        u32::try_from(seconds).map_err(|_| {
            Error::InvalidConfig(format!(
                "lease duration {} exceeds {} seconds",
                humantime::format_duration(self.lease_duration),
                u32::MAX
            ))
        })
    }

    pub fn lease_delta(&self) -> Result<TimeDelta> {
        let seconds = self.lease_seconds()?;
        Ok(TimeDelta::seconds(i64::from(seconds)))
    }
}

/// Argument form of a [`RangeConfig`].
#[derive(Parser, Debug)]
#[command(no_binary_name = true, disable_help_flag = true, disable_version_flag = true)]
struct PluginArgs {
    leases_file: String,
    range_start: String,
    range_end: String,
    lease_duration: String,

    /// Comma-separated list of excluded IP addresses
    #[arg(long = "excluded-ips")]
    excluded_ips: Option<String>,

    /// Enables MAC to IP address mapping
    #[arg(long)]
    mac2ip: bool,

    /// 2-byte MAC prefix for MAC to IP address mapping
    #[arg(long = "mac2ip-prefix", default_value = DEFAULT_MAC_PREFIX)]
    mac2ip_prefix: String,
}

fn parse_ipv4(value: &str) -> Result<Ipv4Addr> {
    value
        .trim()
        .parse()
        .map_err(|_| Error::InvalidConfig(format!("invalid IPv4 address: {:?}", value)))
}

/// Parses a comma-separated address list, e.g. `"10.0.0.1, 10.0.0.2"`.
pub fn parse_excluded_addresses(list: &str) -> Result<Vec<Ipv4Addr>> {
    list.split(',')
        .map(|entry| {
            parse_ipv4(entry).map_err(|_| {
                Error::InvalidConfig(format!("invalid excluded IP address: {:?}", entry.trim()))
            })
        })
        .collect()
}

/// Parses a lease duration such as `"1h"`, `"60s"` or `"0s"`.
pub fn parse_lease_duration(value: &str) -> Result<Duration> {
    humantime::parse_duration(value)
        .map_err(|error| Error::InvalidConfig(format!("invalid lease duration {:?}: {}", value, error)))
}
