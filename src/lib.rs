//! # leasehold
//!
//! A DHCPv4 lease engine meant to sit inside a DHCP server's handler chain.
//! Packet framing and transport belong to the hosting server; this crate
//! decides which address a client gets and keeps that decision durable.
//!
//! ## Features
//!
//! - Bitmap address pool with exclusions and first-fit allocation
//! - Deterministic MAC-to-IP mapping for prefixed hardware addresses
//! - Lease renewal that never shortens an existing lease
//! - Crash-consistent JSON lease file, reconciled against the pool on startup
//! - One independent engine per configured range
//!
//! ## Quick Start
//!
//! ```no_run
//! use leasehold::{Config, DhcpRequest, DhcpResponse, Handler4, LeaseEngine};
//!
//! #[tokio::main]
//! async fn main() -> leasehold::Result<()> {
//!     let config = Config::load_or_create("config.json")?;
//!     let engine = LeaseEngine::new(config.ranges[0].clone()).await?;
//!
//!     let request = DhcpRequest::new(vec![0x02, 0x00, 0xc0, 0xa8, 0x01, 0x65]);
//!     let (response, _stop) = engine.handle(&request, DhcpResponse::default()).await;
//!     println!("{:?}", response.yiaddr);
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! - [`Config`] / [`RangeConfig`] - Ranges, lease duration, exclusions, static mapping
//! - [`AddressPool`] - Allocator over an [`AddressRange`]
//! - [`LeaseTable`] - In-memory view of client leases
//! - [`LeaseStore`] - Durable lease storage, [`JsonLeaseStore`] by default
//! - [`StaticAddressDeriver`] - MAC-to-IP mapping
//! - [`LeaseEngine`] - Ties the above together and implements [`Handler4`]

pub mod config;
pub mod engine;
pub mod error;
pub mod lease;
pub mod message;
pub mod options;
pub mod pool;
pub mod static_map;
pub mod store;

pub use config::{Config, RangeConfig};
pub use engine::{Assignment, Handler4, LeaseEngine, LeaseOutcome};
pub use error::{Error, Result};
pub use lease::{Lease, LeaseTable};
pub use message::{DhcpRequest, DhcpResponse};
pub use options::DhcpOption;
pub use pool::{AddressPool, AddressRange};
pub use static_map::{MacPrefix, StaticAddressDeriver};
pub use store::{JsonLeaseStore, LeaseStore};
