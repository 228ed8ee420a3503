//! Error types for the lease engine.
//!
//! All fallible operations in this crate return [`Result<T>`], which uses
//! the [`Error`] enum for error variants.

use std::net::Ipv4Addr;

/// Errors that can occur while configuring or running a lease engine.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// File system error from the lease store or the config file.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error (config or lease files).
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Invalid range configuration.
    ///
    /// Returned at construction time for a malformed or non-positive range,
    /// a malformed lease duration, exclusion entry or static-mapping prefix.
    /// The engine is never started.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Persisted state disagrees with the freshly built pool.
    ///
    /// Raised when a stored lease cannot be re-reserved at its own address
    /// or an excluded address cannot be pre-reserved. Startup must halt.
    #[error("Startup integrity check failed: {0}")]
    StartupIntegrity(String),

    /// The pool handed back a different address than the one requested.
    ///
    /// Static mapping requires the exact derived address, so the substitute
    /// is released and the request is dropped.
    #[error("Address {requested} is already allocated (pool offered {allocated})")]
    AllocationConflict {
        requested: Ipv4Addr,
        allocated: Ipv4Addr,
    },

    /// The IP address pool is exhausted.
    #[error("No available IP addresses in pool")]
    PoolExhausted,

    /// The client hardware address cannot be used for static mapping.
    #[error("Invalid hardware address: {0}")]
    InvalidHardwareAddress(String),

    /// A statically derived address is in the exclusion set.
    #[error("Address {0} is excluded from allocation")]
    ExcludedAddress(Ipv4Addr),

    /// Address is outside the configured pool range.
    #[error("Address {0} is outside the configured pool range")]
    AddressOutOfRange(Ipv4Addr),
}

/// A specialized Result type for lease operations.
pub type Result<T> = std::result::Result<T, Error>;
