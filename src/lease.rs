//! Lease records and the in-memory lease table.
//!
//! A [`Lease`] binds one client identity (hardware address) to one IPv4
//! address until `expires_at`. Leases are created on the first request from
//! an unseen client and afterwards only extended; this crate never reclaims
//! an address whose lease has lapsed.
//!
//! The [`LeaseTable`] is the authoritative runtime view. It carries no lock
//! of its own: the engine keeps it behind the same mutex as the address pool
//! and the store handle.

use std::collections::HashMap;
use std::net::Ipv4Addr;

use chrono::{DateTime, SubsecRound, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

/// Encodes a client ID as a colon-separated hex string for storage.
pub fn encode_client_id(client_id: &[u8]) -> String {
    client_id
        .iter()
        .map(|byte| format!("{:02x}", byte))
        .collect::<Vec<_>>()
        .join(":")
}

/// An active DHCP lease.
///
/// Leases are persisted by a [`LeaseStore`](crate::store::LeaseStore) and
/// restored on engine restart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    /// Client hardware address, encoded with [`encode_client_id`].
    pub client_id: String,

    /// The IP address assigned to this client.
    pub ip_address: Ipv4Addr,

    /// When this lease expires (UTC, whole seconds).
    pub expires_at: DateTime<Utc>,

    /// Client-provided hostname (Option 12), sanitized.
    #[serde(default)]
    pub hostname: Option<String>,
}

impl Lease {
    /// Creates a lease that expires `duration` after `now`.
    pub fn new(
        client_id: String,
        ip_address: Ipv4Addr,
        hostname: Option<String>,
        now: DateTime<Utc>,
        duration: TimeDelta,
    ) -> Self {
        Self {
            client_id,
            ip_address,
            expires_at: expiry_from(now, duration),
            hostname,
        }
    }

    /// Returns true if the lease has expired.
    pub fn is_expired(&self) -> bool {
        Utc::now() > self.expires_at
    }

    /// Returns seconds remaining until expiration, or 0 if expired.
    pub fn remaining_seconds(&self) -> i64 {
        let remaining = self.expires_at - Utc::now();
        remaining.num_seconds().max(0)
    }

    /// Extends the lease to `now + duration` if that is later than the
    /// current expiry.
    ///
    /// The comparison uses the exact target time; only the stored expiry is
    /// truncated to whole seconds. A stored expiry is therefore never later
    /// than the time it was computed from, and with a zero duration every
    /// later request renews.
    ///
    /// Returns `true` when the lease changed. A lease that already runs past
    /// the new expiry is left untouched, hostname included.
    pub fn extend(
        &mut self,
        hostname: Option<String>,
        now: DateTime<Utc>,
        duration: TimeDelta,
    ) -> bool {
        if self.expires_at >= now + duration {
            return false;
        }
        self.expires_at = expiry_from(now, duration);
        self.hostname = hostname;
        true
    }
}

fn expiry_from(now: DateTime<Utc>, duration: TimeDelta) -> DateTime<Utc> {
    (now + duration).trunc_subsecs(0)
}

/// Mapping from client identity to lease record.
#[derive(Debug, Default)]
pub struct LeaseTable {
    leases: HashMap<String, Lease>,
}

impl LeaseTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a table from records loaded out of a store.
    pub fn from_leases(leases: HashMap<String, Lease>) -> Self {
        Self { leases }
    }

    pub fn get(&self, client_id: &str) -> Option<&Lease> {
        self.leases.get(client_id)
    }

    pub fn get_mut(&mut self, client_id: &str) -> Option<&mut Lease> {
        self.leases.get_mut(client_id)
    }

    /// Inserts or replaces the lease for its client.
    pub fn put(&mut self, lease: Lease) {
        self.leases.insert(lease.client_id.clone(), lease);
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.leases.keys()
    }

    pub fn values(&self) -> impl Iterator<Item = &Lease> {
        self.leases.values()
    }

    pub fn len(&self) -> usize {
        self.leases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.leases.is_empty()
    }
}
