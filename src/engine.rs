//! The lease engine: one per configured range.
//!
//! On each request the engine resolves an address for the client's hardware
//! address, writes the lease through to the store and records it in the
//! lease table:
//!
//! 1. A client that already holds a lease gets the same address back. The
//!    lease is extended when `now + lease_duration` is later than its current
//!    expiry, and left alone otherwise.
//! 2. A new client first goes through the [`StaticAddressDeriver`] when
//!    static mapping is enabled. A derived address must be reserved exactly;
//!    if the pool hands back anything else, the substitute is released and
//!    the request fails with [`Error::AllocationConflict`].
//! 3. Without a derived address, the pool's lowest free address is used.
//!
//! A failed store write is logged and the grant still stands.
//!
//! # Thread Safety
//!
//! The pool, the table and the store handle live behind a single
//! [`Mutex`]. Every lease decision, including the store write, is one
//! critical section, so decisions for the same engine never interleave.
//! Throughput per range is bounded by the store's write latency. Separate
//! ranges use separate engines and never contend.
//!
//! # Startup
//!
//! Construction pre-reserves every in-range excluded address, loads the
//! store and re-reserves every persisted lease at its own address. Any
//! disagreement is [`Error::StartupIntegrity`] and the engine is not built.

use std::collections::HashSet;
use std::future::Future;
use std::net::Ipv4Addr;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::config::RangeConfig;
use crate::error::{Error, Result};
use crate::lease::{Lease, LeaseTable, encode_client_id};
use crate::message::{DhcpRequest, DhcpResponse};
use crate::options::DhcpOption;
use crate::pool::{AddressPool, AddressRange};
use crate::static_map::StaticAddressDeriver;
use crate::store::{JsonLeaseStore, LeaseStore};

/// A DHCPv4 handler in a server's handler chain.
///
/// A handler receives the request and the response built so far, and
/// returns the response together with a flag telling the server whether to
/// stop the chain and reply.
pub trait Handler4: Send + Sync {
    fn handle(
        &self,
        request: &DhcpRequest,
        response: DhcpResponse,
    ) -> impl Future<Output = (DhcpResponse, bool)> + Send;
}

/// What a lease decision did to the lease table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseOutcome {
    /// A new lease was created.
    Allocated,
    /// An existing lease was extended.
    Renewed,
    /// An existing lease already ran long enough.
    Unchanged,
}

/// The result of a successful lease decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Assignment {
    pub address: Ipv4Addr,
    /// Configured lease duration, which is what the client is told.
    pub lease_time: Duration,
    pub outcome: LeaseOutcome,
}

/// State guarded by the engine lock.
#[derive(Debug)]
struct EngineState<S> {
    table: LeaseTable,
    pool: AddressPool,
    store: S,
}

/// Lease allocation engine for one address range.
#[derive(Debug)]
pub struct LeaseEngine<S = JsonLeaseStore> {
    interface: String,
    range: AddressRange,
    lease_duration: Duration,
    lease_delta: TimeDelta,
    deriver: Option<StaticAddressDeriver>,
    state: Mutex<EngineState<S>>,
}

impl LeaseEngine<JsonLeaseStore> {
    /// Builds an engine backed by the JSON lease file named in `config`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] for a bad range configuration, an
    /// I/O or JSON error if the lease file cannot be opened, and
    /// [`Error::StartupIntegrity`] if reconciliation fails.
    pub async fn new(config: RangeConfig) -> Result<Self> {
        config.validate()?;
        let store = JsonLeaseStore::open(&config.leases_file).await?;
        info!(
            "{}: using lease file {}",
            config.interface,
            store.path().display()
        );
        Self::with_store(config, store).await
    }
}

impl<S: LeaseStore> LeaseEngine<S> {
    /// Builds an engine on top of an already opened store.
    pub async fn with_store(config: RangeConfig, mut store: S) -> Result<Self> {
        config.validate()?;
        let range = config.address_range()?;
        let lease_delta = config.lease_delta()?;
        let lease_duration = Duration::from_secs(u64::from(config.lease_seconds()?));
        let interface = config.interface.clone();

        let mut pool = AddressPool::new(range);
        reserve_excluded(&interface, &mut pool, &config.excluded_addresses)?;

        let leases = store.load_all().await?;
        info!("{}: loaded {} DHCPv4 leases", interface, leases.len());

        for (client_id, lease) in &leases {
            if *client_id != lease.client_id {
                return Err(Error::StartupIntegrity(format!(
                    "lease stored under {} belongs to {}",
                    client_id, lease.client_id
                )));
            }
            let reserved = pool.allocate(Some(lease.ip_address)).map_err(|error| {
                Error::StartupIntegrity(format!(
                    "failed to re-allocate leased IP {} for {}: {}",
                    lease.ip_address, client_id, error
                ))
            })?;
            if reserved != lease.ip_address {
                return Err(Error::StartupIntegrity(format!(
                    "allocator did not re-allocate leased IP {} for {} (got {})",
                    lease.ip_address, client_id, reserved
                )));
            }
        }

        let deriver = config.mac_prefix()?.map(|prefix| {
            StaticAddressDeriver::new(prefix, range, config.excluded_addresses.iter().copied())
        });

        info!(
            "{}: IP pool {} - {} ({} addresses, {} free), lease time {}s{}",
            interface,
            range.start(),
            range.end(),
            range.size(),
            pool.free_count(),
            lease_duration.as_secs(),
            deriver
                .as_ref()
                .map(|deriver| format!(", MAC2IP prefix {}", deriver.prefix()))
                .unwrap_or_default()
        );

        Ok(Self {
            interface,
            range,
            lease_duration,
            lease_delta,
            deriver,
            state: Mutex::new(EngineState {
                table: LeaseTable::from_leases(leases),
                pool,
                store,
            }),
        })
    }

    /// Resolves (and records) the lease for a hardware address.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidHardwareAddress`], [`Error::ExcludedAddress`] or
    ///   [`Error::AddressOutOfRange`] when static mapping rejects the client
    /// - [`Error::AllocationConflict`] when the derived address is taken
    /// - [`Error::PoolExhausted`] when no address is free
    pub async fn lease(
        &self,
        hardware_address: &[u8],
        hostname: Option<String>,
    ) -> Result<Assignment> {
        self.lease_at(hardware_address, hostname, Utc::now()).await
    }

    async fn lease_at(
        &self,
        hardware_address: &[u8],
        hostname: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<Assignment> {
        let client_id = encode_client_id(hardware_address);
        let mut guard = self.state.lock().await;
        let state = &mut *guard;

        if let Some(lease) = state.table.get_mut(&client_id) {
            if !lease.extend(hostname, now, self.lease_delta) {
                debug!(
                    "{}: lease of {} for MAC {} still valid until {}",
                    self.interface, lease.ip_address, client_id, lease.expires_at
                );
                return Ok(self.assignment(lease.ip_address, LeaseOutcome::Unchanged));
            }

            let lease = lease.clone();
            if let Err(error) = state.store.upsert(&lease).await {
                error!(
                    "{}: could not persist renewed lease for MAC {}: {}",
                    self.interface, client_id, error
                );
            }
            debug!(
                "{}: renewed {} for MAC {} until {}",
                self.interface, lease.ip_address, client_id, lease.expires_at
            );
            return Ok(self.assignment(lease.ip_address, LeaseOutcome::Renewed));
        }

        info!(
            "{}: MAC address {} is new, leasing new IPv4 address",
            self.interface, client_id
        );

        let candidate = match &self.deriver {
            Some(deriver) => {
                let candidate = deriver.derive(hardware_address)?;
                match candidate {
                    Some(ip) => info!(
                        "{}: MAC {} matches the prefix {}, trying to allocate IP {}",
                        self.interface,
                        client_id,
                        deriver.prefix(),
                        ip
                    ),
                    None => info!(
                        "{}: MAC {} does not match the prefix {}, providing conventional lease",
                        self.interface,
                        client_id,
                        deriver.prefix()
                    ),
                }
                candidate
            }
            None => None,
        };

        let address = state.pool.allocate(candidate)?;

        if let Some(requested) = candidate
            && address != requested
        {
            state.pool.free(address);
            return Err(Error::AllocationConflict {
                requested,
                allocated: address,
            });
        }

        let lease = Lease::new(client_id, address, hostname, now, self.lease_delta);
        if let Err(error) = state.store.upsert(&lease).await {
            error!(
                "{}: could not persist new lease of {} for MAC {}: {}",
                self.interface, address, lease.client_id, error
            );
        }
        state.table.put(lease);

        Ok(self.assignment(address, LeaseOutcome::Allocated))
    }

    fn assignment(&self, address: Ipv4Addr, outcome: LeaseOutcome) -> Assignment {
        Assignment {
            address,
            lease_time: self.lease_duration,
            outcome,
        }
    }

    /// Returns the lease held by a hardware address, if any.
    pub async fn get_lease(&self, hardware_address: &[u8]) -> Option<Lease> {
        let state = self.state.lock().await;
        state
            .table
            .get(&encode_client_id(hardware_address))
            .cloned()
    }

    /// Returns all leases (including expired ones), ordered by address.
    pub async fn list_leases(&self) -> Vec<Lease> {
        let state = self.state.lock().await;
        let mut leases: Vec<Lease> = state.table.values().cloned().collect();
        leases.sort_by_key(|lease| lease.ip_address);
        leases
    }

    /// Returns the count of unreserved addresses in the pool.
    pub async fn free_address_count(&self) -> u64 {
        self.state.lock().await.pool.free_count()
    }

    pub fn interface(&self) -> &str {
        &self.interface
    }

    pub fn range(&self) -> AddressRange {
        self.range
    }

    pub fn lease_duration(&self) -> Duration {
        self.lease_duration
    }

    /// Shuts the engine down and closes its store.
    pub async fn close(self) -> Result<()> {
        self.state.into_inner().store.close().await
    }
}

impl<S: LeaseStore> Handler4 for LeaseEngine<S> {
    /// Sets `yiaddr` and the lease time on success. On failure the response
    /// is returned untouched. The chain always stops here.
    async fn handle(
        &self,
        request: &DhcpRequest,
        mut response: DhcpResponse,
    ) -> (DhcpResponse, bool) {
        match self.lease(&request.chaddr, request.hostname()).await {
            Ok(assignment) => {
                response.yiaddr = Some(assignment.address);
                response.update_option(DhcpOption::lease_time(assignment.lease_time));
                info!(
                    "{}: found IP address {} for MAC {}",
                    self.interface,
                    assignment.address,
                    encode_client_id(&request.chaddr)
                );
            }
            Err(error) => {
                error!(
                    "{}: could not lease an address for MAC {}: {}",
                    self.interface,
                    encode_client_id(&request.chaddr),
                    error
                );
            }
        }
        (response, true)
    }
}

fn reserve_excluded(interface: &str, pool: &mut AddressPool, excluded: &[Ipv4Addr]) -> Result<()> {
    let range = pool.range();
    let mut seen = HashSet::new();

    for &ip in excluded {
        if !seen.insert(ip) {
            continue;
        }
        if !range.contains(ip) {
            warn!(
                "{}: excluded IP {} is not in the range, no pre-allocation needed",
                interface, ip
            );
            continue;
        }
        let reserved = pool.allocate(Some(ip)).map_err(|error| {
            Error::StartupIntegrity(format!("could not pre-allocate excluded IP {}: {}", ip, error))
        })?;
        if reserved != ip {
            return Err(Error::StartupIntegrity(format!(
                "could not pre-allocate excluded IP {} (got {})",
                ip, reserved
            )));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    /// In-memory store that can be told to fail writes and records how many
    /// writes overlap.
    #[derive(Debug, Default, Clone)]
    struct MemoryStore {
        leases: Arc<std::sync::Mutex<HashMap<String, Lease>>>,
        fail_writes: Arc<AtomicBool>,
        in_flight: Arc<AtomicUsize>,
        max_in_flight: Arc<AtomicUsize>,
        writes: Arc<AtomicUsize>,
    }

    impl MemoryStore {
        fn with_leases(leases: impl IntoIterator<Item = Lease>) -> Self {
            let store = Self::default();
            {
                let mut map = store.leases.lock().unwrap();
                for lease in leases {
                    map.insert(lease.client_id.clone(), lease);
                }
            }
            store
        }

        fn stored(&self, client_id: &str) -> Option<Lease> {
            self.leases.lock().unwrap().get(client_id).cloned()
        }
    }

    impl LeaseStore for MemoryStore {
        async fn load_all(&mut self) -> Result<HashMap<String, Lease>> {
            Ok(self.leases.lock().unwrap().clone())
        }

        async fn upsert(&mut self, lease: &Lease) -> Result<()> {
            let concurrent = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(concurrent, Ordering::SeqCst);
            tokio::task::yield_now().await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            self.writes.fetch_add(1, Ordering::SeqCst);

            if self.fail_writes.load(Ordering::SeqCst) {
                return Err(Error::Io(std::io::Error::other("disk full")));
            }
            self.leases
                .lock()
                .unwrap()
                .insert(lease.client_id.clone(), lease.clone());
            Ok(())
        }

        async fn close(self) -> Result<()> {
            Ok(())
        }
    }

    fn test_config(lease_duration: Duration) -> RangeConfig {
        RangeConfig::new(
            "test0",
            Ipv4Addr::new(192, 168, 1, 1),
            Ipv4Addr::new(192, 168, 1, 7),
            lease_duration,
            "unused.json",
        )
    }

    fn static_config(excluded: &[Ipv4Addr]) -> RangeConfig {
        RangeConfig {
            static_mapping: true,
            excluded_addresses: excluded.to_vec(),
            ..test_config(Duration::from_secs(3600))
        }
    }

    fn mac(last: u8) -> [u8; 6] {
        [0xff, 0x00, 0xc0, 0xa8, 0x01, last]
    }

    fn stored_lease(mac: &[u8], ip: Ipv4Addr) -> Lease {
        Lease::new(
            encode_client_id(mac),
            ip,
            None,
            Utc::now(),
            TimeDelta::hours(1),
        )
    }

    async fn test_engine(config: RangeConfig) -> (LeaseEngine<MemoryStore>, MemoryStore) {
        let store = MemoryStore::default();
        let engine = LeaseEngine::with_store(config, store.clone()).await.unwrap();
        (engine, store)
    }

    #[tokio::test]
    async fn test_first_fit_allocation() {
        let (engine, store) = test_engine(test_config(Duration::from_secs(3600))).await;

        let first = engine.lease(&mac(0x37), None).await.unwrap();
        assert_eq!(first.address, Ipv4Addr::new(192, 168, 1, 1));
        assert_eq!(first.lease_time, Duration::from_secs(3600));
        assert_eq!(first.outcome, LeaseOutcome::Allocated);

        let second = engine.lease(&mac(0x38), None).await.unwrap();
        assert_eq!(second.address, Ipv4Addr::new(192, 168, 1, 2));

        assert!(store.stored(&encode_client_id(&mac(0x37))).is_some());
        assert_eq!(engine.free_address_count().await, 5);
    }

    #[tokio::test]
    async fn test_repeat_request_returns_same_address() {
        let (engine, _store) = test_engine(test_config(Duration::from_secs(3600))).await;
        let client = mac(0x01);

        let first = engine.lease(&client, None).await.unwrap();
        let before = engine.get_lease(&client).await.unwrap();
        let second = engine.lease(&client, None).await.unwrap();
        let after = engine.get_lease(&client).await.unwrap();

        assert_eq!(first.address, second.address);
        assert!(after.expires_at >= before.expires_at);
        assert_eq!(engine.list_leases().await.len(), 1);
    }

    #[tokio::test]
    async fn test_renewal_extends_lease_and_updates_hostname() {
        let (engine, store) = test_engine(test_config(Duration::from_secs(3600))).await;
        let client = mac(0x01);
        let start = Utc::now();

        engine
            .lease_at(&client, Some("old".to_string()), start)
            .await
            .unwrap();
        let later = start + TimeDelta::minutes(30);
        let renewed = engine
            .lease_at(&client, Some("new".to_string()), later)
            .await
            .unwrap();
        assert_eq!(renewed.outcome, LeaseOutcome::Renewed);

        let lease = engine.get_lease(&client).await.unwrap();
        assert_eq!(lease.hostname.as_deref(), Some("new"));
        assert!(lease.expires_at >= later + TimeDelta::minutes(59));
        assert_eq!(store.stored(&lease.client_id), Some(lease));
    }

    #[tokio::test]
    async fn test_longer_existing_lease_is_not_shortened() {
        let client = mac(0x01);
        let now = Utc::now();
        let mut existing = stored_lease(&client, Ipv4Addr::new(192, 168, 1, 4));
        existing.expires_at = now + TimeDelta::hours(5);
        existing.hostname = Some("kept".to_string());
        let store = MemoryStore::with_leases([existing.clone()]);

        let engine = LeaseEngine::with_store(test_config(Duration::from_secs(3600)), store.clone())
            .await
            .unwrap();
        let assignment = engine
            .lease_at(&client, Some("ignored".to_string()), now)
            .await
            .unwrap();

        assert_eq!(assignment.address, existing.ip_address);
        assert_eq!(assignment.outcome, LeaseOutcome::Unchanged);
        assert_eq!(assignment.lease_time, Duration::from_secs(3600));
        assert_eq!(engine.get_lease(&client).await, Some(existing));
        assert_eq!(store.writes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_zero_duration_always_renews() {
        let (engine, store) = test_engine(test_config(Duration::ZERO)).await;
        let client = mac(0x01);
        let start = Utc::now();

        engine.lease_at(&client, None, start).await.unwrap();
        let renewed = engine
            .lease_at(&client, None, start + TimeDelta::seconds(5))
            .await
            .unwrap();

        assert_eq!(renewed.outcome, LeaseOutcome::Renewed);
        assert_eq!(renewed.lease_time, Duration::ZERO);
        assert_eq!(store.writes.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_zero_duration_renews_within_same_second() {
        let (engine, store) = test_engine(test_config(Duration::ZERO)).await;
        let client = mac(0x01);
        let start = DateTime::parse_from_rfc3339("2024-05-01T00:00:10.100Z")
            .unwrap()
            .with_timezone(&Utc);

        let first = engine
            .lease_at(&client, Some("a".to_string()), start)
            .await
            .unwrap();
        assert_eq!(first.outcome, LeaseOutcome::Allocated);

        let second = engine
            .lease_at(
                &client,
                Some("b".to_string()),
                start + TimeDelta::milliseconds(200),
            )
            .await
            .unwrap();

        assert_eq!(second.outcome, LeaseOutcome::Renewed);
        assert_eq!(second.address, first.address);
        assert_eq!(store.writes.load(Ordering::SeqCst), 2);
        let lease = engine.get_lease(&client).await.unwrap();
        assert_eq!(lease.hostname.as_deref(), Some("b"));
        assert_eq!(store.stored(&lease.client_id), Some(lease));
    }

    #[tokio::test]
    async fn test_exclusions_are_skipped() {
        let config = RangeConfig {
            excluded_addresses: vec![Ipv4Addr::new(192, 168, 1, 3), Ipv4Addr::new(192, 168, 1, 4)],
            ..test_config(Duration::ZERO)
        };
        let (engine, _store) = test_engine(config).await;

        let mut assigned = Vec::new();
        for index in 0..4 {
            assigned.push(engine.lease(&mac(index), None).await.unwrap().address);
        }

        assert_eq!(
            assigned,
            vec![
                Ipv4Addr::new(192, 168, 1, 1),
                Ipv4Addr::new(192, 168, 1, 2),
                Ipv4Addr::new(192, 168, 1, 5),
                Ipv4Addr::new(192, 168, 1, 6),
            ]
        );
    }

    #[tokio::test]
    async fn test_duplicate_and_out_of_range_exclusions() {
        let config = RangeConfig {
            excluded_addresses: vec![
                Ipv4Addr::new(192, 168, 1, 3),
                Ipv4Addr::new(192, 168, 1, 3),
                Ipv4Addr::new(192, 168, 1, 255),
            ],
            ..test_config(Duration::ZERO)
        };
        let (engine, _store) = test_engine(config).await;
        assert_eq!(engine.free_address_count().await, 6);
    }

    #[tokio::test]
    async fn test_static_mapping_exact_address() {
        let (engine, _store) = test_engine(static_config(&[])).await;

        let assignment = engine
            .lease(&[0x02, 0x00, 0xc0, 0xa8, 0x01, 0x07], None)
            .await
            .unwrap();
        assert_eq!(assignment.address, Ipv4Addr::new(192, 168, 1, 7));

        let conventional = engine.lease(&mac(0x01), None).await.unwrap();
        assert_eq!(conventional.address, Ipv4Addr::new(192, 168, 1, 1));
    }

    #[tokio::test]
    async fn test_static_mapping_conflict_rolls_back() {
        let (engine, store) = test_engine(static_config(&[])).await;

        for index in 0..5 {
            engine.lease(&mac(index), None).await.unwrap();
        }
        assert_eq!(engine.free_address_count().await, 2);

        let client = [0x02, 0x00, 0xc0, 0xa8, 0x01, 0x05];
        let result = engine.lease(&client, None).await;
        assert!(matches!(
            result,
            Err(Error::AllocationConflict { requested, allocated })
                if requested == Ipv4Addr::new(192, 168, 1, 5)
                    && allocated == Ipv4Addr::new(192, 168, 1, 6)
        ));

        assert_eq!(engine.free_address_count().await, 2);
        assert!(engine.get_lease(&client).await.is_none());
        assert!(store.stored(&encode_client_id(&client)).is_none());
    }

    #[tokio::test]
    async fn test_static_mapping_rejections() {
        let (engine, _store) = test_engine(static_config(&[Ipv4Addr::new(192, 168, 1, 3)])).await;

        let excluded = engine.lease(&[0x02, 0x00, 0xc0, 0xa8, 0x01, 0x03], None).await;
        assert!(matches!(excluded, Err(Error::ExcludedAddress(_))));

        let out_of_range = engine.lease(&[0x02, 0x00, 0xc0, 0xa8, 0x01, 0xff], None).await;
        assert!(matches!(out_of_range, Err(Error::AddressOutOfRange(_))));

        let invalid = engine.lease(&[0x02, 0x00], None).await;
        assert!(matches!(invalid, Err(Error::InvalidHardwareAddress(_))));

        assert_eq!(engine.free_address_count().await, 6);
        assert!(engine.list_leases().await.is_empty());
    }

    #[tokio::test]
    async fn test_pool_exhaustion() {
        let (engine, _store) = test_engine(test_config(Duration::from_secs(60))).await;
        for index in 0..7 {
            engine.lease(&mac(index), None).await.unwrap();
        }

        let result = engine.lease(&mac(0x10), None).await;
        assert!(matches!(result, Err(Error::PoolExhausted)));
    }

    #[tokio::test]
    async fn test_store_failure_still_grants_lease() {
        let (engine, store) = test_engine(test_config(Duration::from_secs(3600))).await;
        store.fail_writes.store(true, Ordering::SeqCst);

        let assignment = engine.lease(&mac(0x01), None).await.unwrap();
        assert_eq!(assignment.address, Ipv4Addr::new(192, 168, 1, 1));
        assert!(engine.get_lease(&mac(0x01)).await.is_some());
        assert!(store.stored(&encode_client_id(&mac(0x01))).is_none());

        let again = engine.lease(&mac(0x01), None).await.unwrap();
        assert_eq!(again.address, assignment.address);
    }

    #[tokio::test]
    async fn test_reconciliation_reserves_stored_addresses() {
        let store = MemoryStore::with_leases([
            stored_lease(&mac(0x01), Ipv4Addr::new(192, 168, 1, 1)),
            stored_lease(&mac(0x02), Ipv4Addr::new(192, 168, 1, 3)),
        ]);
        let engine = LeaseEngine::with_store(test_config(Duration::from_secs(3600)), store)
            .await
            .unwrap();

        assert_eq!(engine.free_address_count().await, 5);
        let fresh = engine.lease(&mac(0x03), None).await.unwrap();
        assert_eq!(fresh.address, Ipv4Addr::new(192, 168, 1, 2));
        let fresh = engine.lease(&mac(0x04), None).await.unwrap();
        assert_eq!(fresh.address, Ipv4Addr::new(192, 168, 1, 4));

        let restored = engine.lease(&mac(0x02), None).await.unwrap();
        assert_eq!(restored.address, Ipv4Addr::new(192, 168, 1, 3));
    }

    #[tokio::test]
    async fn test_duplicate_stored_address_is_fatal() {
        let store = MemoryStore::with_leases([
            stored_lease(&mac(0x01), Ipv4Addr::new(192, 168, 1, 2)),
            stored_lease(&mac(0x02), Ipv4Addr::new(192, 168, 1, 2)),
        ]);
        let result = LeaseEngine::with_store(test_config(Duration::from_secs(3600)), store).await;
        assert!(matches!(result, Err(Error::StartupIntegrity(_))));
    }

    #[tokio::test]
    async fn test_stored_address_outside_range_is_fatal() {
        let store = MemoryStore::with_leases([stored_lease(&mac(0x01), Ipv4Addr::new(10, 0, 0, 1))]);
        let result = LeaseEngine::with_store(test_config(Duration::from_secs(3600)), store).await;
        assert!(matches!(result, Err(Error::StartupIntegrity(_))));
    }

    #[tokio::test]
    async fn test_stored_address_now_excluded_is_fatal() {
        let store =
            MemoryStore::with_leases([stored_lease(&mac(0x01), Ipv4Addr::new(192, 168, 1, 3))]);
        let config = RangeConfig {
            excluded_addresses: vec![Ipv4Addr::new(192, 168, 1, 3)],
            ..test_config(Duration::from_secs(3600))
        };
        let result = LeaseEngine::with_store(config, store).await;
        assert!(matches!(result, Err(Error::StartupIntegrity(_))));
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let config = RangeConfig {
            range_start: Ipv4Addr::new(192, 168, 1, 9),
            ..test_config(Duration::from_secs(3600))
        };
        let result = LeaseEngine::with_store(config, MemoryStore::default()).await;
        assert!(matches!(result, Err(Error::InvalidConfig(_))));

        let config = RangeConfig {
            static_mapping_prefix: "zz".to_string(),
            ..static_config(&[])
        };
        let result = LeaseEngine::with_store(config, MemoryStore::default()).await;
        assert!(matches!(result, Err(Error::InvalidConfig(_))));
    }

    #[tokio::test]
    async fn test_handler_sets_address_and_lease_time() {
        let (engine, _store) = test_engine(test_config(Duration::from_secs(3600))).await;
        let request =
            DhcpRequest::new(mac(0x37).to_vec()).with_raw_option(12, b"printer");

        let mut response = DhcpResponse::default();
        response.update_option(DhcpOption::Unknown(1, vec![255, 255, 255, 0]));
        let (response, stop) = engine.handle(&request, response).await;

        assert!(stop);
        assert_eq!(response.yiaddr, Some(Ipv4Addr::new(192, 168, 1, 1)));
        assert_eq!(response.lease_time(), Some(3600));
        assert!(response.option(1).is_some());
        assert!(response.raw_options().contains(&(51, 3600u32.to_be_bytes().to_vec())));

        let lease = engine.get_lease(&mac(0x37)).await.unwrap();
        assert_eq!(lease.hostname.as_deref(), Some("printer"));
    }

    #[tokio::test]
    async fn test_handler_leaves_response_untouched_on_failure() {
        let (engine, _store) = test_engine(static_config(&[])).await;
        let request = DhcpRequest::new(vec![0x02, 0x00, 0x0a, 0x00, 0x00, 0x01]);

        let (response, stop) = engine.handle(&request, DhcpResponse::default()).await;

        assert!(stop);
        assert_eq!(response, DhcpResponse::default());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_requests_are_serialized() {
        let (engine, store) = test_engine(test_config(Duration::ZERO)).await;
        let engine = Arc::new(engine);

        let mut handles = vec![];
        for index in 0..7 {
            let engine = Arc::clone(&engine);
            handles.push(tokio::spawn(async move {
                let client = mac(index);
                let first = engine.lease(&client, None).await?;
                let second = engine.lease(&client, None).await?;
                assert_eq!(first.address, second.address);
                Ok::<_, Error>(first.address)
            }));
        }

        let mut allocated = HashSet::new();
        for handle in handles {
            let ip = handle.await.unwrap().unwrap();
            assert!(allocated.insert(ip), "Duplicate IP allocated: {}", ip);
            assert!(engine.range().contains(ip));
        }

        assert_eq!(allocated.len(), 7);
        assert_eq!(store.max_in_flight.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_close_closes_store() {
        let (engine, _store) = test_engine(test_config(Duration::from_secs(60))).await;
        assert_eq!(engine.interface(), "test0");
        assert_eq!(engine.lease_duration(), Duration::from_secs(60));
        engine.close().await.unwrap();
    }
}
