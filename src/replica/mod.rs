//! Primary/replica topology tracking.
//!
//! [`ReplicaSetMonitor`] asks a [`FailoverCoordinator`] where the primary and
//! replicas live, probes every candidate, and publishes the result as an
//! immutable [`ReplicaSet`] snapshot. Readers clone the current `Arc` under a
//! read lock; a refresh builds the next set off to the side and replaces the
//! `Arc` under the write lock, so no reader ever sees a half-built set.
//! Connections that fall out of the set are closed only after the swap.

pub mod connect;
pub mod discovery;

use crate::store::{KvStore, StoreError, with_deadline};
use crate::utils::fmt_duration;
use futures::future::join_all;
use std::fmt;
use std::ops::Deref;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock, broadcast};
use tracing::{debug, info, warn};

pub use self::connect::{AddressMap, Connector, RedisConnector};
pub use self::discovery::{FailoverCoordinator, SentinelCoordinator, StaticCoordinator};

#[derive(Debug, thiserror::Error)]
pub enum MonitorError {
    #[error("replica discovery failed: {0}")]
    Discovery(String),
    #[error("no primary connection could be established: {0}")]
    NoPrimary(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// One connected store endpoint.
#[derive(Clone)]
pub struct Endpoint {
    addr: Arc<str>,
    store: Arc<dyn KvStore>,
}

impl Endpoint {
    pub fn new(addr: &str, store: Arc<dyn KvStore>) -> Self {
        Self {
            addr: Arc::from(addr),
            store,
        }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn store(&self) -> &Arc<dyn KvStore> {
        &self.store
    }

    /// Whether both endpoints share the same underlying connection.
    pub fn same_connection(&self, other: &Endpoint) -> bool {
        Arc::ptr_eq(&self.store, &other.store)
    }
}

impl Deref for Endpoint {
    type Target = dyn KvStore;

    fn deref(&self) -> &Self::Target {
        self.store.as_ref()
    }
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Endpoint").field(&self.addr).finish()
    }
}

/// An immutable snapshot of the topology.
#[derive(Debug)]
pub struct ReplicaSet {
    primary: Endpoint,
    replicas: Vec<Endpoint>,
    generation: u64,
}

impl ReplicaSet {
    pub fn primary(&self) -> &Endpoint {
        &self.primary
    }

    pub fn replicas(&self) -> &[Endpoint] {
        &self.replicas
    }

    /// Incremented by every swap; the first set is generation 0.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    fn endpoints(&self) -> impl Iterator<Item = &Endpoint> {
        std::iter::once(&self.primary).chain(self.replicas.iter())
    }

    fn contains_connection(&self, endpoint: &Endpoint) -> bool {
        self.endpoints().any(|e| e.same_connection(endpoint))
    }

    fn endpoint_at(&self, addr: &str) -> Option<&Endpoint> {
        self.endpoints().find(|e| e.addr() == addr)
    }
}

/// Result of one [`ReplicaSetMonitor::refresh`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshOutcome {
    /// A new set was installed.
    Swapped {
        replicas: usize,
        primary_changed: bool,
    },
    /// The coordinator listed candidates but none answered; the previous set stays.
    Retained { listed: usize },
}

#[derive(Debug, Clone)]
pub struct MonitorSettings {
    /// Primary/replica group name known to the coordinator.
    pub group: String,
    pub address_map: AddressMap,
    /// Deadline for a trial connection to one candidate.
    pub probe_timeout: Duration,
}

pub struct ReplicaSetMonitor {
    settings: MonitorSettings,
    coordinator: Arc<dyn FailoverCoordinator>,
    connector: Arc<dyn Connector>,
    current: RwLock<Arc<ReplicaSet>>,
    /// Serializes refreshes so each one builds on the set it replaces.
    refreshing: Mutex<()>,
}

impl ReplicaSetMonitor {
    /// Connect to the primary and perform the initial replica discovery.
    ///
    /// Failing to reach the primary is fatal. Failing to list replicas is not:
    /// the monitor starts with an empty set and reads fall back to the primary.
    pub async fn connect(
        settings: MonitorSettings,
        coordinator: Arc<dyn FailoverCoordinator>,
        connector: Arc<dyn Connector>,
    ) -> Result<Self, MonitorError> {
        let primary_addr = coordinator
            .primary_addr(&settings.group)
            .await
            .map_err(|e| MonitorError::NoPrimary(e.to_string()))?;

        let monitor_probe = Prober {
            connector: connector.as_ref(),
            address_map: &settings.address_map,
            timeout: settings.probe_timeout,
            current: None,
        };
        let primary = monitor_probe
            .probe(&primary_addr)
            .await
            .map_err(|e| MonitorError::NoPrimary(format!("{primary_addr}: {e}")))?;

        let replicas = match coordinator.replica_addrs(&settings.group).await {
            Ok(listed) => monitor_probe.probe_all(&listed).await,
            Err(e) => {
                warn!(error = %e, "initial replica discovery failed, starting with no replicas");
                Vec::new()
            }
        };

        info!(
            group = settings.group.as_str(),
            primary = primary.addr(),
            replicas = replicas.len(),
            "connected to store"
        );

        let set = ReplicaSet {
            primary,
            replicas,
            generation: 0,
        };
        Ok(Self {
            settings,
            coordinator,
            connector,
            current: RwLock::new(Arc::new(set)),
            refreshing: Mutex::new(()),
        })
    }

    /// The current snapshot. Holding it never blocks a refresh.
    pub async fn snapshot(&self) -> Arc<ReplicaSet> {
        self.current.read().await.clone()
    }

    pub async fn current_primary(&self) -> Endpoint {
        self.snapshot().await.primary.clone()
    }

    pub async fn current_replicas(&self) -> Vec<Endpoint> {
        self.snapshot().await.replicas.clone()
    }

    fn prober<'a>(&'a self, current: &'a ReplicaSet) -> Prober<'a> {
        Prober {
            connector: self.connector.as_ref(),
            address_map: &self.settings.address_map,
            timeout: self.settings.probe_timeout,
            current: Some(current),
        }
    }

    /// Re-discover the topology and swap in a new set when it changed.
    ///
    /// A coordinator error leaves the current set untouched and is returned.
    /// An empty replica listing is authoritative and installs an empty set.
    /// Candidates that fail their probe are dropped; if every listed
    /// candidate fails, the previous replicas are kept.
    pub async fn refresh(&self) -> Result<RefreshOutcome, MonitorError> {
        let _serial = self.refreshing.lock().await;
        let start = Instant::now();

        let listed = self
            .coordinator
            .replica_addrs(&self.settings.group)
            .await?;
        let previous = self.snapshot().await;
        let probed = self.prober(&previous).probe_all(&listed).await;
        let new_primary = self.track_primary(&previous).await;

        let new_replicas = if listed.is_empty() || !probed.is_empty() {
            Some(probed)
        } else {
            warn!(
                listed = listed.len(),
                "no listed replica is reachable, keeping the previous set"
            );
            None
        };

        if new_replicas.is_none() && new_primary.is_none() {
            return Ok(RefreshOutcome::Retained {
                listed: listed.len(),
            });
        }

        let primary_changed = new_primary.is_some();
        let next = Arc::new(ReplicaSet {
            primary: new_primary.unwrap_or_else(|| previous.primary.clone()),
            replicas: new_replicas.unwrap_or_else(|| previous.replicas.clone()),
            generation: previous.generation + 1,
        });
        let replica_count = next.replicas.len();

        let retired = {
            let mut guard = self.current.write().await;
            std::mem::replace(&mut *guard, next.clone())
        };

        // Endpoints still listed were carried over as-is, so a reader holding
        // one keeps working; only connections that left the set are closed.
        for endpoint in retired.endpoints() {
            if !next.contains_connection(endpoint) {
                endpoint.close().await;
            }
        }

        debug!(
            generation = next.generation,
            replicas = replica_count,
            primary_changed,
            duration = fmt_duration(start.elapsed()),
            "replica set swapped"
        );
        Ok(RefreshOutcome::Swapped {
            replicas: replica_count,
            primary_changed,
        })
    }

    /// Probe the coordinator's primary when it differs from the current one.
    async fn track_primary(&self, previous: &ReplicaSet) -> Option<Endpoint> {
        let addr = match self.coordinator.primary_addr(&self.settings.group).await {
            Ok(addr) => addr,
            Err(e) => {
                warn!(error = %e, "primary lookup failed, keeping the current primary");
                return None;
            }
        };
        let translated = self.settings.address_map.translate(&addr);
        if translated == previous.primary.addr() {
            return None;
        }

        match self.prober(previous).probe(&addr).await {
            Ok(endpoint) => {
                warn!(
                    from = previous.primary.addr(),
                    to = endpoint.addr(),
                    "primary moved"
                );
                Some(endpoint)
            }
            Err(e) => {
                warn!(
                    candidate = translated,
                    error = %e,
                    "new primary is unreachable, keeping the current primary"
                );
                None
            }
        }
    }

    /// Refresh on `interval` until shutdown. Failures are logged and the previous set stays.
    pub async fn run(self: Arc<Self>, interval: Duration, mut shutdown_rx: broadcast::Receiver<()>) {
        info!(interval = fmt_duration(interval), "replica monitor started");

        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await; // skip the immediate first tick

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.refresh().await {
                        Ok(RefreshOutcome::Swapped { replicas, primary_changed }) => {
                            debug!(replicas, primary_changed, "replica refresh complete");
                        }
                        Ok(RefreshOutcome::Retained { listed }) => {
                            debug!(listed, "replica refresh retained previous set");
                        }
                        Err(e) => {
                            warn!(error = %e, "replica refresh failed, keeping previous set");
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("replica monitor received shutdown signal");
                    break;
                }
            }
        }
    }

    /// Close every connection in the current set.
    pub async fn close(&self) {
        let set = self.snapshot().await;
        for endpoint in set.endpoints() {
            endpoint.close().await;
        }
        info!(generation = set.generation, "store connections closed");
    }
}

struct Prober<'a> {
    connector: &'a dyn Connector,
    address_map: &'a AddressMap,
    timeout: Duration,
    /// Endpoints already connected; a candidate found here is pinged, not reopened.
    current: Option<&'a ReplicaSet>,
}

impl Prober<'_> {
    /// Translate, then ping the existing connection or open and ping a new one.
    async fn probe(&self, addr: &str) -> Result<Endpoint, StoreError> {
        let target = self.address_map.translate(addr);
        if let Some(existing) = self.current.and_then(|set| set.endpoint_at(target)) {
            with_deadline(self.timeout, existing.ping()).await?;
            return Ok(existing.clone());
        }

        let store = self.connector.connect(target).await?;
        match with_deadline(self.timeout, store.ping()).await {
            Ok(()) => Ok(Endpoint::new(target, store)),
            Err(e) => {
                store.close().await;
                Err(e)
            }
        }
    }

    /// Probe all candidates concurrently, keeping the ones that answer.
    async fn probe_all(&self, listed: &[String]) -> Vec<Endpoint> {
        let mut candidates: Vec<&str> = Vec::with_capacity(listed.len());
        for addr in listed {
            if !candidates.contains(&addr.as_str()) {
                candidates.push(addr.as_str());
            }
        }

        let results = join_all(candidates.iter().map(|addr| self.probe(addr))).await;
        candidates
            .into_iter()
            .zip(results)
            .filter_map(|(addr, result)| match result {
                Ok(endpoint) => Some(endpoint),
                Err(e) => {
                    debug!(candidate = addr, error = %e, "dropping unreachable replica");
                    None
                }
            })
            .collect()
    }
}
