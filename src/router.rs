//! Read/write routing over the current replica set.

use crate::replica::{Endpoint, ReplicaSetMonitor};
use crate::state::{ServiceStatus, ServiceStatusRegistry};
use rand::Rng;
use std::ops::Deref;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tracing::{debug, info, warn};

/// Status registry entry reflecting whether reads are served by replicas.
pub const REPLICAS_SERVICE: &str = "replicas";

/// The endpoint chosen for one read.
#[derive(Debug, Clone)]
pub struct ReadRoute {
    endpoint: Endpoint,
    fallback: bool,
}

impl ReadRoute {
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// `true` when the replica set was empty and the read went to the primary.
    pub fn is_fallback(&self) -> bool {
        self.fallback
    }
}

impl Deref for ReadRoute {
    type Target = Endpoint;

    fn deref(&self) -> &Self::Target {
        &self.endpoint
    }
}

/// Sends writes to the primary and spreads reads uniformly over the replicas.
///
/// With no replicas, reads fall back to the primary. That is not an error,
/// but it is counted and reported as a degraded service state.
pub struct KeyValueRouter {
    monitor: Arc<ReplicaSetMonitor>,
    statuses: ServiceStatusRegistry,
    degraded: AtomicBool,
    degraded_reads: AtomicU64,
}

impl KeyValueRouter {
    pub fn new(monitor: Arc<ReplicaSetMonitor>, statuses: ServiceStatusRegistry) -> Self {
        statuses.set(REPLICAS_SERVICE, ServiceStatus::Active);
        Self {
            monitor,
            statuses,
            degraded: AtomicBool::new(false),
            degraded_reads: AtomicU64::new(0),
        }
    }

    pub fn monitor(&self) -> &Arc<ReplicaSetMonitor> {
        &self.monitor
    }

    pub fn statuses(&self) -> &ServiceStatusRegistry {
        &self.statuses
    }

    /// Pick an endpoint for a read from the current snapshot.
    pub async fn read(&self) -> ReadRoute {
        let set = self.monitor.snapshot().await;
        let replicas = set.replicas();

        if replicas.is_empty() {
            self.degraded_reads.fetch_add(1, Ordering::Relaxed);
            if !self.degraded.swap(true, Ordering::AcqRel) {
                warn!(
                    primary = set.primary().addr(),
                    "no replicas available, reads fall back to the primary"
                );
                self.statuses.set(REPLICAS_SERVICE, ServiceStatus::Degraded);
            }
            debug!(primary = set.primary().addr(), "degraded read");
            return ReadRoute {
                endpoint: set.primary().clone(),
                fallback: true,
            };
        }

        if self.degraded.swap(false, Ordering::AcqRel) {
            info!(replicas = replicas.len(), "replicas available again, leaving degraded mode");
            self.statuses.set(REPLICAS_SERVICE, ServiceStatus::Active);
        }

        let index = rand::rng().random_range(0..replicas.len());
        ReadRoute {
            endpoint: replicas[index].clone(),
            fallback: false,
        }
    }

    /// The primary, for every write.
    pub async fn write(&self) -> Endpoint {
        self.monitor.current_primary().await
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Acquire)
    }

    /// Number of reads that fell back to the primary since startup.
    pub fn degraded_reads(&self) -> u64 {
        self.degraded_reads.load(Ordering::Relaxed)
    }

    pub async fn replica_count(&self) -> usize {
        self.monitor.snapshot().await.replicas().len()
    }
}
