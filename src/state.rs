//! Shared application context handed to the web binding and background tasks.

use crate::latest::LatestFeed;
use crate::query::CacheAsideCoordinator;
use crate::queue::WorkQueue;
use crate::router::KeyValueRouter;
use crate::worker::WorkerPool;
use dashmap::DashMap;
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;

/// Health status of a service.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ServiceStatus {
    Starting,
    Active,
    /// Running, but with reduced guarantees (e.g. reads served by the primary).
    Degraded,
    Disabled,
    Error,
}

/// A timestamped status entry for a service.
#[derive(Debug, Clone)]
pub struct StatusEntry {
    pub status: ServiceStatus,
    pub updated_at: Instant,
}

/// Thread-safe registry for services to self-report their health status.
#[derive(Debug, Clone, Default)]
pub struct ServiceStatusRegistry {
    inner: Arc<DashMap<String, StatusEntry>>,
}

impl ServiceStatusRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or updates the status for a named service.
    pub fn set(&self, name: &str, status: ServiceStatus) {
        self.inner.insert(
            name.to_owned(),
            StatusEntry {
                status,
                updated_at: Instant::now(),
            },
        );
    }

    pub fn get(&self, name: &str) -> Option<ServiceStatus> {
        self.inner.get(name).map(|entry| entry.status)
    }

    /// Seconds since the named service last changed status.
    pub fn age_secs(&self, name: &str) -> Option<u64> {
        self.inner
            .get(name)
            .map(|entry| entry.updated_at.elapsed().as_secs())
    }

    /// Snapshot of all statuses, sorted by service name.
    pub fn all(&self) -> Vec<(String, ServiceStatus)> {
        let mut all: Vec<_> = self
            .inner
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().status))
            .collect();
        all.sort_by(|a, b| a.0.cmp(&b.0));
        all
    }

    /// The worst status across services, `Active` when none are registered.
    pub fn overall(&self) -> ServiceStatus {
        self.inner
            .iter()
            .map(|entry| entry.value().status)
            .max_by_key(|status| severity(*status))
            .unwrap_or(ServiceStatus::Active)
    }
}

fn severity(status: ServiceStatus) -> u8 {
    match status {
        ServiceStatus::Active | ServiceStatus::Disabled => 0,
        ServiceStatus::Starting => 1,
        ServiceStatus::Degraded => 2,
        ServiceStatus::Error => 3,
    }
}

/// Everything a request handler needs, passed explicitly instead of through globals.
#[derive(Clone)]
pub struct AppContext {
    pub router: Arc<KeyValueRouter>,
    pub coordinator: Arc<CacheAsideCoordinator>,
    pub queue: Arc<dyn WorkQueue>,
    pub latest: Arc<LatestFeed>,
    pub workers: Arc<WorkerPool>,
    pub service_statuses: ServiceStatusRegistry,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overall_reports_worst_status() {
        let registry = ServiceStatusRegistry::new();
        assert_eq!(registry.overall(), ServiceStatus::Active);

        registry.set("web", ServiceStatus::Active);
        registry.set("replicas", ServiceStatus::Degraded);
        assert_eq!(registry.overall(), ServiceStatus::Degraded);

        registry.set("workers", ServiceStatus::Error);
        assert_eq!(registry.overall(), ServiceStatus::Error);
    }

    #[test]
    fn all_is_sorted_by_name() {
        let registry = ServiceStatusRegistry::new();
        registry.set("workers", ServiceStatus::Active);
        registry.set("replicas", ServiceStatus::Degraded);
        let names: Vec<String> = registry.all().into_iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["replicas", "workers"]);
    }

    #[test]
    fn set_overwrites() {
        let registry = ServiceStatusRegistry::new();
        registry.set("monitor", ServiceStatus::Starting);
        registry.set("monitor", ServiceStatus::Active);
        assert_eq!(registry.get("monitor"), Some(ServiceStatus::Active));
        assert_eq!(registry.age_secs("monitor"), Some(0));
    }
}
