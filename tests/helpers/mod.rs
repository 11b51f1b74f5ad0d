//! Shared fixtures: an in-process primary with replicas, a memory queue and a
//! scripted search backend.
#![allow(dead_code)]

use async_trait::async_trait;
use hotquery::query::{CacheAsideCoordinator, CoordinatorSettings};
use hotquery::queue::MemoryQueue;
use hotquery::replica::{AddressMap, MonitorSettings, ReplicaSetMonitor, StaticCoordinator};
use hotquery::router::KeyValueRouter;
use hotquery::search::{Document, SearchBackend, SearchError};
use hotquery::state::ServiceStatusRegistry;
use hotquery::store::MemoryCluster;
use hotquery::worker::{WorkerPool, WorkerSettings};
use serde_json::json;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

pub const PRIMARY: &str = "10.0.0.1:6379";
pub const REPLICAS: [&str; 2] = ["10.0.0.2:6379", "10.0.0.3:6379"];

pub const CACHE_TTL: Duration = Duration::from_secs(600);
pub const LOCK_TTL: Duration = Duration::from_secs(5);
pub const REQUEST_TTL: Duration = Duration::from_secs(300);

/// Answers every keyword with two documents titled after it, counting calls.
#[derive(Default)]
pub struct ScriptedSearch {
    pub calls: AtomicUsize,
}

impl ScriptedSearch {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SearchBackend for ScriptedSearch {
    async fn search(&self, keyword: &str) -> Result<Vec<Document>, SearchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok([
            json!({"hotitem": {"title": format!("{keyword} today"), "crawledat": 2_000}}),
            json!({"hotitem": {"title": format!("{keyword} tomorrow"), "crawledat": 1_000}}),
        ]
        .into_iter()
        .filter_map(Document::from_value)
        .collect())
    }
}

pub struct Harness {
    pub cluster: MemoryCluster,
    pub topology: StaticCoordinator,
    pub router: Arc<KeyValueRouter>,
    pub queue: Arc<MemoryQueue>,
    pub coordinator: Arc<CacheAsideCoordinator>,
    pub search: Arc<ScriptedSearch>,
    pub workers: Arc<WorkerPool>,
}

impl Harness {
    pub async fn new() -> Self {
        Self::with_replicas(&REPLICAS).await
    }

    pub async fn with_replicas(replicas: &[&str]) -> Self {
        let cluster = MemoryCluster::new();
        cluster.add_node(PRIMARY);
        for replica in REPLICAS {
            cluster.add_replica_of(replica, PRIMARY);
        }
        let topology = StaticCoordinator::new(
            PRIMARY,
            replicas.iter().map(|r| (*r).to_owned()).collect(),
        );

        let monitor = ReplicaSetMonitor::connect(
            MonitorSettings {
                group: "mymaster".into(),
                address_map: AddressMap::default(),
                probe_timeout: Duration::from_millis(200),
            },
            Arc::new(topology.clone()),
            Arc::new(cluster.clone()),
        )
        .await
        .expect("monitor connects");
        let router = Arc::new(KeyValueRouter::new(
            Arc::new(monitor),
            ServiceStatusRegistry::new(),
        ));

        let queue = Arc::new(MemoryQueue::new());
        let coordinator = Arc::new(CacheAsideCoordinator::new(
            router.clone(),
            queue.clone(),
            CoordinatorSettings {
                cache_ttl: CACHE_TTL,
                lock_ttl: LOCK_TTL,
                request_ttl: REQUEST_TTL,
                publish_timeout: Duration::from_secs(1),
            },
        ));
        let search = Arc::new(ScriptedSearch::default());
        let workers = Arc::new(WorkerPool::new(
            queue.clone(),
            router.clone(),
            search.clone(),
            WorkerSettings {
                concurrency: 4,
                search_timeout: Duration::from_secs(2),
                cache_ttl: CACHE_TTL,
                shutdown_timeout: Duration::from_secs(2),
            },
        ));

        Self {
            cluster,
            topology,
            router,
            queue,
            coordinator,
            search,
            workers,
        }
    }

    /// Hand every queued delivery to the worker pool, one at a time.
    pub async fn drain_queue(&self) -> usize {
        use hotquery::queue::WorkQueue;
        let mut processed = 0;
        while let Some(delivery) = self
            .queue
            .receive(Duration::from_millis(10))
            .await
            .expect("queue open")
        {
            self.workers.supervise(delivery).await;
            processed += 1;
        }
        processed
    }
}
