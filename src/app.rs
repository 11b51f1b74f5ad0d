use crate::config::{Config, QueueBackend};
use crate::latest::LatestFeed;
use crate::query::{CacheAsideCoordinator, CoordinatorSettings};
use crate::queue::{MemoryQueue, RedisQueue, WorkQueue};
use crate::replica::{
    Connector, FailoverCoordinator, MonitorSettings, RedisConnector, ReplicaSetMonitor,
    SentinelCoordinator, StaticCoordinator,
};
use crate::router::KeyValueRouter;
use crate::search::{HttpShard, SearchBackend, SearchShard, ShardedSearch};
use crate::state::{AppContext, ServiceStatus, ServiceStatusRegistry};
use crate::store::MemoryCluster;
use crate::store::redis_store::RedisOptions;
use crate::utils::fmt_duration;
use crate::web::create_router;
use crate::worker::{WorkerPool, WorkerSettings};
use anyhow::Context;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

const MEMORY_PRIMARY: &str = "memory-primary:0";
const MEMORY_REPLICA: &str = "memory-replica:0";

/// Main application struct containing all necessary components
pub struct App {
    config: Config,
    context: AppContext,
}

impl App {
    /// Connect to the store, open the queue and assemble every component.
    pub async fn new(config: Config) -> Result<Self, anyhow::Error> {
        config.validate().context("Invalid configuration")?;

        let statuses = ServiceStatusRegistry::new();
        statuses.set("monitor", ServiceStatus::Starting);

        let (coordinator, connector) = Self::store_backend(&config);
        let monitor = ReplicaSetMonitor::connect(
            MonitorSettings {
                group: config.master_name.clone(),
                address_map: config.address_map.clone(),
                probe_timeout: config.store_timeout,
            },
            coordinator,
            connector,
        )
        .await
        .context("Failed to connect to the store")?;
        let router = Arc::new(KeyValueRouter::new(Arc::new(monitor), statuses.clone()));
        statuses.set("monitor", ServiceStatus::Active);

        let queue = Self::open_queue(&config, &router).await?;
        let search = Self::search_backend(&config)?;

        let coordinator = Arc::new(CacheAsideCoordinator::new(
            router.clone(),
            queue.clone(),
            CoordinatorSettings {
                cache_ttl: config.cache_ttl,
                lock_ttl: config.lock_ttl,
                request_ttl: config.request_ttl,
                publish_timeout: config.publish_timeout,
            },
        ));
        let workers = Arc::new(WorkerPool::new(
            queue.clone(),
            router.clone(),
            search,
            WorkerSettings {
                concurrency: config.worker_concurrency,
                search_timeout: config.search_timeout,
                cache_ttl: config.cache_ttl,
                shutdown_timeout: config.shutdown_timeout,
            },
        ));
        let latest = Arc::new(LatestFeed::new(router.clone(), config.snapshot_ttl));

        Ok(App {
            context: AppContext {
                router,
                coordinator,
                queue,
                latest,
                workers,
                service_statuses: statuses,
            },
            config,
        })
    }

    pub fn context(&self) -> &AppContext {
        &self.context
    }

    /// Sentinel discovery, a fixed primary, or an in-process store.
    fn store_backend(config: &Config) -> (Arc<dyn FailoverCoordinator>, Arc<dyn Connector>) {
        let options = redis_options(config);

        if !config.sentinel_addrs.is_empty() {
            info!(
                sentinels = config.sentinel_addrs.len(),
                group = config.master_name.as_str(),
                "discovering store through sentinels"
            );
            return (
                Arc::new(SentinelCoordinator::new(
                    config.sentinel_addrs.clone(),
                    config.store_timeout,
                )),
                Arc::new(RedisConnector::new(options)),
            );
        }

        if let Some(primary) = &config.primary_addr {
            info!(
                primary = primary.as_str(),
                replicas = config.replica_addrs.len(),
                "using a fixed store topology"
            );
            return (
                Arc::new(StaticCoordinator::new(
                    primary.clone(),
                    config.replica_addrs.clone(),
                )),
                Arc::new(RedisConnector::new(options)),
            );
        }

        warn!("no store configured, running on an in-process store; data is lost on exit");
        let cluster = MemoryCluster::new();
        cluster.add_node(MEMORY_PRIMARY);
        cluster.add_replica_of(MEMORY_REPLICA, MEMORY_PRIMARY);
        (
            Arc::new(StaticCoordinator::new(
                MEMORY_PRIMARY,
                vec![MEMORY_REPLICA.to_owned()],
            )),
            Arc::new(cluster),
        )
    }

    async fn open_queue(
        config: &Config,
        router: &KeyValueRouter,
    ) -> Result<Arc<dyn WorkQueue>, anyhow::Error> {
        match config.queue_backend {
            QueueBackend::Memory => {
                info!("using the in-process work queue");
                Ok(Arc::new(MemoryQueue::new()))
            }
            QueueBackend::Redis => {
                let url = match &config.queue_url {
                    Some(url) => url.clone(),
                    None => redis_options(config).url_for(router.write().await.addr()),
                };
                let queue = RedisQueue::open(
                    &url,
                    &config.queue_name,
                    config.redis_pool_size,
                    config.store_timeout,
                )
                .context("Failed to open the work queue")?;

                match queue.recover_inflight().await {
                    Ok(0) => {}
                    Ok(n) => warn!(count = n, "requeued deliveries left unacknowledged by a previous run"),
                    Err(e) => warn!(error = %e, "failed to recover unacknowledged deliveries (non-fatal)"),
                }
                info!(queue = config.queue_name.as_str(), "work queue opened");
                Ok(Arc::new(queue))
            }
        }
    }

    fn search_backend(config: &Config) -> Result<Arc<dyn SearchBackend>, anyhow::Error> {
        if config.search_shards.is_empty() {
            warn!("no search shards configured, every search returns no results");
        }
        let shards = config
            .search_shards
            .iter()
            .map(|url| {
                HttpShard::new(url, config.search_timeout)
                    .map(|shard| Arc::new(shard) as Arc<dyn SearchShard>)
                    .with_context(|| format!("Failed to create search shard client for {url}"))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Arc::new(ShardedSearch::new(shards, config.search_limit)))
    }

    /// Run until a shutdown signal, then stop everything within `shutdown_timeout`.
    pub async fn run(self) -> ExitCode {
        let App { config, context } = self;
        let (shutdown_tx, _) = broadcast::channel::<()>(4);

        let monitor_task = tokio::spawn(
            context
                .router
                .monitor()
                .clone()
                .run(config.replica_refresh_interval, shutdown_tx.subscribe()),
        );

        let worker_task = tokio::spawn(context.workers.clone().run(shutdown_tx.subscribe()));
        context.service_statuses.set("workers", ServiceStatus::Active);

        let listener = match tokio::net::TcpListener::bind(("0.0.0.0", config.port)).await {
            Ok(listener) => listener,
            Err(e) => {
                error!(port = config.port, error = %e, "failed to bind web server");
                let _ = shutdown_tx.send(());
                Self::teardown(&context, vec![monitor_task, worker_task], config.shutdown_timeout).await;
                return ExitCode::FAILURE;
            }
        };
        info!(port = config.port, "web server listening");
        context.service_statuses.set("web", ServiceStatus::Active);

        let router = create_router(context.clone(), config.request_timeout);
        let mut web_shutdown = shutdown_tx.subscribe();
        let mut web_task = tokio::spawn(async move {
            axum::serve(listener, router)
                .with_graceful_shutdown(async move {
                    let _ = web_shutdown.recv().await;
                })
                .await
        });

        let exit_code = tokio::select! {
            _ = shutdown_signal() => {
                info!("shutdown signal received");
                ExitCode::SUCCESS
            }
            result = &mut web_task => {
                match result {
                    Ok(Ok(())) => warn!("web server stopped unexpectedly"),
                    Ok(Err(e)) => error!(error = %e, "web server failed"),
                    Err(e) => error!(error = %e, "web server task panicked"),
                }
                context.service_statuses.set("web", ServiceStatus::Error);
                ExitCode::FAILURE
            }
        };

        let _ = shutdown_tx.send(());
        let mut tasks = vec![monitor_task, worker_task];
        if !web_task.is_finished() {
            tasks.push(tokio::spawn(async move {
                let _ = web_task.await;
            }));
        }
        Self::teardown(&context, tasks, config.shutdown_timeout).await;
        exit_code
    }

    /// Wait for background tasks, then close the queue and every store connection.
    async fn teardown(context: &AppContext, tasks: Vec<JoinHandle<()>>, timeout: Duration) {
        let start = std::time::Instant::now();
        // Workers bound their own drain by the same timeout; leave a margin for the rest.
        let budget = timeout + Duration::from_secs(1);
        if tokio::time::timeout(budget, futures::future::join_all(tasks))
            .await
            .is_err()
        {
            warn!(timeout = fmt_duration(budget), "background tasks did not stop in time");
        }

        context.queue.close().await;
        context.router.monitor().close().await;
        info!(duration = fmt_duration(start.elapsed()), "shutdown complete");
    }
}

fn redis_options(config: &Config) -> RedisOptions {
    RedisOptions {
        password: config.redis_password.clone(),
        db: config.redis_db,
        pool_size: config.redis_pool_size,
        timeout: config.store_timeout,
    }
}

/// Resolves on SIGINT, or SIGTERM on unix.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Figment;
    use figment::providers::{Format, Toml};

    fn memory_config() -> Config {
        Figment::new()
            .merge(Toml::string("queue_backend = \"memory\"\nport = 0"))
            .extract()
            .unwrap()
    }

    #[tokio::test]
    async fn assembles_in_memory_mode() {
        let app = App::new(memory_config()).await.unwrap();
        let ctx = app.context();
        assert_eq!(ctx.router.replica_count().await, 1);
        assert_eq!(ctx.router.write().await.addr(), MEMORY_PRIMARY);
        assert_eq!(
            ctx.service_statuses.get("monitor"),
            Some(ServiceStatus::Active)
        );
    }

    #[tokio::test]
    async fn invalid_config_is_rejected() {
        let config: Config = Figment::new()
            .merge(Toml::string("queue_backend = \"memory\"\nworker_concurrency = 0"))
            .extract()
            .unwrap();
        assert!(App::new(config).await.is_err());
    }

    #[test]
    fn redis_url_carries_credentials() {
        let mut config = memory_config();
        config.redis_password = Some("hunter2".into());
        config.redis_db = 3;
        assert_eq!(
            redis_options(&config).url_for("10.0.0.1:6379"),
            "redis://:hunter2@10.0.0.1:6379/3"
        );
    }

    #[tokio::test]
    async fn shards_are_built_from_urls() {
        let mut config = memory_config();
        config.search_shards = vec![
            "http://search-1.internal:9200/hot".into(),
            "http://search-2.internal:9200/hot".into(),
        ];
        assert!(App::search_backend(&config).is_ok());
    }
}
