//! Replica set changes as seen through the router and the query flow.

mod helpers;

use helpers::{Harness, PRIMARY, REPLICAS};
use hotquery::query::{CallerTier, PollOutcome, SubmitOutcome};
use hotquery::replica::RefreshOutcome;
use hotquery::router::REPLICAS_SERVICE;
use hotquery::state::ServiceStatus;
use std::time::Duration;
use tokio::sync::broadcast;

#[tokio::test]
async fn reads_fall_back_when_replicas_disappear() {
    let h = Harness::new().await;
    h.coordinator.submit("weather", CallerTier::Anonymous).await.unwrap();
    h.drain_queue().await;

    h.topology.set_replicas(Vec::new());
    assert_eq!(
        h.router.monitor().refresh().await.unwrap(),
        RefreshOutcome::Swapped {
            replicas: 0,
            primary_changed: false
        }
    );

    // Cached results are still served, now from the primary.
    let outcome = h.coordinator.submit("weather", CallerTier::Anonymous).await.unwrap();
    assert!(matches!(outcome, SubmitOutcome::Ready { .. }));
    assert!(h.router.is_degraded());
    assert!(h.router.degraded_reads() >= 1);
    assert_eq!(
        h.router.statuses().get(REPLICAS_SERVICE),
        Some(ServiceStatus::Degraded)
    );
}

#[tokio::test]
async fn unreachable_candidates_keep_the_previous_set() {
    let h = Harness::new().await;
    for replica in REPLICAS {
        h.cluster.set_reachable(replica, false);
    }

    assert_eq!(
        h.router.monitor().refresh().await.unwrap(),
        RefreshOutcome::Retained { listed: 2 }
    );
    assert_eq!(h.router.replica_count().await, 2);
}

#[tokio::test]
async fn coordinator_outage_keeps_the_previous_set() {
    let h = Harness::new().await;
    h.topology.set_available(false);

    assert!(h.router.monitor().refresh().await.is_err());
    assert_eq!(h.router.replica_count().await, 2);
    assert!(!h.router.read().await.is_fallback());
}

#[tokio::test]
async fn reads_in_flight_survive_a_routine_refresh() {
    let h = Harness::new().await;
    h.coordinator.submit("weather", CallerTier::Anonymous).await.unwrap();
    h.drain_queue().await;

    let route = h.router.read().await;
    assert!(!route.is_fallback());
    h.router.monitor().refresh().await.unwrap();

    assert!(route.get("anything").await.is_ok());
    let outcome = h.coordinator.submit("weather", CallerTier::Anonymous).await.unwrap();
    assert!(matches!(outcome, SubmitOutcome::Ready { .. }));
}

#[tokio::test]
async fn partial_outage_drops_only_dead_replicas() {
    let h = Harness::new().await;
    h.cluster.set_reachable(REPLICAS[0], false);
    h.router.monitor().refresh().await.unwrap();

    for _ in 0..20 {
        assert_eq!(h.router.read().await.addr(), REPLICAS[1]);
    }
}

#[tokio::test]
async fn primary_failover_moves_writes() {
    let h = Harness::new().await;
    let promoted = "10.0.0.9:6379";
    h.cluster.add_node(promoted);

    h.topology.set_primary(promoted);
    h.topology.set_replicas(Vec::new());
    let outcome = h.router.monitor().refresh().await.unwrap();
    assert_eq!(
        outcome,
        RefreshOutcome::Swapped {
            replicas: 0,
            primary_changed: true
        }
    );
    assert_eq!(h.router.write().await.addr(), promoted);

    // New work lands on the promoted primary and resolves there.
    let submitted = h.coordinator.submit("failover", CallerTier::Anonymous).await.unwrap();
    let SubmitOutcome::Pending { req_id, .. } = submitted else {
        panic!("expected pending");
    };
    h.drain_queue().await;
    assert!(matches!(
        h.coordinator.poll(&req_id).await.unwrap(),
        PollOutcome::Ready { .. }
    ));
}

#[tokio::test]
async fn unreachable_new_primary_is_not_adopted() {
    let h = Harness::new().await;
    h.topology.set_primary("10.0.0.99:6379");
    h.router.monitor().refresh().await.unwrap();
    assert_eq!(h.router.write().await.addr(), PRIMARY);
}

#[tokio::test]
async fn replicas_return_after_degraded_period() {
    let h = Harness::with_replicas(&[]).await;
    assert!(h.router.read().await.is_fallback());

    h.topology.set_replicas(REPLICAS.iter().map(|r| (*r).to_owned()).collect());
    h.router.monitor().refresh().await.unwrap();

    assert!(!h.router.read().await.is_fallback());
    assert!(!h.router.is_degraded());
    assert_eq!(
        h.router.statuses().get(REPLICAS_SERVICE),
        Some(ServiceStatus::Active)
    );
}

#[tokio::test(start_paused = true)]
async fn monitor_loop_picks_up_changes() {
    let h = Harness::new().await;
    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let interval = Duration::from_secs(30);
    let task = tokio::spawn(h.router.monitor().clone().run(interval, shutdown_rx));

    h.topology.set_replicas(vec![REPLICAS[0].to_owned()]);
    tokio::time::sleep(interval + Duration::from_secs(1)).await;
    assert_eq!(h.router.replica_count().await, 1);

    shutdown_tx.send(()).unwrap();
    task.await.unwrap();
}
