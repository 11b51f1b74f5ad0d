//! End-to-end submit / work / poll flows against in-process components.

mod helpers;

use helpers::{CACHE_TTL, Harness};
use hotquery::query::{CallerTier, PollOutcome, SubmitOutcome};
use hotquery::queue::{Priority, WorkQueue};
use std::time::Duration;
use tokio::sync::broadcast;

fn pending(outcome: &SubmitOutcome) -> (&str, bool) {
    match outcome {
        SubmitOutcome::Pending {
            req_id, enqueued, ..
        } => (req_id.as_str(), *enqueued),
        other => panic!("expected pending, got {other:?}"),
    }
}

#[tokio::test]
async fn weather_scenario() {
    let h = Harness::new().await;

    // First caller starts the work, second joins it.
    let first = h.coordinator.submit("weather", CallerTier::Anonymous).await.unwrap();
    let second = h.coordinator.submit("weather", CallerTier::Anonymous).await.unwrap();
    let (first_id, first_enqueued) = pending(&first);
    let (second_id, second_enqueued) = pending(&second);
    assert!(first_enqueued);
    assert!(!second_enqueued);
    assert_ne!(first_id, second_id);
    assert_eq!(h.queue.len(), 1);

    assert!(matches!(
        h.coordinator.poll(first_id).await.unwrap(),
        PollOutcome::Loading { progress: 70 }
    ));

    assert_eq!(h.drain_queue().await, 1);
    assert_eq!(h.search.calls(), 1);

    // Both handles resolve to the same result.
    for id in [first_id, second_id] {
        match h.coordinator.poll(id).await.unwrap() {
            PollOutcome::Ready { payload } => {
                assert_eq!(payload[0]["hotitem"]["title"], "weather today");
                assert_eq!(payload.as_array().unwrap().len(), 2);
            }
            other => panic!("expected ready, got {other:?}"),
        }
    }

    // Later callers are served from cache without new work.
    let third = h.coordinator.submit("weather", CallerTier::Anonymous).await.unwrap();
    assert!(matches!(third, SubmitOutcome::Ready { .. }));
    assert_eq!(h.queue.stats().published, 1);
    assert_eq!(h.queue.stats().acked, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_submits_enqueue_exactly_once() {
    let h = Harness::new().await;
    let coordinator = h.coordinator.clone();

    let submits = (0..64).map(|_| {
        let coordinator = coordinator.clone();
        tokio::spawn(async move { coordinator.submit("storm", CallerTier::Anonymous).await })
    });
    let outcomes = futures::future::join_all(submits).await;

    let enqueued = outcomes
        .iter()
        .map(|joined| joined.as_ref().unwrap().as_ref().unwrap())
        .filter(|outcome| matches!(outcome, SubmitOutcome::Pending { enqueued: true, .. }))
        .count();
    assert_eq!(enqueued, 1);
    assert_eq!(h.queue.stats().published, 1);
    // Everyone else joined the same work rather than racing past it.
    assert!(outcomes.iter().all(|joined| matches!(
        joined.as_ref().unwrap().as_ref().unwrap(),
        SubmitOutcome::Pending { .. }
    )));
}

#[tokio::test]
async fn distinct_keywords_are_independent() {
    let h = Harness::new().await;
    for keyword in ["storm", "flood", "heat"] {
        let outcome = h.coordinator.submit(keyword, CallerTier::Anonymous).await.unwrap();
        assert!(pending(&outcome).1);
    }
    assert_eq!(h.queue.len(), 3);
    assert_eq!(h.drain_queue().await, 3);
    assert_eq!(h.search.calls(), 3);
}

#[tokio::test(start_paused = true)]
async fn expired_cache_is_recomputed() {
    let h = Harness::new().await;
    h.coordinator.submit("weather", CallerTier::Anonymous).await.unwrap();
    h.drain_queue().await;
    assert!(matches!(
        h.coordinator.submit("weather", CallerTier::Anonymous).await.unwrap(),
        SubmitOutcome::Ready { .. }
    ));

    tokio::time::advance(CACHE_TTL + Duration::from_secs(1)).await;

    let again = h.coordinator.submit("weather", CallerTier::Anonymous).await.unwrap();
    assert!(pending(&again).1, "an expired entry triggers new work");
    h.drain_queue().await;
    assert_eq!(h.search.calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn expired_handle_is_not_found() {
    let h = Harness::new().await;
    let outcome = h.coordinator.submit("weather", CallerTier::Anonymous).await.unwrap();
    let (req_id, _) = pending(&outcome);

    tokio::time::advance(helpers::REQUEST_TTL + Duration::from_secs(1)).await;

    assert_eq!(h.coordinator.poll(req_id).await.unwrap(), PollOutcome::NotFound);
}

#[tokio::test]
async fn privileged_work_is_served_first() {
    let h = Harness::new().await;
    h.coordinator.submit("routine", CallerTier::Anonymous).await.unwrap();
    h.coordinator.submit("urgent", CallerTier::Privileged).await.unwrap();

    let first = h.queue.receive(Duration::from_millis(10)).await.unwrap().unwrap();
    assert_eq!(first.item.keyword, "urgent");
    assert_eq!(first.item.priority, Priority::ELEVATED);
}

#[tokio::test]
async fn running_pool_resolves_polls() {
    let h = Harness::new().await;
    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let pool = tokio::spawn(h.workers.clone().run(shutdown_rx));

    let outcome = h.coordinator.submit("eclipse", CallerTier::Authenticated).await.unwrap();
    let (req_id, _) = pending(&outcome);

    let mut last = PollOutcome::NotFound;
    for _ in 0..200 {
        let polled = h.coordinator.poll(req_id).await.unwrap();
        // Progress never moves backwards.
        assert!(polled.rank() >= last.rank(), "{polled:?} after {last:?}");
        last = polled;
        if last.is_terminal() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(matches!(last, PollOutcome::Ready { .. }), "got {last:?}");

    shutdown_tx.send(()).unwrap();
    pool.await.unwrap();
    assert_eq!(h.queue.inflight(), 0);
}
