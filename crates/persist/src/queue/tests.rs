use std::time::Duration;

use pretty_assertions::assert_eq;
use quire_api::memory::FaultPoint;
use quire_api::{MemoryServer, WriteMode};
use serde_json::json;
use tokio::time::{Instant, sleep, sleep_until};

use super::*;
use crate::testing::RecordingListener;

fn registry(server: &MemoryServer) -> SaveQueueRegistry {
	SaveQueueRegistry::new(Arc::new(server.client("learner")), PersistConfig::default())
}

fn item(target: &str, payload: Value) -> PartStateItem {
	PartStateItem {
		target_id: target.into(),
		payload,
	}
}

fn batch(attempt: &str, items: Vec<PartStateItem>, finalize: bool) -> PartStateBatch {
	PartStateBatch {
		section_slug: "unit-1".into(),
		attempt_guid: attempt.into(),
		items,
		finalize,
	}
}

fn enqueue(
	registry: &SaveQueueRegistry,
	attempt: &str,
	target: &str,
	payload: Value,
) -> impl Future<Output = SaveOutcome> + Send + use<> {
	registry.enqueue_save("unit-1".into(), attempt.into(), target.into(), payload, false)
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn last_write_wins_per_target() {
	let server = MemoryServer::new();
	let registry = registry(&server);

	let first = enqueue(&registry, "attempt-1", "part-1", json!({ "answer": "a" }));
	let second = enqueue(&registry, "attempt-1", "part-1", json!({ "answer": "b" }));
	let third = enqueue(&registry, "attempt-1", "part-2", json!({ "answer": "c" }));
	assert_eq!(registry.queue_count(), 1);

	let outcomes = futures::future::join3(first, second, third).await;
	assert_eq!(outcomes, (Ok(SaveReceipt::default()), Ok(SaveReceipt::default()), Ok(SaveReceipt::default())));
	assert_eq!(
		server.part_batches(),
		vec![batch(
			"attempt-1",
			vec![item("part-1", json!({ "answer": "b" })), item("part-2", json!({ "answer": "c" }))],
			false
		)]
	);
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn enqueue_resolves_after_the_batch_lands() {
	let server = MemoryServer::new();
	let registry = registry(&server);
	let start = Instant::now();

	let outcome = enqueue(&registry, "attempt-1", "part-1", json!(1)).await;
	assert_eq!(outcome, Ok(SaveReceipt::default()));
	assert!(start.elapsed() >= Duration::from_millis(2000));
	assert!(start.elapsed() < Duration::from_millis(2100));
	assert_eq!(server.part_batches().len(), 1);
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn finalize_reaches_the_wire() {
	let server = MemoryServer::new();
	let registry = registry(&server);

	let outcome = registry
		.enqueue_save("unit-1".into(), "attempt-1".into(), "part-1".into(), json!("done"), true)
		.await;
	assert_eq!(outcome, Ok(SaveReceipt::default()));

	let batches = server.part_batches();
	assert_eq!(batches.len(), 1);
	assert_eq!(batches[0].mode(), WriteMode::Put);
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn inflight_queue_is_not_reused() {
	let server = MemoryServer::new();
	server.set_latency(Duration::from_millis(1000));
	let registry = registry(&server);

	let first = enqueue(&registry, "attempt-1", "part-1", json!("a"));
	sleep(Duration::from_millis(2500)).await;
	let busy = registry.queues();
	assert_eq!(busy.len(), 1);
	assert!(busy[0].is_inflight());

	let second = enqueue(&registry, "attempt-1", "part-2", json!("b"));
	assert_eq!(registry.queue_count(), 2);
	assert_eq!(busy[0].items(), vec![SaveQueueItem {
		target_id: "part-1".into(),
		payload: json!("a"),
	}]);

	assert_eq!(first.await, Ok(SaveReceipt::default()));
	assert_eq!(second.await, Ok(SaveReceipt::default()));
	assert_eq!(
		server.part_batches(),
		vec![
			batch("attempt-1", vec![item("part-1", json!("a"))], false),
			batch("attempt-1", vec![item("part-2", json!("b"))], false),
		]
	);
	assert_eq!(registry.queue_count(), 0);
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn failure_rejects_and_keeps_items() {
	let server = MemoryServer::new();
	server.inject(FaultPoint::Write, ApiError::server(500, "boom"));
	let registry = registry(&server);

	let outcome = enqueue(&registry, "attempt-1", "part-1", json!("a")).await;
	assert_eq!(outcome, Err(ApiError::server(500, "boom")));
	assert_eq!(registry.outstanding(), 1);
	assert_eq!(registry.queue_count(), 1);

	let outcomes = registry.flush_all().await;
	assert_eq!(outcomes, vec![Ok(SaveReceipt::default())]);
	assert_eq!(registry.outstanding(), 0);
	assert_eq!(server.part_batches().len(), 2);
	assert_eq!(server.part_batches()[1].items, vec![item("part-1", json!("a"))]);
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn flush_all_bypasses_the_quiet_period() {
	let server = MemoryServer::new();
	let registry = registry(&server);
	let start = Instant::now();

	let _one = enqueue(&registry, "attempt-1", "part-1", json!(1));
	let _two = enqueue(&registry, "attempt-2", "part-1", json!(2));
	sleep(Duration::from_millis(100)).await;

	let outcomes = registry.flush_all().await;
	assert_eq!(outcomes.len(), 2);
	assert!(outcomes.iter().all(Result::is_ok));
	assert!(start.elapsed() < Duration::from_millis(2000));

	sleep(Duration::from_millis(5000)).await;
	assert_eq!(server.part_batches().len(), 2);
	assert_eq!(registry.queue_count(), 0);
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn flush_all_skips_queues_in_flight() {
	let server = MemoryServer::new();
	server.set_latency(Duration::from_millis(1000));
	let registry = registry(&server);

	let _pending = enqueue(&registry, "attempt-1", "part-1", json!(1));
	sleep(Duration::from_millis(2500)).await;
	assert_eq!(registry.outstanding(), 1);
	assert_eq!(registry.flush_all().await, Vec::new());
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn idle_queue_is_reused_and_then_evicted() {
	let server = MemoryServer::new();
	let registry = registry(&server);

	let a = registry.get_or_create_queue("unit-1".into(), "attempt-1".into());
	let b = registry.get_or_create_queue("unit-1".into(), "attempt-1".into());
	assert!(Arc::ptr_eq(&a, &b));

	let outcome = enqueue(&registry, "attempt-1", "part-1", json!(1)).await;
	assert_eq!(outcome, Ok(SaveReceipt::default()));
	assert_eq!(registry.queue_count(), 0);
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn failed_write_never_overwrites_a_newer_payload() {
	let server = MemoryServer::new();
	server.set_latency(Duration::from_millis(1000));
	server.inject(FaultPoint::Write, ApiError::server(503, "unavailable"));
	let registry = registry(&server);
	let start = Instant::now();

	let stale = enqueue(&registry, "attempt-1", "part-1", json!("v1"));
	sleep_until(start + Duration::from_millis(2500)).await;
	let fresh = enqueue(&registry, "attempt-1", "part-1", json!("v2"));
	assert_eq!(registry.queue_count(), 2);

	assert_eq!(stale.await, Err(ApiError::server(503, "unavailable")));
	assert_eq!(fresh.await, Ok(SaveReceipt::default()));
	assert_eq!(registry.outstanding(), 0);

	let later = enqueue(&registry, "attempt-1", "part-2", json!("x"));
	assert_eq!(later.await, Ok(SaveReceipt::default()));
	assert_eq!(
		server.part_batches(),
		vec![
			batch("attempt-1", vec![item("part-1", json!("v1"))], false),
			batch("attempt-1", vec![item("part-1", json!("v2"))], false),
			batch("attempt-1", vec![item("part-2", json!("x"))], false),
		]
	);
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn superseded_item_settles_with_the_newer_write() {
	let server = MemoryServer::new();
	server.set_latency(Duration::from_millis(1000));
	server.inject(FaultPoint::Write, ApiError::server(503, "unavailable"));
	let registry = registry(&server);
	let start = Instant::now();

	let failed = enqueue(&registry, "attempt-1", "part-1", json!("v1"));
	sleep_until(start + Duration::from_millis(2500)).await;
	let replaced = enqueue(&registry, "attempt-1", "part-2", json!("y"));
	assert_eq!(failed.await, Err(ApiError::server(503, "unavailable")));

	sleep_until(start + Duration::from_millis(3100)).await;
	let newer = enqueue(&registry, "attempt-1", "part-2", json!("z"));

	assert_eq!(replaced.await, Ok(SaveReceipt::default()));
	assert_eq!(newer.await, Ok(SaveReceipt::default()));
	assert_eq!(
		server.part_batches(),
		vec![
			batch("attempt-1", vec![item("part-1", json!("v1"))], false),
			batch(
				"attempt-1",
				vec![item("part-1", json!("v1")), item("part-2", json!("z"))],
				false
			),
		]
	);
	sleep(Duration::from_millis(5000)).await;
	assert_eq!(registry.queue_count(), 0);
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn unused_queues_do_not_accumulate() {
	let server = MemoryServer::new();
	let registry = registry(&server);

	for attempt in 0..50 {
		let _ = registry.get_or_create_queue("unit-1".into(), format!("attempt-{attempt}").into());
	}
	sleep(Duration::from_secs(600)).await;

	assert_eq!(registry.queue_count(), 0);
	assert!(server.calls().is_empty());
}

#[test]
fn appending_to_a_pruned_queue_registers_it_again() {
	let server = MemoryServer::new();
	let registry = registry(&server);
	let queue = registry.get_or_create_queue("unit-1".into(), "attempt-1".into());
	assert_eq!(registry.queue_count(), 0);

	let _ = queue.append_item(SaveQueueItem {
		target_id: "part-1".into(),
		payload: json!(1),
	});
	assert_eq!(registry.queue_count(), 1);
	assert_eq!(registry.outstanding(), 1);
	assert!(Arc::ptr_eq(&registry.queues()[0], &queue));
}

#[test]
fn append_item_replaces_in_place() {
	let server = MemoryServer::new();
	let registry = registry(&server);
	let queue = registry.get_or_create_queue("unit-1".into(), "attempt-1".into());

	let _ = queue.append_item(SaveQueueItem {
		target_id: "part-1".into(),
		payload: json!(1),
	});
	let _ = queue.append_item(SaveQueueItem {
		target_id: "part-2".into(),
		payload: json!(2),
	});
	let _ = queue.append_item(SaveQueueItem {
		target_id: "part-1".into(),
		payload: json!(3),
	});

	let targets: Vec<_> = queue.items().into_iter().map(|item| (item.target_id, item.payload)).collect();
	assert_eq!(
		targets,
		vec![(TargetId::from("part-1"), json!(3)), (TargetId::from("part-2"), json!(2))]
	);
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn registry_listener_sees_queue_lifecycle() {
	let server = MemoryServer::new();
	let listener = RecordingListener::default();
	let registry = SaveQueueRegistry::with_listener(
		Arc::new(server.client("learner")),
		PersistConfig::default(),
		listener.shared(),
	);

	enqueue(&registry, "attempt-1", "part-1", json!(1)).await.unwrap();
	assert_eq!(
		listener.states(),
		vec![PersistenceState::Pending, PersistenceState::Inflight, PersistenceState::Idle]
	);
	assert_eq!(listener.successes(), 1);
}
