use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;
use quire_api::memory::FaultPoint;
use quire_api::{MemoryServer, RevisionSlug};
use serde_json::json;
use tokio::time::sleep;

use super::*;
use crate::state::NoOpListener;
use crate::testing::{Event, RecordingListener};

fn project() -> ProjectSlug {
	"intro-course".into()
}

fn resource() -> ResourceId {
	"page-1".into()
}

fn coordinator(server: &MemoryServer, user: &str) -> LockCoordinator {
	LockCoordinator::new(Arc::new(server.client(user)))
}

async fn begin(server: &MemoryServer, user: &str, listener: SharedListener) -> Result<EditSession, EditDenied> {
	coordinator(server, user)
		.begin_edit(
			Arc::new(server.client(user)),
			project(),
			resource(),
			false,
			PersistConfig::default(),
			listener,
		)
		.await
}

#[tokio::test]
async fn acquire_and_release_round_trip() {
	let server = MemoryServer::new();
	let locks = coordinator(&server, "alice");

	assert_eq!(
		locks.acquire(&project(), &resource(), false).await,
		LockResult::Acquired { revision: None }
	);
	assert_eq!(server.lock_holder(&project(), &resource()), Some("alice".to_owned()));

	assert_eq!(locks.release(&project(), &resource()).await, LockResult::Released);
	assert_eq!(server.lock_holder(&project(), &resource()), None);
}

#[tokio::test]
async fn acquire_reports_current_holder() {
	let server = MemoryServer::new();
	coordinator(&server, "alice").acquire(&project(), &resource(), false).await;

	let result = coordinator(&server, "bob").acquire(&project(), &resource(), false).await;
	assert_eq!(
		result,
		LockResult::NotAcquired {
			user: "alice".to_owned()
		}
	);
	assert!(!result.is_acquired());
}

#[tokio::test]
async fn acquire_failure_becomes_server_error() {
	let server = MemoryServer::new();
	server.inject(FaultPoint::Acquire, ApiError::server(503, "unavailable"));

	let result = coordinator(&server, "alice").acquire(&project(), &resource(), false).await;
	assert_eq!(result, LockResult::ServerError(ApiError::server(503, "unavailable")));
}

#[tokio::test]
async fn release_fn_calls_the_server_once() {
	let server = MemoryServer::new();
	let locks = coordinator(&server, "alice");
	locks.acquire(&project(), &resource(), false).await;

	let release = locks.release_fn(project(), resource());
	assert_eq!(release().await, LockResult::Released);
	assert_eq!(server.release_count(&project(), &resource()), 1);
	assert_eq!(server.lock_holder(&project(), &resource()), None);
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn session_writes_after_quiet_period_and_releases_on_close() {
	let server = MemoryServer::new();
	let session = begin(&server, "alice", Arc::new(NoOpListener)).await.unwrap();

	session.save(json!({ "v": 1 }));
	sleep(Duration::from_millis(2100)).await;
	let saves = server.document_saves();
	assert_eq!(saves.len(), 1);
	assert_eq!(saves[0].content, json!({ "v": 1 }));
	assert!(!saves[0].release_lock);

	session.save(json!({ "v": 2 }));
	let outcome = session.close().await;
	assert_eq!(
		outcome,
		TeardownOutcome::Flushed(Ok(SaveReceipt {
			revision: Some(RevisionSlug("rev-2".to_owned()))
		}))
	);
	assert!(server.document_saves()[1].release_lock);
	assert_eq!(server.lock_holder(&project(), &resource()), None);
	assert_eq!(server.release_count(&project(), &resource()), 0);
}

#[tokio::test]
async fn denied_session_never_releases() {
	let server = MemoryServer::new();
	coordinator(&server, "alice").acquire(&project(), &resource(), false).await;

	let denied = begin(&server, "bob", Arc::new(NoOpListener)).await.unwrap_err();
	assert_eq!(
		denied,
		EditDenied::Locked {
			user: "alice".to_owned()
		}
	);
	assert_eq!(server.release_count(&project(), &resource()), 0);
	assert_eq!(server.lock_holder(&project(), &resource()), Some("alice".to_owned()));
}

#[tokio::test]
async fn failed_acquire_still_releases_once() {
	let server = MemoryServer::new();
	server.inject(FaultPoint::Acquire, ApiError::server(500, "boom"));

	let denied = begin(&server, "alice", Arc::new(NoOpListener)).await.unwrap_err();
	assert_eq!(denied, EditDenied::Server(ApiError::server(500, "boom")));
	assert_eq!(server.release_count(&project(), &resource()), 1);
}

#[tokio::test]
async fn session_exposes_fetched_revision() {
	let server = MemoryServer::new();
	server.seed_document(project(), resource(), json!({ "title": "Draft" }));

	let session = coordinator(&server, "alice")
		.begin_edit(
			Arc::new(server.client("alice")),
			project(),
			resource(),
			true,
			PersistConfig::default(),
			Arc::new(NoOpListener),
		)
		.await
		.unwrap();
	assert_eq!(session.revision(), Some(&json!({ "title": "Draft" })));
	let _ = session.close().await;
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn dropped_session_releases_the_lock() {
	let server = MemoryServer::new();
	let session = begin(&server, "alice", Arc::new(NoOpListener)).await.unwrap();

	drop(session);
	sleep(Duration::from_millis(1)).await;
	assert_eq!(server.release_count(&project(), &resource()), 1);
	assert_eq!(server.lock_holder(&project(), &resource()), None);
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn listener_sees_revision_of_routine_write() {
	let server = MemoryServer::new();
	let listener = RecordingListener::default();
	let session = begin(&server, "alice", listener.shared()).await.unwrap();

	session.save(json!({ "v": 1 }));
	sleep(Duration::from_millis(2100)).await;
	assert_eq!(
		listener.events(),
		vec![
			Event::State(PersistenceState::Pending),
			Event::State(PersistenceState::Inflight),
			Event::Success(SaveReceipt {
				revision: Some(RevisionSlug("rev-1".to_owned()))
			}),
			Event::State(PersistenceState::Idle),
		]
	);
	assert_eq!(session.state(), PersistenceState::Idle);
	let _ = session.close().await;
}
