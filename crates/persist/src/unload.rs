//! Last-chance flushing before the host goes away.
//!
//! The host owns one [`UnloadGuard`] and calls [`UnloadGuard::before_unload`]
//! from its shutdown hook. Outstanding queue items are flushed in the
//! background and the host is told to hold the user back with a warning.
//! Failed flushes are logged and never retried.

use tracing::{debug, info, warn};

use crate::queue::{SaveOutcome, SaveQueueRegistry};
use crate::task::{self, TaskClass};

/// Warning shown while unsaved part state is being flushed.
pub const UNLOAD_WARNING: &str = "Your latest changes are still being saved. Leaving now may lose them.";

/// What the host should do with a pending unload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnloadDecision {
	/// Nothing outstanding; unload freely.
	Proceed,
	/// Writes were started; warn the user before unloading.
	Prompt {
		/// Message to show.
		message: &'static str,
	},
}

/// Summary of a [`UnloadGuard::drain`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
	/// Queues flushed successfully.
	pub flushed: usize,
	/// Queues whose flush failed.
	pub failed: usize,
}

/// Flushes outstanding queues when the host is about to exit.
#[derive(Debug, Clone)]
pub struct UnloadGuard {
	registry: SaveQueueRegistry,
}

impl UnloadGuard {
	/// Guards `registry`.
	pub fn new(registry: SaveQueueRegistry) -> Self {
		Self { registry }
	}

	/// Starts flushing outstanding work and tells the host whether to prompt.
	pub fn before_unload(&self) -> UnloadDecision {
		let outstanding = self.registry.outstanding();
		if outstanding == 0 {
			debug!("persist.unload.clean");
			return UnloadDecision::Proceed;
		}

		info!(queues = outstanding, "persist.unload.flush");
		let flush = self.registry.flush_all();
		task::spawn(TaskClass::Teardown, async move {
			report(&flush.await);
		});
		UnloadDecision::Prompt {
			message: UNLOAD_WARNING,
		}
	}

	/// Flushes outstanding work and waits for it to settle.
	pub async fn drain(&self) -> DrainReport {
		let outcomes = self.registry.flush_all().await;
		report(&outcomes)
	}
}

fn report(outcomes: &[SaveOutcome]) -> DrainReport {
	let mut summary = DrainReport::default();
	for outcome in outcomes {
		match outcome {
			Ok(_) => summary.flushed += 1,
			Err(err) => {
				warn!(error = %err, "persist.unload.flush_failed");
				summary.failed += 1;
			}
		}
	}
	summary
}

#[cfg(test)]
mod tests {
	use std::sync::Arc;
	use std::time::Duration;

	use pretty_assertions::assert_eq;
	use quire_api::memory::FaultPoint;
	use quire_api::{Error as ApiError, MemoryServer};
	use serde_json::json;

	use super::*;
	use crate::config::PersistConfig;

	fn guarded(server: &MemoryServer) -> (SaveQueueRegistry, UnloadGuard) {
		let registry = SaveQueueRegistry::new(Arc::new(server.client("learner")), PersistConfig::default());
		let guard = UnloadGuard::new(registry.clone());
		(registry, guard)
	}

	#[tokio::test(flavor = "current_thread", start_paused = true)]
	async fn nothing_outstanding_proceeds_without_writes() {
		let server = MemoryServer::new();
		let (_registry, guard) = guarded(&server);

		assert_eq!(guard.before_unload(), UnloadDecision::Proceed);
		tokio::time::sleep(Duration::from_millis(10)).await;
		assert!(server.calls().is_empty());
	}

	#[tokio::test(flavor = "current_thread", start_paused = true)]
	async fn outstanding_items_prompt_and_flush() {
		let server = MemoryServer::new();
		let (registry, guard) = guarded(&server);
		let saved = registry.enqueue_save("unit-1".into(), "attempt-1".into(), "part-1".into(), json!(1), false);

		assert_eq!(
			guard.before_unload(),
			UnloadDecision::Prompt {
				message: UNLOAD_WARNING
			}
		);
		assert!(saved.await.is_ok());
		assert_eq!(server.part_batches().len(), 1);
		assert_eq!(registry.outstanding(), 0);
	}

	#[tokio::test(flavor = "current_thread", start_paused = true)]
	async fn drain_counts_failures_without_retrying() {
		let server = MemoryServer::new();
		let (registry, guard) = guarded(&server);
		let _a = registry.enqueue_save("unit-1".into(), "attempt-1".into(), "part-1".into(), json!(1), false);
		let _b = registry.enqueue_save("unit-1".into(), "attempt-2".into(), "part-1".into(), json!(2), false);
		server.inject(FaultPoint::Write, ApiError::server(503, "unavailable"));

		assert_eq!(guard.drain().await, DrainReport { flushed: 1, failed: 1 });
		tokio::time::sleep(Duration::from_millis(10_000)).await;
		assert_eq!(server.part_batches().len(), 2);
		assert_eq!(registry.outstanding(), 1);
	}
}
