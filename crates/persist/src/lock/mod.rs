//! Resource edit locks and lock-backed editing sessions.
//!
//! [`LockCoordinator`] turns [`LockApi`] calls into [`LockResult`]s that never
//! fail at the type level: server errors become [`LockResult::ServerError`].
//! [`LockCoordinator::begin_edit`] pairs an acquired lock with a
//! [`DeferredStrategy`] whose teardown releases that lock exactly once.

use std::sync::Arc;

use futures::FutureExt;
use quire_api::{
	DocumentApi, DocumentSave, Error as ApiError, LockApi, LockRequest, LockResponse, ProjectSlug, ResourceId,
};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::PersistConfig;
use crate::state::{PersistenceState, SaveReceipt, SharedListener};
use crate::strategy::{DeferredStrategy, ReleaseFn, SaveFn, TeardownOutcome};

/// Outcome of a lock operation.
#[derive(Debug, Clone, PartialEq)]
pub enum LockResult {
	/// The caller holds the lock.
	Acquired {
		/// Latest revision, when it was requested and exists.
		revision: Option<Value>,
	},
	/// Another principal holds the lock.
	NotAcquired {
		/// The current holder.
		user: String,
	},
	/// The lock was released.
	Released,
	/// The call failed.
	ServerError(ApiError),
}

impl LockResult {
	/// Returns `true` for [`LockResult::Acquired`].
	pub fn is_acquired(&self) -> bool {
		matches!(self, Self::Acquired { .. })
	}

	/// Returns the revision carried by an acquire, if any.
	pub fn revision(&self) -> Option<&Value> {
		match self {
			Self::Acquired { revision } => revision.as_ref(),
			_ => None,
		}
	}
}

impl From<quire_api::Result<LockResponse>> for LockResult {
	fn from(result: quire_api::Result<LockResponse>) -> Self {
		match result {
			Ok(LockResponse::Acquired { revision }) => Self::Acquired { revision },
			Ok(LockResponse::NotAcquired { user }) => Self::NotAcquired { user },
			Ok(LockResponse::Released) => Self::Released,
			Err(err) => Self::ServerError(err),
		}
	}
}

/// Why [`LockCoordinator::begin_edit`] did not start a session.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum EditDenied {
	/// Someone else is editing.
	#[error("resource is being edited by {user}")]
	Locked {
		/// The current holder.
		user: String,
	},
	/// The lock call failed.
	#[error("lock request failed: {0}")]
	Server(ApiError),
}

/// Acquires and releases resource locks.
#[derive(Clone)]
pub struct LockCoordinator {
	api: Arc<dyn LockApi>,
}

impl std::fmt::Debug for LockCoordinator {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("LockCoordinator").finish_non_exhaustive()
	}
}

impl LockCoordinator {
	/// Creates a coordinator talking to `api`.
	pub fn new(api: Arc<dyn LockApi>) -> Self {
		Self { api }
	}

	/// Attempts to acquire the lock, optionally fetching the latest revision.
	pub async fn acquire(&self, project: &ProjectSlug, resource: &ResourceId, with_revision: bool) -> LockResult {
		let request = LockRequest::new(project.clone(), resource.clone()).with_revision(with_revision);
		let result = LockResult::from(self.api.acquire(request).await);
		match &result {
			LockResult::Acquired { revision } => {
				debug!(%project, %resource, has_revision = revision.is_some(), "persist.lock.acquired")
			}
			LockResult::NotAcquired { user } => info!(%project, %resource, holder = %user, "persist.lock.denied"),
			LockResult::ServerError(err) => warn!(%project, %resource, error = %err, "persist.lock.acquire_failed"),
			LockResult::Released => warn!(%project, %resource, "persist.lock.unexpected_release"),
		}
		result
	}

	/// Releases the lock. Safe to call when it is not held.
	pub async fn release(&self, project: &ProjectSlug, resource: &ResourceId) -> LockResult {
		release_with(&*self.api, project.clone(), resource.clone()).await
	}

	/// Returns a one-shot release function for use as a strategy teardown.
	pub fn release_fn(&self, project: ProjectSlug, resource: ResourceId) -> ReleaseFn {
		let api = Arc::clone(&self.api);
		Box::new(move || async move { release_with(&*api, project, resource).await }.boxed())
	}

	/// Acquires the lock and starts a document editing session on success.
	///
	/// A denied lock is never released. A failed acquire still triggers one
	/// best-effort release before the error is returned.
	pub async fn begin_edit(
		&self,
		documents: Arc<dyn DocumentApi>,
		project: ProjectSlug,
		resource: ResourceId,
		with_revision: bool,
		config: PersistConfig,
		listener: SharedListener,
	) -> Result<EditSession, EditDenied> {
		let strategy = DeferredStrategy::new(config);
		let release = self.release_fn(project.clone(), resource.clone());
		let lock = self.acquire(&project, &resource, with_revision).await;

		let err = match lock {
			LockResult::Acquired { revision } => {
				strategy.install(
					LockResult::Acquired {
						revision: revision.clone(),
					},
					release,
					listener,
				);
				return Ok(EditSession {
					strategy,
					documents,
					project,
					resource,
					revision,
					closed: false,
				});
			}
			LockResult::NotAcquired { user } => return Err(EditDenied::Locked { user }),
			LockResult::ServerError(err) => err,
			LockResult::Released => ApiError::Decode("lock acquire answered with a release".to_owned()),
		};

		strategy.install(LockResult::ServerError(err.clone()), release, listener);
		let outcome = strategy.destroy().await;
		debug!(%project, %resource, ?outcome, "persist.lock.release_after_failed_acquire");
		Err(EditDenied::Server(err))
	}
}

async fn release_with(api: &dyn LockApi, project: ProjectSlug, resource: ResourceId) -> LockResult {
	let request = LockRequest::new(project.clone(), resource.clone());
	let result = LockResult::from(api.release(request).await);
	match &result {
		LockResult::ServerError(err) => warn!(%project, %resource, error = %err, "persist.lock.release_failed"),
		_ => debug!(%project, %resource, "persist.lock.released"),
	}
	result
}

/// A document being edited under a held lock.
///
/// Dropping the session without [`close`](Self::close) still starts the
/// teardown; only the outcome is lost.
pub struct EditSession {
	strategy: DeferredStrategy,
	documents: Arc<dyn DocumentApi>,
	project: ProjectSlug,
	resource: ResourceId,
	revision: Option<Value>,
	closed: bool,
}

impl std::fmt::Debug for EditSession {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("EditSession")
			.field("project", &self.project)
			.field("resource", &self.resource)
			.field("strategy", &self.strategy)
			.finish_non_exhaustive()
	}
}

impl EditSession {
	/// Schedules `content` to be written after the quiet period.
	pub fn save(&self, content: Value) {
		self.strategy.save(self.document_save(content));
	}

	/// Writes `content` without waiting for the quiet period.
	pub fn save_now(&self, content: Value) {
		self.strategy.save_now(self.document_save(content));
	}

	/// Flushes whatever is pending.
	pub fn flush(&self) {
		self.strategy.flush_now();
	}

	/// Revision returned by the acquire, when one was requested.
	pub fn revision(&self) -> Option<&Value> {
		self.revision.as_ref()
	}

	/// The underlying strategy.
	pub fn strategy(&self) -> &DeferredStrategy {
		&self.strategy
	}

	/// Current persistence state.
	pub fn state(&self) -> PersistenceState {
		self.strategy.state()
	}

	/// Subscribes to persistence state changes.
	pub fn subscribe(&self) -> watch::Receiver<PersistenceState> {
		self.strategy.subscribe()
	}

	/// Ends the session: writes pending content and releases the lock.
	pub async fn close(mut self) -> TeardownOutcome {
		self.closed = true;
		self.strategy.destroy().await
	}

	fn document_save(&self, content: Value) -> SaveFn {
		let documents = Arc::clone(&self.documents);
		let project_id = self.project.clone();
		let resource_id = self.resource.clone();
		Box::new(move |release_lock| {
			async move {
				let saved = documents
					.save_document(DocumentSave {
						project_id,
						resource_id,
						content,
						release_lock,
					})
					.await?;
				Ok::<_, ApiError>(SaveReceipt {
					revision: Some(saved.revision_slug),
				})
			}
			.boxed()
		})
	}
}

impl Drop for EditSession {
	fn drop(&mut self) {
		if !self.closed {
			debug!(project = %self.project, resource = %self.resource, "persist.lock.session_dropped");
			let _ = self.strategy.destroy();
		}
	}
}

#[cfg(test)]
mod tests;
