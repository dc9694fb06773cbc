//! In-process reference server.
//!
//! [`MemoryServer`] holds the authoritative lock table, document store and a
//! log of every call it received. Each editing principal talks to it through
//! a [`MemoryClient`], which implements all service traits on behalf of one
//! user.
//!
//! # Invariants
//!
//! 1. A `(project, resource)` lock MUST have at most one holder.
//!    - Enforced in: `ServerState::acquire`
//!    - Tested by: `memory::tests::second_user_is_denied`
//! 2. A document save MUST come from the current lock holder.
//!    - Enforced in: `ServerState::save_document`
//!    - Tested by: `memory::tests::save_without_lock_is_rejected`
//! 3. Release MUST be idempotent and never release another user's lock.
//!    - Enforced in: `ServerState::release`
//!    - Tested by: `memory::tests::release_is_idempotent`

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, trace};

use crate::{
	BatchSaved, DocumentApi, DocumentSave, DocumentSaved, Error, LockApi, LockRequest, LockResponse, PartStateApi,
	PartStateBatch, ProjectSlug, ResourceId, Result, RevisionSlug,
};

type DocKey = (ProjectSlug, ResourceId);

/// Call sites at which a failure can be injected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultPoint {
	/// [`LockApi::acquire`].
	Acquire,
	/// [`LockApi::release`].
	Release,
	/// [`DocumentApi::save_document`] and [`PartStateApi::write_part_states`].
	Write,
}

/// One call received by the server, in arrival order.
#[derive(Debug, Clone, PartialEq)]
pub enum Call {
	/// Lock acquisition attempt.
	Acquire {
		/// Calling principal.
		user: String,
		/// The request as received.
		request: LockRequest,
	},
	/// Lock release.
	Release {
		/// Calling principal.
		user: String,
		/// The request as received.
		request: LockRequest,
	},
	/// Whole-document save.
	SaveDocument {
		/// Calling principal.
		user: String,
		/// The save as received.
		save: DocumentSave,
	},
	/// Batched part-state write.
	WritePartStates {
		/// Calling principal.
		user: String,
		/// The batch as received.
		batch: PartStateBatch,
	},
}

#[derive(Debug, Clone)]
struct StoredDocument {
	content: Value,
	revision: RevisionSlug,
}

#[derive(Debug, Default)]
struct ServerState {
	locks: HashMap<DocKey, String>,
	documents: HashMap<DocKey, StoredDocument>,
	calls: Vec<Call>,
	faults: Vec<(FaultPoint, Error)>,
	latency: Duration,
	next_revision: u64,
}

impl ServerState {
	fn take_fault(&mut self, point: FaultPoint) -> Option<Error> {
		let idx = self.faults.iter().position(|(p, _)| *p == point)?;
		Some(self.faults.remove(idx).1)
	}

	fn acquire(&mut self, user: &str, request: &LockRequest) -> LockResponse {
		let key = (request.project_id.clone(), request.resource_id.clone());
		if let Some(holder) = self.locks.get(&key)
			&& holder != user
		{
			return LockResponse::NotAcquired { user: holder.clone() };
		}
		self.locks.insert(key.clone(), user.to_owned());
		let revision = request
			.fetch_revision
			.then(|| self.documents.get(&key).map(|doc| doc.content.clone()))
			.flatten();
		LockResponse::Acquired { revision }
	}

	fn release(&mut self, user: &str, request: &LockRequest) -> LockResponse {
		let key = (request.project_id.clone(), request.resource_id.clone());
		if self.locks.get(&key).is_some_and(|holder| holder == user) {
			self.locks.remove(&key);
		}
		LockResponse::Released
	}

	fn save_document(&mut self, user: &str, save: &DocumentSave) -> Result<DocumentSaved> {
		let key = (save.project_id.clone(), save.resource_id.clone());
		match self.locks.get(&key) {
			Some(holder) if holder == user => {}
			Some(holder) => return Err(Error::server(423, format!("document is locked by {holder}"))),
			None => return Err(Error::server(409, "lock not held")),
		}

		self.next_revision += 1;
		let revision = RevisionSlug(format!("rev-{}", self.next_revision));
		self.documents.insert(
			key.clone(),
			StoredDocument {
				content: save.content.clone(),
				revision: revision.clone(),
			},
		);
		if save.release_lock {
			self.locks.remove(&key);
		}
		Ok(DocumentSaved {
			result: "success".to_owned(),
			revision_slug: revision,
		})
	}
}

/// Shared in-memory server state.
#[derive(Debug, Clone, Default)]
pub struct MemoryServer {
	state: Arc<Mutex<ServerState>>,
}

impl MemoryServer {
	/// Creates an empty server.
	pub fn new() -> Self {
		Self::default()
	}

	/// Returns a client acting as `user`.
	pub fn client(&self, user: impl Into<String>) -> MemoryClient {
		MemoryClient {
			server: self.clone(),
			user: user.into(),
		}
	}

	/// Delays every subsequent response by `latency`.
	pub fn set_latency(&self, latency: Duration) {
		self.state.lock().latency = latency;
	}

	/// Fails the next call reaching `point` with `error`.
	pub fn inject(&self, point: FaultPoint, error: Error) {
		self.state.lock().faults.push((point, error));
	}

	/// Returns every call received so far.
	pub fn calls(&self) -> Vec<Call> {
		self.state.lock().calls.clone()
	}

	/// Returns the part-state batches received so far.
	pub fn part_batches(&self) -> Vec<PartStateBatch> {
		self.state
			.lock()
			.calls
			.iter()
			.filter_map(|call| match call {
				Call::WritePartStates { batch, .. } => Some(batch.clone()),
				_ => None,
			})
			.collect()
	}

	/// Returns the document saves received so far.
	pub fn document_saves(&self) -> Vec<DocumentSave> {
		self.state
			.lock()
			.calls
			.iter()
			.filter_map(|call| match call {
				Call::SaveDocument { save, .. } => Some(save.clone()),
				_ => None,
			})
			.collect()
	}

	/// Counts release calls received for one resource.
	pub fn release_count(&self, project: &ProjectSlug, resource: &ResourceId) -> usize {
		self.state
			.lock()
			.calls
			.iter()
			.filter(|call| {
				matches!(call, Call::Release { request, .. }
					if &request.project_id == project && &request.resource_id == resource)
			})
			.count()
	}

	/// Returns the current lock holder of a resource.
	pub fn lock_holder(&self, project: &ProjectSlug, resource: &ResourceId) -> Option<String> {
		self.state.lock().locks.get(&(project.clone(), resource.clone())).cloned()
	}

	/// Returns the stored content and revision of a document.
	pub fn document(&self, project: &ProjectSlug, resource: &ResourceId) -> Option<(Value, RevisionSlug)> {
		self.state
			.lock()
			.documents
			.get(&(project.clone(), resource.clone()))
			.map(|doc| (doc.content.clone(), doc.revision.clone()))
	}

	/// Seeds a document so acquire-with-revision has something to return.
	pub fn seed_document(&self, project: ProjectSlug, resource: ResourceId, content: Value) {
		let mut state = self.state.lock();
		state.next_revision += 1;
		let revision = RevisionSlug(format!("rev-{}", state.next_revision));
		state.documents.insert((project, resource), StoredDocument { content, revision });
	}

	/// Records `call`, then returns the latency to apply and any injected fault.
	fn admit(&self, call: Call, point: FaultPoint) -> (Duration, Option<Error>) {
		let mut state = self.state.lock();
		trace!(?point, "memory_server.call");
		state.calls.push(call);
		(state.latency, state.take_fault(point))
	}
}

async fn delay(latency: Duration) {
	if !latency.is_zero() {
		tokio::time::sleep(latency).await;
	}
}

/// Client of a [`MemoryServer`] acting on behalf of one user.
#[derive(Debug, Clone)]
pub struct MemoryClient {
	server: MemoryServer,
	user: String,
}

impl MemoryClient {
	/// Returns the principal this client acts as.
	pub fn user(&self) -> &str {
		&self.user
	}

	/// Returns the server this client talks to.
	pub fn server(&self) -> &MemoryServer {
		&self.server
	}
}

#[async_trait]
impl LockApi for MemoryClient {
	async fn acquire(&self, request: LockRequest) -> Result<LockResponse> {
		let call = Call::Acquire {
			user: self.user.clone(),
			request: request.clone(),
		};
		let (latency, fault) = self.server.admit(call, FaultPoint::Acquire);
		delay(latency).await;
		if let Some(err) = fault {
			return Err(err);
		}
		let response = self.server.state.lock().acquire(&self.user, &request);
		debug!(user = %self.user, resource = %request.resource_id, ?response, "memory_server.acquire");
		Ok(response)
	}

	async fn release(&self, request: LockRequest) -> Result<LockResponse> {
		let call = Call::Release {
			user: self.user.clone(),
			request: request.clone(),
		};
		let (latency, fault) = self.server.admit(call, FaultPoint::Release);
		delay(latency).await;
		if let Some(err) = fault {
			return Err(err);
		}
		let response = self.server.state.lock().release(&self.user, &request);
		debug!(user = %self.user, resource = %request.resource_id, "memory_server.release");
		Ok(response)
	}
}

#[async_trait]
impl DocumentApi for MemoryClient {
	async fn save_document(&self, save: DocumentSave) -> Result<DocumentSaved> {
		let call = Call::SaveDocument {
			user: self.user.clone(),
			save: save.clone(),
		};
		let (latency, fault) = self.server.admit(call, FaultPoint::Write);
		delay(latency).await;
		if let Some(err) = fault {
			return Err(err);
		}
		self.server.state.lock().save_document(&self.user, &save)
	}
}

#[async_trait]
impl PartStateApi for MemoryClient {
	async fn write_part_states(&self, batch: PartStateBatch) -> Result<BatchSaved> {
		let items = batch.items.len();
		let mode = batch.mode().as_str();
		let call = Call::WritePartStates {
			user: self.user.clone(),
			batch,
		};
		let (latency, fault) = self.server.admit(call, FaultPoint::Write);
		delay(latency).await;
		if let Some(err) = fault {
			return Err(err);
		}
		debug!(user = %self.user, items, mode, "memory_server.write_part_states");
		Ok(BatchSaved::success())
	}
}
