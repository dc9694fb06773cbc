//! Async service traits the persistence core calls through.

use async_trait::async_trait;

use crate::{BatchSaved, DocumentSave, DocumentSaved, LockRequest, LockResponse, PartStateBatch, Result};

/// Mutual-exclusion lock service.
#[async_trait]
pub trait LockApi: Send + Sync {
	/// Attempts to acquire the lock described by `request`.
	async fn acquire(&self, request: LockRequest) -> Result<LockResponse>;

	/// Releases the lock. Releasing a lock the caller does not hold is not an error.
	async fn release(&self, request: LockRequest) -> Result<LockResponse>;
}

/// Batched part-state writes.
#[async_trait]
pub trait PartStateApi: Send + Sync {
	/// Writes every item in `batch` in one request.
	async fn write_part_states(&self, batch: PartStateBatch) -> Result<BatchSaved>;
}

/// Whole-document saves.
#[async_trait]
pub trait DocumentApi: Send + Sync {
	/// Saves the full document content.
	async fn save_document(&self, save: DocumentSave) -> Result<DocumentSaved>;
}
