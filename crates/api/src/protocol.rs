//! Request and response shapes.
//!
//! Field names follow the JSON the remote service speaks (`camelCase`,
//! `type`-tagged lock responses), so every type here round-trips through
//! `serde_json` unchanged.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{AttemptGuid, ProjectSlug, ResourceId, RevisionSlug, SectionSlug, TargetId};

/// Generic error body returned by the server on any failing call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerErrorBody {
	/// HTTP-like status code. `0` when the failure never reached the server.
	pub status: u16,
	/// Human-readable description.
	pub message: String,
}

/// Lock acquire or release request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockRequest {
	/// Project owning the resource.
	pub project_id: ProjectSlug,
	/// Resource being locked.
	pub resource_id: ResourceId,
	/// Whether the acquire response should carry the latest revision.
	#[serde(default)]
	pub fetch_revision: bool,
}

impl LockRequest {
	/// Builds a request without revision fetching.
	pub fn new(project_id: ProjectSlug, resource_id: ResourceId) -> Self {
		Self {
			project_id,
			resource_id,
			fetch_revision: false,
		}
	}

	/// Sets whether the acquire response should carry the latest revision.
	pub fn with_revision(mut self, fetch_revision: bool) -> Self {
		self.fetch_revision = fetch_revision;
		self
	}
}

/// Successful lock response, discriminated on `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LockResponse {
	/// The caller now holds the lock.
	Acquired {
		/// Snapshot of the latest revision, when requested.
		#[serde(default, skip_serializing_if = "Option::is_none")]
		revision: Option<Value>,
	},
	/// Another principal holds the lock.
	NotAcquired {
		/// The current holder.
		user: String,
	},
	/// The lock was released.
	Released,
}

/// One part-state update inside a batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartStateItem {
	/// Part attempt being written.
	pub target_id: TargetId,
	/// Opaque state payload.
	pub payload: Value,
}

/// HTTP verb a part-state batch travels with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WriteMode {
	/// Final write; the attempt is being submitted.
	Put,
	/// Incremental write of in-progress state.
	Patch,
}

impl WriteMode {
	/// Returns the verb as it appears on the wire.
	pub const fn as_str(self) -> &'static str {
		match self {
			Self::Put => "PUT",
			Self::Patch => "PATCH",
		}
	}
}

/// Batched part-state write for one `(section, attempt)` pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartStateBatch {
	/// Section the attempt belongs to.
	pub section_slug: SectionSlug,
	/// Attempt being written.
	pub attempt_guid: AttemptGuid,
	/// Updates, at most one per target.
	pub items: Vec<PartStateItem>,
	/// Final (`PUT`) versus incremental (`PATCH`) write.
	pub finalize: bool,
}

impl PartStateBatch {
	/// Returns the verb this batch is sent with.
	pub const fn mode(&self) -> WriteMode {
		if self.finalize { WriteMode::Put } else { WriteMode::Patch }
	}
}

/// Response to a part-state batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchSaved {
	/// Always `"success"`.
	pub result: String,
}

impl BatchSaved {
	/// The canonical success response.
	pub fn success() -> Self {
		Self {
			result: "success".to_owned(),
		}
	}
}

/// Whole-document save.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentSave {
	/// Project owning the document.
	pub project_id: ProjectSlug,
	/// Document being saved.
	pub resource_id: ResourceId,
	/// Full edited content.
	pub content: Value,
	/// Whether the server should release the lock after writing.
	pub release_lock: bool,
}

/// Response to a document save.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentSaved {
	/// Always `"success"`.
	pub result: String,
	/// Slug of the revision the save produced.
	pub revision_slug: RevisionSlug,
}
