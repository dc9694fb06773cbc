//! Wire contracts for the persistence core.
//!
//! This crate defines the minimal request/response shapes the persistence
//! layer depends on, abstracted from any concrete transport:
//!
//! - Lock acquire / release against a `(project, resource)` pair ([`LockApi`]).
//! - Batched part-state writes for one `(section, attempt)` ([`PartStateApi`]).
//! - Whole-document saves that may also release the lock ([`DocumentApi`]).
//!
//! Server failures are reported as [`Error`] values and never panic. The
//! [`memory`] module provides an in-process server implementing all three
//! traits, used by tests and by the replay tool.
#![warn(missing_docs)]

mod ids;
pub mod memory;
mod protocol;
mod service;

pub use ids::{AttemptGuid, ProjectSlug, ResourceId, RevisionSlug, SectionSlug, TargetId};
pub use memory::{MemoryClient, MemoryServer};
pub use protocol::{
	BatchSaved, DocumentSave, DocumentSaved, LockRequest, LockResponse, PartStateBatch, PartStateItem, ServerErrorBody,
	WriteMode,
};
pub use service::{DocumentApi, LockApi, PartStateApi};

/// A convenient type alias for `Result` with `E` = [`enum@crate::Error`].
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Possible errors from a remote call.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
	/// The server answered with its generic error shape.
	#[error("server error {}: {}", .0.status, .0.message)]
	Server(ServerErrorBody),
	/// The request never produced a response.
	#[error("transport error: {0}")]
	Transport(String),
	/// The response could not be decoded.
	#[error("undecodable response: {0}")]
	Decode(String),
	/// The caller's completion was dropped before the request settled.
	#[error("request abandoned before completion")]
	Abandoned,
}

impl Error {
	/// Builds a [`Error::Server`] from a status and message.
	pub fn server(status: u16, message: impl Into<String>) -> Self {
		Self::Server(ServerErrorBody {
			status,
			message: message.into(),
		})
	}

	/// Returns the server error body, or a synthesized one for non-server failures.
	pub fn body(&self) -> ServerErrorBody {
		match self {
			Self::Server(body) => body.clone(),
			other => ServerErrorBody {
				status: 0,
				message: other.to_string(),
			},
		}
	}
}

impl From<serde_json::Error> for Error {
	fn from(err: serde_json::Error) -> Self {
		Self::Decode(err.to_string())
	}
}
