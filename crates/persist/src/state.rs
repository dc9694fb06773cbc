//! Persistence lifecycle state and its observers.

use std::fmt;
use std::sync::Arc;

use quire_api::{Error as ApiError, RevisionSlug};

/// Lifecycle of a persistence strategy as seen by the UI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum PersistenceState {
	/// Nothing waiting to be written.
	#[default]
	Idle,
	/// An edit is waiting for the quiet period to elapse.
	Pending,
	/// A write is on the wire.
	Inflight,
}

impl PersistenceState {
	/// Returns the state name used in logs and status lines.
	pub const fn as_str(self) -> &'static str {
		match self {
			Self::Idle => "idle",
			Self::Pending => "pending",
			Self::Inflight => "inflight",
		}
	}
}

impl fmt::Display for PersistenceState {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

/// Result of one successful write.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SaveReceipt {
	/// Revision produced by a document save; `None` for part-state batches.
	pub revision: Option<RevisionSlug>,
}

/// Receives notifications from a persistence strategy.
///
/// All methods have no-op defaults. Notifications are delivered after the
/// strategy's internal state lock has been released, in the order the
/// transitions happened.
pub trait PersistenceListener: Send + Sync {
	/// The strategy moved to `state`.
	fn on_state_change(&self, _state: PersistenceState) {}

	/// A routine (non-teardown) write succeeded.
	fn on_success(&self, _receipt: &SaveReceipt) {}

	/// A routine write failed. The failed payload is not retried.
	fn on_failure(&self, _error: &ApiError) {}
}

/// Listener that ignores every notification.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoOpListener;

impl PersistenceListener for NoOpListener {}

/// Shared, type-erased listener.
pub type SharedListener = Arc<dyn PersistenceListener>;
