//! Deferred, lock-coordinated autosave.
//!
//! # Purpose
//!
//! - Coalesce bursts of edits into few writes while bounding how long an edit may wait.
//! - Keep at most one write per strategy on the wire, and release the edit lock exactly once on teardown.
//! - Batch part-level updates per `(section, attempt)` with last-write-wins per target.
//! - Exclude transport, rendering and server-side locking; see `quire_api` for the wire contracts.
//!
//! # Mental model
//!
//! - An editor first takes the document lock through [`LockCoordinator`]; only an acquired lock yields an [`EditSession`].
//! - Every session and every save queue owns a [`DeferredStrategy`]: a single pending slot, a quiet-period timer, a max-deferral clock and an inflight flag.
//! - Saves replace the pending payload. The timer or a forced flush hands it to a spawned flight; saves that arrive mid-flight are written right after.
//! - Teardown is a terminal write with `release_lock = true` when something is pending, otherwise an explicit release.
//! - [`SaveQueueRegistry`] is an explicit object passed to call sites; there is no process-global queue list.
//! - [`UnloadGuard`] is the host's last chance to flush queues before exit.
//!
//! # Key types
//!
//! | Type | Meaning | Constraints | Constructed / mutated in |
//! |---|---|---|---|
//! | [`DeferredStrategy`] | Debounced single-flight writer | MUST be initialized exactly once before `save` | `DeferredStrategy::initialize`, `DeferredStrategy::save`, `DeferredStrategy::destroy` |
//! | [`PersistenceState`] | `Idle` / `Pending` / `Inflight` | MUST only change inside the strategy | `DeferredStrategy::transition` |
//! | [`LockResult`] | Outcome of a lock call | Server errors MUST become `ServerError`, never `Err` | `LockCoordinator::acquire`, `LockCoordinator::release` |
//! | [`EditSession`] | Document edit under a held lock | MUST start teardown on close or drop | `LockCoordinator::begin_edit`, `EditSession::close` |
//! | [`SaveQueue`] | Last-write-wins part updates for one attempt | MUST NOT take appends while inflight | `SaveQueueRegistry::enqueue_save` |
//! | [`SaveQueueRegistry`] | Live queues | MUST evict a queue only when empty and idle | `SaveQueueRegistry::find_or_create`, `RegistryInner::sweep`, `EvictOnIdle` |
//! | [`Deferred`] | Externally settled completion | Dropping it MUST settle its promises | `SaveQueue::snapshot`, `SaveQueue::write_batch` |
//!
//! # Invariants
//!
//! 1. A strategy MUST have at most one write in flight.
//!    - Enforced in: `DeferredStrategy::queue_save`
//!    - Tested by: `strategy::tests::save_during_flight_is_written_after_it_settles`
//!    - Failure symptom: two writes race and an older payload lands last.
//!
//! 2. Teardown MUST release the lock exactly once.
//!    - Enforced in: `DeferredStrategy::run_teardown`
//!    - Tested by: `strategy::tests::destroy_flushes_pending_with_release`, `strategy::tests::destroy_without_pending_releases_once`
//!    - Failure symptom: documents stay locked after the editor leaves, or a release races a later editor's acquire.
//!
//! 3. A denied lock MUST NOT be released.
//!    - Enforced in: `LockCoordinator::begin_edit`
//!    - Tested by: `lock::tests::denied_session_never_releases`
//!    - Failure symptom: the second editor releases the first editor's lock.
//!
//! 4. Queue items replaced during a flight MUST survive that flight's success.
//!    - Enforced in: `SaveQueueRegistry::find_or_create`, `SaveQueue::write_batch`
//!    - Tested by: `queue::tests::inflight_queue_is_not_reused`
//!    - Failure symptom: part state silently lost after a save indicator showed "Saved".
//!
//! 5. State listeners MUST be called without any strategy lock held.
//!    - Enforced in: `DeferredStrategy::apply`
//!    - Tested by: `queue::tests::registry_listener_sees_queue_lifecycle`
//!    - Failure symptom: deadlock when a listener touches the registry.

pub mod config;
mod deferred;
pub mod lock;
pub mod queue;
mod state;
pub mod strategy;
pub mod task;
#[cfg(test)]
mod testing;
pub mod unload;

pub use config::{ConfigError, PersistConfig, PersistSettings};
pub use deferred::{Deferred, DeferredPromise};
pub use lock::{EditDenied, EditSession, LockCoordinator, LockResult};
pub use queue::{QueueKey, SaveOutcome, SaveQueue, SaveQueueItem, SaveQueueRegistry};
pub use state::{NoOpListener, PersistenceListener, PersistenceState, SaveReceipt, SharedListener};
pub use strategy::{DeferredStrategy, ReleaseFn, SaveFn, SaveFuture, Teardown, TeardownOutcome};
pub use unload::{DrainReport, UNLOAD_WARNING, UnloadDecision, UnloadGuard};
