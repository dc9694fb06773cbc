//! Batched part-state saves.
//!
//! # Purpose
//!
//! - Owns: per `(section, attempt)` queues of part updates and the registry
//!   that finds, creates and evicts them.
//! - Does not own: timing. Every queue drives its writes through its own
//!   [`DeferredStrategy`].
//!
//! # Mental model
//!
//! Callers enqueue `(target, payload)` pairs. Within a queue a target holds
//! at most one item; a newer payload replaces the older one. When the
//! queue's strategy flushes, all current items travel in one
//! [`PartStateBatch`]. Callers get a future that settles with the batch
//! that carried their item.
//!
//! A queue with a write on the wire never takes new items; the registry
//! creates a sibling queue for the same key instead. Appending a target to
//! one queue drops that target from its siblings, so an older payload kept
//! by a failed write can never be sent after a newer one. Queues leave the
//! registry once they are empty and their strategy is idle again, either on
//! the transition to `Idle` or the next time the registry is consulted.
//!
//! # Invariants
//!
//! 1. Appends MUST NOT target a queue whose write is in flight.
//!    - Enforced in: `SaveQueueRegistry::find_or_create`
//!    - Tested by: `queue::tests::inflight_queue_is_not_reused`
//! 2. A successful write MUST remove only the item revisions it sent.
//!    - Enforced in: `SaveQueue::write_batch`
//!    - Tested by: `queue::tests::failure_rejects_and_keeps_items`
//! 3. Every caller promise MUST settle with the write that snapshotted its item.
//!    - Enforced in: `SaveQueue::snapshot` (items and completion swap under one lock)
//!    - Tested by: `queue::tests::enqueue_resolves_after_the_batch_lands`
//! 4. Across the queues of one key, a target MUST be held by at most one queue.
//!    - Enforced in: `RegistryInner::admit`, `SaveQueue::supersede`
//!    - Tested by: `queue::tests::failed_write_never_overwrites_a_newer_payload`,
//!      `queue::tests::superseded_item_settles_with_the_newer_write`
//! 5. A settled queue MUST NOT stay registered.
//!    - Enforced in: `EvictOnIdle`, `RegistryInner::sweep`
//!    - Tested by: `queue::tests::unused_queues_do_not_accumulate`
//!
//! Lock order: registry, then queue items, then strategy state.

use std::fmt;
use std::future::Future;
use std::mem;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use futures::FutureExt;
use futures::future::join_all;
use parking_lot::{Mutex, MutexGuard};
use quire_api::{AttemptGuid, Error as ApiError, PartStateApi, PartStateBatch, PartStateItem, SectionSlug, TargetId};
use serde_json::Value;
use tracing::{debug, trace, warn};

use crate::config::PersistConfig;
use crate::deferred::{Deferred, DeferredPromise};
use crate::lock::LockResult;
use crate::state::{PersistenceListener, PersistenceState, SaveReceipt, SharedListener};
use crate::strategy::{DeferredStrategy, SaveFn};
use crate::task::{self, TaskClass};

/// Settlement of one batched write.
pub type SaveOutcome = Result<SaveReceipt, ApiError>;

/// Identity of a queue.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QueueKey {
	/// Section the attempt belongs to.
	pub section: SectionSlug,
	/// Attempt whose parts are written.
	pub attempt: AttemptGuid,
}

/// One queued part update.
#[derive(Debug, Clone, PartialEq)]
pub struct SaveQueueItem {
	/// Part attempt being written.
	pub target_id: TargetId,
	/// Opaque state payload.
	pub payload: Value,
}

#[derive(Debug)]
struct QueuedItem {
	item: SaveQueueItem,
	revision: u64,
}

#[derive(Debug, Default)]
struct Items {
	entries: Vec<QueuedItem>,
	next_revision: u64,
	/// Sticky until the next snapshot.
	finalize: bool,
	/// Settled by the write that snapshots the current entries.
	completion: Deferred<SaveOutcome>,
}

struct Snapshot {
	batch: PartStateBatch,
	revisions: Vec<u64>,
	completion: Deferred<SaveOutcome>,
}

/// Last-write-wins queue of part updates for one attempt.
pub struct SaveQueue {
	id: u64,
	key: QueueKey,
	items: Mutex<Items>,
	strategy: DeferredStrategy,
	registry: Weak<RegistryInner>,
}

impl fmt::Debug for SaveQueue {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("SaveQueue")
			.field("id", &self.id)
			.field("key", &self.key)
			.field("items", &self.items.lock().entries.len())
			.field("strategy", &self.strategy)
			.finish()
	}
}

impl SaveQueue {
	/// Registry-unique queue id.
	pub fn id(&self) -> u64 {
		self.id
	}

	/// The `(section, attempt)` this queue writes for.
	pub fn key(&self) -> &QueueKey {
		&self.key
	}

	/// Strategy driving this queue's writes.
	pub fn strategy(&self) -> &DeferredStrategy {
		&self.strategy
	}

	/// Current items in queue order.
	pub fn items(&self) -> Vec<SaveQueueItem> {
		self.items.lock().entries.iter().map(|entry| entry.item.clone()).collect()
	}

	/// Returns `true` when items are waiting to be written.
	pub fn has_items(&self) -> bool {
		!self.items.lock().entries.is_empty()
	}

	/// Returns `true` while this queue's write is on the wire.
	pub fn is_inflight(&self) -> bool {
		self.strategy.is_inflight()
	}

	/// Promise settled by the next write of this queue.
	pub fn promise(&self) -> DeferredPromise<SaveOutcome> {
		self.items.lock().completion.promise()
	}

	/// Adds `item`, replacing any item for the same target.
	///
	/// Sibling queues of the same key drop their item for that target, and a
	/// queue already pruned from its registry is registered again. Does not
	/// schedule a write.
	pub fn append_item(self: &Arc<Self>, item: SaveQueueItem) -> DeferredPromise<SaveOutcome> {
		let Some(registry) = self.registry.upgrade() else {
			return self.append(item, false);
		};
		let mut queues = registry.queues.lock();
		registry.admit(&mut queues, self, item, false)
	}

	fn is_settled(&self) -> bool {
		!self.has_items() && !self.strategy.is_inflight() && !self.strategy.has_pending()
	}

	fn append(&self, item: SaveQueueItem, finalize: bool) -> DeferredPromise<SaveOutcome> {
		let mut items = self.items.lock();
		items.next_revision += 1;
		let revision = items.next_revision;
		items.finalize |= finalize;
		let queued = QueuedItem { item, revision };
		match items
			.entries
			.iter_mut()
			.find(|entry| entry.item.target_id == queued.item.target_id)
		{
			Some(entry) => {
				trace!(queue = self.id, target = %queued.item.target_id, "persist.queue.item_replaced");
				*entry = queued;
			}
			None => items.entries.push(queued),
		}
		items.completion.promise()
	}

	/// Drops the item for `target_id` in favour of a newer one held elsewhere.
	///
	/// When this empties the queue, its waiters follow `newer` and its
	/// finalize request is returned for the newer queue to carry.
	fn supersede(&self, target_id: &TargetId, newer: &DeferredPromise<SaveOutcome>) -> bool {
		let mut items = self.items.lock();
		let before = items.entries.len();
		items.entries.retain(|entry| entry.item.target_id != *target_id);
		if items.entries.len() == before {
			return false;
		}
		trace!(queue = self.id, target = %target_id, "persist.queue.item_superseded");
		if !items.entries.is_empty() {
			return false;
		}
		let orphaned = mem::take(&mut items.completion);
		let newer = settled(newer.clone());
		task::spawn(TaskClass::Flush, async move {
			orphaned.resolve(newer.await);
		});
		mem::take(&mut items.finalize)
	}

	fn snapshot(&self) -> Option<Snapshot> {
		let mut items = self.items.lock();
		if items.entries.is_empty() {
			return None;
		}
		let batch = PartStateBatch {
			section_slug: self.key.section.clone(),
			attempt_guid: self.key.attempt.clone(),
			items: items
				.entries
				.iter()
				.map(|entry| PartStateItem {
					target_id: entry.item.target_id.clone(),
					payload: entry.item.payload.clone(),
				})
				.collect(),
			finalize: mem::take(&mut items.finalize),
		};
		let revisions = items.entries.iter().map(|entry| entry.revision).collect();
		let completion = mem::take(&mut items.completion);
		Some(Snapshot {
			batch,
			revisions,
			completion,
		})
	}

	async fn write_batch(&self, api: &dyn PartStateApi) -> SaveOutcome {
		let Some(Snapshot {
			batch,
			revisions,
			completion,
		}) = self.snapshot()
		else {
			trace!(queue = self.id, "persist.queue.nothing_to_write");
			return Ok(SaveReceipt::default());
		};

		let finalize = batch.finalize;
		debug!(
			queue = self.id,
			section = %self.key.section,
			attempt = %self.key.attempt,
			items = batch.items.len(),
			mode = batch.mode().as_str(),
			"persist.queue.flush_start"
		);

		match api.write_part_states(batch).await {
			Ok(_) => {
				self.items
					.lock()
					.entries
					.retain(|entry| !revisions.contains(&entry.revision));
				debug!(queue = self.id, items = revisions.len(), "persist.queue.flush_done");
				completion.resolve(Ok(SaveReceipt::default()));
				Ok(SaveReceipt::default())
			}
			Err(err) => {
				if finalize {
					self.items.lock().finalize = true;
				}
				warn!(queue = self.id, error = %err, "persist.queue.flush_failed");
				completion.reject(err.clone());
				Err(err)
			}
		}
	}

	fn batch_fn(self: &Arc<Self>, api: Arc<dyn PartStateApi>) -> SaveFn {
		let queue = Arc::clone(self);
		Box::new(move |_release_lock| async move { queue.write_batch(&*api).await }.boxed())
	}
}

/// Registry-side listener: evicts a settled queue and forwards notifications.
struct EvictOnIdle {
	registry: Weak<RegistryInner>,
	queue_id: u64,
	forward: Option<SharedListener>,
}

impl PersistenceListener for EvictOnIdle {
	fn on_state_change(&self, state: PersistenceState) {
		if state == PersistenceState::Idle
			&& let Some(registry) = self.registry.upgrade()
		{
			registry.evict_if_settled(self.queue_id);
		}
		if let Some(forward) = &self.forward {
			forward.on_state_change(state);
		}
	}

	fn on_success(&self, receipt: &SaveReceipt) {
		if let Some(forward) = &self.forward {
			forward.on_success(receipt);
		}
	}

	fn on_failure(&self, error: &ApiError) {
		if let Some(forward) = &self.forward {
			forward.on_failure(error);
		}
	}
}

struct RegistryInner {
	api: Arc<dyn PartStateApi>,
	config: PersistConfig,
	listener: Option<SharedListener>,
	queues: Mutex<Vec<Arc<SaveQueue>>>,
	next_id: AtomicU64,
}

impl RegistryInner {
	fn evict_if_settled(&self, queue_id: u64) {
		let mut queues = self.queues.lock();
		let Some(idx) = queues.iter().position(|queue| queue.id == queue_id) else {
			return;
		};
		if !queues[idx].is_settled() {
			return;
		}
		let queue = queues.remove(idx);
		debug!(queue = queue.id, section = %queue.key.section, attempt = %queue.key.attempt, "persist.queue.evicted");
	}

	/// Removes every settled queue except `keep`.
	fn sweep(&self, queues: &mut Vec<Arc<SaveQueue>>, keep: Option<u64>) {
		queues.retain(|queue| {
			if Some(queue.id) == keep || !queue.is_settled() {
				return true;
			}
			debug!(queue = queue.id, section = %queue.key.section, attempt = %queue.key.attempt, "persist.queue.swept");
			false
		});
	}

	/// Appends `item` to `queue` and drops the same target from its siblings.
	fn admit(
		&self,
		queues: &mut Vec<Arc<SaveQueue>>,
		queue: &Arc<SaveQueue>,
		item: SaveQueueItem,
		finalize: bool,
	) -> DeferredPromise<SaveOutcome> {
		if !queues.iter().any(|live| live.id == queue.id) {
			trace!(queue = queue.id, "persist.queue.reregistered");
			queues.push(Arc::clone(queue));
		}
		let target_id = item.target_id.clone();
		let promise = queue.append(item, finalize);

		let mut carried = false;
		for sibling in queues
			.iter()
			.filter(|sibling| sibling.id != queue.id && sibling.key == queue.key)
		{
			carried |= sibling.supersede(&target_id, &promise);
		}
		if carried {
			queue.items.lock().finalize = true;
		}
		self.sweep(queues, None);
		promise
	}
}

/// Explicit registry of live save queues.
///
/// Cloning yields another handle to the same registry.
#[derive(Clone)]
pub struct SaveQueueRegistry {
	inner: Arc<RegistryInner>,
}

impl fmt::Debug for SaveQueueRegistry {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("SaveQueueRegistry")
			.field("config", &self.inner.config)
			.field("queues", &self.inner.queues.lock().len())
			.finish_non_exhaustive()
	}
}

impl SaveQueueRegistry {
	/// Creates an empty registry writing through `api`.
	pub fn new(api: Arc<dyn PartStateApi>, config: PersistConfig) -> Self {
		Self::build(api, config, None)
	}

	/// Creates an empty registry whose queues report to `listener`.
	pub fn with_listener(api: Arc<dyn PartStateApi>, config: PersistConfig, listener: SharedListener) -> Self {
		Self::build(api, config, Some(listener))
	}

	fn build(api: Arc<dyn PartStateApi>, config: PersistConfig, listener: Option<SharedListener>) -> Self {
		Self {
			inner: Arc::new(RegistryInner {
				api,
				config,
				listener,
				queues: Mutex::new(Vec::new()),
				next_id: AtomicU64::new(1),
			}),
		}
	}

	/// Returns a queue for the key that is not writing, creating one if needed.
	pub fn get_or_create_queue(&self, section: SectionSlug, attempt: AttemptGuid) -> Arc<SaveQueue> {
		let mut queues = self.inner.queues.lock();
		self.find_or_create(&mut queues, QueueKey { section, attempt })
	}

	/// Queues a part update and schedules a batched write.
	///
	/// The returned future settles with the write that carries this item.
	/// A `finalize` request marks the whole next batch as final.
	pub fn enqueue_save(
		&self,
		section: SectionSlug,
		attempt: AttemptGuid,
		target_id: TargetId,
		payload: Value,
		finalize: bool,
	) -> impl Future<Output = SaveOutcome> + Send + use<> {
		let (queue, promise) = {
			let mut queues = self.inner.queues.lock();
			let queue = self.find_or_create(&mut queues, QueueKey { section, attempt });
			let promise = self
				.inner
				.admit(&mut queues, &queue, SaveQueueItem { target_id, payload }, finalize);
			(queue, promise)
		};
		queue.strategy.save(queue.batch_fn(Arc::clone(&self.inner.api)));
		settled(promise)
	}

	/// Writes every idle queue with items now, bypassing the quiet period.
	///
	/// Queues with a write on the wire are skipped.
	pub fn flush_all(&self) -> impl Future<Output = Vec<SaveOutcome>> + Send + use<> {
		let targets: Vec<_> = {
			let queues = self.live();
			queues
				.iter()
				.filter(|queue| !queue.strategy.is_inflight() && queue.has_items())
				.map(|queue| (Arc::clone(queue), queue.promise()))
				.collect()
		};
		debug!(queues = targets.len(), "persist.queue.flush_all");
		let writes: Vec<_> = targets
			.into_iter()
			.map(|(queue, promise)| {
				queue.strategy.save_now(queue.batch_fn(Arc::clone(&self.inner.api)));
				settled(promise)
			})
			.collect();
		join_all(writes)
	}

	/// Number of queues holding unwritten items, whatever their state.
	pub fn outstanding(&self) -> usize {
		self.live().iter().filter(|queue| queue.has_items()).count()
	}

	/// Number of live queues in the registry.
	pub fn queue_count(&self) -> usize {
		self.live().len()
	}

	/// Snapshot of the live queues.
	pub fn queues(&self) -> Vec<Arc<SaveQueue>> {
		self.live().clone()
	}

	/// Locks the queue list after pruning settled queues.
	fn live(&self) -> MutexGuard<'_, Vec<Arc<SaveQueue>>> {
		let mut queues = self.inner.queues.lock();
		self.inner.sweep(&mut queues, None);
		queues
	}

	fn find_or_create(&self, queues: &mut Vec<Arc<SaveQueue>>, key: QueueKey) -> Arc<SaveQueue> {
		if let Some(queue) = queues
			.iter()
			.find(|queue| queue.key == key && !queue.strategy.is_inflight())
			.cloned()
		{
			self.inner.sweep(queues, Some(queue.id));
			return queue;
		}
		self.inner.sweep(queues, None);

		let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
		let strategy = DeferredStrategy::new(self.inner.config);
		strategy.install(
			LockResult::Acquired { revision: None },
			Box::new(|| async { LockResult::Released }.boxed()),
			Arc::new(EvictOnIdle {
				registry: Arc::downgrade(&self.inner),
				queue_id: id,
				forward: self.inner.listener.clone(),
			}),
		);
		debug!(queue = id, section = %key.section, attempt = %key.attempt, "persist.queue.created");
		let queue = Arc::new(SaveQueue {
			id,
			key,
			items: Mutex::new(Items::default()),
			strategy,
			registry: Arc::downgrade(&self.inner),
		});
		queues.push(Arc::clone(&queue));
		queue
	}
}

fn settled(promise: DeferredPromise<SaveOutcome>) -> impl Future<Output = SaveOutcome> + Send + use<> {
	promise.map(|outcome| outcome.unwrap_or(Err(ApiError::Abandoned)))
}

#[cfg(test)]
mod tests;
