//! Deferred persistence strategy with owned pending state.
//!
//! [`DeferredStrategy`] coalesces a stream of save requests into as few
//! writes as possible while bounding how long work may wait:
//! - A single pending slot; each [`DeferredStrategy::save`] replaces it
//! - A quiet-period timer restarted by every save
//! - A max-deferral clock that keeps counting from the first deferred save
//! - At most one write in flight; saves arriving mid-flight are written
//!   immediately after it settles
//!
//! # State machine
//!
//! `Idle -> Pending -> Inflight -> (Pending | Idle)`. [`DeferredStrategy::destroy`]
//! is reachable from every state and performs the terminal step: a final
//! write with `release_lock = true` when something is pending, otherwise an
//! explicit lock release.
//!
//! # Invariants
//!
//! 1. At most one write per strategy MUST be in flight.
//!    - Enforced in: `DeferredStrategy::queue_save`
//!    - Tested by: `strategy::tests::save_during_flight_is_written_after_it_settles`
//! 2. Teardown MUST release the lock exactly once, either through the final
//!    write or through the release function.
//!    - Enforced in: `DeferredStrategy::run_teardown`, `ReleaseFn` being `FnOnce`
//!    - Tested by: `strategy::tests::destroy_flushes_pending_with_release`,
//!      `strategy::tests::destroy_without_pending_releases_once`
//! 3. A flight that completes after teardown began MUST hand over to the
//!    teardown step instead of reporting success.
//!    - Enforced in: `DeferredStrategy::complete_flight`
//!    - Tested by: `strategy::tests::destroy_during_flight_defers_to_completion`
//!
//! # Error Handling
//!
//! A failed write is reported through [`PersistenceListener::on_failure`] and
//! dropped; the next save carries the latest state anyway. A failed final
//! write falls back to an explicit release so the lock is not left held.
//!
//! [`PersistenceListener::on_failure`]: crate::PersistenceListener::on_failure

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::future::BoxFuture;
use parking_lot::Mutex;
use quire_api::Error as ApiError;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::config::PersistConfig;
use crate::lock::LockResult;
use crate::state::{NoOpListener, PersistenceState, SaveReceipt, SharedListener};
use crate::task::{self, TaskClass};

/// Future returned by a [`SaveFn`].
pub type SaveFuture = BoxFuture<'static, Result<SaveReceipt, ApiError>>;

/// Deferred write. The argument is whether the write should also release the lock.
pub type SaveFn = Box<dyn FnOnce(bool) -> SaveFuture + Send>;

/// Explicit lock release used when teardown has nothing left to write.
pub type ReleaseFn = Box<dyn FnOnce() -> BoxFuture<'static, LockResult> + Send>;

/// How a teardown finished.
#[derive(Debug, Clone, PartialEq)]
pub enum TeardownOutcome {
	/// The pending payload was written with `release_lock = true`.
	Flushed(Result<SaveReceipt, ApiError>),
	/// Nothing was pending; the lock was released explicitly.
	Released(LockResult),
	/// The strategy was never initialized or was already torn down.
	Skipped,
	/// The runtime dropped the teardown task before it reported back.
	Abandoned,
}

/// Completion of [`DeferredStrategy::destroy`].
///
/// The terminal write or release is already dispatched when this value is
/// returned; awaiting it only observes the outcome.
#[must_use = "await the teardown to observe its outcome"]
#[derive(Debug)]
pub struct Teardown {
	rx: Option<oneshot::Receiver<TeardownOutcome>>,
}

impl Teardown {
	fn skipped() -> Self {
		Self { rx: None }
	}
}

impl Future for Teardown {
	type Output = TeardownOutcome;

	fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
		let Some(rx) = self.rx.as_mut() else {
			return Poll::Ready(TeardownOutcome::Skipped);
		};
		Pin::new(rx)
			.poll(cx)
			.map(|outcome| outcome.unwrap_or(TeardownOutcome::Abandoned))
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
	Uninitialized,
	Active,
	Destroyed,
}

struct Timer {
	generation: u64,
	handle: JoinHandle<()>,
}

struct Inner {
	lifecycle: Lifecycle,
	pending: Option<SaveFn>,
	inflight: bool,
	timer: Option<Timer>,
	/// When the first save of the current deferral window armed a timer.
	timer_start: Option<Instant>,
	timer_generation: u64,
	lock_result: Option<LockResult>,
	release: Option<ReleaseFn>,
	listener: SharedListener,
	/// Set when teardown began while a flight was running.
	teardown: Option<oneshot::Sender<TeardownOutcome>>,
}

impl Inner {
	fn cancel_timer(&mut self) {
		if let Some(timer) = self.timer.take() {
			timer.handle.abort();
		}
		self.timer_start = None;
	}
}

struct Shared {
	config: PersistConfig,
	state_tx: watch::Sender<PersistenceState>,
	inner: Mutex<Inner>,
}

/// Side effects collected under the state lock and applied after releasing it.
enum Effect {
	State(PersistenceState),
	Success(SaveReceipt),
	Failure(ApiError),
	Flush(SaveFn),
	FinalFlush(SaveFn, oneshot::Sender<TeardownOutcome>),
	Release {
		release: ReleaseFn,
		done: oneshot::Sender<TeardownOutcome>,
		flush_error: Option<ApiError>,
	},
}

struct Effects {
	listener: SharedListener,
	queue: Vec<Effect>,
}

impl Effects {
	fn new(inner: &Inner) -> Self {
		Self {
			listener: inner.listener.clone(),
			queue: Vec::new(),
		}
	}

	fn push(&mut self, effect: Effect) {
		self.queue.push(effect);
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Dispatch {
	Debounced,
	Immediate,
}

/// Debounced, single-flight persistence strategy.
///
/// Cloning yields another handle to the same strategy.
#[derive(Clone)]
pub struct DeferredStrategy {
	shared: Arc<Shared>,
}

impl fmt::Debug for DeferredStrategy {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let inner = self.shared.inner.lock();
		f.debug_struct("DeferredStrategy")
			.field("state", &*self.shared.state_tx.borrow())
			.field("lifecycle", &inner.lifecycle)
			.field("pending", &inner.pending.is_some())
			.field("inflight", &inner.inflight)
			.finish_non_exhaustive()
	}
}

impl DeferredStrategy {
	/// Creates an uninitialized strategy.
	pub fn new(config: PersistConfig) -> Self {
		let (state_tx, _) = watch::channel(PersistenceState::Idle);
		Self {
			shared: Arc::new(Shared {
				config,
				state_tx,
				inner: Mutex::new(Inner {
					lifecycle: Lifecycle::Uninitialized,
					pending: None,
					inflight: false,
					timer: None,
					timer_start: None,
					timer_generation: 0,
					lock_result: None,
					release: None,
					listener: Arc::new(NoOpListener),
					teardown: None,
				}),
			}),
		}
	}

	/// Awaits `lock`, then installs its result, `release` and `listener`.
	///
	/// Returns `true` iff the lock was acquired.
	///
	/// # Panics
	///
	/// Panics when called more than once.
	pub async fn initialize<F>(&self, lock: F, release: ReleaseFn, listener: SharedListener) -> bool
	where
		F: Future<Output = LockResult>,
	{
		assert_eq!(
			self.shared.inner.lock().lifecycle,
			Lifecycle::Uninitialized,
			"DeferredStrategy::initialize called twice"
		);
		let lock_result = lock.await;
		self.install(lock_result, release, listener)
	}

	/// Synchronous form of [`initialize`](Self::initialize) for an already known lock outcome.
	///
	/// # Panics
	///
	/// Panics when the strategy was already initialized.
	pub fn install(&self, lock_result: LockResult, release: ReleaseFn, listener: SharedListener) -> bool {
		let mut inner = self.shared.inner.lock();
		assert_eq!(
			inner.lifecycle,
			Lifecycle::Uninitialized,
			"DeferredStrategy::initialize called twice"
		);
		let acquired = lock_result.is_acquired();
		debug!(acquired, "persist.strategy.initialized");
		inner.lock_result = Some(lock_result);
		inner.release = Some(release);
		inner.listener = listener;
		inner.lifecycle = Lifecycle::Active;
		acquired
	}

	/// Replaces the pending payload and (re)arms the quiet-period timer.
	///
	/// # Panics
	///
	/// Panics when called before [`initialize`](Self::initialize).
	pub fn save(&self, save_fn: SaveFn) {
		self.store(save_fn, Dispatch::Debounced);
	}

	/// Replaces the pending payload and flushes it without waiting for the timer.
	///
	/// While a flight is running the payload is written as soon as it settles.
	pub fn save_now(&self, save_fn: SaveFn) {
		self.store(save_fn, Dispatch::Immediate);
	}

	/// Flushes the pending payload, if any, bypassing the timer.
	pub fn flush_now(&self) {
		let effects = {
			let mut inner = self.shared.inner.lock();
			if inner.lifecycle != Lifecycle::Active {
				return;
			}
			let mut effects = Effects::new(&inner);
			inner.cancel_timer();
			self.queue_save(&mut inner, &mut effects);
			effects
		};
		self.apply(effects);
	}

	/// Tears the strategy down.
	///
	/// Cancels the timer and dispatches the terminal step before returning.
	/// Repeated calls resolve to [`TeardownOutcome::Skipped`].
	pub fn destroy(&self) -> Teardown {
		let (done, rx) = oneshot::channel();
		let effects = {
			let mut inner = self.shared.inner.lock();
			if inner.lifecycle != Lifecycle::Active {
				debug!(lifecycle = ?inner.lifecycle, "persist.strategy.destroy_skipped");
				inner.lifecycle = Lifecycle::Destroyed;
				return Teardown::skipped();
			}
			inner.lifecycle = Lifecycle::Destroyed;
			let mut effects = Effects::new(&inner);
			inner.cancel_timer();
			if inner.inflight {
				debug!(pending = inner.pending.is_some(), "persist.strategy.teardown_after_flight");
				inner.teardown = Some(done);
			} else {
				self.run_teardown(&mut inner, &mut effects, done);
			}
			effects
		};
		self.apply(effects);
		Teardown { rx: Some(rx) }
	}

	/// Returns the most recently observed lock state.
	pub fn lock_result(&self) -> Option<LockResult> {
		self.shared.inner.lock().lock_result.clone()
	}

	/// Returns the current lifecycle state.
	pub fn state(&self) -> PersistenceState {
		*self.shared.state_tx.borrow()
	}

	/// Subscribes to state changes.
	pub fn subscribe(&self) -> watch::Receiver<PersistenceState> {
		self.shared.state_tx.subscribe()
	}

	/// Returns `true` while a write is on the wire.
	pub fn is_inflight(&self) -> bool {
		self.shared.inner.lock().inflight
	}

	/// Returns `true` when a payload is waiting to be written.
	pub fn has_pending(&self) -> bool {
		self.shared.inner.lock().pending.is_some()
	}

	/// Returns `true` once [`destroy`](Self::destroy) has been called.
	pub fn is_destroyed(&self) -> bool {
		self.shared.inner.lock().lifecycle == Lifecycle::Destroyed
	}

	/// Returns the timing configuration.
	pub fn config(&self) -> PersistConfig {
		self.shared.config
	}

	fn store(&self, save_fn: SaveFn, dispatch: Dispatch) {
		let effects = {
			let mut inner = self.shared.inner.lock();
			match inner.lifecycle {
				Lifecycle::Uninitialized => panic!("DeferredStrategy::save called before initialize"),
				Lifecycle::Destroyed => {
					warn!("persist.strategy.save_after_destroy");
					return;
				}
				Lifecycle::Active => {}
			}
			let mut effects = Effects::new(&inner);
			inner.pending = Some(save_fn);
			if !inner.inflight {
				self.transition(&mut effects, PersistenceState::Pending);
			}
			match dispatch {
				Dispatch::Debounced => self.schedule(&mut inner, &mut effects),
				Dispatch::Immediate => {
					inner.cancel_timer();
					self.queue_save(&mut inner, &mut effects);
				}
			}
			effects
		};
		self.apply(effects);
	}

	/// Debounce step run on every save.
	fn schedule(&self, inner: &mut Inner, effects: &mut Effects) {
		let now = Instant::now();
		let Some(timer) = inner.timer.take() else {
			inner.timer_start = Some(now);
			self.arm_timer(inner);
			return;
		};
		timer.handle.abort();

		let deferred = now.duration_since(inner.timer_start.unwrap_or(now));
		if deferred >= self.shared.config.max_deferred {
			debug!(deferred_ms = deferred.as_millis() as u64, "persist.strategy.max_deferred_flush");
			inner.timer_start = None;
			self.queue_save(inner, effects);
		} else {
			self.arm_timer(inner);
		}
	}

	fn arm_timer(&self, inner: &mut Inner) {
		inner.timer_generation += 1;
		let generation = inner.timer_generation;
		let deadline = Instant::now() + self.shared.config.quiet_period;
		let shared = Arc::downgrade(&self.shared);
		let handle = task::spawn(TaskClass::Timer, async move {
			tokio::time::sleep_until(deadline).await;
			if let Some(shared) = shared.upgrade() {
				DeferredStrategy { shared }.on_timer(generation);
			}
		});
		inner.timer = Some(Timer { generation, handle });
	}

	fn on_timer(&self, generation: u64) {
		let effects = {
			let mut inner = self.shared.inner.lock();
			if !inner.timer.as_ref().is_some_and(|timer| timer.generation == generation) {
				trace!(generation, "persist.strategy.stale_timer");
				return;
			}
			inner.timer = None;
			inner.timer_start = None;
			let mut effects = Effects::new(&inner);
			self.queue_save(&mut inner, &mut effects);
			effects
		};
		self.apply(effects);
	}

	/// Starts a flight for the pending payload unless one is already running.
	fn queue_save(&self, inner: &mut Inner, effects: &mut Effects) {
		if inner.inflight {
			trace!("persist.strategy.flush_waits_for_flight");
			return;
		}
		let Some(save_fn) = inner.pending.take() else {
			return;
		};
		inner.inflight = true;
		self.transition(effects, PersistenceState::Inflight);
		debug!("persist.strategy.flush_start");
		effects.push(Effect::Flush(save_fn));
	}

	fn complete_flight(&self, result: Result<SaveReceipt, ApiError>) {
		let effects = {
			let mut inner = self.shared.inner.lock();
			let mut effects = Effects::new(&inner);
			inner.inflight = false;
			match &result {
				Ok(_) => debug!("persist.strategy.flush_done"),
				Err(err) => warn!(error = %err, "persist.strategy.flush_failed"),
			}

			if let Some(done) = inner.teardown.take() {
				if let Err(err) = result {
					effects.push(Effect::Failure(err));
				}
				self.run_teardown(&mut inner, &mut effects, done);
			} else {
				match result {
					Ok(receipt) => effects.push(Effect::Success(receipt)),
					Err(err) => effects.push(Effect::Failure(err)),
				}
				if inner.pending.is_some() {
					inner.cancel_timer();
					self.transition(&mut effects, PersistenceState::Pending);
					self.queue_save(&mut inner, &mut effects);
				} else {
					self.transition(&mut effects, PersistenceState::Idle);
				}
			}
			effects
		};
		self.apply(effects);
	}

	/// Terminal step: final write if something is pending, else explicit release.
	fn run_teardown(&self, inner: &mut Inner, effects: &mut Effects, done: oneshot::Sender<TeardownOutcome>) {
		if let Some(save_fn) = inner.pending.take() {
			inner.inflight = true;
			self.transition(effects, PersistenceState::Inflight);
			debug!("persist.strategy.teardown_flush");
			effects.push(Effect::FinalFlush(save_fn, done));
		} else if let Some(release) = inner.release.take() {
			self.transition(effects, PersistenceState::Idle);
			debug!("persist.strategy.teardown_release");
			effects.push(Effect::Release {
				release,
				done,
				flush_error: None,
			});
		} else {
			self.transition(effects, PersistenceState::Idle);
			let _ = done.send(TeardownOutcome::Skipped);
		}
	}

	fn complete_final_flush(&self, result: Result<SaveReceipt, ApiError>, done: oneshot::Sender<TeardownOutcome>) {
		let effects = {
			let mut inner = self.shared.inner.lock();
			let mut effects = Effects::new(&inner);
			inner.inflight = false;
			self.transition(&mut effects, PersistenceState::Idle);
			match result {
				Ok(receipt) => {
					debug!(revision = ?receipt.revision, "persist.strategy.teardown_flushed");
					inner.release = None;
					inner.lock_result = Some(LockResult::Released);
					let _ = done.send(TeardownOutcome::Flushed(Ok(receipt)));
				}
				Err(err) => {
					warn!(error = %err, "persist.strategy.teardown_flush_failed");
					effects.push(Effect::Failure(err.clone()));
					match inner.release.take() {
						Some(release) => effects.push(Effect::Release {
							release,
							done,
							flush_error: Some(err),
						}),
						None => {
							let _ = done.send(TeardownOutcome::Flushed(Err(err)));
						}
					}
				}
			}
			effects
		};
		self.apply(effects);
	}

	fn complete_release(
		&self,
		result: LockResult,
		done: oneshot::Sender<TeardownOutcome>,
		flush_error: Option<ApiError>,
	) {
		match &result {
			LockResult::ServerError(err) => warn!(error = %err, "persist.strategy.release_failed"),
			_ => debug!("persist.strategy.released"),
		}
		self.shared.inner.lock().lock_result = Some(result.clone());
		let outcome = match flush_error {
			Some(err) => TeardownOutcome::Flushed(Err(err)),
			None => TeardownOutcome::Released(result),
		};
		let _ = done.send(outcome);
	}

	fn transition(&self, effects: &mut Effects, state: PersistenceState) {
		let changed = self.shared.state_tx.send_if_modified(|current| {
			if *current == state {
				return false;
			}
			*current = state;
			true
		});
		if changed {
			trace!(state = state.as_str(), "persist.strategy.state");
			effects.push(Effect::State(state));
		}
	}

	/// Delivers notifications and starts writes outside the state lock.
	fn apply(&self, effects: Effects) {
		let Effects { listener, queue } = effects;
		for effect in queue {
			match effect {
				Effect::State(state) => listener.on_state_change(state),
				Effect::Success(receipt) => listener.on_success(&receipt),
				Effect::Failure(err) => listener.on_failure(&err),
				Effect::Flush(save_fn) => {
					let strategy = self.clone();
					let write = save_fn(false);
					task::spawn(TaskClass::Flush, async move {
						let result = write.await;
						strategy.complete_flight(result);
					});
				}
				Effect::FinalFlush(save_fn, done) => {
					let strategy = self.clone();
					let write = save_fn(true);
					task::spawn(TaskClass::Teardown, async move {
						let result = write.await;
						strategy.complete_final_flush(result, done);
					});
				}
				Effect::Release {
					release,
					done,
					flush_error,
				} => {
					let strategy = self.clone();
					let release = release();
					task::spawn(TaskClass::Teardown, async move {
						let result = release.await;
						strategy.complete_release(result, done, flush_error);
					});
				}
			}
		}
	}
}
