//! Externally settled completions.
//!
//! A [`Deferred`] hands out [`DeferredPromise`]s before the value exists and
//! is settled later by whoever owns it. Promises are cheap to clone; every
//! clone observes the same value. Dropping an unsettled `Deferred` resolves
//! its promises with `None`.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures::FutureExt;
use futures::future::Shared;
use tokio::sync::oneshot;

/// Write side of a one-shot completion.
pub struct Deferred<T> {
	tx: oneshot::Sender<T>,
	promise: DeferredPromise<T>,
}

impl<T> fmt::Debug for Deferred<T> {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("Deferred").finish_non_exhaustive()
	}
}

impl<T> Default for Deferred<T>
where
	T: Clone + Send + Sync + 'static,
{
	fn default() -> Self {
		Self::new()
	}
}

impl<T> Deferred<T>
where
	T: Clone + Send + Sync + 'static,
{
	/// Creates an unsettled completion.
	pub fn new() -> Self {
		let (tx, rx) = oneshot::channel();
		Self {
			tx,
			promise: DeferredPromise { inner: rx.shared() },
		}
	}

	/// Returns a promise resolving when this completion is settled.
	pub fn promise(&self) -> DeferredPromise<T> {
		self.promise.clone()
	}

	/// Settles the completion with `value`.
	pub fn resolve(self, value: T) {
		// Nobody waiting is fine.
		let _ = self.tx.send(value);
	}
}

impl<V, E> Deferred<Result<V, E>>
where
	V: Clone + Send + Sync + 'static,
	E: Clone + Send + Sync + 'static,
{
	/// Settles the completion with an error.
	pub fn reject(self, error: E) {
		self.resolve(Err(error));
	}
}

/// Read side of a [`Deferred`].
pub struct DeferredPromise<T> {
	inner: Shared<oneshot::Receiver<T>>,
}

impl<T> fmt::Debug for DeferredPromise<T> {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("DeferredPromise").finish_non_exhaustive()
	}
}

impl<T> Clone for DeferredPromise<T> {
	fn clone(&self) -> Self {
		Self {
			inner: self.inner.clone(),
		}
	}
}

impl<T: Clone> Future for DeferredPromise<T> {
	type Output = Option<T>;

	fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
		Pin::new(&mut self.inner).poll(cx).map(Result::ok)
	}
}
