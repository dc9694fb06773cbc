//! Listener that records notifications for assertions.

use std::sync::Arc;

use parking_lot::Mutex;
use quire_api::Error as ApiError;

use crate::state::{PersistenceListener, PersistenceState, SaveReceipt, SharedListener};

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Event {
	State(PersistenceState),
	Success(SaveReceipt),
	Failure(ApiError),
}

#[derive(Debug, Default, Clone)]
pub(crate) struct RecordingListener {
	events: Arc<Mutex<Vec<Event>>>,
}

impl RecordingListener {
	pub(crate) fn shared(&self) -> SharedListener {
		Arc::new(self.clone())
	}

	pub(crate) fn events(&self) -> Vec<Event> {
		self.events.lock().clone()
	}

	pub(crate) fn states(&self) -> Vec<PersistenceState> {
		self.events
			.lock()
			.iter()
			.filter_map(|event| match event {
				Event::State(state) => Some(*state),
				_ => None,
			})
			.collect()
	}

	pub(crate) fn successes(&self) -> usize {
		self.events
			.lock()
			.iter()
			.filter(|event| matches!(event, Event::Success(_)))
			.count()
	}

	pub(crate) fn failures(&self) -> Vec<ApiError> {
		self.events
			.lock()
			.iter()
			.filter_map(|event| match event {
				Event::Failure(err) => Some(err.clone()),
				_ => None,
			})
			.collect()
	}
}

impl PersistenceListener for RecordingListener {
	fn on_state_change(&self, state: PersistenceState) {
		self.events.lock().push(Event::State(state));
	}

	fn on_success(&self, receipt: &SaveReceipt) {
		self.events.lock().push(Event::Success(receipt.clone()));
	}

	fn on_failure(&self, error: &ApiError) {
		self.events.lock().push(Event::Failure(error.clone()));
	}
}
