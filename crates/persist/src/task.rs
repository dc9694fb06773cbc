//! Spawn point for every task the persistence core starts.
//!
//! Tasks run on the caller's runtime. A strategy torn down from `Drop` may
//! have no runtime around it, yet its final write or release must still
//! reach the server; those tasks land on a small current-thread runtime
//! driven by one background thread. It only enables the timer driver, since
//! timers, writes and releases are all this core ever schedules.

use std::future::Future;
use std::sync::OnceLock;

use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::Instrument;

/// Execution classes for tasks spawned by the persistence core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskClass {
	/// Quiet-period timers.
	Timer,
	/// Routine autosave writes.
	Flush,
	/// Final writes and lock releases on teardown, including unload flushes.
	Teardown,
}

impl TaskClass {
	pub(crate) const fn as_str(self) -> &'static str {
		match self {
			Self::Timer => "timer",
			Self::Flush => "flush",
			Self::Teardown => "teardown",
		}
	}
}

fn teardown_handle() -> &'static Handle {
	static TEARDOWN_RT: OnceLock<Handle> = OnceLock::new();
	TEARDOWN_RT.get_or_init(|| {
		let runtime = tokio::runtime::Builder::new_current_thread()
			.enable_time()
			.build()
			.expect("failed to build quire-persist teardown runtime");
		let handle = runtime.handle().clone();
		std::thread::Builder::new()
			.name("quire-persist-teardown".to_owned())
			.spawn(move || runtime.block_on(std::future::pending::<()>()))
			.expect("failed to start quire-persist teardown thread");
		tracing::debug!("persist.task.teardown_runtime_started");
		handle
	})
}

/// Spawns `fut` tagged with `class`, on the current runtime when there is one.
pub fn spawn<F>(class: TaskClass, fut: F) -> JoinHandle<F::Output>
where
	F: Future + Send + 'static,
	F::Output: Send + 'static,
{
	let span = tracing::trace_span!("persist.task", class = class.as_str());
	match Handle::try_current() {
		Ok(handle) => handle.spawn(fut.instrument(span)),
		Err(_) => {
			tracing::debug!(task_class = class.as_str(), "persist.task.no_runtime");
			teardown_handle().spawn(fut.instrument(span))
		}
	}
}
