//! Quire replay binary.
//!
//! Plays a scripted editing session through the persistence core against an
//! in-memory server and prints every call the server received. Ctrl-C runs
//! the same unload path a host would.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use quire_api::MemoryServer;
use quire_api::memory::Call;
use quire_persist::{
	EditSession, LockCoordinator, PersistConfig, PersistenceListener, PersistenceState, SaveOutcome, SaveQueueRegistry,
	SaveReceipt, UnloadDecision, UnloadGuard,
};
use tokio::time::Instant;
use tracing::{info, warn};

mod script;

use script::{Script, Step};

/// Replay command line arguments.
#[derive(Parser, Debug)]
#[command(name = "quire-replay")]
#[command(about = "Replay a scripted editing session against an in-memory server")]
struct Args {
	/// Script file (TOML); the built-in demo runs when omitted
	#[arg(short, long, value_name = "PATH")]
	config: Option<PathBuf>,

	/// Override the quiet period
	#[arg(long, value_name = "MS")]
	quiet_ms: Option<u64>,

	/// Override the maximum deferral
	#[arg(long, value_name = "MS")]
	max_deferred_ms: Option<u64>,

	/// Override the simulated server latency
	#[arg(long, value_name = "MS")]
	latency_ms: Option<u64>,

	/// Verbose logging
	#[arg(short, long)]
	verbose: bool,
}

/// Logs every state change of one persistence scope.
struct StatusLine {
	scope: &'static str,
}

impl PersistenceListener for StatusLine {
	fn on_state_change(&self, state: PersistenceState) {
		info!(scope = self.scope, state = %state, "replay.state");
	}

	fn on_success(&self, receipt: &SaveReceipt) {
		info!(scope = self.scope, revision = ?receipt.revision, "replay.saved");
	}

	fn on_failure(&self, error: &quire_api::Error) {
		warn!(scope = self.scope, %error, "replay.save_failed");
	}
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	let args = Args::parse();

	setup_tracing(args.verbose);

	let file = script::load(args.config.as_deref())?;
	let mut settings = file.persist;
	if let Some(quiet_ms) = args.quiet_ms {
		settings.quiet_period_ms = quiet_ms;
	}
	if let Some(max_deferred_ms) = args.max_deferred_ms {
		settings.max_deferred_ms = max_deferred_ms;
	}
	let config = PersistConfig::from_settings(&settings).context("invalid persistence settings")?;

	let mut script = file.replay;
	if let Some(latency_ms) = args.latency_ms {
		script.latency_ms = latency_ms;
	}

	info!(
		quiet_ms = settings.quiet_period_ms,
		max_deferred_ms = settings.max_deferred_ms,
		steps = script.steps.len(),
		"starting quire-replay"
	);

	let server = MemoryServer::new();
	server.set_latency(script.latency());
	let client = Arc::new(server.client(script.user.clone()));

	let registry = SaveQueueRegistry::with_listener(client.clone(), config, Arc::new(StatusLine { scope: "parts" }));
	let guard = UnloadGuard::new(registry.clone());
	let session = LockCoordinator::new(client.clone())
		.begin_edit(
			client,
			script.project.as_str().into(),
			script.resource.as_str().into(),
			true,
			config,
			Arc::new(StatusLine { scope: "document" }),
		)
		.await
		.context("could not start editing")?;

	let interrupted = tokio::select! {
		() = play(&script, &session, &registry) => false,
		signal = tokio::signal::ctrl_c() => {
			signal.context("listening for ctrl-c")?;
			true
		}
	};

	if interrupted && let UnloadDecision::Prompt { message } = guard.before_unload() {
		eprintln!("{message}");
	}
	let report = guard.drain().await;
	let outcome = session.close().await;
	settle(&registry).await;
	info!(?outcome, flushed = report.flushed, failed = report.failed, "replay.finished");

	print_calls(&server)
}

/// Runs every step at its offset, then waits for part writes to settle.
async fn play(script: &Script, session: &EditSession, registry: &SaveQueueRegistry) {
	let start = Instant::now();
	let mut parts = Vec::new();

	for step in script.ordered_steps() {
		tokio::time::sleep_until(start + step.at()).await;
		match step {
			Step::Edit { content, .. } => {
				info!(at_ms = step.at().as_millis() as u64, "replay.edit");
				session.save(content.clone());
			}
			Step::Part {
				section,
				attempt,
				target,
				payload,
				finalize,
				..
			} => {
				info!(at_ms = step.at().as_millis() as u64, %target, finalize, "replay.part");
				parts.push(registry.enqueue_save(
					section.as_str().into(),
					attempt.as_str().into(),
					target.as_str().into(),
					payload.clone(),
					*finalize,
				));
			}
		}
	}

	for part in parts {
		report_part(part.await);
	}
}

fn report_part(outcome: SaveOutcome) {
	if let Err(error) = outcome {
		warn!(%error, "replay.part_failed");
	}
}

/// Waits for flights started by the unload hook.
async fn settle(registry: &SaveQueueRegistry) {
	for queue in registry.queues() {
		let mut state = queue.strategy().subscribe();
		// A closed channel means the strategy is gone, which is settled too.
		let _ = state.wait_for(|state| *state == PersistenceState::Idle).await;
	}
}

fn print_calls(server: &MemoryServer) -> anyhow::Result<()> {
	for call in server.calls() {
		match call {
			Call::Acquire { user, request } => {
				println!("acquire  {user} {}/{}", request.project_id, request.resource_id);
			}
			Call::Release { user, request } => {
				println!("release  {user} {}/{}", request.project_id, request.resource_id);
			}
			Call::SaveDocument { user, save } => {
				println!(
					"save     {user} {}/{} release_lock={} {}",
					save.project_id,
					save.resource_id,
					save.release_lock,
					serde_json::to_string(&save.content)?
				);
			}
			Call::WritePartStates { user, batch } => {
				println!(
					"{:<8} {user} {}/{} {}",
					batch.mode().as_str(),
					batch.section_slug,
					batch.attempt_guid,
					serde_json::to_string(&batch.items)?
				);
			}
		}
	}
	Ok(())
}

fn setup_tracing(verbose: bool) {
	use tracing_subscriber::EnvFilter;

	let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
		if verbose {
			EnvFilter::new("quire_persist=trace,quire_api=debug,quire_replay=debug,info")
		} else {
			EnvFilter::new("quire_persist=info,quire_replay=info,warn")
		}
	});

	tracing_subscriber::fmt()
		.with_env_filter(filter)
		.with_writer(std::io::stderr)
		.with_target(verbose)
		.init();
}
