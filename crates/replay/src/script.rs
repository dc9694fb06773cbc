//! Replay scripts.
//!
//! A script file carries the `[persist]` timing table next to a `[replay]`
//! table describing who edits what, and when.

use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use quire_persist::PersistSettings;
use serde::Deserialize;
use serde_json::{Value, json};

/// Whole script file.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReplayFile {
	/// Autosave timing, the same `[persist]` table a host would load.
	#[serde(default)]
	pub persist: PersistSettings,
	/// The session to play.
	#[serde(default)]
	pub replay: Script,
}

/// One editing session.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Script {
	/// Project owning the edited document.
	#[serde(default = "default_project")]
	pub project: String,
	/// Document taken under lock for the edit steps.
	#[serde(default = "default_resource")]
	pub resource: String,
	/// Principal holding the lock and writing part state.
	#[serde(default = "default_user")]
	pub user: String,
	/// Simulated server latency per call.
	#[serde(default)]
	pub latency_ms: u64,
	/// Actions as written in the file; see [`Script::ordered_steps`].
	#[serde(default, rename = "step")]
	pub steps: Vec<Step>,
}

fn default_project() -> String {
	"intro-course".to_owned()
}

fn default_resource() -> String {
	"page-1".to_owned()
}

fn default_user() -> String {
	"author".to_owned()
}

/// A timed action.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Step {
	/// Replace the document content.
	Edit { at_ms: u64, content: Value },
	/// Update one part of an attempt.
	Part {
		at_ms: u64,
		section: String,
		attempt: String,
		target: String,
		payload: Value,
		#[serde(default)]
		finalize: bool,
	},
}

impl Step {
	/// Offset from the start of the replay.
	pub fn at(&self) -> Duration {
		match self {
			Self::Edit { at_ms, .. } | Self::Part { at_ms, .. } => Duration::from_millis(*at_ms),
		}
	}
}

impl Script {
	/// Steps in time order; ties keep file order.
	pub fn ordered_steps(&self) -> Vec<&Step> {
		let mut steps: Vec<_> = self.steps.iter().collect();
		steps.sort_by_key(|step| step.at());
		steps
	}

	/// Simulated server latency per call.
	pub fn latency(&self) -> Duration {
		Duration::from_millis(self.latency_ms)
	}
}

impl Default for Script {
	fn default() -> Self {
		let part = |at_ms, target: &str, payload| Step::Part {
			at_ms,
			section: "unit-1".to_owned(),
			attempt: "attempt-1".to_owned(),
			target: target.to_owned(),
			payload,
			finalize: false,
		};
		Self {
			project: default_project(),
			resource: default_resource(),
			user: default_user(),
			latency_ms: 100,
			steps: vec![
				Step::Edit {
					at_ms: 0,
					content: json!({ "title": "Draft" }),
				},
				part(100, "part-1", json!({ "answer": "a" })),
				part(200, "part-1", json!({ "answer": "b" })),
				Step::Edit {
					at_ms: 400,
					content: json!({ "title": "Draft 2" }),
				},
				Step::Edit {
					at_ms: 3500,
					content: json!({ "title": "Final" }),
				},
			],
		}
	}
}

/// Parses a script document.
pub fn parse(input: &str) -> anyhow::Result<ReplayFile> {
	toml::from_str(input).context("invalid replay script")
}

/// Loads `path`, or the built-in demo script when `None`.
pub fn load(path: Option<&Path>) -> anyhow::Result<ReplayFile> {
	let Some(path) = path else {
		return Ok(ReplayFile::default());
	};
	let input = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
	parse(&input).with_context(|| format!("loading {}", path.display()))
}
