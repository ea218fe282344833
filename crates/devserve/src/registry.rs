use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::time::Instant;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::error::{Error, Result};
use crate::health::HealthMonitor;
use crate::output::LogCapture;
use crate::signal::ProcessHandle;
use crate::types::{Health, LaunchSpec, ProcessPhase};

/// One supervised process, keyed by `spec.label`.
pub struct ProcessEntry {
	/// `spec.auto_restart` is cleared for good once a stop is requested.
	pub spec: LaunchSpec,
	/// `spec.auto_restart` as launched; a restart carries this over.
	pub auto_restart_requested: bool,
	pub handle: Option<ProcessHandle>,
	pub phase: ProcessPhase,
	pub health: Health,
	pub started_at: DateTime<Utc>,
	pub started: Instant,
	pub output: LogCapture,
	/// Identifies the current spawn; callbacks from older spawns compare and bail.
	pub(crate) generation: u64,
	pub(crate) monitor: Option<HealthMonitor>,
	/// The delayed relaunch or forced kill waiting to fire, if any.
	pub(crate) pending: Option<JoinHandle<()>>,
	gone: watch::Sender<bool>,
}

impl ProcessEntry {
	pub fn new(spec: LaunchSpec, output: LogCapture) -> Self {
		let (gone, _) = watch::channel(false);
		Self {
			auto_restart_requested: spec.auto_restart,
			spec,
			handle: None,
			phase: ProcessPhase::Starting,
			health: Health::starting(),
			started_at: Utc::now(),
			started: Instant::now(),
			output,
			generation: 0,
			monitor: None,
			pending: None,
			gone,
		}
	}

	pub fn label(&self) -> &str {
		&self.spec.label
	}

	pub fn pid(&self) -> Option<u32> {
		self.handle.map(|h| h.pid)
	}

	pub fn cancel_monitor(&mut self) {
		if let Some(monitor) = self.monitor.take() {
			monitor.cancel();
		}
	}

	/// Resolves once this entry has been retired.
	pub fn subscribe_gone(&self) -> watch::Receiver<bool> {
		self.gone.subscribe()
	}

	/// Cancels everything attached to the entry. Called on removal.
	pub fn retire(&mut self) {
		self.cancel_monitor();
		if let Some(pending) = self.pending.take() {
			pending.abort();
		}
		self.phase = ProcessPhase::Terminated;
		self.gone.send_replace(true);
	}
}

/// Label to entry, plus the alias table consulted before every lookup.
#[derive(Default)]
pub struct ProcessRegistry {
	entries: HashMap<String, ProcessEntry>,
	aliases: HashMap<String, String>,
}

impl ProcessRegistry {
	pub fn new() -> Self {
		Self::default()
	}

	/// Alias target if `label` is an alias, otherwise `label` itself.
	pub fn resolve(&self, label: &str) -> String {
		self.aliases
			.get(label)
			.cloned()
			.unwrap_or_else(|| label.to_string())
	}

	pub fn insert(&mut self, entry: ProcessEntry) -> Result<()> {
		let label = entry.label().to_string();
		if self.entries.contains_key(&label) {
			return Err(Error::DuplicateLabel(label));
		}
		self.entries.insert(label, entry);
		Ok(())
	}

	pub fn lookup(&self, label_or_alias: &str) -> Option<&ProcessEntry> {
		self.entries.get(&self.resolve(label_or_alias))
	}

	pub fn lookup_mut(&mut self, label_or_alias: &str) -> Option<&mut ProcessEntry> {
		let label = self.resolve(label_or_alias);
		self.entries.get_mut(&label)
	}

	pub fn get(&self, label: &str) -> Option<&ProcessEntry> {
		self.entries.get(label)
	}

	pub fn get_mut(&mut self, label: &str) -> Option<&mut ProcessEntry> {
		self.entries.get_mut(label)
	}

	pub fn contains(&self, label: &str) -> bool {
		self.entries.contains_key(label)
	}

	/// Idempotent. The caller retires the returned entry.
	pub fn remove(&mut self, label: &str) -> Option<ProcessEntry> {
		self.entries.remove(label)
	}

	pub fn list_by_project_prefix(&self, project: &str) -> Vec<&ProcessEntry> {
		let prefix = format!("{}:", project);
		let mut found: Vec<&ProcessEntry> = self
			.entries
			.values()
			.filter(|e| e.label().starts_with(&prefix))
			.collect();
		found.sort_by(|a, b| a.label().cmp(b.label()));
		found
	}

	pub fn iter(&self) -> impl Iterator<Item = &ProcessEntry> {
		self.entries.values()
	}

	pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut ProcessEntry> {
		self.entries.values_mut()
	}

	pub fn labels(&self) -> Vec<String> {
		let mut labels: Vec<String> = self.entries.keys().cloned().collect();
		labels.sort();
		labels
	}

	pub fn len(&self) -> usize {
		self.entries.len()
	}

	pub fn is_empty(&self) -> bool {
		self.entries.is_empty()
	}

	/// Additive: existing aliases are overwritten only by the same name.
	pub fn add_alias(&mut self, alias: impl Into<String>, target: impl Into<String>) {
		self.aliases.insert(alias.into(), target.into());
	}

	pub fn aliases_for(&self, label: &str) -> Vec<String> {
		let mut found: Vec<String> = self
			.aliases
			.iter()
			.filter(|(_, target)| target.as_str() == label)
			.map(|(alias, _)| alias.clone())
			.collect();
		found.sort();
		found
	}

	pub fn aliases(&self) -> &HashMap<String, String> {
		&self.aliases
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn entry(label: &str) -> ProcessEntry {
		ProcessEntry::new(
			LaunchSpec::new(label, "/tmp", "node server.js"),
			LogCapture::new(label, None, 10),
		)
	}

	#[test]
	fn test_insert_duplicate() {
		let mut reg = ProcessRegistry::new();
		reg.insert(entry("web")).unwrap();
		assert!(matches!(reg.insert(entry("web")), Err(Error::DuplicateLabel(l)) if l == "web"));
		assert_eq!(reg.len(), 1);
	}

	#[test]
	fn test_lookup_resolves_alias_first() {
		let mut reg = ProcessRegistry::new();
		reg.insert(entry("myapp:next")).unwrap();
		reg.insert(entry("web")).unwrap();
		reg.add_alias("web", "myapp:next");

		assert_eq!(reg.lookup("web").unwrap().label(), "myapp:next");
		assert_eq!(reg.lookup("myapp:next").unwrap().label(), "myapp:next");
		assert!(reg.lookup("api").is_none());
		assert_eq!(reg.aliases_for("myapp:next"), vec!["web"]);
	}

	#[test]
	fn test_remove_idempotent() {
		let mut reg = ProcessRegistry::new();
		reg.insert(entry("web")).unwrap();
		assert!(reg.remove("web").is_some());
		assert!(reg.remove("web").is_none());
		assert!(reg.is_empty());
	}

	#[test]
	fn test_list_by_project_prefix() {
		let mut reg = ProcessRegistry::new();
		for label in ["shop:web", "shop:api", "shopping:web", "shop", "blog:web"] {
			reg.insert(entry(label)).unwrap();
		}
		let labels: Vec<&str> = reg.list_by_project_prefix("shop").into_iter().map(|e| e.label()).collect();
		assert_eq!(labels, vec!["shop:api", "shop:web"]);
		assert!(reg.list_by_project_prefix("docs").is_empty());
	}

	#[tokio::test]
	async fn test_retire_signals_gone() {
		let mut e = entry("web");
		let mut gone = e.subscribe_gone();
		e.retire();
		assert!(gone.wait_for(|g| *g).await.is_ok());
		assert_eq!(e.phase, ProcessPhase::Terminated);
	}
}
