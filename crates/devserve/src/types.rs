use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Command used when a start request names none.
pub const DEFAULT_COMMAND: &str = "pnpm dev";

pub const PORT_MAIN: &str = "main";
pub const PORT_CLOUD: &str = "cloud";
pub const PORT_SITE: &str = "site";

/// Port role (`main`, `cloud`, `site`) to allocated port.
pub type PortMap = BTreeMap<String, u16>;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
	Starting,
	Healthy,
	Unhealthy,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Health {
	pub status: HealthStatus,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub last_checked_at: Option<DateTime<Utc>>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub error: Option<String>,
}

impl Health {
	pub fn starting() -> Self {
		Self {
			status: HealthStatus::Starting,
			last_checked_at: None,
			error: None,
		}
	}
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ProcessPhase {
	Starting,
	Running,
	/// Exited and waiting for the auto-restart delay to elapse.
	Exited,
	Stopping,
	Terminated,
}

impl ProcessPhase {
	pub fn is_live(&self) -> bool {
		matches!(self, ProcessPhase::Starting | ProcessPhase::Running | ProcessPhase::Stopping)
	}
}

/// Everything needed to spawn (and later respawn) one labelled process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LaunchSpec {
	pub label: String,
	pub cwd: PathBuf,
	pub command: String,
	#[serde(default)]
	pub ports: PortMap,
	#[serde(default)]
	pub env: BTreeMap<String, String>,
	#[serde(default)]
	pub health_endpoint: Option<String>,
	#[serde(default = "default_true")]
	pub auto_restart: bool,
}

fn default_true() -> bool {
	true
}

impl LaunchSpec {
	pub fn new(label: impl Into<String>, cwd: impl Into<PathBuf>, command: impl Into<String>) -> Self {
		Self {
			label: label.into(),
			cwd: cwd.into(),
			command: command.into(),
			ports: PortMap::new(),
			env: BTreeMap::new(),
			health_endpoint: None,
			auto_restart: true,
		}
	}

	pub fn port(mut self, role: &str, port: u16) -> Self {
		self.ports.insert(role.to_string(), port);
		self
	}

	pub fn env(mut self, key: impl Into<String>, val: impl Into<String>) -> Self {
		self.env.insert(key.into(), val.into());
		self
	}

	pub fn health_endpoint(mut self, endpoint: impl Into<String>) -> Self {
		self.health_endpoint = Some(endpoint.into());
		self
	}

	pub fn auto_restart(mut self, enabled: bool) -> Self {
		self.auto_restart = enabled;
		self
	}
}

/// Optional replacements applied by `restart`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RestartOverrides {
	#[serde(default)]
	pub cwd: Option<PathBuf>,
	#[serde(default)]
	pub command: Option<String>,
	#[serde(default)]
	pub auto_restart: Option<bool>,
}

/// One service of a declarative project file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ServiceDef {
	pub label: String,
	pub command: String,
	#[serde(default)]
	pub port: Option<u16>,
	#[serde(default)]
	pub cloud_port: Option<u16>,
	#[serde(default)]
	pub site_port: Option<u16>,
	#[serde(default)]
	pub health_endpoint: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Started {
	pub label: String,
	/// `None` when the spawn itself failed; the reason is in the label's log.
	pub pid: Option<u32>,
	pub ports: PortMap,
	pub command: String,
	pub cwd: PathBuf,
	pub auto_restart: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Stopped {
	pub label: String,
	pub pid: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExitInfo {
	pub code: Option<i32>,
	pub signal: Option<String>,
}

/// One captured output line, as kept in memory and written to the JSONL log.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LogRecord {
	pub time: DateTime<Utc>,
	pub line: String,
	pub label: String,
	pub pid: Option<u32>,
	#[serde(default, skip_serializing_if = "std::ops::Not::not")]
	pub error: bool,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub exit: Option<ExitInfo>,
}

impl LogRecord {
	pub fn new(label: &str, pid: Option<u32>, line: impl Into<String>) -> Self {
		Self {
			time: Utc::now(),
			line: line.into(),
			label: label.to_string(),
			pid,
			error: false,
			exit: None,
		}
	}
}

/// The records a `logs` query selected, under the label they were resolved to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogExcerpt {
	pub label: String,
	pub records: Vec<LogRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessStatus {
	pub label: String,
	pub aliases: Vec<String>,
	pub pid: Option<u32>,
	pub command: String,
	pub cwd: PathBuf,
	pub phase: ProcessPhase,
	pub started_at: DateTime<Utc>,
	pub uptime_secs: u64,
	pub ports: PortMap,
	pub health: Health,
	pub auto_restart: bool,
}

/// Splits `project:service` into its parts.
pub fn split_label(label: &str) -> (Option<&str>, &str) {
	match label.split_once(':') {
		Some((project, service)) => (Some(project), service),
		None => (None, label),
	}
}

pub fn qualified_label(project: Option<&str>, service: &str) -> String {
	match project {
		Some(p) if !p.is_empty() => format!("{}:{}", p, service),
		_ => service.to_string(),
	}
}
