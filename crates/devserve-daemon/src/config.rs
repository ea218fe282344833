use devserve::health::HealthConfig;
use devserve::{SupervisorConfig, Timings};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

const APP_NAME: &str = "devserve";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
	#[error("failed to read {path}: {source}")]
	Read {
		path: PathBuf,
		#[source]
		source: std::io::Error,
	},
	#[error("failed to parse {path}: {source}")]
	Toml {
		path: PathBuf,
		#[source]
		source: toml::de::Error,
	},
	#[error("failed to parse {path}: {source}")]
	Json {
		path: PathBuf,
		#[source]
		source: serde_json::Error,
	},
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct GlobalConfig {
	#[serde(default)]
	pub daemon: DaemonConfig,
	#[serde(default)]
	pub logs: LogsConfig,
	#[serde(default)]
	pub health: HealthSettings,
	#[serde(default)]
	pub projects: ProjectsConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DaemonConfig {
	#[serde(default = "default_port")]
	pub port: u16,
}

impl Default for DaemonConfig {
	fn default() -> Self {
		Self {
			port: default_port(),
		}
	}
}

fn default_port() -> u16 {
	13371
}

#[derive(Debug, Clone, Deserialize)]
pub struct LogsConfig {
	pub dir: Option<String>,
	#[serde(default = "default_max_age_days")]
	pub max_age_days: u32,
}

impl Default for LogsConfig {
	fn default() -> Self {
		Self {
			dir: None,
			max_age_days: default_max_age_days(),
		}
	}
}

fn default_max_age_days() -> u32 {
	7
}

#[derive(Debug, Clone, Deserialize)]
pub struct HealthSettings {
	#[serde(default = "default_interval_ms")]
	pub interval_ms: u64,
	#[serde(default = "default_timeout_ms")]
	pub timeout_ms: u64,
}

impl Default for HealthSettings {
	fn default() -> Self {
		Self {
			interval_ms: default_interval_ms(),
			timeout_ms: default_timeout_ms(),
		}
	}
}

fn default_interval_ms() -> u64 {
	5000
}
fn default_timeout_ms() -> u64 {
	3000
}

/// Directories searched, in order, for `<root>/<project>` on group start.
/// Relative roots resolve against the request's working directory.
#[derive(Debug, Clone, Deserialize)]
pub struct ProjectsConfig {
	#[serde(default = "default_roots")]
	pub roots: Vec<String>,
}

impl Default for ProjectsConfig {
	fn default() -> Self {
		Self {
			roots: default_roots(),
		}
	}
}

fn default_roots() -> Vec<String> {
	vec![".".into(), "..".into(), "~/Work".into(), "~/Projects".into()]
}

impl GlobalConfig {
	pub fn parse(path: &Path, content: &str) -> Result<Self, ConfigError> {
		toml::from_str(content).map_err(|source| ConfigError::Toml {
			path: path.to_path_buf(),
			source,
		})
	}

	/// Applies `DEVSERVER_HEALTH_INTERVAL_MS` and `DEVSERVER_LOG_DIR`.
	pub fn apply_env<F>(&mut self, lookup: F)
	where
		F: Fn(&str) -> Option<String>,
	{
		if let Some(raw) = lookup("DEVSERVER_HEALTH_INTERVAL_MS") {
			match raw.trim().parse::<u64>() {
				Ok(ms) if ms > 0 => self.health.interval_ms = ms,
				_ => tracing::warn!("ignoring DEVSERVER_HEALTH_INTERVAL_MS={:?}", raw),
			}
		}
		if let Some(dir) = lookup("DEVSERVER_LOG_DIR").filter(|d| !d.is_empty()) {
			self.logs.dir = Some(dir);
		}
	}

	pub fn log_dir(&self) -> PathBuf {
		match &self.logs.dir {
			Some(dir) => expand_tilde(dir),
			None => state_dir().join("logs"),
		}
	}

	/// `log_dir: None` means durable logging is unavailable.
	pub fn supervisor_config(&self, log_dir: Option<PathBuf>) -> SupervisorConfig {
		SupervisorConfig {
			log_dir,
			timings: Timings {
				health: HealthConfig {
					interval: Duration::from_millis(self.health.interval_ms),
					timeout: Duration::from_millis(self.health.timeout_ms),
					..HealthConfig::default()
				},
				..Timings::default()
			},
			..SupervisorConfig::default()
		}
	}
}

/// Missing file: defaults. Unreadable or invalid file: warned, then defaults.
pub fn load_global_config() -> GlobalConfig {
	let path = config_dir().join("config.toml");
	let mut config = if path.exists() {
		let loaded = std::fs::read_to_string(&path)
			.map_err(|source| ConfigError::Read {
				path: path.clone(),
				source,
			})
			.and_then(|content| GlobalConfig::parse(&path, &content));
		match loaded {
			Ok(config) => config,
			Err(e) => {
				tracing::warn!("{}, using defaults", e);
				GlobalConfig::default()
			}
		}
	} else {
		GlobalConfig::default()
	};
	config.apply_env(|key| std::env::var(key).ok());
	config
}

/// Request authorization, configured by `DEVSERVER_AUTH` and `DEVSERVER_TOKEN`.
#[derive(Debug, Clone, Default)]
pub struct AuthConfig {
	pub required: bool,
	pub token: Option<String>,
}

impl AuthConfig {
	pub fn from_env<F>(lookup: F) -> Self
	where
		F: Fn(&str) -> Option<String>,
	{
		Self {
			required: lookup("DEVSERVER_AUTH").as_deref() == Some("true"),
			token: lookup("DEVSERVER_TOKEN").filter(|t| !t.is_empty()),
		}
	}

	/// With auth required and no token configured, nothing is accepted.
	pub fn check(&self, presented: Option<&str>) -> bool {
		if !self.required {
			return true;
		}
		match (&self.token, presented) {
			(Some(expected), Some(given)) => expected == given,
			_ => false,
		}
	}
}

pub fn state_dir() -> PathBuf {
	xdg_dir("XDG_STATE_HOME", &[".local", "state"]).unwrap_or_else(|| PathBuf::from("/tmp").join(APP_NAME))
}

pub fn config_dir() -> PathBuf {
	xdg_dir("XDG_CONFIG_HOME", &[".config"])
		.unwrap_or_else(|| PathBuf::from("/tmp").join(APP_NAME).join("config"))
}

fn xdg_dir(var: &str, under_home: &[&str]) -> Option<PathBuf> {
	if let Some(dir) = std::env::var_os(var).filter(|d| !d.is_empty()) {
		return Some(PathBuf::from(dir).join(APP_NAME));
	}
	let mut dir = home_dir()?;
	for part in under_home {
		dir.push(part);
	}
	Some(dir.join(APP_NAME))
}

pub fn socket_path() -> PathBuf {
	state_dir().join("daemon.sock")
}

pub fn pid_path() -> PathBuf {
	state_dir().join("daemon.pid")
}

pub fn home_dir() -> Option<PathBuf> {
	std::env::var_os("HOME").filter(|h| !h.is_empty()).map(PathBuf::from)
}

pub fn expand_tilde(path: &str) -> PathBuf {
	match (path.strip_prefix("~/"), home_dir()) {
		(Some(rest), Some(home)) => home.join(rest),
		_ if path == "~" => home_dir().unwrap_or_else(|| PathBuf::from(path)),
		_ => PathBuf::from(path),
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::collections::HashMap;

	#[test]
	fn test_parse_partial_config() {
		let config = GlobalConfig::parse(
			Path::new("config.toml"),
			r#"
[daemon]
port = 9000

[health]
interval_ms = 1000

[projects]
roots = ["~/code"]
"#,
		)
		.unwrap();
		assert_eq!(config.daemon.port, 9000);
		assert_eq!(config.health.interval_ms, 1000);
		assert_eq!(config.health.timeout_ms, 3000);
		assert_eq!(config.logs.max_age_days, 7);
		assert_eq!(config.projects.roots, vec!["~/code"]);
	}

	#[test]
	fn test_parse_invalid_config() {
		let err = GlobalConfig::parse(Path::new("config.toml"), "[daemon]\nport = \"x\"").unwrap_err();
		assert!(matches!(err, ConfigError::Toml { .. }));
	}

	#[test]
	fn test_env_overrides() {
		let env: HashMap<&str, &str> = [
			("DEVSERVER_HEALTH_INTERVAL_MS", "250"),
			("DEVSERVER_LOG_DIR", "/var/tmp/devserve-logs"),
		]
		.into_iter()
		.collect();
		let mut config = GlobalConfig::default();
		config.apply_env(|k| env.get(k).map(|v| v.to_string()));
		assert_eq!(config.health.interval_ms, 250);
		assert_eq!(config.log_dir(), PathBuf::from("/var/tmp/devserve-logs"));

		let sup = config.supervisor_config(None);
		assert_eq!(sup.timings.health.interval, Duration::from_millis(250));
		assert_eq!(sup.timings.health.initial_delay, Duration::from_secs(2));
		assert_eq!(sup.timings.kill_grace, Duration::from_secs(5));
	}

	#[test]
	fn test_bad_interval_is_ignored() {
		let mut config = GlobalConfig::default();
		config.apply_env(|k| (k == "DEVSERVER_HEALTH_INTERVAL_MS").then(|| "soon".to_string()));
		assert_eq!(config.health.interval_ms, 5000);
	}

	#[test]
	fn test_auth() {
		let open = AuthConfig::from_env(|_| None);
		assert!(open.check(None));

		let env: HashMap<&str, &str> = [("DEVSERVER_AUTH", "true"), ("DEVSERVER_TOKEN", "s3cret")]
			.into_iter()
			.collect();
		let auth = AuthConfig::from_env(|k| env.get(k).map(|v| v.to_string()));
		assert!(auth.check(Some("s3cret")));
		assert!(!auth.check(Some("guess")));
		assert!(!auth.check(None));

		let no_token = AuthConfig::from_env(|k| (k == "DEVSERVER_AUTH").then(|| "true".to_string()));
		assert!(!no_token.check(Some("")));
		assert!(!no_token.check(None));
	}
}
