use chrono::Utc;
use nix::sys::signal::Signal;
use std::future::Future;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::{watch, RwLock};

use crate::error::{Error, Result};
use crate::health::{self, CancelToken, HealthConfig, HealthMonitor};
use crate::output::{LogCapture, LogQuery, DEFAULT_CAPACITY};
use crate::policy::{CommandPolicy, CommandShape};
use crate::ports::{self, DEFAULT_MAX_ATTEMPTS};
use crate::registry::{ProcessEntry, ProcessRegistry};
use crate::signal::{self, ProcessHandle, Signaler, UnixSignaler};
use crate::types::*;

/// How long an exited process's pipes may keep draining before the exit is handled.
const PIPE_DRAIN: Duration = Duration::from_millis(200);

const CONVEX_BACKEND: &str = "convex-local-backend";

type BoxFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

#[derive(Debug, Clone)]
pub struct Timings {
	/// Delay between a crash and the automatic relaunch.
	pub restart_delay: Duration,
	/// Time between SIGTERM and SIGKILL on stop.
	pub kill_grace: Duration,
	/// Extra time `restart` waits past `kill_grace` for the old entry to go.
	pub settle_timeout: Duration,
	pub health: HealthConfig,
}

impl Default for Timings {
	fn default() -> Self {
		Self {
			restart_delay: Duration::from_secs(3),
			kill_grace: Duration::from_secs(5),
			settle_timeout: Duration::from_secs(1),
			health: HealthConfig::default(),
		}
	}
}

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
	/// `None` keeps output in memory only.
	pub log_dir: Option<PathBuf>,
	pub buffer_capacity: usize,
	pub timings: Timings,
}

impl Default for SupervisorConfig {
	fn default() -> Self {
		Self {
			log_dir: None,
			buffer_capacity: DEFAULT_CAPACITY,
			timings: Timings::default(),
		}
	}
}

pub struct Supervisor {
	registry: RwLock<ProcessRegistry>,
	config: SupervisorConfig,
	policy: CommandPolicy,
	signaler: Arc<dyn Signaler>,
	http: reqwest::Client,
	generation: AtomicU64,
}

impl Supervisor {
	pub fn new(config: SupervisorConfig) -> Arc<Self> {
		Self::with_signaler(config, Arc::new(UnixSignaler))
	}

	pub fn with_signaler(config: SupervisorConfig, signaler: Arc<dyn Signaler>) -> Arc<Self> {
		let http = reqwest::Client::builder()
			.timeout(config.timings.health.timeout)
			.build()
			.unwrap_or_else(|e| {
				tracing::warn!("health client setup failed, using defaults: {}", e);
				reqwest::Client::new()
			});
		Arc::new(Self {
			registry: RwLock::new(ProcessRegistry::new()),
			config,
			policy: CommandPolicy::new(),
			signaler,
			http,
			generation: AtomicU64::new(0),
		})
	}

	pub fn config(&self) -> &SupervisorConfig {
		&self.config
	}

	pub async fn register_aliases<I, A, T>(&self, aliases: I)
	where
		I: IntoIterator<Item = (A, T)>,
		A: Into<String>,
		T: Into<String>,
	{
		let mut registry = self.registry.write().await;
		for (alias, target) in aliases {
			registry.add_alias(alias, target);
		}
	}

	pub async fn resolve(&self, label: &str) -> String {
		self.registry.read().await.resolve(label)
	}

	pub async fn is_running(&self, label: &str) -> bool {
		self.registry.read().await.lookup(label).is_some()
	}

	/// Validates, spawns and registers one process.
	///
	/// A spawn failure is not an error: it is recorded in the label's log and
	/// reported as `pid: None`, and nothing is registered.
	pub async fn start(self: &Arc<Self>, spec: LaunchSpec) -> Result<Started> {
		self.policy.check(&spec.command)?;

		let mut registry = self.registry.write().await;
		if registry.contains(&spec.label) {
			return Err(Error::DuplicateLabel(spec.label));
		}

		let output = LogCapture::new(
			&spec.label,
			self.config.log_dir.as_deref(),
			self.config.buffer_capacity,
		);
		let mut entry = ProcessEntry::new(spec, output);
		let pid = self.launch(&mut entry).await;
		let started = Started {
			label: entry.spec.label.clone(),
			pid,
			ports: entry.spec.ports.clone(),
			command: entry.spec.command.clone(),
			cwd: entry.spec.cwd.clone(),
			auto_restart: entry.spec.auto_restart,
		};

		if pid.is_some() {
			registry.insert(entry)?;
		} else {
			entry.retire();
		}
		Ok(started)
	}

	/// Starts `project:<service.label>` with negotiated ports.
	pub async fn start_service(
		self: &Arc<Self>,
		project: &str,
		cwd: &Path,
		service: &ServiceDef,
	) -> Result<Started> {
		let label = qualified_label(Some(project), &service.label);
		let mut spec = LaunchSpec::new(label, cwd, service.command.clone());

		if let Some(wanted) = service.port {
			let port = ports::find_available(wanted, DEFAULT_MAX_ATTEMPTS).await?;
			if port != wanted {
				tracing::info!("{}: port {} in use, using {}", spec.label, wanted, port);
				spec.env.insert("PORT".to_string(), port.to_string());
			}
			spec.ports.insert(PORT_MAIN.to_string(), port);
		}

		if let (Some(cloud), Some(site)) = (service.cloud_port, service.site_port) {
			let cloud = ports::find_available(cloud, DEFAULT_MAX_ATTEMPTS).await?;
			let site = ports::find_available_by(site, DEFAULT_MAX_ATTEMPTS, move |p| async move {
				p != cloud && ports::check_available(p).await
			})
			.await?;
			spec.ports.insert(PORT_CLOUD.to_string(), cloud);
			spec.ports.insert(PORT_SITE.to_string(), site);
			if self.policy.classify(&spec.command) == Some(CommandShape::ConvexDev) {
				spec.command = format!(
					"{} --local --local-cloud-port {} --local-site-port {}",
					spec.command, cloud, site
				);
			}
		}

		spec.health_endpoint = service.health_endpoint.clone();
		self.start(spec).await
	}

	/// Begins termination and returns without waiting for the exit.
	pub async fn stop(self: &Arc<Self>, label: &str) -> Result<Stopped> {
		let mut registry = self.registry.write().await;
		let canonical = registry.resolve(label);
		let Some(entry) = registry.get_mut(&canonical) else {
			return Err(Error::ProcessNotFound(label.to_string()));
		};

		entry.spec.auto_restart = false;
		entry.cancel_monitor();
		let pid = entry.pid();

		// The convex local backend detaches from the group, so the group signal misses it.
		if entry.phase != ProcessPhase::Stopping && entry.spec.command.contains("convex") {
			self.signaler.kill_matching(CONVEX_BACKEND);
		}

		match (entry.handle, entry.phase) {
			(Some(_), ProcessPhase::Stopping) => {}
			(Some(handle), _) => {
				entry.phase = ProcessPhase::Stopping;
				tracing::info!("{}: stopping pid {}", canonical, handle.pid);
				signal::terminate(self.signaler.as_ref(), handle, Signal::SIGTERM);

				let sup = Arc::clone(self);
				let generation = entry.generation;
				let grace = self.config.timings.kill_grace;
				let target = canonical.clone();
				entry.pending = Some(tokio::spawn(async move {
					tokio::time::sleep(grace).await;
					sup.force_kill(&target, generation).await;
				}));
			}
			// Waiting out a restart delay: there is nothing to signal.
			(None, _) => {
				if let Some(mut entry) = registry.remove(&canonical) {
					entry.retire();
				}
			}
		}

		Ok(Stopped {
			label: canonical,
			pid,
		})
	}

	/// Stops the current instance, waits for it to leave the registry, then
	/// launches again with the previous settings unless overridden. Without a
	/// current instance this is a plain start.
	pub async fn restart(self: &Arc<Self>, label: &str, overrides: RestartOverrides) -> Result<Started> {
		let canonical = self.resolve(label).await;
		let previous = {
			let registry = self.registry.read().await;
			registry
				.get(&canonical)
				.map(|e| {
					// A stop already in flight has cleared the live flag.
					let mut spec = e.spec.clone();
					spec.auto_restart = e.auto_restart_requested;
					(spec, e.subscribe_gone())
				})
		};

		let mut spec = match previous {
			Some((spec, gone)) => {
				match self.stop(&canonical).await {
					Ok(_) | Err(Error::ProcessNotFound(_)) => {}
					Err(e) => return Err(e),
				}
				self.wait_gone(&canonical, gone).await;
				spec
			}
			None => {
				let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
				LaunchSpec::new(canonical.clone(), cwd, DEFAULT_COMMAND)
			}
		};

		if let Some(cwd) = overrides.cwd {
			spec.cwd = cwd;
		}
		if let Some(command) = overrides.command {
			spec.command = command;
		}
		if let Some(auto_restart) = overrides.auto_restart {
			spec.auto_restart = auto_restart;
		}
		self.start(spec).await
	}

	async fn wait_gone(&self, label: &str, mut gone: watch::Receiver<bool>) {
		let bound = self.config.timings.kill_grace + self.config.timings.settle_timeout;
		let confirmed = tokio::time::timeout(bound, async { gone.wait_for(|g| *g).await.is_ok() })
			.await
			.unwrap_or(false);
		if !confirmed {
			tracing::warn!("{}: previous instance still registered after {:?}", label, bound);
		}
	}

	/// Stops every `project:`-prefixed entry.
	pub async fn group_stop(self: &Arc<Self>, project: &str) -> Vec<Stopped> {
		let labels: Vec<String> = {
			let registry = self.registry.read().await;
			registry
				.list_by_project_prefix(project)
				.into_iter()
				.map(|e| e.label().to_string())
				.collect()
		};
		self.stop_all(labels).await
	}

	/// Stops every entry whose working directory is `cwd`.
	pub async fn stop_in_dir(self: &Arc<Self>, cwd: &Path) -> Vec<Stopped> {
		let labels: Vec<String> = {
			let registry = self.registry.read().await;
			let mut labels: Vec<String> = registry
				.iter()
				.filter(|e| e.spec.cwd == cwd)
				.map(|e| e.label().to_string())
				.collect();
			labels.sort();
			labels
		};
		self.stop_all(labels).await
	}

	async fn stop_all(self: &Arc<Self>, labels: Vec<String>) -> Vec<Stopped> {
		let mut stopped = Vec::new();
		for label in labels {
			// Entries can exit between listing and stopping.
			if let Ok(s) = self.stop(&label).await {
				stopped.push(s);
			}
		}
		stopped
	}

	pub async fn logs(&self, label: &str, query: &LogQuery) -> Result<LogExcerpt> {
		let (label, output) = {
			let registry = self.registry.read().await;
			let entry = registry
				.lookup(label)
				.ok_or_else(|| Error::ProcessNotFound(label.to_string()))?;
			(entry.label().to_string(), entry.output.clone())
		};
		let records = output.query(query).await?;
		Ok(LogExcerpt { label, records })
	}

	/// Snapshot of every entry, or of one project's entries, sorted by label.
	pub async fn status(&self, project: Option<&str>) -> Vec<ProcessStatus> {
		let registry = self.registry.read().await;
		let entries = match project {
			Some(p) => registry.list_by_project_prefix(p),
			None => {
				let mut all: Vec<&ProcessEntry> = registry.iter().collect();
				all.sort_by(|a, b| a.label().cmp(b.label()));
				all
			}
		};

		entries
			.into_iter()
			.map(|e| ProcessStatus {
				label: e.label().to_string(),
				aliases: registry.aliases_for(e.label()),
				pid: e.pid(),
				command: e.spec.command.clone(),
				cwd: e.spec.cwd.clone(),
				phase: e.phase,
				started_at: e.started_at,
				uptime_secs: e.started.elapsed().as_secs(),
				ports: e.spec.ports.clone(),
				health: e.health.clone(),
				auto_restart: e.spec.auto_restart,
			})
			.collect()
	}

	/// Sends SIGTERM to every live group, cancels all monitors and timers, and
	/// waits for the exits to be recorded. Groups still alive after the kill
	/// grace get SIGKILL.
	pub async fn shutdown(&self) {
		let mut gone = {
			let mut registry = self.registry.write().await;
			let mut gone = Vec::new();
			let mut idle = Vec::new();
			for entry in registry.iter_mut() {
				entry.spec.auto_restart = false;
				entry.cancel_monitor();
				if let Some(pending) = entry.pending.take() {
					pending.abort();
				}
				match entry.handle {
					Some(handle) => {
						tracing::info!("{}: terminating pid {}", entry.label(), handle.pid);
						signal::terminate(self.signaler.as_ref(), handle, Signal::SIGTERM);
						entry.phase = ProcessPhase::Stopping;
						gone.push(entry.subscribe_gone());
					}
					None => idle.push(entry.label().to_string()),
				}
			}
			for label in idle {
				if let Some(mut entry) = registry.remove(&label) {
					entry.retire();
				}
			}
			gone
		};

		let grace = self.config.timings.kill_grace;
		if tokio::time::timeout(grace, all_gone(&mut gone)).await.is_ok() {
			return;
		}

		{
			let registry = self.registry.read().await;
			for entry in registry.iter() {
				if let Some(handle) = entry.handle {
					tracing::warn!("{}: pid {} survived shutdown, sending SIGKILL", entry.label(), handle.pid);
					signal::terminate(self.signaler.as_ref(), handle, Signal::SIGKILL);
				}
			}
		}
		let settle = self.config.timings.settle_timeout;
		if tokio::time::timeout(settle, all_gone(&mut gone)).await.is_err() {
			tracing::warn!("shutdown finished with processes still registered");
		}
	}

	/// Spawns `entry.spec` and attaches output capture, the exit waiter and
	/// the health monitor. Returns the pid, or `None` if the spawn failed.
	async fn launch(self: &Arc<Self>, entry: &mut ProcessEntry) -> Option<u32> {
		let label = entry.spec.label.clone();
		let mut cmd = Command::new("sh");
		cmd.args(["-c", &entry.spec.command])
			.current_dir(&entry.spec.cwd)
			.envs(&entry.spec.env)
			.stdin(Stdio::null())
			.stdout(Stdio::piped())
			.stderr(Stdio::piped())
			.process_group(0);

		let spawned = cmd
			.spawn()
			.and_then(|child| match child.id() {
				Some(pid) => Ok((child, pid)),
				None => Err(std::io::Error::other("exited before its pid was read")),
			});
		let (mut child, pid) = match spawned {
			Ok(c) => c,
			Err(e) => {
				tracing::error!("{}: failed to spawn {:?}: {}", label, entry.spec.command, e);
				let mut record = LogRecord::new(&label, None, format!("failed to spawn: {}", e));
				record.error = true;
				entry.output.append(record).await;
				return None;
			}
		};

		let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
		entry.generation = generation;
		entry.handle = Some(ProcessHandle::group_leader(pid));
		entry.phase = ProcessPhase::Running;
		entry.health = Health::starting();
		entry.started_at = Utc::now();
		entry.started = Instant::now();
		tracing::info!("{}: spawned pid {} ({})", label, pid, entry.spec.command);

		let mut pipes = Vec::new();
		if let Some(stdout) = child.stdout.take() {
			pipes.push(tokio::spawn(pipe_output(stdout, label.clone(), pid, entry.output.clone())));
		}
		if let Some(stderr) = child.stderr.take() {
			pipes.push(tokio::spawn(pipe_output(stderr, label.clone(), pid, entry.output.clone())));
		}

		let sup = Arc::clone(self);
		let output = entry.output.clone();
		let waiter_label = label.clone();
		tokio::spawn(async move {
			let status = child.wait().await;
			for pipe in pipes {
				let _ = tokio::time::timeout(PIPE_DRAIN, pipe).await;
			}
			sup.on_exit(&waiter_label, generation, pid, &output, status).await;
		});

		if let Some(url) = health::probe_url(&entry.spec.ports, entry.spec.health_endpoint.as_deref()) {
			tracing::debug!("{}: probing {}", label, url);
			entry.monitor = Some(self.spawn_monitor(label, generation, url));
		}

		Some(pid)
	}

	fn spawn_monitor(self: &Arc<Self>, label: String, generation: u64, url: String) -> HealthMonitor {
		let sup: Weak<Self> = Arc::downgrade(self);
		HealthMonitor::spawn(
			url,
			self.config.timings.health.clone(),
			self.http.clone(),
			move |health, token| {
				let sup = sup.clone();
				let label = label.clone();
				async move {
					if let Some(sup) = sup.upgrade() {
						sup.record_health(&label, generation, &token, health).await;
					}
				}
			},
		)
	}

	async fn record_health(&self, label: &str, generation: u64, token: &CancelToken, health: Health) {
		let mut registry = self.registry.write().await;
		// Cancellation happens under this lock, so a result that lost the race is dropped here.
		if token.is_cancelled() {
			return;
		}
		let Some(entry) = registry.get_mut(label) else {
			return;
		};
		if entry.generation != generation {
			return;
		}

		let previous = entry.health.status;
		if health.status == HealthStatus::Unhealthy && previous != HealthStatus::Unhealthy {
			let reason = health.error.clone().unwrap_or_else(|| "no response".to_string());
			tracing::warn!("{}: health check failed: {}", label, reason);
			let record = LogRecord::new(label, entry.pid(), format!("health check failed: {}", reason));
			entry.output.append(record).await;
		} else if health.status == HealthStatus::Healthy && previous != HealthStatus::Healthy {
			tracing::info!("{}: healthy", label);
		}
		entry.health = health;
	}

	async fn on_exit(
		self: &Arc<Self>,
		label: &str,
		generation: u64,
		pid: u32,
		output: &LogCapture,
		status: std::io::Result<ExitStatus>,
	) {
		let exit = match &status {
			Ok(s) => ExitInfo {
				code: s.code(),
				signal: s.signal().map(signal::signal_name),
			},
			Err(e) => {
				tracing::warn!("{}: waiting on pid {} failed: {}", label, pid, e);
				ExitInfo {
					code: None,
					signal: None,
				}
			}
		};

		let code = exit.code.map(|c| c.to_string()).unwrap_or_else(|| "none".into());
		let sig = exit.signal.clone().unwrap_or_else(|| "none".into());
		tracing::info!("{}: pid {} exited (code: {}, signal: {})", label, pid, code, sig);
		let mut record = LogRecord::new(
			label,
			Some(pid),
			format!("process exited (code: {}, signal: {})", code, sig),
		);
		record.exit = Some(exit.clone());
		output.append(record).await;

		let mut registry = self.registry.write().await;
		let Some(entry) = registry.get_mut(label) else {
			return;
		};
		if entry.generation != generation {
			return;
		}
		entry.cancel_monitor();
		entry.handle = None;

		if entry.spec.auto_restart && crashed(&exit) {
			let delay = self.config.timings.restart_delay;
			tracing::info!("{}: crashed, restarting in {:?}", label, delay);
			entry.phase = ProcessPhase::Exited;

			let sup = Arc::clone(self);
			let target = label.to_string();
			entry.pending = Some(tokio::spawn(async move {
				tokio::time::sleep(delay).await;
				sup.relaunch(target, generation).await;
			}));
		} else if let Some(mut entry) = registry.remove(label) {
			entry.retire();
		}
	}

	/// Fires after the restart delay. No-op unless the same exited instance
	/// is still registered with auto-restart on.
	///
	/// Boxed because it re-enters `launch`, whose exit waiter leads back here.
	fn relaunch(self: Arc<Self>, label: String, generation: u64) -> BoxFuture {
		Box::pin(async move {
			let mut registry = self.registry.write().await;
			let Some(entry) = registry.get_mut(&label) else {
				return;
			};
			if entry.generation != generation
				|| entry.phase != ProcessPhase::Exited
				|| !entry.spec.auto_restart
			{
				return;
			}
			// This task is the pending handle; drop it without aborting ourselves.
			entry.pending.take();

			tracing::info!("{}: relaunching", label);
			if self.launch(entry).await.is_none() {
				if let Some(mut entry) = registry.remove(&label) {
					entry.retire();
				}
			}
		})
	}

	async fn force_kill(&self, label: &str, generation: u64) {
		let mut registry = self.registry.write().await;
		let Some(entry) = registry.get_mut(label) else {
			return;
		};
		if entry.generation != generation {
			return;
		}
		entry.pending.take();

		if let Some(handle) = entry.handle {
			tracing::warn!(
				"{}: pid {} still running after {:?}, sending SIGKILL",
				label,
				handle.pid,
				self.config.timings.kill_grace
			);
			signal::terminate(self.signaler.as_ref(), handle, Signal::SIGKILL);
		}
		if let Some(mut entry) = registry.remove(label) {
			entry.retire();
		}
	}
}

async fn all_gone(receivers: &mut [watch::Receiver<bool>]) {
	for gone in receivers.iter_mut() {
		let _ = gone.wait_for(|g| *g).await;
	}
}

/// A non-zero exit that the supervisor's own stop signals did not cause.
fn crashed(exit: &ExitInfo) -> bool {
	let by_stop = matches!(exit.signal.as_deref(), Some("SIGTERM") | Some("SIGKILL"));
	exit.code != Some(0) && !by_stop
}

async fn pipe_output<R: AsyncRead + Unpin>(reader: R, label: String, pid: u32, output: LogCapture) {
	let mut reader = BufReader::new(reader);
	let mut buf = Vec::new();
	loop {
		buf.clear();
		match reader.read_until(b'\n', &mut buf).await {
			Ok(0) => break,
			Ok(_) => {
				let line = String::from_utf8_lossy(&buf);
				let line = line.trim_end_matches(['\n', '\r']);
				if line.trim().is_empty() {
					continue;
				}
				output.append(LogRecord::new(&label, Some(pid), line)).await;
			}
			Err(e) => {
				tracing::debug!("{}: output pipe closed: {}", label, e);
				break;
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_crashed() {
		let exit = |code: Option<i32>, signal: Option<&str>| ExitInfo {
			code,
			signal: signal.map(String::from),
		};
		assert!(crashed(&exit(Some(1), None)));
		assert!(crashed(&exit(None, Some("SIGSEGV"))));
		assert!(crashed(&exit(None, None)));
		assert!(!crashed(&exit(Some(0), None)));
		assert!(!crashed(&exit(None, Some("SIGTERM"))));
		assert!(!crashed(&exit(None, Some("SIGKILL"))));
	}

	#[tokio::test]
	async fn test_disallowed_command_spawns_nothing() {
		let sup = Supervisor::new(SupervisorConfig::default());
		let err = sup
			.start(LaunchSpec::new("x", "/tmp", "rm -rf /tmp/nothing"))
			.await
			.unwrap_err();
		assert!(matches!(err, Error::CommandNotAllowed(_)));
		assert!(sup.status(None).await.is_empty());
	}

	#[tokio::test]
	async fn test_spawn_failure_is_logged_not_registered() {
		let sup = Supervisor::new(SupervisorConfig::default());
		let started = sup
			.start(LaunchSpec::new("ghost", "/nonexistent/devserve/dir", "node server.js"))
			.await
			.unwrap();
		assert_eq!(started.pid, None);
		assert!(!sup.is_running("ghost").await);
	}

	#[tokio::test]
	async fn test_stop_unknown() {
		let sup = Supervisor::new(SupervisorConfig::default());
		assert!(matches!(sup.stop("nope").await, Err(Error::ProcessNotFound(l)) if l == "nope"));
		assert!(matches!(
			sup.logs("nope", &LogQuery::default()).await,
			Err(Error::ProcessNotFound(_))
		));
	}
}
