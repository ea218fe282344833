use chrono::Utc;
use std::future::Future;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::types::{Health, HealthStatus, PortMap, PORT_MAIN};

/// Port probed when a process declares an endpoint path but no main port.
pub const FALLBACK_PORT: u16 = 3000;
pub const DEFAULT_PATH: &str = "/health";

#[derive(Debug, Clone)]
pub struct HealthConfig {
	pub interval: Duration,
	pub initial_delay: Duration,
	pub timeout: Duration,
}

impl Default for HealthConfig {
	fn default() -> Self {
		Self {
			interval: Duration::from_secs(5),
			initial_delay: Duration::from_secs(2),
			timeout: Duration::from_secs(3),
		}
	}
}

/// The URL to probe, or `None` when the process declares neither a main port
/// nor a health endpoint.
pub fn probe_url(ports: &PortMap, endpoint: Option<&str>) -> Option<String> {
	let main = ports.get(PORT_MAIN).copied();
	match (main, endpoint) {
		(None, None) => None,
		(_, Some(ep)) if ep.starts_with("http://") || ep.starts_with("https://") => Some(ep.to_string()),
		(port, Some(path)) => {
			let port = port.unwrap_or(FALLBACK_PORT);
			if path.starts_with('/') {
				Some(format!("http://localhost:{}{}", port, path))
			} else {
				Some(format!("http://localhost:{}/{}", port, path))
			}
		}
		(Some(port), None) => Some(format!("http://localhost:{}{}", port, DEFAULT_PATH)),
	}
}

pub async fn probe(client: &reqwest::Client, url: &str) -> Health {
	let now = Some(Utc::now());
	match client.get(url).send().await {
		Ok(resp) if resp.status().is_success() => Health {
			status: HealthStatus::Healthy,
			last_checked_at: now,
			error: None,
		},
		Ok(resp) => Health {
			status: HealthStatus::Unhealthy,
			last_checked_at: now,
			error: Some(format!("HTTP {}", resp.status().as_u16())),
		},
		Err(e) => Health {
			status: HealthStatus::Unhealthy,
			last_checked_at: now,
			error: Some(e.to_string()),
		},
	}
}

/// Receiving side of a monitor's cancellation. Checked by the reporter at
/// write time so results that raced a cancel are dropped.
#[derive(Clone)]
pub struct CancelToken(watch::Receiver<bool>);

impl CancelToken {
	pub fn is_cancelled(&self) -> bool {
		*self.0.borrow() || self.0.has_changed().is_err()
	}

	async fn cancelled(&mut self) {
		let _ = self.0.wait_for(|c| *c).await;
	}
}

/// A periodic liveness probe bound to one process lifetime.
pub struct HealthMonitor {
	cancel: watch::Sender<bool>,
	task: JoinHandle<()>,
}

impl HealthMonitor {
	pub fn spawn<F, Fut>(url: String, config: HealthConfig, client: reqwest::Client, report: F) -> Self
	where
		F: Fn(Health, CancelToken) -> Fut + Send + 'static,
		Fut: Future<Output = ()> + Send,
	{
		let (cancel, rx) = watch::channel(false);
		let mut token = CancelToken(rx);

		let task = tokio::spawn(async move {
			let start = Instant::now() + config.initial_delay;
			let mut ticker = tokio::time::interval_at(start, config.interval.max(Duration::from_millis(1)));
			ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

			loop {
				tokio::select! {
					_ = ticker.tick() => {}
					_ = token.cancelled() => return,
				}
				let health = tokio::select! {
					h = probe(&client, &url) => h,
					_ = token.cancelled() => return,
				};
				if token.is_cancelled() {
					return;
				}
				report(health, token.clone()).await;
			}
		});

		Self { cancel, task }
	}

	pub fn cancel(&self) {
		let _ = self.cancel.send(true);
		self.task.abort();
	}

	pub fn is_cancelled(&self) -> bool {
		*self.cancel.borrow()
	}
}

impl Drop for HealthMonitor {
	fn drop(&mut self) {
		self.cancel();
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::sync::atomic::{AtomicUsize, Ordering};
	use std::sync::Arc;

	fn main_port(port: u16) -> PortMap {
		let mut ports = PortMap::new();
		ports.insert(PORT_MAIN.to_string(), port);
		ports
	}

	#[test]
	fn test_probe_url() {
		assert_eq!(probe_url(&PortMap::new(), None), None);
		assert_eq!(
			probe_url(&main_port(5173), None).as_deref(),
			Some("http://localhost:5173/health")
		);
		assert_eq!(
			probe_url(&main_port(5173), Some("/api/ping")).as_deref(),
			Some("http://localhost:5173/api/ping")
		);
		assert_eq!(
			probe_url(&PortMap::new(), Some("ready")).as_deref(),
			Some("http://localhost:3000/ready")
		);
		assert_eq!(
			probe_url(&main_port(1), Some("http://127.0.0.1:9/up")).as_deref(),
			Some("http://127.0.0.1:9/up")
		);
	}

	#[tokio::test]
	async fn test_cancel_stops_reports() {
		let reports = Arc::new(AtomicUsize::new(0));
		let counter = Arc::clone(&reports);
		let monitor = HealthMonitor::spawn(
			// Nothing listens on port 9 (discard); probes fail fast.
			"http://127.0.0.1:9/health".to_string(),
			HealthConfig {
				interval: Duration::from_millis(20),
				initial_delay: Duration::from_millis(0),
				timeout: Duration::from_millis(200),
			},
			reqwest::Client::new(),
			move |health, token| {
				let counter = Arc::clone(&counter);
				async move {
					if !token.is_cancelled() {
						assert_eq!(health.status, HealthStatus::Unhealthy);
						counter.fetch_add(1, Ordering::SeqCst);
					}
				}
			},
		);

		tokio::time::sleep(Duration::from_millis(300)).await;
		monitor.cancel();
		assert!(monitor.is_cancelled());
		let seen = reports.load(Ordering::SeqCst);
		assert!(seen >= 1);

		tokio::time::sleep(Duration::from_millis(200)).await;
		assert_eq!(reports.load(Ordering::SeqCst), seen);
	}
}
