mod api;
mod config;
mod handlers;
mod project;
mod protocol;
mod render;

use devserve::{logs, Supervisor};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixListener;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::Notify;
use tracing_subscriber::EnvFilter;

use crate::config::AuthConfig;
use crate::handlers::Daemon;
use crate::protocol::{Envelope, Response};

const EXPIRY_INTERVAL: Duration = Duration::from_secs(3600);

#[tokio::main]
async fn main() {
	tracing_subscriber::fmt()
		.with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
		.with_writer(std::io::stderr)
		.init();

	let args: Vec<String> = std::env::args().skip(1).collect();
	let enable_http = args.iter().any(|a| a == "--http");

	let global_config = config::load_global_config();
	let auth = AuthConfig::from_env(|key| std::env::var(key).ok());
	if auth.required && auth.token.is_none() {
		tracing::warn!("DEVSERVER_AUTH is set without DEVSERVER_TOKEN; every request will be refused");
	}

	let state_dir = config::state_dir();
	if let Err(e) = std::fs::create_dir_all(&state_dir) {
		tracing::error!("cannot create {}: {}", state_dir.display(), e);
	}

	let log_dir = prepare_log_dir(&global_config.log_dir());
	let supervisor = Supervisor::new(global_config.supervisor_config(log_dir.clone()));

	let pid_path = config::pid_path();
	if let Err(e) = std::fs::write(&pid_path, std::process::id().to_string()) {
		tracing::warn!("cannot write {}: {}", pid_path.display(), e);
	}

	let socket_path = config::socket_path();
	if socket_path.exists() {
		let _ = std::fs::remove_file(&socket_path);
	}

	if let Some(dir) = log_dir {
		let max_age_days = global_config.logs.max_age_days;
		tokio::spawn(async move {
			loop {
				let removed = logs::expire_logs(&dir, max_age_days, logs::today());
				if removed > 0 {
					tracing::info!("removed {} expired log files", removed);
				}
				tokio::time::sleep(EXPIRY_INTERVAL).await;
			}
		});
	}

	let shutdown = Arc::new(Notify::new());
	let daemon = Arc::new(Daemon {
		supervisor: Arc::clone(&supervisor),
		auth,
		project_roots: global_config.projects.roots.clone(),
		shutdown: Arc::clone(&shutdown),
	});

	let socket_daemon = Arc::clone(&daemon);
	let socket_listen = socket_path.clone();
	let socket_handle = tokio::spawn(async move {
		run_socket_server(socket_daemon, &socket_listen).await;
	});

	let http_handle = if enable_http {
		let http_daemon = Arc::clone(&daemon);
		let port = global_config.daemon.port;
		Some(tokio::spawn(async move {
			run_http_server(http_daemon, port).await;
		}))
	} else {
		None
	};

	tracing::info!("daemon started (pid {})", std::process::id());

	let mut sigterm = match signal(SignalKind::terminate()) {
		Ok(s) => Some(s),
		Err(e) => {
			tracing::warn!("cannot listen for SIGTERM: {}", e);
			None
		}
	};

	tokio::select! {
		_ = socket_handle => {},
		_ = async {
			if let Some(h) = http_handle { h.await.ok(); }
			else { std::future::pending::<()>().await; }
		} => {},
		_ = tokio::signal::ctrl_c() => {
			tracing::info!("interrupted, shutting down");
		}
		_ = async {
			match sigterm.as_mut() {
				Some(s) => { s.recv().await; }
				None => std::future::pending::<()>().await,
			}
		} => {
			tracing::info!("terminated, shutting down");
		}
		_ = shutdown.notified() => {
			tracing::info!("shutdown requested");
		}
	}

	supervisor.shutdown().await;

	let _ = std::fs::remove_file(&socket_path);
	let _ = std::fs::remove_file(&pid_path);
}

/// Durable logging degrades to in-memory when the directory is unusable.
fn prepare_log_dir(dir: &Path) -> Option<PathBuf> {
	match std::fs::create_dir_all(dir) {
		Ok(()) => Some(dir.to_path_buf()),
		Err(e) => {
			tracing::error!(
				"cannot create log dir {}: {}; keeping logs in memory only",
				dir.display(),
				e
			);
			None
		}
	}
}

async fn run_socket_server(daemon: Arc<Daemon>, socket_path: &Path) {
	let listener = match UnixListener::bind(socket_path) {
		Ok(l) => l,
		Err(e) => {
			tracing::error!("failed to bind socket {}: {}", socket_path.display(), e);
			return;
		}
	};

	tracing::info!("listening on {}", socket_path.display());

	loop {
		let (stream, _) = match listener.accept().await {
			Ok(s) => s,
			Err(e) => {
				tracing::error!("accept error: {}", e);
				continue;
			}
		};

		let daemon = Arc::clone(&daemon);
		tokio::spawn(async move {
			let (reader, mut writer) = stream.into_split();
			let mut lines = BufReader::new(reader).lines();

			while let Ok(Some(line)) = lines.next_line().await {
				if line.trim().is_empty() {
					continue;
				}
				let response = match serde_json::from_str::<Envelope>(&line) {
					Ok(envelope) => daemon.handle(envelope).await,
					Err(e) => Response::error(format!("invalid request: {}", e)),
				};
				if write_response(&mut writer, &response).await.is_err() {
					break;
				}
			}
		});
	}
}

async fn write_response(
	writer: &mut tokio::net::unix::OwnedWriteHalf,
	response: &Response,
) -> std::io::Result<()> {
	let mut data = serde_json::to_vec(response).map_err(std::io::Error::other)?;
	data.push(b'\n');
	writer.write_all(&data).await
}

async fn run_http_server(daemon: Arc<Daemon>, port: u16) {
	let app = api::router(daemon);
	let addr = std::net::SocketAddr::from(([127, 0, 0, 1], port));
	let listener = match tokio::net::TcpListener::bind(addr).await {
		Ok(l) => l,
		Err(e) => {
			tracing::error!("failed to bind HTTP on {}: {}", addr, e);
			return;
		}
	};
	tracing::info!("HTTP listening on {}", addr);
	if let Err(e) = axum::serve(listener, app).await {
		tracing::error!("HTTP server error: {}", e);
	}
}
