use axum::extract::{Path, Query, Request, State};
use axum::http::{header, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use devserve::{
	Error, LaunchSpec, LogExcerpt, LogQuery, ProcessStatus, RestartOverrides, Started, Stopped,
	DEFAULT_COMMAND, PORT_MAIN,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tower_http::cors::CorsLayer;

use crate::handlers::Daemon;

#[derive(Clone)]
pub struct AppState {
	pub daemon: Arc<Daemon>,
}

pub fn router(daemon: Arc<Daemon>) -> Router {
	let state = AppState { daemon };

	Router::new()
		.route("/api/processes", get(list_processes).post(start_process))
		.route("/api/processes/{label}/stop", post(stop_process))
		.route("/api/processes/{label}/restart", post(restart_process))
		.route("/api/processes/{label}/logs", get(process_logs))
		.route("/api/projects/{project}/stop", post(stop_project))
		.layer(middleware::from_fn_with_state(state.clone(), require_token))
		.layer(CorsLayer::permissive())
		.with_state(state)
}

#[derive(Serialize)]
struct ErrorResponse {
	error: String,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn api_error(e: Error) -> ApiError {
	let status = match &e {
		Error::CommandNotAllowed(_) => StatusCode::FORBIDDEN,
		Error::DuplicateLabel(_) => StatusCode::CONFLICT,
		Error::ProcessNotFound(_) => StatusCode::NOT_FOUND,
		Error::NoPortAvailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
		Error::InvalidPattern { .. } => StatusCode::BAD_REQUEST,
	};
	(status, Json(ErrorResponse { error: e.to_string() }))
}

/// Expects `Authorization: Bearer <token>` when auth is required.
async fn require_token(State(state): State<AppState>, request: Request, next: Next) -> Response {
	let presented = request
		.headers()
		.get(header::AUTHORIZATION)
		.and_then(|v| v.to_str().ok())
		.and_then(|v| v.strip_prefix("Bearer "));
	if !state.daemon.auth.check(presented) {
		return (
			StatusCode::UNAUTHORIZED,
			Json(ErrorResponse {
				error: "unauthorized".to_string(),
			}),
		)
			.into_response();
	}
	next.run(request).await
}

#[derive(Deserialize)]
struct StatusParams {
	project: Option<String>,
}

async fn list_processes(
	State(state): State<AppState>,
	Query(params): Query<StatusParams>,
) -> Json<Vec<ProcessStatus>> {
	Json(state.daemon.supervisor.status(params.project.as_deref()).await)
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct StartBody {
	label: String,
	cwd: PathBuf,
	command: Option<String>,
	#[serde(default = "default_true")]
	auto_restart: bool,
	port: Option<u16>,
	health_endpoint: Option<String>,
}

fn default_true() -> bool {
	true
}

async fn start_process(
	State(state): State<AppState>,
	Json(body): Json<StartBody>,
) -> Result<Json<Started>, ApiError> {
	let mut spec = LaunchSpec::new(
		body.label,
		body.cwd,
		body.command.unwrap_or_else(|| DEFAULT_COMMAND.to_string()),
	)
	.auto_restart(body.auto_restart);
	if let Some(port) = body.port {
		spec = spec.port(PORT_MAIN, port);
	}
	spec.health_endpoint = body.health_endpoint;

	state.daemon.supervisor.start(spec).await.map(Json).map_err(api_error)
}

async fn stop_process(
	State(state): State<AppState>,
	Path(label): Path<String>,
) -> Result<Json<Stopped>, ApiError> {
	state.daemon.supervisor.stop(&label).await.map(Json).map_err(api_error)
}

async fn restart_process(
	State(state): State<AppState>,
	Path(label): Path<String>,
	Json(overrides): Json<RestartOverrides>,
) -> Result<Json<Started>, ApiError> {
	state
		.daemon
		.supervisor
		.restart(&label, overrides)
		.await
		.map(Json)
		.map_err(api_error)
}

#[derive(Deserialize)]
struct LogParams {
	lines: Option<usize>,
	grep: Option<String>,
	#[serde(default)]
	color: bool,
}

async fn process_logs(
	State(state): State<AppState>,
	Path(label): Path<String>,
	Query(params): Query<LogParams>,
) -> Result<Json<LogExcerpt>, ApiError> {
	let query = LogQuery {
		lines: params.lines.unwrap_or(LogQuery::default().lines),
		pattern: params.grep.filter(|g| !g.is_empty()),
		color: params.color,
	};
	let mut excerpt = state
		.daemon
		.supervisor
		.logs(&label, &query)
		.await
		.map_err(api_error)?;
	if !query.color {
		for record in &mut excerpt.records {
			record.line = devserve::output::strip_ansi(&record.line);
		}
	}
	Ok(Json(excerpt))
}

async fn stop_project(
	State(state): State<AppState>,
	Path(project): Path<String>,
) -> Json<Vec<Stopped>> {
	Json(state.daemon.supervisor.group_stop(&project).await)
}
