use devserve::{ProcessStatus, Started};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// One request line on the socket: the command plus an optional auth token.
#[derive(Debug, Clone, Deserialize)]
pub struct Envelope {
	#[serde(default)]
	pub auth: Option<String>,
	#[serde(flatten)]
	pub request: Request,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum Request {
	Start {
		label: String,
		#[serde(default)]
		cwd: Option<PathBuf>,
		#[serde(default)]
		command: Option<String>,
		#[serde(default = "default_true")]
		auto_restart: bool,
		#[serde(default)]
		port: Option<u16>,
		#[serde(default)]
		health_endpoint: Option<String>,
	},
	Stop {
		label: String,
	},
	Restart {
		label: String,
		#[serde(default)]
		cwd: Option<PathBuf>,
		#[serde(default)]
		command: Option<String>,
		#[serde(default)]
		auto_restart: Option<bool>,
	},
	Logs {
		label: String,
		#[serde(default = "default_lines")]
		lines: usize,
		#[serde(default)]
		grep: Option<String>,
		#[serde(default)]
		color: bool,
	},
	Status {
		#[serde(default)]
		project: Option<String>,
	},
	Up {
		#[serde(default)]
		cwd: Option<PathBuf>,
	},
	Down {
		#[serde(default)]
		cwd: Option<PathBuf>,
	},
	GroupStart {
		project: String,
		#[serde(default)]
		cwd: Option<PathBuf>,
	},
	GroupStop {
		project: String,
	},
	Ping,
	Shutdown,
}

fn default_true() -> bool {
	true
}

fn default_lines() -> usize {
	devserve::output::DEFAULT_QUERY_LINES
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Response {
	Ok { message: Option<String> },
	Started { started: Started, message: String },
	Status { processes: Vec<ProcessStatus>, message: String },
	Log { text: String },
	Error { message: String },
	Pong,
}

impl Response {
	pub fn ok(message: impl Into<String>) -> Self {
		Response::Ok {
			message: Some(message.into()),
		}
	}

	pub fn error(message: impl ToString) -> Self {
		Response::Error {
			message: message.to_string(),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_envelope_with_auth() {
		let env: Envelope =
			serde_json::from_str(r#"{"cmd":"stop","label":"web","auth":"s3cret"}"#).unwrap();
		assert_eq!(env.auth.as_deref(), Some("s3cret"));
		assert!(matches!(env.request, Request::Stop { ref label } if label == "web"));
	}

	#[test]
	fn test_defaults() {
		let env: Envelope = serde_json::from_str(r#"{"cmd":"logs","label":"web"}"#).unwrap();
		match env.request {
			Request::Logs { lines, grep, color, .. } => {
				assert_eq!(lines, 200);
				assert!(grep.is_none());
				assert!(!color);
			}
			other => panic!("unexpected {:?}", other),
		}

		let env: Envelope = serde_json::from_str(r#"{"cmd":"start","label":"web"}"#).unwrap();
		assert!(matches!(env.request, Request::Start { auto_restart: true, .. }));
		assert!(env.auth.is_none());
	}

	#[test]
	fn test_unknown_command() {
		assert!(serde_json::from_str::<Envelope>(r#"{"cmd":"reboot"}"#).is_err());
	}

	#[test]
	fn test_response_shape() {
		let json = serde_json::to_value(Response::error("web is not running")).unwrap();
		assert_eq!(json["type"], "error");
		assert_eq!(json["message"], "web is not running");
	}
}
