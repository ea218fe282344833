use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
	#[error("command not allowed: {0}")]
	CommandNotAllowed(String),

	#[error("{0} is already running")]
	DuplicateLabel(String),

	#[error("{0} is not running")]
	ProcessNotFound(String),

	#[error("no available port in {start}-{end}")]
	NoPortAvailable { start: u16, end: u16 },

	#[error("invalid pattern {pattern:?}: {source}")]
	InvalidPattern {
		pattern: String,
		#[source]
		source: regex::Error,
	},
}
