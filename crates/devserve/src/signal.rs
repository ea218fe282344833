//! Process-group signaling with a single-process fallback.

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::process::Stdio;
use tokio::process::Command;

/// The spawned child leads its own group, so its pid doubles as the group id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessHandle {
	pub pid: u32,
	pub pgid: u32,
}

impl ProcessHandle {
	pub fn group_leader(pid: u32) -> Self {
		Self { pid, pgid: pid }
	}
}

pub trait Signaler: Send + Sync {
	fn signal_group(&self, pgid: u32, sig: Signal) -> nix::Result<()>;
	fn signal_process(&self, pid: u32, sig: Signal) -> nix::Result<()>;
	/// Terminates processes outside any managed group whose command line
	/// matches `pattern`. Best effort: returns immediately and never fails.
	fn kill_matching(&self, pattern: &str);
}

#[derive(Debug, Default)]
pub struct UnixSignaler;

impl Signaler for UnixSignaler {
	fn signal_group(&self, pgid: u32, sig: Signal) -> nix::Result<()> {
		signal::killpg(Pid::from_raw(pgid as i32), sig)
	}

	fn signal_process(&self, pid: u32, sig: Signal) -> nix::Result<()> {
		signal::kill(Pid::from_raw(pid as i32), sig)
	}

	/// Runs `pkill -f <pattern>` in the background. Must be called inside a tokio runtime.
	fn kill_matching(&self, pattern: &str) {
		let spawned = Command::new("pkill")
			.args(["-f", pattern])
			.stdin(Stdio::null())
			.stdout(Stdio::null())
			.stderr(Stdio::null())
			.spawn();
		let mut child = match spawned {
			Ok(child) => child,
			Err(e) => {
				tracing::debug!("pkill -f {} failed to start: {}", pattern, e);
				return;
			}
		};
		let pattern = pattern.to_string();
		tokio::spawn(async move {
			match child.wait().await {
				// Exit 1 means nothing matched.
				Ok(status) if status.success() || status.code() == Some(1) => {}
				Ok(status) => tracing::debug!("pkill -f {} exited with {}", pattern, status),
				Err(e) => tracing::debug!("pkill -f {} failed: {}", pattern, e),
			}
		});
	}
}

/// Signals the whole group, falling back to the single process. Never fails.
pub fn terminate(signaler: &dyn Signaler, handle: ProcessHandle, sig: Signal) {
	if let Err(group_err) = signaler.signal_group(handle.pgid, sig) {
		tracing::debug!("{} to group {} failed: {}, trying pid", sig, handle.pgid, group_err);
		if let Err(e) = signaler.signal_process(handle.pid, sig) {
			tracing::debug!("{} to pid {} failed: {}", sig, handle.pid, e);
		}
	}
}

pub fn signal_name(raw: i32) -> String {
	Signal::try_from(raw)
		.map(|s| s.as_str().to_string())
		.unwrap_or_else(|_| format!("SIG{}", raw))
}
