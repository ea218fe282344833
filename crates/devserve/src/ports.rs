use std::future::Future;
use std::io::ErrorKind;

use tokio::net::TcpListener;

use crate::error::{Error, Result};

pub const DEFAULT_MAX_ATTEMPTS: u16 = 10;

/// Binds throwaway listeners on the IPv4 and IPv6 wildcards; both are dropped
/// before returning. A host without IPv6 is judged on IPv4 alone.
pub async fn check_available(port: u16) -> bool {
	match TcpListener::bind(("0.0.0.0", port)).await {
		Ok(listener) => drop(listener),
		Err(e) => {
			tracing::debug!("port {} unavailable: {}", port, e);
			return false;
		}
	}
	// Servers on `localhost` often hold only `[::1]`, which the IPv4 bind cannot see.
	match TcpListener::bind(("::", port)).await {
		Ok(listener) => {
			drop(listener);
			true
		}
		Err(e) if e.kind() == ErrorKind::AddrInUse => {
			tracing::debug!("port {} unavailable on IPv6: {}", port, e);
			false
		}
		Err(e) => {
			tracing::debug!("no IPv6 bind for port {}: {}", port, e);
			true
		}
	}
}

pub async fn find_available(base: u16, max_attempts: u16) -> Result<u16> {
	find_available_by(base, max_attempts, check_available).await
}

/// Ascending scan of `base..base + max_attempts` using `probe`.
pub async fn find_available_by<F, Fut>(base: u16, max_attempts: u16, mut probe: F) -> Result<u16>
where
	F: FnMut(u16) -> Fut,
	Fut: Future<Output = bool>,
{
	let end = base.saturating_add(max_attempts.saturating_sub(1));
	if max_attempts > 0 {
		for port in base..=end {
			if probe(port).await {
				return Ok(port);
			}
		}
	}
	Err(Error::NoPortAvailable { start: base, end })
}
