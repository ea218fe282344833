//! # devserve
//!
//! Supervision engine for development-time child processes.
//!
//! Spawn dev servers and watch daemons under a label, negotiate their ports,
//! probe their health, restart them after crashes, and keep their output in a
//! bounded in-memory buffer backed by per-day JSONL files.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use devserve::{LaunchSpec, Supervisor, SupervisorConfig};
//!
//! # #[tokio::main]
//! # async fn main() {
//! let sup = Supervisor::new(SupervisorConfig {
//!     log_dir: Some("/tmp/devserve/logs".into()),
//!     ..Default::default()
//! });
//!
//! let started = sup
//!     .start(LaunchSpec::new("web", "/tmp/app", "pnpm dev"))
//!     .await
//!     .unwrap();
//! println!("web: pid {:?}", started.pid);
//! # }
//! ```

pub mod error;
pub mod health;
pub mod logs;
pub mod output;
pub mod policy;
pub mod ports;
pub mod registry;
pub mod signal;
pub mod supervisor;
pub mod types;

pub use error::{Error, Result};
pub use output::{LogCapture, LogQuery};
pub use policy::{CommandPolicy, CommandShape};
pub use registry::ProcessRegistry;
pub use supervisor::{Supervisor, SupervisorConfig, Timings};
pub use types::*;
