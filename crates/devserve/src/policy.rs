//! The closed set of command shapes the supervisor is willing to spawn.

use serde::Serialize;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PackageManager {
	Pnpm,
	Npm,
	Yarn,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Runtime {
	Node,
	Deno,
	Bun,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CommandShape {
	/// `pnpm dev`, `yarn start`, `npm run <script>`.
	PackageScript { manager: PackageManager, script: String },
	/// `npx convex dev ...`
	ConvexDev,
	/// `node <args>`, `deno <args>`, `bun <args>`.
	DirectRuntime { runtime: Runtime },
}

const LIFECYCLE_SCRIPTS: &[&str] = &["dev", "start", "serve"];

#[derive(Debug, Clone, Default)]
pub struct CommandPolicy;

impl CommandPolicy {
	pub fn new() -> Self {
		Self
	}

	/// Recognizes the command's shape from its leading tokens.
	pub fn classify(&self, command: &str) -> Option<CommandShape> {
		let tokens: Vec<&str> = command.split_whitespace().collect();
		match tokens.as_slice() {
			["pnpm", script, ..] if LIFECYCLE_SCRIPTS.contains(script) => {
				Some(package_script(PackageManager::Pnpm, script))
			}
			["yarn", script, ..] if LIFECYCLE_SCRIPTS.contains(script) => {
				Some(package_script(PackageManager::Yarn, script))
			}
			["npm", "run", script, ..] if starts_with_word_char(script) => {
				Some(package_script(PackageManager::Npm, script))
			}
			["npx", "convex", "dev", ..] => Some(CommandShape::ConvexDev),
			["node", _, ..] => Some(CommandShape::DirectRuntime { runtime: Runtime::Node }),
			["deno", _, ..] => Some(CommandShape::DirectRuntime { runtime: Runtime::Deno }),
			["bun", _, ..] => Some(CommandShape::DirectRuntime { runtime: Runtime::Bun }),
			_ => None,
		}
	}

	pub fn check(&self, command: &str) -> Result<CommandShape> {
		// Leading whitespace would let `sh -c` see a different program than we classified.
		if command.starts_with(char::is_whitespace) {
			return Err(Error::CommandNotAllowed(command.to_string()));
		}
		self.classify(command)
			.ok_or_else(|| Error::CommandNotAllowed(command.to_string()))
	}
}

fn package_script(manager: PackageManager, script: &str) -> CommandShape {
	CommandShape::PackageScript {
		manager,
		script: script.to_string(),
	}
}

fn starts_with_word_char(s: &str) -> bool {
	s.chars()
		.next()
		.map(|c| c.is_alphanumeric() || c == '_')
		.unwrap_or(false)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_package_scripts() {
		let policy = CommandPolicy::new();
		assert_eq!(
			policy.classify("pnpm dev"),
			Some(package_script(PackageManager::Pnpm, "dev"))
		);
		assert_eq!(
			policy.classify("yarn   serve --open"),
			Some(package_script(PackageManager::Yarn, "serve"))
		);
		assert_eq!(
			policy.classify("npm run build:watch"),
			Some(package_script(PackageManager::Npm, "build:watch"))
		);
		assert_eq!(policy.classify("pnpm install"), None);
		assert_eq!(policy.classify("npm install"), None);
		assert_eq!(policy.classify("npm run -x"), None);
	}

	#[test]
	fn test_runtimes_and_convex() {
		let policy = CommandPolicy::new();
		assert_eq!(policy.classify("npx convex dev --once"), Some(CommandShape::ConvexDev));
		assert_eq!(
			policy.classify("node server.js"),
			Some(CommandShape::DirectRuntime { runtime: Runtime::Node })
		);
		assert_eq!(
			policy.classify("bun run index.ts"),
			Some(CommandShape::DirectRuntime { runtime: Runtime::Bun })
		);
		assert_eq!(policy.classify("node"), None);
		assert_eq!(policy.classify("npx vite"), None);
	}

	#[test]
	fn test_check_rejects_everything_else() {
		let policy = CommandPolicy::new();
		assert!(matches!(policy.check("rm -rf /"), Err(Error::CommandNotAllowed(_))));
		assert!(matches!(policy.check(""), Err(Error::CommandNotAllowed(_))));
		assert!(matches!(policy.check(" node x.js"), Err(Error::CommandNotAllowed(_))));
		assert!(policy.check("deno task dev").is_ok());
	}
}
