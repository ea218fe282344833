//! The per-project `.devserver.json` service list.

use devserve::{qualified_label, ServiceDef};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::config::{expand_tilde, ConfigError};

pub const PROJECT_FILE: &str = ".devserver.json";

pub const EXAMPLE_FILE: &str = r#"{
  "services": [
    { "label": "next", "command": "pnpm dev", "port": 3000 },
    { "label": "convex", "command": "npx convex dev", "cloudPort": 3210, "sitePort": 6810 }
  ],
  "aliases": {
    "web": "next",
    "api": "convex"
  }
}"#;

#[derive(Debug, Clone, Deserialize, Default)]
pub struct ProjectFile {
	#[serde(default)]
	pub services: Vec<ServiceDef>,
	#[serde(default)]
	pub aliases: BTreeMap<String, String>,
}

impl ProjectFile {
	/// `Ok(None)` when the directory has no project file.
	pub fn load(dir: &Path) -> Result<Option<Self>, ConfigError> {
		let path = dir.join(PROJECT_FILE);
		let content = match std::fs::read_to_string(&path) {
			Ok(c) => c,
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
			Err(source) => return Err(ConfigError::Read { path, source }),
		};
		serde_json::from_str(&content)
			.map(Some)
			.map_err(|source| ConfigError::Json { path, source })
	}

	/// Aliases with targets naming one of this file's services rewritten to
	/// `project:service`. Other targets are kept as written.
	pub fn qualified_aliases(&self, project: &str) -> Vec<(String, String)> {
		self.aliases
			.iter()
			.map(|(alias, target)| {
				let target = if self.services.iter().any(|s| &s.label == target) {
					qualified_label(Some(project), target)
				} else {
					target.clone()
				};
				(alias.clone(), target)
			})
			.collect()
	}

	pub fn labels(&self, project: &str) -> Vec<String> {
		self.services
			.iter()
			.map(|s| qualified_label(Some(project), &s.label))
			.collect()
	}
}

/// The last path component; labels of a project's services are prefixed with it.
pub fn project_name(dir: &Path) -> String {
	dir.file_name()
		.map(|n| n.to_string_lossy().to_string())
		.unwrap_or_default()
}

/// First existing `<root>/<project>` directory.
pub fn find_project_dir(project: &str, roots: &[String], base: &Path) -> Option<PathBuf> {
	roots
		.iter()
		.map(|root| {
			let root = expand_tilde(root);
			let root = if root.is_absolute() { root } else { base.join(root) };
			root.join(project)
		})
		.find(|dir| dir.is_dir())
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_example_file_parses() {
		let file: ProjectFile = serde_json::from_str(EXAMPLE_FILE).unwrap();
		assert_eq!(file.services.len(), 2);
		assert_eq!(file.services[0].port, Some(3000));
		assert_eq!(file.services[1].cloud_port, Some(3210));
		assert_eq!(
			file.labels("shop"),
			vec!["shop:next".to_string(), "shop:convex".to_string()]
		);
	}

	#[test]
	fn test_qualified_aliases() {
		let mut file: ProjectFile = serde_json::from_str(EXAMPLE_FILE).unwrap();
		file.aliases.insert("db".into(), "other:postgres".into());
		let aliases = file.qualified_aliases("shop");
		assert!(aliases.contains(&("web".to_string(), "shop:next".to_string())));
		assert!(aliases.contains(&("api".to_string(), "shop:convex".to_string())));
		assert!(aliases.contains(&("db".to_string(), "other:postgres".to_string())));
	}

	#[test]
	fn test_load_missing_and_invalid() {
		let dir = std::env::temp_dir().join(format!("devserve-project-{}", std::process::id()));
		let _ = std::fs::remove_dir_all(&dir);
		std::fs::create_dir_all(&dir).unwrap();

		assert!(ProjectFile::load(&dir).unwrap().is_none());

		std::fs::write(dir.join(PROJECT_FILE), "{ not json").unwrap();
		assert!(matches!(ProjectFile::load(&dir), Err(ConfigError::Json { .. })));

		std::fs::write(dir.join(PROJECT_FILE), r#"{"services":[{"label":"web","command":"pnpm dev"}]}"#).unwrap();
		let file = ProjectFile::load(&dir).unwrap().unwrap();
		assert_eq!(file.services[0].label, "web");
		assert!(file.aliases.is_empty());

		let _ = std::fs::remove_dir_all(&dir);
	}

	#[test]
	fn test_find_project_dir() {
		let base = std::env::temp_dir().join(format!("devserve-roots-{}", std::process::id()));
		let _ = std::fs::remove_dir_all(&base);
		std::fs::create_dir_all(base.join("work").join("shop")).unwrap();

		let roots = vec![".".to_string(), "work".to_string()];
		assert_eq!(find_project_dir("shop", &roots, &base), Some(base.join("work").join("shop")));
		assert_eq!(find_project_dir("blog", &roots, &base), None);
		assert_eq!(project_name(&base.join("work").join("shop")), "shop");

		let _ = std::fs::remove_dir_all(&base);
	}
}
