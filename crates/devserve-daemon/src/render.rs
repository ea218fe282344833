//! Plain-text renderings of command results for socket clients.

use devserve::output::format_records;
use devserve::{HealthStatus, LogExcerpt, LogQuery, PortMap, ProcessPhase, ProcessStatus, Started, Stopped};

use crate::project::{EXAMPLE_FILE, PROJECT_FILE};

pub fn format_uptime(secs: u64) -> String {
	let (d, h, m, s) = (secs / 86_400, secs % 86_400 / 3600, secs % 3600 / 60, secs % 60);
	if d > 0 {
		format!("{}d {}h", d, h)
	} else if h > 0 {
		format!("{}h {}m", h, m)
	} else if m > 0 {
		format!("{}m {}s", m, s)
	} else {
		format!("{}s", s)
	}
}

fn format_ports(ports: &PortMap) -> String {
	ports
		.iter()
		.map(|(role, port)| format!("{}: {}", role, port))
		.collect::<Vec<_>>()
		.join(", ")
}

pub fn render_started(started: &Started) -> String {
	let Some(pid) = started.pid else {
		return format!("{}: failed to start, see its logs", started.label);
	};
	let mut out = format!(
		"started {}\npid: {}\ncommand: {}\ncwd: {}",
		started.label,
		pid,
		started.command,
		started.cwd.display()
	);
	if !started.ports.is_empty() {
		out.push_str(&format!("\nports: {}", format_ports(&started.ports)));
	}
	if started.auto_restart {
		out.push_str("\nauto-restart: on");
	}
	out
}

/// One line per service of a bulk start.
pub fn render_started_line(started: &Started) -> String {
	match started.pid {
		Some(pid) if started.ports.is_empty() => format!("ok {} (pid {})", started.label, pid),
		Some(pid) => format!(
			"ok {} (pid {}, {})",
			started.label,
			pid,
			format_ports(&started.ports)
		),
		None => format!("failed {}: spawn failed, see its logs", started.label),
	}
}

pub fn render_stopped(stopped: &Stopped) -> String {
	match stopped.pid {
		Some(pid) => format!("stopped {} (pid {})", stopped.label, pid),
		None => format!("stopped {}", stopped.label),
	}
}

pub fn render_status(processes: &[ProcessStatus], project: Option<&str>) -> String {
	if processes.is_empty() {
		return match project {
			Some(p) => format!("no processes running for {}", p),
			None => "no processes running".to_string(),
		};
	}

	let mut out = String::new();
	for p in processes {
		if !out.is_empty() {
			out.push('\n');
		}
		out.push_str(&p.label);
		if !p.aliases.is_empty() {
			out.push_str(&format!(" ({})", p.aliases.join(", ")));
		}
		out.push_str(&format!(" [{}]", phase_text(p)));
		out.push('\n');

		let pid = p.pid.map(|pid| pid.to_string()).unwrap_or_else(|| "-".into());
		out.push_str(&format!("  pid: {}  uptime: {}\n", pid, format_uptime(p.uptime_secs)));
		if !p.ports.is_empty() {
			out.push_str(&format!("  ports: {}\n", format_ports(&p.ports)));
		}
		out.push_str(&format!("  command: {}\n", p.command));
		out.push_str(&format!("  cwd: {}\n", p.cwd.display()));
		if p.auto_restart {
			out.push_str("  auto-restart: on\n");
		}
	}
	out.trim_end().to_string()
}

fn phase_text(p: &ProcessStatus) -> String {
	match p.phase {
		ProcessPhase::Running | ProcessPhase::Starting => match p.health.status {
			HealthStatus::Starting => "starting".to_string(),
			HealthStatus::Healthy => "healthy".to_string(),
			HealthStatus::Unhealthy => match &p.health.error {
				Some(e) => format!("unhealthy: {}", e),
				None => "unhealthy".to_string(),
			},
		},
		ProcessPhase::Exited => "restarting".to_string(),
		ProcessPhase::Stopping => "stopping".to_string(),
		ProcessPhase::Terminated => "terminated".to_string(),
	}
}

pub fn render_logs(excerpt: &LogExcerpt, query: &LogQuery) -> String {
	let filter = query
		.pattern
		.as_deref()
		.map(|p| format!(" matching /{}/", p))
		.unwrap_or_default();
	if excerpt.records.is_empty() {
		return format!("no logs for {}{}", excerpt.label, filter);
	}
	format!(
		"{}: last {} lines{}\n\n{}",
		excerpt.label,
		excerpt.records.len(),
		filter,
		format_records(&excerpt.records, query.color)
	)
}

pub fn missing_project_file(dir: &std::path::Path) -> String {
	format!(
		"no {} in {}\n\ncreate one like:\n\n{}",
		PROJECT_FILE,
		dir.display(),
		EXAMPLE_FILE
	)
}

#[cfg(test)]
mod tests {
	use super::*;
	use devserve::{Health, LogRecord};

	#[test]
	fn test_format_uptime() {
		assert_eq!(format_uptime(0), "0s");
		assert_eq!(format_uptime(59), "59s");
		assert_eq!(format_uptime(61), "1m 1s");
		assert_eq!(format_uptime(3600 + 120), "1h 2m");
		assert_eq!(format_uptime(2 * 86_400 + 5 * 3600 + 59), "2d 5h");
	}

	fn status(label: &str) -> ProcessStatus {
		let mut ports = PortMap::new();
		ports.insert("main".into(), 3001);
		ProcessStatus {
			label: label.into(),
			aliases: vec!["web".into()],
			pid: Some(4242),
			command: "pnpm dev".into(),
			cwd: "/src/shop".into(),
			phase: ProcessPhase::Running,
			started_at: LogRecord::new(label, None, "").time,
			uptime_secs: 75,
			ports,
			health: Health::starting(),
			auto_restart: true,
		}
	}

	#[test]
	fn test_render_status() {
		let text = render_status(&[status("shop:next")], None);
		assert!(text.starts_with("shop:next (web) [starting]"));
		assert!(text.contains("pid: 4242  uptime: 1m 15s"));
		assert!(text.contains("ports: main: 3001"));
		assert!(text.contains("auto-restart: on"));

		assert_eq!(render_status(&[], Some("shop")), "no processes running for shop");
	}

	#[test]
	fn test_render_logs() {
		let query = LogQuery {
			pattern: Some("error".into()),
			..Default::default()
		};
		let empty = LogExcerpt {
			label: "web".into(),
			records: vec![],
		};
		assert_eq!(render_logs(&empty, &query), "no logs for web matching /error/");

		let excerpt = LogExcerpt {
			label: "web".into(),
			records: vec![LogRecord::new("web", Some(1), "\x1b[31mError\x1b[0m: boom")],
		};
		let text = render_logs(&excerpt, &query);
		assert!(text.starts_with("web: last 1 lines matching /error/"));
		assert!(text.ends_with("] Error: boom"));
	}
}
