use std::path::Path;

use tempfile::TempDir;

use crate::MacroEngine;
use crate::ReloadSummary;
use crate::Response;
use crate::SimulatedHost;

pub const GREET_CFG: &str = r#"[gcode_macro GREET]
description: Say hello
variable_count: 0
gcode:
  {{ update("count", count + 1) }}
  RESPOND MSG="hello {{ params.NAME }}"


  RESPOND MSG="greeted {{ count }} times"
"#;

pub const HOMING_CFG: &str = r#"[gcode_macro G28]
rename_existing: G28_BASE
description: Home and report
gcode:
  G28_BASE
  RESPOND MSG="homed"
"#;

pub const TICK_CFG: &str = r#"[delayed_gcode TICK]
initial_duration: 5
repeat: true
variable_ticks: 0
gcode:
  {{ update("ticks", ticks + 1) }}
  G4 P{{ ticks }}
"#;

pub const SANDBOX_SETTINGS: &str = r#"configs = ["macros.cfg"]

[clusters.sandbox]
configs = ["sandbox.cfg"]
scripting_enabled = false
host_access_enabled = false
"#;

pub const PROBE_CFG: &str = r#"[gcode_macro PROBE]
gcode:
  {{ script("touched = 1") }}
  RESPOND MSG="state={{ printer.print_stats.state }}"
"#;

pub fn write_file(root: &Path, name: &str, content: &str) {
	let path = root.join(name);
	if let Some(parent) = path.parent() {
		std::fs::create_dir_all(parent).unwrap_or_else(|e| panic!("mkdir: {e}"));
	}
	std::fs::write(path, content).unwrap_or_else(|e| panic!("write: {e}"));
}

/// A temporary configuration root holding `files`.
pub fn project(files: &[(&str, &str)]) -> TempDir {
	let tmp = tempfile::tempdir().unwrap_or_else(|e| panic!("tempdir: {e}"));
	for (name, content) in files {
		write_file(tmp.path(), name, content);
	}

	tmp
}

/// A project whose global registry reads `macros.cfg`, plus a started engine
/// and host. `settings` is appended to the generated `dynmacro.toml`.
pub fn started(macros: &str, settings: &str) -> (TempDir, MacroEngine, SimulatedHost, ReloadSummary) {
	let tmp = project(&[
		("macros.cfg", macros),
		("dynmacro.toml", &format!("configs = [\"macros.cfg\"]\n{settings}")),
	]);
	let mut host = SimulatedHost::new();
	let mut engine = MacroEngine::load(tmp.path()).unwrap_or_else(|e| panic!("load: {e}"));
	let summary = engine.start(&mut host).unwrap_or_else(|e| panic!("start: {e}"));

	(tmp, engine, host, summary)
}

pub fn infos(host: &SimulatedHost) -> Vec<String> {
	host.responses
		.iter()
		.filter_map(|response| {
			match response {
				Response::Info(message) => Some(message.clone()),
				_ => None,
			}
		})
		.collect()
}

pub fn warnings(host: &SimulatedHost) -> Vec<String> {
	host.responses
		.iter()
		.filter_map(|response| {
			match response {
				Response::Warning(message) => Some(message.clone()),
				_ => None,
			}
		})
		.collect()
}

pub fn errors(host: &SimulatedHost) -> Vec<String> {
	host.responses
		.iter()
		.filter_map(|response| {
			match response {
				Response::Error(message) => Some(message.clone()),
				_ => None,
			}
		})
		.collect()
}
