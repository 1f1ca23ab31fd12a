use std::path::Path;

use assert_cmd::Command;
use insta_cmd::get_cargo_bin;

pub const GREET_CFG: &str = r#"[gcode_macro GREET]
description: Say hello
variable_count: 0
gcode:
  {{ update("count", count + 1) }}
  RESPOND MSG="hello {{ params.NAME }}"


  RESPOND MSG="greeted {{ count }} times"
"#;

#[allow(dead_code)]
pub const TICK_CFG: &str = r"[delayed_gcode TICK]
initial_duration: 5
repeat: true
variable_ticks: 0
gcode:
  {{ update('ticks', ticks + 1) }}
  G4 P{{ ticks }}
";

pub fn dynmacro_cmd() -> Command {
	let mut cmd = Command::new(get_cargo_bin("dynmacro"));
	cmd.env("NO_COLOR", "1");
	cmd
}

/// Write `dynmacro.toml` pointing at `macros.cfg` plus the given macros.
pub fn write_project(root: &Path, macros: &str) -> std::io::Result<()> {
	std::fs::write(root.join("dynmacro.toml"), "configs = [\"macros.cfg\"]\n")?;
	std::fs::write(root.join("macros.cfg"), macros)
}
