use std::collections::BTreeMap;
use std::collections::BTreeSet;

use serde::Serialize;
use serde_json::json;
use tracing::debug;

use crate::DynMacroError;
use crate::DynMacroResult;
use crate::Invocation;
use crate::ManualReactor;
use crate::Reactor;
use crate::Response;

/// Who answers a command in the host's command table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandKind {
	/// Implemented by the host itself.
	Native,
	/// One of the engine's own commands such as `RUN_MACRO`.
	Engine,
	/// An installed dynamic macro.
	Macro,
}

/// An entry in the host's command table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommandInfo {
	pub kind: CommandKind,
	pub description: String,
}

impl CommandInfo {
	pub fn new(kind: CommandKind, description: impl Into<String>) -> Self {
		Self {
			kind,
			description: description.into(),
		}
	}
}

/// The command-processing host the engine is embedded in.
pub trait Host {
	fn command(&self, name: &str) -> Option<CommandInfo>;

	/// Names owned by the host's ready-phase and base built-ins. These can
	/// never be claimed or renamed by a macro.
	fn is_reserved(&self, name: &str) -> bool;

	/// Claim `name`. Fails when the name is already taken.
	fn register_command(&mut self, name: &str, info: CommandInfo) -> DynMacroResult<()>;

	/// Release `name`, returning what was registered there.
	fn unregister_command(&mut self, name: &str) -> Option<CommandInfo>;

	fn respond(&mut self, response: Response);

	/// Execute one line the engine does not handle itself.
	fn run_script(&mut self, line: &str) -> Result<(), String>;

	/// Host state exposed to templates as `printer`.
	fn status(&self) -> serde_json::Value;

	fn reactor(&mut self) -> &mut dyn Reactor;
}

/// Commands every [`SimulatedHost`] reserves.
pub const BASE_COMMANDS: [&str; 6] = [
	"ECHO",
	"FIRMWARE_RESTART",
	"HELP",
	"M112",
	"RESTART",
	"STATUS",
];

/// Native commands a [`SimulatedHost`] starts with that macros may rename.
pub const NATIVE_COMMANDS: [&str; 5] = ["G1", "G4", "G28", "M117", "RESPOND"];

/// An in-memory host that records every executed line.
///
/// `RESPOND MSG=...` produces an info response and `RESPOND TYPE=error`
/// produces an error response. Every other native command is only logged.
#[derive(Debug)]
pub struct SimulatedHost {
	commands: BTreeMap<String, CommandInfo>,
	reserved: BTreeSet<String>,
	status: serde_json::Value,
	/// Lines executed natively, in order.
	pub executed: Vec<String>,
	/// Everything sent to the operator, in order.
	pub responses: Vec<Response>,
	pub clock: ManualReactor,
}

impl Default for SimulatedHost {
	fn default() -> Self {
		Self::new()
	}
}

impl SimulatedHost {
	pub fn new() -> Self {
		let mut commands = BTreeMap::new();
		for name in BASE_COMMANDS.iter().chain(NATIVE_COMMANDS.iter()) {
			commands.insert(
				(*name).to_string(),
				CommandInfo::new(CommandKind::Native, "built-in command"),
			);
		}

		Self {
			commands,
			reserved: BASE_COMMANDS.iter().map(|name| (*name).to_string()).collect(),
			status: json!({
				"toolhead": { "position": [0.0, 0.0, 0.0, 0.0], "homed_axes": "" },
				"print_stats": { "state": "standby" },
			}),
			executed: Vec::new(),
			responses: Vec::new(),
			clock: ManualReactor::new(),
		}
	}

	#[must_use]
	pub fn with_status(mut self, status: serde_json::Value) -> Self {
		self.status = status;
		self
	}

	/// Add a native command, optionally reserving it.
	pub fn add_native(&mut self, name: &str, reserved: bool) {
		let name = name.to_ascii_uppercase();
		self.commands.insert(
			name.clone(),
			CommandInfo::new(CommandKind::Native, "built-in command"),
		);
		if reserved {
			self.reserved.insert(name);
		}
	}

	pub fn set_status(&mut self, status: serde_json::Value) {
		self.status = status;
	}

	pub fn commands(&self) -> &BTreeMap<String, CommandInfo> {
		&self.commands
	}

	/// Drain the responses gathered so far.
	pub fn take_responses(&mut self) -> Vec<Response> {
		std::mem::take(&mut self.responses)
	}
}

impl Host for SimulatedHost {
	fn command(&self, name: &str) -> Option<CommandInfo> {
		self.commands.get(&name.to_ascii_uppercase()).cloned()
	}

	fn is_reserved(&self, name: &str) -> bool {
		self.reserved.contains(&name.to_ascii_uppercase())
	}

	fn register_command(&mut self, name: &str, info: CommandInfo) -> DynMacroResult<()> {
		let name = name.to_ascii_uppercase();
		if self.commands.contains_key(&name) {
			return Err(DynMacroError::Host(format!("command `{name}` is already registered")));
		}

		debug!(name = %name, kind = ?info.kind, "registered command");
		self.commands.insert(name, info);
		Ok(())
	}

	fn unregister_command(&mut self, name: &str) -> Option<CommandInfo> {
		self.commands.remove(&name.to_ascii_uppercase())
	}

	fn respond(&mut self, response: Response) {
		self.responses.push(response);
	}

	fn run_script(&mut self, line: &str) -> Result<(), String> {
		let invocation = Invocation::parse(line).map_err(|e| e.to_string())?;
		if invocation.name.is_empty() {
			return Ok(());
		}

		match self.commands.get(&invocation.name).map(|info| info.kind) {
			Some(CommandKind::Native) => {}
			Some(kind) => {
				return Err(format!(
					"`{}` is a {kind:?} command and must be routed through the engine",
					invocation.name
				));
			}
			None => return Err(format!("Unknown command: \"{}\"", invocation.name)),
		}

		if invocation.name == "RESPOND" {
			let message = invocation.get("MSG").unwrap_or_default().to_string();
			let response = match invocation.get("TYPE").map(str::to_ascii_lowercase).as_deref() {
				Some("error") => Response::Error(message),
				Some("warning") => Response::Warning(message),
				_ => Response::Info(message),
			};
			self.responses.push(response);
		}

		self.executed.push(line.trim().to_string());
		Ok(())
	}

	fn status(&self) -> serde_json::Value {
		self.status.clone()
	}

	fn reactor(&mut self) -> &mut dyn Reactor {
		&mut self.clock
	}
}
