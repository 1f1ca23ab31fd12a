use std::collections::BTreeMap;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;

use serde_json::Map;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::Capabilities;
use crate::ClusterDirectory;
use crate::CommandInfo;
use crate::CommandKind;
use crate::ConfigLoader;
use crate::DispatchReport;
use crate::DynMacroError;
use crate::DynMacroResult;
use crate::EngineSettings;
use crate::ExpressionScripts;
use crate::Host;
use crate::Invocation;
use crate::MacroDefinition;
use crate::MacroDescription;
use crate::MacroRegistry;
use crate::Reactor;
use crate::ReloadOptions;
use crate::ReloadPolicy;
use crate::ReloadReport;
use crate::Response;
use crate::ScheduleUpdate;
use crate::ScriptRunner;
use crate::SimulatedHost;
use crate::StageSink;
use crate::TimerHandle;
use crate::WakeTime;
use crate::compiler::parse_bool;
use crate::stage::HostAccess;
use crate::stage::StageBindings;

/// Commands the engine answers itself.
pub const ENGINE_COMMANDS: [(&str, &str); 5] = [
	("RUN_MACRO", "Run a dynamic macro, optionally from a cluster"),
	("SET_VARIABLE", "Set a variable of a dynamic macro"),
	("RENDER_MACRO", "Show the rendered stages of a dynamic macro without running them"),
	("UPDATE_DELAYED", "Reprogram the timer of a self-scheduling macro"),
	("RELOAD_MACROS", "Reload dynamic macros from configuration"),
];

/// Deepest allowed chain of macros invoking macros.
pub const MAX_NESTING_DEPTH: usize = 16;

/// Prefix of the keys added to the host's status map.
pub const STATUS_PREFIX: &str = "dynamic_macro";

/// Result of reloading every registry.
#[derive(Debug, Default)]
pub struct ReloadSummary {
	pub global: ReloadReport,
	pub clusters: BTreeMap<String, ReloadReport>,
}

impl ReloadSummary {
	pub fn is_ok(&self) -> bool {
		self.global.is_ok() && self.clusters.values().all(ReloadReport::is_ok)
	}

	pub fn installed(&self) -> usize {
		self.global.installed.len()
			+ self
				.clusters
				.values()
				.map(|report| report.installed.len())
				.sum::<usize>()
	}

	pub fn errors(&self) -> impl Iterator<Item = &DynMacroError> {
		self.global
			.all_errors()
			.chain(self.clusters.values().flat_map(ReloadReport::all_errors))
	}
}

/// The dynamic macro engine.
///
/// Owns the global registry and every cluster. The embedding host routes
/// command lines to [`MacroEngine::run_command`] and due timers to
/// [`MacroEngine::fire_timer`].
///
/// ```rust,no_run
/// use dynmacro_core::MacroEngine;
/// use dynmacro_core::SimulatedHost;
///
/// let mut host = SimulatedHost::new();
/// let mut engine = MacroEngine::load("printer_config").unwrap();
/// engine.start(&mut host).unwrap();
/// engine.on_ready(&mut host);
/// engine.run_command(&mut host, "RUN_MACRO MACRO=GREET NAME=Ada");
/// ```
#[derive(Debug)]
pub struct MacroEngine {
	root: PathBuf,
	settings: EngineSettings,
	loader: ConfigLoader,
	global: MacroRegistry,
	capabilities: Capabilities,
	clusters: ClusterDirectory,
	scripts: Arc<dyn ScriptRunner>,
	ready: bool,
	depth: usize,
}

impl MacroEngine {
	pub fn new(root: impl Into<PathBuf>, settings: EngineSettings) -> Self {
		let root = root.into();

		Self {
			loader: ConfigLoader::new(root.clone()),
			global: MacroRegistry::new(None),
			capabilities: Capabilities {
				scripting_enabled: settings.scripting_enabled,
				host_access_enabled: settings.host_access_enabled,
			},
			clusters: ClusterDirectory::from_settings(&settings.clusters),
			scripts: Arc::new(ExpressionScripts),
			ready: false,
			depth: 0,
			settings,
			root,
		}
	}

	/// Build an engine from the settings file discovered at `root`, or from
	/// defaults when there is none.
	pub fn load(root: impl Into<PathBuf>) -> DynMacroResult<Self> {
		let root = root.into();
		let settings = EngineSettings::load(&root)?.unwrap_or_default();

		Ok(Self::new(root, settings))
	}

	#[must_use]
	pub fn with_scripts(mut self, scripts: Arc<dyn ScriptRunner>) -> Self {
		self.scripts = scripts;
		self
	}

	pub fn root(&self) -> &Path {
		&self.root
	}

	pub fn settings(&self) -> &EngineSettings {
		&self.settings
	}

	pub fn registry(&self) -> &MacroRegistry {
		&self.global
	}

	pub fn clusters(&self) -> &ClusterDirectory {
		&self.clusters
	}

	pub fn is_ready(&self) -> bool {
		self.ready
	}

	/// Register the engine's own commands with the host.
	pub fn install_commands(&self, host: &mut dyn Host) -> DynMacroResult<()> {
		for (name, description) in ENGINE_COMMANDS {
			if host
				.command(name)
				.is_some_and(|info| info.kind == CommandKind::Engine)
			{
				continue;
			}
			host.register_command(name, CommandInfo::new(CommandKind::Engine, description))?;
		}

		Ok(())
	}

	/// Register the engine commands and load every registry.
	pub fn start(&mut self, host: &mut dyn Host) -> DynMacroResult<ReloadSummary> {
		self.install_commands(host)?;
		Ok(self.reload(host))
	}

	/// Called once the host is ready: arms the timer of every
	/// self-scheduling macro. Macros installed later are armed as they are
	/// installed.
	pub fn on_ready(&mut self, host: &mut dyn Host) {
		self.ready = true;
		self.global.arm_timers(host);
		for cluster in self.clusters.iter() {
			cluster.registry.arm_timers(host);
		}
	}

	fn options(&self) -> ReloadOptions {
		ReloadOptions {
			on_failure: self.settings.on_reload_failure,
			persist_variables: self.settings.persist_variables,
			arm_timers: self.ready,
		}
	}

	/// Rebuild the global registry and every cluster from configuration.
	pub fn reload(&mut self, host: &mut dyn Host) -> ReloadSummary {
		let options = self.options();
		let mut summary = ReloadSummary {
			global: self
				.global
				.reload(host, &self.loader, &self.settings.configs, options),
			clusters: BTreeMap::new(),
		};

		for cluster in self.clusters.iter_mut() {
			let report = cluster
				.registry
				.reload(host, &self.loader, &cluster.configs, options);
			summary.clusters.insert(cluster.name.clone(), report);
		}

		info!(installed = summary.installed(), "dynamic macros loaded");
		summary
	}

	/// Rebuild a single registry: the global one for `None`.
	pub fn reload_registry(
		&mut self,
		host: &mut dyn Host,
		cluster: Option<&str>,
	) -> DynMacroResult<ReloadReport> {
		let options = self.options();
		let report = match cluster {
			Some(selector) => {
				let cluster = self.clusters.resolve_mut(selector)?;
				cluster
					.registry
					.reload(host, &self.loader, &cluster.configs, options)
			}
			None => {
				self.global
					.reload(host, &self.loader, &self.settings.configs, options)
			}
		};

		Ok(report)
	}

	/// Re-read the settings file. Reload flags, global capabilities and the
	/// capabilities and files of existing clusters take effect on the next
	/// reload or dispatch.
	pub fn refresh_settings(&mut self) -> DynMacroResult<()> {
		let Some(settings) = EngineSettings::load(&self.root)? else {
			return Ok(());
		};

		self.capabilities = Capabilities {
			scripting_enabled: settings.scripting_enabled,
			host_access_enabled: settings.host_access_enabled,
		};
		self.clusters.apply_settings(&settings.clusters);
		self.settings = settings;
		Ok(())
	}

	/// Handle one command line. Errors never escape: they are reported to
	/// the host as error responses.
	pub fn run_command(&mut self, host: &mut dyn Host, line: &str) {
		if let Err(e) = self.execute_line(host, line) {
			warn!(line, error = %e, "command failed");
			host.respond(Response::Error(e.to_string()));
		}
	}

	/// Route one line: engine commands and installed macros are handled
	/// here, everything else goes to the host.
	pub fn execute_line(&mut self, host: &mut dyn Host, line: &str) -> DynMacroResult<()> {
		let line = line.trim();
		if line.is_empty() {
			return Ok(());
		}

		let invocation = Invocation::parse(line)?;
		match invocation.name.as_str() {
			"RUN_MACRO" => self.cmd_run_macro(host, &invocation),
			"SET_VARIABLE" => self.cmd_set_variable(&invocation),
			"RENDER_MACRO" => self.cmd_render_macro(host, &invocation),
			"UPDATE_DELAYED" => self.cmd_update_delayed(host, &invocation),
			"RELOAD_MACROS" => self.cmd_reload_macros(host, &invocation),
			name => {
				let is_macro = self
					.global
					.get(name)
					.is_some_and(|definition| definition.claims_command());

				if is_macro {
					self.dispatch(host, None, &invocation).map(|_| ())
				} else {
					host.run_script(line).map_err(DynMacroError::Host)
				}
			}
		}
	}

	fn registry_for(&self, cluster: Option<&str>) -> DynMacroResult<(&MacroRegistry, Capabilities)> {
		match cluster {
			Some(selector) => {
				let cluster = self.clusters.resolve(selector)?;
				Ok((&cluster.registry, cluster.capabilities))
			}
			None => Ok((&self.global, self.capabilities)),
		}
	}

	fn bindings(&self, capabilities: Capabilities) -> StageBindings {
		capabilities.filter(StageBindings {
			scripts: self.scripts.clone(),
			host: HostAccess::Status(serde_json::Value::Null),
			script_root: self.root.clone(),
		})
	}

	/// Run the macro `invocation.name` from the given registry. Unknown
	/// names reach the placeholder, which only warns.
	pub fn dispatch(
		&mut self,
		host: &mut dyn Host,
		cluster: Option<&str>,
		invocation: &Invocation,
	) -> DynMacroResult<DispatchReport> {
		if self.settings.reload == ReloadPolicy::OnDispatch {
			let report = self.reload_registry(host, cluster)?;
			for error in report.all_errors() {
				host.respond(Response::Warning(error.to_string()));
			}
		}

		let (definition, capabilities) = {
			let (registry, capabilities) = self.registry_for(cluster)?;
			(registry.lookup_or_placeholder(&invocation.name), capabilities)
		};

		self.run_definition(host, &definition, invocation, capabilities)
	}

	fn run_definition(
		&mut self,
		host: &mut dyn Host,
		definition: &MacroDefinition,
		invocation: &Invocation,
		capabilities: Capabilities,
	) -> DynMacroResult<DispatchReport> {
		if self.depth >= MAX_NESTING_DEPTH {
			return Err(DynMacroError::RecursionLimit(MAX_NESTING_DEPTH));
		}

		debug!(name = %definition.qualified_name(), depth = self.depth, "dispatching macro");
		let bindings = self.bindings(capabilities);

		self.depth += 1;
		let report = definition.dispatch(invocation, &bindings, &mut EngineSink { engine: self, host });
		self.depth -= 1;

		Ok(report)
	}

	fn cmd_run_macro(&mut self, host: &mut dyn Host, invocation: &Invocation) -> DynMacroResult<()> {
		let name = invocation.require("MACRO")?;
		let forwarded = invocation.forward(name, &["MACRO", "CLUSTER"]);

		self.dispatch(host, invocation.get("CLUSTER"), &forwarded)
			.map(|_| ())
	}

	fn cmd_set_variable(&mut self, invocation: &Invocation) -> DynMacroResult<()> {
		let name = invocation.require("MACRO")?;
		let variable = invocation.require("VARIABLE")?;
		let value = invocation.require("VALUE")?;

		let (registry, _) = self.registry_for(invocation.get("CLUSTER"))?;
		let definition = registry
			.get(name)
			.ok_or_else(|| DynMacroError::UnknownMacro(name.to_string()))?;

		definition.set_variable(variable, value)?;
		debug!(name = %definition.qualified_name(), variable, "variable updated");
		Ok(())
	}

	fn cmd_render_macro(&mut self, host: &mut dyn Host, invocation: &Invocation) -> DynMacroResult<()> {
		let name = invocation.require("MACRO")?;
		let forwarded = invocation.forward(name, &["MACRO", "CLUSTER"]);

		let (registry, capabilities) = self.registry_for(invocation.get("CLUSTER"))?;
		let definition = registry
			.get(name)
			.ok_or_else(|| DynMacroError::UnknownMacro(name.to_string()))?;

		let mut bindings = self.bindings(capabilities);
		if let HostAccess::Status(_) = bindings.host {
			bindings.host = HostAccess::Status(host.status());
		}

		let preview = definition.render_preview(&forwarded, &bindings);
		for response in preview.responses {
			host.respond(response);
		}
		for (index, text) in preview.stages.iter().enumerate() {
			host.respond(Response::Info(format!(
				"{} stage {}:\n{}",
				definition.qualified_name(),
				index + 1,
				text.trim()
			)));
		}
		for error in preview.errors {
			host.respond(Response::Error(error.to_string()));
		}

		Ok(())
	}

	fn cmd_update_delayed(&mut self, host: &mut dyn Host, invocation: &Invocation) -> DynMacroResult<()> {
		let name = invocation.require("ID")?;
		let duration = invocation
			.float("DURATION")?
			.ok_or_else(|| DynMacroError::MissingParameter("DURATION".to_string()))?;
		if duration < 0.0 {
			return Err(DynMacroError::InvalidParameter {
				name: "DURATION".to_string(),
				reason: "must be zero or positive".to_string(),
			});
		}
		let repeat = invocation
			.get("REPEAT")
			.map(|raw| {
				parse_bool(raw).map_err(|reason| {
					DynMacroError::InvalidParameter {
						name: "REPEAT".to_string(),
						reason,
					}
				})
			})
			.transpose()?;

		let (registry, _) = self.registry_for(invocation.get("CLUSTER"))?;
		let definition = registry
			.get(name)
			.ok_or_else(|| DynMacroError::UnknownMacro(name.to_string()))?;

		match definition.update_delayed(duration, repeat, host.reactor())? {
			ScheduleUpdate::Deferred => {
				debug!(name = %definition.qualified_name(), duration, "delayed update deferred to running callback");
			}
			ScheduleUpdate::Reprogrammed(wake) => {
				debug!(name = %definition.qualified_name(), ?wake, "delayed macro reprogrammed");
			}
			ScheduleUpdate::Recorded => {
				debug!(name = %definition.qualified_name(), duration, "delayed update recorded until the host is ready");
			}
		}

		Ok(())
	}

	fn cmd_reload_macros(&mut self, host: &mut dyn Host, invocation: &Invocation) -> DynMacroResult<()> {
		self.refresh_settings()?;

		let (installed, errors): (usize, Vec<String>) = match invocation.get("CLUSTER") {
			Some(cluster) => {
				let report = self.reload_registry(host, Some(cluster))?;
				(
					report.installed.len(),
					report.all_errors().map(ToString::to_string).collect(),
				)
			}
			None => {
				let summary = self.reload(host);
				(
					summary.installed(),
					summary.errors().map(ToString::to_string).collect(),
				)
			}
		};

		for error in errors {
			host.respond(Response::Error(error));
		}
		host.respond(Response::Info(format!("Reloaded {installed} dynamic macros")));
		Ok(())
	}

	fn find_timer(&self, handle: TimerHandle) -> Option<(Arc<MacroDefinition>, Capabilities)> {
		if let Some(definition) = self.global.find_timer(handle) {
			return Some((definition, self.capabilities));
		}

		self.clusters.iter().find_map(|cluster| {
			cluster
				.registry
				.find_timer(handle)
				.map(|definition| (definition, cluster.capabilities))
		})
	}

	/// Run the macro owning `handle` from its timer callback and return the
	/// next wake time to program.
	pub fn fire_timer(&mut self, host: &mut dyn Host, handle: TimerHandle, eventtime: f64) -> WakeTime {
		let Some((definition, capabilities)) = self.find_timer(handle) else {
			debug!(?handle, "timer fired for an uninstalled macro");
			return WakeTime::Never;
		};

		definition.begin_fire();
		let invocation = Invocation::bare(definition.name());
		if let Err(e) = self.run_definition(host, &definition, &invocation, capabilities) {
			host.respond(Response::Error(e.to_string()));
		}

		definition.finish_fire(eventtime)
	}

	/// Move the simulated clock to `until`, firing due timers in wake order.
	/// Returns how many timers fired.
	pub fn advance_to(&mut self, host: &mut SimulatedHost, until: f64) -> usize {
		let mut fired = 0;

		while let Some((handle, at)) = host.clock.next_due(until) {
			host.clock.set_time(at);
			let wake = self.fire_timer(host, handle, at);
			host.clock.update_timer(handle, wake);
			fired += 1;
		}

		host.clock.set_time(until);
		fired
	}

	pub fn describe(&self, name: &str, cluster: Option<&str>) -> DynMacroResult<MacroDescription> {
		let (registry, _) = self.registry_for(cluster)?;
		registry
			.describe(name)
			.ok_or_else(|| DynMacroError::UnknownMacro(name.to_string()))
	}

	/// Every macro in the global registry followed by every cluster.
	pub fn describe_all(&self) -> Vec<MacroDescription> {
		let mut descriptions = self.global.describe_all();
		for cluster in self.clusters.iter() {
			descriptions.extend(cluster.registry.describe_all());
		}

		descriptions
	}

	/// Status entries keyed `dynamic_macro NAME` or
	/// `dynamic_macro CLUSTER:NAME`.
	pub fn status(&self) -> Map<String, serde_json::Value> {
		self.describe_all()
			.into_iter()
			.filter_map(|description| {
				let key = status_key(&description);
				serde_json::to_value(description)
					.ok()
					.map(|value| (key, value))
			})
			.collect()
	}

	/// Add this engine's status entries to the host's status map. Existing
	/// host entries are never replaced.
	pub fn merge_status(&self, host_status: &mut Map<String, serde_json::Value>) {
		for (key, value) in self.status() {
			host_status.entry(key).or_insert(value);
		}
	}
}

pub fn status_key(description: &MacroDescription) -> String {
	match &description.cluster {
		Some(cluster) => format!("{STATUS_PREFIX} {cluster}:{}", description.name),
		None => format!("{STATUS_PREFIX} {}", description.name),
	}
}

/// Routes the output of a running macro back through the engine.
struct EngineSink<'a> {
	engine: &'a mut MacroEngine,
	host: &'a mut dyn Host,
}

impl StageSink for EngineSink<'_> {
	fn host_status(&mut self) -> serde_json::Value {
		self.host.status()
	}

	fn respond(&mut self, response: Response) {
		self.host.respond(response);
	}

	fn execute(&mut self, macro_name: &str, script: &str) -> DynMacroResult<()> {
		for line in script.lines() {
			if let Err(e) = self.engine.execute_line(&mut *self.host, line) {
				debug!(name = macro_name, line, error = %e, "line failed, skipping rest of stage");
				return Err(e);
			}
		}

		Ok(())
	}
}
