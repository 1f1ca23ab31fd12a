use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::CommandInfo;
use crate::CommandKind;
use crate::ConfigLoader;
use crate::DynMacroError;
use crate::DynMacroResult;
use crate::Host;
use crate::MacroCompiler;
use crate::MacroDefinition;
use crate::MacroDescription;
use crate::ReloadFailure;
use crate::TimerHandle;

/// How a reload treats the previous generation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReloadOptions {
	pub on_failure: ReloadFailure,
	pub persist_variables: bool,
	/// Arm timers of self-scheduling macros as they are installed. Set once
	/// the host is ready.
	pub arm_timers: bool,
}

/// Result of reloading one registry.
#[derive(Debug, Default)]
pub struct ReloadReport {
	/// Names installed by this reload, in configuration order.
	pub installed: Vec<String>,
	/// Names skipped because the host reserves them.
	pub skipped: Vec<String>,
	/// Non-fatal errors: sections that failed to compile or install.
	pub errors: Vec<DynMacroError>,
	/// The error that stopped the reload before anything was installed.
	pub failure: Option<DynMacroError>,
	/// The previous generation was reinstalled after a failure.
	pub restored: bool,
}

impl ReloadReport {
	pub fn is_ok(&self) -> bool {
		self.failure.is_none() && self.errors.is_empty()
	}

	/// Every error, fatal or not.
	pub fn all_errors(&self) -> impl Iterator<Item = &DynMacroError> {
		self.failure.iter().chain(self.errors.iter())
	}
}

/// Whether `install` added the macro.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallOutcome {
	Installed,
	/// The host reserves the name. Skipping is a warning, not an error.
	Reserved,
}

/// The live macros of one namespace.
///
/// The global registry claims a host command for every invocable macro;
/// cluster registries never touch the host's command table. Every rename
/// made through `rename_existing` is recorded so it can be undone when the
/// macro is uninstalled, which keeps repeated reloads from chaining
/// renames.
#[derive(Debug, Default)]
pub struct MacroRegistry {
	cluster: Option<String>,
	macros: BTreeMap<String, Arc<MacroDefinition>>,
	/// Claimed name → alias the previous command was moved to.
	renames: BTreeMap<String, String>,
}

impl MacroRegistry {
	pub fn new(cluster: Option<String>) -> Self {
		Self {
			cluster,
			..Self::default()
		}
	}

	pub fn cluster(&self) -> Option<&str> {
		self.cluster.as_deref()
	}

	pub fn compiler(&self) -> MacroCompiler {
		MacroCompiler::new(self.cluster.clone())
	}

	pub fn len(&self) -> usize {
		self.macros.len()
	}

	pub fn is_empty(&self) -> bool {
		self.macros.is_empty()
	}

	pub fn names(&self) -> impl Iterator<Item = &str> {
		self.macros.keys().map(String::as_str)
	}

	pub fn iter(&self) -> impl Iterator<Item = &Arc<MacroDefinition>> {
		self.macros.values()
	}

	pub fn get(&self, name: &str) -> Option<Arc<MacroDefinition>> {
		self.macros.get(&name.trim().to_ascii_uppercase()).cloned()
	}

	/// Look up `name`, falling back to a placeholder that only warns.
	pub fn lookup_or_placeholder(&self, name: &str) -> Arc<MacroDefinition> {
		self.get(name).unwrap_or_else(|| {
			debug!(name, "no such macro, using placeholder");
			Arc::new(MacroDefinition::placeholder(name.trim(), self.cluster.clone()))
		})
	}

	pub fn find_timer(&self, handle: TimerHandle) -> Option<Arc<MacroDefinition>> {
		self.macros
			.values()
			.find(|definition| definition.timer_handle() == Some(handle))
			.cloned()
	}

	/// Alias recorded for a claimed name.
	pub fn renamed_to(&self, name: &str) -> Option<&str> {
		self.renames.get(name).map(String::as_str)
	}

	pub fn install(
		&mut self,
		host: &mut dyn Host,
		definition: MacroDefinition,
		arm_timer: bool,
	) -> DynMacroResult<InstallOutcome> {
		self.install_shared(host, Arc::new(definition), arm_timer)
	}

	fn install_shared(
		&mut self,
		host: &mut dyn Host,
		definition: Arc<MacroDefinition>,
		arm_timer: bool,
	) -> DynMacroResult<InstallOutcome> {
		let name = definition.name().to_string();

		if self.macros.contains_key(&name) {
			self.uninstall(host, &name);
		}

		if definition.claims_command() {
			if is_reserved(host, &name) {
				warn!(name = %name, "skipping macro with a name reserved by the host");
				return Ok(InstallOutcome::Reserved);
			}
			self.claim_command(host, &definition)?;
		}

		if arm_timer && definition.timer_handle().is_none() {
			definition.arm(host.reactor());
		}

		debug!(name = %name, cluster = self.cluster.as_deref().unwrap_or("global"), "installed macro");
		self.macros.insert(name, definition);
		Ok(InstallOutcome::Installed)
	}

	fn claim_command(&mut self, host: &mut dyn Host, definition: &MacroDefinition) -> DynMacroResult<()> {
		let name = definition.name();
		let error = |reason: String| {
			DynMacroError::Compile {
				name: name.to_string(),
				reason,
			}
		};

		if host.command(name).is_some() {
			let Some(alias) = definition.rename_existing() else {
				return Err(error(format!(
					"command `{name}` already exists; set `rename_existing` to replace it"
				)));
			};

			if is_reserved(host, alias) || host.command(alias).is_some() {
				return Err(error(format!(
					"cannot rename existing command to `{alias}`: the name is already in use"
				)));
			}

			let Some(existing) = host.unregister_command(name) else {
				return Err(error(format!("command `{name}` vanished while renaming it")));
			};
			host.register_command(alias, existing)?;
			info!(name, alias, "renamed existing command");
			self.renames.insert(name.to_string(), alias.to_string());
		}

		host.register_command(name, CommandInfo::new(CommandKind::Macro, definition.description()))
	}

	/// Remove `name`, releasing its timer, its command and any command it
	/// renamed.
	pub fn uninstall(&mut self, host: &mut dyn Host, name: &str) -> Option<Arc<MacroDefinition>> {
		let definition = self.detach(host, name)?;
		definition.disarm(host.reactor());
		Some(definition)
	}

	/// Remove `name` and give back its commands but leave its timer
	/// registered, so a reload can pass the live timer on.
	fn detach(&mut self, host: &mut dyn Host, name: &str) -> Option<Arc<MacroDefinition>> {
		let name = name.trim().to_ascii_uppercase();
		let definition = self.macros.remove(&name)?;

		if definition.claims_command() {
			host.unregister_command(&name);
			if let Some(alias) = self.renames.remove(&name) {
				if let Some(original) = host.unregister_command(&alias) {
					if let Err(e) = host.register_command(&name, original) {
						warn!(name = %name, alias = %alias, error = %e, "failed to restore renamed command");
					}
				}
			}
		}

		debug!(name = %name, "uninstalled macro");
		Some(definition)
	}

	fn detach_all(&mut self, host: &mut dyn Host) -> Vec<Arc<MacroDefinition>> {
		let names: Vec<String> = self.macros.keys().cloned().collect();
		names
			.iter()
			.filter_map(|name| self.detach(host, name))
			.collect()
	}

	/// Install an already shared definition, releasing its timer when it
	/// does not make it into the registry.
	fn install_or_release(
		&mut self,
		host: &mut dyn Host,
		definition: Arc<MacroDefinition>,
		arm_timer: bool,
		report: &mut ReloadReport,
	) {
		let name = definition.name().to_string();
		match self.install_shared(host, definition.clone(), arm_timer) {
			Ok(InstallOutcome::Installed) => report.installed.push(name),
			Ok(InstallOutcome::Reserved) => {
				definition.disarm(host.reactor());
				report.skipped.push(name);
			}
			Err(e) => {
				warn!(name = %name, error = %e, "failed to install macro");
				definition.disarm(host.reactor());
				report.errors.push(e);
			}
		}
	}

	/// Replace the whole macro set with a fresh generation read from
	/// `files`.
	///
	/// The previous generation is uninstalled first. When reading the
	/// configuration fails, `options.on_failure` decides whether the
	/// registry stays empty or gets the previous generation back. Timers
	/// survive a reload: a restored macro keeps its own, and a macro of the
	/// new generation takes over the timer of its namesake with the wake
	/// time already programmed.
	pub fn reload(
		&mut self,
		host: &mut dyn Host,
		loader: &ConfigLoader,
		files: &[PathBuf],
		options: ReloadOptions,
	) -> ReloadReport {
		let previous = self.detach_all(host);
		let mut report = ReloadReport::default();

		let sections = match loader.load_sections(files) {
			Ok(sections) => sections,
			Err(e) => {
				warn!(
					cluster = self.cluster.as_deref().unwrap_or("global"),
					error = %e,
					"failed to reload macros"
				);
				if options.on_failure == ReloadFailure::RestorePrevious {
					for definition in previous {
						self.install_or_release(host, definition, options.arm_timers, &mut report);
					}
					report.restored = true;
				} else {
					release_timers(host, &previous);
				}
				report.failure = Some(e);
				return report;
			}
		};

		let output = self.compiler().compile_sections(&sections);
		report.errors = output.errors;

		for definition in output.definitions {
			if let Some(old) = previous.iter().find(|old| old.name() == definition.name()) {
				if options.persist_variables {
					definition.carry_variables_from(old);
				}
				definition.take_timer_from(old);
			}

			self.install_or_release(host, Arc::new(definition), options.arm_timers, &mut report);
		}
		release_timers(host, &previous);

		info!(
			cluster = self.cluster.as_deref().unwrap_or("global"),
			installed = report.installed.len(),
			errors = report.errors.len(),
			"reloaded macros"
		);
		report
	}

	/// Arm every self-scheduling macro. Called when the host becomes ready.
	pub fn arm_timers(&self, host: &mut dyn Host) {
		for definition in self.macros.values() {
			if let Some(wake) = definition.arm(host.reactor()) {
				debug!(name = definition.name(), ?wake, "armed delayed macro");
			}
		}
	}

	pub fn describe(&self, name: &str) -> Option<MacroDescription> {
		self.get(name).map(|definition| definition.describe())
	}

	pub fn describe_all(&self) -> Vec<MacroDescription> {
		self.macros.values().map(|definition| definition.describe()).collect()
	}
}

/// Unregister the timers no newer generation took over. A definition whose
/// timer moved on keeps its repeat flag, so a callback of it that is still
/// running reschedules the adopted timer.
fn release_timers(host: &mut dyn Host, previous: &[Arc<MacroDefinition>]) {
	for definition in previous {
		if definition.timer_handle().is_some() {
			definition.disarm(host.reactor());
		}
	}
}

/// Host reserved names and the engine's own commands can never be claimed.
fn is_reserved(host: &dyn Host, name: &str) -> bool {
	host.is_reserved(name)
		|| host
			.command(name)
			.is_some_and(|info| info.kind == CommandKind::Engine)
}
