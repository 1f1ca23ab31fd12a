use std::collections::BTreeMap;
use std::path::Path;
use std::path::PathBuf;

use serde::Deserialize;

use crate::DynMacroError;
use crate::DynMacroResult;

/// Supported settings file locations in discovery order (highest precedence
/// first).
pub const SETTINGS_FILE_CANDIDATES: [&str; 3] =
	["dynmacro.toml", ".dynmacro.toml", ".config/dynmacro.toml"];

/// When the macro set is rebuilt from configuration.
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum ReloadPolicy {
	/// Reload at startup, on `RELOAD_MACROS`, or when the embedding host
	/// calls [`MacroEngine::reload`](crate::MacroEngine::reload).
	#[default]
	Explicit,
	/// Reload before every engine-routed dispatch. Guarantees the freshest
	/// configuration at the cost of re-reading every file per invocation.
	OnDispatch,
}

/// What happens to a registry when a reload fails partway through.
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum ReloadFailure {
	/// Leave the registry without the failed generation. The previous
	/// generation has already been uninstalled, so no macros remain until
	/// the next successful reload.
	#[default]
	KeepEmpty,
	/// Reinstall the generation that was live before the reload started.
	RestorePrevious,
}

/// Settings for a single cluster.
///
/// ```toml
/// [clusters.sandbox]
/// configs = ["sandbox.cfg"]
/// scripting_enabled = false
/// host_access_enabled = false
/// ```
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct ClusterSettings {
	/// Macro configuration files owned by this cluster, relative to the
	/// configuration root.
	#[serde(default)]
	pub configs: Vec<PathBuf>,
	/// Whether `script()` and `script_file()` run inside templates.
	#[serde(default = "default_true")]
	pub scripting_enabled: bool,
	/// Whether templates can read host state through `printer`.
	#[serde(default = "default_true")]
	pub host_access_enabled: bool,
}

/// Engine settings loaded from `dynmacro.toml`.
///
/// ```toml
/// configs = ["macros.cfg"]
/// reload = "explicit"
/// on_reload_failure = "keep_empty"
/// persist_variables = false
///
/// [clusters.sandbox]
/// configs = ["sandbox.cfg"]
/// scripting_enabled = false
/// ```
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct EngineSettings {
	/// Macro configuration files for the global registry, relative to the
	/// configuration root.
	#[serde(default)]
	pub configs: Vec<PathBuf>,
	/// When macros are reloaded.
	#[serde(default)]
	pub reload: ReloadPolicy,
	/// Registry state after a failed reload.
	#[serde(default)]
	pub on_reload_failure: ReloadFailure,
	/// Carry runtime variable values into the next generation of a macro
	/// with the same name. When false, every reload reseeds variables from
	/// configuration.
	#[serde(default)]
	pub persist_variables: bool,
	/// Scripting capability of the global registry.
	#[serde(default = "default_true")]
	pub scripting_enabled: bool,
	/// Host access capability of the global registry.
	#[serde(default = "default_true")]
	pub host_access_enabled: bool,
	/// Named clusters.
	#[serde(default)]
	pub clusters: BTreeMap<String, ClusterSettings>,
}

impl Default for EngineSettings {
	fn default() -> Self {
		Self {
			configs: Vec::new(),
			reload: ReloadPolicy::default(),
			on_reload_failure: ReloadFailure::default(),
			persist_variables: false,
			scripting_enabled: true,
			host_access_enabled: true,
			clusters: BTreeMap::new(),
		}
	}
}

fn default_true() -> bool {
	true
}

impl EngineSettings {
	/// Resolve the settings path from known discovery candidates.
	#[must_use]
	pub fn resolve_path(root: &Path) -> Option<PathBuf> {
		SETTINGS_FILE_CANDIDATES
			.iter()
			.map(|candidate| root.join(candidate))
			.find(|path| path.is_file())
	}

	/// Load the settings from the first discovered settings file at `root`.
	/// Returns `None` if no file exists.
	pub fn load(root: &Path) -> DynMacroResult<Option<EngineSettings>> {
		let Some(path) = Self::resolve_path(root) else {
			return Ok(None);
		};

		let content = std::fs::read_to_string(&path)?;
		Self::from_toml(&content).map(Some)
	}

	/// Parse settings from TOML text.
	pub fn from_toml(content: &str) -> DynMacroResult<EngineSettings> {
		toml::from_str(content).map_err(|e| DynMacroError::Settings(e.to_string()))
	}
}
