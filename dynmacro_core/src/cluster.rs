use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use serde::Serialize;
use tracing::warn;

use crate::ClusterSettings;
use crate::DynMacroError;
use crate::DynMacroResult;
use crate::MacroRegistry;
use crate::script::DisabledScripts;
use crate::stage::HostAccess;
use crate::stage::StageBindings;

/// What templates in a namespace may do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Capabilities {
	pub scripting_enabled: bool,
	pub host_access_enabled: bool,
}

impl Default for Capabilities {
	fn default() -> Self {
		Self {
			scripting_enabled: true,
			host_access_enabled: true,
		}
	}
}

impl Capabilities {
	/// Restrict `bindings` for one dispatch. Disabled scripting swaps in a
	/// runner that only warns; disabled host access hides `printer` behind an
	/// object whose attributes are all undefined.
	pub fn filter(&self, mut bindings: StageBindings) -> StageBindings {
		if !self.scripting_enabled {
			bindings.scripts = Arc::new(DisabledScripts);
		}
		if !self.host_access_enabled {
			bindings.host = HostAccess::Inert;
		}

		bindings
	}
}

impl From<&ClusterSettings> for Capabilities {
	fn from(settings: &ClusterSettings) -> Self {
		Self {
			scripting_enabled: settings.scripting_enabled,
			host_access_enabled: settings.host_access_enabled,
		}
	}
}

/// An isolated namespace of macros with its own configuration files and
/// capabilities.
#[derive(Debug)]
pub struct Cluster {
	pub name: String,
	pub capabilities: Capabilities,
	pub registry: MacroRegistry,
	pub configs: Vec<PathBuf>,
}

impl Cluster {
	pub fn new(name: &str, settings: &ClusterSettings) -> Self {
		Self {
			name: name.to_string(),
			capabilities: Capabilities::from(settings),
			registry: MacroRegistry::new(Some(name.to_string())),
			configs: settings.configs.clone(),
		}
	}
}

/// Every cluster known to the engine, built once from the settings.
#[derive(Debug, Default)]
pub struct ClusterDirectory {
	clusters: BTreeMap<String, Cluster>,
}

impl ClusterDirectory {
	pub fn from_settings(settings: &BTreeMap<String, ClusterSettings>) -> Self {
		Self {
			clusters: settings
				.iter()
				.map(|(name, settings)| (name.clone(), Cluster::new(name, settings)))
				.collect(),
		}
	}

	pub fn resolve(&self, selector: &str) -> DynMacroResult<&Cluster> {
		self.clusters
			.get(selector.trim())
			.ok_or_else(|| DynMacroError::UnknownCluster(selector.trim().to_string()))
	}

	pub fn resolve_mut(&mut self, selector: &str) -> DynMacroResult<&mut Cluster> {
		self.clusters
			.get_mut(selector.trim())
			.ok_or_else(|| DynMacroError::UnknownCluster(selector.trim().to_string()))
	}

	pub fn names(&self) -> impl Iterator<Item = &str> {
		self.clusters.keys().map(String::as_str)
	}

	pub fn iter(&self) -> impl Iterator<Item = &Cluster> {
		self.clusters.values()
	}

	pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Cluster> {
		self.clusters.values_mut()
	}

	pub fn len(&self) -> usize {
		self.clusters.len()
	}

	pub fn is_empty(&self) -> bool {
		self.clusters.is_empty()
	}

	/// Refresh the capabilities and file lists of existing clusters.
	/// Clusters cannot be added or removed at runtime; those changes are
	/// logged and ignored.
	pub fn apply_settings(&mut self, settings: &BTreeMap<String, ClusterSettings>) {
		for (name, cluster_settings) in settings {
			match self.clusters.get_mut(name) {
				Some(cluster) => {
					cluster.capabilities = Capabilities::from(cluster_settings);
					cluster.configs.clone_from(&cluster_settings.configs);
				}
				None => warn!(cluster = %name, "ignoring cluster added after startup"),
			}
		}

		for name in self.clusters.keys() {
			if !settings.contains_key(name) {
				warn!(cluster = %name, "cluster removed from settings stays loaded until restart");
			}
		}
	}
}
