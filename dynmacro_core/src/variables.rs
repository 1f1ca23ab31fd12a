use std::collections::BTreeMap;

use derive_more::Deref;
use derive_more::DerefMut;
use serde::Serialize;
use serde_json::Value;

use crate::DynMacroError;
use crate::DynMacroResult;
use crate::literal::ensure_round_trip;
use crate::literal::parse_literal;

/// Per-macro variable state.
///
/// Values are restricted literals (see [`parse_literal`]). The store is
/// seeded from `variable_<key>` options at compile time and only changes
/// through `SET_VARIABLE`, the `update()` template utility, or variables
/// committed by a script.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deref, DerefMut)]
#[serde(transparent)]
pub struct VariableStore(BTreeMap<String, Value>);

impl VariableStore {
	pub fn new(seeds: BTreeMap<String, Value>) -> Self {
		Self(seeds)
	}

	/// Parse `raw` as a restricted literal and store it under `key`. The store
	/// is left untouched when parsing fails.
	pub fn set_literal(&mut self, key: &str, raw: &str) -> DynMacroResult<()> {
		let value = parse_literal(raw)?;
		self.0.insert(normalize_key(key), value);
		Ok(())
	}

	/// Store an already structured value after checking it has a compact
	/// serialized form.
	pub fn set_value(&mut self, key: &str, value: Value) -> DynMacroResult<()> {
		ensure_round_trip(&value).map_err(|reason| {
			DynMacroError::LiteralParse {
				input: value.to_string(),
				reason,
			}
		})?;
		self.0.insert(normalize_key(key), value);
		Ok(())
	}

	/// Replace this store's values with those of `other` for every key both
	/// stores share, leaving new seeds untouched.
	pub fn carry_from(&mut self, other: &VariableStore) {
		for (key, value) in &other.0 {
			if let Some(slot) = self.0.get_mut(key) {
				slot.clone_from(value);
			}
		}
	}

	pub fn into_inner(self) -> BTreeMap<String, Value> {
		self.0
	}
}

/// Variable names are lowercase, mirroring how option keys are read.
pub fn normalize_key(key: &str) -> String {
	key.trim().to_ascii_lowercase()
}
