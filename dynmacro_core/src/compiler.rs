use std::collections::BTreeMap;
use std::path::PathBuf;

use serde_json::Value;
use snailquote::unescape;
use tracing::debug;
use tracing::warn;

use crate::ConfigSection;
use crate::DynMacroError;
use crate::DynMacroResult;
use crate::MacroDefinition;
use crate::literal::parse_seed;
use crate::stage::Stage;
use crate::variables::normalize_key;

/// Section kind of an invocable macro.
pub const MACRO_SECTION: &str = "gcode_macro";
/// Section kind of a self-scheduling macro with no command of its own.
pub const DELAYED_SECTION: &str = "delayed_gcode";
/// Two consecutive blank lines separate stages unless a macro says
/// otherwise.
pub const DEFAULT_DELIMITER: &str = "\n\n\n";
/// Setting `delimiter: NO_DELIMITER` compiles the whole body as one stage.
pub const NO_DELIMITER: &str = "NO_DELIMITER";
pub const DEFAULT_DESCRIPTION: &str = "No Description";

const VARIABLE_PREFIX: &str = "variable_";

/// The uncompiled form of a macro, extracted from one configuration
/// section.
#[derive(Debug, Clone, PartialEq)]
pub struct MacroSource {
	/// Uppercase command name.
	pub name: String,
	pub description: String,
	/// `None` when stage splitting is disabled.
	pub delimiter: Option<String>,
	pub rename_existing: Option<String>,
	/// Seconds until the first firing once the engine is ready.
	pub initial_duration: Option<f64>,
	pub repeat: bool,
	/// Set for `[delayed_gcode]` sections.
	pub is_delayed: bool,
	/// Seed values for the variable store.
	pub variables: BTreeMap<String, Value>,
	/// Normalized template body.
	pub body: String,
	pub file: PathBuf,
	pub line: usize,
}

impl MacroSource {
	/// Extract a macro from `section`. Returns `Ok(None)` for sections that
	/// belong to the host.
	pub fn from_section(section: &ConfigSection) -> DynMacroResult<Option<Self>> {
		let is_delayed = match section.kind.as_str() {
			MACRO_SECTION => false,
			DELAYED_SECTION => true,
			_ => return Ok(None),
		};

		let name = section.name.trim().to_ascii_uppercase();
		let error = |reason: String| {
			DynMacroError::Compile {
				name: name.clone(),
				reason,
			}
		};

		if name.is_empty() || name.contains(char::is_whitespace) {
			return Err(error(format!(
				"section `[{} {}]` needs a single word name",
				section.kind, section.name
			)));
		}

		let Some(body) = section.get("gcode") else {
			return Err(error("missing required option `gcode`".to_string()));
		};

		let initial_duration = section
			.get("initial_duration")
			.map(|raw| parse_duration(raw).map_err(&error))
			.transpose()?;

		let repeat = section
			.get("repeat")
			.map(|raw| parse_bool(raw).map_err(&error))
			.transpose()?
			.unwrap_or(false);

		let delimiter = section
			.get("delimiter")
			.map_or(Ok(Some(DEFAULT_DELIMITER.to_string())), |raw| {
				parse_delimiter(raw).map_err(&error)
			})?;

		let mut variables = BTreeMap::new();
		for (key, value) in &section.entries {
			if let Some(variable) = key.strip_prefix(VARIABLE_PREFIX) {
				variables.insert(normalize_key(variable), parse_seed(value));
			}
		}

		Ok(Some(Self {
			description: section
				.get("description")
				.filter(|description| !description.trim().is_empty())
				.unwrap_or(DEFAULT_DESCRIPTION)
				.trim()
				.to_string(),
			rename_existing: section
				.get("rename_existing")
				.map(|alias| alias.trim().to_ascii_uppercase())
				.filter(|alias| !alias.is_empty()),
			delimiter,
			initial_duration,
			repeat,
			is_delayed,
			variables,
			body: normalize_body(body),
			file: section.file.clone(),
			line: section.line,
			name,
		}))
	}

	/// The normalized body split into stage sources.
	pub fn stage_sources(&self) -> Vec<&str> {
		split_stages(&self.body, self.delimiter.as_deref())
	}
}

fn parse_duration(raw: &str) -> Result<f64, String> {
	let duration: f64 = raw
		.trim()
		.parse()
		.map_err(|_| format!("`initial_duration` must be a number of seconds, got `{raw}`"))?;

	if !duration.is_finite() || duration < 0.0 {
		return Err(format!("`initial_duration` must be zero or positive, got `{raw}`"));
	}

	Ok(duration)
}

/// Accepts the boolean spellings host configuration files use.
pub(crate) fn parse_bool(raw: &str) -> Result<bool, String> {
	match raw.trim().to_ascii_lowercase().as_str() {
		"1" | "true" | "yes" | "on" => Ok(true),
		"0" | "false" | "no" | "off" => Ok(false),
		_ => Err(format!("expected a boolean, got `{raw}`")),
	}
}

fn parse_delimiter(raw: &str) -> Result<Option<String>, String> {
	let raw = raw.trim();
	if raw.is_empty() || raw == NO_DELIMITER {
		return Ok(None);
	}

	let delimiter = if raw.starts_with(['"', '\'']) {
		unescape(raw).map_err(|e| format!("invalid `delimiter`: {e}"))?
	} else {
		raw.to_string()
	};

	Ok((!delimiter.is_empty()).then_some(delimiter))
}

/// Normalize a raw macro body.
///
/// Trailing whitespace is stripped from every line, the common indentation
/// removed and blank lines trimmed from both ends. Runs of more than two
/// blank lines collapse to exactly two so the default delimiter still
/// matches.
pub fn normalize_body(raw: &str) -> String {
	let lines: Vec<&str> = raw.lines().map(str::trim_end).collect();

	let indent = lines
		.iter()
		.filter(|line| !line.is_empty())
		.map(|line| line.len() - line.trim_start().len())
		.min()
		.unwrap_or(0);

	let start = lines.iter().position(|line| !line.is_empty());
	let end = lines.iter().rposition(|line| !line.is_empty());
	let (Some(start), Some(end)) = (start, end) else {
		return String::new();
	};

	let mut output: Vec<&str> = Vec::new();
	let mut blank_run = 0usize;
	for line in &lines[start..=end] {
		if line.is_empty() {
			blank_run += 1;
			if blank_run <= 2 {
				output.push("");
			}
			continue;
		}

		blank_run = 0;
		output.push(line.get(indent..).unwrap_or_else(|| line.trim_start()));
	}

	output.join("\n")
}

/// Split a normalized body into stage sources. Whitespace-only stages are
/// dropped.
pub fn split_stages<'a>(body: &'a str, delimiter: Option<&str>) -> Vec<&'a str> {
	let parts: Vec<&str> = match delimiter {
		Some(delimiter) => body.split(delimiter).collect(),
		None => vec![body],
	};

	parts
		.into_iter()
		.map(|part| part.trim_matches('\n'))
		.filter(|part| !part.trim().is_empty())
		.collect()
}

/// Definitions compiled from a set of sections together with the errors of
/// the sections that failed.
#[derive(Debug, Default)]
pub struct CompileOutput {
	pub definitions: Vec<MacroDefinition>,
	pub errors: Vec<DynMacroError>,
}

/// Turns configuration sections into [`MacroDefinition`]s owned by one
/// registry.
#[derive(Debug, Clone, Default)]
pub struct MacroCompiler {
	cluster: Option<String>,
}

impl MacroCompiler {
	pub fn new(cluster: Option<String>) -> Self {
		Self { cluster }
	}

	pub fn compile(&self, source: MacroSource) -> DynMacroResult<MacroDefinition> {
		let stages = source
			.stage_sources()
			.into_iter()
			.enumerate()
			.map(|(index, body)| Stage::compile(&source.name, index + 1, body))
			.collect::<DynMacroResult<Vec<_>>>()?;

		debug!(
			name = %source.name,
			cluster = self.cluster.as_deref().unwrap_or("global"),
			stages = stages.len(),
			"compiled macro"
		);

		Ok(MacroDefinition::new(source, stages, self.cluster.clone()))
	}

	/// Compile every macro section. A failing section is reported and
	/// skipped; it never stops the others. When two sections share a name
	/// the later one wins.
	pub fn compile_sections(&self, sections: &[ConfigSection]) -> CompileOutput {
		let mut output = CompileOutput::default();
		let mut positions: BTreeMap<String, usize> = BTreeMap::new();

		for section in sections {
			let source = match MacroSource::from_section(section) {
				Ok(Some(source)) => source,
				Ok(None) => continue,
				Err(e) => {
					output.errors.push(e);
					continue;
				}
			};

			let definition = match self.compile(source) {
				Ok(definition) => definition,
				Err(e) => {
					output.errors.push(e);
					continue;
				}
			};

			if let Some(&index) = positions.get(definition.name()) {
				warn!(
					name = definition.name(),
					file = %section.file.display(),
					line = section.line,
					"duplicate macro definition replaces an earlier one"
				);
				output.definitions[index] = definition;
			} else {
				positions.insert(definition.name().to_string(), output.definitions.len());
				output.definitions.push(definition);
			}
		}

		output
	}
}
