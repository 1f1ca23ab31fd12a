use std::path::Component;
use std::path::Path;
use std::path::PathBuf;

use globset::GlobBuilder;
use ignore::WalkBuilder;
use tracing::debug;

use crate::DynMacroError;
use crate::DynMacroResult;

/// Prefixes that start a comment, either on a line of their own or inline
/// after whitespace.
pub const COMMENT_PREFIXES: [char; 2] = ['#', ';'];

/// A single line of configuration after include expansion, tagged with the
/// file and 1-indexed line number it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigLine {
	pub file: PathBuf,
	pub number: usize,
	pub text: String,
}

/// A `[kind name]` section and its ordered key/value entries.
///
/// ```ini
/// [gcode_macro GREET]
/// description: Say hello
/// gcode:
///   RESPOND MSG="hello"
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigSection {
	/// Section kind, e.g. `gcode_macro`.
	pub kind: String,
	/// Everything after the kind, e.g. `GREET`. Empty for bare sections.
	pub name: String,
	/// Keys are lowercased; multi-line values keep their line breaks.
	pub entries: Vec<(String, String)>,
	/// The file the section header was read from.
	pub file: PathBuf,
	/// 1-indexed line of the section header.
	pub line: usize,
}

impl ConfigSection {
	/// Look up the last value for `key`.
	pub fn get(&self, key: &str) -> Option<&str> {
		self.entries
			.iter()
			.rev()
			.find(|(k, _)| k == key)
			.map(|(_, v)| v.as_str())
	}
}

/// Reads macro configuration files from a root directory.
///
/// `[include <pattern>]` headers are replaced by the lines of every file the
/// pattern matches, resolved relative to the including file. Re-entering a
/// file that is still being read fails with
/// [`DynMacroError::RecursiveInclude`].
#[derive(Debug, Clone)]
pub struct ConfigLoader {
	root: PathBuf,
}

impl ConfigLoader {
	pub fn new(root: impl Into<PathBuf>) -> Self {
		Self { root: root.into() }
	}

	pub fn root(&self) -> &Path {
		&self.root
	}

	/// Read `name` (relative to the root) with includes expanded and comments
	/// stripped.
	pub fn read_file(&self, name: &Path) -> DynMacroResult<Vec<ConfigLine>> {
		let mut stack = Vec::new();
		let mut lines = Vec::new();
		self.read_into(&self.root.join(name), &mut stack, &mut lines)?;

		Ok(lines)
	}

	/// Read and parse every file in order, concatenating their sections.
	pub fn load_sections(&self, files: &[PathBuf]) -> DynMacroResult<Vec<ConfigSection>> {
		let mut sections = Vec::new();
		for file in files {
			let lines = self.read_file(file)?;
			sections.extend(parse_sections(&lines)?);
		}

		Ok(sections)
	}

	fn read_into(
		&self,
		path: &Path,
		stack: &mut Vec<PathBuf>,
		lines: &mut Vec<ConfigLine>,
	) -> DynMacroResult<()> {
		if !path.is_file() {
			return Err(DynMacroError::MissingConfig {
				path: path.display().to_string(),
			});
		}

		let canonical = path.canonicalize()?;
		if stack.contains(&canonical) {
			let chain = stack
				.iter()
				.chain(std::iter::once(&canonical))
				.map(|p| p.display().to_string())
				.collect::<Vec<_>>()
				.join(" -> ");
			return Err(DynMacroError::RecursiveInclude {
				path: path.display().to_string(),
				chain,
			});
		}

		debug!(path = %path.display(), "reading config file");
		let content = std::fs::read_to_string(path)?;
		let dir = canonical
			.parent()
			.map_or_else(|| self.root.clone(), Path::to_path_buf);
		stack.push(canonical);

		for (index, raw) in content.lines().enumerate() {
			let Some(text) = strip_comments(raw) else {
				continue;
			};

			if let Some(pattern) = include_pattern(&text) {
				for included in expand_include(&dir, pattern)? {
					self.read_into(&included, stack, lines)?;
				}
				continue;
			}

			lines.push(ConfigLine {
				file: path.to_path_buf(),
				number: index + 1,
				text,
			});
		}

		stack.pop();
		Ok(())
	}
}

/// Strip comments from a raw line. Returns `None` for lines that are entirely
/// a comment.
pub fn strip_comments(raw: &str) -> Option<String> {
	let line = raw.trim_end_matches('\r');
	if line
		.trim_start()
		.starts_with(|c: char| COMMENT_PREFIXES.contains(&c))
	{
		return None;
	}

	let mut previous_is_space = false;
	for (index, ch) in line.char_indices() {
		if previous_is_space && COMMENT_PREFIXES.contains(&ch) {
			return Some(line[..index].trim_end().to_string());
		}
		previous_is_space = ch.is_whitespace();
	}

	Some(line.trim_end().to_string())
}

fn include_pattern(text: &str) -> Option<&str> {
	let header = text.trim().strip_prefix('[')?.strip_suffix(']')?.trim();
	let pattern = header.strip_prefix("include")?;
	if !pattern.starts_with(char::is_whitespace) {
		return None;
	}

	Some(pattern.trim())
}

fn has_glob_syntax(pattern: &str) -> bool {
	pattern.contains(['*', '?', '[', '{'])
}

/// Resolve an include pattern against `dir`. Literal paths must exist; glob
/// patterns may match nothing.
fn expand_include(dir: &Path, pattern: &str) -> DynMacroResult<Vec<PathBuf>> {
	if !has_glob_syntax(pattern) {
		let path = dir.join(pattern);
		if !path.is_file() {
			return Err(DynMacroError::MissingConfig {
				path: path.display().to_string(),
			});
		}
		return Ok(vec![path]);
	}

	// Split the pattern into a literal base directory and the glob remainder
	// so the walk starts as deep as possible.
	let mut base = dir.to_path_buf();
	let mut remainder = Vec::new();
	for component in Path::new(pattern).components() {
		match component {
			Component::Normal(part) if remainder.is_empty() => {
				let part = part.to_string_lossy();
				if has_glob_syntax(&part) {
					remainder.push(part.into_owned());
				} else {
					base.push(part.as_ref());
				}
			}
			Component::Normal(part) => remainder.push(part.to_string_lossy().into_owned()),
			Component::ParentDir if remainder.is_empty() => base.push(".."),
			Component::RootDir | Component::Prefix(_) if remainder.is_empty() => {
				base.push(component.as_os_str());
			}
			Component::CurDir => {}
			_ => remainder.push(component.as_os_str().to_string_lossy().into_owned()),
		}
	}

	let glob = GlobBuilder::new(&remainder.join("/"))
		.literal_separator(true)
		.build()
		.map_err(|e| {
			DynMacroError::ConfigParse {
				file: dir.display().to_string(),
				line: 0,
				reason: format!("invalid include pattern `{pattern}`: {e}"),
			}
		})?
		.compile_matcher();

	if !base.is_dir() {
		debug!(pattern, "include pattern base directory does not exist");
		return Ok(Vec::new());
	}

	let mut matches = Vec::new();
	for entry in WalkBuilder::new(&base).standard_filters(false).build() {
		let Ok(entry) = entry else {
			continue;
		};
		let path = entry.path();
		if !path.is_file() {
			continue;
		}
		let Ok(relative) = path.strip_prefix(&base) else {
			continue;
		};
		if glob.is_match(relative) {
			matches.push(path.to_path_buf());
		}
	}
	matches.sort();

	if matches.is_empty() {
		debug!(pattern, "include pattern matched no files");
	}

	Ok(matches)
}

/// Parse expanded lines into sections.
///
/// Keys are separated from values by `:` or `=`. Indented lines, and blank
/// lines followed by indented lines, continue the previous value.
pub fn parse_sections(lines: &[ConfigLine]) -> DynMacroResult<Vec<ConfigSection>> {
	let mut sections: Vec<ConfigSection> = Vec::new();
	let mut pending_blank = 0usize;
	let mut has_open_value = false;

	for line in lines {
		let text = line.text.as_str();

		if text.trim().is_empty() {
			if has_open_value {
				pending_blank += 1;
			}
			continue;
		}

		let indented = text.starts_with(char::is_whitespace);
		if indented && has_open_value {
			let Some((_, value)) = sections.last_mut().and_then(|s| s.entries.last_mut()) else {
				return Err(parse_error(line, "continuation line without a key"));
			};
			for _ in 0..pending_blank {
				value.push('\n');
			}
			pending_blank = 0;
			if !value.is_empty() {
				value.push('\n');
			}
			value.push_str(text);
			continue;
		}

		pending_blank = 0;

		if indented {
			return Err(parse_error(line, "unexpected indentation"));
		}

		if let Some(header) = text.strip_prefix('[') {
			let Some(header) = header.trim_end().strip_suffix(']') else {
				return Err(parse_error(line, "unterminated section header"));
			};
			let header = header.trim();
			if header.is_empty() {
				return Err(parse_error(line, "empty section header"));
			}
			let (kind, name) = header
				.split_once(char::is_whitespace)
				.map_or((header, ""), |(kind, name)| (kind, name.trim()));
			sections.push(ConfigSection {
				kind: kind.to_ascii_lowercase(),
				name: name.to_string(),
				entries: Vec::new(),
				file: line.file.clone(),
				line: line.number,
			});
			has_open_value = false;
			continue;
		}

		let Some(section) = sections.last_mut() else {
			return Err(parse_error(line, "option outside of a section"));
		};
		let Some(split) = text.find([':', '=']) else {
			return Err(parse_error(line, "expected `key: value`"));
		};
		let key = text[..split].trim();
		if key.is_empty() {
			return Err(parse_error(line, "empty option name"));
		}
		let value = text[split + 1..].trim();
		section
			.entries
			.push((key.to_ascii_lowercase(), value.to_string()));
		has_open_value = true;
	}

	Ok(sections)
}

fn parse_error(line: &ConfigLine, reason: &str) -> DynMacroError {
	DynMacroError::ConfigParse {
		file: line.file.display().to_string(),
		line: line.number,
		reason: reason.to_string(),
	}
}
