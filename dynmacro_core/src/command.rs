use std::collections::BTreeMap;

use snailquote::unescape;

use crate::DynMacroError;
use crate::DynMacroResult;

/// One `KEY=VALUE` argument as written on the command line.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Argument {
	key: Option<String>,
	raw: String,
}

/// A parsed command line.
///
/// ```rust
/// use dynmacro_core::Invocation;
///
/// let invocation = Invocation::parse(r#"greet NAME="Ada Lovelace" count=2"#).unwrap();
/// assert_eq!(invocation.name, "GREET");
/// assert_eq!(invocation.get("NAME"), Some("Ada Lovelace"));
/// assert_eq!(invocation.rawparams, r#"NAME="Ada Lovelace" count=2"#);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Invocation {
	/// Uppercase command name.
	pub name: String,
	/// Parameters with uppercase keys and unquoted values.
	pub params: BTreeMap<String, String>,
	/// Everything after the command name, verbatim.
	pub rawparams: String,
	arguments: Vec<Argument>,
}

impl Invocation {
	/// An invocation with no parameters, as used by timer callbacks.
	pub fn bare(name: impl Into<String>) -> Self {
		Self {
			name: name.into().to_ascii_uppercase(),
			..Self::default()
		}
	}

	pub fn parse(line: &str) -> DynMacroResult<Self> {
		let line = line.trim();
		let (name, rest) = line
			.split_once(char::is_whitespace)
			.map_or((line, ""), |(name, rest)| (name, rest.trim_start()));

		let mut params = BTreeMap::new();
		let mut arguments = Vec::new();

		for raw in split_arguments(rest)? {
			let key = match raw.split_once('=') {
				Some((key, value)) if !key.is_empty() && !key.contains(['"', '\'']) => {
					let key = key.to_ascii_uppercase();
					params.insert(key.clone(), unquote(&key, value)?);
					Some(key)
				}
				_ => None,
			};
			arguments.push(Argument { key, raw });
		}

		Ok(Self {
			name: name.to_ascii_uppercase(),
			params,
			rawparams: rest.to_string(),
			arguments,
		})
	}

	pub fn get(&self, key: &str) -> Option<&str> {
		self.params.get(key).map(String::as_str)
	}

	/// Look up a parameter that must be present and non-empty.
	pub fn require(&self, key: &str) -> DynMacroResult<&str> {
		self.get(key)
			.filter(|value| !value.trim().is_empty())
			.ok_or_else(|| DynMacroError::MissingParameter(key.to_string()))
	}

	pub fn float(&self, key: &str) -> DynMacroResult<Option<f64>> {
		self.get(key)
			.map(|raw| {
				raw.trim()
					.parse::<f64>()
					.ok()
					.filter(|value| value.is_finite())
					.ok_or_else(|| {
						DynMacroError::InvalidParameter {
							name: key.to_string(),
							reason: format!("`{raw}` is not a number"),
						}
					})
			})
			.transpose()
	}

	/// A copy of this invocation under a new name with the given parameters
	/// removed from both `params` and `rawparams`.
	#[must_use]
	pub fn forward(&self, name: &str, consumed: &[&str]) -> Self {
		let arguments: Vec<Argument> = self
			.arguments
			.iter()
			.filter(|argument| {
				!argument
					.key
					.as_deref()
					.is_some_and(|key| consumed.contains(&key))
			})
			.cloned()
			.collect();

		let mut params = self.params.clone();
		params.retain(|key, _| !consumed.contains(&key.as_str()));

		Self {
			name: name.to_ascii_uppercase(),
			params,
			rawparams: arguments
				.iter()
				.map(|argument| argument.raw.as_str())
				.collect::<Vec<_>>()
				.join(" "),
			arguments,
		}
	}
}

/// Split on whitespace outside of quotes. Backslashes escape the next
/// character inside double quotes.
fn split_arguments(text: &str) -> DynMacroResult<Vec<String>> {
	let mut arguments = Vec::new();
	let mut current = String::new();
	let mut quote: Option<char> = None;
	let mut chars = text.chars();

	while let Some(ch) = chars.next() {
		match (quote, ch) {
			(None, ch) if ch.is_whitespace() => {
				if !current.is_empty() {
					arguments.push(std::mem::take(&mut current));
				}
			}
			(None, '"' | '\'') => {
				quote = Some(ch);
				current.push(ch);
			}
			(Some('"'), '\\') => {
				current.push(ch);
				if let Some(escaped) = chars.next() {
					current.push(escaped);
				}
			}
			(Some(open), ch) if ch == open => {
				quote = None;
				current.push(ch);
			}
			_ => current.push(ch),
		}
	}

	if quote.is_some() {
		return Err(DynMacroError::InvalidParameter {
			name: current.split('=').next().unwrap_or_default().to_ascii_uppercase(),
			reason: "unterminated quote".to_string(),
		});
	}

	if !current.is_empty() {
		arguments.push(current);
	}

	Ok(arguments)
}

fn unquote(key: &str, value: &str) -> DynMacroResult<String> {
	if !value.contains(['"', '\'']) {
		return Ok(value.to_string());
	}

	unescape(value)
		.map_err(|e| {
			DynMacroError::InvalidParameter {
				name: key.to_string(),
				reason: e.to_string(),
			}
		})
}
