use std::ops::Range;

use float_cmp::approx_eq;
use logos::Logos;
use serde_json::Map;
use serde_json::Number;
use serde_json::Value;
use snailquote::unescape;

use crate::DynMacroError;
use crate::DynMacroResult;

/// Deepest list/map nesting accepted by [`parse_literal`].
pub const MAX_LITERAL_DEPTH: usize = 64;

/// Raw tokens of the restricted literal language.
#[derive(Logos, Debug, Clone, Copy, PartialEq, Eq)]
#[logos(skip r"[ \t\r\n]+")]
enum LiteralToken {
	#[token("[")]
	BracketOpen,
	#[token("]")]
	BracketClose,
	#[token("(")]
	ParenOpen,
	#[token(")")]
	ParenClose,
	#[token("{")]
	BraceOpen,
	#[token("}")]
	BraceClose,
	#[token(",")]
	Comma,
	#[token(":")]
	Colon,
	#[token("-")]
	Minus,
	#[token("+")]
	Plus,
	#[regex(r"[a-zA-Z_][a-zA-Z0-9_]*")]
	Ident,
	#[regex(r#""([^"\\]|\\.)*""#)]
	DoubleQuotedString,
	#[regex(r"'([^'\\]|\\.)*'")]
	SingleQuotedString,
	#[regex(r"([0-9]+(\.[0-9]*)?|\.[0-9]+)([eE][+-]?[0-9]+)?")]
	Number,
}

/// Recursive descent over the logos token stream.
struct LiteralParser<'a> {
	source: &'a str,
	tokens: Vec<(Result<LiteralToken, ()>, Range<usize>)>,
	cursor: usize,
}

impl<'a> LiteralParser<'a> {
	fn new(source: &'a str) -> Self {
		Self {
			source,
			tokens: LiteralToken::lexer(source).spanned().collect(),
			cursor: 0,
		}
	}

	fn slice(&self, span: &Range<usize>) -> &'a str {
		&self.source[span.clone()]
	}

	/// Return the next token, failing on bytes the lexer did not recognize.
	fn next(&mut self) -> Result<Option<(LiteralToken, Range<usize>)>, String> {
		let Some((result, span)) = self.tokens.get(self.cursor).cloned() else {
			return Ok(None);
		};
		self.cursor += 1;

		match result {
			Ok(token) => Ok(Some((token, span))),
			Err(()) => {
				Err(format!(
					"unexpected `{}` at offset {}",
					self.slice(&span),
					span.start
				))
			}
		}
	}

	fn peek(&self) -> Option<LiteralToken> {
		self.tokens
			.get(self.cursor)
			.and_then(|(result, _)| result.ok())
	}

	fn expect_value(&mut self, depth: usize) -> Result<Value, String> {
		if depth > MAX_LITERAL_DEPTH {
			return Err(format!("nesting deeper than {MAX_LITERAL_DEPTH} levels"));
		}

		let Some((token, span)) = self.next()? else {
			return Err("unexpected end of input".to_string());
		};

		match token {
			LiteralToken::Number => self.number(self.slice(&span), false),
			LiteralToken::Minus | LiteralToken::Plus => {
				let negative = token == LiteralToken::Minus;
				match self.next()? {
					Some((LiteralToken::Number, span)) => self.number(self.slice(&span), negative),
					_ => Err("a sign must be followed by a number".to_string()),
				}
			}
			LiteralToken::DoubleQuotedString => string(self.slice(&span), '"'),
			LiteralToken::SingleQuotedString => string(self.slice(&span), '\''),
			LiteralToken::Ident => {
				match self.slice(&span) {
					"true" | "True" => Ok(Value::Bool(true)),
					"false" | "False" => Ok(Value::Bool(false)),
					"null" | "None" => Ok(Value::Null),
					other => Err(format!("identifiers are not literals: `{other}`")),
				}
			}
			LiteralToken::BracketOpen => {
				self.sequence(LiteralToken::BracketClose, depth)
					.map(|(items, _)| Value::Array(items))
			}
			LiteralToken::ParenOpen => {
				let (mut items, trailing_comma) = self.sequence(LiteralToken::ParenClose, depth)?;
				// `(x)` is a parenthesised value, `(x,)` a one element tuple.
				if items.len() == 1 && !trailing_comma {
					Ok(items.remove(0))
				} else {
					Ok(Value::Array(items))
				}
			}
			LiteralToken::BraceOpen => self.map(depth),
			LiteralToken::BracketClose
			| LiteralToken::ParenClose
			| LiteralToken::BraceClose
			| LiteralToken::Comma
			| LiteralToken::Colon => Err(format!("unexpected `{}`", self.slice(&span))),
		}
	}

	/// Parse comma separated values up to `close`. Returns the items and
	/// whether the last item was followed by a comma.
	fn sequence(&mut self, close: LiteralToken, depth: usize) -> Result<(Vec<Value>, bool), String> {
		let mut items = Vec::new();
		let mut trailing_comma = false;

		loop {
			if self.peek() == Some(close) {
				self.cursor += 1;
				return Ok((items, trailing_comma));
			}

			items.push(self.expect_value(depth + 1)?);

			match self.next()? {
				Some((LiteralToken::Comma, _)) => trailing_comma = true,
				Some((token, _)) if token == close => return Ok((items, false)),
				Some((_, span)) => {
					return Err(format!("expected `,` but found `{}`", self.slice(&span)));
				}
				None => return Err("unterminated sequence".to_string()),
			}
		}
	}

	fn map(&mut self, depth: usize) -> Result<Value, String> {
		let mut entries = Map::new();

		loop {
			if self.peek() == Some(LiteralToken::BraceClose) {
				self.cursor += 1;
				return Ok(Value::Object(entries));
			}

			let key = match self.expect_value(depth + 1)? {
				Value::String(key) => key,
				other => return Err(format!("map keys must be strings, found `{other}`")),
			};

			match self.next()? {
				Some((LiteralToken::Colon, _)) => {}
				_ => return Err(format!("expected `:` after map key `{key}`")),
			}

			let value = self.expect_value(depth + 1)?;
			entries.insert(key, value);

			match self.next()? {
				Some((LiteralToken::Comma, _)) => {}
				Some((LiteralToken::BraceClose, _)) => return Ok(Value::Object(entries)),
				Some((_, span)) => {
					return Err(format!("expected `,` but found `{}`", self.slice(&span)));
				}
				None => return Err("unterminated map".to_string()),
			}
		}
	}

	#[allow(clippy::unused_self)]
	fn number(&self, slice: &str, negative: bool) -> Result<Value, String> {
		let is_float = slice.contains(['.', 'e', 'E']);

		if !is_float {
			let signed = if negative {
				format!("-{slice}")
			} else {
				slice.to_string()
			};
			if let Ok(value) = signed.parse::<i64>() {
				return Ok(Value::Number(value.into()));
			}
			if let Ok(value) = signed.parse::<u64>() {
				return Ok(Value::Number(value.into()));
			}
		}

		let value: f64 = slice
			.parse()
			.map_err(|e| format!("invalid number `{slice}`: {e}"))?;
		let value = if negative { -value } else { value };
		Number::from_f64(value)
			.map(Value::Number)
			.ok_or_else(|| format!("number `{slice}` is not finite"))
	}
}

/// Unescape a quoted string slice. Single quoted strings are rewritten into
/// double quoted form so both accept the same escapes.
fn string(slice: &str, delimiter: char) -> Result<Value, String> {
	let inner = &slice[1..slice.len() - 1];
	if !inner.contains('\\') && !(delimiter == '\'' && inner.contains('"')) {
		return Ok(Value::String(inner.to_string()));
	}

	let quoted = if delimiter == '"' {
		slice.to_string()
	} else {
		format!(
			"\"{}\"",
			inner.replace("\\'", "'").replace('"', "\\\"")
		)
	};

	unescape(&quoted)
		.map(Value::String)
		.map_err(|e| format!("invalid string escape: {e}"))
}

/// Parse `input` as a restricted literal: numbers, quoted strings, booleans,
/// null, and nested lists, tuples or string-keyed maps of those.
///
/// Both `true`/`false`/`null` and `True`/`False`/`None` spellings are
/// accepted. Anything executable (identifiers, calls, operators) is
/// rejected.
///
/// ```rust
/// use dynmacro_core::parse_literal;
/// use serde_json::json;
///
/// assert_eq!(parse_literal("[1, 2, 3]").unwrap(), json!([1, 2, 3]));
/// assert!(parse_literal("open('/etc/passwd')").is_err());
/// ```
pub fn parse_literal(input: &str) -> DynMacroResult<Value> {
	let error = |reason: String| {
		DynMacroError::LiteralParse {
			input: input.to_string(),
			reason,
		}
	};

	let mut parser = LiteralParser::new(input);
	let value = parser.expect_value(0).map_err(error)?;
	if let Some((_, span)) = parser.next().map_err(error)? {
		return Err(error(format!(
			"unexpected trailing input `{}`",
			&input[span.start..]
		)));
	}

	ensure_round_trip(&value).map_err(error)?;
	Ok(value)
}

/// Parse a seed variable from configuration, falling back to the raw string
/// when it is not a valid literal.
pub fn parse_seed(raw: &str) -> Value {
	parse_literal(raw.trim()).unwrap_or_else(|_| Value::String(raw.to_string()))
}

/// Check that `value` serializes to compact JSON and reads back equal.
pub fn ensure_round_trip(value: &Value) -> Result<(), String> {
	let encoded = serde_json::to_string(value).map_err(|e| e.to_string())?;
	let decoded: Value = serde_json::from_str(&encoded).map_err(|e| e.to_string())?;

	if literal_eq(value, &decoded) {
		Ok(())
	} else {
		Err(format!("value does not survive serialization: {encoded}"))
	}
}

/// Convert any serializable value into a restricted literal, rejecting
/// values without a compact structured form.
pub fn to_literal<T: serde::Serialize>(value: &T) -> Result<Value, String> {
	let value = serde_json::to_value(value).map_err(|e| e.to_string())?;
	ensure_round_trip(&value)?;
	Ok(value)
}

/// Structural equality with approximate comparison for floats.
pub fn literal_eq(left: &Value, right: &Value) -> bool {
	match (left, right) {
		(Value::Number(a), Value::Number(b)) => {
			match (a.as_i64(), b.as_i64(), a.as_u64(), b.as_u64()) {
				(Some(a), Some(b), ..) => a == b,
				(_, _, Some(a), Some(b)) => a == b,
				_ => {
					match (a.as_f64(), b.as_f64()) {
						(Some(a), Some(b)) => approx_eq!(f64, a, b, ulps = 2),
						_ => false,
					}
				}
			}
		}
		(Value::Array(a), Value::Array(b)) => {
			a.len() == b.len() && a.iter().zip(b).all(|(a, b)| literal_eq(a, b))
		}
		(Value::Object(a), Value::Object(b)) => {
			a.len() == b.len()
				&& a
					.iter()
					.all(|(key, value)| b.get(key).is_some_and(|other| literal_eq(value, other)))
		}
		_ => left == right,
	}
}
