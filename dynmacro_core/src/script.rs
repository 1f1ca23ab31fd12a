use std::collections::BTreeMap;
use std::fmt::Debug;
use std::path::Component;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;

use minijinja::Environment;
use minijinja::UndefinedBehavior;
use minijinja::Value;
use tracing::warn;

use crate::DynMacroError;
use crate::DynMacroResult;
use crate::literal::to_literal;
use crate::stage::RenderContext;
use crate::stage::Response;
use crate::stage::lock;
use crate::variables::normalize_key;

/// Message emitted when a template calls `script()` inside a cluster with
/// scripting disabled.
pub const SCRIPTING_DISABLED_WARNING: &str = "scripting is disabled for this cluster; script ignored";

/// A script that failed. `partial` carries the context as it was at the
/// failure point so earlier mutations can still be committed.
#[derive(Debug, Clone, PartialEq)]
pub struct ScriptFailure {
	pub message: String,
	pub partial: Option<RenderContext>,
}

impl ScriptFailure {
	pub fn new(message: impl Into<String>) -> Self {
		Self {
			message: message.into(),
			partial: None,
		}
	}

	#[must_use]
	pub fn with_partial(mut self, context: RenderContext) -> Self {
		self.partial = Some(context);
		self
	}
}

impl From<DynMacroError> for ScriptFailure {
	fn from(error: DynMacroError) -> Self {
		match error {
			DynMacroError::Script(message) => Self::new(message),
			other => Self::new(other.to_string()),
		}
	}
}

impl From<ScriptFailure> for DynMacroError {
	fn from(failure: ScriptFailure) -> Self {
		DynMacroError::Script(failure.message)
	}
}

pub type ScriptOutcome = Result<RenderContext, ScriptFailure>;

/// Embedded scripting capability available to templates through `script()`
/// and `script_file()`.
///
/// A runner receives a snapshot of the render context and returns the
/// context it wants committed: changed variables are written back to the
/// macro's store, responses are forwarded to the host and `result` becomes
/// the template-visible return value.
pub trait ScriptRunner: Debug + Send + Sync {
	fn run(&self, code: &str, context: RenderContext) -> ScriptOutcome;

	/// Run a script file. `path` has already been resolved against the
	/// script root.
	fn run_file(&self, path: &Path, context: RenderContext) -> ScriptOutcome {
		let code = std::fs::read_to_string(path)
			.map_err(|e| ScriptFailure::new(format!("cannot read `{}`: {e}", path.display())))?;
		self.run(&code, context)
	}

	/// Disabled runners receive the raw `script_file()` argument in `run`
	/// without any path resolution.
	fn is_enabled(&self) -> bool {
		true
	}
}

/// The default runner. Each non-blank line is either an assignment
/// `name = expression`, which stores a macro variable, or a bare expression
/// whose value becomes the script result. Expressions use the template
/// expression language and see the same names as a stage.
///
/// ```text
/// count = count + 1
/// respond("count is " ~ count)
/// count * 2
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct ExpressionScripts;

impl ExpressionScripts {
	fn environment<'source>(responses: &Arc<Mutex<Vec<Response>>>) -> Environment<'source> {
		let mut env = Environment::new();
		env.set_undefined_behavior(UndefinedBehavior::Chainable);

		let sink = responses.clone();
		env.add_function("respond", move |message: String| {
			lock(&sink).push(Response::Info(message));
			Value::UNDEFINED
		});

		env
	}

	fn scope(context: &RenderContext) -> Value {
		let mut scope: BTreeMap<String, serde_json::Value> = context.variables.clone();
		scope.insert(
			"params".to_string(),
			serde_json::to_value(&context.params).unwrap_or_default(),
		);
		scope.insert(
			"rawparams".to_string(),
			serde_json::Value::String(context.rawparams.clone()),
		);
		if let Some(printer) = &context.printer {
			scope.insert("printer".to_string(), printer.clone());
		}

		Value::from_serialize(&scope)
	}
}

impl ScriptRunner for ExpressionScripts {
	fn run(&self, code: &str, mut context: RenderContext) -> ScriptOutcome {
		let responses = Arc::new(Mutex::new(Vec::new()));
		let env = Self::environment(&responses);

		for (index, line) in code.lines().enumerate() {
			let line = line.trim();
			if line.is_empty() || line.starts_with('#') {
				continue;
			}

			let (target, expression) = split_assignment(line);
			let evaluated = env
				.compile_expression(expression)
				.and_then(|expr| expr.eval(Self::scope(&context)))
				.map_err(|e| format!("line {}: {e}", index + 1))
				.and_then(|value| to_literal(&value).map_err(|e| format!("line {}: {e}", index + 1)));

			context.responses.append(&mut lock(&responses));

			let value = match evaluated {
				Ok(value) => value,
				Err(message) => return Err(ScriptFailure::new(message).with_partial(context)),
			};

			match target {
				Some(name) => {
					context.variables.insert(normalize_key(name), value);
				}
				None => context.result = Some(value),
			}
		}

		Ok(context)
	}
}

/// Split `name = expression` into its parts. Comparisons such as `a == b`
/// are bare expressions.
fn split_assignment(line: &str) -> (Option<&str>, &str) {
	let Some(index) = line.find('=') else {
		return (None, line);
	};
	let (name, rest) = (line[..index].trim(), &line[index + 1..]);

	let is_identifier = name
		.chars()
		.next()
		.is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
		&& name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');

	if is_identifier && !rest.starts_with('=') {
		(Some(name), rest.trim())
	} else {
		(None, line)
	}
}

/// Runner installed in clusters with scripting disabled. It warns and does
/// nothing; it never fails.
#[derive(Debug, Clone, Copy, Default)]
pub struct DisabledScripts;

impl ScriptRunner for DisabledScripts {
	fn run(&self, _code: &str, mut context: RenderContext) -> ScriptOutcome {
		warn!("{SCRIPTING_DISABLED_WARNING}");
		context
			.responses
			.push(Response::Warning(SCRIPTING_DISABLED_WARNING.to_string()));
		Ok(context)
	}

	fn run_file(&self, path: &Path, context: RenderContext) -> ScriptOutcome {
		self.run(&path.display().to_string(), context)
	}

	fn is_enabled(&self) -> bool {
		false
	}
}

/// Resolve a `script_file()` argument against `root`. Absolute paths and
/// paths that climb out of `root` are rejected.
pub fn resolve_script_path(root: &Path, path: &str) -> DynMacroResult<PathBuf> {
	let escape = || DynMacroError::Script(format!("script path `{path}` escapes the configuration root"));
	let relative = Path::new(path);

	let mut depth = 0usize;
	for component in relative.components() {
		match component {
			Component::Normal(_) => depth += 1,
			Component::CurDir => {}
			Component::ParentDir => depth = depth.checked_sub(1).ok_or_else(escape)?,
			Component::RootDir | Component::Prefix(_) => return Err(escape()),
		}
	}

	let resolved = root.join(relative);

	// Symlinks may still point outside the root.
	if let (Ok(canonical_root), Ok(canonical)) = (root.canonicalize(), resolved.canonicalize()) {
		if !canonical.starts_with(&canonical_root) {
			return Err(escape());
		}
	}

	Ok(resolved)
}
