use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;

use minijinja::Environment;
use minijinja::ErrorKind;
use minijinja::UndefinedBehavior;
use minijinja::Value;
use minijinja::value::Enumerator;
use minijinja::value::Object;
use serde::Serialize;
use tracing::warn;

use crate::DynMacroError;
use crate::DynMacroResult;
use crate::literal::to_literal;
use crate::script::ScriptFailure;
use crate::script::ScriptOutcome;
use crate::script::ScriptRunner;
use crate::script::resolve_script_path;
use crate::variables::VariableStore;
use crate::variables::normalize_key;

const STAGE_TEMPLATE: &str = "stage";

/// A message produced while rendering, forwarded to the host afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "message", rename_all = "snake_case")]
#[non_exhaustive]
pub enum Response {
	Info(String),
	Warning(String),
	Error(String),
}

/// The data half of a render context. This is what scripts receive and
/// return: a script may change `variables`, append `responses` and set a
/// `result` for the calling template.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RenderContext {
	/// Invocation parameters with uppercase keys.
	pub params: BTreeMap<String, String>,
	/// Everything after the command name, verbatim.
	pub rawparams: String,
	/// Snapshot of the macro's variables.
	pub variables: BTreeMap<String, serde_json::Value>,
	/// Host state, or `None` when host access is disabled.
	pub printer: Option<serde_json::Value>,
	pub responses: Vec<Response>,
	pub result: Option<serde_json::Value>,
}

/// How templates see the host.
#[derive(Debug, Clone, PartialEq)]
pub enum HostAccess {
	Status(serde_json::Value),
	Inert,
}

/// Per-dispatch collaborators of the stage pipeline. Cluster capabilities
/// filter these before every dispatch.
#[derive(Debug, Clone)]
pub struct StageBindings {
	pub scripts: Arc<dyn ScriptRunner>,
	pub host: HostAccess,
	/// Directory that `script_file()` paths are resolved against.
	pub script_root: PathBuf,
}

/// One compiled template unit of a macro.
#[derive(Debug)]
pub struct Stage {
	source: String,
	env: Environment<'static>,
}

impl Stage {
	/// Compile `source`. Syntax errors are reported against `macro_name` and
	/// the 1-indexed stage number.
	pub fn compile(macro_name: &str, index: usize, source: &str) -> DynMacroResult<Self> {
		let mut env = Environment::new();
		env.set_undefined_behavior(UndefinedBehavior::Chainable);
		env.set_keep_trailing_newline(true);
		env.add_template_owned(STAGE_TEMPLATE, source.to_string())
			.map_err(|e| {
				DynMacroError::Compile {
					name: macro_name.to_string(),
					reason: format!("stage {index}: {e}"),
				}
			})?;

		Ok(Self {
			source: source.to_string(),
			env,
		})
	}

	pub fn source(&self) -> &str {
		&self.source
	}

	/// Render the stage against a scope built by [`StageScope::into_value`].
	pub fn render(&self, scope: Value) -> Result<String, minijinja::Error> {
		self.env.get_template(STAGE_TEMPLATE)?.render(scope)
	}
}

/// Top-level names visible to a stage.
#[derive(Debug)]
struct ScopeObject {
	entries: BTreeMap<String, Value>,
}

impl Object for ScopeObject {
	fn get_value(self: &Arc<Self>, key: &Value) -> Option<Value> {
		self.entries.get(key.as_str()?).cloned()
	}

	fn enumerate(self: &Arc<Self>) -> Enumerator {
		Enumerator::Values(self.entries.keys().map(|k| Value::from(k.as_str())).collect())
	}
}

/// Stand-in for the host state when host access is disabled. Every attribute
/// is undefined.
#[derive(Debug)]
pub struct InertHost;

impl Object for InertHost {
	fn get_value(self: &Arc<Self>, _key: &Value) -> Option<Value> {
		None
	}
}

/// Everything one stage render needs: the live variable store it may mutate,
/// the invocation parameters and the filtered collaborators.
#[derive(Debug, Clone)]
pub struct StageScope {
	pub variables: Arc<Mutex<VariableStore>>,
	pub params: BTreeMap<String, String>,
	pub rawparams: String,
	pub bindings: StageBindings,
	pub responses: Arc<Mutex<Vec<Response>>>,
}

impl StageScope {
	/// Snapshot the current state into a data-only [`RenderContext`].
	pub fn context(&self) -> RenderContext {
		RenderContext {
			params: self.params.clone(),
			rawparams: self.rawparams.clone(),
			variables: lock(&self.variables).clone().into_inner(),
			printer: match &self.bindings.host {
				HostAccess::Status(status) => Some(status.clone()),
				HostAccess::Inert => None,
			},
			responses: Vec::new(),
			result: None,
		}
	}

	/// Build the template scope from the current variable state. Called
	/// immediately before each stage so earlier mutations are visible.
	pub fn into_value(&self) -> Value {
		let mut entries = BTreeMap::new();

		for (key, value) in lock(&self.variables).iter() {
			entries.insert(key.clone(), Value::from_serialize(value));
		}

		entries.insert("params".to_string(), Value::from_serialize(&self.params));
		entries.insert("rawparams".to_string(), Value::from(self.rawparams.as_str()));
		entries.insert(
			"printer".to_string(),
			match &self.bindings.host {
				HostAccess::Status(status) => Value::from_serialize(status),
				HostAccess::Inert => Value::from_object(InertHost),
			},
		);

		let variables = self.variables.clone();
		entries.insert(
			"update".to_string(),
			Value::from_function(move |name: String, value: Value| -> Result<Value, minijinja::Error> {
				let value = to_literal(&value).map_err(|reason| {
					minijinja::Error::new(
						ErrorKind::InvalidOperation,
						format!("cannot store `{name}`: {reason}"),
					)
				})?;
				lock(&variables).insert(normalize_key(&name), value);
				Ok(Value::UNDEFINED)
			}),
		);

		let responses = self.responses.clone();
		entries.insert(
			"respond".to_string(),
			Value::from_function(move |message: String| {
				lock(&responses).push(Response::Info(message));
				Value::UNDEFINED
			}),
		);

		let scope = self.clone();
		entries.insert(
			"script".to_string(),
			Value::from_function(move |code: String| -> Result<Value, minijinja::Error> {
				let context = scope.bindings.scripts.run(&code, scope.context());
				scope.commit(context)
			}),
		);

		let scope = self.clone();
		entries.insert(
			"script_file".to_string(),
			Value::from_function(move |path: String| -> Result<Value, minijinja::Error> {
				let context = if scope.bindings.scripts.is_enabled() {
					resolve_script_path(&scope.bindings.script_root, &path)
						.map_err(ScriptFailure::from)
						.and_then(|path| scope.bindings.scripts.run_file(&path, scope.context()))
				} else {
					scope.bindings.scripts.run(&path, scope.context())
				};
				scope.commit(context)
			}),
		);

		Value::from_object(ScopeObject { entries })
	}

	/// Write a script's variables and responses back. A failed script still
	/// commits whatever it changed before the failure point.
	fn commit(&self, outcome: ScriptOutcome) -> Result<Value, minijinja::Error> {
		let (context, failure) = match outcome {
			Ok(context) => (Some(context), None),
			Err(failure) => (failure.partial.clone(), Some(failure)),
		};

		let mut result = None;
		if let Some(context) = context {
			let mut store = lock(&self.variables);
			for (key, value) in context.variables {
				if let Err(e) = store.set_value(&key, value) {
					warn!(key = %key, error = %e, "script produced an unstorable variable");
					return Err(minijinja::Error::new(
						ErrorKind::InvalidOperation,
						e.to_string(),
					));
				}
			}
			drop(store);
			lock(&self.responses).extend(context.responses);
			result = context.result;
		}

		if let Some(failure) = failure {
			return Err(minijinja::Error::new(
				ErrorKind::InvalidOperation,
				format!("script failed: {}", failure.message),
			));
		}

		Ok(result.map_or(Value::UNDEFINED, |result| Value::from_serialize(&result)))
	}

	/// Drain responses gathered since the last call.
	pub fn take_responses(&self) -> Vec<Response> {
		std::mem::take(&mut *lock(&self.responses))
	}
}

/// Lock a mutex, recovering the data if a previous holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
	mutex
		.lock()
		.unwrap_or_else(std::sync::PoisonError::into_inner)
}
