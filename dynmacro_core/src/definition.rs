use std::collections::BTreeMap;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;

use serde::Serialize;
use tracing::debug;

use crate::DynMacroError;
use crate::DynMacroResult;
use crate::Invocation;
use crate::MacroSource;
use crate::Reactor;
use crate::compiler::DEFAULT_DESCRIPTION;
use crate::scheduler::DelayedSchedule;
use crate::scheduler::ScheduleUpdate;
use crate::scheduler::TimerHandle;
use crate::scheduler::WakeTime;
use crate::stage::HostAccess;
use crate::stage::Response;
use crate::stage::Stage;
use crate::stage::StageBindings;
use crate::stage::StageScope;
use crate::stage::lock;
use crate::variables::VariableStore;

/// Receives the output of a running macro.
pub trait StageSink {
	/// Fresh host state, read before each stage when host access is enabled.
	fn host_status(&mut self) -> serde_json::Value;

	fn respond(&mut self, response: Response);

	/// Execute the rendered text of one stage. Execution stops at the first
	/// failing line.
	fn execute(&mut self, macro_name: &str, script: &str) -> DynMacroResult<()>;
}

/// Outcome of one dispatch.
#[derive(Debug, Default)]
pub struct DispatchReport {
	pub name: String,
	pub stages_run: usize,
	/// Stage failures, in order. A failed stage does not stop later ones.
	pub errors: Vec<DynMacroError>,
	/// The name was unknown and the placeholder answered.
	pub placeholder: bool,
}

impl DispatchReport {
	pub fn is_ok(&self) -> bool {
		self.errors.is_empty() && !self.placeholder
	}
}

/// Rendered stages of a `RENDER_MACRO` request. Nothing is executed.
#[derive(Debug, Default)]
pub struct RenderPreview {
	pub stages: Vec<String>,
	pub responses: Vec<Response>,
	pub errors: Vec<DynMacroError>,
}

/// Introspection view of a macro.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MacroDescription {
	pub name: String,
	pub cluster: Option<String>,
	pub description: String,
	/// The normalized template text, stages still joined by their
	/// delimiter. `RENDER_MACRO` shows the rendered stages.
	pub template: String,
	pub stages: usize,
	pub variables: BTreeMap<String, serde_json::Value>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub rename_existing: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub schedule: Option<DelayedSchedule>,
}

/// A compiled macro.
///
/// Definitions are shared as `Arc<MacroDefinition>`: a dispatch in flight
/// keeps its own generation alive even when a nested `RELOAD_MACROS`
/// replaces the registry contents.
#[derive(Debug)]
pub struct MacroDefinition {
	name: String,
	cluster: Option<String>,
	description: String,
	source: String,
	stages: Vec<Stage>,
	rename_existing: Option<String>,
	is_delayed: bool,
	file: PathBuf,
	variables: Arc<Mutex<VariableStore>>,
	schedule: Mutex<Option<DelayedSchedule>>,
	placeholder: bool,
}

impl MacroDefinition {
	pub fn new(source: MacroSource, stages: Vec<Stage>, cluster: Option<String>) -> Self {
		let schedule = (source.is_delayed || source.initial_duration.is_some()).then(|| {
			DelayedSchedule::new(source.initial_duration.unwrap_or(0.0), source.repeat)
		});

		Self {
			name: source.name,
			cluster,
			description: source.description,
			source: source.body,
			stages,
			rename_existing: source.rename_existing,
			is_delayed: source.is_delayed,
			file: source.file,
			variables: Arc::new(Mutex::new(VariableStore::new(source.variables))),
			schedule: Mutex::new(schedule),
			placeholder: false,
		}
	}

	/// The stand-in returned for names nobody registered. Dispatching it
	/// only warns.
	pub fn placeholder(name: &str, cluster: Option<String>) -> Self {
		Self {
			name: name.to_ascii_uppercase(),
			cluster,
			description: DEFAULT_DESCRIPTION.to_string(),
			source: String::new(),
			stages: Vec::new(),
			rename_existing: None,
			is_delayed: false,
			file: PathBuf::new(),
			variables: Arc::new(Mutex::new(VariableStore::default())),
			schedule: Mutex::new(None),
			placeholder: true,
		}
	}

	pub fn name(&self) -> &str {
		&self.name
	}

	pub fn cluster(&self) -> Option<&str> {
		self.cluster.as_deref()
	}

	/// Name as shown in status output: `NAME` or `CLUSTER:NAME`.
	pub fn qualified_name(&self) -> String {
		match &self.cluster {
			Some(cluster) => format!("{cluster}:{}", self.name),
			None => self.name.clone(),
		}
	}

	pub fn description(&self) -> &str {
		&self.description
	}

	pub fn stages(&self) -> &[Stage] {
		&self.stages
	}

	pub fn rename_existing(&self) -> Option<&str> {
		self.rename_existing.as_deref()
	}

	pub fn is_delayed(&self) -> bool {
		self.is_delayed
	}

	pub fn is_placeholder(&self) -> bool {
		self.placeholder
	}

	pub fn file(&self) -> &Path {
		&self.file
	}

	/// Global invocable macros own a host command. Cluster macros and
	/// `[delayed_gcode]` macros are only reachable through the engine.
	pub fn claims_command(&self) -> bool {
		self.cluster.is_none() && !self.is_delayed && !self.placeholder
	}

	pub fn variables(&self) -> VariableStore {
		lock(&self.variables).clone()
	}

	/// Parse `raw` as a restricted literal and store it. Nothing changes
	/// when parsing fails.
	pub fn set_variable(&self, key: &str, raw: &str) -> DynMacroResult<()> {
		lock(&self.variables).set_literal(key, raw)
	}

	/// Copy the values of shared variables from a previous generation.
	pub fn carry_variables_from(&self, previous: &MacroDefinition) {
		let previous = previous.variables();
		lock(&self.variables).carry_from(&previous);
	}

	pub fn schedule(&self) -> Option<DelayedSchedule> {
		lock(&self.schedule).clone()
	}

	pub fn timer_handle(&self) -> Option<TimerHandle> {
		lock(&self.schedule).as_ref().and_then(|schedule| schedule.handle)
	}

	/// Register the timer for `now + duration`. Does nothing for macros
	/// without a schedule.
	pub fn arm(&self, reactor: &mut dyn Reactor) -> Option<WakeTime> {
		lock(&self.schedule)
			.as_mut()
			.map(|schedule| schedule.arm(reactor))
	}

	pub fn disarm(&self, reactor: &mut dyn Reactor) {
		if let Some(schedule) = lock(&self.schedule).as_mut() {
			schedule.disarm(reactor);
		}
	}

	/// Take over the live timer of a previous generation of this macro. The
	/// wake time already programmed stays in force. A macro that lost its
	/// schedule leaves the timer with `previous`.
	pub fn take_timer_from(&self, previous: &MacroDefinition) {
		let mut guard = lock(&self.schedule);
		let Some(schedule) = guard.as_mut() else {
			return;
		};

		if let Some(handle) = lock(&previous.schedule)
			.as_mut()
			.and_then(DelayedSchedule::release)
		{
			schedule.adopt(handle);
		}
	}

	pub fn begin_fire(&self) {
		if let Some(schedule) = lock(&self.schedule).as_mut() {
			schedule.begin_fire();
		}
	}

	pub fn finish_fire(&self, eventtime: f64) -> WakeTime {
		lock(&self.schedule)
			.as_mut()
			.map_or(WakeTime::Never, |schedule| schedule.finish_fire(eventtime))
	}

	pub fn update_delayed(
		&self,
		duration: f64,
		repeat: Option<bool>,
		reactor: &mut dyn Reactor,
	) -> DynMacroResult<ScheduleUpdate> {
		lock(&self.schedule)
			.as_mut()
			.map(|schedule| schedule.update(duration, repeat, reactor))
			.ok_or_else(|| DynMacroError::NotDelayed(self.qualified_name()))
	}

	pub fn describe(&self) -> MacroDescription {
		MacroDescription {
			name: self.name.clone(),
			cluster: self.cluster.clone(),
			description: self.description.clone(),
			template: self.source.clone(),
			stages: self.stages.len(),
			variables: self.variables().into_inner(),
			rename_existing: self.rename_existing.clone(),
			schedule: self.schedule(),
		}
	}

	fn scope(&self, invocation: &Invocation, bindings: StageBindings) -> StageScope {
		StageScope {
			variables: self.variables.clone(),
			params: invocation.params.clone(),
			rawparams: invocation.rawparams.clone(),
			bindings,
			responses: Arc::new(Mutex::new(Vec::new())),
		}
	}

	/// Run every stage in order.
	///
	/// The render scope is rebuilt from the live variable store right before
	/// each stage, so values written by earlier stages, whether through
	/// `update()`, a script or an executed `SET_VARIABLE`, are visible to
	/// later ones. A stage that fails to render or execute is reported and
	/// the remaining stages still run.
	pub fn dispatch(
		&self,
		invocation: &Invocation,
		bindings: &StageBindings,
		sink: &mut dyn StageSink,
	) -> DispatchReport {
		let mut report = DispatchReport {
			name: self.qualified_name(),
			placeholder: self.placeholder,
			..DispatchReport::default()
		};

		if self.placeholder {
			sink.respond(Response::Warning(format!(
				"Unknown dynamic macro: {}",
				self.qualified_name()
			)));
			return report;
		}

		for (index, stage) in self.stages.iter().enumerate() {
			let mut bindings = bindings.clone();
			if let HostAccess::Status(_) = bindings.host {
				bindings.host = HostAccess::Status(sink.host_status());
			}

			let scope = self.scope(invocation, bindings);
			let rendered = stage.render(scope.into_value());
			for response in scope.take_responses() {
				sink.respond(response);
			}

			let result = rendered
				.map_err(|e| {
					DynMacroError::TemplateRender {
						name: self.qualified_name(),
						stage: index + 1,
						reason: format!("{e:#}"),
					}
				})
				.and_then(|script| sink.execute(&self.name, &script));

			match result {
				Ok(()) => report.stages_run += 1,
				Err(e) => {
					debug!(name = %self.name, stage = index, error = %e, "stage failed");
					sink.respond(Response::Error(e.to_string()));
					report.errors.push(e);
				}
			}
		}

		report
	}

	/// Render every stage against a scratch copy of the variables without
	/// executing anything.
	pub fn render_preview(&self, invocation: &Invocation, bindings: &StageBindings) -> RenderPreview {
		let mut preview = RenderPreview::default();
		let mut scope = self.scope(invocation, bindings.clone());
		scope.variables = Arc::new(Mutex::new(self.variables()));

		for (index, stage) in self.stages.iter().enumerate() {
			match stage.render(scope.into_value()) {
				Ok(text) => preview.stages.push(text),
				Err(e) => {
					preview.errors.push(DynMacroError::TemplateRender {
						name: self.qualified_name(),
						stage: index + 1,
						reason: format!("{e:#}"),
					});
				}
			}
			preview.responses.extend(scope.take_responses());
		}

		preview
	}
}
