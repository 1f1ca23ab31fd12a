use std::collections::BTreeMap;
use std::path::PathBuf;

use rstest::rstest;
use serde_json::Map;
use serde_json::json;
use similar_asserts::assert_eq;
use tracing_test::traced_test;

use super::__fixtures::*;
use super::*;

fn strings(items: &[&str]) -> Vec<String> {
	items.iter().map(ToString::to_string).collect()
}

#[rstest]
#[case::integer("42", json!(42))]
#[case::negative("-7", json!(-7))]
#[case::float("1.5", json!(1.5))]
#[case::exponent("2e3", json!(2000.0))]
#[case::double_quoted(r#""a \"b\"""#, json!("a \"b\""))]
#[case::single_quoted(r"'it\'s'", json!("it's"))]
#[case::python_constants("[True, False, None]", json!([true, false, null]))]
#[case::json_constants("[true, false, null]", json!([true, false, null]))]
#[case::tuple("(1, 'two',)", json!([1, "two"]))]
#[case::parenthesised("(3)", json!(3))]
#[case::nested(r#"{"a": [1, {'b': (2,)}], "c": {}}"#, json!({"a": [1, {"b": [2]}], "c": {}}))]
fn parses_restricted_literals(#[case] input: &str, #[case] expected: serde_json::Value) -> DynMacroResult<()> {
	let value = parse_literal(input)?;
	assert!(literal_eq(&value, &expected), "{value} != {expected}");

	Ok(())
}

#[rstest]
#[case::call("open('/etc/passwd')")]
#[case::identifier("os")]
#[case::arithmetic("1 + 2")]
#[case::non_string_key("{1: 2}")]
#[case::unterminated("[1, 2")]
#[case::infinite("1e400")]
#[case::trailing("1 2")]
#[case::empty("")]
fn rejects_anything_but_literals(#[case] input: &str) {
	let result = parse_literal(input);
	assert!(
		matches!(result, Err(DynMacroError::LiteralParse { .. })),
		"{input} parsed as {result:?}"
	);
}

#[test]
fn literal_nesting_is_bounded() {
	let shallow = format!("{}{}", "[".repeat(10), "]".repeat(10));
	assert!(parse_literal(&shallow).is_ok());

	let deep = format!(
		"{}{}",
		"[".repeat(MAX_LITERAL_DEPTH + 2),
		"]".repeat(MAX_LITERAL_DEPTH + 2)
	);
	assert!(parse_literal(&deep).is_err());
}

#[rstest]
#[case::number("100", json!(100))]
#[case::list("[1, 2]", json!([1, 2]))]
#[case::bare_words("hello world", json!("hello world"))]
fn seeds_fall_back_to_strings(#[case] raw: &str, #[case] expected: serde_json::Value) {
	assert_eq!(parse_seed(raw), expected);
}

#[test]
fn failed_assignment_leaves_store_untouched() {
	let mut store = VariableStore::new(BTreeMap::from([("speed".to_string(), json!(10))]));

	assert!(store.set_literal("speed", "__import__('os')").is_err());
	assert_eq!(store.get("speed"), Some(&json!(10)));

	assert!(store.set_literal("SPEED", "25").is_ok());
	assert_eq!(store.get("speed"), Some(&json!(25)));
}

#[test]
fn carried_variables_only_fill_shared_keys() {
	let previous = VariableStore::new(BTreeMap::from([
		("a".to_string(), json!(1)),
		("b".to_string(), json!(2)),
	]));
	let mut fresh = VariableStore::new(BTreeMap::from([
		("a".to_string(), json!(0)),
		("c".to_string(), json!(3)),
	]));

	fresh.carry_from(&previous);
	assert_eq!(
		fresh.into_inner(),
		BTreeMap::from([("a".to_string(), json!(1)), ("c".to_string(), json!(3))])
	);
}

#[rstest]
#[case::trailing_semicolon("G28 ; home", Some("G28"))]
#[case::hash_line("# comment", None)]
#[case::indented_comment("  ; indented", None)]
#[case::embedded_hash("RESPOND MSG=a#b", Some("RESPOND MSG=a#b"))]
#[case::trailing_space("G1 X10   ", Some("G1 X10"))]
fn strips_comments(#[case] raw: &str, #[case] expected: Option<&str>) {
	assert_eq!(strip_comments(raw).as_deref(), expected);
}

#[test]
fn includes_expand_in_sorted_order() -> DynMacroResult<()> {
	let tmp = project(&[
		(
			"main.cfg",
			"[include macros/*.cfg]\n[gcode_macro MAIN]\ngcode:\n  G28\n",
		),
		("macros/b.cfg", "[gcode_macro B]\ngcode:\n  G28\n"),
		("macros/a.cfg", "[gcode_macro A] ; first\ngcode:\n  G28\n"),
	]);
	let loader = ConfigLoader::new(tmp.path());
	let sections = loader.load_sections(&[PathBuf::from("main.cfg")])?;

	let names: Vec<&str> = sections.iter().map(|section| section.name.as_str()).collect();
	assert_eq!(names, vec!["A", "B", "MAIN"]);
	assert!(sections[0].file.ends_with("macros/a.cfg"));

	Ok(())
}

#[test]
fn recursive_include_is_rejected() {
	let tmp = project(&[
		("a.cfg", "[include b.cfg]\n"),
		("b.cfg", "[include a.cfg]\n"),
	]);
	let loader = ConfigLoader::new(tmp.path());

	let result = loader.load_sections(&[PathBuf::from("a.cfg")]);
	assert!(matches!(result, Err(DynMacroError::RecursiveInclude { .. })));
}

#[test]
fn missing_include_fails_but_empty_glob_does_not() -> DynMacroResult<()> {
	let tmp = project(&[
		("literal.cfg", "[include nope.cfg]\n"),
		("glob.cfg", "[include extra/*.cfg]\n[gcode_macro ONLY]\ngcode:\n  G28\n"),
	]);
	let loader = ConfigLoader::new(tmp.path());

	let result = loader.load_sections(&[PathBuf::from("literal.cfg")]);
	assert!(matches!(result, Err(DynMacroError::MissingConfig { .. })));

	let sections = loader.load_sections(&[PathBuf::from("glob.cfg")])?;
	assert_eq!(sections.len(), 1);

	Ok(())
}

#[test]
fn option_outside_section_is_a_parse_error() {
	let tmp = project(&[("bad.cfg", "gcode: G28\n")]);
	let loader = ConfigLoader::new(tmp.path());

	let result = loader.load_sections(&[PathBuf::from("bad.cfg")]);
	assert!(matches!(result, Err(DynMacroError::ConfigParse { line: 1, .. })));
}

#[rstest]
#[case::dedent("  a\n    b\n", "a\n  b")]
#[case::outer_blanks("\n\n  a  \n\n\n\n\n  b\n\n", "a\n\n\nb")]
#[case::empty("\n\n", "")]
fn normalizes_bodies(#[case] raw: &str, #[case] expected: &str) {
	assert_eq!(normalize_body(raw), expected);
}

fn compile_one(content: &str) -> DynMacroResult<MacroDefinition> {
	let tmp = project(&[("macros.cfg", content)]);
	let sections = ConfigLoader::new(tmp.path()).load_sections(&[PathBuf::from("macros.cfg")])?;
	let mut output = MacroCompiler::default().compile_sections(&sections);

	if let Some(error) = output.errors.pop() {
		return Err(error);
	}
	output
		.definitions
		.pop()
		.ok_or_else(|| DynMacroError::UnknownMacro("<none>".to_string()))
}

#[test]
fn blank_line_pairs_split_stages() -> DynMacroResult<()> {
	let definition = compile_one(GREET_CFG)?;

	assert_eq!(definition.name(), "GREET");
	assert_eq!(definition.description(), "Say hello");
	let sources: Vec<&str> = definition.stages().iter().map(Stage::source).collect();
	assert_eq!(
		sources,
		vec![
			"{{ update(\"count\", count + 1) }}\nRESPOND MSG=\"hello {{ params.NAME }}\"",
			"RESPOND MSG=\"greeted {{ count }} times\"",
		]
	);
	assert_eq!(definition.variables().get("count"), Some(&json!(0)));

	Ok(())
}

#[rstest]
#[case::no_delimiter("delimiter: NO_DELIMITER\n", "  G28\n\n\n  G1 X1\n", 1)]
#[case::quoted_delimiter("delimiter: \"---\"\n", "  G28\n  ---\n  G1 X1\n", 2)]
#[case::default_delimiter("", "  G28\n\n\n  G1 X1\n\n\n\n\n  G4 P1\n", 3)]
fn delimiter_controls_stage_count(#[case] options: &str, #[case] body: &str, #[case] expected: usize) -> DynMacroResult<()> {
	let content = format!("[gcode_macro STAGED]\n{options}gcode:\n{body}");
	let definition = compile_one(&content)?;

	assert_eq!(definition.stages().len(), expected);

	Ok(())
}

#[test]
fn missing_description_uses_default() -> DynMacroResult<()> {
	let definition = compile_one("[gcode_macro quiet]\ngcode:\n  G28\n")?;

	assert_eq!(definition.name(), "QUIET");
	assert_eq!(definition.description(), DEFAULT_DESCRIPTION);

	Ok(())
}

#[rstest]
#[case::missing_gcode("[gcode_macro EMPTY]\ndescription: nothing\n", "gcode")]
#[case::syntax_error("[gcode_macro BROKEN]\ngcode:\n  {% if %}\n", "stage 1")]
#[case::two_words("[gcode_macro TWO WORDS]\ngcode:\n  G28\n", "TWO WORDS")]
fn compile_errors_name_the_problem(#[case] content: &str, #[case] needle: &str) {
	let error = compile_one(content).err().map(|e| e.to_string()).unwrap_or_default();

	assert!(error.contains(needle), "`{error}` does not mention `{needle}`");
}

#[test]
fn later_duplicate_replaces_earlier() -> DynMacroResult<()> {
	let tmp = project(&[(
		"macros.cfg",
		"[gcode_macro TWICE]\ndescription: first\ngcode:\n  G28\n\n[gcode_macro twice]\ndescription: second\ngcode:\n  G28\n",
	)]);
	let sections = ConfigLoader::new(tmp.path()).load_sections(&[PathBuf::from("macros.cfg")])?;
	let output = MacroCompiler::default().compile_sections(&sections);

	assert_eq!(output.definitions.len(), 1);
	assert_eq!(output.definitions[0].description(), "second");

	Ok(())
}

#[rstest]
#[case::plain("G28", "G28", &[])]
#[case::lowercase("greet name=ada", "GREET", &[("NAME", "ada")])]
#[case::quoted(r#"RESPOND MSG="hello world" TYPE=echo"#, "RESPOND", &[("MSG", "hello world"), ("TYPE", "echo")])]
#[case::single_quoted("SET_VARIABLE VALUE='[1, 2]'", "SET_VARIABLE", &[("VALUE", "[1, 2]")])]
fn parses_command_lines(#[case] line: &str, #[case] name: &str, #[case] params: &[(&str, &str)]) -> DynMacroResult<()> {
	let invocation = Invocation::parse(line)?;

	assert_eq!(invocation.name.as_str(), name);
	let expected: BTreeMap<String, String> = params
		.iter()
		.map(|(key, value)| (key.to_string(), value.to_string()))
		.collect();
	assert_eq!(invocation.params, expected);

	Ok(())
}

#[test]
fn unterminated_quote_is_rejected() {
	let result = Invocation::parse(r#"RESPOND MSG="oops"#);
	assert!(matches!(result, Err(DynMacroError::InvalidParameter { .. })));
}

#[test]
fn forwarding_drops_consumed_parameters() -> DynMacroResult<()> {
	let invocation = Invocation::parse(r#"RUN_MACRO MACRO=greet CLUSTER=a NAME="Ada L""#)?;
	let forwarded = invocation.forward("greet", &["MACRO", "CLUSTER"]);

	assert_eq!(forwarded.name.as_str(), "GREET");
	assert_eq!(forwarded.rawparams.as_str(), r#"NAME="Ada L""#);
	assert_eq!(
		forwarded.params,
		BTreeMap::from([("NAME".to_string(), "Ada L".to_string())])
	);
	assert!(matches!(
		forwarded.require("MACRO"),
		Err(DynMacroError::MissingParameter(_))
	));

	Ok(())
}

#[rstest]
#[case::plain("ok.txt", true)]
#[case::nested("scripts/../ok.txt", true)]
#[case::parent("../outside.txt", false)]
#[case::absolute("/etc/passwd", false)]
fn script_paths_stay_inside_the_root(#[case] path: &str, #[case] allowed: bool) {
	let tmp = project(&[("ok.txt", "x = 1\n")]);

	assert_eq!(resolve_script_path(tmp.path(), path).is_ok(), allowed);
}

#[test]
fn expression_scripts_assign_respond_and_return() {
	let context = RenderContext {
		variables: BTreeMap::from([("count".to_string(), json!(2))]),
		..RenderContext::default()
	};
	let output = ExpressionScripts
		.run(
			"# multiply\ncount = count * 5\nrespond('count is ' ~ count)\ncount + 1",
			context,
		)
		.unwrap_or_else(|e| panic!("script: {e:?}"));

	assert_eq!(output.variables.get("count"), Some(&json!(10)));
	assert_eq!(output.responses, vec![Response::Info("count is 10".to_string())]);
	assert_eq!(output.result, Some(json!(11)));
}

#[test]
fn failing_script_keeps_earlier_assignments() {
	let Err(failure) = ExpressionScripts.run("a = 1\nb == == 2", RenderContext::default()) else {
		panic!("script should fail");
	};

	assert!(failure.message.starts_with("line 2"), "{}", failure.message);
	let partial = failure.partial.unwrap_or_else(|| panic!("partial context"));
	assert_eq!(partial.variables.get("a"), Some(&json!(1)));
	assert!(!partial.variables.contains_key("b"));
}

#[test]
fn delayed_schedule_defers_updates_while_firing() {
	let mut reactor = ManualReactor::new();
	let mut schedule = DelayedSchedule::new(5.0, false);

	assert_eq!(schedule.arm(&mut reactor), WakeTime::At(5.0));
	schedule.begin_fire();
	assert_eq!(schedule.update(3.0, None, &mut reactor), ScheduleUpdate::Deferred);
	assert_eq!(schedule.finish_fire(5.0), WakeTime::At(8.0));

	reactor.set_time(6.0);
	assert_eq!(
		schedule.update(0.0, None, &mut reactor),
		ScheduleUpdate::Reprogrammed(WakeTime::Never)
	);
	assert_eq!(reactor.timer_count(), 1);

	schedule.disarm(&mut reactor);
	assert_eq!(reactor.timer_count(), 0);
}

#[test]
fn update_before_arming_only_records() {
	let mut reactor = ManualReactor::new();
	let mut schedule = DelayedSchedule::new(5.0, false);

	assert_eq!(schedule.update(2.0, Some(true), &mut reactor), ScheduleUpdate::Recorded);
	assert_eq!(reactor.timer_count(), 0);
	assert!(schedule.repeat);
	assert_eq!(schedule.arm(&mut reactor), WakeTime::At(2.0));
}

#[test]
fn released_timer_keeps_its_wake_time() {
	let mut reactor = ManualReactor::new();
	let mut old = DelayedSchedule::new(5.0, true);
	let mut new = DelayedSchedule::new(5.0, true);
	old.arm(&mut reactor);

	let handle = old.release().unwrap_or_else(|| panic!("armed"));
	new.adopt(handle);
	old.disarm(&mut reactor);

	assert_eq!(reactor.waketime(handle), Some(WakeTime::At(5.0)));
	assert_eq!(new.handle, Some(handle));
}

#[test]
fn settings_parse_cluster_tables() -> DynMacroResult<()> {
	let settings = EngineSettings::from_toml(SANDBOX_SETTINGS)?;

	assert_eq!(settings.configs, vec![PathBuf::from("macros.cfg")]);
	assert_eq!(settings.reload, ReloadPolicy::Explicit);
	assert_eq!(settings.on_reload_failure, ReloadFailure::KeepEmpty);
	let sandbox = &settings.clusters["sandbox"];
	assert!(!sandbox.scripting_enabled);
	assert!(!sandbox.host_access_enabled);

	Ok(())
}

#[test]
fn registered_macro_runs_through_host() {
	let (_tmp, mut engine, mut host, summary) = started(GREET_CFG, "");

	assert!(summary.is_ok());
	assert_eq!(summary.global.installed, strings(&["GREET"]));
	assert_eq!(host.command("GREET").map(|info| info.kind), Some(CommandKind::Macro));

	engine.run_command(&mut host, "GREET NAME=Ada");
	assert_eq!(
		host.executed,
		strings(&[r#"RESPOND MSG="hello Ada""#, r#"RESPOND MSG="greeted 1 times""#])
	);
	assert_eq!(infos(&host), strings(&["hello Ada", "greeted 1 times"]));
	assert!(errors(&host).is_empty());
}

#[test]
fn unknown_macro_reaches_placeholder() -> DynMacroResult<()> {
	let (_tmp, mut engine, mut host, _) = started(GREET_CFG, "");

	engine.run_command(&mut host, "RUN_MACRO MACRO=nope");
	assert_eq!(warnings(&host), strings(&["Unknown dynamic macro: NOPE"]));

	let report = engine.dispatch(&mut host, None, &Invocation::bare("missing"))?;
	assert!(report.placeholder);
	assert_eq!(report.stages_run, 0);

	Ok(())
}

#[test]
fn every_registered_name_dispatches_a_real_macro() -> DynMacroResult<()> {
	let (_tmp, mut engine, mut host, _) = started(&format!("{GREET_CFG}\n{HOMING_CFG}"), "");
	let names: Vec<String> = engine.registry().names().map(str::to_string).collect();

	assert_eq!(names, strings(&["G28", "GREET"]));
	for name in names {
		let report = engine.dispatch(&mut host, None, &Invocation::bare(name))?;
		assert!(!report.placeholder);
		assert!(report.is_ok());
	}

	Ok(())
}

#[test]
fn unknown_direct_command_is_a_host_error() {
	let (_tmp, mut engine, mut host, _) = started(GREET_CFG, "");

	engine.run_command(&mut host, "NOT_A_COMMAND X=1");
	assert_eq!(errors(&host), strings(&[r#"host rejected command: Unknown command: "NOT_A_COMMAND""#]));
}

#[test]
fn set_variable_is_visible_to_later_stages() {
	let (_tmp, mut engine, mut host, _) = started(
		r#"[gcode_macro STEPS]
variable_speed: 10
gcode:
  SET_VARIABLE MACRO=STEPS VARIABLE=speed VALUE=25
  RESPOND MSG="before {{ speed }}"


  RESPOND MSG="after {{ speed }}"
"#,
		"",
	);

	engine.run_command(&mut host, "STEPS");
	assert_eq!(infos(&host), strings(&["before 10", "after 25"]));
}

#[test]
fn failing_stage_does_not_stop_later_stages() -> DynMacroResult<()> {
	let (_tmp, mut engine, mut host, _) = started(
		r#"[gcode_macro FLAKY]
gcode:
  NOT_A_COMMAND
  RESPOND MSG="skipped"


  RESPOND MSG="after"
"#,
		"",
	);

	let report = engine.dispatch(&mut host, None, &Invocation::bare("FLAKY"))?;
	assert_eq!(report.stages_run, 1);
	assert_eq!(report.errors.len(), 1);
	assert_eq!(infos(&host), strings(&["after"]));
	assert_eq!(errors(&host).len(), 1);

	Ok(())
}

#[test]
fn set_variable_round_trips_structured_literals() -> DynMacroResult<()> {
	let (_tmp, mut engine, mut host, _) = started(GREET_CFG, "");

	engine.run_command(
		&mut host,
		r#"SET_VARIABLE MACRO=GREET VARIABLE=items VALUE="[1, 'two', {'k': None}]""#,
	);
	assert!(errors(&host).is_empty());
	assert_eq!(
		engine.describe("GREET", None)?.variables.get("items"),
		Some(&json!([1, "two", {"k": null}]))
	);

	Ok(())
}

#[rstest]
#[case::code_injection(r#"SET_VARIABLE MACRO=GREET VARIABLE=count VALUE="open('/etc/passwd')""#, "invalid literal")]
#[case::unknown_macro("SET_VARIABLE MACRO=MISSING VARIABLE=count VALUE=1", "unknown macro: `MISSING`")]
#[case::missing_value("SET_VARIABLE MACRO=GREET VARIABLE=count", "missing required parameter `VALUE`")]
fn set_variable_rejections_keep_state(#[case] line: &str, #[case] needle: &str) -> DynMacroResult<()> {
	let (_tmp, mut engine, mut host, _) = started(GREET_CFG, "");

	engine.run_command(&mut host, line);
	let reported = errors(&host);
	assert_eq!(reported.len(), 1);
	assert!(reported[0].contains(needle), "{reported:?}");
	assert_eq!(
		engine.describe("GREET", None)?.variables.get("count"),
		Some(&json!(0))
	);

	Ok(())
}

#[test]
fn delayed_macro_repeats_until_parked() {
	let (_tmp, mut engine, mut host, summary) = started(TICK_CFG, "");

	assert!(summary.is_ok());
	assert!(host.command("TICK").is_none());
	let handle = |engine: &MacroEngine| {
		engine
			.registry()
			.get("TICK")
			.and_then(|definition| definition.timer_handle())
	};
	assert_eq!(handle(&engine), None);

	engine.on_ready(&mut host);
	let timer = handle(&engine).unwrap_or_else(|| panic!("timer armed"));
	assert_eq!(host.clock.waketime(timer), Some(WakeTime::At(5.0)));

	assert_eq!(engine.advance_to(&mut host, 16.0), 3);
	assert_eq!(host.executed, strings(&["G4 P0", "G4 P1", "G4 P2"]));
	assert_eq!(host.clock.waketime(timer), Some(WakeTime::At(20.0)));

	engine.run_command(&mut host, "UPDATE_DELAYED ID=TICK DURATION=0");
	assert_eq!(host.clock.waketime(timer), Some(WakeTime::Never));
	assert_eq!(engine.advance_to(&mut host, 60.0), 0);
}

#[test]
fn update_from_own_callback_is_deferred() {
	let (_tmp, mut engine, mut host, _) = started(
		"[delayed_gcode AGAIN]\ninitial_duration: 1\ngcode:\n  UPDATE_DELAYED ID=AGAIN DURATION=2\n",
		"",
	);
	engine.on_ready(&mut host);

	assert_eq!(engine.advance_to(&mut host, 4.0), 2);
	let timer = engine
		.registry()
		.get("AGAIN")
		.and_then(|definition| definition.timer_handle())
		.unwrap_or_else(|| panic!("timer armed"));
	assert_eq!(host.clock.waketime(timer), Some(WakeTime::At(5.0)));
	assert!(errors(&host).is_empty());
}

#[rstest]
#[case::not_delayed("UPDATE_DELAYED ID=GREET DURATION=1", "has no delayed schedule")]
#[case::negative("UPDATE_DELAYED ID=GREET DURATION=-1", "must be zero or positive")]
#[case::bad_repeat("UPDATE_DELAYED ID=GREET DURATION=1 REPEAT=maybe", "REPEAT")]
fn update_delayed_validates_input(#[case] line: &str, #[case] needle: &str) {
	let (_tmp, mut engine, mut host, _) = started(GREET_CFG, "");

	engine.run_command(&mut host, line);
	let reported = errors(&host);
	assert!(reported.iter().any(|error| error.contains(needle)), "{reported:?}");
}

#[test]
#[traced_test]
fn sandboxed_cluster_stubs_scripts_and_hides_host() -> DynMacroResult<()> {
	let tmp = project(&[
		("dynmacro.toml", SANDBOX_SETTINGS),
		("macros.cfg", PROBE_CFG),
		("sandbox.cfg", PROBE_CFG),
	]);
	let mut host = SimulatedHost::new();
	let mut engine = MacroEngine::load(tmp.path())?;
	assert!(engine.start(&mut host)?.is_ok());

	engine.run_command(&mut host, "PROBE");
	assert_eq!(infos(&host), strings(&["state=standby"]));
	assert_eq!(
		engine.describe("PROBE", None)?.variables.get("touched"),
		Some(&json!(1))
	);

	host.take_responses();
	engine.run_command(&mut host, "RUN_MACRO MACRO=PROBE CLUSTER=sandbox");
	assert_eq!(warnings(&host), strings(&[SCRIPTING_DISABLED_WARNING]));
	assert_eq!(infos(&host), strings(&["state="]));
	assert!(errors(&host).is_empty());
	assert!(
		!engine
			.describe("PROBE", Some("sandbox"))?
			.variables
			.contains_key("touched")
	);
	assert!(logs_contain("scripting is disabled"));

	Ok(())
}

#[test]
fn unknown_cluster_is_reported() {
	let (_tmp, mut engine, mut host, _) = started(GREET_CFG, "");

	engine.run_command(&mut host, "RUN_MACRO MACRO=GREET CLUSTER=nowhere");
	assert_eq!(errors(&host), strings(&["unknown cluster: `nowhere`"]));
}

#[rstest]
#[case::keep_empty("keep_empty", 0)]
#[case::restore_previous("restore_previous", 1)]
fn failed_reload_follows_policy(#[case] policy: &str, #[case] expected: usize) {
	let (tmp, mut engine, mut host, _) = started(GREET_CFG, &format!("on_reload_failure = \"{policy}\"\n"));

	write_file(tmp.path(), "macros.cfg", "[include missing.cfg]\n");
	let summary = engine.reload(&mut host);

	assert!(matches!(
		summary.global.failure,
		Some(DynMacroError::MissingConfig { .. })
	));
	assert_eq!(summary.global.restored, expected == 1);
	assert_eq!(engine.registry().len(), expected);
	assert_eq!(host.command("GREET").is_some(), expected == 1);
}

#[rstest]
#[case::keep_empty("keep_empty", 0)]
#[case::restore_previous("restore_previous", 7)]
fn failed_reload_follows_policy_for_delayed_macros(#[case] policy: &str, #[case] expected: usize) {
	let (tmp, mut engine, mut host, _) = started(TICK_CFG, &format!("on_reload_failure = \"{policy}\"\n"));
	engine.on_ready(&mut host);
	assert_eq!(engine.advance_to(&mut host, 5.0), 1);

	write_file(tmp.path(), "macros.cfg", "[include missing.cfg]\n");
	engine.reload(&mut host);

	assert_eq!(host.clock.timer_count(), expected.min(1));
	assert_eq!(engine.advance_to(&mut host, 40.0), expected);
	if expected > 0 {
		let schedule = engine
			.registry()
			.get("TICK")
			.and_then(|definition| definition.schedule())
			.unwrap_or_else(|| panic!("restored"));
		assert!(schedule.repeat);
	}
}

#[test]
fn uninstall_releases_timer_and_stops_repeating() -> DynMacroResult<()> {
	let mut host = SimulatedHost::new();
	let mut registry = MacroRegistry::new(None);

	let outcome = registry.install(&mut host, compile_one(TICK_CFG)?, true)?;
	assert_eq!(outcome, InstallOutcome::Installed);
	assert_eq!(host.clock.timer_count(), 1);

	let removed = registry
		.uninstall(&mut host, "tick")
		.unwrap_or_else(|| panic!("installed"));
	assert!(registry.is_empty());
	assert_eq!(host.clock.timer_count(), 0);
	assert_eq!(removed.schedule().map(|schedule| schedule.repeat), Some(false));

	Ok(())
}

#[test]
fn reload_keeps_timer_of_same_named_macro() {
	let (tmp, mut engine, mut host, _) = started(TICK_CFG, "");
	engine.on_ready(&mut host);
	engine.advance_to(&mut host, 7.0);

	write_file(tmp.path(), "macros.cfg", &TICK_CFG.replace("initial_duration: 5", "initial_duration: 4"));
	assert!(engine.reload(&mut host).is_ok());
	assert_eq!(host.clock.timer_count(), 1);

	assert_eq!(engine.advance_to(&mut host, 10.0), 1);
	assert_eq!(engine.advance_to(&mut host, 14.0), 1);
	assert_eq!(host.executed, strings(&["G4 P0", "G4 P0", "G4 P1"]));

	write_file(tmp.path(), "macros.cfg", "");
	assert!(engine.reload(&mut host).is_ok());
	assert_eq!(host.clock.timer_count(), 0);
}

#[test]
fn update_delayed_before_ready_waits_for_the_host() {
	let (_tmp, mut engine, mut host, _) = started(TICK_CFG, "");

	engine.run_command(&mut host, "UPDATE_DELAYED ID=TICK DURATION=2");
	assert!(errors(&host).is_empty());
	assert_eq!(host.clock.timer_count(), 0);

	engine.on_ready(&mut host);
	assert_eq!(engine.advance_to(&mut host, 6.0), 3);
}

#[test]
fn renamed_command_survives_reloads_and_is_restored() {
	let (tmp, mut engine, mut host, summary) = started(HOMING_CFG, "");

	assert!(summary.is_ok());
	assert_eq!(host.command("G28").map(|info| info.kind), Some(CommandKind::Macro));
	assert_eq!(host.command("G28_BASE").map(|info| info.kind), Some(CommandKind::Native));

	engine.run_command(&mut host, "G28");
	assert_eq!(host.executed, strings(&["G28_BASE", r#"RESPOND MSG="homed""#]));

	for _ in 0..3 {
		assert!(engine.reload(&mut host).is_ok());
	}
	assert_eq!(engine.registry().renamed_to("G28"), Some("G28_BASE"));
	assert_eq!(host.command("G28_BASE").map(|info| info.kind), Some(CommandKind::Native));

	write_file(tmp.path(), "macros.cfg", "");
	assert!(engine.reload(&mut host).is_ok());
	assert_eq!(host.command("G28").map(|info| info.kind), Some(CommandKind::Native));
	assert!(host.command("G28_BASE").is_none());
}

#[rstest]
#[case::existing_without_rename("[gcode_macro G1]\ngcode:\n  G4 P1\n", "rename_existing")]
#[case::alias_taken("[gcode_macro G1]\nrename_existing: G28\ngcode:\n  G4 P1\n", "already in use")]
fn claiming_taken_names_fails(#[case] content: &str, #[case] needle: &str) {
	let (_tmp, _engine, host, summary) = started(content, "");

	let reported: Vec<String> = summary.errors().map(ToString::to_string).collect();
	assert_eq!(reported.len(), 1);
	assert!(reported[0].contains(needle), "{reported:?}");
	assert_eq!(host.command("G1").map(|info| info.kind), Some(CommandKind::Native));
}

#[test]
#[traced_test]
fn reserved_names_are_skipped_with_a_warning() {
	let (_tmp, mut engine, mut host, summary) = started(
		"[gcode_macro STATUS]\ngcode:\n  RESPOND MSG=\"mine\"\n\n[gcode_macro RUN_MACRO]\ngcode:\n  RESPOND MSG=\"hijack\"\n",
		"",
	);

	assert!(summary.is_ok());
	assert_eq!(summary.global.skipped, strings(&["STATUS", "RUN_MACRO"]));
	assert!(engine.registry().is_empty());
	assert!(logs_contain("reserved by the host"));

	engine.run_command(&mut host, "RUN_MACRO MACRO=GREET");
	assert_eq!(warnings(&host), strings(&["Unknown dynamic macro: GREET"]));
}

#[test]
fn reloading_unchanged_configuration_is_idempotent() {
	let (_tmp, mut engine, mut host, _) = started(&format!("{GREET_CFG}\n{HOMING_CFG}"), "");
	let shape = |engine: &MacroEngine| {
		engine
			.describe_all()
			.into_iter()
			.map(|description| (description.name, description.stages))
			.collect::<Vec<_>>()
	};
	let before = shape(&engine);
	let commands = host.commands().clone();

	assert!(engine.reload(&mut host).is_ok());
	assert_eq!(shape(&engine), before);
	assert_eq!(before, vec![("G28".to_string(), 1), ("GREET".to_string(), 2)]);
	assert_eq!(host.commands(), &commands);
}

#[test]
fn compile_errors_do_not_block_other_macros() {
	let (_tmp, engine, _host, summary) = started(
		&format!("[gcode_macro BROKEN]\ngcode:\n  {{% if %}}\n\n{GREET_CFG}"),
		"",
	);

	assert!(!summary.is_ok());
	assert_eq!(summary.global.errors.len(), 1);
	assert_eq!(summary.global.installed, strings(&["GREET"]));
	assert!(engine.registry().get("BROKEN").is_none());
}

#[test]
fn include_cycle_leaves_registry_empty() {
	let tmp = project(&[
		("dynmacro.toml", "configs = [\"macros.cfg\"]\n"),
		("macros.cfg", "[include other.cfg]\n"),
		(
			"other.cfg",
			"[include macros.cfg]\n[gcode_macro X]\ngcode:\n  G28\n",
		),
	]);
	let mut host = SimulatedHost::new();
	let mut engine = MacroEngine::load(tmp.path()).unwrap_or_else(|e| panic!("load: {e}"));
	let summary = engine
		.start(&mut host)
		.unwrap_or_else(|e| panic!("start: {e}"));

	assert!(matches!(
		summary.global.failure,
		Some(DynMacroError::RecursiveInclude { .. })
	));
	assert!(engine.registry().is_empty());
}

#[test]
fn render_macro_previews_without_side_effects() -> DynMacroResult<()> {
	let (_tmp, mut engine, mut host, _) = started(GREET_CFG, "");

	engine.run_command(&mut host, "RENDER_MACRO MACRO=greet NAME=Ada");
	assert_eq!(
		infos(&host),
		strings(&[
			"GREET stage 1:\nRESPOND MSG=\"hello Ada\"",
			"GREET stage 2:\nRESPOND MSG=\"greeted 1 times\"",
		])
	);
	assert!(host.executed.is_empty());
	assert_eq!(
		engine.describe("GREET", None)?.variables.get("count"),
		Some(&json!(0))
	);

	host.take_responses();
	engine.run_command(&mut host, "RENDER_MACRO MACRO=NOPE");
	assert_eq!(errors(&host), strings(&["unknown macro: `NOPE`"]));

	Ok(())
}

#[test]
fn self_invoking_macro_hits_the_nesting_limit() {
	let (_tmp, mut engine, mut host, _) = started("[gcode_macro LOOP]\ngcode:\n  LOOP\n", "");

	engine.run_command(&mut host, "LOOP");
	let reported = errors(&host);
	assert!(!reported.is_empty());
	assert!(
		reported
			.iter()
			.all(|error| error.contains("nesting exceeded 16 levels")),
		"{reported:?}"
	);
}

#[test]
fn partial_script_changes_survive_a_failing_script() {
	let (_tmp, mut engine, mut host, _) = started(
		r#"[gcode_macro PARTIAL]
variable_total: 0
gcode:
  {{ script("total = 5\nbroken(") }}


  RESPOND MSG="total={{ total }}"
"#,
		"",
	);

	engine.run_command(&mut host, "PARTIAL");
	let reported = errors(&host);
	assert_eq!(reported.len(), 1);
	assert!(reported[0].contains("script failed"), "{reported:?}");
	assert_eq!(infos(&host), strings(&["total=5"]));
}

#[test]
fn describe_serializes_macro_state() -> DynMacroResult<()> {
	let (_tmp, engine, _host, _) = started(GREET_CFG, "");

	insta::assert_json_snapshot!(engine.describe("GREET", None)?, @r##"
	{
	  "name": "GREET",
	  "cluster": null,
	  "description": "Say hello",
	  "template": "{{ update(\"count\", count + 1) }}\nRESPOND MSG=\"hello {{ params.NAME }}\"\n\n\nRESPOND MSG=\"greeted {{ count }} times\"",
	  "stages": 2,
	  "variables": {
	    "count": 0
	  }
	}
	"##);

	Ok(())
}

#[test]
fn status_entries_never_replace_host_entries() -> DynMacroResult<()> {
	let tmp = project(&[
		("dynmacro.toml", SANDBOX_SETTINGS),
		("macros.cfg", PROBE_CFG),
		("sandbox.cfg", PROBE_CFG),
	]);
	let mut host = SimulatedHost::new();
	let mut engine = MacroEngine::load(tmp.path())?;
	engine.start(&mut host)?;

	let status = engine.status();
	assert!(status.contains_key("dynamic_macro PROBE"));
	assert!(status.contains_key("dynamic_macro sandbox:PROBE"));

	let mut host_status = Map::new();
	host_status.insert("dynamic_macro PROBE".to_string(), json!("host owned"));
	engine.merge_status(&mut host_status);

	assert_eq!(host_status["dynamic_macro PROBE"], json!("host owned"));
	assert_eq!(
		host_status["dynamic_macro sandbox:PROBE"]["cluster"],
		json!("sandbox")
	);

	Ok(())
}

#[test]
fn on_dispatch_policy_reads_fresh_configuration() {
	let (tmp, mut engine, mut host, _) = started(GREET_CFG, "reload = \"on_dispatch\"\n");

	write_file(
		tmp.path(),
		"macros.cfg",
		"[gcode_macro GREET]\ngcode:\n  RESPOND MSG=\"fresh\"\n",
	);
	engine.run_command(&mut host, "RUN_MACRO MACRO=GREET");

	assert_eq!(infos(&host), strings(&["fresh"]));
}

#[rstest]
#[case::faster_than_the_period(3.0, 6)]
#[case::every_second(1.0, 2)]
fn on_dispatch_reloads_keep_delayed_cadence(#[case] step: f64, #[case] expected: usize) {
	let (_tmp, mut engine, mut host, _) = started(
		&format!("{GREET_CFG}\n{TICK_CFG}"),
		"reload = \"on_dispatch\"\n",
	);
	engine.on_ready(&mut host);

	let mut fired = 0;
	for round in 1..=10 {
		engine.run_command(&mut host, "RUN_MACRO MACRO=GREET");
		fired += engine.advance_to(&mut host, f64::from(round) * step);
	}

	assert_eq!(fired, expected);
	assert_eq!(host.clock.timer_count(), 1);
	assert!(errors(&host).is_empty());
}

#[test]
fn reload_from_own_callback_keeps_repeating() {
	let (_tmp, mut engine, mut host, _) = started(
		"[delayed_gcode PULSE]\ninitial_duration: 2\nrepeat: true\ngcode:\n  RELOAD_MACROS\n",
		"",
	);
	engine.on_ready(&mut host);

	assert_eq!(engine.advance_to(&mut host, 10.0), 5);
	assert_eq!(host.clock.timer_count(), 1);
	assert!(errors(&host).is_empty());
}

#[test]
fn explicit_policy_keeps_the_loaded_generation() {
	let (tmp, mut engine, mut host, _) = started(GREET_CFG, "");

	write_file(
		tmp.path(),
		"macros.cfg",
		"[gcode_macro GREET]\ngcode:\n  RESPOND MSG=\"fresh\"\n",
	);
	engine.run_command(&mut host, "GREET NAME=Ada");
	assert_eq!(infos(&host)[0].as_str(), "hello Ada");

	host.take_responses();
	engine.run_command(&mut host, "RELOAD_MACROS");
	assert_eq!(infos(&host), strings(&["Reloaded 1 dynamic macros"]));

	host.take_responses();
	engine.run_command(&mut host, "GREET");
	assert_eq!(infos(&host), strings(&["fresh"]));
}

#[rstest]
#[case::persisted(true, json!(7))]
#[case::reseeded(false, json!(0))]
fn reload_persists_variables_when_asked(#[case] persist: bool, #[case] expected: serde_json::Value) -> DynMacroResult<()> {
	let (_tmp, mut engine, mut host, _) = started(GREET_CFG, &format!("persist_variables = {persist}\n"));

	engine.run_command(&mut host, "SET_VARIABLE MACRO=GREET VARIABLE=count VALUE=7");
	engine.reload(&mut host);

	assert_eq!(
		engine.describe("GREET", None)?.variables.get("count"),
		Some(&expected)
	);

	Ok(())
}
