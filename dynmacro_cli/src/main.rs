use std::path::Path;
use std::path::PathBuf;
use std::process;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

use clap::Parser;
use dynmacro_cli::Commands;
use dynmacro_cli::DynMacroCli;
use dynmacro_cli::OutputFormat;
use dynmacro_core::DynMacroError;
use dynmacro_core::Host;
use dynmacro_core::MacroDescription;
use dynmacro_core::MacroEngine;
use dynmacro_core::Reactor;
use dynmacro_core::ReloadSummary;
use dynmacro_core::Response;
use dynmacro_core::SimulatedHost;
use dynmacro_core::status_key;
use owo_colors::OwoColorize;
use tracing_subscriber::EnvFilter;

static USE_COLOR: AtomicBool = AtomicBool::new(true);

fn color_enabled() -> bool {
	USE_COLOR.load(Ordering::Relaxed)
}

/// Apply ANSI color codes only when color is enabled.
macro_rules! colored {
	($text:expr, $style:ident) => {
		if color_enabled() {
			format!("{}", $text.$style())
		} else {
			format!("{}", $text)
		}
	};
}

type CliResult<T> = Result<T, Box<dyn std::error::Error>>;

/// Prefix of the directive that advances the simulated clock in `run`.
const WAIT_DIRECTIVE: &str = "@wait";

fn main() {
	let args = DynMacroCli::parse();

	// Respect NO_COLOR env var and --no-color flag.
	let use_color = !args.no_color && std::env::var_os("NO_COLOR").is_none();
	if !use_color {
		USE_COLOR.store(false, Ordering::Relaxed);
	}

	init_tracing(args.verbose, use_color);

	// Install miette's fancy handler for rich error diagnostics.
	miette::set_hook(Box::new(move |_| {
		Box::new(
			miette::MietteHandlerOpts::new()
				.color(use_color)
				.unicode(use_color)
				.build(),
		)
	}))
	.ok();

	let result = match &args.command {
		Some(Commands::Check { format }) => run_check(&args, *format),
		Some(Commands::List) => run_list(&args),
		Some(Commands::Describe {
			name,
			cluster,
			json,
		}) => run_describe(&args, name, cluster.as_deref(), *json),
		Some(Commands::Run { script, until }) => run_script(&args, script.as_deref(), *until),
		None => {
			eprintln!("No subcommand specified. Run `dynmacro --help` for usage.");
			process::exit(1);
		}
	};

	if let Err(e) = result {
		match e.downcast::<DynMacroError>() {
			Ok(error) => {
				let report: miette::Report = (*error).into();
				eprintln!("{report:?}");
			}
			Err(e) => {
				eprintln!("{} {e}", colored!("error:", red));
			}
		}
		process::exit(2);
	}
}

fn init_tracing(verbose: bool, use_color: bool) {
	let fallback = if verbose { "debug" } else { "warn" };
	let filter =
		EnvFilter::try_from_env("DYNMACRO_LOG").unwrap_or_else(|_| EnvFilter::new(fallback));

	tracing_subscriber::fmt()
		.with_env_filter(filter)
		.with_writer(std::io::stderr)
		.with_ansi(use_color)
		.with_target(false)
		.without_time()
		.try_init()
		.ok();
}

fn resolve_root(args: &DynMacroCli) -> PathBuf {
	args.path
		.clone()
		.unwrap_or_else(|| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")))
}

fn start_engine(args: &DynMacroCli) -> CliResult<(MacroEngine, SimulatedHost, ReloadSummary)> {
	let mut host = SimulatedHost::new();
	let mut engine = MacroEngine::load(resolve_root(args))?;
	let summary = engine.start(&mut host)?;

	Ok((engine, host, summary))
}

fn print_load_errors(summary: &ReloadSummary) {
	for error in summary.errors() {
		eprintln!("{} {error}", colored!("error:", red));
	}
}

fn run_check(args: &DynMacroCli, format: OutputFormat) -> CliResult<()> {
	let (_engine, _host, summary) = start_engine(args)?;
	let skipped: Vec<&str> = summary
		.global
		.skipped
		.iter()
		.chain(summary.clusters.values().flat_map(|report| report.skipped.iter()))
		.map(String::as_str)
		.collect();

	match format {
		OutputFormat::Json => {
			let errors: Vec<String> = summary.errors().map(ToString::to_string).collect();
			let output = serde_json::json!({
				"ok": summary.is_ok(),
				"installed": summary.installed(),
				"skipped": skipped,
				"errors": errors,
			});
			println!("{}", serde_json::to_string_pretty(&output)?);
		}
		OutputFormat::Text => {
			for name in &skipped {
				println!(
					"{} `{name}` is reserved by the host and was skipped",
					colored!("warning:", yellow)
				);
			}
			print_load_errors(&summary);
			if summary.is_ok() {
				println!(
					"Check passed: loaded {} dynamic macros.",
					summary.installed()
				);
			} else {
				println!(
					"Check failed: {} error(s), {} dynamic macros loaded.",
					summary.errors().count(),
					summary.installed()
				);
			}
		}
	}

	if !summary.is_ok() {
		process::exit(1);
	}

	Ok(())
}

fn qualified(description: &MacroDescription) -> String {
	match &description.cluster {
		Some(cluster) => format!("{cluster}:{}", description.name),
		None => description.name.clone(),
	}
}

fn run_list(args: &DynMacroCli) -> CliResult<()> {
	let (engine, _host, summary) = start_engine(args)?;
	print_load_errors(&summary);

	let descriptions = engine.describe_all();
	if descriptions.is_empty() {
		println!("No dynamic macros installed.");
		return Ok(());
	}

	let width = descriptions
		.iter()
		.map(|description| qualified(description).len())
		.max()
		.unwrap_or_default();

	for description in &descriptions {
		let name = qualified(description);
		let marker = if description.schedule.is_some() {
			" [delayed]"
		} else {
			""
		};
		println!(
			"{}{marker}  {}",
			colored!(format!("{name:<width$}"), bold),
			description.description
		);
	}

	println!();
	println!("{} dynamic macros", descriptions.len());
	Ok(())
}

fn run_describe(
	args: &DynMacroCli,
	name: &str,
	cluster: Option<&str>,
	json: bool,
) -> CliResult<()> {
	let (engine, _host, summary) = start_engine(args)?;
	print_load_errors(&summary);

	let description = engine.describe(name, cluster)?;
	if json {
		println!("{}", serde_json::to_string_pretty(&description)?);
		return Ok(());
	}

	println!("{}", colored!(qualified(&description), bold));
	println!("{:<16} {}", "description", description.description);
	println!("{:<16} {}", "stages", description.stages);
	println!("{:<16} {}", "status key", status_key(&description));
	if let Some(alias) = &description.rename_existing {
		println!("{:<16} {alias}", "renames to");
	}
	if let Some(schedule) = &description.schedule {
		println!(
			"{:<16} every {}s, repeat: {}",
			"schedule", schedule.duration, schedule.repeat
		);
	}
	for (key, value) in &description.variables {
		println!("{:<16} {key} = {value}", "variable");
	}

	println!();
	println!("{}", description.template);
	Ok(())
}

fn run_script(args: &DynMacroCli, script: Option<&Path>, until: Option<f64>) -> CliResult<()> {
	let input = match script {
		Some(path) => std::fs::read_to_string(path)?,
		None => std::io::read_to_string(std::io::stdin())?,
	};

	let (mut engine, mut host, summary) = start_engine(args)?;
	print_load_errors(&summary);
	engine.on_ready(&mut host);

	let base_status = host.status();
	let mut printed = 0;
	let mut failed = false;

	for line in input.lines() {
		let line = line.trim();
		if line.is_empty() || line.starts_with('#') {
			continue;
		}

		refresh_status(&engine, &mut host, &base_status);
		match line.strip_prefix(WAIT_DIRECTIVE) {
			Some(seconds) => {
				let seconds: f64 = seconds
					.trim()
					.parse()
					.map_err(|e| format!("invalid `{WAIT_DIRECTIVE}` duration `{}`: {e}", seconds.trim()))?;
				let target = host.clock.monotonic() + seconds;
				engine.advance_to(&mut host, target);
			}
			None => engine.run_command(&mut host, line),
		}

		failed |= flush_output(&mut host, &mut printed);
	}

	if let Some(until) = until {
		engine.advance_to(&mut host, until);
		failed |= flush_output(&mut host, &mut printed);
	}

	if failed {
		process::exit(1);
	}

	Ok(())
}

/// Expose the engine's status entries to templates reading `printer`.
fn refresh_status(engine: &MacroEngine, host: &mut SimulatedHost, base: &serde_json::Value) {
	let mut status = base.as_object().cloned().unwrap_or_default();
	engine.merge_status(&mut status);
	host.set_status(serde_json::Value::Object(status));
}

/// Print executed lines and responses gathered since the last call. Returns
/// whether any response was an error.
fn flush_output(host: &mut SimulatedHost, printed: &mut usize) -> bool {
	for line in host.executed.iter().skip(*printed) {
		println!("{} {line}", colored!(">", dimmed));
	}
	*printed = host.executed.len();

	let mut failed = false;
	for response in host.take_responses() {
		match response {
			Response::Info(message) => print_lines("//", &message),
			Response::Warning(message) => print_lines(&colored!("!!", yellow), &message),
			Response::Error(message) => {
				failed = true;
				print_lines(&colored!("!!", red), &message);
			}
			_ => {}
		}
	}

	failed
}

fn print_lines(prefix: &str, message: &str) {
	for line in message.lines() {
		println!("{prefix} {line}");
	}
}
