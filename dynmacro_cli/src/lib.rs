use std::path::PathBuf;

use clap::Parser;
use clap::Subcommand;
use clap::ValueEnum;

#[derive(Parser)]
#[command(
	author,
	version,
	about = "Load, inspect and simulate dynamic command macros.",
	long_about = "dynmacro loads user-defined, templated command macros from configuration and \
	              runs them against a simulated host.\n\nQuick start:\n  dynmacro check     \
	              Load every macro and report problems\n  dynmacro list      Show the \
	              installed macros\n  dynmacro describe  Inspect one macro\n  dynmacro run       \
	              Feed command lines to a simulated host"
)]
pub struct DynMacroCli {
	#[command(subcommand)]
	pub command: Option<Commands>,

	/// Path to the configuration root directory.
	#[arg(long, short, global = true)]
	pub path: Option<PathBuf>,

	/// Enable verbose output.
	#[arg(long, short, global = true, default_value_t = false)]
	pub verbose: bool,

	/// Disable colored output.
	#[arg(long, global = true, default_value_t = false)]
	pub no_color: bool,
}

#[derive(Subcommand)]
pub enum Commands {
	/// Load every macro and report configuration problems.
	///
	/// Reads `dynmacro.toml`, expands includes and compiles every macro of
	/// the global registry and of every cluster. Exits with a non-zero status
	/// when anything fails to load.
	Check {
		/// Output format for check results. Use `text` for human-readable
		/// output or `json` for programmatic consumption.
		#[arg(long, value_enum, default_value_t = OutputFormat::Text)]
		format: OutputFormat,
	},
	/// List every installed macro.
	List,
	/// Show the source, variables and schedule of one macro.
	Describe {
		/// Macro name. Case does not matter.
		name: String,

		/// Look the macro up in this cluster instead of the global registry.
		#[arg(long)]
		cluster: Option<String>,

		/// Print the description as JSON.
		#[arg(long, default_value_t = false)]
		json: bool,
	},
	/// Run command lines against a simulated host.
	///
	/// Lines are read from `--script` or from stdin. A line of the form
	/// `@wait SECONDS` advances the simulated clock, firing any delayed
	/// macros that fall due.
	Run {
		/// File of command lines to run instead of stdin.
		#[arg(long)]
		script: Option<PathBuf>,

		/// Advance the simulated clock to this time once every line has run.
		#[arg(long)]
		until: Option<f64>,
	},
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum OutputFormat {
	/// Human-readable text output with colors and formatting.
	Text,
	/// JSON output for programmatic consumption.
	Json,
}
