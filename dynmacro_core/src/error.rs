use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Diagnostic, Error)]
#[non_exhaustive]
pub enum DynMacroError {
	#[error(transparent)]
	#[diagnostic(code(dynmacro::io_error))]
	Io(#[from] std::io::Error),

	#[error("config file does not exist: `{path}`")]
	#[diagnostic(
		code(dynmacro::missing_config),
		help("paths are resolved relative to the including file's directory")
	)]
	MissingConfig { path: String },

	#[error("recursive include of `{path}` (include chain: {chain})")]
	#[diagnostic(
		code(dynmacro::recursive_include),
		help("remove the `[include ...]` section that points back at a file already being read")
	)]
	RecursiveInclude { path: String, chain: String },

	#[error("failed to parse `{file}` line {line}: {reason}")]
	#[diagnostic(code(dynmacro::config_parse))]
	ConfigParse {
		file: String,
		line: usize,
		reason: String,
	},

	#[error("failed to load engine settings: {0}")]
	#[diagnostic(
		code(dynmacro::settings),
		help("check that dynmacro.toml is valid TOML")
	)]
	Settings(String),

	#[error("failed to compile macro `{name}`: {reason}")]
	#[diagnostic(code(dynmacro::compile))]
	Compile { name: String, reason: String },

	#[error("invalid literal `{input}`: {reason}")]
	#[diagnostic(
		code(dynmacro::literal_parse),
		help(
			"only numbers, quoted strings, booleans, null and nested lists or maps of those are \
			 accepted"
		)
	)]
	LiteralParse { input: String, reason: String },

	#[error("script failed: {0}")]
	#[diagnostic(code(dynmacro::script))]
	Script(String),

	#[error("failed to render stage {stage} of macro `{name}`: {reason}")]
	#[diagnostic(code(dynmacro::template_render))]
	TemplateRender {
		name: String,
		stage: usize,
		reason: String,
	},

	#[error("unknown cluster: `{0}`")]
	#[diagnostic(
		code(dynmacro::unknown_cluster),
		help("clusters are declared under `[clusters.<name>]` in dynmacro.toml")
	)]
	UnknownCluster(String),

	#[error("unknown macro: `{0}`")]
	#[diagnostic(code(dynmacro::unknown_macro))]
	UnknownMacro(String),

	#[error("macro `{0}` has no delayed schedule")]
	#[diagnostic(
		code(dynmacro::not_delayed),
		help("set `initial_duration` or use a `[delayed_gcode]` section")
	)]
	NotDelayed(String),

	#[error("missing required parameter `{0}`")]
	#[diagnostic(code(dynmacro::missing_parameter))]
	MissingParameter(String),

	#[error("invalid value for parameter `{name}`: {reason}")]
	#[diagnostic(code(dynmacro::invalid_parameter))]
	InvalidParameter { name: String, reason: String },

	#[error("command nesting exceeded {0} levels")]
	#[diagnostic(
		code(dynmacro::recursion_limit),
		help("a macro is probably invoking itself")
	)]
	RecursionLimit(usize),

	#[error("host rejected command: {0}")]
	#[diagnostic(code(dynmacro::host))]
	Host(String),
}

pub type DynMacroResult<T> = Result<T, DynMacroError>;
pub type AnyError = Box<dyn std::error::Error>;
pub type AnyEmptyResult = Result<(), AnyError>;
pub type AnyResult<T> = Result<T, AnyError>;
