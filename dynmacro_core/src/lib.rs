//! `dynmacro_core` is the engine behind [dynmacro](https://github.com/ifiokjr/dynmacro): user-defined, text-templated command macros that a command-processing host (such as a printer firmware host running G-code style commands) loads from configuration, registers as live commands and replaces at runtime without restarting.
//!
//! ## Processing Pipeline
//!
//! ```text
//! Configuration files
//!   → ConfigLoader (comment stripping, recursive [include <glob>] expansion, cycle detection)
//!   → parse_sections (host section / key-value format)
//!   → MacroCompiler (body normalization, stage splitting, minijinja compilation)
//!   → MacroRegistry (claims host commands, tracks renames, arms timers)
//!   → MacroEngine (routes command lines, runs stages, fires delayed macros)
//! ```
//!
//! ## Modules
//!
//! - [`config`]: Macro configuration loading: includes, comments and sections.
//! - [`settings`]: Engine settings loaded from `dynmacro.toml`.
//! - [`literal`]: The restricted literal parser used for variables.
//! - [`scheduler`]: Timer abstraction and the schedule of self-scheduling macros.
//!
//! ## Key Types
//!
//! - [`MacroEngine`]: The façade a host embeds. Handles `RUN_MACRO`, `SET_VARIABLE`, `RENDER_MACRO`, `UPDATE_DELAYED` and `RELOAD_MACROS`.
//! - [`MacroDefinition`]: A compiled macro: ordered stages, variables and an optional schedule.
//! - [`MacroRegistry`]: The live macros of one namespace.
//! - [`ClusterDirectory`]: Isolated namespaces with their own [`Capabilities`].
//! - [`Host`]: What the engine needs from its host. [`SimulatedHost`] is an in-memory implementation.
//!
//! ## Macro Configuration
//!
//! ```ini
//! [gcode_macro GREET]
//! description: Say hello
//! variable_count: 0
//! gcode:
//!   {{ update("count", count + 1) }}
//!   RESPOND MSG="hello {{ params.NAME }}"
//!
//!
//!   RESPOND MSG="greeted {{ count }} times"
//!
//! [include macros/*.cfg]
//! ```
//!
//! Two blank lines separate stages. Each stage is rendered right before it
//! runs, so the second stage above sees the updated `count`.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use dynmacro_core::MacroEngine;
//! use dynmacro_core::SimulatedHost;
//!
//! let mut host = SimulatedHost::new();
//! let mut engine = MacroEngine::load(".").unwrap();
//!
//! let summary = engine.start(&mut host).unwrap();
//! for error in summary.errors() {
//!     eprintln!("{error}");
//! }
//!
//! engine.on_ready(&mut host);
//! engine.run_command(&mut host, "GREET NAME=Ada");
//! ```

pub use cluster::*;
pub use command::*;
pub use compiler::*;
pub use config::*;
pub use definition::*;
pub use engine::*;
pub use error::*;
pub use host::*;
pub use literal::*;
pub use registry::*;
pub use scheduler::*;
pub use script::*;
pub use settings::*;
pub use stage::*;
pub use variables::*;

mod cluster;
mod command;
mod compiler;
pub mod config;
mod definition;
mod engine;
#[allow(unused_assignments)]
mod error;
mod host;
pub mod literal;
mod registry;
pub mod scheduler;
mod script;
pub mod settings;
mod stage;
mod variables;

#[cfg(test)]
mod __fixtures;
#[cfg(test)]
mod __tests;
