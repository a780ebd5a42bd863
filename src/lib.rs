#![warn(clippy::all, clippy::pedantic)]
#![allow(
    clippy::doc_markdown,
    clippy::field_reassign_with_default,
    clippy::items_after_statements,
    clippy::map_unwrap_or,
    clippy::manual_let_else,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::needless_pass_by_value,
    clippy::needless_raw_string_hashes,
    clippy::redundant_closure_for_method_calls,
    clippy::return_self_not_must_use,
    clippy::similar_names,
    clippy::single_match_else,
    clippy::struct_field_names,
    clippy::too_many_lines,
    clippy::uninlined_format_args,
    clippy::unnecessary_literal_bound,
    clippy::unused_self
)]

use clap::Subcommand;

pub mod assistant;
pub mod channels;
pub mod config;
pub mod gateway;
pub mod markdown;
pub mod relay;
pub mod store;
pub mod util;

pub use config::Config;

/// Thread-topic store maintenance subcommands
#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum TopicCommands {
    /// Print the assistant topic stored for a thread
    Get {
        /// Slack channel id (e.g. C0123456789)
        channel: String,
        /// Timestamp of the thread's root message
        thread_ts: String,
    },
    /// Delete expired thread → topic mappings
    Purge,
}

/// Config subcommands
#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum ConfigCommands {
    /// Dump the full configuration JSON Schema to stdout
    Schema,
}
