//! Command-line interface for jobforge.
//!
//! Provides the worker entry point and one-shot operator commands for
//! submitting items, inspecting the queue and resetting budgets.

mod commands;

pub use commands::{parse_cli, run, run_with_cli, Cli, Commands};
