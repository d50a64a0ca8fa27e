//! CLI module for rlm-engine - command-line interface and subcommands.
//!
//! Provides the main entry point with subcommands for querying documents,
//! sandbox sub-queries and domain detection.

pub mod commands;

pub use commands::Cli;
