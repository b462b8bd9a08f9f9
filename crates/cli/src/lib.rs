//! Command-line interface for wxindex.
//!
//! This crate wires the `.keys` parser, configuration and logging to the
//! table registry and exposes its queries as subcommands.

#![deny(missing_docs, unsafe_code)]

/// CLI command definitions and parsing.
pub mod commands;

/// CLI application entry point and configuration.
pub mod app;

/// Error types for CLI operations.
pub mod error;

/// `.keys` file parsing.
pub mod keys;
