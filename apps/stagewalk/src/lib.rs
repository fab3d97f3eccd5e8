//! # Stagewalk Application Library
//!
//! The pieces of the `stagewalk` binary, exposed for integration tests:
//!
//! - [`api`] - axum router, handlers, and auth/rate-limit middleware
//! - [`cli`] - clap commands
//! - [`config`] - TOML sequence files and the [`config::Blueprint`] built from them
//! - [`hooks`] - built-in lifecycle hooks referenced by name from sequence files

pub mod api;
pub mod cli;
pub mod config;
pub mod hooks;
