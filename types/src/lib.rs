//! Core domain types for tether.
//!
//! This crate contains pure domain types with no IO, no async, and minimal dependencies.
//! The runner, the config loader and the CLI all build on these.

// Pedantic lint configuration - these are intentional design choices
#![allow(clippy::missing_errors_doc)] // Result-returning functions are self-explanatory

mod config;
mod ids;

pub use config::{RunnerConfig, RunnerConfigError};
pub use ids::RunnerId;
