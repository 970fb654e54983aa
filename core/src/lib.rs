//! Single-owner resource runner.
//!
//! Some resources (embedded scripting engines, database handles opened
//! without a mutex) must only be touched by one execution context at a time.
//! This crate lets many callers drive such a resource safely:
//!
//! - **`context`**: deadlines, cancellation, and the owner marker used to
//!   detect re-entrant calls
//! - **`scheduler`**: the submission seam to the owner loop, plus a FIFO
//!   queue implementation
//! - **`runner`**: call / post / shutdown over a resource and a scheduler
//! - **`registry`**: explicit name → capability map for host setup

// Pedantic lint configuration - these are intentional design choices
#![allow(clippy::missing_errors_doc)] // Result-returning functions are self-explanatory

pub mod context;
pub mod error;
pub mod registry;
pub mod runner;
pub mod scheduler;

pub use context::{CancelCause, CancelToken, Context};
pub use error::{RunnerError, RunnerErrorKind};
pub use registry::{Registry, RegistryError};
pub use runner::{Runner, WeakRunner};
pub use scheduler::{Job, JobQueue, QueueScheduler, Scheduler};
pub use tether_types::{RunnerConfig, RunnerConfigError, RunnerId};
