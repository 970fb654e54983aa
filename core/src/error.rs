//! Runner error taxonomy.

use crate::context::CancelCause;

/// Coarse classification of a [`RunnerError`], for callers that only branch on the kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RunnerErrorKind {
    Closed,
    ScheduleRejected,
    Canceled,
    Panicked,
    Abandoned,
}

/// Failure of a runner operation.
///
/// The runner never retries; every variant is returned to the immediate caller.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RunnerError {
    /// The runner was shut down before the operation started.
    #[error("runner '{runner}' is closed ({op})")]
    Closed { runner: String, op: String },
    /// The scheduler declined the work item.
    #[error("runner '{runner}': scheduler rejected '{op}'")]
    ScheduleRejected { runner: String, op: String },
    /// The caller's context ended before a result arrived.
    ///
    /// The work item may still run to completion on the owner; its result is discarded.
    #[error("runner '{runner}': '{op}' canceled: {cause}")]
    Canceled {
        runner: String,
        op: String,
        #[source]
        cause: CancelCause,
    },
    /// The work item panicked and panic recovery is enabled.
    #[error("runner '{runner}': '{op}' panicked: {message}")]
    Panicked {
        runner: String,
        op: String,
        message: String,
    },
    /// The work item was accepted but dropped before it produced a result.
    #[error("runner '{runner}': '{op}' was dropped before producing a result")]
    Abandoned { runner: String, op: String },
}

impl RunnerError {
    #[must_use]
    pub fn kind(&self) -> RunnerErrorKind {
        match self {
            Self::Closed { .. } => RunnerErrorKind::Closed,
            Self::ScheduleRejected { .. } => RunnerErrorKind::ScheduleRejected,
            Self::Canceled { .. } => RunnerErrorKind::Canceled,
            Self::Panicked { .. } => RunnerErrorKind::Panicked,
            Self::Abandoned { .. } => RunnerErrorKind::Abandoned,
        }
    }

    #[must_use]
    pub fn runner(&self) -> &str {
        match self {
            Self::Closed { runner, .. }
            | Self::ScheduleRejected { runner, .. }
            | Self::Canceled { runner, .. }
            | Self::Panicked { runner, .. }
            | Self::Abandoned { runner, .. } => runner,
        }
    }

    /// Operation label supplied by the caller.
    #[must_use]
    pub fn op(&self) -> &str {
        match self {
            Self::Closed { op, .. }
            | Self::ScheduleRejected { op, .. }
            | Self::Canceled { op, .. }
            | Self::Panicked { op, .. }
            | Self::Abandoned { op, .. } => op,
        }
    }

    #[must_use]
    pub fn cancel_cause(&self) -> Option<CancelCause> {
        match self {
            Self::Canceled { cause, .. } => Some(*cause),
            _ => None,
        }
    }
}
