use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_RUNNER_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identity of a runner.
///
/// Used as the owner marker carried by a context while work runs on the owner.
/// Ids are never reused within a process, so a marker from a dropped runner can
/// never be mistaken for a live one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RunnerId(u64);

impl RunnerId {
    /// Allocate the next unused id.
    #[must_use]
    pub fn next() -> Self {
        Self(NEXT_RUNNER_ID.fetch_add(1, Ordering::Relaxed))
    }

    #[must_use]
    pub fn value(self) -> u64 {
        self.0
    }
}

impl fmt::Display for RunnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "runner#{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::RunnerId;

    #[test]
    fn ids_are_unique_and_increasing() {
        let a = RunnerId::next();
        let b = RunnerId::next();
        assert_ne!(a, b);
        assert!(b.value() > a.value());
    }

    #[test]
    fn display_includes_value() {
        let id = RunnerId::next();
        assert_eq!(id.to_string(), format!("runner#{}", id.value()));
    }
}
