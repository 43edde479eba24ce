//! Error Taxonomy
//!
//! Classifies the failure modes of the mutation pipeline. Expected
//! conditions (lock held, missing backup, old-value not found) are
//! modeled as ordinary return values in their owning modules; this enum
//! carries the classification where a typed error crosses a boundary or
//! needs to be formatted for an audit record or alert.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    /// Unsafe generated code or a sandbox violation. Fatal to the single
    /// operation, never auto-retried, always audit-logged.
    #[error("security rejection: {0}")]
    SecurityRejection(String),

    /// A precondition failed before any mutation happened.
    #[error("validation failure: {0}")]
    ValidationFailure(String),

    /// An external tool (commit, restart) failed after the content
    /// mutation already happened. Non-fatal to the cycle.
    #[error("tool failure: {0}")]
    ToolFailure(String),

    /// The cross-invocation update lock is held. A normal skip.
    #[error("update lock held by another invocation")]
    ConcurrencyGuard,

    /// A remote fetch/pull failed. The scheduler's next trigger is the
    /// retry mechanism; there is no internal retry loop.
    #[error("transient i/o failure: {0}")]
    TransientIo(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_messages() {
        let e = CoreError::SecurityRejection("code reads ~/.ssh/id_rsa".into());
        assert!(e.to_string().starts_with("security rejection"));
        assert_eq!(
            CoreError::ConcurrencyGuard.to_string(),
            "update lock held by another invocation"
        );
    }
}
