//! Error taxonomy for qvm.
//!
//! Internal plumbing propagates `anyhow::Error` with context, the same way the
//! rest of the crate does. Failures that the caller must be able to tell apart
//! are raised as a [`QvmError`] variant and recovered at the top level with
//! [`exit_code`] to pick the process exit status.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum QvmError {
    /// Invalid or conflicting user input (sync mode, duplicate forward, ...).
    #[error("configuration error: {0}")]
    Config(String),

    /// Unknown guest OS or unsupported architecture for that OS.
    #[error("profile error: {0}")]
    Profile(String),

    /// No free port within the scan bound, or an explicit port is unusable.
    #[error("resource error: {0}")]
    Resource(String),

    /// Guest disk image missing or unreadable.
    #[error("image error: {0}")]
    Image(String),

    /// Hypervisor failed to start or exited immediately.
    #[error("process error: {0}")]
    Process(String),

    /// SSH readiness probe exceeded its deadline.
    #[error("network error: {0}")]
    Network(String),

    /// Web console relay could not reach the guest display endpoint.
    #[error("bridge error: {0}")]
    Bridge(String),
}

impl QvmError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn profile(msg: impl Into<String>) -> Self {
        Self::Profile(msg.into())
    }

    pub fn resource(msg: impl Into<String>) -> Self {
        Self::Resource(msg.into())
    }

    pub fn image(msg: impl Into<String>) -> Self {
        Self::Image(msg.into())
    }

    pub fn process(msg: impl Into<String>) -> Self {
        Self::Process(msg.into())
    }

    pub fn network(msg: impl Into<String>) -> Self {
        Self::Network(msg.into())
    }

    pub fn bridge(msg: impl Into<String>) -> Self {
        Self::Bridge(msg.into())
    }

    /// Process exit status for this error class.
    pub fn exit_code(&self) -> i32 {
        match self {
            QvmError::Config(_) => 2,
            QvmError::Profile(_) => 3,
            QvmError::Resource(_) => 4,
            QvmError::Image(_) => 5,
            QvmError::Process(_) => 6,
            QvmError::Network(_) => 7,
            QvmError::Bridge(_) => 8,
        }
    }
}

/// Find the typed error anywhere in an anyhow chain.
pub fn classify(err: &anyhow::Error) -> Option<&QvmError> {
    err.chain().find_map(|cause| cause.downcast_ref::<QvmError>())
}

/// Exit status for an arbitrary error: typed errors map to their class,
/// everything else is a generic failure.
pub fn exit_code(err: &anyhow::Error) -> i32 {
    classify(err).map(QvmError::exit_code).unwrap_or(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn test_exit_codes_are_distinct() {
        let errors = [
            QvmError::config("x"),
            QvmError::profile("x"),
            QvmError::resource("x"),
            QvmError::image("x"),
            QvmError::process("x"),
            QvmError::network("x"),
            QvmError::bridge("x"),
        ];
        let mut codes: Vec<i32> = errors.iter().map(QvmError::exit_code).collect();
        codes.sort();
        codes.dedup();
        assert_eq!(codes.len(), errors.len());
        assert!(codes.iter().all(|c| *c > 1));
    }

    #[test]
    fn test_classify_through_context() {
        let err: anyhow::Result<()> = Err(QvmError::network("ssh probe timed out").into());
        let err = err.context("waiting for guest").unwrap_err();
        assert!(matches!(classify(&err), Some(QvmError::Network(_))));
        assert_eq!(exit_code(&err), 7);
    }

    #[test]
    fn test_untyped_error_is_generic_failure() {
        let err = anyhow::anyhow!("something else");
        assert!(classify(&err).is_none());
        assert_eq!(exit_code(&err), 1);
    }
}
