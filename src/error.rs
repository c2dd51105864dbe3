//! Actionable typed errors for handoff.
//!
//! Each surfaced variant includes enough context for the user to understand
//! what went wrong and what to do next. Internal propagation uses `anyhow`;
//! the public API exposes these `thiserror` types.
//!
//! Only three kinds ever escape an adapter: not-found, malformed, locked.
//! Per-line/per-row parse failures (Transient) are logged at debug and
//! skipped; absent subprocesses (Unavailable) silently degrade the affected
//! field.

use std::path::PathBuf;

/// Errors that handoff surfaces to the user.
#[derive(Debug, thiserror::Error)]
pub enum HandoffError {
    /// Session ID not found, or a source/project has no sessions at all.
    #[error("Session '{session_id}' not found for {source_name}. Run 'handoff list' to see recent sessions.")]
    SessionNotFound { source_name: String, session_id: String },

    /// Storage exists but its bytes violate the expected format beyond
    /// per-line tolerance; canonical-schema validation failures land here too.
    #[error("Malformed {source_name} session data: {detail}")]
    Malformed { source_name: String, detail: String },

    /// Underlying store cannot be opened read-only (typically held by a
    /// running assistant).
    #[error(
        "{source_name} storage at {} is locked. Close the {source_name} application and retry.",
        path.display()
    )]
    StoreLocked { source_name: String, path: PathBuf },

    /// No registered source is installed on this host.
    #[error("No AI coding agents detected on this machine. Run 'handoff detect' for per-source status.")]
    NoAgentsDetected,

    /// Unknown source slug in CLI input.
    #[error("Unknown source '{slug}'. Known sources: {}", known.join(", "))]
    UnknownSource { slug: String, known: Vec<String> },

    /// Canonical session failed the schema gate.
    #[error("Session validation failed: {}", errors.join("; "))]
    Validation { errors: Vec<String> },
}

/// Which CLI phase an error escaped from. Not-found is the one kind whose
/// exit code depends on it: a listing that found nothing is an enumeration
/// failure (exit 2), while a missing id during capture/handoff/resume is a
/// capture error (exit 3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorContext {
    Enumeration,
    Capture,
}

impl HandoffError {
    /// CLI exit code mapping: 1 detection/unknown-source, 2 enumeration
    /// failed, 3 capture/parse/resume error.
    pub fn exit_code(&self, context: ErrorContext) -> u8 {
        match self {
            HandoffError::NoAgentsDetected | HandoffError::UnknownSource { .. } => 1,
            HandoffError::SessionNotFound { .. } => match context {
                ErrorContext::Enumeration => 2,
                ErrorContext::Capture => 3,
            },
            HandoffError::Malformed { .. }
            | HandoffError::StoreLocked { .. }
            | HandoffError::Validation { .. } => 3,
        }
    }
}
