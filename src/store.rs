//! Project-local persistence: `.handoff/session.json` and
//! `.handoff/RESUME.md`.
//!
//! The only state this tool ever writes. Reloading re-runs the schema gate
//! so a hand-edited or stale file cannot flow into the pipeline unchecked.

use std::path::{Path, PathBuf};

use anyhow::Context;
use tracing::info;

use crate::error::HandoffError;
use crate::model::CanonicalSession;
use crate::validate::validate_session;

pub const HANDOFF_DIR: &str = ".handoff";
pub const SESSION_FILE: &str = "session.json";
pub const RESUME_FILE: &str = "RESUME.md";

pub fn handoff_dir(project: &Path) -> PathBuf {
    project.join(HANDOFF_DIR)
}

/// Write the canonical session as pretty-printed JSON. Returns the path.
pub fn save_session(project: &Path, session: &CanonicalSession) -> anyhow::Result<PathBuf> {
    let dir = handoff_dir(project);
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("failed to create {}", dir.display()))?;
    let path = dir.join(SESSION_FILE);
    let json = serde_json::to_string_pretty(session)?;
    std::fs::write(&path, json)
        .with_context(|| format!("failed to write {}", path.display()))?;
    info!(path = %path.display(), "session persisted");
    Ok(path)
}

/// Reload a persisted session, re-validating before returning it.
pub fn load_session(path: &Path) -> anyhow::Result<CanonicalSession> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let session: CanonicalSession = serde_json::from_str(&raw).map_err(|e| {
        anyhow::Error::from(HandoffError::Malformed {
            source_name: "session-file".to_string(),
            detail: format!("{}: {e}", path.display()),
        })
    })?;
    validate_session(&session)?;
    Ok(session)
}

/// Write the resume document. Returns the path.
pub fn save_resume(project: &Path, document: &str) -> anyhow::Result<PathBuf> {
    let dir = handoff_dir(project);
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("failed to create {}", dir.display()))?;
    let path = dir.join(RESUME_FILE);
    std::fs::write(&path, document)
        .with_context(|| format!("failed to write {}", path.display()))?;
    info!(path = %path.display(), "resume document written");
    Ok(path)
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::model::{Conversation, ProjectContext, TaskState};

    fn session() -> CanonicalSession {
        CanonicalSession {
            schema_version: crate::model::SCHEMA_VERSION.to_string(),
            source: "droid".to_string(),
            captured_at: Utc::now(),
            session_id: "round-trip".to_string(),
            session_started_at: None,
            project: ProjectContext::bare(PathBuf::from("/tmp/p")),
            conversation: Conversation {
                message_count: 0,
                estimated_tokens: 0,
                messages: vec![],
            },
            files_changed: vec![],
            decisions: vec![],
            blockers: vec![],
            task: TaskState::unknown(),
            tool_activity: None,
        }
    }

    #[test]
    fn save_and_reload_round_trips() {
        let tmp = tempfile::TempDir::new().unwrap();
        let original = session();
        let path = save_session(tmp.path(), &original).unwrap();
        assert!(path.ends_with(".handoff/session.json"));

        let reloaded = load_session(&path).unwrap();
        assert_eq!(original, reloaded);
    }

    #[test]
    fn persisted_json_uses_schema_field_names() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = save_session(tmp.path(), &session()).unwrap();
        let raw = std::fs::read_to_string(&path).unwrap();
        assert!(raw.contains("\"schemaVersion\""));
        assert!(raw.contains("\"sessionId\""));
        assert!(raw.contains("\"messageCount\""));
    }

    #[test]
    fn tampered_session_fails_validation_on_reload() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = save_session(tmp.path(), &session()).unwrap();
        let raw = std::fs::read_to_string(&path).unwrap();
        let tampered = raw.replace("\"messageCount\": 0", "\"messageCount\": 9");
        std::fs::write(&path, tampered).unwrap();
        assert!(load_session(&path).is_err());
    }

    #[test]
    fn unparseable_session_is_malformed() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("session.json");
        std::fs::write(&path, "{ nope").unwrap();
        let err = load_session(&path).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<HandoffError>().unwrap(),
            HandoffError::Malformed { .. }
        ));
    }
}
