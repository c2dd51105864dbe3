//! GitHub Copilot CLI adapter — one JSON state document per session under
//! `~/.copilot/history-session-state/`.
//!
//! Session files: `<storage>/<session-id>.state.json`
//!
//! ## Document format
//!
//! ```json
//! {
//!   "sessionId": "…",
//!   "startTime": "…",
//!   "timestamp": "…",
//!   "cwd": "/path",
//!   "chatMessages": [ {"role", "content", "timestamp", "id"?, "usage"?}, … ]
//! }
//! ```
//!
//! `content` is a plain string or a content-block array; tool traffic uses
//! the same block shapes as the stream sources.

use std::path::{Path, PathBuf};

use anyhow::Context;
use tracing::{debug, trace};

use crate::adapters::stream::MessageCollector;
use crate::adapters::{AgentAdapter, SessionInfo, assemble_session, sort_by_recency};
use crate::error::HandoffError;
use crate::model::{CanonicalSession, flatten_content, normalize_role, parse_timestamp, truncate_chars};
use crate::paths::{OsFamily, resolve_storage_root};
use crate::registry;

/// Copilot CLI adapter implementation.
pub struct Copilot;

const SLUG: &str = "copilot";

const STATE_SUFFIX: &str = ".state.json";

impl Copilot {
    fn storage_root() -> Option<PathBuf> {
        let spec = registry::spec_for(SLUG)?;
        resolve_storage_root(
            spec.env_override,
            spec.storage_template(OsFamily::current()),
        )
    }

    fn state_files() -> Vec<PathBuf> {
        let Some(root) = Self::storage_root() else {
            return Vec::new();
        };
        let Ok(entries) = std::fs::read_dir(&root) else {
            return Vec::new();
        };
        entries
            .flatten()
            .map(|e| e.path())
            .filter(|p| {
                p.file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.ends_with(STATE_SUFFIX))
            })
            .collect()
    }

    fn session_id_of(path: &Path) -> String {
        path.file_name()
            .and_then(|n| n.to_str())
            .and_then(|n| n.strip_suffix(STATE_SUFFIX))
            .unwrap_or("unknown")
            .to_string()
    }

    fn load(path: &Path) -> anyhow::Result<serde_json::Value> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        serde_json::from_str(&raw).map_err(|e| {
            HandoffError::Malformed {
                source_name: SLUG.to_string(),
                detail: format!("{}: {e}", path.display()),
            }
            .into()
        })
    }

    fn summarize(path: &Path) -> anyhow::Result<SessionInfo> {
        let doc = Self::load(path)?;
        let messages = doc
            .get("chatMessages")
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default();

        let preview = messages
            .iter()
            .find(|m| m.get("role").and_then(|v| v.as_str()) == Some("user"))
            .and_then(|m| m.get("content"))
            .map(flatten_content)
            .map(|t| truncate_chars(t.trim().lines().next().unwrap_or(""), 200))
            .unwrap_or_default();

        Ok(SessionInfo {
            id: doc
                .get("sessionId")
                .and_then(|v| v.as_str())
                .map(String::from)
                .unwrap_or_else(|| Self::session_id_of(path)),
            started_at: doc.get("startTime").and_then(parse_timestamp),
            last_active_at: doc.get("timestamp").and_then(parse_timestamp),
            message_count: messages.len(),
            project_path: doc
                .get("cwd")
                .and_then(|v| v.as_str())
                .map(PathBuf::from),
            preview,
        })
    }
}

impl AgentAdapter for Copilot {
    fn slug(&self) -> &'static str {
        SLUG
    }

    fn display_name(&self) -> &'static str {
        "GitHub Copilot CLI"
    }

    fn detect(&self) -> bool {
        Self::storage_root().is_some_and(|root| root.is_dir())
            || which::which("copilot").is_ok()
    }

    fn list_sessions(&self, project_path: Option<&Path>) -> anyhow::Result<Vec<SessionInfo>> {
        let mut sessions = Vec::new();
        for path in Self::state_files() {
            match Self::summarize(&path) {
                Ok(info) => {
                    if let Some(filter) = project_path
                        && info.project_path.as_deref() != Some(filter)
                    {
                        continue;
                    }
                    sessions.push(info);
                }
                Err(e) => {
                    debug!(path = %path.display(), error = %e, "skipping unreadable state file");
                }
            }
        }
        sort_by_recency(&mut sessions);
        Ok(sessions)
    }

    fn capture(&self, session_id: &str) -> anyhow::Result<CanonicalSession> {
        if session_id.is_empty() || session_id.contains(['/', '\\']) {
            return Err(HandoffError::Malformed {
                source_name: SLUG.to_string(),
                detail: format!("invalid session id '{session_id}'"),
            }
            .into());
        }

        let path = Self::storage_root()
            .map(|root| root.join(format!("{session_id}{STATE_SUFFIX}")))
            .filter(|p| p.is_file())
            .ok_or_else(|| HandoffError::SessionNotFound {
                source_name: SLUG.to_string(),
                session_id: session_id.to_string(),
            })?;

        let doc = Self::load(&path)?;
        let mut collector = MessageCollector::new();
        collector.note_project_path(doc.get("cwd"));

        for message in doc
            .get("chatMessages")
            .and_then(|v| v.as_array())
            .into_iter()
            .flatten()
        {
            let id = message.get("id").and_then(|v| v.as_str());
            if collector.is_duplicate(id) {
                trace!("duplicate chat message id");
                continue;
            }
            collector.add_usage(message.get("usage"));

            let role = message
                .get("role")
                .map(normalize_role)
                .unwrap_or(crate::model::MessageRole::Assistant);
            let timestamp = message.get("timestamp").and_then(parse_timestamp);
            if let Some(content) = message.get("content") {
                collector.push_content(role, content, timestamp);
            }
        }

        let collected = collector.finish();
        assemble_session(
            SLUG,
            session_id.to_string(),
            collected.project_path,
            collected.messages,
            collected.files_changed,
            collected.estimated_tokens,
        )
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::sync::{LazyLock, Mutex, MutexGuard};

    use super::*;
    use crate::model::MessageRole;

    static ENV_LOCK: LazyLock<Mutex<()>> = LazyLock::new(|| Mutex::new(()));

    struct StorageFixture {
        _guard: MutexGuard<'static, ()>,
        tmp: tempfile::TempDir,
    }

    impl StorageFixture {
        fn new() -> Self {
            let guard = ENV_LOCK.lock().unwrap();
            let tmp = tempfile::TempDir::new().unwrap();
            unsafe { std::env::set_var("COPILOT_HOME", tmp.path()) };
            StorageFixture { _guard: guard, tmp }
        }

        fn add_state(&self, session_id: &str, doc: &serde_json::Value) {
            fs::write(
                self.tmp
                    .path()
                    .join(format!("{session_id}{STATE_SUFFIX}")),
                doc.to_string(),
            )
            .unwrap();
        }
    }

    impl Drop for StorageFixture {
        fn drop(&mut self) {
            unsafe { std::env::remove_var("COPILOT_HOME") };
        }
    }

    fn state_doc(id: &str) -> serde_json::Value {
        serde_json::json!({
            "sessionId": id,
            "startTime": "2026-05-01T08:00:00Z",
            "timestamp": "2026-05-01T08:30:00Z",
            "cwd": "/home/dev/site",
            "chatMessages": [
                {"role": "user", "content": "Wire up the newsletter signup form", "timestamp": "2026-05-01T08:00:01Z", "id": "m1"},
                {"role": "assistant", "content": [{"type": "text", "text": "Adding the endpoint."}], "timestamp": "2026-05-01T08:00:20Z", "id": "m2",
                 "usage": {"prompt_tokens": 200, "completion_tokens": 80}},
            ],
        })
    }

    #[test]
    fn capture_state_document() {
        let fx = StorageFixture::new();
        fx.add_state("cp-1", &state_doc("cp-1"));

        let session = Copilot.capture("cp-1").unwrap();
        assert_eq!(session.source, "copilot");
        assert_eq!(session.conversation.message_count, 2);
        assert_eq!(session.conversation.estimated_tokens, 280);
        assert_eq!(session.project.path, PathBuf::from("/home/dev/site"));
        assert_eq!(session.conversation.messages[0].role, MessageRole::User);
    }

    #[test]
    fn corrupt_document_is_malformed() {
        let fx = StorageFixture::new();
        fs::write(fx.tmp.path().join("bad.state.json"), "{ not json").unwrap();

        let err = Copilot.capture("bad").unwrap_err();
        assert!(matches!(
            err.downcast_ref::<HandoffError>().unwrap(),
            HandoffError::Malformed { .. }
        ));
    }

    #[test]
    fn listing_skips_corrupt_documents() {
        let fx = StorageFixture::new();
        fx.add_state("good", &state_doc("good"));
        fs::write(fx.tmp.path().join("bad.state.json"), "{ not json").unwrap();

        let sessions = Copilot.list_sessions(None).unwrap();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].id, "good");
        assert!(sessions[0].preview.starts_with("Wire up"));
    }

    #[test]
    fn missing_session_not_found() {
        let _fx = StorageFixture::new();
        let err = Copilot.capture("absent").unwrap_err();
        assert!(matches!(
            err.downcast_ref::<HandoffError>().unwrap(),
            HandoffError::SessionNotFound { .. }
        ));
    }
}
