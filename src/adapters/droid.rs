//! Factory Droid adapter — typed-entry JSONL sessions under
//! `~/.factory/sessions/`.
//!
//! Session files: `<storage>/<session-id>.jsonl`
//!
//! ## JSONL format
//!
//! Each line has a `type` discriminator:
//! - `"session"` — header with `id`, `timestamp`, `cwd`, `title`
//! - `"message"` — conversation entry wrapping a nested `message` object
//!   (`role`, `content` as string or typed blocks, optional `usage`)
//! - `"tool_call"` / `"tool_result"` — standalone tool traffic
//! - anything else — skipped
//!
//! Content blocks use the `toolCall` spelling for embedded invocations.

use std::path::{Path, PathBuf};

use anyhow::Context;
use tracing::{debug, trace};

use crate::adapters::stream::{MessageCollector, for_each_json_line};
use crate::adapters::{AgentAdapter, SessionInfo, assemble_session, sort_by_recency};
use crate::error::HandoffError;
use crate::model::{CanonicalSession, flatten_content, normalize_role, parse_timestamp, truncate_chars};
use crate::paths::{OsFamily, resolve_storage_root};
use crate::registry;

/// Factory Droid adapter implementation.
pub struct Droid;

const SLUG: &str = "droid";

impl Droid {
    fn storage_root() -> Option<PathBuf> {
        let spec = registry::spec_for(SLUG)?;
        resolve_storage_root(
            spec.env_override,
            spec.storage_template(OsFamily::current()),
        )
    }

    fn session_files() -> Vec<PathBuf> {
        let Some(root) = Self::storage_root() else {
            return Vec::new();
        };
        let Ok(entries) = std::fs::read_dir(&root) else {
            return Vec::new();
        };
        entries
            .flatten()
            .map(|e| e.path())
            .filter(|p| p.extension().and_then(|e| e.to_str()) == Some("jsonl"))
            .collect()
    }

    fn summarize(path: &Path) -> anyhow::Result<SessionInfo> {
        let mut id = None;
        let mut project_path = None;
        let mut message_count = 0usize;
        let mut first_ts = None;
        let mut last_ts = None;
        let mut preview = String::new();

        for_each_json_line(path, |entry| {
            let value = &entry.value;
            if let Some(ts) = value.get("timestamp").and_then(parse_timestamp) {
                first_ts.get_or_insert(ts);
                last_ts = Some(ts);
            }
            match value.get("type").and_then(|v| v.as_str()) {
                Some("session") => {
                    id = value.get("id").and_then(|v| v.as_str()).map(String::from);
                    project_path = value
                        .get("cwd")
                        .and_then(|v| v.as_str())
                        .map(PathBuf::from);
                    if let Some(title) = value.get("title").and_then(|v| v.as_str()) {
                        preview = truncate_chars(title, 200);
                    }
                }
                Some("message") => {
                    message_count += 1;
                    if preview.is_empty()
                        && value.pointer("/message/role").and_then(|v| v.as_str())
                            == Some("user")
                        && let Some(content) = value.pointer("/message/content")
                    {
                        let text = flatten_content(content);
                        preview = truncate_chars(text.trim().lines().next().unwrap_or(""), 200);
                    }
                }
                _ => {}
            }
        })?;

        Ok(SessionInfo {
            id: id.unwrap_or_else(|| {
                path.file_stem()
                    .and_then(|s| s.to_str())
                    .unwrap_or("unknown")
                    .to_string()
            }),
            started_at: first_ts,
            last_active_at: last_ts,
            message_count,
            project_path,
            preview,
        })
    }
}

impl AgentAdapter for Droid {
    fn slug(&self) -> &'static str {
        SLUG
    }

    fn display_name(&self) -> &'static str {
        "Factory Droid"
    }

    fn detect(&self) -> bool {
        Self::storage_root().is_some_and(|root| root.is_dir()) || which::which("droid").is_ok()
    }

    fn list_sessions(&self, project_path: Option<&Path>) -> anyhow::Result<Vec<SessionInfo>> {
        let mut sessions = Vec::new();
        for path in Self::session_files() {
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
                    debug!(path = %path.display(), error = %e, "skipping unreadable session");
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
            .map(|root| root.join(format!("{session_id}.jsonl")))
            .filter(|p| p.is_file())
            .ok_or_else(|| HandoffError::SessionNotFound {
                source_name: SLUG.to_string(),
                session_id: session_id.to_string(),
            })?;

        let mut collector = MessageCollector::new();

        for_each_json_line(&path, |entry| {
            let value = &entry.value;
            let timestamp = value.get("timestamp").and_then(parse_timestamp);

            match value.get("type").and_then(|v| v.as_str()) {
                Some("session") => {
                    collector.note_project_path(value.get("cwd"));
                }
                Some("message") => {
                    let id = value.get("id").and_then(|v| v.as_str());
                    if collector.is_duplicate(id) {
                        trace!(line = entry.line_number, "duplicate message id");
                        return;
                    }
                    collector.add_usage(value.pointer("/message/usage"));

                    let role = value
                        .pointer("/message/role")
                        .map(normalize_role)
                        .unwrap_or(crate::model::MessageRole::Assistant);
                    if let Some(content) = value.pointer("/message/content") {
                        collector.push_content(role, content, timestamp);
                    }
                }
                Some("tool_call") => {
                    let name = value
                        .get("name")
                        .and_then(|v| v.as_str())
                        .unwrap_or("unknown")
                        .to_string();
                    let args = value
                        .get("arguments")
                        .cloned()
                        .unwrap_or(serde_json::Value::Null);
                    collector.push_tool_use(&name, &args, timestamp);
                }
                Some("tool_result") => {
                    let name = value.get("name").and_then(|v| v.as_str());
                    let body = value
                        .get("output")
                        .or_else(|| value.get("content"))
                        .map(flatten_content)
                        .unwrap_or_default();
                    collector.push_tool_result(name, &body, timestamp);
                }
                _ => {
                    trace!(line = entry.line_number, "skipping entry type");
                }
            }
        })
        .with_context(|| format!("failed to read {}", path.display()))?;

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
    use crate::model::{ChangeType, MessageRole};

    static ENV_LOCK: LazyLock<Mutex<()>> = LazyLock::new(|| Mutex::new(()));

    struct StorageFixture {
        _guard: MutexGuard<'static, ()>,
        tmp: tempfile::TempDir,
    }

    impl StorageFixture {
        fn new() -> Self {
            let guard = ENV_LOCK.lock().unwrap();
            let tmp = tempfile::TempDir::new().unwrap();
            unsafe { std::env::set_var("FACTORY_HOME", tmp.path()) };
            StorageFixture { _guard: guard, tmp }
        }

        fn add_session(&self, session_id: &str, lines: &str) {
            fs::write(
                self.tmp.path().join(format!("{session_id}.jsonl")),
                lines,
            )
            .unwrap();
        }
    }

    impl Drop for StorageFixture {
        fn drop(&mut self) {
            unsafe { std::env::remove_var("FACTORY_HOME") };
        }
    }

    fn header(id: &str) -> String {
        serde_json::json!({
            "type": "session",
            "id": id,
            "timestamp": "2026-04-01T12:00:00Z",
            "cwd": "/srv/app",
            "title": "Background job rework",
        })
        .to_string()
    }

    fn message(role: &str, content: serde_json::Value, id: &str, ts: &str) -> String {
        serde_json::json!({
            "type": "message",
            "id": id,
            "timestamp": ts,
            "message": {"role": role, "content": content},
        })
        .to_string()
    }

    #[test]
    fn capture_typed_stream() {
        let fx = StorageFixture::new();
        let lines = [
            header("dr-1"),
            message("user", serde_json::json!("Rework the background job queue"), "m1", "2026-04-01T12:00:01Z"),
            message(
                "assistant",
                serde_json::json!([
                    {"type": "text", "text": "Switching the queue to a visibility timeout."},
                    {"type": "toolCall", "name": "create_file", "arguments": {"path": "src/queue.rs", "content": "pub struct Queue;"}},
                ]),
                "m2",
                "2026-04-01T12:00:09Z",
            ),
        ]
        .join("\n");
        fx.add_session("dr-1", &lines);

        let session = Droid.capture("dr-1").unwrap();
        assert_eq!(session.source, "droid");
        assert_eq!(session.project.path, PathBuf::from("/srv/app"));
        assert_eq!(session.conversation.message_count, 3);
        assert_eq!(session.conversation.messages[2].role, MessageRole::Tool);
        assert_eq!(session.files_changed.len(), 1);
        assert_eq!(session.files_changed[0].change_type, ChangeType::Created);
    }

    #[test]
    fn standalone_tool_entries_collected() {
        let fx = StorageFixture::new();
        let lines = [
            header("dr-2"),
            message("user", serde_json::json!("Delete the legacy shim module"), "m1", "2026-04-01T12:00:01Z"),
            serde_json::json!({
                "type": "tool_call",
                "name": "delete_file",
                "timestamp": "2026-04-01T12:00:02Z",
                "arguments": {"path": "src/legacy_shim.rs"},
            })
            .to_string(),
            serde_json::json!({
                "type": "tool_result",
                "name": "delete_file",
                "timestamp": "2026-04-01T12:00:03Z",
                "output": "deleted",
            })
            .to_string(),
        ]
        .join("\n");
        fx.add_session("dr-2", &lines);

        let session = Droid.capture("dr-2").unwrap();
        assert_eq!(session.conversation.message_count, 3);
        assert_eq!(session.files_changed[0].change_type, ChangeType::Deleted);
        let activity = session.tool_activity.unwrap();
        assert_eq!(activity[0].name, "delete_file");
        assert_eq!(activity[0].count, 2);
    }

    #[test]
    fn listing_uses_header_title_as_preview() {
        let fx = StorageFixture::new();
        fx.add_session(
            "dr-3",
            &[header("dr-3"), message("user", serde_json::json!("Follow-up message content"), "m1", "2026-04-01T12:00:01Z")].join("\n"),
        );
        let sessions = Droid.list_sessions(None).unwrap();
        assert_eq!(sessions[0].id, "dr-3");
        assert_eq!(sessions[0].preview, "Background job rework");
        assert_eq!(sessions[0].message_count, 1);
    }

    #[test]
    fn missing_session_not_found() {
        let _fx = StorageFixture::new();
        let err = Droid.capture("ghost").unwrap_err();
        assert!(matches!(
            err.downcast_ref::<HandoffError>().unwrap(),
            HandoffError::SessionNotFound { .. }
        ));
    }
}
