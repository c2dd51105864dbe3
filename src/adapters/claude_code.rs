//! Claude Code adapter — JSONL session streams under `~/.claude/projects/`.
//!
//! Layout: `<storage>/<path-hash>/<session-id>.jsonl`, where `<path-hash>`
//! encodes the absolute workspace path (see [`crate::paths`]).
//!
//! ## JSONL format
//!
//! Each line is a JSON object with a `type` field:
//! - `"user"` / `"assistant"` — conversational entries (extracted).
//! - `"file-history-snapshot"` / `"summary"` / others — skipped.
//!
//! Conversational entries carry `message.role` / `message.content` (string
//! or content-block array), a top-level `cwd`, `uuid`, `timestamp`, and an
//! optional `message.usage` block with token counts.

use std::path::{Path, PathBuf};

use anyhow::Context;
use tracing::{debug, trace};

use crate::adapters::stream::{MessageCollector, for_each_json_line};
use crate::adapters::{AgentAdapter, SessionInfo, assemble_session, sort_by_recency};
use crate::error::HandoffError;
use crate::model::{CanonicalSession, flatten_content, normalize_role, parse_timestamp, truncate_chars};
use crate::paths::{OsFamily, decode_project_dir, encode_project_dir, resolve_storage_root};
use crate::registry;

/// Claude Code adapter implementation.
pub struct ClaudeCode;

const SLUG: &str = "claude-code";

impl ClaudeCode {
    fn storage_root() -> Option<PathBuf> {
        let spec = registry::spec_for(SLUG)?;
        resolve_storage_root(
            spec.env_override,
            spec.storage_template(OsFamily::current()),
        )
    }

    /// All project directories under the storage root.
    fn project_dirs() -> Vec<PathBuf> {
        let Some(root) = Self::storage_root() else {
            return Vec::new();
        };
        let Ok(entries) = std::fs::read_dir(&root) else {
            return Vec::new();
        };
        entries
            .flatten()
            .filter(|e| e.file_type().map(|ft| ft.is_dir()).unwrap_or(false))
            .map(|e| e.path())
            .collect()
    }

    /// Locate the `.jsonl` file owning `session_id`, scanning project dirs.
    fn session_file(session_id: &str) -> Option<PathBuf> {
        let filename = format!("{session_id}.jsonl");
        for dir in Self::project_dirs() {
            let candidate = dir.join(&filename);
            if candidate.is_file() {
                debug!(path = %candidate.display(), "found Claude Code session");
                return Some(candidate);
            }
        }
        None
    }

    /// Cheap single-pass summary of one session file.
    fn summarize(path: &Path) -> anyhow::Result<SessionInfo> {
        let mut message_count = 0usize;
        let mut first_ts = None;
        let mut last_ts = None;
        let mut preview = String::new();

        for_each_json_line(path, |entry| {
            let value = entry.value;
            if !matches!(
                value.get("type").and_then(|v| v.as_str()),
                Some("user" | "assistant")
            ) {
                return;
            }
            message_count += 1;
            if let Some(ts) = value.get("timestamp").and_then(parse_timestamp) {
                first_ts.get_or_insert(ts);
                last_ts = Some(ts);
            }
            if preview.is_empty()
                && value.get("type").and_then(|v| v.as_str()) == Some("user")
                && let Some(content) = value.pointer("/message/content")
            {
                let text = flatten_content(content);
                let line = text.trim().lines().next().unwrap_or("").to_string();
                if !line.is_empty() && !line.starts_with('[') {
                    preview = truncate_chars(&line, 200);
                }
            }
        })?;

        let project_path = path
            .parent()
            .and_then(|p| p.file_name())
            .and_then(|n| n.to_str())
            .and_then(decode_project_dir);

        Ok(SessionInfo {
            id: path
                .file_stem()
                .and_then(|s| s.to_str())
                .unwrap_or("unknown")
                .to_string(),
            started_at: first_ts,
            last_active_at: last_ts,
            message_count,
            project_path,
            preview,
        })
    }
}

impl AgentAdapter for ClaudeCode {
    fn slug(&self) -> &'static str {
        SLUG
    }

    fn display_name(&self) -> &'static str {
        "Claude Code"
    }

    fn detect(&self) -> bool {
        Self::storage_root().is_some_and(|root| root.is_dir())
            || which::which("claude").is_ok()
    }

    fn list_sessions(&self, project_path: Option<&Path>) -> anyhow::Result<Vec<SessionInfo>> {
        let dirs = match project_path {
            Some(project) => {
                let encoded =
                    encode_project_dir(&project.to_string_lossy(), OsFamily::current());
                match Self::storage_root() {
                    Some(root) if root.join(&encoded).is_dir() => vec![root.join(encoded)],
                    _ => Vec::new(),
                }
            }
            None => Self::project_dirs(),
        };

        let mut sessions = Vec::new();
        for dir in dirs {
            let Ok(entries) = std::fs::read_dir(&dir) else {
                continue;
            };
            for entry in entries.flatten() {
                let path = entry.path();
                if path.extension().and_then(|e| e.to_str()) != Some("jsonl") {
                    continue;
                }
                match Self::summarize(&path) {
                    Ok(info) => sessions.push(info),
                    Err(e) => {
                        debug!(path = %path.display(), error = %e, "skipping unreadable session");
                    }
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

        let path = Self::session_file(session_id).ok_or_else(|| HandoffError::SessionNotFound {
            source_name: SLUG.to_string(),
            session_id: session_id.to_string(),
        })?;

        let mut collector = MessageCollector::new();
        let skipped = for_each_json_line(&path, |entry| {
            let value = entry.value;

            collector.note_project_path(value.get("cwd"));

            if !matches!(
                value.get("type").and_then(|v| v.as_str()),
                Some("user" | "assistant")
            ) {
                trace!(line = entry.line_number, "skipping non-conversational entry");
                return;
            }

            let id = value.get("uuid").and_then(|v| v.as_str());
            if collector.is_duplicate(id) {
                trace!(line = entry.line_number, "skipping duplicate message id");
                return;
            }

            collector.add_usage(value.pointer("/message/usage"));

            let role_value = value
                .pointer("/message/role")
                .cloned()
                .or_else(|| value.get("type").cloned())
                .unwrap_or_default();
            let role = normalize_role(&role_value);
            let timestamp = value.get("timestamp").and_then(|v| parse_timestamp(v));

            if let Some(content) = value.pointer("/message/content") {
                collector.push_content(role, content, timestamp);
            }
        })
        .with_context(|| format!("failed to read {}", path.display()))?;

        if skipped > 0 {
            debug!(skipped, path = %path.display(), "tolerated malformed lines");
        }

        // Project-path inference: per-entry cwd → path-hash decode of the
        // enclosing directory → caller's working directory.
        if !collector.has_project_path() {
            let decoded = path
                .parent()
                .and_then(|p| p.file_name())
                .and_then(|n| n.to_str())
                .and_then(decode_project_dir);
            collector.set_project_path_fallback(decoded);
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

    // Serializes CLAUDE_HOME manipulation across tests.
    static ENV_LOCK: LazyLock<Mutex<()>> = LazyLock::new(|| Mutex::new(()));

    struct StorageFixture {
        _guard: MutexGuard<'static, ()>,
        tmp: tempfile::TempDir,
    }

    impl StorageFixture {
        fn new() -> Self {
            let guard = ENV_LOCK.lock().unwrap();
            let tmp = tempfile::TempDir::new().unwrap();
            unsafe { std::env::set_var("CLAUDE_HOME", tmp.path()) };
            StorageFixture { _guard: guard, tmp }
        }

        fn add_session(&self, project_dir: &str, session_id: &str, lines: &str) {
            let dir = self.tmp.path().join(project_dir);
            fs::create_dir_all(&dir).unwrap();
            fs::write(dir.join(format!("{session_id}.jsonl")), lines).unwrap();
        }
    }

    impl Drop for StorageFixture {
        fn drop(&mut self) {
            unsafe { std::env::remove_var("CLAUDE_HOME") };
        }
    }

    fn entry(kind: &str, content: serde_json::Value, uuid: &str, ts: &str) -> String {
        serde_json::json!({
            "type": kind,
            "cwd": "/tmp/proj",
            "uuid": uuid,
            "timestamp": ts,
            "message": {"role": kind, "content": content},
        })
        .to_string()
    }

    #[test]
    fn capture_basic_exchange() {
        let fx = StorageFixture::new();
        let lines = [
            entry("user", serde_json::json!("Fix the login redirect loop"), "u1", "2026-01-01T00:00:00Z"),
            entry(
                "assistant",
                serde_json::json!([{"type": "text", "text": "Looking at it."}]),
                "a1",
                "2026-01-01T00:00:05Z",
            ),
        ]
        .join("\n");
        fx.add_session("-tmp-proj", "sess-1", &lines);

        let session = ClaudeCode.capture("sess-1").unwrap();
        assert_eq!(session.source, "claude-code");
        assert_eq!(session.conversation.message_count, 2);
        assert_eq!(session.conversation.messages[0].role, MessageRole::User);
        assert_eq!(session.project.path, PathBuf::from("/tmp/proj"));
        assert_eq!(
            session.task.description,
            "Fix the login redirect loop"
        );
    }

    #[test]
    fn capture_empty_file_yields_valid_empty_session() {
        let fx = StorageFixture::new();
        fx.add_session("-tmp-proj", "empty", "");

        let session = ClaudeCode.capture("empty").unwrap();
        assert_eq!(session.conversation.message_count, 0);
        assert_eq!(session.task.description, "Unknown task");
        assert!(session.files_changed.is_empty());
        assert!(session.decisions.is_empty());
    }

    #[test]
    fn capture_tolerates_malformed_and_partial_lines() {
        let fx = StorageFixture::new();
        let lines = format!(
            "{}\nnot json at all\n{{\"broken\n{}\n{{\"type\":\"user\",\"trunc",
            entry("user", serde_json::json!("Ship the exporter feature now"), "u1", "2026-01-01T00:00:00Z"),
            entry("assistant", serde_json::json!("On it."), "a1", "2026-01-01T00:00:01Z"),
        );
        fx.add_session("-tmp-proj", "messy", &lines);

        let session = ClaudeCode.capture("messy").unwrap();
        assert_eq!(session.conversation.message_count, 2);
    }

    #[test]
    fn capture_duplicate_uuid_counts_once() {
        let fx = StorageFixture::new();
        let dup = serde_json::json!({
            "type": "assistant",
            "uuid": "same-id",
            "timestamp": "2026-01-01T00:00:01Z",
            "message": {
                "role": "assistant",
                "content": "Reply body",
                "usage": {"input_tokens": 10, "output_tokens": 5},
            },
        })
        .to_string();
        let lines = format!(
            "{}\n{dup}\n{dup}",
            entry("user", serde_json::json!("Investigate flaky CI on main"), "u1", "2026-01-01T00:00:00Z"),
        );
        fx.add_session("-tmp-proj", "dups", &lines);

        let session = ClaudeCode.capture("dups").unwrap();
        assert_eq!(session.conversation.message_count, 2);
        assert_eq!(session.conversation.estimated_tokens, 15);
    }

    #[test]
    fn capture_unknown_id_is_not_found() {
        let _fx = StorageFixture::new();
        let err = ClaudeCode.capture("nope").unwrap_err();
        let handoff = err.downcast_ref::<HandoffError>().unwrap();
        assert!(matches!(handoff, HandoffError::SessionNotFound { .. }));
    }

    #[test]
    fn capture_path_separator_in_id_is_malformed() {
        let _fx = StorageFixture::new();
        let err = ClaudeCode.capture("../escape").unwrap_err();
        let handoff = err.downcast_ref::<HandoffError>().unwrap();
        assert!(matches!(handoff, HandoffError::Malformed { .. }));
    }

    #[test]
    fn list_sessions_sorted_most_recent_first() {
        let fx = StorageFixture::new();
        fx.add_session(
            "-tmp-proj",
            "older",
            &entry("user", serde_json::json!("Do the first piece of work"), "u1", "2026-01-01T00:00:00Z"),
        );
        fx.add_session(
            "-tmp-proj",
            "newer",
            &entry("user", serde_json::json!("Do the second piece of work"), "u1", "2026-02-01T00:00:00Z"),
        );

        let sessions = ClaudeCode.list_sessions(None).unwrap();
        assert_eq!(sessions.len(), 2);
        assert_eq!(sessions[0].id, "newer");
        assert_eq!(sessions[0].message_count, 1);
        assert!(sessions[0].preview.starts_with("Do the second"));
    }

    #[test]
    fn list_sessions_filtered_by_project_path() {
        let fx = StorageFixture::new();
        fx.add_session(
            "-tmp-proj",
            "mine",
            &entry("user", serde_json::json!("Work inside the main project"), "u1", "2026-01-01T00:00:00Z"),
        );
        fx.add_session(
            "-tmp-other",
            "theirs",
            &entry("user", serde_json::json!("Work in an unrelated project"), "u1", "2026-01-01T00:00:00Z"),
        );

        let sessions = ClaudeCode
            .list_sessions(Some(Path::new("/tmp/proj")))
            .unwrap();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].id, "mine");
        assert_eq!(sessions[0].project_path, Some(PathBuf::from("/tmp/proj")));
    }

    #[test]
    fn long_stream_counts_every_line() {
        let fx = StorageFixture::new();
        let mut lines = Vec::with_capacity(1002);
        for i in 0..1002 {
            let kind = if i % 2 == 0 { "user" } else { "assistant" };
            lines.push(entry(
                kind,
                serde_json::json!(format!("turn number {i} with enough text")),
                &format!("id-{i}"),
                "2026-01-01T00:00:00Z",
            ));
        }
        fx.add_session("-tmp-proj", "long", &lines.join("\n"));

        let session = ClaudeCode.capture("long").unwrap();
        assert_eq!(session.conversation.message_count, 1002);
    }
}
