//! Codex adapter — JSONL rollout streams under `~/.codex/sessions/`.
//!
//! Layout: `<storage>/YYYY/MM/DD/rollout-<timestamp>-<session-id>.jsonl`
//! (date-sharded; enumeration walks the shard tree).
//!
//! ## JSONL envelope
//!
//! Each line: `{ "type": "session_meta|response_item|event_msg",
//! "timestamp": …, "payload": {…} }`
//!
//! - `session_meta` → `payload.id` (session id), `payload.cwd`.
//! - `response_item` → conversational messages (`payload.role`,
//!   `payload.content` with `input_text`/`output_text` blocks) plus
//!   `function_call` / `function_call_output` items.
//! - `event_msg` → sub-typed: `user_message` (conversational),
//!   `token_count` (usage accounting); other sub-types are skipped.

use std::path::{Path, PathBuf};

use anyhow::Context;
use tracing::{debug, trace};
use walkdir::WalkDir;

use crate::adapters::stream::{MessageCollector, for_each_json_line};
use crate::adapters::{AgentAdapter, SessionInfo, assemble_session, sort_by_recency};
use crate::error::HandoffError;
use crate::model::{
    CanonicalSession, MessageRole, flatten_content, normalize_role, parse_timestamp,
    truncate_chars,
};
use crate::paths::{OsFamily, resolve_storage_root};
use crate::registry;

/// Codex adapter implementation.
pub struct Codex;

const SLUG: &str = "codex";

impl Codex {
    fn storage_root() -> Option<PathBuf> {
        let spec = registry::spec_for(SLUG)?;
        resolve_storage_root(
            spec.env_override,
            spec.storage_template(OsFamily::current()),
        )
    }

    /// All rollout files, newest shard directories included.
    fn rollout_files() -> Vec<PathBuf> {
        let Some(root) = Self::storage_root() else {
            return Vec::new();
        };
        WalkDir::new(&root)
            .max_depth(4)
            .into_iter()
            .filter_map(Result::ok)
            .filter(|e| e.file_type().is_file())
            .map(|e| e.into_path())
            .filter(|p| p.extension().and_then(|e| e.to_str()) == Some("jsonl"))
            .collect()
    }

    /// Session id recorded in the stream's `session_meta` line, if any.
    fn meta_session_id(path: &Path) -> Option<String> {
        let mut id = None;
        let _ = for_each_json_line(path, |entry| {
            if id.is_some() {
                return;
            }
            if entry.value.get("type").and_then(|v| v.as_str()) == Some("session_meta") {
                id = entry
                    .value
                    .pointer("/payload/id")
                    .and_then(|v| v.as_str())
                    .map(String::from);
            }
        });
        id
    }

    fn find_rollout(session_id: &str) -> Option<PathBuf> {
        for path in Self::rollout_files() {
            let stem_match = path
                .file_stem()
                .and_then(|s| s.to_str())
                .is_some_and(|stem| stem.ends_with(session_id));
            if stem_match || Self::meta_session_id(&path).as_deref() == Some(session_id) {
                debug!(path = %path.display(), "found Codex rollout");
                return Some(path);
            }
        }
        None
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
            let ts = value.get("timestamp").and_then(parse_timestamp);
            if let Some(ts) = ts {
                first_ts.get_or_insert(ts);
                last_ts = Some(ts);
            }
            match value.get("type").and_then(|v| v.as_str()) {
                Some("session_meta") => {
                    id = value
                        .pointer("/payload/id")
                        .and_then(|v| v.as_str())
                        .map(String::from);
                    project_path = value
                        .pointer("/payload/cwd")
                        .and_then(|v| v.as_str())
                        .map(PathBuf::from);
                }
                Some("response_item") => {
                    if value.pointer("/payload/role").is_some() {
                        message_count += 1;
                        if preview.is_empty()
                            && value.pointer("/payload/role").and_then(|v| v.as_str())
                                == Some("user")
                            && let Some(content) = value.pointer("/payload/content")
                        {
                            let text = flatten_content(content);
                            preview =
                                truncate_chars(text.trim().lines().next().unwrap_or(""), 200);
                        }
                    }
                }
                Some("event_msg") => {
                    if value.pointer("/payload/type").and_then(|v| v.as_str())
                        == Some("user_message")
                    {
                        message_count += 1;
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

impl AgentAdapter for Codex {
    fn slug(&self) -> &'static str {
        SLUG
    }

    fn display_name(&self) -> &'static str {
        "Codex CLI"
    }

    fn detect(&self) -> bool {
        Self::storage_root().is_some_and(|root| root.is_dir()) || which::which("codex").is_ok()
    }

    fn list_sessions(&self, project_path: Option<&Path>) -> anyhow::Result<Vec<SessionInfo>> {
        let mut sessions = Vec::new();
        for path in Self::rollout_files() {
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
                    debug!(path = %path.display(), error = %e, "skipping unreadable rollout");
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

        let path = Self::find_rollout(session_id).ok_or_else(|| HandoffError::SessionNotFound {
            source_name: SLUG.to_string(),
            session_id: session_id.to_string(),
        })?;

        let mut collector = MessageCollector::new();
        let mut resolved_id = None;

        for_each_json_line(&path, |entry| {
            let value = &entry.value;
            let timestamp = value.get("timestamp").and_then(parse_timestamp);
            let payload = value.get("payload").cloned().unwrap_or_default();

            match value.get("type").and_then(|v| v.as_str()) {
                Some("session_meta") => {
                    resolved_id = payload.get("id").and_then(|v| v.as_str()).map(String::from);
                    collector.note_project_path(payload.get("cwd"));
                }
                Some("response_item") => {
                    let id = payload.get("id").and_then(|v| v.as_str());
                    if collector.is_duplicate(id) {
                        trace!(line = entry.line_number, "duplicate response item");
                        return;
                    }
                    collector.add_usage(payload.get("usage"));

                    match payload.get("type").and_then(|v| v.as_str()) {
                        Some("function_call") => {
                            let name = payload
                                .get("name")
                                .and_then(|v| v.as_str())
                                .unwrap_or("unknown")
                                .to_string();
                            let args = tool_arguments(&payload);
                            collector.push_tool_use(&name, &args, timestamp);
                        }
                        Some("function_call_output") => {
                            let body = payload
                                .get("output")
                                .map(flatten_content)
                                .unwrap_or_default();
                            collector.push_tool_result(None, &body, timestamp);
                        }
                        _ => {
                            if let Some(role_value) = payload.get("role") {
                                let role = normalize_role(role_value);
                                if let Some(content) = payload.get("content") {
                                    collector.push_content(role, content, timestamp);
                                }
                            }
                        }
                    }
                }
                Some("event_msg") => match payload.get("type").and_then(|v| v.as_str()) {
                    Some("user_message") => {
                        let text = payload
                            .get("message")
                            .or_else(|| payload.get("text"))
                            .map(flatten_content)
                            .unwrap_or_default();
                        if !text.trim().is_empty() {
                            collector.push_content(
                                MessageRole::User,
                                &serde_json::Value::String(text),
                                timestamp,
                            );
                        }
                    }
                    Some("token_count") => {
                        let usage = payload
                            .pointer("/info/total_token_usage")
                            .or_else(|| payload.get("usage"))
                            .or(Some(&payload));
                        collector.add_usage(usage);
                    }
                    _ => {
                        trace!(line = entry.line_number, "skipping event_msg sub-type");
                    }
                },
                _ => {}
            }
        })
        .with_context(|| format!("failed to read {}", path.display()))?;

        let collected = collector.finish();
        assemble_session(
            SLUG,
            resolved_id.unwrap_or_else(|| session_id.to_string()),
            collected.project_path,
            collected.messages,
            collected.files_changed,
            collected.estimated_tokens,
        )
    }
}

/// `function_call.arguments` is usually a JSON-encoded string; decode it so
/// file-change extraction sees real keys.
fn tool_arguments(payload: &serde_json::Value) -> serde_json::Value {
    match payload.get("arguments") {
        Some(serde_json::Value::String(raw)) => {
            serde_json::from_str(raw).unwrap_or(serde_json::Value::String(raw.clone()))
        }
        Some(other) => other.clone(),
        None => serde_json::Value::Null,
    }
}
