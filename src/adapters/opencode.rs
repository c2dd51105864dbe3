//! OpenCode adapter — split-document JSON storage under
//! `~/.local/share/opencode/storage/session/`.
//!
//! Layout:
//! - `info/<session-id>.json` — session metadata: id, title, `directory`
//!   (project path), `time: { created, updated }` (epoch millis)
//! - `message/<session-id>/<message-id>.json` — one document per message:
//!   `role`, `time: { created }`, `parts` (typed block list using `text` /
//!   `tool` entries)
//!
//! Capture joins the info document with its message directory; a session
//! with an info document but no message directory is an empty session, not
//! an error.

use std::path::{Path, PathBuf};

use tracing::debug;

use crate::adapters::stream::MessageCollector;
use crate::adapters::{AgentAdapter, SessionInfo, assemble_session, sort_by_recency};
use crate::error::HandoffError;
use crate::model::{CanonicalSession, normalize_role, parse_timestamp, truncate_chars};
use crate::paths::{OsFamily, resolve_storage_root};
use crate::registry;

/// OpenCode adapter implementation.
pub struct OpenCode;

const SLUG: &str = "opencode";

impl OpenCode {
    fn storage_root() -> Option<PathBuf> {
        let spec = registry::spec_for(SLUG)?;
        resolve_storage_root(
            spec.env_override,
            spec.storage_template(OsFamily::current()),
        )
    }

    fn info_files() -> Vec<PathBuf> {
        let Some(root) = Self::storage_root() else {
            return Vec::new();
        };
        let Ok(entries) = std::fs::read_dir(root.join("info")) else {
            return Vec::new();
        };
        entries
            .flatten()
            .map(|e| e.path())
            .filter(|p| p.extension().and_then(|e| e.to_str()) == Some("json"))
            .collect()
    }

    fn load(path: &Path) -> anyhow::Result<serde_json::Value> {
        let raw = std::fs::read_to_string(path)?;
        serde_json::from_str(&raw).map_err(|e| {
            HandoffError::Malformed {
                source_name: SLUG.to_string(),
                detail: format!("{}: {e}", path.display()),
            }
            .into()
        })
    }

    /// Message documents for a session, ordered by creation time then
    /// filename for determinism.
    fn message_docs(session_id: &str) -> Vec<serde_json::Value> {
        let Some(root) = Self::storage_root() else {
            return Vec::new();
        };
        let dir = root.join("message").join(session_id);
        let Ok(entries) = std::fs::read_dir(&dir) else {
            return Vec::new();
        };

        let mut paths: Vec<PathBuf> = entries
            .flatten()
            .map(|e| e.path())
            .filter(|p| p.extension().and_then(|e| e.to_str()) == Some("json"))
            .collect();
        paths.sort();

        let mut docs: Vec<serde_json::Value> = paths
            .iter()
            .filter_map(|p| match Self::load(p) {
                Ok(doc) => Some(doc),
                Err(e) => {
                    debug!(path = %p.display(), error = %e, "skipping unreadable message");
                    None
                }
            })
            .collect();
        docs.sort_by_key(|doc| {
            doc.pointer("/time/created")
                .and_then(|v| v.as_i64())
                .unwrap_or(i64::MAX)
        });
        docs
    }

    fn summarize(info_path: &Path) -> anyhow::Result<SessionInfo> {
        let info = Self::load(info_path)?;
        let id = info
            .get("id")
            .and_then(|v| v.as_str())
            .map(String::from)
            .unwrap_or_else(|| {
                info_path
                    .file_stem()
                    .and_then(|s| s.to_str())
                    .unwrap_or("unknown")
                    .to_string()
            });

        let message_count = Self::storage_root()
            .map(|root| root.join("message").join(&id))
            .and_then(|dir| std::fs::read_dir(dir).ok())
            .map(|entries| entries.flatten().count())
            .unwrap_or(0);

        Ok(SessionInfo {
            id,
            started_at: info.pointer("/time/created").and_then(parse_timestamp),
            last_active_at: info.pointer("/time/updated").and_then(parse_timestamp),
            message_count,
            project_path: info
                .get("directory")
                .and_then(|v| v.as_str())
                .map(PathBuf::from),
            preview: info
                .get("title")
                .and_then(|v| v.as_str())
                .map(|t| truncate_chars(t, 200))
                .unwrap_or_default(),
        })
    }
}

impl AgentAdapter for OpenCode {
    fn slug(&self) -> &'static str {
        SLUG
    }

    fn display_name(&self) -> &'static str {
        "OpenCode"
    }

    fn detect(&self) -> bool {
        Self::storage_root().is_some_and(|root| root.is_dir())
            || which::which("opencode").is_ok()
    }

    fn list_sessions(&self, project_path: Option<&Path>) -> anyhow::Result<Vec<SessionInfo>> {
        let mut sessions = Vec::new();
        for path in Self::info_files() {
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
                    debug!(path = %path.display(), error = %e, "skipping unreadable info doc");
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

        let info_path = Self::storage_root()
            .map(|root| root.join("info").join(format!("{session_id}.json")))
            .filter(|p| p.is_file())
            .ok_or_else(|| HandoffError::SessionNotFound {
                source_name: SLUG.to_string(),
                session_id: session_id.to_string(),
            })?;

        let info = Self::load(&info_path)?;
        let mut collector = MessageCollector::new();
        collector.note_project_path(info.get("directory"));

        for doc in Self::message_docs(session_id) {
            let id = doc.get("id").and_then(|v| v.as_str());
            if collector.is_duplicate(id) {
                continue;
            }
            collector.add_usage(doc.get("tokens").or_else(|| doc.get("usage")));

            let role = doc
                .get("role")
                .map(normalize_role)
                .unwrap_or(crate::model::MessageRole::Assistant);
            let timestamp = doc.pointer("/time/created").and_then(parse_timestamp);
            if let Some(parts) = doc.get("parts").or_else(|| doc.get("content")) {
                collector.push_content(role, parts, timestamp);
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
