//! Gemini CLI adapter — per-project chat JSON under `~/.gemini/tmp/`.
//!
//! Layout: `<storage>/<project-hash>/chats/<chat>.json`, where
//! `<project-hash>` is a sha256 digest of the absolute project path (the
//! hash is one-way, so a listing can only be scoped to a project by hashing
//! the query path and comparing directory names).
//!
//! ## Document format
//!
//! ```json
//! {
//!   "sessionId": "…",
//!   "projectHash": "…",
//!   "startTime": "…",
//!   "lastUpdated": "…",
//!   "messages": [ {"role", "parts" | "content", "timestamp"?, "id"?}, … ]
//! }
//! ```
//!
//! `parts` is the Gemini block list (`{"text": …}` entries).

use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use tracing::debug;

use crate::adapters::stream::MessageCollector;
use crate::adapters::{AgentAdapter, SessionInfo, assemble_session, sort_by_recency};
use crate::error::HandoffError;
use crate::model::{CanonicalSession, flatten_content, normalize_role, parse_timestamp, truncate_chars};
use crate::paths::{OsFamily, resolve_storage_root};
use crate::registry;

/// Gemini CLI adapter implementation.
pub struct Gemini;

const SLUG: &str = "gemini";

impl Gemini {
    fn storage_root() -> Option<PathBuf> {
        let spec = registry::spec_for(SLUG)?;
        resolve_storage_root(
            spec.env_override,
            spec.storage_template(OsFamily::current()),
        )
    }

    /// Digest used for project directory names.
    fn project_hash(project: &Path) -> String {
        let digest = Sha256::digest(project.to_string_lossy().as_bytes());
        digest.iter().map(|b| format!("{b:02x}")).collect()
    }

    /// `(project-hash dir, chat file)` pairs, optionally scoped by hash.
    fn chat_files(hash_filter: Option<&str>) -> Vec<(String, PathBuf)> {
        let Some(root) = Self::storage_root() else {
            return Vec::new();
        };
        let Ok(entries) = std::fs::read_dir(&root) else {
            return Vec::new();
        };

        let mut files = Vec::new();
        for entry in entries.flatten() {
            if !entry.file_type().map(|ft| ft.is_dir()).unwrap_or(false) {
                continue;
            }
            let hash = entry.file_name().to_string_lossy().to_string();
            if let Some(filter) = hash_filter
                && !hash.eq_ignore_ascii_case(filter)
            {
                continue;
            }
            let chats = entry.path().join("chats");
            let Ok(chat_entries) = std::fs::read_dir(&chats) else {
                continue;
            };
            for chat in chat_entries.flatten() {
                let path = chat.path();
                if path.extension().and_then(|e| e.to_str()) == Some("json") {
                    files.push((hash.clone(), path));
                }
            }
        }
        files
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

    fn session_id_of(doc: &serde_json::Value, path: &Path) -> String {
        doc.get("sessionId")
            .and_then(|v| v.as_str())
            .map(String::from)
            .unwrap_or_else(|| {
                path.file_stem()
                    .and_then(|s| s.to_str())
                    .unwrap_or("unknown")
                    .to_string()
            })
    }

    fn summarize(path: &Path) -> anyhow::Result<SessionInfo> {
        let doc = Self::load(path)?;
        let messages = doc
            .get("messages")
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default();

        let preview = messages
            .iter()
            .find(|m| m.get("role").and_then(|v| v.as_str()) == Some("user"))
            .and_then(|m| m.get("parts").or_else(|| m.get("content")))
            .map(flatten_content)
            .map(|t| truncate_chars(t.trim().lines().next().unwrap_or(""), 200))
            .unwrap_or_default();

        Ok(SessionInfo {
            id: Self::session_id_of(&doc, path),
            started_at: doc.get("startTime").and_then(parse_timestamp),
            last_active_at: doc.get("lastUpdated").and_then(parse_timestamp),
            message_count: messages.len(),
            project_path: None,
            preview,
        })
    }

    fn find_chat(session_id: &str) -> Option<PathBuf> {
        for (_, path) in Self::chat_files(None) {
            if path
                .file_stem()
                .and_then(|s| s.to_str())
                .is_some_and(|stem| stem == session_id)
            {
                return Some(path);
            }
            if let Ok(doc) = Self::load(&path)
                && doc.get("sessionId").and_then(|v| v.as_str()) == Some(session_id)
            {
                return Some(path);
            }
        }
        None
    }
}

impl AgentAdapter for Gemini {
    fn slug(&self) -> &'static str {
        SLUG
    }

    fn display_name(&self) -> &'static str {
        "Gemini CLI"
    }

    fn detect(&self) -> bool {
        Self::storage_root().is_some_and(|root| root.is_dir()) || which::which("gemini").is_ok()
    }

    fn list_sessions(&self, project_path: Option<&Path>) -> anyhow::Result<Vec<SessionInfo>> {
        let hash = project_path.map(Self::project_hash);
        let mut sessions = Vec::new();
        for (_, path) in Self::chat_files(hash.as_deref()) {
            match Self::summarize(&path) {
                Ok(mut info) => {
                    info.project_path = project_path.map(Path::to_path_buf);
                    sessions.push(info);
                }
                Err(e) => {
                    debug!(path = %path.display(), error = %e, "skipping unreadable chat");
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

        let path = Self::find_chat(session_id).ok_or_else(|| HandoffError::SessionNotFound {
            source_name: SLUG.to_string(),
            session_id: session_id.to_string(),
        })?;

        let doc = Self::load(&path)?;
        let mut collector = MessageCollector::new();

        for message in doc
            .get("messages")
            .and_then(|v| v.as_array())
            .into_iter()
            .flatten()
        {
            let id = message.get("id").and_then(|v| v.as_str());
            if collector.is_duplicate(id) {
                continue;
            }
            collector.add_usage(message.get("usage"));

            let role = message
                .get("role")
                .map(normalize_role)
                .unwrap_or(crate::model::MessageRole::Assistant);
            let timestamp = message.get("timestamp").and_then(parse_timestamp);
            if let Some(content) = message.get("parts").or_else(|| message.get("content")) {
                collector.push_content(role, content, timestamp);
            }
        }

        let collected = collector.finish();
        assemble_session(
            SLUG,
            Self::session_id_of(&doc, &path),
            collected.project_path,
            collected.messages,
            collected.files_changed,
            collected.estimated_tokens,
        )
    }
}
