//! Cursor adapter — reads sessions from SQLite `state.vscdb` databases.
//!
//! Storage root is the editor's `User` directory:
//! - per-workspace: `User/workspaceStorage/<workspaceHash>/state.vscdb`
//!   (plus an optional `workspace.json` naming the project folder)
//! - global: `User/globalStorage/state.vscdb`
//!
//! ## Storage format
//!
//! Key-value tables: `ItemTable` in per-workspace databases, `cursorDiskKV`
//! in the global database. Both hold session manifests and per-message rows
//! keyed `bubbleId:<composerId>:<bubbleId>`.
//!
//! Manifest fallback chain (schema drift across Cursor versions):
//! 1. modern `composer.composerData`
//! 2. legacy `workbench.panel.aichat.view.aichat.chatdata`
//! 3. individual `composerData:<id>` entries
//! 4. global database
//!
//! ## Session identifiers
//!
//! `<workspaceHash>:<composerId>` for workspace sessions,
//! `global:<composerId>` for global-only sessions. A global copy of a
//! workspace session is suppressed from listings, but may raise the
//! workspace entry's message count when the global database is ahead.
//!
//! All databases are opened strictly read-only; a locked database surfaces
//! a remediation error, never a retry.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use md5::Md5;
use rusqlite::{Connection, OpenFlags};
use sha1::Sha1;
use sha2::{Digest, Sha256};
use tracing::{debug, trace, warn};

use crate::adapters::{AgentAdapter, SessionInfo, assemble_session, sort_by_recency};
use crate::error::HandoffError;
use crate::model::{
    CanonicalSession, ConversationMessage, MessageRole, flatten_content, normalize_role,
    parse_timestamp, truncate_chars,
};
use crate::paths::{OsFamily, resolve_storage_root};
use crate::registry;

/// Cursor adapter implementation.
pub struct Cursor;

const SLUG: &str = "cursor";

/// Modern manifest key in per-workspace `ItemTable`.
const KEY_COMPOSER_DATA: &str = "composer.composerData";
/// Legacy manifest key (pre-composer AI chat panel).
const KEY_LEGACY_CHAT: &str = "workbench.panel.aichat.view.aichat.chatdata";

/// Listing metadata for one composer, cheap to derive from a manifest.
#[derive(Debug, Clone)]
struct ComposerMeta {
    composer_id: String,
    name: Option<String>,
    created_at: Option<DateTime<Utc>>,
    last_updated_at: Option<DateTime<Utc>>,
    message_count: usize,
}

impl Cursor {
    fn storage_root() -> Option<PathBuf> {
        let spec = registry::spec_for(SLUG)?;
        resolve_storage_root(
            spec.env_override,
            spec.storage_template(OsFamily::current()),
        )
    }

    /// `(workspaceHash, db path, workspace dir)` for every workspace DB.
    fn workspace_dbs() -> Vec<(String, PathBuf, PathBuf)> {
        let Some(root) = Self::storage_root() else {
            return Vec::new();
        };
        let storage = root.join("workspaceStorage");
        let Ok(entries) = std::fs::read_dir(&storage) else {
            return Vec::new();
        };
        entries
            .flatten()
            .filter(|e| e.file_type().map(|ft| ft.is_dir()).unwrap_or(false))
            .filter_map(|e| {
                let dir = e.path();
                let db = dir.join("state.vscdb");
                if !db.is_file() {
                    return None;
                }
                let hash = dir.file_name()?.to_str()?.to_string();
                Some((hash, db, dir))
            })
            .collect()
    }

    fn global_db() -> Option<PathBuf> {
        let db = Self::storage_root()?.join("globalStorage/state.vscdb");
        db.is_file().then_some(db)
    }

    /// Open a database read-only with must-already-exist semantics.
    ///
    /// A busy or locked database maps to [`HandoffError::StoreLocked`]; the
    /// remediation is closing Cursor, never retrying here.
    fn open_ro(path: &Path) -> anyhow::Result<Connection> {
        let locked = |_| HandoffError::StoreLocked {
            source_name: SLUG.to_string(),
            path: path.to_path_buf(),
        };
        let is_lock_error = |e: &rusqlite::Error| {
            matches!(
                e,
                rusqlite::Error::SqliteFailure(ffi, _)
                    if matches!(
                        ffi.code,
                        rusqlite::ErrorCode::DatabaseBusy
                            | rusqlite::ErrorCode::DatabaseLocked
                            | rusqlite::ErrorCode::SystemIoFailure
                    )
            )
        };

        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .map_err(|e| -> anyhow::Error {
            if is_lock_error(&e) {
                locked(()).into()
            } else {
                e.into()
            }
        })?;

        // SQLite reports an exclusive writer only at query time; probe now
        // so a held lock surfaces here, with remediation, not as an empty
        // listing. No busy timeout: the caller is told to close Cursor,
        // never to wait.
        if let Err(e) = conn.query_row("SELECT count(*) FROM sqlite_master", [], |_| Ok(())) {
            if is_lock_error(&e) {
                return Err(locked(()).into());
            }
            return Err(e.into());
        }

        Ok(conn)
    }

    fn table_exists(conn: &Connection, table: &str) -> bool {
        conn.prepare("SELECT 1 FROM sqlite_master WHERE type='table' AND name=?1")
            .and_then(|mut stmt| stmt.exists(rusqlite::params![table]))
            .unwrap_or(false)
    }

    fn kv_get(conn: &Connection, table: &str, key: &str) -> Option<String> {
        if !Self::table_exists(conn, table) {
            return None;
        }
        conn.query_row(
            &format!("SELECT value FROM {table} WHERE key = ?1"),
            rusqlite::params![key],
            |row| row.get(0),
        )
        .ok()
    }

    /// Range scan over a key prefix (leverages the primary-key index).
    fn kv_prefix(conn: &Connection, table: &str, prefix: &str) -> Vec<(String, String)> {
        if !Self::table_exists(conn, table) {
            return Vec::new();
        }
        let upper = format!("{}{}", &prefix[..prefix.len() - 1], {
            let last = prefix.as_bytes()[prefix.len() - 1];
            (last + 1) as char
        });

        let mut stmt = match conn
            .prepare(&format!(
                "SELECT key, value FROM {table} WHERE key >= ?1 AND key < ?2 ORDER BY key"
            )) {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, table, "prefix query failed");
                return Vec::new();
            }
        };

        stmt.query_map(rusqlite::params![prefix, upper], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })
        .map(|rows| rows.filter_map(Result::ok).collect())
        .unwrap_or_default()
    }

    /// Decode the project path from a workspace dir's `workspace.json`.
    ///
    /// The folder is stored as a `file://` URI; it is percent-decoded and,
    /// on windows-like hosts, stripped of the leading `/` before the drive.
    fn workspace_project_path(dir: &Path) -> Option<PathBuf> {
        let raw = std::fs::read_to_string(dir.join("workspace.json")).ok()?;
        let json: serde_json::Value = serde_json::from_str(&raw).ok()?;
        let folder = json.get("folder").and_then(|v| v.as_str())?;
        let without_scheme = folder.strip_prefix("file://")?;
        let decoded = urlencoding::decode(without_scheme).ok()?.into_owned();
        let path = if OsFamily::current() == OsFamily::Windows {
            decoded.strip_prefix('/').unwrap_or(&decoded).to_string()
        } else {
            decoded
        };
        Some(PathBuf::from(path))
    }

    /// Manifest chain for one workspace database: modern key → legacy key →
    /// individual `composerData:<id>` entries.
    fn manifest_composers(conn: &Connection) -> Vec<ComposerMeta> {
        // Modern: composer.composerData with an allComposers array.
        if let Some(raw) = Self::kv_get(conn, "ItemTable", KEY_COMPOSER_DATA)
            && let Ok(json) = serde_json::from_str::<serde_json::Value>(&raw)
        {
            let composers = json
                .get("allComposers")
                .or_else(|| json.get("composers"))
                .and_then(|v| v.as_array());
            if let Some(composers) = composers {
                let metas: Vec<ComposerMeta> = composers
                    .iter()
                    .filter_map(|c| Self::composer_meta(c, conn))
                    .collect();
                if !metas.is_empty() {
                    return metas;
                }
            }
        }

        // Legacy: aichat tabs.
        if let Some(raw) = Self::kv_get(conn, "ItemTable", KEY_LEGACY_CHAT)
            && let Ok(json) = serde_json::from_str::<serde_json::Value>(&raw)
            && let Some(tabs) = json.get("tabs").and_then(|v| v.as_array())
        {
            let metas: Vec<ComposerMeta> = tabs
                .iter()
                .filter_map(|tab| {
                    let id = tab.get("tabId").and_then(|v| v.as_str())?;
                    Some(ComposerMeta {
                        composer_id: id.to_string(),
                        name: tab
                            .get("chatTitle")
                            .and_then(|v| v.as_str())
                            .map(String::from),
                        created_at: None,
                        last_updated_at: tab.get("lastSendTime").and_then(parse_timestamp),
                        message_count: tab
                            .get("bubbles")
                            .and_then(|v| v.as_array())
                            .map(|b| b.len())
                            .unwrap_or(0),
                    })
                })
                .collect();
            if !metas.is_empty() {
                return metas;
            }
        }

        // Individual composerData:<id> rows; the id lives in the key, not
        // necessarily in the value.
        Self::kv_prefix(conn, "ItemTable", "composerData:")
            .into_iter()
            .filter_map(|(key, value)| {
                let id = key.strip_prefix("composerData:")?;
                let mut json: serde_json::Value = serde_json::from_str(&value).ok()?;
                if let Some(obj) = json.as_object_mut() {
                    obj.entry("composerId")
                        .or_insert_with(|| serde_json::Value::String(id.to_string()));
                }
                Self::composer_meta(&json, conn)
            })
            .collect()
    }

    fn composer_meta(composer: &serde_json::Value, conn: &Connection) -> Option<ComposerMeta> {
        let id = composer.get("composerId").and_then(|v| v.as_str())?;
        let header_count = composer
            .get("fullConversationHeadersOnly")
            .and_then(|v| v.as_array())
            .map(|h| h.len());
        let bubble_count = match header_count {
            Some(n) if n > 0 => n,
            _ => Self::kv_prefix(conn, "ItemTable", &format!("bubbleId:{id}:")).len(),
        };
        Some(ComposerMeta {
            composer_id: id.to_string(),
            name: composer
                .get("name")
                .and_then(|v| v.as_str())
                .filter(|s| !s.is_empty())
                .map(String::from),
            created_at: composer.get("createdAt").and_then(parse_timestamp),
            last_updated_at: composer.get("lastUpdatedAt").and_then(parse_timestamp),
            message_count: bubble_count,
        })
    }

    /// Composers in the global database, keyed by composer id.
    fn global_composers() -> HashMap<String, ComposerMeta> {
        let Some(db) = Self::global_db() else {
            return HashMap::new();
        };
        let Ok(conn) = Self::open_ro(&db) else {
            return HashMap::new();
        };
        Self::kv_prefix(&conn, "cursorDiskKV", "composerData:")
            .into_iter()
            .filter_map(|(key, value)| {
                let id = key.strip_prefix("composerData:")?.to_string();
                let json: serde_json::Value = serde_json::from_str(&value).ok()?;
                let count = json
                    .get("fullConversationHeadersOnly")
                    .and_then(|v| v.as_array())
                    .map(|h| h.len())
                    .unwrap_or_else(|| {
                        Self::kv_prefix(&conn, "cursorDiskKV", &format!("bubbleId:{id}:")).len()
                    });
                Some((
                    id.clone(),
                    ComposerMeta {
                        composer_id: id,
                        name: json
                            .get("name")
                            .and_then(|v| v.as_str())
                            .filter(|s| !s.is_empty())
                            .map(String::from),
                        created_at: json.get("createdAt").and_then(parse_timestamp),
                        last_updated_at: json.get("lastUpdatedAt").and_then(parse_timestamp),
                        message_count: count,
                    },
                ))
            })
            .collect()
    }

    /// Workspace dirs that plausibly hold `project`: decoded workspace.json
    /// match → digest match on the directory name → most recently modified
    /// database as a single-candidate fallback.
    fn workspaces_for_project(project: &Path) -> Vec<(String, PathBuf, PathBuf)> {
        let all = Self::workspace_dbs();

        let exact: Vec<_> = all
            .iter()
            .filter(|(_, _, dir)| {
                Self::workspace_project_path(dir).as_deref() == Some(project)
            })
            .cloned()
            .collect();
        if !exact.is_empty() {
            return exact;
        }

        let digests = path_digests(project);
        let hashed: Vec<_> = all
            .iter()
            .filter(|(hash, _, _)| digests.iter().any(|d| d.eq_ignore_ascii_case(hash)))
            .cloned()
            .collect();
        if !hashed.is_empty() {
            return hashed;
        }

        all.into_iter()
            .max_by_key(|(_, db, _)| {
                std::fs::metadata(db)
                    .and_then(|m| m.modified())
                    .ok()
            })
            .into_iter()
            .collect()
    }

    // -----------------------------------------------------------------------
    // Bubble parsing
    // -----------------------------------------------------------------------

    /// Extract bubble text: `content` → `text` → `richText` → nested
    /// `message.content` traversal; first non-empty wins.
    fn bubble_text(bubble: &serde_json::Value) -> Option<String> {
        for field in ["content", "text", "richText"] {
            if let Some(v) = bubble.get(field) {
                let text = flatten_content(v);
                if !text.trim().is_empty() {
                    return Some(text);
                }
            }
        }
        let nested = bubble.pointer("/message/content")?;
        let text = flatten_content(nested);
        (!text.trim().is_empty()).then_some(text)
    }

    fn bubble_message(bubble: &serde_json::Value) -> Option<ConversationMessage> {
        let content = Self::bubble_text(bubble)?;
        let role = bubble
            .get("type")
            .or_else(|| bubble.get("role"))
            .map(normalize_role)
            .unwrap_or(MessageRole::Assistant);
        let timestamp = bubble
            .get("timestamp")
            .or_else(|| bubble.get("createdAt"))
            .and_then(parse_timestamp);
        Some(ConversationMessage {
            role,
            content,
            tool_name: None,
            timestamp,
            token_count: None,
        })
    }

    fn bubbles_to_messages(rows: Vec<(String, String)>) -> Vec<ConversationMessage> {
        rows.into_iter()
            .filter_map(|(_, value)| serde_json::from_str::<serde_json::Value>(&value).ok())
            .filter_map(|bubble| Self::bubble_message(&bubble))
            .collect()
    }

    /// Messages embedded directly in a manifest entry (older formats keep
    /// the conversation inline).
    fn manifest_messages(composer: &serde_json::Value) -> Vec<ConversationMessage> {
        let arrays = ["conversation", "messages", "bubbles"];
        for field in arrays {
            if let Some(items) = composer.get(field).and_then(|v| v.as_array()) {
                let messages: Vec<ConversationMessage> = items
                    .iter()
                    .filter_map(|b| Self::bubble_message(b))
                    .collect();
                if !messages.is_empty() {
                    return messages;
                }
            }
        }
        Vec::new()
    }

    /// Legacy chatdata tab matching `composer_id`, flattened to messages.
    fn legacy_messages(conn: &Connection, composer_id: &str) -> Vec<ConversationMessage> {
        let Some(raw) = Self::kv_get(conn, "ItemTable", KEY_LEGACY_CHAT) else {
            return Vec::new();
        };
        let Ok(json) = serde_json::from_str::<serde_json::Value>(&raw) else {
            return Vec::new();
        };
        json.get("tabs")
            .and_then(|v| v.as_array())
            .into_iter()
            .flatten()
            .filter(|tab| tab.get("tabId").and_then(|v| v.as_str()) == Some(composer_id))
            .flat_map(|tab| {
                tab.get("bubbles")
                    .and_then(|v| v.as_array())
                    .cloned()
                    .unwrap_or_default()
            })
            .filter_map(|b| Self::bubble_message(&b))
            .collect()
    }

    /// Capture fallback chain for a workspace session: workspace bubble
    /// rows → manifest embedded messages → legacy manifest → global bubble
    /// rows. First non-empty chain wins.
    fn workspace_messages(
        conn: &Connection,
        composer_id: &str,
    ) -> Vec<ConversationMessage> {
        let bubbles =
            Self::kv_prefix(conn, "ItemTable", &format!("bubbleId:{composer_id}:"));
        let messages = Self::bubbles_to_messages(bubbles);
        if !messages.is_empty() {
            trace!(composer_id, "capture via workspace bubble rows");
            return messages;
        }

        for key in [
            format!("composerData:{composer_id}"),
            KEY_COMPOSER_DATA.to_string(),
        ] {
            if let Some(raw) = Self::kv_get(conn, "ItemTable", &key)
                && let Ok(json) = serde_json::from_str::<serde_json::Value>(&raw)
            {
                let composer = if key == KEY_COMPOSER_DATA {
                    json.get("allComposers")
                        .or_else(|| json.get("composers"))
                        .and_then(|v| v.as_array())
                        .and_then(|arr| {
                            arr.iter()
                                .find(|c| {
                                    c.get("composerId").and_then(|v| v.as_str())
                                        == Some(composer_id)
                                })
                                .cloned()
                        })
                } else {
                    Some(json)
                };
                if let Some(composer) = composer {
                    let messages = Self::manifest_messages(&composer);
                    if !messages.is_empty() {
                        trace!(composer_id, "capture via manifest embedded messages");
                        return messages;
                    }
                }
            }
        }

        let legacy = Self::legacy_messages(conn, composer_id);
        if !legacy.is_empty() {
            trace!(composer_id, "capture via legacy chatdata");
            return legacy;
        }

        Self::global_bubble_messages(composer_id)
    }

    fn global_bubble_messages(composer_id: &str) -> Vec<ConversationMessage> {
        let Some(db) = Self::global_db() else {
            return Vec::new();
        };
        let Ok(conn) = Self::open_ro(&db) else {
            return Vec::new();
        };
        let rows = Self::kv_prefix(&conn, "cursorDiskKV", &format!("bubbleId:{composer_id}:"));
        Self::bubbles_to_messages(rows)
    }
}

impl AgentAdapter for Cursor {
    fn slug(&self) -> &'static str {
        SLUG
    }

    fn display_name(&self) -> &'static str {
        "Cursor"
    }

    fn detect(&self) -> bool {
        Self::storage_root().is_some_and(|root| root.is_dir()) || which::which("cursor").is_ok()
    }

    fn list_sessions(&self, project_path: Option<&Path>) -> anyhow::Result<Vec<SessionInfo>> {
        let workspaces = match project_path {
            Some(project) => Self::workspaces_for_project(project),
            None => Self::workspace_dbs(),
        };

        let mut sessions = Vec::new();
        let mut seen_composers: HashMap<String, usize> = HashMap::new();

        for (hash, db, dir) in &workspaces {
            let conn = match Self::open_ro(db) {
                Ok(c) => c,
                Err(e) => {
                    debug!(db = %db.display(), error = %e, "skipping unreadable workspace DB");
                    continue;
                }
            };
            let project = Self::workspace_project_path(dir);
            for meta in Self::manifest_composers(&conn) {
                let idx = sessions.len();
                seen_composers.insert(meta.composer_id.clone(), idx);
                sessions.push(SessionInfo {
                    id: format!("{hash}:{}", meta.composer_id),
                    started_at: meta.created_at,
                    last_active_at: meta.last_updated_at,
                    message_count: meta.message_count,
                    project_path: project.clone(),
                    preview: meta
                        .name
                        .map(|n| truncate_chars(&n, 200))
                        .unwrap_or_default(),
                });
            }
        }

        // Global sessions: suppressed when a workspace copy exists, but the
        // global count may raise the workspace entry (the global DB is
        // sometimes ahead of the workspace DB).
        for (composer_id, meta) in Self::global_composers() {
            match seen_composers.get(&composer_id) {
                Some(&idx) => {
                    if meta.message_count > sessions[idx].message_count {
                        sessions[idx].message_count = meta.message_count;
                    }
                }
                None => {
                    if project_path.is_some() {
                        continue;
                    }
                    sessions.push(SessionInfo {
                        id: format!("global:{composer_id}"),
                        started_at: meta.created_at,
                        last_active_at: meta.last_updated_at,
                        message_count: meta.message_count,
                        project_path: None,
                        preview: meta
                            .name
                            .map(|n| truncate_chars(&n, 200))
                            .unwrap_or_default(),
                    });
                }
            }
        }

        sort_by_recency(&mut sessions);
        Ok(sessions)
    }

    fn capture(&self, session_id: &str) -> anyhow::Result<CanonicalSession> {
        let Some((scope, composer_id)) = session_id.split_once(':') else {
            return Err(HandoffError::Malformed {
                source_name: SLUG.to_string(),
                detail: format!(
                    "session id '{session_id}' must be '<workspaceHash>:<composerId>' or 'global:<composerId>'"
                ),
            }
            .into());
        };
        if composer_id.is_empty() {
            return Err(HandoffError::Malformed {
                source_name: SLUG.to_string(),
                detail: "empty composer id".to_string(),
            }
            .into());
        }

        let (messages, project_path) = if scope == "global" {
            (Self::global_bubble_messages(composer_id), None)
        } else {
            let found = Self::workspace_dbs()
                .into_iter()
                .find(|(hash, _, _)| hash == scope);
            let Some((_, db, dir)) = found else {
                return Err(HandoffError::SessionNotFound {
                    source_name: SLUG.to_string(),
                    session_id: session_id.to_string(),
                }
                .into());
            };
            let conn = Self::open_ro(&db)?;
            (
                Self::workspace_messages(&conn, composer_id),
                Self::workspace_project_path(&dir),
            )
        };

        if messages.is_empty() {
            return Err(HandoffError::SessionNotFound {
                source_name: SLUG.to_string(),
                session_id: session_id.to_string(),
            }
            .into());
        }

        assemble_session(
            SLUG,
            session_id.to_string(),
            project_path,
            messages,
            Vec::new(),
            0,
        )
    }
}

/// md5/sha1/sha256 hex digests of canonical path variants, for matching a
/// workspace directory name that is a hash of the project path.
fn path_digests(project: &Path) -> Vec<String> {
    let canonical = project.to_string_lossy();
    let stripped = canonical.trim_end_matches('/');
    let variants = [
        canonical.to_string(),
        stripped.to_string(),
        stripped.to_lowercase(),
        format!("file://{stripped}"),
    ];

    let mut digests = Vec::new();
    for variant in &variants {
        digests.push(hex(Md5::digest(variant.as_bytes()).as_slice()));
        digests.push(hex(Sha1::digest(variant.as_bytes()).as_slice()));
        digests.push(hex(Sha256::digest(variant.as_bytes()).as_slice()));
    }
    digests.sort_unstable();
    digests.dedup();
    digests
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::sync::{LazyLock, Mutex, MutexGuard};

    use super::*;

    static ENV_LOCK: LazyLock<Mutex<()>> = LazyLock::new(|| Mutex::new(()));

    struct StorageFixture {
        _guard: MutexGuard<'static, ()>,
        tmp: tempfile::TempDir,
    }

    impl StorageFixture {
        fn new() -> Self {
            let guard = ENV_LOCK.lock().unwrap();
            let tmp = tempfile::TempDir::new().unwrap();
            unsafe { std::env::set_var("CURSOR_HOME", tmp.path()) };
            StorageFixture { _guard: guard, tmp }
        }

        fn workspace_dir(&self, hash: &str) -> PathBuf {
            let dir = self.tmp.path().join("workspaceStorage").join(hash);
            fs::create_dir_all(&dir).unwrap();
            dir
        }

        fn workspace_db(&self, hash: &str) -> Connection {
            let dir = self.workspace_dir(hash);
            let conn = Connection::open(dir.join("state.vscdb")).unwrap();
            conn.execute_batch(
                "CREATE TABLE IF NOT EXISTS ItemTable (key TEXT PRIMARY KEY, value TEXT);",
            )
            .unwrap();
            conn
        }

        fn global_db(&self) -> Connection {
            let dir = self.tmp.path().join("globalStorage");
            fs::create_dir_all(&dir).unwrap();
            let conn = Connection::open(dir.join("state.vscdb")).unwrap();
            conn.execute_batch(
                "CREATE TABLE IF NOT EXISTS cursorDiskKV (key TEXT PRIMARY KEY, value TEXT);",
            )
            .unwrap();
            conn
        }

        fn write_workspace_json(&self, hash: &str, folder_uri: &str) {
            let dir = self.workspace_dir(hash);
            fs::write(
                dir.join("workspace.json"),
                serde_json::json!({"folder": folder_uri}).to_string(),
            )
            .unwrap();
        }
    }

    impl Drop for StorageFixture {
        fn drop(&mut self) {
            unsafe { std::env::remove_var("CURSOR_HOME") };
        }
    }

    fn insert(conn: &Connection, table: &str, key: &str, value: &serde_json::Value) {
        conn.execute(
            &format!("INSERT OR REPLACE INTO {table} (key, value) VALUES (?1, ?2)"),
            rusqlite::params![key, value.to_string()],
        )
        .unwrap();
    }

    fn manifest(composers: serde_json::Value) -> serde_json::Value {
        serde_json::json!({"allComposers": composers})
    }

    fn bubble(kind: i64, text: &str, ts: i64) -> serde_json::Value {
        serde_json::json!({"type": kind, "text": text, "timestamp": ts})
    }

    #[test]
    fn capture_workspace_bubble_rows() {
        let fx = StorageFixture::new();
        let conn = fx.workspace_db("ws1");
        insert(
            &conn,
            "ItemTable",
            KEY_COMPOSER_DATA,
            &manifest(serde_json::json!([
                {"composerId": "c1", "name": "Fix pagination", "createdAt": 1_700_000_000_000_i64, "lastUpdatedAt": 1_700_000_600_000_i64,
                 "fullConversationHeadersOnly": [{"bubbleId": "b1"}, {"bubbleId": "b2"}]}
            ])),
        );
        insert(
            &conn,
            "ItemTable",
            "bubbleId:c1:b1",
            &bubble(1, "Fix pagination on the admin table", 1_700_000_000_000),
        );
        insert(
            &conn,
            "ItemTable",
            "bubbleId:c1:b2",
            &bubble(2, "Looking at the offset arithmetic.", 1_700_000_060_000),
        );
        fx.write_workspace_json("ws1", "file:///home/dev/admin%20panel");
        drop(conn);

        let session = Cursor.capture("ws1:c1").unwrap();
        assert_eq!(session.source, "cursor");
        assert_eq!(session.conversation.message_count, 2);
        assert_eq!(session.conversation.messages[0].role, MessageRole::User);
        assert_eq!(session.conversation.messages[1].role, MessageRole::Assistant);
        // workspace.json URI is percent-decoded.
        assert_eq!(
            session.project.path,
            PathBuf::from("/home/dev/admin panel")
        );
    }

    #[test]
    fn capture_falls_back_to_manifest_messages() {
        let fx = StorageFixture::new();
        let conn = fx.workspace_db("ws2");
        insert(
            &conn,
            "ItemTable",
            KEY_COMPOSER_DATA,
            &manifest(serde_json::json!([
                {"composerId": "c2", "name": "Inline convo",
                 "conversation": [
                     {"type": 1, "text": "Where is the session pruning logic?"},
                     {"type": 2, "text": "It lives in the retention worker."},
                 ]}
            ])),
        );
        drop(conn);

        let session = Cursor.capture("ws2:c2").unwrap();
        assert_eq!(session.conversation.message_count, 2);
        assert!(
            session.conversation.messages[0]
                .content
                .contains("session pruning")
        );
    }

    #[test]
    fn capture_falls_back_to_legacy_chatdata() {
        let fx = StorageFixture::new();
        let conn = fx.workspace_db("ws3");
        insert(
            &conn,
            "ItemTable",
            KEY_LEGACY_CHAT,
            &serde_json::json!({"tabs": [
                {"tabId": "tab-9", "chatTitle": "Old chat", "lastSendTime": 1_690_000_000_000_i64,
                 "bubbles": [
                     {"type": "user", "text": "Migrate the config loader to toml"},
                     {"type": "ai", "text": "Parsing with the existing loader first."},
                 ]}
            ]}),
        );
        drop(conn);

        let session = Cursor.capture("ws3:tab-9").unwrap();
        assert_eq!(session.conversation.message_count, 2);
        assert_eq!(session.conversation.messages[1].role, MessageRole::Assistant);
    }

    #[test]
    fn capture_falls_back_to_global_bubbles() {
        let fx = StorageFixture::new();
        let ws = fx.workspace_db("ws4");
        insert(
            &ws,
            "ItemTable",
            KEY_COMPOSER_DATA,
            &manifest(serde_json::json!([
                {"composerId": "c4", "name": "Global-backed"}
            ])),
        );
        drop(ws);
        let global = fx.global_db();
        insert(
            &global,
            "cursorDiskKV",
            "bubbleId:c4:b1",
            &bubble(1, "Check the retry budget configuration", 1_700_000_000_000),
        );
        drop(global);

        let session = Cursor.capture("ws4:c4").unwrap();
        assert_eq!(session.conversation.message_count, 1);
    }

    #[test]
    fn capture_global_scope_directly() {
        let fx = StorageFixture::new();
        let global = fx.global_db();
        insert(
            &global,
            "cursorDiskKV",
            "bubbleId:g1:b1",
            &bubble(1, "Standalone global conversation here", 1_700_000_000_000),
        );
        drop(global);

        let session = Cursor.capture("global:g1").unwrap();
        assert_eq!(session.session_id, "global:g1");
        assert_eq!(session.conversation.message_count, 1);
    }

    #[test]
    fn malformed_id_without_colon_rejected() {
        let _fx = StorageFixture::new();
        let err = Cursor.capture("no-colon-here").unwrap_err();
        assert!(matches!(
            err.downcast_ref::<HandoffError>().unwrap(),
            HandoffError::Malformed { .. }
        ));
    }

    #[test]
    fn unknown_workspace_not_found() {
        let _fx = StorageFixture::new();
        let err = Cursor.capture("missing:c9").unwrap_err();
        assert!(matches!(
            err.downcast_ref::<HandoffError>().unwrap(),
            HandoffError::SessionNotFound { .. }
        ));
    }

    #[test]
    fn listing_suppresses_global_copy_but_raises_count() {
        let fx = StorageFixture::new();
        let ws = fx.workspace_db("ws5");
        insert(
            &ws,
            "ItemTable",
            KEY_COMPOSER_DATA,
            &manifest(serde_json::json!([
                {"composerId": "c5", "name": "Shared session", "lastUpdatedAt": 1_700_000_000_000_i64,
                 "fullConversationHeadersOnly": [{"bubbleId": "b1"}, {"bubbleId": "b2"}]}
            ])),
        );
        drop(ws);
        let global = fx.global_db();
        // The global DB is ahead: 4 headers vs the workspace's 2.
        insert(
            &global,
            "cursorDiskKV",
            "composerData:c5",
            &serde_json::json!({"name": "Shared session", "lastUpdatedAt": 1_700_000_100_000_i64,
                "fullConversationHeadersOnly": [{}, {}, {}, {}]}),
        );
        insert(
            &global,
            "cursorDiskKV",
            "composerData:only-global",
            &serde_json::json!({"name": "Scratch", "lastUpdatedAt": 1_700_000_050_000_i64,
                "fullConversationHeadersOnly": [{}]}),
        );
        drop(global);

        let sessions = Cursor.list_sessions(None).unwrap();
        let shared = sessions.iter().find(|s| s.id == "ws5:c5").unwrap();
        assert_eq!(shared.message_count, 4);
        assert!(sessions.iter().any(|s| s.id == "global:only-global"));
        assert!(!sessions.iter().any(|s| s.id == "global:c5"));
    }

    #[test]
    fn project_listing_prefers_workspace_json_match() {
        let fx = StorageFixture::new();
        let ws_a = fx.workspace_db("aaa");
        insert(
            &ws_a,
            "ItemTable",
            KEY_COMPOSER_DATA,
            &manifest(serde_json::json!([
                {"composerId": "ca", "name": "In project", "lastUpdatedAt": 1_700_000_000_000_i64,
                 "fullConversationHeadersOnly": [{}]}
            ])),
        );
        drop(ws_a);
        fx.write_workspace_json("aaa", "file:///repo/mine");

        let ws_b = fx.workspace_db("bbb");
        insert(
            &ws_b,
            "ItemTable",
            KEY_COMPOSER_DATA,
            &manifest(serde_json::json!([
                {"composerId": "cb", "name": "Elsewhere", "lastUpdatedAt": 1_700_000_000_000_i64,
                 "fullConversationHeadersOnly": [{}]}
            ])),
        );
        drop(ws_b);
        fx.write_workspace_json("bbb", "file:///repo/other");

        let sessions = Cursor.list_sessions(Some(Path::new("/repo/mine"))).unwrap();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].id, "aaa:ca");
    }

    #[test]
    fn project_listing_matches_hashed_dir_name() {
        let fx = StorageFixture::new();
        let digest = hex(Md5::digest("/repo/hashed".as_bytes()).as_slice());
        let ws = fx.workspace_db(&digest);
        insert(
            &ws,
            "ItemTable",
            KEY_COMPOSER_DATA,
            &manifest(serde_json::json!([
                {"composerId": "ch", "name": "Hashed", "lastUpdatedAt": 1_700_000_000_000_i64,
                 "fullConversationHeadersOnly": [{}]}
            ])),
        );
        drop(ws);

        let sessions = Cursor
            .list_sessions(Some(Path::new("/repo/hashed")))
            .unwrap();
        assert_eq!(sessions.len(), 1);
        assert!(sessions[0].id.starts_with(&digest));
    }

    #[test]
    fn exclusively_locked_db_surfaces_store_locked() {
        let fx = StorageFixture::new();
        let conn = fx.workspace_db("wslock");
        insert(
            &conn,
            "ItemTable",
            KEY_COMPOSER_DATA,
            &manifest(serde_json::json!([
                {"composerId": "cl", "name": "Locked", "fullConversationHeadersOnly": [{}]}
            ])),
        );
        // Hold an exclusive write lock, as a running Cursor would.
        conn.execute_batch("BEGIN EXCLUSIVE").unwrap();

        let err = Cursor.capture("wslock:cl").unwrap_err();
        let handoff = err.downcast_ref::<HandoffError>().unwrap();
        assert!(matches!(handoff, HandoffError::StoreLocked { .. }), "{handoff}");
        let msg = handoff.to_string();
        assert!(msg.contains("Close the cursor application"), "{msg}");

        conn.execute_batch("ROLLBACK").unwrap();
    }

    #[test]
    fn path_digest_variants_are_stable() {
        let a = path_digests(Path::new("/x/y"));
        let b = path_digests(Path::new("/x/y/"));
        // Trailing slash collapses onto the same stripped variant.
        assert!(a.iter().any(|d| b.contains(d)));
    }
}
