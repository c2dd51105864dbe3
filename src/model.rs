//! Canonical session model — every adapter's native format normalizes into
//! these types, and every downstream stage (analyzer, enrichment,
//! compression, prompt builder) consumes them.
//!
//! Serialized field names follow the canonical schema exactly (camelCase),
//! so a persisted `session.json` round-trips byte-for-byte through serde.

use std::path::PathBuf;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// Fixed schema version stamped on every captured session.
pub const SCHEMA_VERSION: &str = "1.0";

// ---------------------------------------------------------------------------
// Core types
// ---------------------------------------------------------------------------

/// A source-agnostic snapshot of one AI coding agent session.
///
/// Created once per `capture` call and immutable afterwards; adapters own
/// their parsing buffers and hand the finished record to the caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CanonicalSession {
    /// Always [`SCHEMA_VERSION`].
    pub schema_version: String,
    /// Source slug (`"claude-code"`, `"cursor"`, …). Validated against the
    /// adapter registry.
    pub source: String,
    /// Instant the snapshot was taken.
    pub captured_at: DateTime<Utc>,
    /// Stable per-source session identifier.
    pub session_id: String,
    /// First recorded turn, when the source preserves it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_started_at: Option<DateTime<Utc>>,
    pub project: ProjectContext,
    pub conversation: Conversation,
    pub files_changed: Vec<FileChange>,
    /// Ordered, case-insensitively deduplicated.
    pub decisions: Vec<String>,
    /// Ordered, case-insensitively deduplicated.
    pub blockers: Vec<String>,
    pub task: TaskState,
    /// Aggregated tool-use summaries, when any tools ran.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_activity: Option<Vec<ToolActivitySummary>>,
}

/// The conversation portion of a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    /// Must equal `messages.len()`.
    pub message_count: usize,
    /// Sum of per-message usage tokens reported by the source.
    pub estimated_tokens: u64,
    pub messages: Vec<ConversationMessage>,
}

/// A single normalized message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationMessage {
    pub role: MessageRole,
    pub content: String,
    /// Set on synthetic `tool` messages.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_count: Option<u64>,
}

/// Who sent a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
    System,
    Tool,
}

/// One file the session touched, keyed by path (last write wins).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileChange {
    pub path: String,
    pub change_type: ChangeType,
    /// Textual diff or content snapshot, when the source recorded one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub diff: Option<String>,
    /// Language tag inferred from the file extension.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeType {
    Created,
    Modified,
    Deleted,
}

/// Structured task state distilled from the conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskState {
    /// At most 300 chars.
    pub description: String,
    pub completed: Vec<String>,
    pub remaining: Vec<String>,
    /// At most 200 chars.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub in_progress: Option<String>,
    pub blockers: Vec<String>,
}

impl TaskState {
    /// Placeholder when no meaningful message exists.
    pub const UNKNOWN: &'static str = "Unknown task";

    pub fn unknown() -> Self {
        TaskState {
            description: Self::UNKNOWN.to_string(),
            completed: Vec::new(),
            remaining: Vec::new(),
            in_progress: None,
            blockers: Vec::new(),
        }
    }
}

/// Project surroundings captured alongside the conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectContext {
    /// Absolute. Falls back to the caller's working directory when the
    /// source records no project path.
    pub path: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub git_branch: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub git_status: Option<String>,
    /// Last 10 one-line commits.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub git_log: Option<Vec<String>>,
    /// Depth-2 text tree, at most 40 lines.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub structure: Option<String>,
    /// Concatenated memory files, at most 2000 chars.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_file_contents: Option<String>,
}

impl ProjectContext {
    /// A bare context for `path` with every optional field unknown.
    pub fn bare(path: PathBuf) -> Self {
        ProjectContext {
            path,
            name: None,
            git_branch: None,
            git_status: None,
            git_log: None,
            structure: None,
            memory_file_contents: None,
        }
    }
}

/// Aggregated usage of one tool across the session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolActivitySummary {
    pub name: String,
    pub count: usize,
    /// Up to 3 one-liner sample invocations.
    pub samples: Vec<String>,
}

// ---------------------------------------------------------------------------
// Shared parse helpers
// ---------------------------------------------------------------------------

/// Flatten heterogeneous content representations into plain text.
///
/// Sources store message content either as a bare string or as an ordered
/// list of typed blocks. Text-bearing block kinds (`text`, `output_text`,
/// `input_text`) are collected and newline-joined; everything else is
/// ignored here (tool blocks become synthetic messages upstream).
pub fn flatten_content(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Array(blocks) => {
            let parts: Vec<&str> = blocks
                .iter()
                .filter_map(|block| {
                    let obj = block.as_object()?;
                    let kind = obj.get("type").and_then(|v| v.as_str()).unwrap_or("text");
                    if !matches!(kind, "text" | "output_text" | "input_text") {
                        return None;
                    }
                    obj.get("text")
                        .or_else(|| obj.get("content"))
                        .and_then(|v| v.as_str())
                })
                .filter(|s| !s.is_empty())
                .collect();
            parts.join("\n")
        }
        serde_json::Value::Object(obj) => obj
            .get("text")
            .or_else(|| obj.get("content"))
            .map(flatten_content)
            .unwrap_or_default(),
        _ => String::new(),
    }
}

/// Parse a timestamp value (ISO-8601 string, epoch seconds, epoch millis)
/// into a `DateTime<Utc>`.
///
/// Numeric values ≥ 10^12 are treated as milliseconds; smaller ones as
/// seconds. Sources that emit epoch-millis are normalized here so downstream
/// code sees exactly one representation.
pub fn parse_timestamp(value: &serde_json::Value) -> Option<DateTime<Utc>> {
    match value {
        serde_json::Value::String(s) => DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|dt| dt.with_timezone(&Utc)),
        serde_json::Value::Number(n) => {
            let raw = n.as_f64()?;
            if !raw.is_finite() || raw <= 0.0 {
                return None;
            }
            let millis = if raw >= 1e12 { raw } else { raw * 1000.0 };
            Utc.timestamp_millis_opt(millis as i64).single()
        }
        _ => None,
    }
}

/// Map source-specific role spellings to a canonical [`MessageRole`].
///
/// `developer` → system, `human` → user, `ai` → assistant; numeric roles
/// `1`/`2` (embedded-database sources) → user/assistant; anything
/// unrecognized is treated as assistant output.
pub fn normalize_role(value: &serde_json::Value) -> MessageRole {
    if let Some(n) = value.as_i64() {
        return match n {
            1 => MessageRole::User,
            _ => MessageRole::Assistant,
        };
    }
    match value.as_str().unwrap_or("").to_ascii_lowercase().as_str() {
        "user" | "human" => MessageRole::User,
        "assistant" | "ai" => MessageRole::Assistant,
        "system" | "developer" => MessageRole::System,
        "tool" => MessageRole::Tool,
        _ => MessageRole::Assistant,
    }
}

/// Truncate to `max` characters, appending an ellipsis when anything was cut.
///
/// Operates on char boundaries so multi-byte content never splits.
pub fn truncate_chars(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let cut: String = text.chars().take(max.saturating_sub(3)).collect();
    format!("{cut}...")
}

/// Infer a fence language tag from a file extension.
pub fn language_for_path(path: &str) -> Option<&'static str> {
    let ext = std::path::Path::new(path).extension()?.to_str()?;
    let lang = match ext.to_ascii_lowercase().as_str() {
        "rs" => "rust",
        "ts" | "tsx" => "typescript",
        "js" | "jsx" | "mjs" | "cjs" => "javascript",
        "py" => "python",
        "go" => "go",
        "rb" => "ruby",
        "java" => "java",
        "c" | "h" => "c",
        "cpp" | "cc" | "hpp" => "cpp",
        "cs" => "csharp",
        "sh" | "bash" => "bash",
        "json" => "json",
        "yaml" | "yml" => "yaml",
        "toml" => "toml",
        "md" => "markdown",
        "html" => "html",
        "css" => "css",
        "sql" => "sql",
        _ => return None,
    };
    Some(lang)
}

/// Push `candidate` unless an equal string (case-insensitive) is already
/// present. Returns whether it was added.
pub fn push_unique_ci(items: &mut Vec<String>, candidate: String) -> bool {
    let lower = candidate.to_lowercase();
    if items.iter().any(|existing| existing.to_lowercase() == lower) {
        return false;
    }
    items.push(candidate);
    true
}

/// Sort messages non-strictly ascending by timestamp, preserving source
/// order for ties and for messages without timestamps.
pub fn sort_messages_stable(messages: &mut [ConversationMessage]) {
    messages.sort_by(|a, b| match (a.timestamp, b.timestamp) {
        (Some(ta), Some(tb)) => ta.cmp(&tb),
        _ => std::cmp::Ordering::Equal,
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flatten_plain_string_passes_through() {
        let v = serde_json::json!("hello world");
        assert_eq!(flatten_content(&v), "hello world");
    }

    #[test]
    fn flatten_block_array_joins_text_blocks() {
        let v = serde_json::json!([
            {"type": "text", "text": "first"},
            {"type": "tool_use", "name": "Bash", "input": {}},
            {"type": "output_text", "text": "second"},
        ]);
        assert_eq!(flatten_content(&v), "first\nsecond");
    }

    #[test]
    fn flatten_input_text_blocks_collected() {
        let v = serde_json::json!([{"type": "input_text", "text": "typed"}]);
        assert_eq!(flatten_content(&v), "typed");
    }

    #[test]
    fn flatten_untyped_blocks_default_to_text() {
        let v = serde_json::json!([{"text": "bare"}]);
        assert_eq!(flatten_content(&v), "bare");
    }

    #[test]
    fn parse_timestamp_iso8601() {
        let v = serde_json::json!("2026-01-01T00:00:30Z");
        let dt = parse_timestamp(&v).unwrap();
        assert_eq!(dt.to_rfc3339(), "2026-01-01T00:00:30+00:00");
    }

    #[test]
    fn parse_timestamp_epoch_millis() {
        let v = serde_json::json!(1_700_000_000_123_i64);
        let dt = parse_timestamp(&v).unwrap();
        assert_eq!(dt.timestamp_millis(), 1_700_000_000_123);
    }

    #[test]
    fn parse_timestamp_epoch_seconds_scaled() {
        let v = serde_json::json!(1_700_000_000_i64);
        let dt = parse_timestamp(&v).unwrap();
        assert_eq!(dt.timestamp(), 1_700_000_000);
    }

    #[test]
    fn parse_timestamp_garbage_is_none() {
        assert!(parse_timestamp(&serde_json::json!("not a date")).is_none());
        assert!(parse_timestamp(&serde_json::json!(true)).is_none());
        assert!(parse_timestamp(&serde_json::json!(-5)).is_none());
    }

    #[test]
    fn normalize_role_aliases() {
        assert_eq!(
            normalize_role(&serde_json::json!("developer")),
            MessageRole::System
        );
        assert_eq!(
            normalize_role(&serde_json::json!("human")),
            MessageRole::User
        );
        assert_eq!(
            normalize_role(&serde_json::json!("ai")),
            MessageRole::Assistant
        );
        assert_eq!(normalize_role(&serde_json::json!(1)), MessageRole::User);
        assert_eq!(
            normalize_role(&serde_json::json!(2)),
            MessageRole::Assistant
        );
        assert_eq!(
            normalize_role(&serde_json::json!("mystery")),
            MessageRole::Assistant
        );
    }

    #[test]
    fn truncate_chars_preserves_short_text() {
        assert_eq!(truncate_chars("short", 10), "short");
    }

    #[test]
    fn truncate_chars_appends_ellipsis() {
        let out = truncate_chars("abcdefghij", 8);
        assert_eq!(out, "abcde...");
        assert_eq!(out.chars().count(), 8);
    }

    #[test]
    fn truncate_chars_multibyte_safe() {
        let text = "héllo wörld — ünïcode everywhere";
        let out = truncate_chars(text, 10);
        assert_eq!(out.chars().count(), 10);
    }

    #[test]
    fn language_inference() {
        assert_eq!(language_for_path("src/main.rs"), Some("rust"));
        assert_eq!(language_for_path("app/index.tsx"), Some("typescript"));
        assert_eq!(language_for_path("README"), None);
        assert_eq!(language_for_path("notes.xyz"), None);
    }

    #[test]
    fn push_unique_ci_rejects_case_variants() {
        let mut items = vec!["Use Express".to_string()];
        assert!(!push_unique_ci(&mut items, "use express".to_string()));
        assert!(push_unique_ci(&mut items, "use Fastify".to_string()));
        assert_eq!(items.len(), 2);
    }

    #[test]
    fn sort_messages_keeps_tie_order() {
        let ts = DateTime::parse_from_rfc3339("2026-01-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let mk = |content: &str, t: Option<DateTime<Utc>>| ConversationMessage {
            role: MessageRole::User,
            content: content.to_string(),
            tool_name: None,
            timestamp: t,
            token_count: None,
        };
        let mut msgs = vec![mk("a", Some(ts)), mk("b", Some(ts)), mk("c", None)];
        sort_messages_stable(&mut msgs);
        let order: Vec<&str> = msgs.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(order, vec!["a", "b", "c"]);
    }

    #[test]
    fn canonical_session_serializes_camel_case() {
        let session = CanonicalSession {
            schema_version: SCHEMA_VERSION.to_string(),
            source: "claude-code".to_string(),
            captured_at: Utc::now(),
            session_id: "abc".to_string(),
            session_started_at: None,
            project: ProjectContext::bare(PathBuf::from("/tmp/proj")),
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
        };
        let json = serde_json::to_value(&session).unwrap();
        assert_eq!(json["schemaVersion"], "1.0");
        assert!(json.get("sessionId").is_some());
        assert!(json.get("filesChanged").is_some());
        assert!(json["conversation"].get("messageCount").is_some());
        // Optional absent fields are omitted entirely.
        assert!(json.get("toolActivity").is_none());
        assert!(json.get("sessionStartedAt").is_none());
    }
}
