//! Shared machinery for append-only JSONL session streams.
//!
//! The text-stream sources (claude-code, codex, droid) differ in envelope
//! shape but share the same tolerance and normalization rules:
//!
//! - read line by line; the trailing line of an active session may be a
//!   partial write and is discarded silently
//! - any non-JSON line is skipped without failing the session
//! - duplicate message identifiers keep the first occurrence only
//! - content is a string or an ordered block list; tool blocks become
//!   synthetic `tool`-role messages
//! - recognized write/edit/create/delete tool calls produce file changes
//! - usage blocks accumulate into the session token estimate

use std::collections::HashSet;
use std::io::BufRead;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use tracing::{debug, trace};

use crate::model::{
    ChangeType, ConversationMessage, FileChange, MessageRole, flatten_content, language_for_path,
};

/// One tolerated line from a JSONL stream.
#[derive(Debug)]
pub struct StreamEntry {
    pub line_number: usize,
    pub value: serde_json::Value,
}

/// Stream every valid JSON line of `path` through `f`.
///
/// Unreadable or malformed lines (including a partial trailing write) are
/// skipped; the session never fails because of one bad line. Returns the
/// number of skipped lines.
pub fn for_each_json_line<F>(path: &Path, mut f: F) -> anyhow::Result<usize>
where
    F: FnMut(StreamEntry),
{
    use anyhow::Context;

    let file = std::fs::File::open(path)
        .with_context(|| format!("failed to open {}", path.display()))?;
    let reader = std::io::BufReader::new(file);

    let mut skipped = 0usize;
    for (idx, line_result) in reader.lines().enumerate() {
        let line_number = idx + 1;
        let line = match line_result {
            Ok(l) => l,
            Err(e) => {
                debug!(line = line_number, error = %e, "skipping unreadable line");
                skipped += 1;
                continue;
            }
        };
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        match serde_json::from_str::<serde_json::Value>(trimmed) {
            Ok(value) => f(StreamEntry { line_number, value }),
            Err(e) => {
                trace!(line = line_number, error = %e, "skipping malformed JSON line");
                skipped += 1;
            }
        }
    }
    Ok(skipped)
}

/// Accumulates normalized messages, file changes, and token totals while an
/// adapter walks its native entries.
#[derive(Debug, Default)]
pub struct MessageCollector {
    seen_ids: HashSet<String>,
    messages: Vec<ConversationMessage>,
    files: Vec<FileChange>,
    total_tokens: u64,
    project_path: Option<PathBuf>,
}

/// Finished output of a [`MessageCollector`].
#[derive(Debug)]
pub struct Collected {
    pub messages: Vec<ConversationMessage>,
    pub files_changed: Vec<FileChange>,
    pub estimated_tokens: u64,
    pub project_path: Option<PathBuf>,
}

impl MessageCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a message id; returns `true` when it was already seen (the
    /// caller must then drop the whole entry, including its usage tokens).
    pub fn is_duplicate(&mut self, id: Option<&str>) -> bool {
        match id {
            Some(id) => !self.seen_ids.insert(id.to_string()),
            None => false,
        }
    }

    /// Record the project path from a per-entry `cwd`; first one wins.
    pub fn note_project_path(&mut self, value: Option<&serde_json::Value>) {
        if self.project_path.is_some() {
            return;
        }
        if let Some(cwd) = value.and_then(|v| v.as_str())
            && !cwd.is_empty()
        {
            self.project_path = Some(PathBuf::from(cwd));
        }
    }

    pub fn has_project_path(&self) -> bool {
        self.project_path.is_some()
    }

    pub fn set_project_path_fallback(&mut self, path: Option<PathBuf>) {
        if self.project_path.is_none() {
            self.project_path = path;
        }
    }

    /// Add usage tokens from an entry's usage block.
    pub fn add_usage(&mut self, usage: Option<&serde_json::Value>) {
        self.total_tokens += usage_tokens(usage);
    }

    /// Normalize one entry's role + content into messages.
    ///
    /// Text blocks collapse into a single message; each `tool_use` /
    /// `tool_result` block becomes its own synthetic `tool` message, in
    /// block order after the text.
    pub fn push_content(
        &mut self,
        role: MessageRole,
        content: &serde_json::Value,
        timestamp: Option<DateTime<Utc>>,
    ) {
        let text = flatten_content(content);
        if !text.trim().is_empty() {
            self.messages.push(ConversationMessage {
                role,
                content: text,
                tool_name: None,
                timestamp,
                token_count: None,
            });
        }

        let Some(blocks) = content.as_array() else {
            return;
        };
        for block in blocks {
            let Some(obj) = block.as_object() else { continue };
            match obj.get("type").and_then(|v| v.as_str()) {
                Some("tool_use" | "toolCall" | "function_call") => {
                    let name = obj
                        .get("name")
                        .and_then(|v| v.as_str())
                        .unwrap_or("unknown")
                        .to_string();
                    let args = obj
                        .get("input")
                        .or_else(|| obj.get("arguments"))
                        .cloned()
                        .unwrap_or(serde_json::Value::Null);
                    self.push_tool_use(&name, &args, timestamp);
                }
                Some("tool_result" | "toolResult" | "function_call_output") => {
                    let body = obj
                        .get("content")
                        .or_else(|| obj.get("output"))
                        .map(flatten_content)
                        .unwrap_or_default();
                    self.push_tool_result(None, &body, timestamp);
                }
                _ => {}
            }
        }
    }

    /// Record a tool invocation as a synthetic `tool` message and, when the
    /// tool is a recognized file operation, a file change.
    pub fn push_tool_use(
        &mut self,
        name: &str,
        args: &serde_json::Value,
        timestamp: Option<DateTime<Utc>>,
    ) {
        let payload = serde_json::to_string(args).unwrap_or_default();
        self.messages.push(ConversationMessage {
            role: MessageRole::Tool,
            content: payload,
            tool_name: Some(name.to_string()),
            timestamp,
            token_count: None,
        });

        if let Some(change) = file_change_for_tool(name, args) {
            self.upsert_file_change(change);
        }
    }

    /// Record a tool result as a synthetic `tool` message.
    pub fn push_tool_result(
        &mut self,
        name: Option<&str>,
        content: &str,
        timestamp: Option<DateTime<Utc>>,
    ) {
        self.messages.push(ConversationMessage {
            role: MessageRole::Tool,
            content: content.to_string(),
            tool_name: name.map(String::from),
            timestamp,
            token_count: None,
        });
    }

    /// Last write wins per path.
    fn upsert_file_change(&mut self, change: FileChange) {
        if let Some(existing) = self.files.iter_mut().find(|f| f.path == change.path) {
            *existing = change;
        } else {
            self.files.push(change);
        }
    }

    pub fn message_count(&self) -> usize {
        self.messages.len()
    }

    pub fn finish(self) -> Collected {
        Collected {
            messages: self.messages,
            files_changed: self.files,
            estimated_tokens: self.total_tokens,
            project_path: self.project_path,
        }
    }
}

/// Sum `input + output` tokens from a usage block, accepting the
/// `prompt_tokens`/`completion_tokens` aliases.
pub fn usage_tokens(usage: Option<&serde_json::Value>) -> u64 {
    let Some(usage) = usage else { return 0 };
    let read = |keys: [&str; 2]| {
        keys.iter()
            .find_map(|k| usage.get(*k))
            .and_then(|v| v.as_u64())
            .unwrap_or(0)
    };
    read(["input_tokens", "prompt_tokens"]) + read(["output_tokens", "completion_tokens"])
}

// ---------------------------------------------------------------------------
// File-change recognition
// ---------------------------------------------------------------------------

/// Argument keys that commonly carry the target path.
const PATH_KEYS: &[&str] = &["path", "file_path", "filePath", "target"];

/// Map a tool invocation to a file change, when it is a file operation.
fn file_change_for_tool(name: &str, args: &serde_json::Value) -> Option<FileChange> {
    let lower = name.to_lowercase();

    let change_type = if lower.contains("delete") || lower.contains("remove") {
        Some(ChangeType::Deleted)
    } else if lower.contains("create") || lower.contains("write") {
        Some(ChangeType::Created)
    } else if lower.contains("edit") || lower.contains("patch") || lower.contains("replace") {
        Some(ChangeType::Modified)
    } else {
        None
    };

    if let Some(change_type) = change_type {
        let path = PATH_KEYS
            .iter()
            .find_map(|k| args.get(*k))
            .and_then(|v| v.as_str())?
            .to_string();
        let diff = args
            .get("diff")
            .or_else(|| args.get("content"))
            .or_else(|| args.get("new_string"))
            .or_else(|| args.get("new_str"))
            .and_then(|v| v.as_str())
            .map(String::from);
        let language = language_for_path(&path).map(String::from);
        return Some(FileChange {
            path,
            change_type,
            diff,
            language,
        });
    }

    // Shell invocations: only a trailing redirection names a file.
    if matches!(
        lower.as_str(),
        "bash" | "shell" | "run" | "exec" | "terminal" | "run_command" | "execute"
    ) {
        let command = args
            .get("command")
            .or_else(|| args.get("cmd"))
            .and_then(|v| v.as_str())?;
        return redirection_target(command);
    }

    None
}

/// Extract `> path` / `>> path` from the tail of a shell command.
fn redirection_target(command: &str) -> Option<FileChange> {
    let trimmed = command.trim();
    let (rest, change_type) = if let Some(pos) = trimmed.rfind(">>") {
        (&trimmed[pos + 2..], ChangeType::Modified)
    } else if let Some(pos) = trimmed.rfind('>') {
        (&trimmed[pos + 1..], ChangeType::Created)
    } else {
        return None;
    };

    let target = rest.trim();
    // A redirection target is a single bare token at the end of the command.
    if target.is_empty() || target.contains(char::is_whitespace) {
        return None;
    }
    let path = target.trim_matches(['"', '\'']).to_string();
    let language = language_for_path(&path).map(String::from);
    Some(FileChange {
        path,
        change_type,
        diff: None,
        language,
    })
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    fn write_jsonl(content: &str) -> tempfile::NamedTempFile {
        let mut tmp = tempfile::NamedTempFile::with_suffix(".jsonl").unwrap();
        tmp.write_all(content.as_bytes()).unwrap();
        tmp.flush().unwrap();
        tmp
    }

    #[test]
    fn tolerant_reader_skips_bad_lines() {
        let tmp = write_jsonl("{\"a\":1}\nnot json\n{\"b\":2}\n{\"trailing\": ");
        let mut seen = 0;
        let skipped = for_each_json_line(tmp.path(), |_| seen += 1).unwrap();
        assert_eq!(seen, 2);
        assert_eq!(skipped, 2);
    }

    #[test]
    fn tolerant_reader_empty_file() {
        let tmp = write_jsonl("");
        let mut seen = 0;
        let skipped = for_each_json_line(tmp.path(), |_| seen += 1).unwrap();
        assert_eq!(seen, 0);
        assert_eq!(skipped, 0);
    }

    #[test]
    fn duplicate_ids_keep_first() {
        let mut c = MessageCollector::new();
        assert!(!c.is_duplicate(Some("m1")));
        assert!(c.is_duplicate(Some("m1")));
        assert!(!c.is_duplicate(Some("m2")));
        assert!(!c.is_duplicate(None));
        assert!(!c.is_duplicate(None));
    }

    #[test]
    fn usage_tokens_with_aliases() {
        let v = serde_json::json!({"input_tokens": 10, "output_tokens": 5});
        assert_eq!(usage_tokens(Some(&v)), 15);
        let v = serde_json::json!({"prompt_tokens": 7, "completion_tokens": 3});
        assert_eq!(usage_tokens(Some(&v)), 10);
        assert_eq!(usage_tokens(None), 0);
        assert_eq!(usage_tokens(Some(&serde_json::json!({}))), 0);
    }

    #[test]
    fn push_content_splits_text_and_tool_blocks() {
        let mut c = MessageCollector::new();
        let content = serde_json::json!([
            {"type": "text", "text": "Editing now."},
            {"type": "tool_use", "name": "Edit", "input": {"file_path": "src/lib.rs", "new_string": "pub fn x() {}"}},
            {"type": "tool_result", "content": "ok"},
        ]);
        c.push_content(MessageRole::Assistant, &content, None);
        let out = c.finish();
        assert_eq!(out.messages.len(), 3);
        assert_eq!(out.messages[0].role, MessageRole::Assistant);
        assert_eq!(out.messages[1].role, MessageRole::Tool);
        assert_eq!(out.messages[1].tool_name.as_deref(), Some("Edit"));
        assert_eq!(out.messages[2].role, MessageRole::Tool);
        assert_eq!(out.files_changed.len(), 1);
        assert_eq!(out.files_changed[0].path, "src/lib.rs");
        assert_eq!(out.files_changed[0].change_type, ChangeType::Modified);
        assert_eq!(out.files_changed[0].language.as_deref(), Some("rust"));
    }

    #[test]
    fn file_change_last_write_wins() {
        let mut c = MessageCollector::new();
        c.push_tool_use(
            "Write",
            &serde_json::json!({"file_path": "a.ts", "content": "v1"}),
            None,
        );
        c.push_tool_use(
            "Edit",
            &serde_json::json!({"file_path": "a.ts", "new_string": "v2"}),
            None,
        );
        let out = c.finish();
        assert_eq!(out.files_changed.len(), 1);
        assert_eq!(out.files_changed[0].change_type, ChangeType::Modified);
        assert_eq!(out.files_changed[0].diff.as_deref(), Some("v2"));
    }

    #[test]
    fn delete_tool_recognized() {
        let change = file_change_for_tool(
            "delete_file",
            &serde_json::json!({"path": "obsolete.py"}),
        )
        .unwrap();
        assert_eq!(change.change_type, ChangeType::Deleted);
        assert_eq!(change.language.as_deref(), Some("python"));
    }

    #[test]
    fn shell_redirection_extracted() {
        let change = file_change_for_tool(
            "bash",
            &serde_json::json!({"command": "cargo tree > deps.txt"}),
        )
        .unwrap();
        assert_eq!(change.path, "deps.txt");
        assert_eq!(change.change_type, ChangeType::Created);
    }

    #[test]
    fn shell_append_redirection_is_modify() {
        let change = file_change_for_tool(
            "shell",
            &serde_json::json!({"command": "echo done >> log.txt"}),
        )
        .unwrap();
        assert_eq!(change.change_type, ChangeType::Modified);
    }

    #[test]
    fn shell_without_redirection_skipped() {
        assert!(
            file_change_for_tool("bash", &serde_json::json!({"command": "ls -la"})).is_none()
        );
        // Redirection into a pipeline tail with extra tokens is not a path.
        assert!(
            file_change_for_tool(
                "bash",
                &serde_json::json!({"command": "grep x > out.txt && echo ok"})
            )
            .is_none()
        );
    }

    #[test]
    fn unknown_tool_without_path_skipped() {
        assert!(file_change_for_tool("Read", &serde_json::json!({"file_path": "x"})).is_none());
        assert!(file_change_for_tool("Write", &serde_json::json!({})).is_none());
    }

    #[test]
    fn note_project_path_first_wins() {
        let mut c = MessageCollector::new();
        c.note_project_path(Some(&serde_json::json!("/first")));
        c.note_project_path(Some(&serde_json::json!("/second")));
        assert_eq!(c.finish().project_path, Some(PathBuf::from("/first")));
    }
}
