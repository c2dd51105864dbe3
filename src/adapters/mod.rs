//! Adapter framework — one module per source assistant, all implementing
//! [`AgentAdapter`].
//!
//! Adapters are strictly read-only toward source storage. Each one knows how
//! to discover its storage root, enumerate sessions cheaply, and fully
//! normalize a single session into a [`CanonicalSession`] that has passed
//! the schema gate.

pub mod claude_code;
pub mod codex;
pub mod copilot;
pub mod cursor;
pub mod droid;
pub mod gemini;
pub mod opencode;
mod stream;

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};

use crate::analyzer;
use crate::error::HandoffError;
use crate::model::{
    CanonicalSession, Conversation, ConversationMessage, FileChange, MessageRole, ProjectContext,
    TaskState, ToolActivitySummary, truncate_chars,
};
use crate::validate::validate_session;

pub use stream::StreamEntry;

/// Cheap per-session summary returned by `list_sessions`.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionInfo {
    pub id: String,
    pub started_at: Option<DateTime<Utc>>,
    pub last_active_at: Option<DateTime<Utc>>,
    pub message_count: usize,
    pub project_path: Option<PathBuf>,
    /// First user text, at most 200 chars.
    pub preview: String,
}

/// One source assistant's storage, behind a uniform read-only interface.
pub trait AgentAdapter {
    /// Stable slug matching the registry row.
    fn slug(&self) -> &'static str;

    fn display_name(&self) -> &'static str;

    /// Whether this source is plausibly installed on this host. Pure check;
    /// a missing storage root is `false`, never an error.
    fn detect(&self) -> bool;

    /// Enumerate sessions, most recent first. Transient read failures on
    /// individual sessions are skipped, not propagated.
    fn list_sessions(&self, project_path: Option<&Path>) -> anyhow::Result<Vec<SessionInfo>>;

    /// Fully normalize one session. Fails `NotFound` for unknown ids,
    /// `Malformed` for invalid id shapes or validation failures, `Locked`
    /// when the store cannot be opened read-only.
    fn capture(&self, session_id: &str) -> anyhow::Result<CanonicalSession>;

    /// Capture the most recent session, optionally scoped to a project.
    fn capture_latest(&self, project_path: Option<&Path>) -> anyhow::Result<CanonicalSession> {
        let sessions = self.list_sessions(project_path)?;
        let first = sessions.first().ok_or_else(|| HandoffError::SessionNotFound {
            source_name: self.slug().to_string(),
            session_id: "<latest>".to_string(),
        })?;
        self.capture(&first.id)
    }
}

/// All concrete adapters, in registry order.
pub fn all() -> Vec<Box<dyn AgentAdapter>> {
    vec![
        Box::new(claude_code::ClaudeCode),
        Box::new(cursor::Cursor),
        Box::new(codex::Codex),
        Box::new(copilot::Copilot),
        Box::new(gemini::Gemini),
        Box::new(opencode::OpenCode),
        Box::new(droid::Droid),
    ]
}

/// Sort a listing most-recent-first by `lastActiveAt`, then `startedAt`.
pub fn sort_by_recency(sessions: &mut [SessionInfo]) {
    sessions.sort_by(|a, b| {
        let key = |s: &SessionInfo| (s.last_active_at, s.started_at);
        key(b).cmp(&key(a))
    });
}

/// Assemble and validate a canonical record from adapter-parsed parts.
///
/// Runs the conversation analyzer to populate task state, decisions, and
/// blockers; aggregates tool activity; sorts messages; stamps the capture
/// instant. Every adapter funnels through here so the schema gate runs on
/// exactly one path.
pub fn assemble_session(
    source: &'static str,
    session_id: String,
    project_path: Option<PathBuf>,
    mut messages: Vec<ConversationMessage>,
    files_changed: Vec<FileChange>,
    estimated_tokens: u64,
) -> anyhow::Result<CanonicalSession> {
    crate::model::sort_messages_stable(&mut messages);

    let analysis = analyzer::analyze(&messages);
    let tool_activity = aggregate_tool_activity(&messages);
    let session_started_at = messages.iter().find_map(|m| m.timestamp);

    let project = ProjectContext::bare(absolute_project_path(project_path));

    let session = CanonicalSession {
        schema_version: crate::model::SCHEMA_VERSION.to_string(),
        source: source.to_string(),
        captured_at: Utc::now(),
        session_id,
        session_started_at,
        project,
        conversation: Conversation {
            message_count: messages.len(),
            estimated_tokens,
            messages,
        },
        files_changed,
        decisions: analysis.decisions,
        blockers: analysis.blockers.clone(),
        task: TaskState {
            description: analysis.task_description,
            completed: analysis.completed_steps,
            remaining: Vec::new(),
            in_progress: None,
            blockers: analysis.blockers,
        },
        tool_activity,
    };

    validate_session(&session)?;
    Ok(session)
}

/// Project path invariant: always absolute, falling back to the caller's
/// working directory.
fn absolute_project_path(candidate: Option<PathBuf>) -> PathBuf {
    match candidate {
        Some(p) if p.is_absolute() => p,
        _ => std::env::current_dir().unwrap_or_else(|_| PathBuf::from("/")),
    }
}

/// Aggregate synthetic tool messages into per-tool summaries.
fn aggregate_tool_activity(
    messages: &[ConversationMessage],
) -> Option<Vec<ToolActivitySummary>> {
    let mut order: Vec<String> = Vec::new();
    let mut summaries: std::collections::HashMap<String, ToolActivitySummary> =
        std::collections::HashMap::new();

    for msg in messages {
        if msg.role != MessageRole::Tool {
            continue;
        }
        let Some(name) = &msg.tool_name else { continue };
        let entry = summaries.entry(name.clone()).or_insert_with(|| {
            order.push(name.clone());
            ToolActivitySummary {
                name: name.clone(),
                count: 0,
                samples: Vec::new(),
            }
        });
        entry.count += 1;
        if entry.samples.len() < 3 {
            let one_liner = msg.content.lines().next().unwrap_or("");
            if !one_liner.is_empty() {
                entry.samples.push(truncate_chars(one_liner, 120));
            }
        }
    }

    if order.is_empty() {
        return None;
    }
    Some(
        order
            .into_iter()
            .filter_map(|name| summaries.remove(&name))
            .collect(),
    )
}

/// Build a listing preview from the first user message.
pub fn preview_from_messages(messages: &[ConversationMessage]) -> String {
    messages
        .iter()
        .find(|m| m.role == MessageRole::User && !m.content.trim().is_empty())
        .map(|m| truncate_chars(m.content.trim().lines().next().unwrap_or(""), 200))
        .unwrap_or_default()
}
