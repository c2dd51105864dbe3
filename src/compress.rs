//! Priority-layered compression engine.
//!
//! Renders a captured session into named layers, then packs them into a
//! token budget with a deterministic truncate-and-drop policy. Layers 1–3
//! carry state the user has already paid for (task, files, decisions); they
//! truncate before they drop. Layers 4–7 are context aids and degrade
//! gracefully.
//!
//! Token estimation is `ceil(chars / 4)` throughout — deliberately cheap
//! and deterministic; the packing policy tolerates the imprecision because
//! high-priority layers are allowed to truncate.

use crate::model::{CanonicalSession, MessageRole, truncate_chars};
use crate::registry;

/// Tokens reserved for the prompt builder's header and footer.
const HEADER_RESERVE: u64 = 400;

/// Default budget for clipboard/file targets.
const DEFAULT_BUDGET: u64 = 19_000;

/// Margin below which low-priority layers are dropped rather than truncated.
const TRUNCATE_MARGIN: u64 = 200;

const MAX_ACTIVE_FILES: usize = 15;
const DIFF_CHAR_LIMIT: usize = 2000;
const RECENT_MESSAGE_COUNT: usize = 20;
const RECENT_MESSAGE_CHARS: usize = 1000;
const HISTORY_MESSAGE_CHARS: usize = 500;

/// Priorities are scaled by ten so the tool-activity layer can sit between
/// project context (4) and session overview (5).
const PRIO_TASK: u32 = 10;
const PRIO_FILES: u32 = 20;
const PRIO_DECISIONS: u32 = 30;
const PRIO_PROJECT: u32 = 40;
const PRIO_TOOLS: u32 = 45;
const PRIO_OVERVIEW: u32 = 50;
const PRIO_RECENT: u32 = 60;
const PRIO_HISTORY: u32 = 70;

/// One named, priority-tagged section of the compressed prompt.
#[derive(Debug, Clone)]
pub struct Layer {
    pub name: &'static str,
    pub priority: u32,
    pub body: String,
    pub tokens: u64,
}

/// Compression inputs.
#[derive(Debug, Clone, Default)]
pub struct CompressOptions {
    /// Explicit budget; wins over the target table.
    pub target_tokens: Option<u64>,
    /// Known agent slug, or `clipboard`/`file`.
    pub target_agent: Option<String>,
}

/// Compression output.
#[derive(Debug, Clone, PartialEq)]
pub struct Compressed {
    pub content: String,
    pub total_tokens: u64,
    pub included_layers: Vec<String>,
    pub dropped_layers: Vec<String>,
}

/// `ceil(chars / 4)` — the sole token measure used anywhere.
pub fn estimate_tokens(text: &str) -> u64 {
    (text.chars().count() as u64).div_ceil(4)
}

/// Resolve the packing budget from the options.
pub fn budget_for(options: &CompressOptions) -> u64 {
    if let Some(explicit) = options.target_tokens {
        return explicit;
    }
    match options.target_agent.as_deref() {
        Some(agent) => registry::spec_for(agent)
            .map(|spec| u64::from(spec.usable_budget))
            .unwrap_or(DEFAULT_BUDGET),
        None => DEFAULT_BUDGET,
    }
}

/// Compress a session into its layered hand-off body.
pub fn compress(session: &CanonicalSession, options: &CompressOptions) -> Compressed {
    let budget = budget_for(options).saturating_sub(HEADER_RESERVE);

    let mut layers = build_layers(session);
    layers.sort_by_key(|l| l.priority);

    let mut remaining = budget;
    let mut included = Vec::new();
    let mut dropped = Vec::new();
    let mut bodies: Vec<String> = Vec::new();
    let mut total = 0u64;

    for layer in layers {
        if layer.tokens <= remaining {
            remaining -= layer.tokens;
            total += layer.tokens;
            included.push(layer.name.to_string());
            bodies.push(layer.body);
            continue;
        }

        // Task state must survive any sane budget; the other paid-for
        // layers truncate only while a useful margin remains.
        let may_truncate = (layer.priority == PRIO_TASK && remaining > 0)
            || (layer.priority <= PRIO_DECISIONS && remaining > TRUNCATE_MARGIN);
        if may_truncate {
            let keep_chars = (remaining * 4) as usize;
            let prefix: String = layer.body.chars().take(keep_chars).collect();
            total += remaining;
            remaining = 0;
            included.push(layer.name.to_string());
            bodies.push(prefix);
        } else {
            dropped.push(layer.name.to_string());
        }
    }

    Compressed {
        content: bodies.join("\n\n"),
        total_tokens: total,
        included_layers: included,
        dropped_layers: dropped,
    }
}

// ---------------------------------------------------------------------------
// Layer construction
// ---------------------------------------------------------------------------

fn layer(name: &'static str, priority: u32, body: String) -> Layer {
    let tokens = estimate_tokens(&body);
    Layer {
        name,
        priority,
        body,
        tokens,
    }
}

/// Render all eight layers for a session, unsorted.
pub fn build_layers(session: &CanonicalSession) -> Vec<Layer> {
    let mut layers = vec![
        layer("TASK STATE", PRIO_TASK, render_task_state(session)),
        layer("ACTIVE FILES", PRIO_FILES, render_active_files(session)),
        layer(
            "DECISIONS & BLOCKERS",
            PRIO_DECISIONS,
            render_decisions(session),
        ),
        layer(
            "PROJECT CONTEXT",
            PRIO_PROJECT,
            render_project_context(session),
        ),
        layer(
            "SESSION OVERVIEW",
            PRIO_OVERVIEW,
            render_overview(session),
        ),
        layer(
            "RECENT MESSAGES",
            PRIO_RECENT,
            render_recent_messages(session),
        ),
        layer("FULL HISTORY", PRIO_HISTORY, render_full_history(session)),
    ];
    if let Some(body) = render_tool_activity(session) {
        layers.push(layer("TOOL ACTIVITY", PRIO_TOOLS, body));
    }
    layers
}

fn render_task_state(session: &CanonicalSession) -> String {
    let task = &session.task;
    let mut out = String::from("## TASK STATE\n\n");
    out.push_str(&format!("Task: {}\n", task.description));
    if !task.completed.is_empty() {
        out.push_str("\nCompleted:\n");
        for step in &task.completed {
            out.push_str(&format!("- {step}\n"));
        }
    }
    if let Some(in_progress) = &task.in_progress {
        out.push_str(&format!("\nIn progress: {in_progress}\n"));
    }
    if !task.remaining.is_empty() {
        out.push_str("\nRemaining:\n");
        for step in &task.remaining {
            out.push_str(&format!("- {step}\n"));
        }
    }
    if !task.blockers.is_empty() {
        out.push_str("\nBlockers:\n");
        for blocker in &task.blockers {
            out.push_str(&format!("- {blocker}\n"));
        }
    }
    out.trim_end().to_string()
}

fn render_active_files(session: &CanonicalSession) -> String {
    let mut out = String::from("## ACTIVE FILES\n");
    if session.files_changed.is_empty() {
        out.push_str("\n(no file changes recorded)");
        return out;
    }
    for change in session.files_changed.iter().take(MAX_ACTIVE_FILES) {
        out.push_str(&format!(
            "\n### {} ({:?})\n",
            change.path,
            change.change_type
        ));
        if let Some(diff) = &change.diff {
            let fence_lang = change.language.as_deref().unwrap_or("");
            out.push_str(&format!(
                "```{fence_lang}\n{}\n```\n",
                truncate_chars(diff, DIFF_CHAR_LIMIT)
            ));
        }
    }
    out.trim_end().to_string()
}

fn render_decisions(session: &CanonicalSession) -> String {
    let mut out = String::from("## DECISIONS & BLOCKERS\n");
    if !session.decisions.is_empty() {
        out.push_str("\nDecisions:\n");
        for (i, decision) in session.decisions.iter().enumerate() {
            out.push_str(&format!("{}. {decision}\n", i + 1));
        }
    }
    if !session.blockers.is_empty() {
        out.push_str("\nBlockers:\n");
        for blocker in &session.blockers {
            out.push_str(&format!("- {blocker}\n"));
        }
    }
    if session.decisions.is_empty() && session.blockers.is_empty() {
        out.push_str("\n(none recorded)");
    }
    out.trim_end().to_string()
}

fn render_project_context(session: &CanonicalSession) -> String {
    let project = &session.project;
    let mut out = String::from("## PROJECT CONTEXT\n\n");
    out.push_str(&format!("Path: {}\n", project.path.display()));
    if let Some(name) = &project.name {
        out.push_str(&format!("Name: {name}\n"));
    }
    if let Some(branch) = &project.git_branch {
        out.push_str(&format!("Branch: {branch}\n"));
    }
    if let Some(status) = &project.git_status {
        out.push_str(&format!("\nGit status:\n{status}\n"));
    }
    if let Some(log) = &project.git_log {
        out.push_str("\nRecent commits:\n");
        for line in log {
            out.push_str(&format!("{line}\n"));
        }
    }
    if let Some(structure) = &project.structure {
        out.push_str(&format!("\nStructure:\n{structure}\n"));
    }
    if let Some(memory) = &project.memory_file_contents {
        out.push_str(&format!("\nMemory file:\n{memory}\n"));
    }
    out.trim_end().to_string()
}

fn render_tool_activity(session: &CanonicalSession) -> Option<String> {
    let activity = session.tool_activity.as_ref()?;
    if activity.is_empty() {
        return None;
    }
    let mut out = String::from("## TOOL ACTIVITY\n\n");
    for summary in activity {
        let samples = summary.samples.join(" . ");
        out.push_str(&format!(
            "{} (\u{00d7}{}): {samples}\n",
            summary.name, summary.count
        ));
    }
    Some(out.trim_end().to_string())
}

fn render_overview(session: &CanonicalSession) -> String {
    let conv = &session.conversation;
    let first_user = conv
        .messages
        .iter()
        .find(|m| m.role == MessageRole::User)
        .map(|m| truncate_chars(&m.content, 200));
    let last_user = conv
        .messages
        .iter()
        .rev()
        .find(|m| m.role == MessageRole::User)
        .map(|m| truncate_chars(&m.content, 200));

    let mut tools: Vec<&str> = conv
        .messages
        .iter()
        .filter_map(|m| m.tool_name.as_deref())
        .collect();
    tools.sort_unstable();
    tools.dedup();

    let mut out = String::from("## SESSION OVERVIEW\n\n");
    out.push_str(&format!("Messages: {}\n", conv.message_count));
    out.push_str(&format!("Estimated tokens: {}\n", conv.estimated_tokens));
    if let Some(first) = first_user {
        out.push_str(&format!("First user message: {first}\n"));
    }
    if let Some(last) = last_user {
        out.push_str(&format!("Last user message: {last}\n"));
    }
    if !tools.is_empty() {
        out.push_str(&format!("Tools used: {}\n", tools.join(", ")));
    }
    out.trim_end().to_string()
}

fn role_tag(role: MessageRole) -> &'static str {
    match role {
        MessageRole::User => "user",
        MessageRole::Assistant => "assistant",
        MessageRole::System => "system",
        MessageRole::Tool => "tool",
    }
}

fn render_recent_messages(session: &CanonicalSession) -> String {
    let messages = &session.conversation.messages;
    let start = messages.len().saturating_sub(RECENT_MESSAGE_COUNT);
    let mut out = String::from("## RECENT MESSAGES\n\n");
    if messages.is_empty() {
        out.push_str("(no messages)");
        return out;
    }
    for msg in &messages[start..] {
        out.push_str(&format!(
            "[{}] {}\n",
            role_tag(msg.role),
            truncate_chars(&msg.content, RECENT_MESSAGE_CHARS)
        ));
    }
    out.trim_end().to_string()
}

fn render_full_history(session: &CanonicalSession) -> String {
    let messages = &session.conversation.messages;
    let cutoff = messages.len().saturating_sub(RECENT_MESSAGE_COUNT);
    let mut out = String::from("## FULL HISTORY\n\n");
    if cutoff == 0 {
        out.push_str("(no earlier history)");
        return out;
    }
    for msg in &messages[..cutoff] {
        out.push_str(&format!(
            "[{}] {}\n",
            role_tag(msg.role),
            truncate_chars(&msg.content, HISTORY_MESSAGE_CHARS)
        ));
    }
    out.trim_end().to_string()
}
