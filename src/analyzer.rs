//! Conversation analyzer — derives structured task state from free-form
//! chat messages.
//!
//! Pure: `analyze(messages)` never touches disk and is deterministic. The
//! extraction rules are fixed pattern tables; emission order is first-seen
//! order in the message stream, deduplicated case-insensitively.

use std::sync::LazyLock;

use regex::Regex;

use crate::model::{ConversationMessage, MessageRole, push_unique_ci, truncate_chars};

/// Output of [`analyze`].
#[derive(Debug, Clone, PartialEq)]
pub struct Analysis {
    /// ≤ 300 chars; `"Unknown task"` when nothing meaningful exists.
    pub task_description: String,
    /// ≤ 10 entries.
    pub decisions: Vec<String>,
    /// ≤ 10 entries, each ≤ 160 chars.
    pub blockers: Vec<String>,
    /// ≤ 15 entries, each ≤ 100 chars.
    pub completed_steps: Vec<String>,
}

const MAX_DECISIONS: usize = 10;
const MAX_BLOCKERS: usize = 10;
const MAX_COMPLETED: usize = 15;
const TASK_DESCRIPTION_MAX: usize = 300;
const BLOCKER_MAX: usize = 160;
const COMPLETED_MAX: usize = 100;

/// Short replies that carry no task information.
const ACKNOWLEDGEMENTS: &[&str] = &[
    "yes",
    "ok",
    "okay",
    "sure",
    "continue",
    "go ahead",
    "proceed",
    "sounds good",
    "do it",
    "yep",
    "yeah",
];

static INTERRUPTED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)interrupted").expect("static regex"));

/// Sentences matching any of these are recorded as decisions.
static DECISION_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"(?i)\bI'll (?:use|choose|pick)\b",
        r"(?i)\blet's (?:use|go with)\b",
        r"(?i)\bdecided to\b",
        r"(?i)\bchoosing\b.+\bover\b",
        r"(?i)\bbetter to use\b",
        r"(?i)\bis better than\b",
        r"(?i)\busing\b.+\bfor\b",
        r"(?i)\bpicked\b.+\bbecause\b",
        r"(?i)\binstead of\b",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("static regex"))
    .collect()
});

/// Substrings that flag a line as a blocker.
const BLOCKER_NEEDLES: &[&str] = &[
    "error",
    "failed",
    "unable to",
    "can't",
    "cannot",
    "permission denied",
    "not found",
    "404",
    "500",
    "timeout",
    "econnrefused",
];

static STACK_FRAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^at \S+").expect("static regex"));

static COMPLETION_VERB: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(?:done|completed|finished|created|added|updated|fixed|implemented|resolved|configured|refactored|verified)\b",
    )
    .expect("static regex")
});

static FUTURE_TENSE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:I'll|I will|we'll|going to)\b").expect("static regex")
});

static LEADING_BULLET: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[\s\-\*\d\.\)]+").expect("static regex"));

/// Derive task description, decisions, blockers, and completed steps.
pub fn analyze(messages: &[ConversationMessage]) -> Analysis {
    Analysis {
        task_description: extract_task_description(messages),
        decisions: extract_decisions(messages),
        blockers: extract_blockers(messages),
        completed_steps: extract_completed_steps(messages),
    }
}

// ---------------------------------------------------------------------------
// Task description
// ---------------------------------------------------------------------------

/// A message is meaningful when it is long enough to describe work, is not a
/// bracketed host notice, not a bare acknowledgement, and not an
/// interruption marker.
fn is_meaningful(text: &str) -> bool {
    let trimmed = text.trim();
    if trimmed.chars().count() < 15 || trimmed.starts_with('[') {
        return false;
    }
    let bare = trimmed
        .trim_end_matches(['.', '!', '?'])
        .to_lowercase();
    if ACKNOWLEDGEMENTS.contains(&bare.as_str()) {
        return false;
    }
    !INTERRUPTED.is_match(trimmed)
}

fn extract_task_description(messages: &[ConversationMessage]) -> String {
    let first_meaningful = |role: MessageRole| {
        messages
            .iter()
            .filter(|m| m.role == role)
            .find(|m| is_meaningful(&m.content))
            .map(|m| truncate_chars(m.content.trim(), TASK_DESCRIPTION_MAX))
    };

    first_meaningful(MessageRole::User)
        .or_else(|| first_meaningful(MessageRole::Assistant))
        .unwrap_or_else(|| crate::model::TaskState::UNKNOWN.to_string())
}

// ---------------------------------------------------------------------------
// Decisions
// ---------------------------------------------------------------------------

/// Split text into rough sentences on terminal punctuation and newlines.
fn sentences(text: &str) -> impl Iterator<Item = &str> {
    text.split_inclusive(['.', '!', '?', '\n'])
        .map(|s| s.trim_end_matches(['.', '!', '?', '\n']).trim())
        .filter(|s| !s.is_empty())
}

fn clean_fragment(raw: &str) -> String {
    let no_bullet = LEADING_BULLET.replace(raw, "");
    no_bullet.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn extract_decisions(messages: &[ConversationMessage]) -> Vec<String> {
    let mut decisions = Vec::new();
    'outer: for msg in messages.iter().filter(|m| m.role == MessageRole::Assistant) {
        for sentence in sentences(&msg.content) {
            if DECISION_PATTERNS.iter().any(|p| p.is_match(sentence)) {
                push_unique_ci(&mut decisions, clean_fragment(sentence));
                if decisions.len() >= MAX_DECISIONS {
                    break 'outer;
                }
            }
        }
    }
    decisions
}

// ---------------------------------------------------------------------------
// Blockers
// ---------------------------------------------------------------------------

/// Canonicalize a matching line into one of the fixed blocker forms.
fn canonicalize_blocker(line: &str) -> String {
    let cleaned = clean_fragment(line);
    let lower = cleaned.to_lowercase();

    let form = if STACK_FRAME.is_match(cleaned.trim_start()) {
        format!("Stack trace: {cleaned}")
    } else if let Some(rest) = strip_prefix_ci(&cleaned, "error:") {
        format!("Error: {}", rest.trim())
    } else if let Some(rest) = strip_prefix_ci(&cleaned, "failed:") {
        format!("Failed: {}", rest.trim())
    } else if lower.starts_with("error ") {
        format!("Error: {}", cleaned[6..].trim())
    } else {
        cleaned
    };

    truncate_chars(&form, BLOCKER_MAX)
}

fn strip_prefix_ci<'a>(text: &'a str, prefix: &str) -> Option<&'a str> {
    let head = text.get(..prefix.len())?;
    if head.eq_ignore_ascii_case(prefix) {
        text.get(prefix.len()..)
    } else {
        None
    }
}

fn line_is_blocker(line: &str) -> bool {
    let lower = line.to_lowercase();
    BLOCKER_NEEDLES.iter().any(|needle| lower.contains(needle))
        || STACK_FRAME.is_match(line.trim_start())
}

fn extract_blockers(messages: &[ConversationMessage]) -> Vec<String> {
    let mut blockers = Vec::new();
    'outer: for msg in messages {
        for line in msg.content.lines() {
            let trimmed = line.trim();
            if trimmed.is_empty() || !line_is_blocker(trimmed) {
                continue;
            }
            push_unique_ci(&mut blockers, canonicalize_blocker(trimmed));
            if blockers.len() >= MAX_BLOCKERS {
                break 'outer;
            }
        }
    }
    blockers
}

// ---------------------------------------------------------------------------
// Completed steps
// ---------------------------------------------------------------------------

fn extract_completed_steps(messages: &[ConversationMessage]) -> Vec<String> {
    let mut steps = Vec::new();
    'outer: for msg in messages.iter().filter(|m| m.role == MessageRole::Assistant) {
        for sentence in sentences(&msg.content) {
            if COMPLETION_VERB.is_match(sentence) && !FUTURE_TENSE.is_match(sentence) {
                push_unique_ci(
                    &mut steps,
                    truncate_chars(&clean_fragment(sentence), COMPLETED_MAX),
                );
                if steps.len() >= MAX_COMPLETED {
                    break 'outer;
                }
            }
        }
    }
    steps
}
