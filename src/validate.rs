//! Runtime schema gate — every record is checked here before it leaves an
//! adapter.
//!
//! Validation failures are [`HandoffError::Validation`] (a Malformed-class
//! error); adapters never silently coerce a bad record into shape.

use crate::error::HandoffError;
use crate::model::CanonicalSession;
use crate::registry;

/// Check the canonical-schema invariants on a finished session record.
///
/// - schema version matches
/// - source slug is registered
/// - message count equals the message list length
/// - timestamps, where present, are non-strictly ascending
/// - file-change paths are unique
/// - decisions and blockers are case-insensitively unique
/// - project path is absolute
/// - task description and in-progress respect their length bounds
pub fn validate_session(session: &CanonicalSession) -> Result<(), HandoffError> {
    let mut errors: Vec<String> = Vec::new();

    if session.schema_version != crate::model::SCHEMA_VERSION {
        errors.push(format!(
            "schemaVersion must be \"{}\", got \"{}\"",
            crate::model::SCHEMA_VERSION,
            session.schema_version
        ));
    }

    if !registry::is_known_source(&session.source) {
        errors.push(format!("unknown source \"{}\"", session.source));
    }

    if session.session_id.trim().is_empty() {
        errors.push("sessionId must be non-empty".to_string());
    }

    let conv = &session.conversation;
    if conv.message_count != conv.messages.len() {
        errors.push(format!(
            "messageCount {} != messages.len() {}",
            conv.message_count,
            conv.messages.len()
        ));
    }

    let mut last_ts = None;
    for (idx, msg) in conv.messages.iter().enumerate() {
        if let Some(ts) = msg.timestamp {
            if let Some(prev) = last_ts
                && ts < prev
            {
                errors.push(format!("messages[{idx}] timestamp decreases"));
            }
            last_ts = Some(ts);
        }
    }

    let mut seen_paths = std::collections::HashSet::new();
    for change in &session.files_changed {
        if !seen_paths.insert(change.path.as_str()) {
            errors.push(format!("duplicate filesChanged path \"{}\"", change.path));
        }
    }

    check_unique_ci(&session.decisions, "decisions", &mut errors);
    check_unique_ci(&session.blockers, "blockers", &mut errors);

    if !session.project.path.is_absolute() {
        errors.push(format!(
            "project.path must be absolute, got \"{}\"",
            session.project.path.display()
        ));
    }

    if session.task.description.chars().count() > 300 {
        errors.push("task.description exceeds 300 chars".to_string());
    }
    if let Some(in_progress) = &session.task.in_progress
        && in_progress.chars().count() > 200
    {
        errors.push("task.inProgress exceeds 200 chars".to_string());
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(HandoffError::Validation { errors })
    }
}

fn check_unique_ci(items: &[String], field: &str, errors: &mut Vec<String>) {
    let mut seen = std::collections::HashSet::new();
    for item in items {
        if !seen.insert(item.to_lowercase()) {
            errors.push(format!("{field} repeats case-insensitively: \"{item}\""));
        }
    }
}
