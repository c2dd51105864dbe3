//! Resume-document builder — pure string assembly, no I/O.
//!
//! Produces the Markdown hand-off document: header, fixed instructions for
//! the resuming agent, the current task block, the compressed body
//! verbatim, and a trailing resume imperative. Deterministic for identical
//! input.

use crate::compress::Compressed;
use crate::model::CanonicalSession;
use crate::registry;

/// Fixed directives shown to the resuming agent.
const INSTRUCTIONS: &str = "\
## INSTRUCTIONS FOR THE RESUMING AGENT

1. Read the TASK STATE section first; it is the contract for this hand-off.
2. Treat completed steps as done; do not redo them unless verification fails.
3. Continue from the in-progress item, honoring every decision listed below.
4. Investigate open blockers before starting new work.
5. Consult ACTIVE FILES before editing; they reflect the latest known state.
6. Ask the user before deviating from the remaining-steps plan.";

/// Assemble the full resume document.
pub fn build_resume_document(
    session: &CanonicalSession,
    compressed: &Compressed,
    target_agent: Option<&str>,
) -> String {
    let mut out = String::new();

    out.push_str("# SESSION HANDOFF\n\n");
    out.push_str(&format!("- Source: {}\n", session.source));
    out.push_str(&format!(
        "- Captured: {}\n",
        session.captured_at.to_rfc3339()
    ));
    out.push_str(&format!(
        "- Project: {}\n",
        session.project.path.display()
    ));
    if let Some(branch) = &session.project.git_branch {
        out.push_str(&format!("- Branch: {branch}\n"));
    }
    if let Some(target) = target_agent {
        out.push_str(&format!("- Target: {target}\n"));
    }

    out.push('\n');
    out.push_str(INSTRUCTIONS);
    out.push_str("\n\n");

    out.push_str("## CURRENT TASK\n\n");
    out.push_str(&format!("Goal: {}\n", session.task.description));
    if !session.task.completed.is_empty() {
        out.push_str(&format!(
            "Completed: {} step(s)\n",
            session.task.completed.len()
        ));
    }
    if let Some(in_progress) = &session.task.in_progress {
        out.push_str(&format!("In progress: {in_progress}\n"));
    }
    if !session.task.remaining.is_empty() {
        out.push_str(&format!(
            "Remaining: {} step(s)\n",
            session.task.remaining.len()
        ));
    }

    out.push('\n');
    out.push_str(&compressed.content);
    out.push_str("\n\n");
    out.push_str("Resume the task now, starting from the state above.\n");

    if let Some(agent) = target_agent
        && let Some(spec) = registry::spec_for(agent)
    {
        out.push_str(&format!("Paste this into {} to continue.\n", spec.display_name));
    }

    out
}
