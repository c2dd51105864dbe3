//! Source registry and adapter set.
//!
//! [`SOURCES`] is the const table behind `handoff info`: one row per
//! supported assistant with its storage root per OS family, context-window
//! and usable-budget token counts, and memory-file list. [`AdapterSet`]
//! holds the concrete adapter implementations and answers detection,
//! lookup-by-slug, and auto-selection queries.

use std::path::Path;

use tracing::debug;

use crate::adapters::{self, AgentAdapter, SessionInfo};
use crate::error::HandoffError;
use crate::paths::OsFamily;

/// Static description of one supported source assistant.
#[derive(Debug, Clone, Copy)]
pub struct AgentSpec {
    /// Stable slug used in CLI input and the canonical record.
    pub slug: &'static str,
    pub display_name: &'static str,
    /// Env var that overrides the storage root (also the test seam).
    pub env_override: &'static str,
    pub storage_darwin: &'static str,
    pub storage_linux: &'static str,
    pub storage_windows: &'static str,
    /// Advertised model context window, in tokens.
    pub context_window: u32,
    /// Portion of the window reserved for a hand-off document.
    pub usable_budget: u32,
    /// Project-local files the assistant reads as persistent instructions.
    pub memory_files: &'static [&'static str],
}

impl AgentSpec {
    pub fn storage_template(&self, os: OsFamily) -> &'static str {
        match os {
            OsFamily::Darwin => self.storage_darwin,
            OsFamily::Linux => self.storage_linux,
            OsFamily::Windows => self.storage_windows,
        }
    }
}

/// Registry of every supported source, in display order.
pub const SOURCES: &[AgentSpec] = &[
    AgentSpec {
        slug: "claude-code",
        display_name: "Claude Code",
        env_override: "CLAUDE_HOME",
        storage_darwin: "~/.claude/projects",
        storage_linux: "~/.claude/projects",
        storage_windows: "~/.claude/projects",
        context_window: 200_000,
        usable_budget: 120_000,
        memory_files: &["CLAUDE.md", ".claude/CLAUDE.md"],
    },
    AgentSpec {
        slug: "cursor",
        display_name: "Cursor",
        env_override: "CURSOR_HOME",
        storage_darwin: "~/Library/Application Support/Cursor/User",
        storage_linux: "~/.config/Cursor/User",
        storage_windows: "~/AppData/Roaming/Cursor/User",
        context_window: 128_000,
        usable_budget: 76_000,
        memory_files: &[".cursorrules", ".cursor/rules/general.mdc"],
    },
    AgentSpec {
        slug: "codex",
        display_name: "Codex CLI",
        env_override: "CODEX_HOME",
        storage_darwin: "~/.codex/sessions",
        storage_linux: "~/.codex/sessions",
        storage_windows: "~/.codex/sessions",
        context_window: 200_000,
        usable_budget: 120_000,
        memory_files: &["AGENTS.md"],
    },
    AgentSpec {
        slug: "copilot",
        display_name: "GitHub Copilot CLI",
        env_override: "COPILOT_HOME",
        storage_darwin: "~/.copilot/history-session-state",
        storage_linux: "~/.copilot/history-session-state",
        storage_windows: "~/.copilot/history-session-state",
        context_window: 64_000,
        usable_budget: 38_000,
        memory_files: &[".github/copilot-instructions.md"],
    },
    AgentSpec {
        slug: "gemini",
        display_name: "Gemini CLI",
        env_override: "GEMINI_HOME",
        storage_darwin: "~/.gemini/tmp",
        storage_linux: "~/.gemini/tmp",
        storage_windows: "~/.gemini/tmp",
        context_window: 1_000_000,
        usable_budget: 120_000,
        memory_files: &["GEMINI.md"],
    },
    AgentSpec {
        slug: "opencode",
        display_name: "OpenCode",
        env_override: "OPENCODE_HOME",
        storage_darwin: "~/.local/share/opencode/storage/session",
        storage_linux: "~/.local/share/opencode/storage/session",
        storage_windows: "~/AppData/Roaming/opencode/storage/session",
        context_window: 200_000,
        usable_budget: 120_000,
        memory_files: &["AGENTS.md"],
    },
    AgentSpec {
        slug: "droid",
        display_name: "Factory Droid",
        env_override: "FACTORY_HOME",
        storage_darwin: "~/.factory/sessions",
        storage_linux: "~/.factory/sessions",
        storage_windows: "~/.factory/sessions",
        context_window: 200_000,
        usable_budget: 120_000,
        memory_files: &["AGENTS.md", ".factory/droid.md"],
    },
];

pub fn is_known_source(slug: &str) -> bool {
    SOURCES.iter().any(|s| s.slug == slug)
}

pub fn spec_for(slug: &str) -> Option<&'static AgentSpec> {
    SOURCES.iter().find(|s| s.slug == slug)
}

/// The concrete adapter set, in registry order.
///
/// Dynamic dispatch keeps the source set growable without a tagged union;
/// adding an assistant means one new adapter plus one [`SOURCES`] row.
pub struct AdapterSet {
    adapters: Vec<Box<dyn AgentAdapter>>,
}

impl Default for AdapterSet {
    fn default() -> Self {
        Self::new()
    }
}

impl AdapterSet {
    pub fn new() -> Self {
        AdapterSet {
            adapters: adapters::all(),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &dyn AgentAdapter> {
        self.adapters.iter().map(|a| a.as_ref())
    }

    /// Probe every adapter for installation.
    pub fn detect_all(&self) -> Vec<(&dyn AgentAdapter, bool)> {
        self.iter().map(|a| (a, a.detect())).collect()
    }

    /// Adapters whose source is plausibly installed on this host.
    pub fn installed(&self) -> Vec<&dyn AgentAdapter> {
        self.iter().filter(|a| a.detect()).collect()
    }

    pub fn find(&self, slug: &str) -> Result<&dyn AgentAdapter, HandoffError> {
        self.iter()
            .find(|a| a.slug() == slug)
            .ok_or_else(|| HandoffError::UnknownSource {
                slug: slug.to_string(),
                known: SOURCES.iter().map(|s| s.slug.to_string()).collect(),
            })
    }

    /// Pick the source with the most recently active session.
    ///
    /// Falls back to the first detected source when no session exists
    /// anywhere; errors when nothing is installed at all.
    pub fn auto_select(&self, project_path: Option<&Path>) -> Result<&dyn AgentAdapter, HandoffError> {
        let installed = self.installed();
        if installed.is_empty() {
            return Err(HandoffError::NoAgentsDetected);
        }

        let mut best: Option<(&dyn AgentAdapter, chrono::DateTime<chrono::Utc>)> = None;
        for adapter in &installed {
            let sessions = match adapter.list_sessions(project_path) {
                Ok(s) => s,
                Err(e) => {
                    debug!(source = adapter.slug(), error = %e, "listing failed during auto-select");
                    continue;
                }
            };
            let newest = sessions
                .iter()
                .filter_map(recency)
                .max();
            if let Some(ts) = newest
                && best.map(|(_, prev)| ts > prev).unwrap_or(true)
            {
                best = Some((*adapter, ts));
            }
        }

        Ok(best.map(|(a, _)| a).unwrap_or(installed[0]))
    }
}

fn recency(info: &SessionInfo) -> Option<chrono::DateTime<chrono::Utc>> {
    info.last_active_at.or(info.started_at)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_sources_have_distinct_slugs() {
        let mut slugs: Vec<&str> = SOURCES.iter().map(|s| s.slug).collect();
        slugs.sort_unstable();
        slugs.dedup();
        assert_eq!(slugs.len(), SOURCES.len());
    }

    #[test]
    fn usable_budget_never_exceeds_window() {
        for spec in SOURCES {
            assert!(
                spec.usable_budget <= spec.context_window,
                "{} budget exceeds window",
                spec.slug
            );
        }
    }

    #[test]
    fn known_source_lookup() {
        assert!(is_known_source("claude-code"));
        assert!(is_known_source("droid"));
        assert!(!is_known_source("emacs"));
    }

    #[test]
    fn adapter_set_covers_registry() {
        let set = AdapterSet::new();
        for spec in SOURCES {
            assert!(set.find(spec.slug).is_ok(), "missing adapter {}", spec.slug);
        }
        assert!(set.find("notepad").is_err());
    }
}
