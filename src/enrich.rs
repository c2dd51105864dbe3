//! Project enrichment — git state, directory structure, and memory files
//! for a project path.
//!
//! Everything here degrades silently: a missing git binary, a non-repo
//! directory, a hung subprocess, or an unreadable file all leave the
//! affected field absent. Absent means unknown; enrichment never fails a
//! capture.

use std::path::Path;
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use tracing::debug;

use crate::model::{ProjectContext, truncate_chars};
use crate::registry;

/// Wall-clock bound per git subprocess; a hanging git process must not
/// stall the pipeline.
const GIT_TIMEOUT: Duration = Duration::from_secs(5);

const TREE_MAX_LINES: usize = 40;
const MEMORY_CHAR_LIMIT: usize = 2000;

/// Populate every optional field of `project` in place.
pub fn enrich_project(project: &mut ProjectContext, source: &str) {
    let path = project.path.clone();

    project.git_branch = git_output(&path, &["branch", "--show-current"]);
    project.git_status = git_output(&path, &["status", "--short"]);
    project.git_log = git_output(&path, &["log", "--oneline", "-10"])
        .map(|out| out.lines().map(String::from).collect());
    project.name = project_name(&path);
    project.structure = directory_tree(&path);
    project.memory_file_contents = memory_files(&path, source);
}

/// Run one git subcommand under the wall-clock bound.
///
/// Returns `None` on missing binary, non-zero exit, timeout, or empty
/// output.
fn git_output(dir: &Path, args: &[&str]) -> Option<String> {
    if which::which("git").is_err() {
        return None;
    }

    let mut child = Command::new("git")
        .arg("-C")
        .arg(dir)
        .args(args)
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .stdin(Stdio::null())
        .spawn()
        .ok()?;

    let deadline = Instant::now() + GIT_TIMEOUT;
    loop {
        match child.try_wait() {
            Ok(Some(status)) => {
                if !status.success() {
                    return None;
                }
                break;
            }
            Ok(None) => {
                if Instant::now() >= deadline {
                    debug!(?args, "git subprocess timed out");
                    let _ = child.kill();
                    let _ = child.wait();
                    return None;
                }
                std::thread::sleep(Duration::from_millis(25));
            }
            Err(e) => {
                debug!(?args, error = %e, "git wait failed");
                return None;
            }
        }
    }

    let mut stdout = child.stdout.take()?;
    let mut buffer = String::new();
    std::io::Read::read_to_string(&mut stdout, &mut buffer).ok()?;
    let trimmed = buffer.trim_end().to_string();
    (!trimmed.is_empty()).then_some(trimmed)
}

/// Project name: `package.json` name → `Cargo.toml` package name →
/// directory basename.
fn project_name(dir: &Path) -> Option<String> {
    if let Ok(raw) = std::fs::read_to_string(dir.join("package.json"))
        && let Ok(json) = serde_json::from_str::<serde_json::Value>(&raw)
        && let Some(name) = json.get("name").and_then(|v| v.as_str())
        && !name.is_empty()
    {
        return Some(name.to_string());
    }

    if let Ok(raw) = std::fs::read_to_string(dir.join("Cargo.toml"))
        && let Some(name) = cargo_package_name(&raw)
    {
        return Some(name);
    }

    dir.file_name()
        .and_then(|n| n.to_str())
        .map(String::from)
}

/// Minimal `[package] name = "…"` extraction; no TOML dependency needed
/// for one key.
fn cargo_package_name(raw: &str) -> Option<String> {
    let mut in_package = false;
    for line in raw.lines() {
        let trimmed = line.trim();
        if trimmed.starts_with('[') {
            in_package = trimmed == "[package]";
            continue;
        }
        if in_package
            && let Some(rest) = trimmed.strip_prefix("name")
        {
            let value = rest.trim_start().strip_prefix('=')?.trim();
            return Some(value.trim_matches('"').to_string());
        }
    }
    None
}

/// Depth-2 directory tree, excluding `node_modules` and `.git`, capped at
/// 40 lines.
fn directory_tree(dir: &Path) -> Option<String> {
    let mut lines: Vec<String> = Vec::new();
    let mut top: Vec<_> = std::fs::read_dir(dir).ok()?.flatten().collect();
    top.sort_by_key(|e| e.file_name());

    'outer: for entry in top {
        let name = entry.file_name().to_string_lossy().to_string();
        if name == "node_modules" || name == ".git" {
            continue;
        }
        let is_dir = entry.file_type().map(|ft| ft.is_dir()).unwrap_or(false);
        if lines.len() >= TREE_MAX_LINES {
            break;
        }
        lines.push(if is_dir {
            format!("{name}/")
        } else {
            name.clone()
        });

        if is_dir {
            let mut children: Vec<_> = match std::fs::read_dir(entry.path()) {
                Ok(c) => c.flatten().collect(),
                Err(_) => continue,
            };
            children.sort_by_key(|e| e.file_name());
            for child in children {
                let child_name = child.file_name().to_string_lossy().to_string();
                if child_name == "node_modules" || child_name == ".git" {
                    continue;
                }
                if lines.len() >= TREE_MAX_LINES {
                    break 'outer;
                }
                let child_is_dir =
                    child.file_type().map(|ft| ft.is_dir()).unwrap_or(false);
                lines.push(if child_is_dir {
                    format!("  {child_name}/")
                } else {
                    format!("  {child_name}")
                });
            }
        }
    }

    (!lines.is_empty()).then(|| lines.join("\n"))
}

/// Concatenated memory files for `source`, truncated to 2000 chars.
fn memory_files(dir: &Path, source: &str) -> Option<String> {
    let spec = registry::spec_for(source)?;
    let mut combined = String::new();
    for rel in spec.memory_files {
        let Ok(content) = std::fs::read_to_string(dir.join(rel)) else {
            continue;
        };
        if !combined.is_empty() {
            combined.push('\n');
        }
        combined.push_str(content.trim_end());
    }
    (!combined.is_empty()).then(|| truncate_chars(&combined, MEMORY_CHAR_LIMIT))
}
