//! Storage-root resolution for source assistants.
//!
//! Every adapter resolves its on-disk root through here: a per-source
//! template with a `~` user-home token, expanded at call time, with a
//! WSL-aware fallback that probes mounted Windows user directories when the
//! linux kernel exposes the WSL interop marker.
//!
//! Also home to the claude-code path-hash codec: project directories are
//! named after the absolute workspace path with separators collapsed to `-`.

use std::path::{Path, PathBuf};

use tracing::trace;

/// The three host families the storage registry distinguishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OsFamily {
    Darwin,
    Linux,
    Windows,
}

impl OsFamily {
    pub fn current() -> Self {
        if cfg!(target_os = "macos") {
            OsFamily::Darwin
        } else if cfg!(target_os = "windows") {
            OsFamily::Windows
        } else {
            OsFamily::Linux
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            OsFamily::Darwin => "macos",
            OsFamily::Linux => "linux",
            OsFamily::Windows => "windows",
        }
    }
}

/// Kernel marker whose presence identifies a WSL environment.
const WSL_MARKER: &str = "/proc/sys/fs/binfmt_misc/WSLInterop";

/// Expand a leading `~/` in a storage template against the user's home.
pub fn expand_home(template: &str) -> Option<PathBuf> {
    if let Some(rest) = template.strip_prefix("~/") {
        return dirs::home_dir().map(|h| h.join(rest));
    }
    Some(PathBuf::from(template))
}

/// Resolve a storage root: env override → expanded template → WSL fallback.
///
/// Returns `None` when nothing exists on disk; adapters translate that into
/// `detect() == false` and empty listings, never an error.
pub fn resolve_storage_root(env_override: &str, template: &str) -> Option<PathBuf> {
    if let Ok(overridden) = std::env::var(env_override)
        && !overridden.trim().is_empty()
    {
        return Some(PathBuf::from(overridden));
    }

    if let Some(expanded) = expand_home(template)
        && expanded.is_dir()
    {
        return Some(expanded);
    }

    if is_wsl() {
        for candidate in wsl_fallback_roots(template) {
            if candidate.is_dir() {
                trace!(path = %candidate.display(), "using WSL-mounted storage root");
                return Some(candidate);
            }
        }
    }

    None
}

/// Whether this linux-like host is a WSL environment.
pub fn is_wsl() -> bool {
    cfg!(target_os = "linux") && Path::new(WSL_MARKER).exists()
}

/// Candidate storage roots under mounted Windows user homes.
///
/// WSL exposes Windows drives at `/mnt/<drive>`; the Windows-side assistant
/// install lives under `<drive>/Users/<name>/<suffix>` where `<suffix>` is
/// the template's home-relative part.
fn wsl_fallback_roots(template: &str) -> Vec<PathBuf> {
    let Some(suffix) = template.strip_prefix("~/") else {
        return Vec::new();
    };

    let mut roots = Vec::new();
    for drive in ["c", "d"] {
        let users = PathBuf::from(format!("/mnt/{drive}/Users"));
        let Ok(entries) = std::fs::read_dir(&users) else {
            continue;
        };
        for entry in entries.flatten() {
            if !entry.file_type().map(|ft| ft.is_dir()).unwrap_or(false) {
                continue;
            }
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if matches!(name.as_ref(), "Public" | "Default" | "All Users") {
                continue;
            }
            roots.push(entry.path().join(suffix));
        }
    }
    roots
}

// ---------------------------------------------------------------------------
// claude-code path-hash codec
// ---------------------------------------------------------------------------

/// Encode an absolute project path into a claude-code storage directory name.
///
/// `/` becomes `-`; on windows-like hosts backslashes are normalized to `/`
/// first and the drive-letter colon also becomes `-`.
pub fn encode_project_dir(path: &str, os: OsFamily) -> String {
    let normalized = if os == OsFamily::Windows {
        path.replace('\\', "/").replace(':', "-")
    } else {
        path.to_string()
    };
    normalized.replace('/', "-")
}

/// Decode a claude-code storage directory name back into a project path.
///
/// A leading `-` implies a Unix root; a leading single letter followed by
/// `-` implies a windows-like drive letter.
pub fn decode_project_dir(dir_name: &str) -> Option<PathBuf> {
    if let Some(rest) = dir_name.strip_prefix('-') {
        return Some(PathBuf::from(format!("/{}", rest.replace('-', "/"))));
    }

    let mut chars = dir_name.chars();
    if let (Some(first), Some('-')) = (chars.next(), chars.next())
        && first.is_ascii_alphabetic()
    {
        // Encoding turned `C:\Users\…` into `C--Users-…`: one `-` for the
        // colon, then one per separator. The remainder therefore starts with
        // the leading-separator dash.
        let rest: String = chars.collect();
        return Some(PathBuf::from(format!(
            "{}:{}",
            first.to_ascii_uppercase(),
            rest.replace('-', "\\")
        )));
    }

    None
}
