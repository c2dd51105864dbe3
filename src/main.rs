#![forbid(unsafe_code)]

//! handoff — session hand-off for AI coding agents.
//!
//! CLI entry point: parses arguments, dispatches subcommands, renders output.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use clap::Parser;
use colored::Colorize;
use tracing_subscriber::EnvFilter;

use handoff::adapters::AgentAdapter;
use handoff::compress::{CompressOptions, compress};
use handoff::enrich::enrich_project;
use handoff::error::{ErrorContext, HandoffError};
use handoff::paths::OsFamily;
use handoff::prompt::build_resume_document;
use handoff::registry::{AdapterSet, SOURCES};
use handoff::store;
use handoff::watcher::{DEFAULT_INTERVAL, WatchEvent, WatchOptions, Watcher};

/// Capture an AI coding agent session and build a token-budgeted resume
/// prompt another agent can pick up.
#[derive(Parser, Debug)]
#[command(
    name = "handoff",
    version = long_version(),
    about,
    long_about = None,
)]
struct Cli {
    /// Show detailed progress.
    #[arg(long, global = true)]
    verbose: bool,

    /// Show everything including per-line parsing details.
    #[arg(long, global = true)]
    trace: bool,

    /// Output as JSON for machine consumption.
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(clap::Subcommand, Debug)]
enum Command {
    /// Show which sources are installed on this machine.
    Detect,

    /// List recent sessions across installed sources.
    List {
        /// Filter by source slug (e.g. claude-code, cursor).
        #[arg(long)]
        source: Option<String>,

        /// Only sessions for this project directory.
        #[arg(long)]
        project: Option<PathBuf>,

        /// Maximum sessions to show.
        #[arg(long, default_value = "10")]
        limit: usize,
    },

    /// Capture a session into .handoff/session.json.
    Capture {
        /// Source slug; picked automatically when omitted.
        #[arg(long)]
        source: Option<String>,

        /// Session id; the most recent session when omitted.
        #[arg(long)]
        session: Option<String>,

        /// Project directory for scoping and output.
        #[arg(long)]
        project: Option<PathBuf>,
    },

    /// Capture, compress, and write .handoff/RESUME.md in one step.
    Handoff {
        #[arg(long)]
        source: Option<String>,

        #[arg(long)]
        session: Option<String>,

        #[arg(long)]
        project: Option<PathBuf>,

        /// Target agent slug, or clipboard/file.
        #[arg(long)]
        target: Option<String>,

        /// Explicit token budget (overrides the target table).
        #[arg(long)]
        budget: Option<u64>,
    },

    /// Rebuild RESUME.md from a previously captured session.
    Resume {
        /// Path to a persisted session.json.
        #[arg(long, default_value = ".handoff/session.json")]
        input: PathBuf,

        #[arg(long)]
        target: Option<String>,

        #[arg(long)]
        budget: Option<u64>,
    },

    /// Poll sources and report session activity until interrupted.
    Watch {
        /// Poll interval in seconds.
        #[arg(long, default_value = "30")]
        interval: u64,

        /// Source slugs to watch; all installed sources when omitted.
        #[arg(long)]
        source: Vec<String>,

        #[arg(long)]
        project: Option<PathBuf>,
    },

    /// Print the source registry: storage paths, budgets, memory files.
    Info,

    /// Generate shell completions.
    Completions {
        /// Shell to generate completions for (bash, zsh, fish).
        shell: String,
    },
}

impl Command {
    /// Exit-code phase for a failure of this command: capture, handoff,
    /// and resume errors are capture-category (exit 3 on not-found);
    /// everything else that fails did so while enumerating (exit 2).
    fn error_context(&self) -> ErrorContext {
        match self {
            Command::Capture { .. } | Command::Handoff { .. } | Command::Resume { .. } => {
                ErrorContext::Capture
            }
            _ => ErrorContext::Enumeration,
        }
    }
}

/// Build the long version string with embedded build metadata.
///
/// vergen-gix always emits these env vars (uses placeholders when values are
/// unavailable), so `env!()` is safe here.
fn long_version() -> &'static str {
    concat!(
        env!("CARGO_PKG_VERSION"),
        " (",
        env!("VERGEN_GIT_SHA"),
        " ",
        env!("VERGEN_BUILD_TIMESTAMP"),
        " ",
        env!("VERGEN_CARGO_TARGET_TRIPLE"),
        ")",
    )
}

/// Initialize the tracing subscriber based on CLI flags.
///
/// Priority: `--trace` > `--verbose` > `RUST_LOG` env var > default (warn).
fn init_tracing(cli: &Cli) {
    let filter = if cli.trace {
        EnvFilter::new("handoff=trace")
    } else if cli.verbose {
        EnvFilter::new("handoff=debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(&cli);

    let result = match &cli.command {
        Command::Detect => cmd_detect(cli.json),
        Command::List {
            source,
            project,
            limit,
        } => cmd_list(source.as_deref(), project.as_deref(), *limit, cli.json),
        Command::Capture {
            source,
            session,
            project,
        } => cmd_capture(
            source.as_deref(),
            session.as_deref(),
            project.as_deref(),
            cli.json,
        ),
        Command::Handoff {
            source,
            session,
            project,
            target,
            budget,
        } => cmd_handoff(
            source.as_deref(),
            session.as_deref(),
            project.as_deref(),
            target.as_deref(),
            *budget,
            cli.json,
        ),
        Command::Resume {
            input,
            target,
            budget,
        } => cmd_resume(input, target.as_deref(), *budget, cli.json),
        Command::Watch {
            interval,
            source,
            project,
        } => cmd_watch(*interval, source.clone(), project.clone(), cli.json),
        Command::Info => cmd_info(cli.json),
        Command::Completions { shell } => cmd_completions(shell),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            if cli.json {
                let json = serde_json::json!({
                    "ok": false,
                    "error_type": error_type_name(&e),
                    "message": format!("{e}"),
                });
                eprintln!(
                    "{}",
                    serde_json::to_string_pretty(&json).unwrap_or_default()
                );
            } else {
                eprintln!("{} {e}", "Error:".red().bold());
            }
            ExitCode::from(exit_code_for(&e, cli.command.error_context()))
        }
    }
}

fn exit_code_for(e: &anyhow::Error, context: ErrorContext) -> u8 {
    e.downcast_ref::<HandoffError>()
        .map(|err| err.exit_code(context))
        .unwrap_or(3)
}

/// Extract a short error type name for JSON output.
fn error_type_name(e: &anyhow::Error) -> &'static str {
    match e.downcast_ref::<HandoffError>() {
        Some(HandoffError::SessionNotFound { .. }) => "SessionNotFound",
        Some(HandoffError::Malformed { .. }) => "Malformed",
        Some(HandoffError::StoreLocked { .. }) => "StoreLocked",
        Some(HandoffError::NoAgentsDetected) => "NoAgentsDetected",
        Some(HandoffError::UnknownSource { .. }) => "UnknownSource",
        Some(HandoffError::Validation { .. }) => "Validation",
        None => "InternalError",
    }
}

// ---------------------------------------------------------------------------
// Command implementations
// ---------------------------------------------------------------------------

fn cmd_detect(json_mode: bool) -> anyhow::Result<()> {
    let set = AdapterSet::new();
    let results = set.detect_all();
    let os = OsFamily::current();

    if json_mode {
        let sources: Vec<serde_json::Value> = results
            .iter()
            .map(|(adapter, installed)| {
                let spec = handoff::registry::spec_for(adapter.slug());
                serde_json::json!({
                    "source": adapter.slug(),
                    "name": adapter.display_name(),
                    "installed": installed,
                    "storage": spec.map(|s| s.storage_template(os)),
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&sources)?);
        return Ok(());
    }

    println!("{}\n", "Detected sources".bold());
    for (adapter, installed) in &results {
        let mark = if *installed {
            "✓".green().bold().to_string()
        } else {
            "✗".red().bold().to_string()
        };
        let storage = handoff::registry::spec_for(adapter.slug())
            .map(|s| s.storage_template(os))
            .unwrap_or("");
        println!(
            "  {mark} {} ({}) — {}",
            adapter.display_name(),
            adapter.slug().cyan(),
            storage.dimmed()
        );
    }
    Ok(())
}

fn cmd_list(
    source: Option<&str>,
    project: Option<&Path>,
    limit: usize,
    json_mode: bool,
) -> anyhow::Result<()> {
    let set = AdapterSet::new();

    let adapters: Vec<&dyn AgentAdapter> = match source {
        Some(slug) => vec![set.find(slug)?],
        None => {
            let installed = set.installed();
            if installed.is_empty() {
                return Err(HandoffError::NoAgentsDetected.into());
            }
            installed
        }
    };

    let mut rows: Vec<(String, handoff::adapters::SessionInfo)> = Vec::new();
    for adapter in adapters {
        let sessions = adapter
            .list_sessions(project)
            .map_err(|e| e.context(format!("listing {} sessions", adapter.slug())))?;
        for info in sessions {
            rows.push((adapter.slug().to_string(), info));
        }
    }
    rows.sort_by(|a, b| {
        let key = |r: &handoff::adapters::SessionInfo| (r.last_active_at, r.started_at);
        key(&b.1).cmp(&key(&a.1))
    });
    rows.truncate(limit);

    if json_mode {
        let sessions: Vec<serde_json::Value> = rows
            .iter()
            .map(|(source, info)| {
                serde_json::json!({
                    "source": source,
                    "sessionId": info.id,
                    "messageCount": info.message_count,
                    "startedAt": info.started_at.map(|t| t.to_rfc3339()),
                    "lastActiveAt": info.last_active_at.map(|t| t.to_rfc3339()),
                    "projectPath": info.project_path.as_ref().map(|p| p.display().to_string()),
                    "preview": info.preview,
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&sessions)?);
        return Ok(());
    }

    if rows.is_empty() {
        println!(
            "No sessions found. Run {} to check source status.",
            "handoff detect".cyan()
        );
        return Ok(());
    }

    println!("{} ({} shown)\n", "Recent sessions".bold(), rows.len());
    for (source, info) in &rows {
        println!(
            "  {} {} {} {}",
            info.id.cyan(),
            format!("[{source}]").dimmed(),
            format!("{}msg", info.message_count).dimmed(),
            info.preview
        );
    }
    Ok(())
}

/// Shared capture path: resolve adapter, capture, enrich.
fn capture_session(
    set: &AdapterSet,
    source: Option<&str>,
    session_id: Option<&str>,
    project: Option<&Path>,
) -> anyhow::Result<handoff::model::CanonicalSession> {
    let adapter = match source {
        Some(slug) => set.find(slug)?,
        None => set.auto_select(project)?,
    };

    let mut session = match session_id {
        Some(id) => adapter.capture(id)?,
        None => adapter.capture_latest(project)?,
    };

    if let Some(explicit) = project {
        session.project.path = explicit.to_path_buf();
    }
    enrich_project(&mut session.project, adapter.slug());
    Ok(session)
}

fn cmd_capture(
    source: Option<&str>,
    session_id: Option<&str>,
    project: Option<&Path>,
    json_mode: bool,
) -> anyhow::Result<()> {
    let set = AdapterSet::new();
    let session = capture_session(&set, source, session_id, project)?;
    let path = store::save_session(&session.project.path, &session)?;

    if json_mode {
        let json = serde_json::json!({
            "ok": true,
            "source": session.source,
            "sessionId": session.session_id,
            "messageCount": session.conversation.message_count,
            "path": path.display().to_string(),
        });
        println!("{}", serde_json::to_string_pretty(&json)?);
    } else {
        println!(
            "{} Captured {} session {}",
            "✓".green().bold(),
            session.source.cyan(),
            session.session_id
        );
        println!(
            "  {} {} messages, {} file(s) changed",
            "State".dimmed(),
            session.conversation.message_count,
            session.files_changed.len()
        );
        println!("  {} {}", "Written".dimmed(), path.display());
    }
    Ok(())
}

fn cmd_handoff(
    source: Option<&str>,
    session_id: Option<&str>,
    project: Option<&Path>,
    target: Option<&str>,
    budget: Option<u64>,
    json_mode: bool,
) -> anyhow::Result<()> {
    let set = AdapterSet::new();
    let session = capture_session(&set, source, session_id, project)?;

    let options = CompressOptions {
        target_tokens: budget,
        target_agent: target.map(String::from),
    };
    let compressed = compress(&session, &options);
    let document = build_resume_document(&session, &compressed, target);

    let session_path = store::save_session(&session.project.path, &session)?;
    let resume_path = store::save_resume(&session.project.path, &document)?;

    if json_mode {
        let json = serde_json::json!({
            "ok": true,
            "source": session.source,
            "sessionId": session.session_id,
            "totalTokens": compressed.total_tokens,
            "includedLayers": compressed.included_layers,
            "droppedLayers": compressed.dropped_layers,
            "sessionPath": session_path.display().to_string(),
            "resumePath": resume_path.display().to_string(),
        });
        println!("{}", serde_json::to_string_pretty(&json)?);
    } else {
        println!(
            "{} Hand-off ready for {} session {}",
            "✓".green().bold(),
            session.source.cyan(),
            session.session_id
        );
        println!(
            "  {} {} tokens across {} layer(s)",
            "Compressed".dimmed(),
            compressed.total_tokens,
            compressed.included_layers.len()
        );
        if !compressed.dropped_layers.is_empty() {
            println!(
                "  {} {}",
                "Dropped".dimmed(),
                compressed.dropped_layers.join(", ")
            );
        }
        println!("  {} {}", "Session".dimmed(), session_path.display());
        println!("  {} {}", "Resume".dimmed(), resume_path.display());
    }
    Ok(())
}

fn cmd_resume(
    input: &Path,
    target: Option<&str>,
    budget: Option<u64>,
    json_mode: bool,
) -> anyhow::Result<()> {
    let session = store::load_session(input)?;

    let options = CompressOptions {
        target_tokens: budget,
        target_agent: target.map(String::from),
    };
    let compressed = compress(&session, &options);
    let document = build_resume_document(&session, &compressed, target);

    let project_dir = input
        .parent()
        .and_then(|p| p.parent())
        .unwrap_or(Path::new("."));
    let resume_path = store::save_resume(project_dir, &document)?;

    if json_mode {
        let json = serde_json::json!({
            "ok": true,
            "sessionId": session.session_id,
            "totalTokens": compressed.total_tokens,
            "includedLayers": compressed.included_layers,
            "droppedLayers": compressed.dropped_layers,
            "resumePath": resume_path.display().to_string(),
        });
        println!("{}", serde_json::to_string_pretty(&json)?);
    } else {
        println!(
            "{} Rebuilt resume document for session {}",
            "✓".green().bold(),
            session.session_id
        );
        println!(
            "  {} {} tokens, {} layer(s)",
            "Compressed".dimmed(),
            compressed.total_tokens,
            compressed.included_layers.len()
        );
        println!("  {} {}", "Resume".dimmed(), resume_path.display());
    }
    Ok(())
}

fn cmd_watch(
    interval_secs: u64,
    sources: Vec<String>,
    project: Option<PathBuf>,
    json_mode: bool,
) -> anyhow::Result<()> {
    let set = AdapterSet::new();
    let options = WatchOptions {
        sources: (!sources.is_empty()).then_some(sources),
        interval: if interval_secs == 0 {
            DEFAULT_INTERVAL
        } else {
            std::time::Duration::from_secs(interval_secs)
        },
        project_path: project,
    };

    let mut watcher = Watcher::start(options)?;

    let stop = Arc::new(AtomicBool::new(false));
    let stop_handler = Arc::clone(&stop);
    ctrlc::set_handler(move || {
        stop_handler.store(true, Ordering::SeqCst);
    })?;

    if !json_mode {
        println!(
            "{} Watching sessions (interval {}s, Ctrl-C to stop)\n",
            "∙".cyan().bold(),
            interval_secs.max(1)
        );
    }

    watcher.run(&set, &stop, |event| print_watch_event(&event, json_mode))?;

    if !json_mode {
        println!("\n{} Watcher stopped", "✓".green().bold());
    }
    Ok(())
}

fn print_watch_event(event: &WatchEvent, json_mode: bool) {
    if json_mode {
        let json = match event {
            WatchEvent::NewSession {
                source,
                session_id,
                message_count,
                timestamp,
            } => serde_json::json!({
                "event": "new-session",
                "source": source,
                "sessionId": session_id,
                "messageCount": message_count,
                "timestamp": timestamp.to_rfc3339(),
            }),
            WatchEvent::SessionUpdate {
                source,
                session_id,
                previous_count,
                message_count,
                timestamp,
            } => serde_json::json!({
                "event": "session-update",
                "source": source,
                "sessionId": session_id,
                "previousCount": previous_count,
                "messageCount": message_count,
                "timestamp": timestamp.to_rfc3339(),
            }),
            WatchEvent::RateLimit {
                source,
                session_id,
                message_count,
                timestamp,
            } => serde_json::json!({
                "event": "rate-limit",
                "source": source,
                "sessionId": session_id,
                "messageCount": message_count,
                "timestamp": timestamp.to_rfc3339(),
            }),
            WatchEvent::Idle { timestamp } => serde_json::json!({
                "event": "idle",
                "timestamp": timestamp.to_rfc3339(),
            }),
        };
        println!("{json}");
        return;
    }

    match event {
        WatchEvent::NewSession {
            source,
            session_id,
            message_count,
            ..
        } => println!(
            "  {} new session {} [{}] ({message_count} msg)",
            "+".green().bold(),
            session_id.cyan(),
            source
        ),
        WatchEvent::SessionUpdate {
            source,
            session_id,
            previous_count,
            message_count,
            ..
        } => println!(
            "  {} {} [{}] {previous_count} → {message_count} msg",
            "↑".cyan().bold(),
            session_id.cyan(),
            source
        ),
        WatchEvent::RateLimit {
            source,
            session_id,
            ..
        } => println!(
            "  {} {} [{}] stopped growing — possible rate limit; consider switching agents",
            "⚠".yellow().bold(),
            session_id.cyan(),
            source
        ),
        WatchEvent::Idle { .. } => {
            println!("  {} idle", "·".dimmed());
        }
    }
}

fn cmd_info(json_mode: bool) -> anyhow::Result<()> {
    if json_mode {
        let sources: Vec<serde_json::Value> = SOURCES
            .iter()
            .map(|spec| {
                serde_json::json!({
                    "source": spec.slug,
                    "name": spec.display_name,
                    "storage": {
                        "macos": spec.storage_darwin,
                        "linux": spec.storage_linux,
                        "windows": spec.storage_windows,
                    },
                    "contextWindow": spec.context_window,
                    "usableBudget": spec.usable_budget,
                    "memoryFiles": spec.memory_files,
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&sources)?);
        return Ok(());
    }

    println!("{}\n", "Source registry".bold());
    for spec in SOURCES {
        println!("  {} ({})", spec.display_name.bold(), spec.slug.cyan());
        println!("    {} {}", "macos:".dimmed(), spec.storage_darwin);
        println!("    {} {}", "linux:".dimmed(), spec.storage_linux);
        println!("    {} {}", "windows:".dimmed(), spec.storage_windows);
        println!(
            "    {} {} window / {} usable",
            "tokens:".dimmed(),
            spec.context_window,
            spec.usable_budget
        );
        println!(
            "    {} {}",
            "memory:".dimmed(),
            spec.memory_files.join(", ")
        );
    }
    Ok(())
}

fn cmd_completions(shell: &str) -> anyhow::Result<()> {
    use clap::CommandFactory;
    use clap_complete::{Shell, generate};

    let parsed_shell: Shell = shell
        .parse()
        .map_err(|_| anyhow::anyhow!("Unknown shell '{shell}'. Use: bash, zsh, fish"))?;

    let mut cmd = Cli::command();
    generate(parsed_shell, &mut cmd, "handoff", &mut std::io::stdout());

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn not_found() -> anyhow::Error {
        HandoffError::SessionNotFound {
            source_name: "codex".to_string(),
            session_id: "missing".to_string(),
        }
        .into()
    }

    #[test]
    fn list_failures_are_enumeration_context() {
        let cmd = Command::List {
            source: None,
            project: None,
            limit: 10,
        };
        assert_eq!(cmd.error_context(), ErrorContext::Enumeration);
        assert_eq!(exit_code_for(&not_found(), cmd.error_context()), 2);
    }

    #[test]
    fn capture_family_failures_are_capture_context() {
        let commands = [
            Command::Capture {
                source: None,
                session: Some("missing".to_string()),
                project: None,
            },
            Command::Handoff {
                source: None,
                session: None,
                project: None,
                target: None,
                budget: None,
            },
            Command::Resume {
                input: PathBuf::from(".handoff/session.json"),
                target: None,
                budget: None,
            },
        ];
        for cmd in &commands {
            assert_eq!(cmd.error_context(), ErrorContext::Capture);
            assert_eq!(exit_code_for(&not_found(), cmd.error_context()), 3);
        }
    }

    #[test]
    fn internal_errors_exit_three_in_any_context() {
        let err = anyhow::anyhow!("plain internal failure");
        assert_eq!(exit_code_for(&err, ErrorContext::Enumeration), 3);
        assert_eq!(exit_code_for(&err, ErrorContext::Capture), 3);
    }

    #[test]
    fn detection_errors_exit_one_regardless_of_command() {
        let err: anyhow::Error = HandoffError::NoAgentsDetected.into();
        assert_eq!(exit_code_for(&err, ErrorContext::Enumeration), 1);
        assert_eq!(exit_code_for(&err, ErrorContext::Capture), 1);
    }
}
