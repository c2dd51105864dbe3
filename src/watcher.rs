//! Polling watcher — periodic snapshot/diff over installed adapters with a
//! typed event stream.
//!
//! A fixed-cadence poll with message-count diffing replaced an earlier
//! filesystem-watch design: assistants write partial lines often enough
//! that edge-triggered events are noisy, and the rate-limit heuristic needs
//! interval semantics anyway.
//!
//! The rate-limit signal is inferred, not observed: a session that was
//! growing and then holds still for two consecutive polls has plausibly
//! stalled on a rate limit. The heuristic is conservative; a false
//! negative is cheaper than telling the user to switch agents for nothing.
//!
//! Exactly one watcher may run per process; `start` refuses a second
//! instance instead of sharing hidden state.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::adapters::AgentAdapter;
use crate::registry::AdapterSet;

/// Consecutive unchanged polls (after growth) that trigger the rate-limit
/// signal.
const RATE_LIMIT_STALL_INTERVALS: u32 = 2;

pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(30);

static RUNNING: AtomicBool = AtomicBool::new(false);

/// Watcher configuration.
#[derive(Debug, Clone)]
pub struct WatchOptions {
    /// Source slugs to watch; `None` watches every installed adapter.
    pub sources: Option<Vec<String>>,
    pub interval: Duration,
    pub project_path: Option<PathBuf>,
}

impl Default for WatchOptions {
    fn default() -> Self {
        WatchOptions {
            sources: None,
            interval: DEFAULT_INTERVAL,
            project_path: None,
        }
    }
}

/// One observation emitted by the watcher.
#[derive(Debug, Clone, PartialEq)]
pub enum WatchEvent {
    NewSession {
        source: String,
        session_id: String,
        message_count: usize,
        timestamp: DateTime<Utc>,
    },
    SessionUpdate {
        source: String,
        session_id: String,
        previous_count: usize,
        message_count: usize,
        timestamp: DateTime<Utc>,
    },
    RateLimit {
        source: String,
        session_id: String,
        message_count: usize,
        timestamp: DateTime<Utc>,
    },
    Idle {
        timestamp: DateTime<Utc>,
    },
}

/// Tracking state per session key (`"<source>:<sessionId>"`).
#[derive(Debug, Clone)]
struct SessionTrack {
    message_count: usize,
    last_checked_at: DateTime<Utc>,
    last_changed_at: DateTime<Utc>,
    unchanged_intervals: u32,
    had_growth: bool,
    rate_limit_emitted: bool,
}

/// Process-wide run permit backing the singleton guarantee.
struct RunPermit;

impl RunPermit {
    fn acquire() -> anyhow::Result<Self> {
        if RUNNING
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            anyhow::bail!("a watcher is already running in this process; stop it first");
        }
        Ok(RunPermit)
    }
}

impl Drop for RunPermit {
    fn drop(&mut self) {
        RUNNING.store(false, Ordering::SeqCst);
    }
}

/// The polling watcher. Created via [`Watcher::start`]; tracking state is
/// discarded when the instance drops.
pub struct Watcher {
    options: WatchOptions,
    tracks: HashMap<String, SessionTrack>,
    _permit: RunPermit,
}

impl Watcher {
    /// Acquire the process-wide watcher slot. Fails when another instance
    /// is already running.
    pub fn start(options: WatchOptions) -> anyhow::Result<Self> {
        Ok(Watcher {
            options,
            tracks: HashMap::new(),
            _permit: RunPermit::acquire()?,
        })
    }

    /// Run the polling loop until `stop` flips.
    ///
    /// Ticks are serialized: the next snapshot never starts while the
    /// previous one is in flight. The handler is invoked synchronously
    /// inside the tick; a panicking handler is caught and the loop
    /// continues.
    pub fn run<F>(
        &mut self,
        set: &AdapterSet,
        stop: &AtomicBool,
        mut on_event: F,
    ) -> anyhow::Result<()>
    where
        F: FnMut(WatchEvent),
    {
        let adapters = self.select_adapters(set);
        if adapters.is_empty() {
            return Err(crate::error::HandoffError::NoAgentsDetected.into());
        }

        while !stop.load(Ordering::SeqCst) {
            self.tick(&adapters, Utc::now(), &mut on_event);

            // Sleep in short slices so an interrupt lands promptly.
            let mut slept = Duration::ZERO;
            while slept < self.options.interval {
                if stop.load(Ordering::SeqCst) {
                    return Ok(());
                }
                let slice = Duration::from_millis(200).min(self.options.interval - slept);
                std::thread::sleep(slice);
                slept += slice;
            }
        }
        Ok(())
    }

    fn select_adapters<'a>(&self, set: &'a AdapterSet) -> Vec<&'a dyn AgentAdapter> {
        match &self.options.sources {
            Some(slugs) => set
                .iter()
                .filter(|a| slugs.iter().any(|s| s == a.slug()))
                .collect(),
            None => set.installed(),
        }
    }

    /// One snapshot step over `adapters`.
    pub fn tick<F>(
        &mut self,
        adapters: &[&dyn AgentAdapter],
        now: DateTime<Utc>,
        on_event: &mut F,
    ) where
        F: FnMut(WatchEvent),
    {
        let mut seen: HashSet<String> = HashSet::new();
        let mut failed_sources: Vec<&'static str> = Vec::new();
        let mut events: usize = 0;

        let mut emit = |event: WatchEvent, events: &mut usize| {
            *events += 1;
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                on_event(event)
            }));
            if result.is_err() {
                warn!("watch event handler panicked; continuing");
            }
        };

        for adapter in adapters {
            let sessions = match adapter.list_sessions(self.options.project_path.as_deref()) {
                Ok(sessions) => sessions,
                Err(e) => {
                    debug!(source = adapter.slug(), error = %e, "snapshot failed; skipping agent this tick");
                    failed_sources.push(adapter.slug());
                    continue;
                }
            };

            for session in sessions {
                let key = format!("{}:{}", adapter.slug(), session.id);
                seen.insert(key.clone());
                let count = session.message_count;

                match self.tracks.get_mut(&key) {
                    None => {
                        emit(
                            WatchEvent::NewSession {
                                source: adapter.slug().to_string(),
                                session_id: session.id.clone(),
                                message_count: count,
                                timestamp: now,
                            },
                            &mut events,
                        );
                        self.tracks.insert(
                            key,
                            SessionTrack {
                                message_count: count,
                                last_checked_at: now,
                                last_changed_at: now,
                                unchanged_intervals: 0,
                                had_growth: false,
                                rate_limit_emitted: false,
                            },
                        );
                    }
                    Some(track) => {
                        track.last_checked_at = now;
                        if count > track.message_count {
                            emit(
                                WatchEvent::SessionUpdate {
                                    source: adapter.slug().to_string(),
                                    session_id: session.id.clone(),
                                    previous_count: track.message_count,
                                    message_count: count,
                                    timestamp: now,
                                },
                                &mut events,
                            );
                            track.message_count = count;
                            track.last_changed_at = now;
                            track.unchanged_intervals = 0;
                            track.had_growth = true;
                            track.rate_limit_emitted = false;
                        } else if count == track.message_count {
                            track.unchanged_intervals += 1;
                            if track.unchanged_intervals >= RATE_LIMIT_STALL_INTERVALS
                                && count > 0
                                && track.had_growth
                                && !track.rate_limit_emitted
                            {
                                debug!(
                                    key = %key,
                                    stalled_since = %track.last_changed_at,
                                    checked_at = %track.last_checked_at,
                                    "session stalled after growth"
                                );
                                emit(
                                    WatchEvent::RateLimit {
                                        source: adapter.slug().to_string(),
                                        session_id: session.id.clone(),
                                        message_count: count,
                                        timestamp: now,
                                    },
                                    &mut events,
                                );
                                track.rate_limit_emitted = true;
                            }
                        } else {
                            // Count went backwards (session truncated or
                            // rewritten); report it and restart growth
                            // tracking.
                            emit(
                                WatchEvent::SessionUpdate {
                                    source: adapter.slug().to_string(),
                                    session_id: session.id.clone(),
                                    previous_count: track.message_count,
                                    message_count: count,
                                    timestamp: now,
                                },
                                &mut events,
                            );
                            track.message_count = count;
                            track.last_changed_at = now;
                            track.unchanged_intervals = 0;
                            track.had_growth = false;
                            track.rate_limit_emitted = false;
                        }
                    }
                }
            }
        }

        // Drop tracking for sessions not observed this tick, except those
        // belonging to agents whose snapshot failed (no state change).
        self.tracks.retain(|key, _| {
            seen.contains(key)
                || failed_sources
                    .iter()
                    .any(|slug| key.starts_with(&format!("{slug}:")))
        });

        if events == 0 && !adapters.is_empty() {
            emit(WatchEvent::Idle { timestamp: now }, &mut events);
        }
    }

    /// Sessions currently being tracked. Listing order is unspecified.
    pub fn tracked_keys(&self) -> Vec<String> {
        self.tracks.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;
    use std::sync::{LazyLock, Mutex, MutexGuard};

    use super::*;
    use crate::adapters::SessionInfo;
    use crate::model::CanonicalSession;

    // The run permit is process-wide; serialize tests that take it.
    static WATCH_LOCK: LazyLock<Mutex<()>> = LazyLock::new(|| Mutex::new(()));

    fn watch_lock() -> MutexGuard<'static, ()> {
        WATCH_LOCK.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Scripted adapter: each tick pops the next listing.
    struct MockAdapter {
        slug: &'static str,
        script: Mutex<Vec<anyhow::Result<Vec<SessionInfo>>>>,
    }

    impl MockAdapter {
        fn new(slug: &'static str, script: Vec<anyhow::Result<Vec<SessionInfo>>>) -> Self {
            let mut script = script;
            script.reverse();
            MockAdapter {
                slug,
                script: Mutex::new(script),
            }
        }
    }

    impl AgentAdapter for MockAdapter {
        fn slug(&self) -> &'static str {
            self.slug
        }
        fn display_name(&self) -> &'static str {
            "Mock"
        }
        fn detect(&self) -> bool {
            true
        }
        fn list_sessions(&self, _project: Option<&Path>) -> anyhow::Result<Vec<SessionInfo>> {
            self.script
                .lock()
                .unwrap()
                .pop()
                .unwrap_or_else(|| Ok(Vec::new()))
        }
        fn capture(&self, _session_id: &str) -> anyhow::Result<CanonicalSession> {
            anyhow::bail!("not used")
        }
    }

    fn info(id: &str, count: usize) -> SessionInfo {
        SessionInfo {
            id: id.to_string(),
            started_at: None,
            last_active_at: None,
            message_count: count,
            project_path: None,
            preview: String::new(),
        }
    }

    fn listing(count: usize) -> anyhow::Result<Vec<SessionInfo>> {
        Ok(vec![info("s1", count)])
    }

    fn run_ticks(adapter: &MockAdapter, ticks: usize) -> Vec<WatchEvent> {
        let _guard = watch_lock();
        let mut watcher = Watcher::start(WatchOptions::default()).unwrap();
        let adapters: Vec<&dyn AgentAdapter> = vec![adapter];
        let mut events = Vec::new();
        for i in 0..ticks {
            let now = Utc::now() + chrono::Duration::seconds(i as i64 * 30);
            watcher.tick(&adapters, now, &mut |e| events.push(e));
        }
        events
    }

    #[test]
    fn rate_limit_fires_exactly_once_after_stall() {
        let adapter = MockAdapter::new(
            "claude-code",
            vec![
                listing(1), // tick 1: new-session
                listing(2), // tick 2: session-update
                listing(2), // tick 3: no event → idle
                listing(2), // tick 4: rate-limit
                listing(2), // tick 5: no further rate-limit → idle
                listing(3), // tick 6: session-update clears state
            ],
        );
        let events = run_ticks(&adapter, 6);

        assert!(matches!(events[0], WatchEvent::NewSession { message_count: 1, .. }));
        assert!(matches!(
            events[1],
            WatchEvent::SessionUpdate { previous_count: 1, message_count: 2, .. }
        ));
        assert!(matches!(events[2], WatchEvent::Idle { .. }));
        assert!(
            matches!(&events[3], WatchEvent::RateLimit { session_id, message_count: 2, .. } if session_id == "s1")
        );
        assert!(matches!(events[4], WatchEvent::Idle { .. }));
        assert!(matches!(
            events[5],
            WatchEvent::SessionUpdate { previous_count: 2, message_count: 3, .. }
        ));

        let rate_limits = events
            .iter()
            .filter(|e| matches!(e, WatchEvent::RateLimit { .. }))
            .count();
        assert_eq!(rate_limits, 1);
    }

    #[test]
    fn no_rate_limit_without_prior_growth() {
        let adapter = MockAdapter::new(
            "codex",
            vec![listing(5), listing(5), listing(5), listing(5), listing(5)],
        );
        let events = run_ticks(&adapter, 5);
        assert!(
            !events.iter().any(|e| matches!(e, WatchEvent::RateLimit { .. })),
            "{events:?}"
        );
    }

    #[test]
    fn no_rate_limit_for_empty_sessions() {
        let adapter = MockAdapter::new(
            "codex",
            vec![listing(0), listing(0), listing(0), listing(0)],
        );
        let events = run_ticks(&adapter, 4);
        assert!(!events.iter().any(|e| matches!(e, WatchEvent::RateLimit { .. })));
    }

    #[test]
    fn decreased_count_resets_growth_tracking() {
        let adapter = MockAdapter::new(
            "codex",
            vec![
                listing(1),
                listing(4), // growth
                listing(2), // decrease: update + reset
                listing(2),
                listing(2), // stall, but growth was reset → no rate-limit
            ],
        );
        let events = run_ticks(&adapter, 5);
        assert!(matches!(
            events[2],
            WatchEvent::SessionUpdate { previous_count: 4, message_count: 2, .. }
        ));
        assert!(!events.iter().any(|e| matches!(e, WatchEvent::RateLimit { .. })));
    }

    #[test]
    fn vanished_session_state_dropped_and_rediscovered() {
        let adapter = MockAdapter::new(
            "codex",
            vec![listing(3), Ok(Vec::new()), listing(3)],
        );
        let events = run_ticks(&adapter, 3);
        let new_sessions = events
            .iter()
            .filter(|e| matches!(e, WatchEvent::NewSession { .. }))
            .count();
        assert_eq!(new_sessions, 2, "{events:?}");
    }

    #[test]
    fn failing_adapter_keeps_state_for_the_tick() {
        let adapter = MockAdapter::new(
            "codex",
            vec![
                listing(2),
                Err(anyhow::anyhow!("transient storage error")),
                listing(2),
            ],
        );
        let events = run_ticks(&adapter, 3);
        // Tick 2 failed: no new-session on tick 3, state survived.
        let new_sessions = events
            .iter()
            .filter(|e| matches!(e, WatchEvent::NewSession { .. }))
            .count();
        assert_eq!(new_sessions, 1, "{events:?}");
    }

    #[test]
    fn idle_emitted_when_nothing_changed() {
        let adapter = MockAdapter::new("codex", vec![Ok(Vec::new())]);
        let events = run_ticks(&adapter, 1);
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], WatchEvent::Idle { .. }));
    }

    #[test]
    fn panicking_handler_does_not_abort_the_tick() {
        let adapter = MockAdapter::new("codex", vec![Ok(vec![info("a", 1), info("b", 1)])]);
        let _guard = watch_lock();
        let mut watcher = Watcher::start(WatchOptions::default()).unwrap();
        let adapters: Vec<&dyn AgentAdapter> = vec![&adapter];
        let mut delivered = 0usize;
        watcher.tick(&adapters, Utc::now(), &mut |event| {
            delivered += 1;
            if matches!(&event, WatchEvent::NewSession { session_id, .. } if session_id == "a") {
                panic!("handler bug");
            }
        });
        // Both events were delivered despite the first handler panicking.
        assert_eq!(delivered, 2);
    }

    #[test]
    fn second_start_is_refused() {
        let _guard = watch_lock();
        let first = Watcher::start(WatchOptions::default()).unwrap();
        let second = Watcher::start(WatchOptions::default());
        assert!(second.is_err());
        drop(first);
        // Slot is released on drop.
        let third = Watcher::start(WatchOptions::default());
        assert!(third.is_ok());
    }
}
