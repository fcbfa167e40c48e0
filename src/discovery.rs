//! Source discovery and the deferred polling loop.
//!
//! A session starts with one request to the backend's session-start endpoint.
//! The backend either answers with the source list directly (immediate mode)
//! or hands back a `memkey` and keeps probing balancers server-side while the
//! viewer polls `lifeevents` for snapshots (deferred mode). Each snapshot
//! fully replaces the previous set; there is no merging. Resolution is
//! eager: as soon as any visible source exists the session resolves, and a
//! background task keeps feeding snapshots to the observer until the backend
//! reports `ready`, the attempt bound is hit, or the session is cancelled.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use indexmap::IndexMap;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::DiscoveryConfig;
use crate::dispatch::{account_error, urlencode, Outcome, RequestDispatcher};
use crate::error::EngineError;

/// One balancer the backend offered for this title.
#[derive(Debug, Clone, PartialEq)]
pub struct Source {
    pub name: String,
    pub url: String,
    /// Whether the backend considers the source playable right now.
    pub show: bool,
}

/// Insertion-ordered source set, keyed by [`source_key`].
pub type SourceSet = IndexMap<String, Source>;

/// Callback invoked with every snapshot, resolved or not. UI side effect.
pub type SnapshotObserver = Arc<dyn Fn(&SourceSet) + Send + Sync>;

/// How the poller reaches the backend. The engine plugs in the dispatcher;
/// tests plug in scripted replies.
pub trait Backend: Send + Sync {
    fn fetch_json(
        &self,
        url: &str,
        timeout: Duration,
    ) -> impl Future<Output = Result<Outcome<Value>, EngineError>> + Send;
}

impl Backend for Arc<RequestDispatcher> {
    async fn fetch_json(
        &self,
        url: &str,
        timeout: Duration,
    ) -> Result<Outcome<Value>, EngineError> {
        self.send_json_with_timeout(url, timeout).await
    }
}

/// Key a source by its explicit alias, else the first whitespace token of
/// its name, lowercased.
pub fn source_key(name: &str, alias: Option<&str>) -> String {
    match alias {
        Some(a) if !a.is_empty() => a.to_lowercase(),
        _ => name
            .split_whitespace()
            .next()
            .unwrap_or_default()
            .to_lowercase(),
    }
}

/// Parse a backend source array into a fresh set. Entries without a name are
/// dropped; `show` defaults to `true` when omitted.
pub fn parse_source_set(entries: &[Value]) -> SourceSet {
    let mut set = SourceSet::new();
    for entry in entries {
        let Some(name) = entry["name"].as_str() else {
            continue;
        };
        let alias = entry["balanser"].as_str();
        let source = Source {
            name: name.to_string(),
            url: entry["url"].as_str().unwrap_or_default().to_string(),
            show: entry["show"].as_bool().unwrap_or(true),
        };
        set.insert(source_key(name, alias), source);
    }
    set
}

/// The visible subset of a set, preserving order.
pub fn eligible_subset(set: &SourceSet) -> SourceSet {
    set.iter()
        .filter(|(_, s)| s.show)
        .map(|(k, s)| (k.clone(), s.clone()))
        .collect()
}

/// Pick the active source for playback.
///
/// An explicit override wins whenever the key exists, hidden or not. The
/// per-movie last choice and the global default only count when visible.
/// Everything else falls back to the first key.
pub fn select_active(
    set: &SourceSet,
    last_choice: Option<&str>,
    global_default: Option<&str>,
    explicit: Option<&str>,
) -> Option<String> {
    if let Some(key) = explicit {
        if set.contains_key(key) {
            return Some(key.to_string());
        }
    }
    for candidate in [last_choice, global_default].into_iter().flatten() {
        if set.get(candidate).is_some_and(|s| s.show) {
            return Some(candidate.to_string());
        }
    }
    set.keys().next().cloned()
}

enum PollDecision {
    Resolved(SourceSet),
    Continue,
}

/// Decide whether a snapshot resolves the session.
fn evaluate_snapshot(set: &SourceSet, ready: bool, preferred: Option<&str>) -> PollDecision {
    let eligible = eligible_subset(set);
    if ready {
        return PollDecision::Resolved(eligible);
    }
    if let Some(key) = preferred {
        if set.get(key).is_some_and(|s| s.show) {
            return PollDecision::Resolved(eligible);
        }
    }
    if !eligible.is_empty() {
        return PollDecision::Resolved(eligible);
    }
    PollDecision::Continue
}

/// Scheme and authority of a URL, without the path.
fn base_origin(url: &str) -> &str {
    let after_scheme = url.find("://").map_or(0, |i| i + 3);
    match url[after_scheme..].find('/') {
        Some(slash) => &url[..after_scheme + slash],
        None => url,
    }
}

/// The `lifeevents` endpoint lives next to the session-start endpoint, so
/// any path prefix in the configured server URL carries over.
fn poll_url_for(start_url: &str, memkey: &str) -> String {
    match start_url.find("lite/events") {
        Some(pos) => format!(
            "{}lifeevents?memkey={}",
            &start_url[..pos],
            urlencode(memkey)
        ),
        None => format!(
            "{}/lifeevents?memkey={}",
            base_origin(start_url),
            urlencode(memkey)
        ),
    }
}

/// Runs discovery sessions against one backend.
pub struct SourceDiscoveryPoller<B> {
    backend: B,
    config: DiscoveryConfig,
}

impl<B: Backend + Clone + 'static> SourceDiscoveryPoller<B> {
    pub fn new(backend: B, config: DiscoveryConfig) -> Self {
        Self { backend, config }
    }

    /// Run one discovery session. `preferred` is the per-movie last-chosen
    /// source key; `cancel` is the session's teardown token.
    pub async fn discover(
        &self,
        start_url: &str,
        preferred: Option<&str>,
        cancel: &CancellationToken,
        observer: Option<SnapshotObserver>,
    ) -> Result<Outcome<SourceSet>, EngineError> {
        let start = self
            .backend
            .fetch_json(start_url, Duration::from_millis(self.config.start_timeout_ms))
            .await?;
        let Outcome::Completed(reply) = start else {
            return Ok(Outcome::Suppressed);
        };

        if let Some(message) = account_error(&reply) {
            return Err(EngineError::Account { message });
        }

        // Immediate mode: the reply is the final source list.
        if let Some(entries) = reply.as_array() {
            let set = parse_source_set(entries);
            if let Some(observer) = &observer {
                observer(&set);
            }
            if set.is_empty() {
                return Err(EngineError::NoSources);
            }
            return Ok(Outcome::Completed(set));
        }

        let deferred = reply["life"].as_bool().unwrap_or(false);
        let Some(memkey) = reply["memkey"].as_str().filter(|_| deferred) else {
            return Err(EngineError::Parse(
                "session start reply is neither a source list nor a deferred session".to_string(),
            ));
        };
        let poll_url = poll_url_for(start_url, memkey);
        debug!(memkey, "Deferred discovery session started");

        self.poll_until_resolved(&poll_url, preferred, cancel, observer)
            .await
    }

    /// The deferred loop: poll immediately, then once per interval until
    /// resolution, the attempt bound, or cancellation.
    async fn poll_until_resolved(
        &self,
        poll_url: &str,
        preferred: Option<&str>,
        cancel: &CancellationToken,
        observer: Option<SnapshotObserver>,
    ) -> Result<Outcome<SourceSet>, EngineError> {
        let mut set = SourceSet::new();
        let mut attempt: u32 = 0;

        loop {
            if cancel.is_cancelled() {
                debug!("Discovery session cancelled");
                return Ok(Outcome::Suppressed);
            }
            attempt += 1;

            match self.poll_once(poll_url, &mut set, &observer).await? {
                PollResult::Failed => {}
                PollResult::Snapshot { ready } => {
                    match evaluate_snapshot(&set, ready, preferred) {
                        PollDecision::Resolved(eligible) => {
                            if eligible.is_empty() {
                                return Err(EngineError::NoSources);
                            }
                            info!(
                                sources = eligible.len(),
                                attempts = attempt,
                                "Discovery resolved"
                            );
                            if !ready {
                                self.spawn_background_poll(
                                    poll_url.to_string(),
                                    attempt,
                                    cancel.clone(),
                                    observer,
                                );
                            }
                            return Ok(Outcome::Completed(eligible));
                        }
                        PollDecision::Continue => {}
                    }
                }
            }

            if attempt >= self.config.max_attempts {
                break;
            }
            tokio::time::sleep(Duration::from_millis(self.config.poll_interval_ms)).await;
        }

        // Attempt bound reached; whatever is visible now is the answer.
        let eligible = eligible_subset(&set);
        if eligible.is_empty() {
            Err(EngineError::NoSources)
        } else {
            Ok(Outcome::Completed(eligible))
        }
    }

    /// One poll round. Replaces `set` with the `online` snapshot and
    /// notifies the observer. Transport and suppression failures report
    /// `Failed` and still consume an attempt.
    async fn poll_once(
        &self,
        poll_url: &str,
        set: &mut SourceSet,
        observer: &Option<SnapshotObserver>,
    ) -> Result<PollResult, EngineError> {
        let reply = match self
            .backend
            .fetch_json(poll_url, Duration::from_millis(self.config.poll_timeout_ms))
            .await
        {
            Ok(Outcome::Completed(reply)) => reply,
            Ok(Outcome::Suppressed) => return Ok(PollResult::Failed),
            Err(e) => {
                warn!("Discovery poll failed: {e}");
                return Ok(PollResult::Failed);
            }
        };

        if let Some(message) = account_error(&reply) {
            return Err(EngineError::Account { message });
        }

        if let Some(entries) = reply["online"].as_array() {
            *set = parse_source_set(entries);
            if let Some(observer) = observer {
                observer(set);
            }
        }
        Ok(PollResult::Snapshot {
            ready: reply["ready"].as_bool().unwrap_or(false),
        })
    }

    /// Keep polling after early resolution so the observer sees late
    /// snapshots. Stops on `ready`, cancellation, or the attempt bound.
    fn spawn_background_poll(
        &self,
        poll_url: String,
        attempts_used: u32,
        cancel: CancellationToken,
        observer: Option<SnapshotObserver>,
    ) {
        let backend = self.backend.clone();
        let config = self.config.clone();
        tokio::spawn(async move {
            let poller = SourceDiscoveryPoller::new(backend, config);
            let mut set = SourceSet::new();
            let mut attempt = attempts_used;
            while attempt < poller.config.max_attempts {
                tokio::time::sleep(Duration::from_millis(poller.config.poll_interval_ms)).await;
                if cancel.is_cancelled() {
                    return;
                }
                attempt += 1;
                match poller.poll_once(&poll_url, &mut set, &observer).await {
                    Ok(PollResult::Snapshot { ready: true }) | Err(_) => return,
                    Ok(PollResult::Snapshot { ready: false }) | Ok(PollResult::Failed) => {}
                }
            }
        });
    }
}

enum PollResult {
    Snapshot { ready: bool },
    Failed,
}
