//! Automatic balancer failover.
//!
//! When playback fails on the active source, a visible countdown runs before
//! the engine switches to the next source in order. Account errors get a
//! longer countdown so the viewer can read the message. The viewer can stop
//! the countdown (keep the broken source) or ask for the picker instead.

use tokio::sync::mpsc;
use tokio::time::{sleep, Duration};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

const TICK: Duration = Duration::from_millis(1000);
const TICKS_DEFAULT: u32 = 5;
const TICKS_ACCOUNT: u32 = 10;

/// Viewer input while the countdown runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailoverCommand {
    /// Stop the countdown and stay on the current source.
    Cancel,
    /// Stop the countdown and open the source picker instead.
    Change,
}

/// Countdown progress and outcome, for the UI.
#[derive(Debug, Clone, PartialEq)]
pub enum FailoverEvent {
    Tick { remaining: u32 },
    Switch { to: String },
    OpenPicker,
    Stopped,
}

/// The key after `active`, wrapping at the end. An unknown active key starts
/// over from the first.
pub fn next_source_key(keys: &[String], active: &str) -> Option<String> {
    if keys.is_empty() {
        return None;
    }
    let next_index = keys
        .iter()
        .position(|k| k == active)
        .map_or(0, |p| (p + 1) % keys.len());
    Some(keys[next_index].clone())
}

/// Runs failover countdowns. One per view; stateless between runs.
pub struct FailoverTimer {
    cancel: CancellationToken,
}

impl FailoverTimer {
    /// `cancel` is the owning session's teardown token; an abandoned view
    /// must never switch sources behind the viewer's back.
    pub fn new(cancel: CancellationToken) -> Self {
        Self { cancel }
    }

    /// Run one countdown. Returns the key to switch to, or `None` when the
    /// countdown was stopped or the session torn down.
    pub async fn run(
        &self,
        keys: &[String],
        active: &str,
        account_error: bool,
        commands: &mut mpsc::Receiver<FailoverCommand>,
        events: &mpsc::Sender<FailoverEvent>,
    ) -> Option<String> {
        let total = if account_error {
            TICKS_ACCOUNT
        } else {
            TICKS_DEFAULT
        };

        for remaining in (1..=total).rev() {
            let _ = events.send(FailoverEvent::Tick { remaining }).await;
            tokio::select! {
                () = self.cancel.cancelled() => {
                    debug!("Failover countdown abandoned with the session");
                    return None;
                }
                cmd = commands.recv() => match cmd {
                    Some(FailoverCommand::Cancel) | None => {
                        let _ = events.send(FailoverEvent::Stopped).await;
                        return None;
                    }
                    Some(FailoverCommand::Change) => {
                        let _ = events.send(FailoverEvent::OpenPicker).await;
                        return None;
                    }
                },
                () = sleep(TICK) => {}
            }
        }

        if self.cancel.is_cancelled() {
            return None;
        }
        let next = next_source_key(keys, active)?;
        info!(from = active, to = %next, "Failing over to next source");
        let _ = events
            .send(FailoverEvent::Switch { to: next.clone() })
            .await;
        Some(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| (*s).to_string()).collect()
    }

    #[test]
    fn next_key_wraps_and_handles_unknown() {
        let k = keys(&["a", "b", "c"]);
        assert_eq!(next_source_key(&k, "a").as_deref(), Some("b"));
        assert_eq!(next_source_key(&k, "c").as_deref(), Some("a"));
        assert_eq!(next_source_key(&k, "zzz").as_deref(), Some("a"));
        assert_eq!(next_source_key(&[], "a"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn countdown_switches_after_five_ticks() {
        let timer = FailoverTimer::new(CancellationToken::new());
        let (_cmd_tx, mut cmd_rx) = mpsc::channel(4);
        let (evt_tx, mut evt_rx) = mpsc::channel(64);
        let k = keys(&["a", "b"]);

        let switched = timer.run(&k, "a", false, &mut cmd_rx, &evt_tx).await;
        assert_eq!(switched.as_deref(), Some("b"));

        let mut ticks = 0;
        let mut saw_switch = false;
        while let Ok(evt) = evt_rx.try_recv() {
            match evt {
                FailoverEvent::Tick { .. } => ticks += 1,
                FailoverEvent::Switch { to } => {
                    saw_switch = true;
                    assert_eq!(to, "b");
                }
                other => panic!("unexpected event: {other:?}"),
            }
        }
        assert_eq!(ticks, 5);
        assert!(saw_switch);
    }

    #[tokio::test(start_paused = true)]
    async fn account_error_runs_ten_ticks() {
        let timer = FailoverTimer::new(CancellationToken::new());
        let (_cmd_tx, mut cmd_rx) = mpsc::channel(4);
        let (evt_tx, mut evt_rx) = mpsc::channel(64);
        let k = keys(&["a", "b"]);

        timer.run(&k, "b", true, &mut cmd_rx, &evt_tx).await;
        let ticks = std::iter::from_fn(|| evt_rx.try_recv().ok())
            .filter(|e| matches!(e, FailoverEvent::Tick { .. }))
            .count();
        assert_eq!(ticks, 10);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_command_stops_without_switching() {
        let timer = FailoverTimer::new(CancellationToken::new());
        let (cmd_tx, mut cmd_rx) = mpsc::channel(4);
        let (evt_tx, mut evt_rx) = mpsc::channel(64);
        cmd_tx.send(FailoverCommand::Cancel).await.unwrap();

        let switched = timer
            .run(&keys(&["a", "b"]), "a", false, &mut cmd_rx, &evt_tx)
            .await;
        assert_eq!(switched, None);

        let events: Vec<FailoverEvent> = std::iter::from_fn(|| evt_rx.try_recv().ok()).collect();
        assert!(events.contains(&FailoverEvent::Stopped));
        assert!(!events
            .iter()
            .any(|e| matches!(e, FailoverEvent::Switch { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn change_command_opens_picker() {
        let timer = FailoverTimer::new(CancellationToken::new());
        let (cmd_tx, mut cmd_rx) = mpsc::channel(4);
        let (evt_tx, mut evt_rx) = mpsc::channel(64);
        cmd_tx.send(FailoverCommand::Change).await.unwrap();

        let switched = timer
            .run(&keys(&["a", "b"]), "a", false, &mut cmd_rx, &evt_tx)
            .await;
        assert_eq!(switched, None);
        let events: Vec<FailoverEvent> = std::iter::from_fn(|| evt_rx.try_recv().ok()).collect();
        assert!(events.contains(&FailoverEvent::OpenPicker));
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_session_never_switches() {
        let token = CancellationToken::new();
        token.cancel();
        let timer = FailoverTimer::new(token);
        let (_cmd_tx, mut cmd_rx) = mpsc::channel(4);
        let (evt_tx, _evt_rx) = mpsc::channel(64);

        let switched = timer
            .run(&keys(&["a", "b"]), "a", false, &mut cmd_rx, &evt_tx)
            .await;
        assert_eq!(switched, None);
    }
}
