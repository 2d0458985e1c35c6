/// Typing presence
///
/// Two small state machines drive the indicator:
///
/// - `LocalTyping` decides when this client emits start/stop signals. A burst
///   of keystrokes emits one start, repeated at most once per refresh window,
///   and a stop after the quiet period or immediately on send.
/// - `RemoteTypingSet` tracks who else is typing. An entry expires when it is
///   not refreshed within the remote timeout; an explicit stop removes it at
///   once.
///
/// `TypingTracker` runs both on a tokio task per session and publishes the
/// remote set through a `watch` channel.

use serde::Serialize;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;

use agora_protocol::UserId;

use crate::config::SyncConfig;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TypingSignal {
    Start,
    Stop,
}

impl TypingSignal {
    pub fn is_typing(self) -> bool {
        self == TypingSignal::Start
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct TypingUser {
    pub id: UserId,
    pub name: String,
}

// ─── Local ───────────────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct LocalTyping {
    quiet_period: Duration,
    refresh_window: Duration,
    typing: bool,
    last_keystroke: Option<Instant>,
    last_start: Option<Instant>,
}

impl LocalTyping {
    pub fn new(quiet_period: Duration, refresh_window: Duration) -> Self {
        Self {
            quiet_period,
            refresh_window,
            typing: false,
            last_keystroke: None,
            last_start: None,
        }
    }

    pub fn is_typing(&self) -> bool {
        self.typing
    }

    pub fn keystroke(&mut self, now: Instant) -> Option<TypingSignal> {
        self.last_keystroke = Some(now);
        let refresh_due = self
            .last_start
            .map_or(true, |at| now.saturating_duration_since(at) >= self.refresh_window);

        if !self.typing || refresh_due {
            self.typing = true;
            self.last_start = Some(now);
            return Some(TypingSignal::Start);
        }
        None
    }

    /// Stop once the quiet period has passed since the last keystroke.
    pub fn poll_quiet(&mut self, now: Instant) -> Option<TypingSignal> {
        match self.deadline() {
            Some(deadline) if now >= deadline => self.stop(),
            _ => None,
        }
    }

    pub fn stop(&mut self) -> Option<TypingSignal> {
        if !self.typing {
            return None;
        }
        self.typing = false;
        self.last_start = None;
        Some(TypingSignal::Stop)
    }

    pub fn deadline(&self) -> Option<Instant> {
        if !self.typing {
            return None;
        }
        self.last_keystroke.map(|at| at + self.quiet_period)
    }
}

// ─── Remote ──────────────────────────────────────────────────────────────────

struct RemoteEntry {
    name: String,
    expires_at: Instant,
}

pub struct RemoteTypingSet {
    timeout: Duration,
    users: HashMap<UserId, RemoteEntry>,
}

impl RemoteTypingSet {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            users: HashMap::new(),
        }
    }

    /// Returns true when the visible set changed.
    pub fn apply(&mut self, user: UserId, name: String, typing: bool, now: Instant) -> bool {
        if !typing {
            return self.users.remove(&user).is_some();
        }
        let expires_at = now + self.timeout;
        match self.users.get_mut(&user) {
            Some(entry) => {
                entry.expires_at = expires_at;
                if entry.name != name && !name.is_empty() {
                    entry.name = name;
                    return true;
                }
                false
            }
            None => {
                self.users.insert(user, RemoteEntry { name, expires_at });
                true
            }
        }
    }

    /// Drop expired entries. Returns true when any were removed.
    pub fn expire(&mut self, now: Instant) -> bool {
        let before = self.users.len();
        self.users.retain(|_, entry| entry.expires_at > now);
        self.users.len() != before
    }

    pub fn next_expiry(&self) -> Option<Instant> {
        self.users.values().map(|entry| entry.expires_at).min()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }

    /// Currently typing users, ordered by name.
    pub fn snapshot(&self) -> Vec<TypingUser> {
        let mut users: Vec<TypingUser> = self
            .users
            .iter()
            .map(|(id, entry)| TypingUser {
                id: id.clone(),
                name: entry.name.clone(),
            })
            .collect();
        users.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.id.cmp(&b.id)));
        users
    }
}

// ─── Tracker task ────────────────────────────────────────────────────────────

#[derive(Debug)]
enum TypingInput {
    Keystroke,
    Sent,
    Remote {
        user: UserId,
        name: String,
        typing: bool,
    },
}

/// Cheap handle to a running tracker. Calls after the tracker stopped are
/// ignored.
#[derive(Clone)]
pub struct TypingHandle {
    inbox: mpsc::UnboundedSender<TypingInput>,
    users: watch::Receiver<Vec<TypingUser>>,
}

impl TypingHandle {
    pub fn keystroke(&self) {
        let _ = self.inbox.send(TypingInput::Keystroke);
    }

    /// A message was sent; local typing ends now.
    pub fn sent(&self) {
        let _ = self.inbox.send(TypingInput::Sent);
    }

    pub fn remote(&self, user: UserId, name: String, typing: bool) {
        let _ = self.inbox.send(TypingInput::Remote { user, name, typing });
    }

    pub fn subscribe(&self) -> watch::Receiver<Vec<TypingUser>> {
        self.users.clone()
    }

    pub fn current(&self) -> Vec<TypingUser> {
        self.users.borrow().clone()
    }
}

pub struct TypingTracker;

impl TypingTracker {
    /// Start the tracker. Local start/stop signals come out of the returned
    /// receiver; the caller forwards them to the server.
    pub fn spawn(
        config: &SyncConfig,
        cancel: CancellationToken,
    ) -> (TypingHandle, mpsc::UnboundedReceiver<TypingSignal>, JoinHandle<()>) {
        let (inbox_tx, inbox) = mpsc::unbounded_channel();
        let (signal_tx, signals) = mpsc::unbounded_channel();
        let (users_tx, users) = watch::channel(Vec::new());

        let local = LocalTyping::new(config.typing_quiet_period(), config.typing_refresh_window());
        let remote = RemoteTypingSet::new(config.remote_typing_timeout());
        let task = tokio::spawn(run(local, remote, inbox, signal_tx, users_tx, cancel));

        (
            TypingHandle {
                inbox: inbox_tx,
                users,
            },
            signals,
            task,
        )
    }
}

async fn run(
    mut local: LocalTyping,
    mut remote: RemoteTypingSet,
    mut inbox: mpsc::UnboundedReceiver<TypingInput>,
    signals: mpsc::UnboundedSender<TypingSignal>,
    users: watch::Sender<Vec<TypingUser>>,
    cancel: CancellationToken,
) {
    loop {
        let deadline = earliest(local.deadline(), remote.next_expiry());
        let mut remote_changed = false;

        tokio::select! {
            _ = cancel.cancelled() => break,
            input = inbox.recv() => {
                let Some(input) = input else { break };
                let now = Instant::now();
                let signal = match input {
                    TypingInput::Keystroke => local.keystroke(now),
                    TypingInput::Sent => local.stop(),
                    TypingInput::Remote { user, name, typing } => {
                        remote_changed = remote.apply(user, name, typing, now);
                        None
                    }
                };
                if let Some(signal) = signal {
                    let _ = signals.send(signal);
                }
            }
            _ = sleep_until_opt(deadline) => {}
        }

        let now = Instant::now();
        if let Some(signal) = local.poll_quiet(now) {
            let _ = signals.send(signal);
        }
        if remote.expire(now) {
            log::debug!("Remote typing expired");
            remote_changed = true;
        }
        if remote_changed {
            let _ = users.send(remote.snapshot());
        }
    }
    log::debug!("Typing tracker stopped");
}

fn earliest(a: Option<Instant>, b: Option<Instant>) -> Option<Instant> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
