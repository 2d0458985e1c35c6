//! Conversation session.
//!
//! One open conversation: the message store behind a reconciler, the push
//! route, the polling fallback, and typing presence. Every local action goes
//! through the same three steps:
//!
//! 1. `begin_*` on the reconciler applies the optimistic state (under the
//!    lock) and returns a `Dispatch`.
//! 2. The command is executed with a fresh credential (lock released).
//! 3. `complete` or `fail` folds the result back in (under the lock).
//!
//! Push events and poll snapshots go through the same reconciler, so the
//! order in which responses, echoes and snapshots arrive does not matter.

use chrono::Utc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use agora_protocol::{
    aggregate, resolve_status, ApplyOutcome, Command, CommandResponse, ConversationId, Dispatch,
    EventSource, Message, MessageBody, MessageId, PushEvent, ReactionSummary, ReceiptStatus,
    ReconcileError, Reconciler, SenderProfile, StoreChange, UserId,
};

use crate::platform::Platform;
use crate::poller;
use crate::push::{HubEvent, Subscription};
use crate::transport::TransportError;
use crate::typing::{TypingHandle, TypingSignal, TypingTracker, TypingUser};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("Network unavailable: {0}")]
    NetworkUnavailable(String),

    #[error("Unauthorized")]
    Unauthorized,

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Rejected: {0}")]
    Rejected(String),

    #[error("Session closed")]
    Closed,

    #[error(transparent)]
    Reconcile(#[from] ReconcileError),
}

impl From<TransportError> for SessionError {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::Unavailable(reason) => SessionError::NetworkUnavailable(reason),
            TransportError::Unauthorized => SessionError::Unauthorized,
            TransportError::NotFound(what) => SessionError::NotFound(what),
            TransportError::Conflict(what) => SessionError::Conflict(what),
            TransportError::Forbidden(what) => SessionError::Forbidden(what),
            TransportError::Rejected(what) => SessionError::Rejected(what),
        }
    }
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

struct SessionInner {
    platform: Platform,
    conversation: ConversationId,
    profile: SenderProfile,
    /// Never held across network I/O.
    reconciler: Mutex<Reconciler>,
    changes: broadcast::Sender<Vec<StoreChange>>,
    typing: TypingHandle,
    cancel: CancellationToken,
    closed: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Handle to one open conversation. Dropping it stops the background tasks;
/// `close` additionally waits for them to finish.
pub struct ConversationSession {
    inner: Arc<SessionInner>,
}

impl ConversationSession {
    pub(crate) async fn open(
        platform: Platform,
        profile: SenderProfile,
        conversation: ConversationId,
    ) -> Result<Self, SessionError> {
        let config = platform.config().clone();
        let cancel = platform.shutdown_token().child_token();

        let mut reconciler = Reconciler::new(
            conversation.clone(),
            profile.id.clone(),
            config.reconciler.clone(),
        );
        let page = fetch_history(&platform, &conversation, &cancel).await?;
        let loaded = reconciler.apply_snapshot(EventSource::Poll, page)?;
        reconciler.drain_changes();

        let (changes, _) = broadcast::channel(config.change_channel_capacity);
        let (typing, signals, typing_task) = TypingTracker::spawn(&config, cancel.clone());

        let subscription = match platform.push().subscribe(&conversation).await {
            Ok(subscription) => Some(subscription),
            Err(TransportError::Unauthorized) => {
                cancel.cancel();
                return Err(SessionError::Unauthorized);
            }
            Err(e) => {
                log::warn!("⚠️  Push unavailable for {}, polling only: {}", conversation, e);
                None
            }
        };

        let inner = Arc::new(SessionInner {
            platform,
            conversation,
            profile,
            reconciler: Mutex::new(reconciler),
            changes,
            typing,
            cancel,
            closed: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
        });

        let mut tasks = vec![
            typing_task,
            tokio::spawn(forward_typing(inner.clone(), signals)),
            tokio::spawn(listen(inner.clone(), subscription)),
        ];
        if let Some(period) = config.poll_interval() {
            let session = inner.clone();
            tasks.push(poller::spawn(period, inner.cancel.clone(), move || {
                let session = session.clone();
                async move { session.poll_tick().await }
            }));
        }
        *inner.tasks.lock().await = tasks;

        log::info!("✓ Session opened for {} ({} messages)", inner.conversation, loaded);
        Ok(Self { inner })
    }

    pub fn conversation_id(&self) -> &ConversationId {
        &self.inner.conversation
    }

    pub fn profile(&self) -> &SenderProfile {
        &self.inner.profile
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    // ── Commands ────────────────────────────────────────────────────────────

    /// Send a message. The optimistic entry is visible immediately; the
    /// returned id is the authoritative one. On failure the entry stays in
    /// the list as `failed(send)` and can be passed to `retry`.
    pub async fn send(
        &self,
        body: MessageBody,
        reply_to: Option<&MessageId>,
    ) -> Result<MessageId, SessionError> {
        self.inner.ensure_open()?;
        self.inner.typing.sent();
        let dispatch = self
            .inner
            .begin(|r, profile| r.begin_send(profile.clone(), body, reply_to, Utc::now()))
            .await?;
        self.finish_send(dispatch).await
    }

    /// Resend a failed message with its original client key.
    pub async fn retry(&self, local_id: &MessageId) -> Result<MessageId, SessionError> {
        self.inner.ensure_open()?;
        let dispatch = self.inner.begin(|r, _| r.begin_retry(local_id)).await?;
        self.finish_send(dispatch).await
    }

    /// Toggle the viewer's reaction.
    pub async fn react(&self, id: &MessageId, emoji: &str) -> Result<(), SessionError> {
        self.inner.ensure_open()?;
        let dispatch = self.inner.begin(|r, _| r.begin_react(id, emoji)).await?;
        self.inner.run(dispatch).await.map(|_| ())
    }

    /// Toggle the pinned flag.
    pub async fn pin(&self, id: &MessageId) -> Result<(), SessionError> {
        self.inner.ensure_open()?;
        let dispatch = self.inner.begin(|r, _| r.begin_pin(id)).await?;
        self.inner.run(dispatch).await.map(|_| ())
    }

    pub async fn edit(&self, id: &MessageId, body: MessageBody) -> Result<(), SessionError> {
        self.inner.ensure_open()?;
        let dispatch = self
            .inner
            .begin(|r, _| r.begin_edit(id, body, Utc::now()))
            .await?;
        self.inner.run(dispatch).await.map(|_| ())
    }

    pub async fn delete_for_self(&self, id: &MessageId) -> Result<(), SessionError> {
        self.inner.ensure_open()?;
        let dispatch = self.inner.begin(|r, _| r.begin_delete_for_self(id)).await?;
        self.inner.run(dispatch).await.map(|_| ())
    }

    pub async fn delete_for_everyone(&self, id: &MessageId) -> Result<(), SessionError> {
        self.inner.ensure_open()?;
        let dispatch = self
            .inner
            .begin(|r, _| r.begin_delete_for_everyone(id))
            .await?;
        self.inner.run(dispatch).await.map(|_| ())
    }

    /// Mark everything currently loaded as read.
    pub async fn mark_read(&self) -> Result<(), SessionError> {
        self.inner.ensure_open()?;
        let dispatch = self
            .inner
            .begin(|r, _| {
                let up_to = r.store().latest_created_at();
                Ok(r.begin_mark_read(up_to))
            })
            .await?;
        self.inner.run(dispatch).await.map(|_| ())
    }

    /// Report local typing activity.
    pub fn keystroke(&self) {
        if !self.inner.is_closed() {
            self.inner.typing.keystroke();
        }
    }

    async fn finish_send(&self, dispatch: Dispatch) -> Result<MessageId, SessionError> {
        let local_id = dispatch.message_id.clone();
        match self.inner.run(dispatch).await? {
            CommandResponse::Created { message } => Ok(message.id),
            _ => local_id.ok_or(SessionError::Reconcile(ReconcileError::UnexpectedResponse(
                "send",
            ))),
        }
    }

    // ── Refresh ─────────────────────────────────────────────────────────────

    /// Refetch the latest history page and merge it.
    pub async fn refresh(&self) -> Result<usize, SessionError> {
        self.inner.ensure_open()?;
        self.inner.refresh().await
    }

    /// Refetch the pinned view and return it, newest first.
    pub async fn fetch_pinned(&self) -> Result<Vec<Message>, SessionError> {
        let inner = &self.inner;
        inner.ensure_open()?;
        let limit = inner.platform.config().pinned_page_size;
        let credential = inner.credential().await?;
        let page = tokio::select! {
            _ = inner.cancel.cancelled() => return Err(SessionError::Closed),
            page = inner.platform.history().fetch_pinned(&credential, &inner.conversation, limit) => page,
        };
        let page = match page {
            Ok(page) => page,
            Err(e) => return Err(inner.transport_failed(e)),
        };

        let mut reconciler = inner.reconciler.lock().await;
        reconciler.apply_pinned(page, limit)?;
        inner.publish(reconciler.drain_changes());
        Ok(reconciler
            .store()
            .pinned(limit)
            .into_iter()
            .cloned()
            .collect())
    }

    // ── Reads ───────────────────────────────────────────────────────────────

    /// Messages visible to the viewer, in conversation order.
    pub async fn messages(&self) -> Vec<Message> {
        let reconciler = self.inner.reconciler.lock().await;
        reconciler.visible().into_iter().cloned().collect()
    }

    pub async fn message(&self, id: &MessageId) -> Option<Message> {
        self.inner.reconciler.lock().await.message(id).cloned()
    }

    pub async fn reactions(&self, id: &MessageId) -> Option<Vec<ReactionSummary>> {
        let reconciler = self.inner.reconciler.lock().await;
        reconciler
            .message(id)
            .map(|m| aggregate(&m.reactions, &self.inner.profile.id))
    }

    /// Total reaction count on a message, across all emoji.
    pub async fn reaction_total(&self, id: &MessageId) -> Option<usize> {
        let reconciler = self.inner.reconciler.lock().await;
        reconciler
            .message(id)
            .map(|m| agora_protocol::reactions::total(&m.reactions))
    }

    /// Users other than the author who have read a message.
    pub async fn readers(&self, id: &MessageId) -> Option<Vec<UserId>> {
        let reconciler = self.inner.reconciler.lock().await;
        reconciler
            .message(id)
            .map(|m| agora_protocol::receipts::readers(m).into_iter().cloned().collect())
    }

    /// Delivery status of one of the viewer's own messages.
    pub async fn status(&self, id: &MessageId) -> Option<ReceiptStatus> {
        let reconciler = self.inner.reconciler.lock().await;
        reconciler
            .message(id)
            .and_then(|m| resolve_status(m, &self.inner.profile.id))
    }

    /// Locally known pinned messages, newest first.
    pub async fn pinned(&self) -> Vec<Message> {
        let limit = self.inner.platform.config().pinned_page_size;
        let reconciler = self.inner.reconciler.lock().await;
        reconciler
            .store()
            .pinned(limit)
            .into_iter()
            .cloned()
            .collect()
    }

    pub fn subscribe_changes(&self) -> broadcast::Receiver<Vec<StoreChange>> {
        self.inner.changes.subscribe()
    }

    pub fn typing(&self) -> watch::Receiver<Vec<TypingUser>> {
        self.inner.typing.subscribe()
    }

    pub fn typing_users(&self) -> Vec<TypingUser> {
        self.inner.typing.current()
    }

    // ── Lifecycle ───────────────────────────────────────────────────────────

    /// Stop every background task and release the push route. Commands still
    /// in flight finish, but their results are discarded.
    pub async fn close(&self) {
        self.inner.shutdown();
        let tasks = std::mem::take(&mut *self.inner.tasks.lock().await);
        for task in tasks {
            if let Err(e) = task.await {
                log::warn!("⚠️  Session task ended abnormally: {}", e);
            }
        }
        log::info!("✓ Session closed for {}", self.inner.conversation);
    }
}

impl Drop for ConversationSession {
    fn drop(&mut self) {
        self.inner.shutdown();
    }
}

// ---------------------------------------------------------------------------
// Internals
// ---------------------------------------------------------------------------

impl SessionInner {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> Result<(), SessionError> {
        if self.is_closed() {
            return Err(SessionError::Closed);
        }
        Ok(())
    }

    fn shutdown(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.cancel.cancel();
        }
    }

    fn publish(&self, changes: Vec<StoreChange>) {
        if !changes.is_empty() {
            let _ = self.changes.send(changes);
        }
    }

    /// Map a transport failure, closing the session when the credential was
    /// rejected.
    fn transport_failed(&self, e: TransportError) -> SessionError {
        match e {
            TransportError::Unauthorized => {
                log::error!("Credential rejected, closing {}", self.conversation);
                self.shutdown();
            }
            ref other => log::warn!("⚠️  {}: {}", self.conversation, other),
        }
        e.into()
    }

    async fn credential(&self) -> Result<crate::transport::Credential, SessionError> {
        self.platform
            .credentials()
            .credential()
            .await
            .map_err(|e| self.transport_failed(e))
    }

    /// Run `f` against the reconciler and publish what it changed.
    async fn begin<F>(&self, f: F) -> Result<Dispatch, SessionError>
    where
        F: FnOnce(&mut Reconciler, &SenderProfile) -> Result<Dispatch, ReconcileError>,
    {
        let mut reconciler = self.reconciler.lock().await;
        let dispatch = f(&mut *reconciler, &self.profile);
        self.publish(reconciler.drain_changes());
        Ok(dispatch?)
    }

    /// Execute a dispatched command and fold its result back in.
    async fn run(&self, dispatch: Dispatch) -> Result<CommandResponse, SessionError> {
        let Dispatch {
            ticket, command, ..
        } = dispatch;
        let name = command.name();

        let result = match self.platform.credentials().credential().await {
            Ok(credential) => self.platform.commands().execute(&credential, command).await,
            Err(e) => Err(e),
        };

        if self.is_closed() {
            log::debug!("Result of {} discarded, session closed", name);
            return Err(SessionError::Closed);
        }

        let mut reconciler = self.reconciler.lock().await;
        match result {
            Ok(response) => {
                let outcome = reconciler.complete(ticket, response.clone());
                self.publish(reconciler.drain_changes());
                outcome?;
                Ok(response)
            }
            Err(e) => {
                if let Err(err) = reconciler.fail(ticket) {
                    log::warn!("⚠️  Rollback of {} failed: {}", name, err);
                }
                self.publish(reconciler.drain_changes());
                drop(reconciler);
                Err(self.transport_failed(e))
            }
        }
    }

    async fn refresh(&self) -> Result<usize, SessionError> {
        let page = match fetch_history(&self.platform, &self.conversation, &self.cancel).await {
            Ok(page) => page,
            Err(SessionError::Unauthorized) => {
                self.shutdown();
                return Err(SessionError::Unauthorized);
            }
            Err(e) => return Err(e),
        };
        let mut reconciler = self.reconciler.lock().await;
        let applied = reconciler.apply_snapshot(EventSource::Poll, page)?;
        self.publish(reconciler.drain_changes());
        Ok(applied)
    }

    /// One polling round. Returns false once polling should stop.
    async fn poll_tick(&self) -> bool {
        match self.refresh().await {
            Ok(applied) => {
                if applied > 0 {
                    log::debug!("Poll applied {} message(s) to {}", applied, self.conversation);
                }
                true
            }
            Err(SessionError::Unauthorized) | Err(SessionError::Closed) => false,
            Err(e) => {
                log::debug!("Poll of {} failed: {}", self.conversation, e);
                true
            }
        }
    }

    async fn apply_push(&self, event: PushEvent) -> Result<ApplyOutcome, ReconcileError> {
        let mut reconciler = self.reconciler.lock().await;
        let outcome = reconciler.apply_event(EventSource::Push, event);
        self.publish(reconciler.drain_changes());
        outcome
    }

    async fn handle_push(&self, event: PushEvent) {
        if let PushEvent::TypingChanged {
            user,
            user_name,
            typing,
            ..
        } = event
        {
            if user != self.profile.id {
                self.typing.remote(user, user_name, typing);
            }
            return;
        }

        match self.apply_push(event).await {
            Ok(ApplyOutcome::Missing(id)) => {
                log::debug!("Push referenced unknown {}, refreshing", id);
                self.resync().await;
            }
            Ok(_) => {}
            Err(e) => log::warn!("⚠️  Push event for {} rejected: {}", self.conversation, e),
        }
    }

    async fn resync(&self) {
        if let Err(e) = self.refresh().await {
            log::warn!("⚠️  Resync of {} failed: {}", self.conversation, e);
        }
    }

    /// Sleep for the reconnect delay. False when cancelled first.
    async fn backoff(&self) -> bool {
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            _ = tokio::time::sleep(self.platform.config().reconnect_delay()) => true,
        }
    }
}

async fn fetch_history(
    platform: &Platform,
    conversation: &ConversationId,
    cancel: &CancellationToken,
) -> Result<Vec<Message>, SessionError> {
    let credential = platform.credentials().credential().await?;
    let limit = platform.config().history_page_size;
    tokio::select! {
        _ = cancel.cancelled() => Err(SessionError::Closed),
        page = platform.history().fetch_history(&credential, conversation, limit) => Ok(page?),
    }
}

// ---------------------------------------------------------------------------
// Background tasks
// ---------------------------------------------------------------------------

/// Push listener. Holds the route for the session's lifetime and keeps it
/// alive across connection drops.
async fn listen(inner: Arc<SessionInner>, mut subscription: Option<Subscription>) {
    let hub = inner.platform.push().clone();

    'outer: loop {
        let mut route = match subscription.take() {
            Some(route) => route,
            None => {
                if !inner.backoff().await {
                    break;
                }
                match hub.subscribe(&inner.conversation).await {
                    Ok(route) => {
                        inner.resync().await;
                        route
                    }
                    Err(TransportError::Unauthorized) => {
                        inner.transport_failed(TransportError::Unauthorized);
                        break;
                    }
                    Err(e) => {
                        log::debug!("Push subscribe for {} failed: {}", inner.conversation, e);
                        continue;
                    }
                }
            }
        };

        loop {
            let next = tokio::select! {
                _ = inner.cancel.cancelled() => {
                    route.close().await;
                    break 'outer;
                }
                next = route.recv() => next,
            };

            match next {
                Some(HubEvent::Event(event)) => inner.handle_push(event).await,
                Some(HubEvent::Resync) => inner.resync().await,
                Some(HubEvent::Disconnected) => {
                    if !reconnect(&inner).await {
                        route.close().await;
                        break 'outer;
                    }
                }
                None => {
                    route.close().await;
                    continue 'outer;
                }
            }
        }
    }
    log::debug!("Push listener for {} stopped", inner.conversation);
}

/// Retry the shared connection until it is back. False when the session
/// ends first.
async fn reconnect(inner: &SessionInner) -> bool {
    let hub = inner.platform.push();
    loop {
        if !inner.backoff().await {
            return false;
        }
        match hub.reconnect().await {
            Ok(()) => return true,
            Err(TransportError::Unauthorized) => {
                inner.transport_failed(TransportError::Unauthorized);
                return false;
            }
            Err(e) => log::debug!("Push reconnect failed: {}", e),
        }
    }
}

/// Forward local typing signals to the server. Best effort.
async fn forward_typing(
    inner: Arc<SessionInner>,
    mut signals: tokio::sync::mpsc::UnboundedReceiver<TypingSignal>,
) {
    loop {
        let signal = tokio::select! {
            _ = inner.cancel.cancelled() => break,
            signal = signals.recv() => match signal {
                Some(signal) => signal,
                None => break,
            },
        };
        let command = Command::SetTyping {
            conversation_id: inner.conversation.clone(),
            typing: signal.is_typing(),
        };
        let credential = match inner.platform.credentials().credential().await {
            Ok(credential) => credential,
            Err(e) => {
                log::debug!("Typing signal skipped: {}", e);
                continue;
            }
        };
        if let Err(e) = inner.platform.commands().execute(&credential, command).await {
            log::debug!("Typing signal for {} failed: {}", inner.conversation, e);
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SyncConfig;
    use crate::testing::{profile, text, MockBackend, StaticCredentials};
    use crate::transport::{CommandTransport, Credential};
    use agora_protocol::{PendingAction, SyncState};
    use async_trait::async_trait;
    use std::future::Future;
    use std::sync::atomic::Ordering;
    use std::time::Duration;
    use tokio::sync::Notify;

    fn quiet_config() -> SyncConfig {
        SyncConfig {
            poll_interval_ms: 0,
            reconnect_delay_ms: 20,
            ..Default::default()
        }
    }

    fn platform_for(backend: &Arc<MockBackend>, user: &str, config: SyncConfig) -> Platform {
        Platform::new(
            config,
            StaticCredentials::new(user),
            backend.clone(),
            backend.clone(),
            backend.clone(),
        )
        .unwrap()
    }

    async fn open(backend: &Arc<MockBackend>, user: &str) -> ConversationSession {
        platform_for(backend, user, quiet_config())
            .open_session(profile(user), ConversationId::group("general"))
            .await
            .unwrap()
    }

    async fn eventually<F, Fut>(mut check: F)
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = bool>,
    {
        for _ in 0..200 {
            if check().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    fn seeded(backend: &Arc<MockBackend>, id: &str, author: &str) -> MessageId {
        let message = Message::new(
            MessageId::from(id),
            ConversationId::group("general"),
            profile(author),
            text("seeded"),
            Utc::now() - chrono::Duration::minutes(1),
        );
        backend.seed(message);
        MessageId::from(id)
    }

    #[tokio::test]
    async fn test_open_loads_history() {
        let backend = MockBackend::new();
        seeded(&backend, "m1", "bob");
        let session = open(&backend, "alice").await;

        let messages = session.messages().await;
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].id, MessageId::from("m1"));
        assert_eq!(backend.connects(), 1);
        session.close().await;
    }

    #[tokio::test]
    async fn test_open_offline_fails() {
        let backend = MockBackend::new();
        backend.set_offline(true);
        let platform = platform_for(&backend, "alice", quiet_config());
        let err = platform
            .open_session(profile("alice"), ConversationId::group("general"))
            .await
            .err();
        assert!(matches!(err, Some(SessionError::NetworkUnavailable(_))));
    }

    #[tokio::test]
    async fn test_send_confirms_without_duplicate() {
        let backend = MockBackend::new();
        let session = open(&backend, "alice").await;
        let mut changes = session.subscribe_changes();

        let id = session.send(text("hello"), None).await.unwrap();
        assert_eq!(id, MessageId::from("srv-1"));

        // The optimistic insert is published first
        let first = changes.recv().await.unwrap();
        assert!(matches!(&first[0], StoreChange::Inserted(local) if local.is_local()));

        // Give the push echo time to arrive; it must merge, not duplicate
        tokio::time::sleep(Duration::from_millis(20)).await;
        let messages = session.messages().await;
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].id, id);
        assert_eq!(messages[0].sync, SyncState::Synced);
        session.close().await;
    }

    #[tokio::test]
    async fn test_send_without_echoed_key_matches_by_content() {
        let backend = MockBackend::new();
        backend.echo_client_key.store(false, Ordering::SeqCst);
        let session = open(&backend, "alice").await;

        let id = session.send(text("no key"), None).await.unwrap();
        assert_eq!(id, MessageId::from("srv-1"));

        tokio::time::sleep(Duration::from_millis(20)).await;
        let messages = session.messages().await;
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].id, id);
        assert_eq!(messages[0].sync, SyncState::Synced);
        session.close().await;
    }

    #[tokio::test]
    async fn test_offline_send_fails_then_retry_converges() {
        let backend = MockBackend::new();
        let session = open(&backend, "alice").await;

        backend.set_offline(true);
        let err = session.send(text("later"), None).await.unwrap_err();
        assert!(matches!(err, SessionError::NetworkUnavailable(_)));

        let failed = session.messages().await.remove(0);
        assert!(failed.id.is_local());
        assert_eq!(failed.sync, SyncState::Failed(PendingAction::Send));

        backend.set_offline(false);
        let id = session.retry(&failed.id).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let messages = session.messages().await;
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].id, id);
        assert_eq!(messages[0].sync, SyncState::Synced);
        session.close().await;
    }

    #[tokio::test]
    async fn test_push_from_other_user_appears() {
        let backend = MockBackend::new();
        let alice = open(&backend, "alice").await;
        let bob = open(&backend, "bob").await;

        let id = bob.send(text("hi alice"), None).await.unwrap();
        eventually(|| async { alice.message(&id).await.is_some() }).await;

        alice.react(&id, "👍").await.unwrap();
        eventually(|| async {
            bob.reactions(&id)
                .await
                .is_some_and(|r| r.len() == 1 && r[0].count == 1 && !r[0].viewer_reacted)
        })
        .await;
        assert_eq!(bob.reaction_total(&id).await, Some(1));

        alice.close().await;
        bob.close().await;
    }

    #[tokio::test]
    async fn test_delete_for_everyone_blocks_later_actions() {
        let backend = MockBackend::new();
        let session = open(&backend, "alice").await;
        let id = session.send(text("oops"), None).await.unwrap();
        session.react(&id, "😀").await.unwrap();

        session.delete_for_everyone(&id).await.unwrap();
        let msg = session.message(&id).await.unwrap();
        assert!(msg.is_tombstone());
        assert!(msg.reactions.is_empty());

        let react = session.react(&id, "👍").await.unwrap_err();
        assert!(matches!(
            react,
            SessionError::Reconcile(ReconcileError::Store(agora_protocol::StoreError::Conflict(_)))
        ));
        assert!(session.pin(&id).await.is_err());
        session.close().await;
    }

    #[tokio::test]
    async fn test_two_viewers_converge_on_reactions_and_delete() {
        let backend = MockBackend::new();
        let alice = open(&backend, "alice").await;
        let bob = open(&backend, "bob").await;

        let id = alice.send(text("vote"), None).await.unwrap();
        eventually(|| async { bob.message(&id).await.is_some() }).await;

        alice.react(&id, "👍").await.unwrap();
        bob.react(&id, "👍").await.unwrap();
        for session in [&alice, &bob] {
            eventually(|| async {
                session.reactions(&id).await.is_some_and(|r| {
                    r.len() == 1 && r[0].emoji == "👍" && r[0].count == 2 && r[0].viewer_reacted
                })
            })
            .await;
        }

        alice.delete_for_everyone(&id).await.unwrap();
        eventually(|| async { bob.message(&id).await.is_some_and(|m| m.is_tombstone()) }).await;
        let seen_by_bob = bob.message(&id).await.unwrap();
        assert_eq!(seen_by_bob.body, MessageBody::deleted_placeholder());
        assert!(bob.react(&id, "👍").await.is_err());
        assert!(bob.pin(&id).await.is_err());

        alice.close().await;
        bob.close().await;
    }

    #[tokio::test]
    async fn test_rejected_delete_is_rolled_back() {
        let backend = MockBackend::new();
        let id = seeded(&backend, "m1", "bob");
        let session = open(&backend, "alice").await;

        let err = session.delete_for_everyone(&id).await.unwrap_err();
        assert!(matches!(err, SessionError::Forbidden(_)));

        let msg = session.message(&id).await.unwrap();
        assert!(!msg.is_tombstone());
        assert_eq!(msg.sync, SyncState::Failed(PendingAction::DeleteForEveryone));
        session.close().await;
    }

    #[tokio::test]
    async fn test_pin_and_fetch_pinned() {
        let backend = MockBackend::new();
        let id = seeded(&backend, "m1", "bob");
        let session = open(&backend, "alice").await;

        session.pin(&id).await.unwrap();
        assert_eq!(session.pinned().await.len(), 1);
        assert!(backend.stored(session.conversation_id(), &id).unwrap().pinned);
        assert_eq!(session.fetch_pinned().await.unwrap().len(), 1);

        // Pin toggles
        session.pin(&id).await.unwrap();
        assert!(session.pinned().await.is_empty());
        assert!(session.fetch_pinned().await.unwrap().is_empty());
        session.close().await;
    }

    #[tokio::test]
    async fn test_delete_for_self_hides_only_locally() {
        let backend = MockBackend::new();
        let id = seeded(&backend, "m1", "bob");
        let session = open(&backend, "alice").await;

        session.delete_for_self(&id).await.unwrap();
        assert!(session.messages().await.is_empty());
        assert!(session.message(&id).await.is_some());
        session.close().await;
    }

    #[tokio::test]
    async fn test_mark_read_updates_sender_status() {
        let backend = MockBackend::new();
        let alice = open(&backend, "alice").await;
        let bob = open(&backend, "bob").await;

        let id = alice.send(text("read me"), None).await.unwrap();
        assert_eq!(alice.status(&id).await, Some(ReceiptStatus::Sent));

        eventually(|| async { bob.message(&id).await.is_some() }).await;
        bob.mark_read().await.unwrap();
        eventually(|| async { alice.status(&id).await == Some(ReceiptStatus::Read) }).await;
        assert_eq!(alice.readers(&id).await, Some(vec![UserId::from("bob")]));
        assert_eq!(alice.readers(&MessageId::from("missing")).await, None);

        alice.close().await;
        bob.close().await;
    }

    #[tokio::test]
    async fn test_remote_typing_is_tracked() {
        let backend = MockBackend::new();
        let alice = open(&backend, "alice").await;
        let bob = open(&backend, "bob").await;

        bob.keystroke();
        eventually(|| async {
            alice
                .typing_users()
                .iter()
                .any(|u| u.id == UserId::from("bob"))
        })
        .await;
        // Own typing echoes are not shown
        assert!(bob.typing_users().is_empty());

        alice.close().await;
        bob.close().await;
    }

    #[tokio::test]
    async fn test_unauthorized_closes_session() {
        let backend = MockBackend::new();
        let credentials = StaticCredentials::new("alice");
        let platform = Platform::new(
            quiet_config(),
            credentials.clone(),
            backend.clone(),
            backend.clone(),
            backend.clone(),
        )
        .unwrap();
        let session = platform
            .open_session(profile("alice"), ConversationId::group("general"))
            .await
            .unwrap();

        credentials.revoked.store(true, Ordering::SeqCst);
        let err = session.send(text("nope"), None).await.unwrap_err();
        assert_eq!(err, SessionError::Unauthorized);
        assert!(session.is_closed());
        assert_eq!(session.refresh().await, Err(SessionError::Closed));
        session.close().await;
    }

    struct GatedCommands {
        backend: Arc<MockBackend>,
        gate: Arc<Notify>,
    }

    #[async_trait]
    impl CommandTransport for GatedCommands {
        async fn execute(
            &self,
            credential: &Credential,
            command: Command,
        ) -> Result<CommandResponse, TransportError> {
            self.gate.notified().await;
            self.backend.execute(credential, command).await
        }
    }

    #[tokio::test]
    async fn test_close_discards_late_results() {
        let backend = MockBackend::new();
        let gate = Arc::new(Notify::new());
        let platform = Platform::new(
            quiet_config(),
            StaticCredentials::new("alice"),
            backend.clone(),
            Arc::new(GatedCommands {
                backend: backend.clone(),
                gate: gate.clone(),
            }),
            backend.clone(),
        )
        .unwrap();
        let session = Arc::new(
            platform
                .open_session(profile("alice"), ConversationId::group("general"))
                .await
                .unwrap(),
        );

        let sender = session.clone();
        let pending = tokio::spawn(async move { sender.send(text("late"), None).await });
        tokio::time::sleep(Duration::from_millis(10)).await;

        session.close().await;
        gate.notify_one();
        assert_eq!(pending.await.unwrap(), Err(SessionError::Closed));
        assert!(session.messages().await[0].id.is_local());
    }

    #[tokio::test]
    async fn test_last_close_tears_down_push() {
        let backend = MockBackend::new();
        let platform = platform_for(&backend, "alice", quiet_config());
        let general = platform
            .open_session(profile("alice"), ConversationId::group("general"))
            .await
            .unwrap();
        let random = platform
            .open_session(profile("alice"), ConversationId::group("random"))
            .await
            .unwrap();
        assert_eq!(backend.connects(), 1);

        general.close().await;
        assert_eq!(backend.open_links(), 1);
        random.close().await;
        assert_eq!(backend.open_links(), 0);
        assert_eq!(backend.disconnects(), 1);
    }

    #[tokio::test]
    async fn test_polling_picks_up_unpushed_messages() {
        let backend = MockBackend::new();
        let config = SyncConfig {
            poll_interval_ms: 20,
            ..quiet_config()
        };
        let session = platform_for(&backend, "alice", config)
            .open_session(profile("alice"), ConversationId::group("general"))
            .await
            .unwrap();

        let id = seeded(&backend, "quiet", "bob");
        eventually(|| async { session.message(&id).await.is_some() }).await;
        session.close().await;
    }

    #[tokio::test]
    async fn test_push_drop_reconnects_and_resyncs() {
        let backend = MockBackend::new();
        let session = open(&backend, "alice").await;

        // Stored while the connection is down, never pushed
        let id = seeded(&backend, "missed", "bob");
        backend.drop_connections();
        eventually(|| async { backend.connects() == 2 }).await;
        eventually(|| async { session.message(&id).await.is_some() }).await;
        session.close().await;
    }
}
