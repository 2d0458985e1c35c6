/// Push hub: one physical push connection shared by every open session.
///
/// Sessions subscribe per conversation. The hub keeps a reference-counted
/// route for each conversation, joins the room when the first subscriber
/// arrives and leaves it when the last one is released. The connection is
/// opened on the first subscription and torn down when no routes remain.
///
/// A pump task reads the connection's event stream and fans events out to
/// the matching route. Events for conversations nobody subscribed to are
/// dropped, so a broadcast-scoped server still only reaches the sessions
/// that asked for it.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use agora_protocol::{ConversationId, PushEvent};

use crate::transport::{
    CredentialProvider, PushConnection, PushConnector, PushControl, TransportError,
};

// ─── Events delivered to subscribers ─────────────────────────────────────────

#[derive(Clone, Debug, PartialEq)]
pub enum HubEvent {
    Event(PushEvent),
    /// Events may have been missed (reconnect or lag); refetch.
    Resync,
    /// The physical connection dropped. Call `PushHub::reconnect`.
    Disconnected,
}

// ─── Internal state ──────────────────────────────────────────────────────────

struct Route {
    sender: broadcast::Sender<HubEvent>,
    refs: usize,
}

struct Link {
    control: Arc<dyn PushControl>,
    cancel: CancellationToken,
    generation: u64,
}

#[derive(Default)]
struct HubState {
    link: Option<Link>,
    routes: HashMap<ConversationId, Route>,
    generation: u64,
}

struct HubInner {
    connector: Arc<dyn PushConnector>,
    credentials: Arc<dyn CredentialProvider>,
    capacity: usize,
    /// Only ever held for in-memory bookkeeping, never across I/O.
    state: Mutex<HubState>,
    /// Serializes connection attempts.
    connecting: Mutex<()>,
}

/// Result of making sure a connection exists.
enum Connected {
    /// A new connection was opened and every registered route joined.
    Fresh,
    Existing(Arc<dyn PushControl>),
}

// ─── Hub ─────────────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct PushHub {
    inner: Arc<HubInner>,
}

impl PushHub {
    pub fn new(
        connector: Arc<dyn PushConnector>,
        credentials: Arc<dyn CredentialProvider>,
        capacity: usize,
    ) -> Self {
        Self {
            inner: Arc::new(HubInner {
                connector,
                credentials,
                capacity: capacity.max(1),
                state: Mutex::new(HubState::default()),
                connecting: Mutex::new(()),
            }),
        }
    }

    /// Subscribe to one conversation, connecting first if needed.
    pub async fn subscribe(
        &self,
        conversation: &ConversationId,
    ) -> Result<Subscription, TransportError> {
        let (receiver, refs) = {
            let mut state = self.inner.state.lock().await;
            let capacity = self.inner.capacity;
            let route = state
                .routes
                .entry(conversation.clone())
                .or_insert_with(|| Route {
                    sender: broadcast::channel(capacity).0,
                    refs: 0,
                });
            route.refs += 1;
            (route.sender.subscribe(), route.refs)
        };

        let joined = match self.ensure_connected(Some(conversation)).await {
            Ok(Connected::Fresh) => Ok(()),
            Ok(Connected::Existing(control)) if refs == 1 => control.join(conversation).await,
            Ok(Connected::Existing(_)) => Ok(()),
            Err(e) => Err(e),
        };
        if let Err(e) = joined {
            log::warn!("⚠️  Failed to subscribe to {}: {}", conversation, e);
            self.release(conversation).await;
            return Err(e);
        }

        log::debug!("Subscribed to {} ({} subscriber(s))", conversation, refs);
        Ok(Subscription {
            hub: self.clone(),
            conversation: conversation.clone(),
            receiver,
            released: false,
        })
    }

    /// Re-establish a dropped connection. Every subscribed room is rejoined
    /// and told to resync. No-op while connected or with no routes.
    pub async fn reconnect(&self) -> Result<(), TransportError> {
        if self.inner.state.lock().await.routes.is_empty() {
            return Ok(());
        }
        self.ensure_connected(None).await.map(|_| ())
    }

    pub async fn is_connected(&self) -> bool {
        self.inner.state.lock().await.link.is_some()
    }

    /// Number of conversations with at least one subscriber.
    pub async fn route_count(&self) -> usize {
        self.inner.state.lock().await.routes.len()
    }

    async fn release(&self, conversation: &ConversationId) {
        let (control, closing) = {
            let mut state = self.inner.state.lock().await;
            let Some(route) = state.routes.get_mut(conversation) else {
                return;
            };
            route.refs = route.refs.saturating_sub(1);
            if route.refs > 0 {
                return;
            }
            state.routes.remove(conversation);
            if state.routes.is_empty() {
                (None, state.link.take())
            } else {
                (state.link.as_ref().map(|link| link.control.clone()), None)
            }
        };
        log::debug!("Released {}", conversation);

        if let Some(control) = control {
            if let Err(e) = control.leave(conversation).await {
                log::warn!("⚠️  Failed to leave {}: {}", conversation, e);
            }
        }
        if let Some(link) = closing {
            close_link(link).await;
        }
    }

    /// Open the shared connection unless one is up. A fresh connection joins
    /// every registered route; routes other than `subscriber` also get a
    /// `Resync` since they may have missed events while disconnected.
    async fn ensure_connected(
        &self,
        subscriber: Option<&ConversationId>,
    ) -> Result<Connected, TransportError> {
        let _connecting = self.inner.connecting.lock().await;
        if let Some(link) = &self.inner.state.lock().await.link {
            return Ok(Connected::Existing(link.control.clone()));
        }

        let credential = self.inner.credentials.credential().await?;
        let PushConnection { events, control } = self.inner.connector.connect(&credential).await?;

        let (generation, routes) = {
            let mut state = self.inner.state.lock().await;
            if state.routes.is_empty() {
                drop(state);
                control.disconnect().await;
                return Ok(Connected::Fresh);
            }
            state.generation += 1;
            let generation = state.generation;
            let cancel = CancellationToken::new();
            tokio::spawn(pump(
                Arc::downgrade(&self.inner),
                events,
                cancel.clone(),
                generation,
            ));
            state.link = Some(Link {
                control: control.clone(),
                cancel,
                generation,
            });
            let routes: Vec<(ConversationId, broadcast::Sender<HubEvent>)> = state
                .routes
                .iter()
                .map(|(conversation, route)| (conversation.clone(), route.sender.clone()))
                .collect();
            (generation, routes)
        };

        for (conversation, sender) in &routes {
            if let Err(e) = control.join(conversation).await {
                log::warn!("⚠️  Failed to join {}: {}", conversation, e);
            }
            if Some(conversation) != subscriber {
                let _ = sender.send(HubEvent::Resync);
            }
        }
        log::info!(
            "✓ Push connection established (generation {}, {} room(s))",
            generation,
            routes.len()
        );
        Ok(Connected::Fresh)
    }
}

async fn close_link(link: Link) {
    link.cancel.cancel();
    link.control.disconnect().await;
    log::info!("✓ Push connection closed (generation {})", link.generation);
}

/// Fan events from one connection out to the routes.
async fn pump(
    inner: Weak<HubInner>,
    mut events: mpsc::Receiver<PushEvent>,
    cancel: CancellationToken,
    generation: u64,
) {
    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => return,
            next = events.recv() => next,
        };
        let Some(inner) = inner.upgrade() else {
            return;
        };
        let mut state = inner.state.lock().await;

        match next {
            Some(event) => match state.routes.get(event.conversation_id()) {
                Some(route) => {
                    let _ = route.sender.send(HubEvent::Event(event));
                }
                None => log::debug!(
                    "Push event for unsubscribed {} dropped",
                    event.conversation_id()
                ),
            },
            None => {
                let current = state
                    .link
                    .as_ref()
                    .is_some_and(|link| link.generation == generation);
                if current {
                    state.link = None;
                    log::warn!("⚠️  Push connection lost (generation {})", generation);
                    for route in state.routes.values() {
                        let _ = route.sender.send(HubEvent::Disconnected);
                    }
                }
                return;
            }
        }
    }
}

// ─── Subscription ────────────────────────────────────────────────────────────

/// One session's view of a conversation route. Release it with `close`;
/// dropping it releases in the background.
pub struct Subscription {
    hub: PushHub,
    conversation: ConversationId,
    receiver: broadcast::Receiver<HubEvent>,
    released: bool,
}

impl Subscription {
    pub fn conversation_id(&self) -> &ConversationId {
        &self.conversation
    }

    /// Next event. A lagging receiver gets `Resync` instead of the lost events.
    pub async fn recv(&mut self) -> Option<HubEvent> {
        match self.receiver.recv().await {
            Ok(event) => Some(event),
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                log::warn!(
                    "⚠️  Route {} lagged by {} event(s), resyncing",
                    self.conversation,
                    missed
                );
                Some(HubEvent::Resync)
            }
            Err(broadcast::error::RecvError::Closed) => None,
        }
    }

    pub async fn close(mut self) {
        self.released = true;
        self.hub.release(&self.conversation).await;
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let hub = self.hub.clone();
            let conversation = self.conversation.clone();
            handle.spawn(async move { hub.release(&conversation).await });
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
