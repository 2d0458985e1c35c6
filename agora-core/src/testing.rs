//! In-memory collaborators for tests.
//!
//! `MockBackend` plays the server: it stores messages per conversation,
//! executes commands, serves history, and fans events out to push
//! connections that joined the conversation's room. The bearer token of a
//! `StaticCredentials` is taken as the acting user's id.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

use agora_protocol::{
    Command, CommandResponse, ConversationId, Message, MessageBody, MessageId, MessagePatch,
    PushEvent, ReplyRef, SenderProfile, UserId,
};

use crate::transport::{
    Credential, CredentialProvider, CommandTransport, HistoryTransport, PushConnection,
    PushConnector, PushControl, TransportError,
};

// ---------------------------------------------------------------------------
// Credentials
// ---------------------------------------------------------------------------

pub struct StaticCredentials {
    user: UserId,
    pub revoked: AtomicBool,
}

impl StaticCredentials {
    pub fn new(user: &str) -> Arc<Self> {
        Arc::new(StaticCredentials {
            user: UserId::from(user),
            revoked: AtomicBool::new(false),
        })
    }
}

#[async_trait]
impl CredentialProvider for StaticCredentials {
    async fn credential(&self) -> Result<Credential, TransportError> {
        if self.revoked.load(Ordering::SeqCst) {
            return Err(TransportError::Unauthorized);
        }
        Ok(Credential::bearer(self.user.as_str()))
    }
}

pub fn profile(user: &str) -> SenderProfile {
    SenderProfile {
        id: UserId::from(user),
        name: user.to_uppercase(),
        avatar: None,
    }
}

// ---------------------------------------------------------------------------
// Backend
// ---------------------------------------------------------------------------

struct MockLink {
    sender: Option<mpsc::Sender<PushEvent>>,
    rooms: BTreeSet<ConversationId>,
    open: bool,
}

#[derive(Default)]
struct BackendState {
    messages: HashMap<ConversationId, Vec<Message>>,
    next_id: u64,
    commands: Vec<Command>,
    links: Vec<MockLink>,
    connects: usize,
    disconnects: usize,
}

impl BackendState {
    fn broadcast(&mut self, event: PushEvent) {
        let conversation = event.conversation_id().clone();
        for link in self.links.iter().filter(|l| l.open && l.rooms.contains(&conversation)) {
            if let Some(sender) = &link.sender {
                let _ = sender.try_send(event.clone());
            }
        }
    }

    fn find_mut(
        &mut self,
        conversation: &ConversationId,
        id: &MessageId,
    ) -> Result<&mut Message, TransportError> {
        self.messages
            .get_mut(conversation)
            .and_then(|list| list.iter_mut().find(|m| m.id == *id))
            .ok_or_else(|| TransportError::NotFound(id.to_string()))
    }
}

pub struct MockBackend {
    state: Arc<Mutex<BackendState>>,
    /// Commands and fetches fail with `Unavailable`.
    pub offline: AtomicBool,
    /// Echo the client key on created messages.
    pub echo_client_key: AtomicBool,
}

impl MockBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(MockBackend {
            state: Arc::new(Mutex::new(BackendState::default())),
            offline: AtomicBool::new(false),
            echo_client_key: AtomicBool::new(true),
        })
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn seed(&self, message: Message) {
        let mut state = self.state.lock().unwrap();
        state
            .messages
            .entry(message.conversation_id.clone())
            .or_default()
            .push(message);
    }

    /// Deliver an event to every connection in the conversation's room.
    pub fn push(&self, event: PushEvent) {
        self.state.lock().unwrap().broadcast(event);
    }

    /// Simulate the server dropping every push connection.
    pub fn drop_connections(&self) {
        let mut state = self.state.lock().unwrap();
        for link in state.links.iter_mut() {
            link.open = false;
            link.sender = None;
        }
    }

    pub fn stored(&self, conversation: &ConversationId, id: &MessageId) -> Option<Message> {
        let state = self.state.lock().unwrap();
        state
            .messages
            .get(conversation)
            .and_then(|list| list.iter().find(|m| m.id == *id).cloned())
    }

    pub fn commands(&self) -> Vec<Command> {
        self.state.lock().unwrap().commands.clone()
    }

    pub fn connects(&self) -> usize {
        self.state.lock().unwrap().connects
    }

    pub fn disconnects(&self) -> usize {
        self.state.lock().unwrap().disconnects
    }

    pub fn open_links(&self) -> usize {
        self.state.lock().unwrap().links.iter().filter(|l| l.open).count()
    }

    fn check_online(&self) -> Result<(), TransportError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(TransportError::Unavailable("offline".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl HistoryTransport for MockBackend {
    async fn fetch_history(
        &self,
        _credential: &Credential,
        conversation: &ConversationId,
        limit: usize,
    ) -> Result<Vec<Message>, TransportError> {
        self.check_online()?;
        let state = self.state.lock().unwrap();
        let mut page = state.messages.get(conversation).cloned().unwrap_or_default();
        page.sort_by(|a, b| b.order_key().cmp(&a.order_key()));
        page.truncate(limit);
        Ok(page)
    }

    async fn fetch_pinned(
        &self,
        _credential: &Credential,
        conversation: &ConversationId,
        limit: usize,
    ) -> Result<Vec<Message>, TransportError> {
        self.check_online()?;
        let state = self.state.lock().unwrap();
        let mut page: Vec<Message> = state
            .messages
            .get(conversation)
            .map(|list| {
                list.iter()
                    .filter(|m| m.pinned && !m.deleted_for_everyone)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        page.sort_by(|a, b| b.order_key().cmp(&a.order_key()));
        page.truncate(limit);
        Ok(page)
    }
}

#[async_trait]
impl CommandTransport for MockBackend {
    async fn execute(
        &self,
        credential: &Credential,
        command: Command,
    ) -> Result<CommandResponse, TransportError> {
        self.check_online()?;
        let user = UserId::from(credential.token());
        let echo_key = self.echo_client_key.load(Ordering::SeqCst);
        let mut state = self.state.lock().unwrap();
        state.commands.push(command.clone());

        match command {
            Command::Send {
                conversation_id,
                client_key,
                body,
                reply_to,
            } => {
                state.next_id += 1;
                let id = MessageId::new(format!("srv-{}", state.next_id));
                let reply = match &reply_to {
                    Some(target) => Some(ReplyRef::to_message(state.find_mut(&conversation_id, target)?)),
                    None => None,
                };
                let mut message = Message::new(
                    id,
                    conversation_id.clone(),
                    profile(user.as_str()),
                    body,
                    Utc::now(),
                );
                message.reply_to = reply;
                if echo_key {
                    message.client_key = Some(client_key);
                }
                state
                    .messages
                    .entry(conversation_id)
                    .or_default()
                    .push(message.clone());
                state.broadcast(PushEvent::MessageCreated {
                    message: message.clone(),
                });
                Ok(CommandResponse::Created { message })
            }
            Command::React {
                conversation_id,
                message_id,
                emoji,
                present,
            } => {
                let msg = state.find_mut(&conversation_id, &message_id)?;
                if msg.deleted_for_everyone {
                    return Err(TransportError::Conflict(message_id.to_string()));
                }
                msg.set_reaction(&user, &emoji, present);
                let patch = MessagePatch::reactions(msg.reactions.clone());
                state.broadcast(PushEvent::MessagePatched {
                    conversation_id,
                    message_id: message_id.clone(),
                    patch: patch.clone(),
                });
                Ok(CommandResponse::Patched { message_id, patch })
            }
            Command::Pin {
                conversation_id,
                message_id,
                pinned,
            } => {
                let msg = state.find_mut(&conversation_id, &message_id)?;
                if msg.deleted_for_everyone {
                    return Err(TransportError::Conflict(message_id.to_string()));
                }
                msg.pinned = pinned;
                let patch = MessagePatch::pinned(pinned);
                state.broadcast(PushEvent::MessagePatched {
                    conversation_id,
                    message_id: message_id.clone(),
                    patch: patch.clone(),
                });
                Ok(CommandResponse::Patched { message_id, patch })
            }
            Command::Edit {
                conversation_id,
                message_id,
                body,
            } => {
                let msg = state.find_mut(&conversation_id, &message_id)?;
                if msg.sender.id != user {
                    return Err(TransportError::Forbidden("not the author".into()));
                }
                let patch = MessagePatch::edit(body, Utc::now());
                patch.apply_to(msg, agora_protocol::limits::MAX_EDIT_HISTORY);
                state.broadcast(PushEvent::MessagePatched {
                    conversation_id,
                    message_id: message_id.clone(),
                    patch: patch.clone(),
                });
                Ok(CommandResponse::Patched { message_id, patch })
            }
            Command::DeleteForSelf {
                conversation_id,
                message_id,
            } => {
                let msg = state.find_mut(&conversation_id, &message_id)?;
                msg.hidden_for.insert(user);
                Ok(CommandResponse::Ack)
            }
            Command::DeleteForEveryone {
                conversation_id,
                message_id,
            } => {
                let msg = state.find_mut(&conversation_id, &message_id)?;
                if msg.sender.id != user {
                    return Err(TransportError::Forbidden("not the author".into()));
                }
                msg.tombstone();
                state.broadcast(PushEvent::MessageDeleted {
                    conversation_id,
                    message_id: message_id.clone(),
                });
                Ok(CommandResponse::Deleted { message_id })
            }
            Command::MarkRead {
                conversation_id,
                up_to,
            } => {
                if let Some(list) = state.messages.get_mut(&conversation_id) {
                    for msg in list.iter_mut() {
                        if msg.sender.id != user && up_to.map_or(true, |limit| msg.created_at <= limit) {
                            msg.add_receipt(&user, true);
                        }
                    }
                }
                state.broadcast(PushEvent::MessagesRead {
                    conversation_id,
                    reader: user,
                    up_to,
                });
                Ok(CommandResponse::Ack)
            }
            Command::SetTyping {
                conversation_id,
                typing,
            } => {
                state.broadcast(PushEvent::TypingChanged {
                    conversation_id,
                    user_name: user.as_str().to_uppercase(),
                    user,
                    typing,
                });
                Ok(CommandResponse::Ack)
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Push
// ---------------------------------------------------------------------------

struct MockControl {
    state: Arc<Mutex<BackendState>>,
    link: usize,
}

impl MockControl {
    fn with_link(&self, f: impl FnOnce(&mut MockLink)) {
        let mut state = self.state.lock().unwrap();
        if let Some(link) = state.links.get_mut(self.link) {
            f(link);
        }
    }
}

#[async_trait]
impl PushControl for MockControl {
    async fn join(&self, conversation: &ConversationId) -> Result<(), TransportError> {
        self.with_link(|link| {
            link.rooms.insert(conversation.clone());
        });
        Ok(())
    }

    async fn leave(&self, conversation: &ConversationId) -> Result<(), TransportError> {
        self.with_link(|link| {
            link.rooms.remove(conversation);
        });
        Ok(())
    }

    async fn disconnect(&self) {
        self.with_link(|link| {
            link.open = false;
            link.sender = None;
        });
        self.state.lock().unwrap().disconnects += 1;
    }
}

#[async_trait]
impl PushConnector for MockBackend {
    async fn connect(&self, _credential: &Credential) -> Result<PushConnection, TransportError> {
        self.check_online()?;
        let (sender, events) = mpsc::channel(64);
        let mut state = self.state.lock().unwrap();
        state.connects += 1;
        state.links.push(MockLink {
            sender: Some(sender),
            rooms: BTreeSet::new(),
            open: true,
        });
        let link = state.links.len() - 1;
        Ok(PushConnection {
            events,
            control: Arc::new(MockControl {
                state: self.state.clone(),
                link,
            }),
        })
    }
}

pub fn text(body: &str) -> MessageBody {
    MessageBody::text(body)
}
