/// Platform context
///
/// Everything that is shared by all sessions of one signed-in client: the
/// configuration, the collaborator transports, and the push hub. Sessions are
/// opened from here and hold a clone; `shutdown` cancels every session at
/// once.

use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use agora_protocol::{ConversationId, SenderProfile};

use crate::config::{ConfigError, SyncConfig};
use crate::push::PushHub;
use crate::session::{ConversationSession, SessionError};
use crate::transport::{CommandTransport, CredentialProvider, HistoryTransport, PushConnector};

struct PlatformInner {
    config: SyncConfig,
    credentials: Arc<dyn CredentialProvider>,
    history: Arc<dyn HistoryTransport>,
    commands: Arc<dyn CommandTransport>,
    push: PushHub,
    shutdown: CancellationToken,
}

#[derive(Clone)]
pub struct Platform {
    inner: Arc<PlatformInner>,
}

impl Platform {
    pub fn new(
        config: SyncConfig,
        credentials: Arc<dyn CredentialProvider>,
        history: Arc<dyn HistoryTransport>,
        commands: Arc<dyn CommandTransport>,
        connector: Arc<dyn PushConnector>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let push = PushHub::new(connector, credentials.clone(), config.push_channel_capacity);
        Ok(Self {
            inner: Arc::new(PlatformInner {
                config,
                credentials,
                history,
                commands,
                push,
                shutdown: CancellationToken::new(),
            }),
        })
    }

    /// Open a conversation as `profile`. Fails when the initial history
    /// fetch fails or the credential is rejected.
    pub async fn open_session(
        &self,
        profile: SenderProfile,
        conversation: ConversationId,
    ) -> Result<ConversationSession, SessionError> {
        if self.inner.shutdown.is_cancelled() {
            return Err(SessionError::Closed);
        }
        ConversationSession::open(self.clone(), profile, conversation).await
    }

    /// Cancel every session opened from this platform.
    pub fn shutdown(&self) {
        log::info!("Platform shutting down");
        self.inner.shutdown.cancel();
    }

    pub fn config(&self) -> &SyncConfig {
        &self.inner.config
    }

    pub fn push_hub(&self) -> &PushHub {
        &self.inner.push
    }

    pub(crate) fn push(&self) -> &PushHub {
        &self.inner.push
    }

    pub(crate) fn credentials(&self) -> &Arc<dyn CredentialProvider> {
        &self.inner.credentials
    }

    pub(crate) fn history(&self) -> &Arc<dyn HistoryTransport> {
        &self.inner.history
    }

    pub(crate) fn commands(&self) -> &Arc<dyn CommandTransport> {
        &self.inner.commands
    }

    pub(crate) fn shutdown_token(&self) -> &CancellationToken {
        &self.inner.shutdown
    }
}
