// Crate-level lint configuration: stylistic lints only.
#![allow(
    clippy::empty_line_after_doc_comments,
    clippy::doc_lazy_continuation,
    clippy::too_many_arguments,
    clippy::type_complexity
)]

//! # Agora Core
//!
//! Runtime half of the chat sync core. `agora-protocol` decides what the
//! message state is; this crate drives it from the outside world:
//!
//! | Module | Purpose |
//! |--------|---------|
//! | `platform` | Shared context: config, transports, push hub |
//! | `session` | One open conversation: commands, refresh, reads |
//! | `push` | Single shared push connection, per-conversation routes |
//! | `typing` | Local typing signals and remote typing presence |
//! | `poller` | Polling fallback |
//! | `transport` | Collaborator traits supplied by the host app |
//! | `config` | `SyncConfig` |
//! | `logging` | Logger setup |

pub mod config;
pub mod logging;
pub mod platform;
pub mod poller;
pub mod push;
pub mod session;
pub mod transport;
pub mod typing;

#[cfg(test)]
mod testing;

// ── Re-exports ──────────────────────────────────────────────────────────────

pub use agora_protocol as protocol;

pub use config::{ConfigError, SyncConfig};
pub use logging::init_logging;
pub use platform::Platform;
pub use push::{HubEvent, PushHub, Subscription};
pub use session::{ConversationSession, SessionError};
pub use transport::{
    CommandTransport, Credential, CredentialProvider, HistoryTransport, PushConnection,
    PushConnector, PushControl, TransportError,
};
pub use typing::{TypingSignal, TypingUser};

// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Get library version
pub fn get_version() -> &'static str {
    VERSION
}
