#![cfg_attr(not(test), forbid(unsafe_code))]

//! Client side of livetail.
//!
//! [`ChatClient`] runs chat generations that outlive the view that started
//! them: a conversation keeps streaming into the [`MessageStore`] after the
//! caller detaches, a returning caller reattaches to the same session, and a
//! dropped connection falls back to polling the durable message state.
//! [`TailClient`] follows an admin tail stream across reconnects.

pub mod credentials;
pub mod error;
pub mod registry;
pub mod session;
pub mod sse;
pub mod store;
pub mod tail;
pub mod transport;

#[cfg(test)]
mod testing;

pub use credentials::{CredentialProvider, FileCredentials, StaticCredentials};
pub use error::{ClientError, TransportError};
pub use session::{ChatClient, ChatSession, ClientPhase, ClientSettings, Submission};
pub use store::{ConversationView, LocalMessage, MessageStore};
pub use tail::TailClient;
pub use transport::{ChatTransport, HttpTransport, TailItem, TailTransport};
