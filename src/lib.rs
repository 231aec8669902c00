// src/lib.rs
// Keyroom - end-to-end encrypted room messaging over a key server
// Library entry point

pub mod address;
pub mod codec;
pub mod crypto;
pub mod error;
pub mod identity;
pub mod messenger;
pub mod registry;
pub mod room;
pub mod server;
pub mod status;
pub mod storage;
pub mod stream;

#[cfg(test)]
pub(crate) mod testutil;

pub use codec::{ContentEnvelope, DecryptionHint, Message, MessageDraft};
pub use error::{Error, Result};
pub use identity::{Enrollment, LocalWallet, SignStyle, WalletSigner};
pub use messenger::{
    EncryptedMessage, IdentityStatus, Messenger, MessengerConfig, MessengerEvent,
    DEFAULT_FETCH_LIMIT, DEFAULT_RECONNECT_DELAY,
};
pub use registry::RegistryEntry;
pub use room::DecryptedMessage;
pub use server::LogEntry;
pub use status::MessageStatus;
pub use storage::{KeyValueStore, MemoryStore, SqliteStore};
