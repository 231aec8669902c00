// src/room.rs
// Per-room state: symmetric keystore and the ingested message window

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::codec::Message;
use crate::crypto::SymmetricKey;

/// Engine-lifetime-unique message identifier: `roomId + "." + index`.
pub fn message_hash(room_id: &str, index: u64) -> String {
    format!("{}.{}", room_id, index)
}

/// A decrypted log entry as surfaced to the caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DecryptedMessage {
    pub msg: Message,
    pub room_id: String,
    pub index: u64,
    pub sender_address: String,
    pub hash: String,
}

/// One conversation: the ordered key set known to this participant plus
/// the decrypted view of the server log.
#[derive(Debug, Default, Clone)]
pub struct Room {
    // Insertion-ordered and deduplicated. The first key encrypts new
    // outgoing messages; all of them are tried on decrypt.
    keys: Vec<SymmetricKey>,
    messages: BTreeMap<u64, DecryptedMessage>,
    /// One past the highest known log index.
    pub message_count: u64,
    /// Highest ingested log index.
    pub last_index: Option<u64>,
}

impl Room {
    pub fn new() -> Self {
        Self::default()
    }

    /// No-op if the key is already present; re-announced keys never
    /// reorder the set.
    pub fn add_key(&mut self, key: SymmetricKey) -> bool {
        if self.keys.contains(&key) {
            return false;
        }
        self.keys.push(key);
        true
    }

    pub fn all_keys(&self) -> &[SymmetricKey] {
        &self.keys
    }

    /// First inserted key; encrypts outgoing messages.
    pub fn primary_key(&self) -> Option<&SymmetricKey> {
        self.keys.first()
    }

    pub fn has_keys(&self) -> bool {
        !self.keys.is_empty()
    }

    /// Advance the index bookkeeping for an ingested entry. Never moves
    /// backwards.
    pub fn note_index(&mut self, index: u64) {
        self.last_index = Some(self.last_index.map_or(index, |last| last.max(index)));
        self.message_count = self.message_count.max(index + 1);
    }

    /// The log index the next outgoing message is posted at.
    pub fn next_index(&self) -> u64 {
        self.message_count
    }

    pub fn record_message(&mut self, message: DecryptedMessage) {
        self.note_index(message.index);
        self.messages.insert(message.index, message);
    }

    /// Drop the decrypted window before a bulk reload repopulates it.
    /// Keys survive; they are announced once.
    pub fn clear_messages(&mut self) {
        self.messages.clear();
    }

    pub fn message(&self, index: u64) -> Option<&DecryptedMessage> {
        self.messages.get(&index)
    }

    /// Decrypted messages ascending by log index (sparse-tolerant).
    pub fn messages_in_order(&self) -> Vec<DecryptedMessage> {
        self.messages.values().cloned().collect()
    }
}
