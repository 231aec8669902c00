// src/status.rs
// Per-wallet read/unread bookkeeping keyed by message hash

use std::collections::HashMap;
use std::sync::Arc;

use log::warn;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::storage::{message_statuses_key, KeyValueStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    Read,
    Unread,
}

/// Read/unread map persisted as one JSON document per wallet. Unknown
/// hashes read as unread. Single writer per wallet; concurrent engines
/// for the same wallet are not supported.
pub struct StatusStore {
    wallet_address: String,
    store: Arc<dyn KeyValueStore>,
}

impl StatusStore {
    pub fn new(wallet_address: &str, store: Arc<dyn KeyValueStore>) -> Self {
        StatusStore {
            wallet_address: wallet_address.to_string(),
            store,
        }
    }

    fn load(&self) -> HashMap<String, MessageStatus> {
        let key = message_statuses_key(&self.wallet_address);
        match self.store.get(&key) {
            Ok(Some(raw)) => serde_json::from_str(&raw).unwrap_or_else(|e| {
                warn!("[Status] corrupt status map for {}: {}", self.wallet_address, e);
                HashMap::new()
            }),
            Ok(None) => HashMap::new(),
            Err(e) => {
                warn!("[Status] status map read failed: {}", e);
                HashMap::new()
            }
        }
    }

    fn save(&self, map: &HashMap<String, MessageStatus>) -> Result<()> {
        let key = message_statuses_key(&self.wallet_address);
        self.store.set(&key, &serde_json::to_string(map)?)
    }

    pub fn status(&self, message_hash: &str) -> MessageStatus {
        self.load()
            .get(message_hash)
            .copied()
            .unwrap_or(MessageStatus::Unread)
    }

    pub fn set_status(&self, message_hash: &str, status: MessageStatus) -> Result<()> {
        let mut map = self.load();
        map.insert(message_hash.to_string(), status);
        self.save(&map)
    }

    pub fn mark_read(&self, message_hash: &str) -> Result<()> {
        self.set_status(message_hash, MessageStatus::Read)
    }

    pub fn all(&self) -> HashMap<String, MessageStatus> {
        self.load()
    }
}
