// src/server.rs
// Key server HTTP surface: accounts, message logs, conversation list

use reqwest::{Client, StatusCode, Url};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};
use crate::identity::{personal_message_hash, recover_address};

/// One record of a room's append-only log. Indices are server-assigned
/// and strictly increase per room starting at 0.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEntry {
    pub conversation_id: String,
    pub conversation_index: u64,
    pub content: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
}

/// Registry wire envelope. The publish POST sends it and the account GET
/// returns it unchanged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountRecord {
    pub signature: String,
    pub data: AccountData,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountData {
    /// Messaging address.
    pub address: String,
    /// Publication message the wallet signed.
    pub msg: String,
    /// 64-byte uncompressed messaging public key, hex.
    pub pub_key: String,
    /// Enrollment phrase.
    pub ph: String,
    /// Proof-of-possession signature over the phrase by the messaging key.
    pub phs: String,
}

#[derive(Debug, Serialize)]
struct PostMessageBody<'a> {
    content: &'a Value,
    signature: &'a str,
}

/// Thin typed client over the key server's REST surface.
#[derive(Clone)]
pub struct KeyServerClient {
    http: Client,
    base: String,
}

impl KeyServerClient {
    pub fn new(base_url: &str) -> Result<Self> {
        let trimmed = base_url.trim().trim_end_matches('/');
        if trimmed.is_empty() {
            return Err(Error::Configuration("key server URL is not set".into()));
        }
        Url::parse(trimmed)
            .map_err(|e| Error::Configuration(format!("bad key server URL: {}", e)))?;
        Ok(KeyServerClient {
            http: Client::new(),
            base: trimmed.to_string(),
        })
    }

    pub async fn get_account(&self, wallet_address: &str) -> Result<Option<AccountRecord>> {
        let url = format!("{}/accounts/{}", self.base, wallet_address);
        let response = self.http.get(&url).send().await?;
        if response.status().is_success() {
            Ok(Some(response.json().await?))
        } else {
            Ok(None)
        }
    }

    pub async fn post_account(&self, wallet_address: &str, record: &AccountRecord) -> Result<()> {
        let url = format!("{}/accounts/{}", self.base, wallet_address);
        let response = self.http.post(&url).json(record).send().await?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(Error::Server(response.status().as_u16()))
        }
    }

    /// Full room log, ascending by conversationIndex.
    pub async fn get_messages(&self, room_id: &str) -> Result<Vec<LogEntry>> {
        let url = format!("{}/messages/{}", self.base, room_id);
        let response = self.http.get(&url).send().await?;
        if !response.status().is_success() {
            return Err(Error::Server(response.status().as_u16()));
        }
        let mut entries: Vec<LogEntry> = response.json().await?;
        entries.sort_by_key(|e| e.conversation_index);
        Ok(entries)
    }

    /// Append at an explicit index. 409 means the index was already
    /// taken; the caller may retry once its view of the log advances.
    pub async fn post_message(
        &self,
        room_id: &str,
        index: u64,
        content: &Value,
        signature: &str,
    ) -> Result<()> {
        let url = format!("{}/messages/{}/{}", self.base, room_id, index);
        let body = PostMessageBody { content, signature };
        let response = self.http.post(&url).json(&body).send().await?;
        match response.status() {
            s if s.is_success() => Ok(()),
            StatusCode::CONFLICT => Err(Error::IndexConflict),
            s => Err(Error::Server(s.as_u16())),
        }
    }

    /// Room ids this wallet participates in.
    pub async fn get_conversations(&self, wallet_address: &str) -> Result<Vec<String>> {
        let url = format!("{}/conversations/{}", self.base, wallet_address);
        let response = self.http.get(&url).send().await?;
        if !response.status().is_success() {
            return Err(Error::Server(response.status().as_u16()));
        }
        Ok(response.json().await?)
    }

    /// WebSocket endpoint delivering live log entries for a wallet.
    pub fn events_url(&self, wallet_address: &str) -> Result<String> {
        let mut url = Url::parse(&format!("{}/message-events/{}", self.base, wallet_address))
            .map_err(|e| Error::Configuration(e.to_string()))?;
        let scheme = match url.scheme() {
            "http" => "ws",
            "https" => "wss",
            "ws" | "wss" => return Ok(url.to_string()),
            other => {
                return Err(Error::Configuration(format!(
                    "unsupported key server scheme {}",
                    other
                )))
            }
        };
        url.set_scheme(scheme)
            .map_err(|_| Error::Configuration("cannot derive stream scheme".into()))?;
        Ok(url.to_string())
    }
}

/// Canonical key-sorted JSON of the signed portion of a log entry, so
/// any verifier can reconstruct the exact bytes.
pub fn signing_payload(room_id: &str, index: u64, content: &Value) -> Result<String> {
    let value = serde_json::json!({
        "content": content,
        "conversationId": room_id,
        "conversationIndex": index,
    });
    Ok(serde_json::to_string(&value)?)
}

pub fn entry_digest(room_id: &str, index: u64, content: &Value) -> Result<[u8; 32]> {
    Ok(personal_message_hash(
        signing_payload(room_id, index, content)?.as_bytes(),
    ))
}

/// Check an entry's signature against the sender's messaging address.
/// Unsigned entries pass; signed entries must recover exactly.
pub fn verify_entry(entry: &LogEntry, expected_messaging_address: &str) -> bool {
    let Some(signature_hex) = &entry.signature else {
        return true;
    };
    let Ok(signature) = hex::decode(signature_hex) else {
        return false;
    };
    let Ok(digest) = entry_digest(
        &entry.conversation_id,
        entry.conversation_index,
        &entry.content,
    ) else {
        return false;
    };
    recover_address(&digest, &signature)
        .map(|address| address == expected_messaging_address)
        .unwrap_or(false)
}
