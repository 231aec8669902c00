// src/codec.rs
// Content envelopes on the room log and the plaintext message schema

use chrono::Utc;
use log::debug;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::crypto::{
    decrypt_with_key, encrypt_with_key, generate_symmetric_key, unwrap_key, wrap_key,
    SymmetricEnvelope, SymmetricKey, SYMMETRIC_KEY_SIZE,
};
use crate::error::{Error, Result};
use crate::identity::AccountBinding;
use crate::registry::RegistryEntry;

/// One wrapped copy of a room key, addressed to a single participant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WrappedKeyEntry {
    pub address: String,
    pub messaging_address: String,
    pub wrapped_key: String, // hex ECIES blob
}

/// Tagged union carried as a log entry's content. Unknown tags are
/// ignored forward-compatibly (see [`ContentEnvelope::from_value`]).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ContentEnvelope {
    /// Room membership announcement handing each participant a wrapped
    /// copy of a fresh symmetric key.
    #[serde(rename = "keys")]
    Keys {
        address: String,
        keys: Vec<WrappedKeyEntry>,
    },
    /// An encrypted message.
    #[serde(rename = "msg")]
    Msg {
        address: String,
        iv: String,
        ciphertext: String,
    },
}

impl ContentEnvelope {
    /// Parse a log entry's content. `None` for unknown or malformed
    /// envelope types - those are skipped, never an error.
    pub fn from_value(value: &Value) -> Option<Self> {
        serde_json::from_value(value.clone()).ok()
    }

    /// Wallet address of the envelope author.
    pub fn sender(&self) -> &str {
        match self {
            ContentEnvelope::Keys { address, .. } => address,
            ContentEnvelope::Msg { address, .. } => address,
        }
    }
}

/// Plaintext message schema. `created` is required; unknown extra
/// fields are tolerated and preserved.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Encryption time, ms since epoch.
    pub created: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media: Option<Vec<Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decryption: Option<DecryptionHint>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Pointer at another room's keys, used when a message hands over
/// decryption material out of band.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecryptionHint {
    pub keys: Vec<String>,
    #[serde(rename = "roomId")]
    pub room_id: String,
}

/// Caller input for an outgoing message; the codec injects `created`.
#[derive(Debug, Clone, Default)]
pub struct MessageDraft {
    pub content: Option<String>,
    pub media: Option<Vec<Value>>,
    pub decryption: Option<DecryptionHint>,
    pub extra: Map<String, Value>,
}

impl MessageDraft {
    pub fn text(content: impl Into<String>) -> Self {
        MessageDraft {
            content: Some(content.into()),
            ..Default::default()
        }
    }

    fn into_message(mut self, created: i64) -> Message {
        // Reserved field names must not shadow the schema via `extra`.
        for reserved in ["created", "content", "media", "decryption"] {
            self.extra.remove(reserved);
        }
        Message {
            created,
            content: self.content,
            media: self.media,
            decryption: self.decryption,
            extra: self.extra,
        }
    }
}

/// Encode a `keys` announcement: one fresh symmetric key, wrapped for
/// every participant's messaging public key. Returns the envelope and
/// the key so the sender can adopt it after the POST succeeds.
pub fn encode_keys_envelope(
    self_wallet: &str,
    participants: &[RegistryEntry],
) -> Result<(Value, SymmetricKey)> {
    let key = generate_symmetric_key();
    let mut entries = Vec::with_capacity(participants.len());
    for participant in participants {
        let pub64 = hex::decode(&participant.messaging_public_key)
            .map_err(|e| Error::Crypto(e.to_string()))?;
        let wrapped = wrap_key(&pub64, &key)?;
        entries.push(WrappedKeyEntry {
            address: participant.wallet_address.clone(),
            messaging_address: participant.messaging_address.clone(),
            wrapped_key: hex::encode(wrapped),
        });
    }
    let envelope = ContentEnvelope::Keys {
        address: self_wallet.to_string(),
        keys: entries,
    };
    Ok((serde_json::to_value(envelope)?, key))
}

/// Recover the room keys addressed to us from a `keys` announcement.
/// Entries for other participants are skipped; unwrap failures are
/// skipped silently (they legitimately occur for copies not ours).
pub fn decode_keys_envelope(
    binding: &AccountBinding,
    entries: &[WrappedKeyEntry],
) -> Vec<SymmetricKey> {
    let secret = binding.keypair.secret_bytes();
    let mut recovered = Vec::new();
    for entry in entries {
        if entry.address != binding.wallet_address {
            continue;
        }
        let Ok(blob) = hex::decode(&entry.wrapped_key) else {
            continue;
        };
        match unwrap_key(&secret, &blob) {
            Ok(key) if key.len() == SYMMETRIC_KEY_SIZE => {
                let mut out = [0u8; SYMMETRIC_KEY_SIZE];
                out.copy_from_slice(&key);
                recovered.push(out);
            }
            Ok(_) => debug!("[Codec] unwrapped key has wrong length, skipping"),
            Err(e) => debug!("[Codec] key unwrap failed, skipping: {}", e),
        }
    }
    recovered
}

/// Encode a `msg` envelope under the room's primary key. Injects
/// `created = now` and refuses drafts that do not serialize to a valid
/// schema instance.
pub fn encode_msg_envelope(
    self_wallet: &str,
    primary_key: &SymmetricKey,
    draft: MessageDraft,
) -> Result<(Value, Message)> {
    let message = draft.into_message(Utc::now().timestamp_millis());

    // Round-trip through the schema; aborts on anything the other side
    // would reject.
    let plaintext = serde_json::to_string(&message)?;
    let _: Message = serde_json::from_str(&plaintext).map_err(|_| Error::InvalidMessage)?;

    let sealed = encrypt_with_key(primary_key, &plaintext)?;
    let envelope = ContentEnvelope::Msg {
        address: self_wallet.to_string(),
        iv: sealed.iv,
        ciphertext: sealed.ciphertext,
    };
    Ok((serde_json::to_value(envelope)?, message))
}

/// Outcome of decoding a `msg` envelope against a room's key set.
#[derive(Debug, Clone, PartialEq)]
pub enum MsgDecodeOutcome {
    /// Decryption and schema validation both succeeded.
    Content(Message),
    /// A key decrypted the payload but it is not a valid message;
    /// dropped, distinguishable from "still encrypted".
    Invalid,
    /// No key in the set worked; surfaced on the still-encrypted stream.
    NotDecryptable,
}

/// Try every room key in insertion order, then validate the plaintext
/// against the schema.
pub fn decode_msg_envelope(
    keys: &[SymmetricKey],
    iv: &str,
    ciphertext: &str,
) -> MsgDecodeOutcome {
    let sealed = SymmetricEnvelope {
        iv: iv.to_string(),
        ciphertext: ciphertext.to_string(),
    };
    for key in keys {
        if let Some(plaintext) = decrypt_with_key(key, &sealed) {
            return match serde_json::from_str::<Message>(&plaintext) {
                Ok(message) => MsgDecodeOutcome::Content(message),
                Err(_) => MsgDecodeOutcome::Invalid,
            };
        }
    }
    MsgDecodeOutcome::NotDecryptable
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::{LocalWallet, SignStyle, ENROLLMENT_PHRASE};
    use serde_json::json;

    fn enrolled(wallet: &LocalWallet) -> AccountBinding {
        let sig = wallet.sign_sync(ENROLLMENT_PHRASE).unwrap();
        AccountBinding::from_enrollment_signature(&wallet.address, &sig).unwrap()
    }

    fn registry_entry(binding: &AccountBinding) -> RegistryEntry {
        RegistryEntry {
            wallet_address: binding.wallet_address.clone(),
            messaging_address: binding.messaging_address().to_string(),
            messaging_public_key: binding.messaging_public_key().to_string(),
            publication_message: binding.expected_publication_message(),
            publication_signature: String::new(),
            enrollment_phrase: binding.enrollment_phrase.clone(),
            enrollment_phrase_signature: String::new(),
        }
    }

    #[test]
    fn test_keys_envelope_roundtrip_for_both_participants() {
        let alice = enrolled(&LocalWallet::random(SignStyle::Personal));
        let bob = enrolled(&LocalWallet::random(SignStyle::Personal));

        let (value, key) = encode_keys_envelope(
            &alice.wallet_address,
            &[registry_entry(&alice), registry_entry(&bob)],
        )
        .unwrap();

        let Some(ContentEnvelope::Keys { address, keys }) = ContentEnvelope::from_value(&value)
        else {
            panic!("expected keys envelope");
        };
        assert_eq!(address, alice.wallet_address);
        assert_eq!(keys.len(), 2);

        assert_eq!(decode_keys_envelope(&alice, &keys), vec![key]);
        assert_eq!(decode_keys_envelope(&bob, &keys), vec![key]);
    }

    #[test]
    fn test_keys_envelope_for_others_adds_nothing() {
        let alice = enrolled(&LocalWallet::random(SignStyle::Personal));
        let bob = enrolled(&LocalWallet::random(SignStyle::Personal));
        let eve = enrolled(&LocalWallet::random(SignStyle::Personal));

        let (value, _) = encode_keys_envelope(
            &alice.wallet_address,
            &[registry_entry(&alice), registry_entry(&bob)],
        )
        .unwrap();
        let Some(ContentEnvelope::Keys { keys, .. }) = ContentEnvelope::from_value(&value) else {
            panic!("expected keys envelope");
        };

        assert!(decode_keys_envelope(&eve, &keys).is_empty());
    }

    #[test]
    fn test_msg_envelope_roundtrip_sets_created() {
        let alice = enrolled(&LocalWallet::random(SignStyle::Personal));
        let key = generate_symmetric_key();

        let (value, sent) =
            encode_msg_envelope(&alice.wallet_address, &key, MessageDraft::text("hi")).unwrap();
        assert!(sent.created > 0);

        let Some(ContentEnvelope::Msg { iv, ciphertext, .. }) = ContentEnvelope::from_value(&value)
        else {
            panic!("expected msg envelope");
        };
        match decode_msg_envelope(&[key], &iv, &ciphertext) {
            MsgDecodeOutcome::Content(message) => {
                assert_eq!(message.content.as_deref(), Some("hi"));
                assert_eq!(message.created, sent.created);
            }
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[test]
    fn test_msg_decode_tries_keys_in_insertion_order() {
        let alice = enrolled(&LocalWallet::random(SignStyle::Personal));
        let stale = generate_symmetric_key();
        let active = generate_symmetric_key();

        let (value, _) =
            encode_msg_envelope(&alice.wallet_address, &active, MessageDraft::text("hi")).unwrap();
        let Some(ContentEnvelope::Msg { iv, ciphertext, .. }) = ContentEnvelope::from_value(&value)
        else {
            panic!("expected msg envelope");
        };

        // The stale key fails its tag check and the walk moves on.
        let outcome = decode_msg_envelope(&[stale, active], &iv, &ciphertext);
        assert!(matches!(outcome, MsgDecodeOutcome::Content(_)));
    }

    #[test]
    fn test_msg_wrong_key_is_not_decryptable() {
        let alice = enrolled(&LocalWallet::random(SignStyle::Personal));
        let key = generate_symmetric_key();
        let other = generate_symmetric_key();

        let (value, _) =
            encode_msg_envelope(&alice.wallet_address, &key, MessageDraft::text("hi")).unwrap();
        let Some(ContentEnvelope::Msg { iv, ciphertext, .. }) = ContentEnvelope::from_value(&value)
        else {
            panic!("expected msg envelope");
        };
        assert_eq!(
            decode_msg_envelope(&[other], &iv, &ciphertext),
            MsgDecodeOutcome::NotDecryptable
        );
        assert_eq!(
            decode_msg_envelope(&[], &iv, &ciphertext),
            MsgDecodeOutcome::NotDecryptable
        );
    }

    #[test]
    fn test_decrypted_garbage_is_invalid_not_encrypted() {
        let key = generate_symmetric_key();
        // Valid JSON, but no `created`: schema-invalid.
        let sealed = encrypt_with_key(&key, r#"{"content":"hi"}"#).unwrap();
        assert_eq!(
            decode_msg_envelope(&[key], &sealed.iv, &sealed.ciphertext),
            MsgDecodeOutcome::Invalid
        );

        // Not JSON at all.
        let sealed = encrypt_with_key(&key, "plain text").unwrap();
        assert_eq!(
            decode_msg_envelope(&[key], &sealed.iv, &sealed.ciphertext),
            MsgDecodeOutcome::Invalid
        );
    }

    #[test]
    fn test_schema_tolerates_unknown_fields() {
        let parsed: Message = serde_json::from_value(json!({
            "created": 1700000000000i64,
            "content": "hello",
            "flavour": "mint",
        }))
        .unwrap();
        assert_eq!(parsed.extra.get("flavour"), Some(&json!("mint")));

        // Wrong types on known fields are rejected.
        assert!(serde_json::from_value::<Message>(json!({"created": "soon"})).is_err());
        assert!(
            serde_json::from_value::<Message>(json!({"created": 1, "content": 5})).is_err()
        );
        assert!(serde_json::from_value::<Message>(json!({"content": "no created"})).is_err());
        assert!(serde_json::from_value::<Message>(
            json!({"created": 1, "decryption": {"keys": "nope", "roomId": "r"}})
        )
        .is_err());
    }

    #[test]
    fn test_unknown_envelope_type_is_ignored() {
        assert!(ContentEnvelope::from_value(&json!({"type": "presence", "address": "0xA"}))
            .is_none());
        assert!(ContentEnvelope::from_value(&json!({"no_type": true})).is_none());

        // Extra fields on a known type (e.g. the out-of-band `to`) are fine.
        let value = json!({
            "type": "msg", "address": "0xA", "iv": "aa", "ciphertext": "bb",
            "to": "0xB",
        });
        assert!(matches!(
            ContentEnvelope::from_value(&value),
            Some(ContentEnvelope::Msg { .. })
        ));
    }
}
