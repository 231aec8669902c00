// src/registry.rs
// Cached lookup and publish of per-wallet messaging identities

use std::collections::HashMap;
use std::sync::RwLock;

use log::warn;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::identity::AccountBinding;
use crate::server::{AccountData, AccountRecord, KeyServerClient};

/// The public record the key server holds per wallet address: the
/// authoritative mapping from wallet address to messaging public key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryEntry {
    pub wallet_address: String,
    pub messaging_address: String,
    pub messaging_public_key: String,
    pub publication_message: String,
    pub publication_signature: String,
    pub enrollment_phrase: String,
    pub enrollment_phrase_signature: String,
}

impl RegistryEntry {
    pub fn from_record(wallet_address: &str, record: AccountRecord) -> Self {
        RegistryEntry {
            wallet_address: wallet_address.to_string(),
            messaging_address: record.data.address,
            messaging_public_key: record.data.pub_key,
            publication_message: record.data.msg,
            publication_signature: record.signature,
            enrollment_phrase: record.data.ph,
            enrollment_phrase_signature: record.data.phs,
        }
    }

    pub fn to_record(&self) -> AccountRecord {
        AccountRecord {
            signature: self.publication_signature.clone(),
            data: AccountData {
                address: self.messaging_address.clone(),
                msg: self.publication_message.clone(),
                pub_key: self.messaging_public_key.clone(),
                ph: self.enrollment_phrase.clone(),
                phs: self.enrollment_phrase_signature.clone(),
            },
        }
    }

    /// The entry a fully published binding announces.
    pub fn from_binding(binding: &AccountBinding) -> Result<Self> {
        let publication_message = binding
            .publication_message
            .clone()
            .ok_or(Error::IdentityState("publication message not signed yet"))?;
        let publication_signature = binding
            .publication_signature
            .clone()
            .ok_or(Error::IdentityState("publication signature not available"))?;
        Ok(RegistryEntry {
            wallet_address: binding.wallet_address.clone(),
            messaging_address: binding.messaging_address().to_string(),
            messaging_public_key: binding.messaging_public_key().to_string(),
            publication_message,
            publication_signature,
            enrollment_phrase: binding.enrollment_phrase.clone(),
            enrollment_phrase_signature: binding.enrollment_phrase_signature()?,
        })
    }
}

/// Read-mostly registry client. Successful lookups are cached for the
/// engine lifetime, keyed by checksummed wallet address; there is no
/// negative cache.
pub struct RegistryClient {
    server: KeyServerClient,
    cache: RwLock<HashMap<String, RegistryEntry>>,
}

impl RegistryClient {
    pub fn new(server: KeyServerClient) -> Self {
        RegistryClient {
            server,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// `None` means "peer not enrolled" - absent entries and registry
    /// outages look the same to the caller.
    pub async fn lookup(&self, wallet_address: &str) -> Option<RegistryEntry> {
        if let Ok(cache) = self.cache.read() {
            if let Some(entry) = cache.get(wallet_address) {
                return Some(entry.clone());
            }
        }

        let record = match self.server.get_account(wallet_address).await {
            Ok(record) => record?,
            Err(e) => {
                warn!("[Registry] lookup for {} failed: {}", wallet_address, e);
                return None;
            }
        };

        let entry = RegistryEntry::from_record(wallet_address, record);
        if let Ok(mut cache) = self.cache.write() {
            cache.insert(wallet_address.to_string(), entry.clone());
        }
        Some(entry)
    }

    /// Publish an entry; failure is reported but never tears down local
    /// state. The published entry becomes the cached one.
    pub async fn publish(&self, entry: &RegistryEntry) -> Result<()> {
        self.server
            .post_account(&entry.wallet_address, &entry.to_record())
            .await
            .map_err(|e| Error::RegistryUnavailable(e.to_string()))?;

        if let Ok(mut cache) = self.cache.write() {
            cache.insert(entry.wallet_address.clone(), entry.clone());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::{LocalWallet, SignStyle, ENROLLMENT_PHRASE};
    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn published_binding(wallet: &LocalWallet) -> AccountBinding {
        let enrollment_sig = wallet.sign_sync(ENROLLMENT_PHRASE).unwrap();
        let mut binding =
            AccountBinding::from_enrollment_signature(&wallet.address, &enrollment_sig).unwrap();
        let message = binding.expected_publication_message();
        let signature = wallet.sign_sync(&message).unwrap();
        binding.publication_message = Some(message);
        binding.publication_signature = Some(hex::encode(signature));
        binding
    }

    #[test]
    fn test_record_roundtrip() {
        let wallet = LocalWallet::random(SignStyle::Personal);
        let entry = RegistryEntry::from_binding(&published_binding(&wallet)).unwrap();
        let back = RegistryEntry::from_record(&wallet.address, entry.to_record());
        assert_eq!(back, entry);
    }

    #[tokio::test]
    async fn test_lookup_caches_indefinitely() {
        let wallet = LocalWallet::random(SignStyle::Personal);
        let entry = RegistryEntry::from_binding(&published_binding(&wallet)).unwrap();

        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(format!("/accounts/{}", wallet.address)))
            .respond_with(ResponseTemplate::new(200).set_body_json(entry.to_record()))
            .expect(1) // second lookup must come from the cache
            .mount(&server)
            .await;

        let registry = RegistryClient::new(KeyServerClient::new(&server.uri()).unwrap());
        let first = registry.lookup(&wallet.address).await.unwrap();
        let second = registry.lookup(&wallet.address).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(first.messaging_address, entry.messaging_address);
    }

    #[tokio::test]
    async fn test_lookup_absent_is_none_and_not_cached() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/accounts/0xmissing"))
            .respond_with(ResponseTemplate::new(404))
            .expect(2) // no negative cache: both lookups hit the server
            .mount(&server)
            .await;

        let registry = RegistryClient::new(KeyServerClient::new(&server.uri()).unwrap());
        assert!(registry.lookup("0xmissing").await.is_none());
        assert!(registry.lookup("0xmissing").await.is_none());
    }

    #[tokio::test]
    async fn test_publish_failure_is_registry_unavailable() {
        let wallet = LocalWallet::random(SignStyle::Personal);
        let entry = RegistryEntry::from_binding(&published_binding(&wallet)).unwrap();

        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(format!("/accounts/{}", wallet.address)))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let registry = RegistryClient::new(KeyServerClient::new(&server.uri()).unwrap());
        let err = registry.publish(&entry).await.unwrap_err();
        assert!(matches!(err, Error::RegistryUnavailable(_)));
    }

    #[tokio::test]
    async fn test_publish_then_lookup_roundtrip() {
        let wallet = LocalWallet::random(SignStyle::Personal);
        let entry = RegistryEntry::from_binding(&published_binding(&wallet)).unwrap();

        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(format!("/accounts/{}", wallet.address)))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
            .mount(&server)
            .await;

        let registry = RegistryClient::new(KeyServerClient::new(&server.uri()).unwrap());
        registry.publish(&entry).await.unwrap();

        // Served from cache; no GET mock mounted.
        let looked_up = registry.lookup(&wallet.address).await.unwrap();
        assert_eq!(looked_up.messaging_address, entry.messaging_address);
    }
}
