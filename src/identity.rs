// src/identity.rs
// Wallet signer interface and the enrolled messaging identity

use async_trait::async_trait;
use k256::ecdsa::{RecoveryId, Signature as EcdsaSignature, SigningKey, VerifyingKey};
use k256::elliptic_curve::sec1::ToEncodedPoint;
use k256::SecretKey;

use crate::address::{address_from_public_key, keccak256};
use crate::crypto::MessagingKeypair;
use crate::error::{Error, Result};

/// The exact bytes the wallet signs to produce the messaging key. The
/// first 32 bytes of that signature ARE the messaging private key, so
/// this constant must never change.
pub const ENROLLMENT_PHRASE: &str = "I am ready to start messaging on Origin.";

/// Prefix of the announcement the wallet signs to authorize a messaging
/// address.
pub const PUBLICATION_PREFIX: &str = "My public messaging key is: ";

/// How the external wallet hashes a message before signing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignStyle {
    /// `personal_sign`: keccak256("\x19Ethereum Signed Message:\n" + len + msg)
    Personal,
    /// keccak256(msg) directly.
    Raw,
}

/// External signer holding the wallet's private key. Signing may prompt
/// the user; a refusal surfaces as [`Error::UserDenied`].
#[async_trait]
pub trait WalletSigner: Send + Sync {
    /// Sign `message` for `wallet_address`, returning the 65-byte
    /// r || s || v signature.
    async fn sign(&self, message: &str, wallet_address: &str) -> Result<Vec<u8>>;
}

pub fn personal_message_hash(message: &[u8]) -> [u8; 32] {
    let mut eth_message =
        format!("\x19Ethereum Signed Message:\n{}", message.len()).into_bytes();
    eth_message.extend_from_slice(message);
    keccak256(&eth_message)
}

pub fn message_hash(style: SignStyle, message: &str) -> [u8; 32] {
    match style {
        SignStyle::Personal => personal_message_hash(message.as_bytes()),
        SignStyle::Raw => keccak256(message.as_bytes()),
    }
}

/// 65-byte r || s || v signature over a 32-byte digest, v in Electrum
/// notation (27/28).
pub fn sign_recoverable(secret: &SecretKey, digest: &[u8; 32]) -> Result<[u8; 65]> {
    let (signature, recovery_id) = SigningKey::from(secret)
        .sign_prehash_recoverable(digest)
        .map_err(|e| Error::Crypto(e.to_string()))?;
    let mut out = [0u8; 65];
    out[..64].copy_from_slice(&signature.to_bytes());
    out[64] = 27 + recovery_id.to_byte();
    Ok(out)
}

/// Recover the checksummed signer address from a 65-byte signature.
/// Accepts v as 0/1 or 27/28.
pub fn recover_address(digest: &[u8; 32], signature: &[u8]) -> Result<String> {
    if signature.len() != 65 {
        return Err(Error::Crypto("signature must be 65 bytes".into()));
    }
    let v = signature[64];
    let v = if v >= 27 { v - 27 } else { v };
    let recovery_id = RecoveryId::try_from(v)
        .map_err(|e| Error::Crypto(e.to_string()))?;
    let sig = EcdsaSignature::from_slice(&signature[..64])
        .map_err(|e| Error::Crypto(e.to_string()))?;
    let verifying_key = VerifyingKey::recover_from_prehash(digest, &sig, recovery_id)
        .map_err(|e| Error::Crypto(e.to_string()))?;
    let point = verifying_key.to_encoded_point(false);
    Ok(address_from_public_key(&point.as_bytes()[1..]))
}

/// Whether `signature` over `message` (hashed per `style`) recovers to
/// `expected_address`.
pub fn verify_wallet_signature(
    style: SignStyle,
    message: &str,
    signature: &[u8],
    expected_address: &str,
) -> bool {
    let digest = message_hash(style, message);
    match recover_address(&digest, signature) {
        Ok(addr) => addr == expected_address,
        Err(_) => false,
    }
}

/// In-process wallet for tests and headless deployments. Production
/// callers hand the engine their own [`WalletSigner`] instead.
#[derive(Clone)]
pub struct LocalWallet {
    secret: SecretKey,
    pub address: String,
    style: SignStyle,
}

impl LocalWallet {
    pub fn random(style: SignStyle) -> Self {
        Self::from_secret(SecretKey::random(&mut rand::thread_rng()), style)
    }

    pub fn from_secret(secret: SecretKey, style: SignStyle) -> Self {
        let point = secret.public_key().to_encoded_point(false);
        let address = address_from_public_key(&point.as_bytes()[1..]);
        LocalWallet {
            secret,
            address,
            style,
        }
    }

    pub fn sign_sync(&self, message: &str) -> Result<Vec<u8>> {
        let digest = message_hash(self.style, message);
        Ok(sign_recoverable(&self.secret, &digest)?.to_vec())
    }
}

#[async_trait]
impl WalletSigner for LocalWallet {
    async fn sign(&self, message: &str, wallet_address: &str) -> Result<Vec<u8>> {
        if wallet_address != self.address {
            // This wallet holds no key for the requested account.
            return Err(Error::UserDenied);
        }
        self.sign_sync(message)
    }
}

/// The enrolled messaging identity for one wallet address.
#[derive(Debug, Clone)]
pub struct AccountBinding {
    pub wallet_address: String,
    pub keypair: MessagingKeypair,
    pub enrollment_phrase: String,
    pub publication_message: Option<String>,
    pub publication_signature: Option<String>, // hex
}

impl AccountBinding {
    /// Binding from a wallet's enrollment signature. The messaging
    /// private key is exactly the signature's first 32 bytes.
    pub fn from_enrollment_signature(
        wallet_address: &str,
        enrollment_signature: &[u8],
    ) -> Result<Self> {
        let keypair = crate::crypto::derive_messaging_keypair(enrollment_signature)?;
        Ok(AccountBinding {
            wallet_address: wallet_address.to_string(),
            keypair,
            enrollment_phrase: ENROLLMENT_PHRASE.to_string(),
            publication_message: None,
            publication_signature: None,
        })
    }

    pub fn messaging_address(&self) -> &str {
        &self.keypair.address
    }

    pub fn messaging_public_key(&self) -> &str {
        &self.keypair.public_key_hex
    }

    /// The announcement text the wallet signs during publication.
    pub fn expected_publication_message(&self) -> String {
        format!("{}{}", PUBLICATION_PREFIX, self.keypair.address)
    }

    /// Proof-of-possession signature over the enrollment phrase, made
    /// with the messaging key. The wallet's own signature over the
    /// phrase is the private key itself and must never be published.
    pub fn enrollment_phrase_signature(&self) -> Result<String> {
        let digest = personal_message_hash(self.enrollment_phrase.as_bytes());
        Ok(hex::encode(sign_recoverable(&self.keypair.secret, &digest)?))
    }

    /// Sign a 32-byte digest with the messaging key (log-entry signing).
    pub fn sign_digest(&self, digest: &[u8; 32]) -> Result<String> {
        Ok(hex::encode(sign_recoverable(&self.keypair.secret, digest)?))
    }
}

/// Pre-computed ceremony output gathered externally (both signatures
/// collected ahead of time); takes the same path as enable + publish.
#[derive(Debug, Clone)]
pub struct Enrollment {
    pub enrollment_signature: Vec<u8>,
    pub publication_signature: Vec<u8>,
}

impl Enrollment {
    /// Build the binding this enrollment encodes, checking that the
    /// publication signature really is the wallet's.
    pub fn into_binding(self, wallet_address: &str, style: SignStyle) -> Result<AccountBinding> {
        let mut binding =
            AccountBinding::from_enrollment_signature(wallet_address, &self.enrollment_signature)?;
        let message = binding.expected_publication_message();
        if !verify_wallet_signature(style, &message, &self.publication_signature, wallet_address) {
            return Err(Error::Crypto(
                "publication signature does not match wallet".into(),
            ));
        }
        binding.publication_message = Some(message);
        binding.publication_signature = Some(hex::encode(&self.publication_signature));
        Ok(binding)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_and_recover() {
        let wallet = LocalWallet::random(SignStyle::Personal);
        let signature = wallet.sign_sync("hello").unwrap();
        let digest = message_hash(SignStyle::Personal, "hello");
        assert_eq!(recover_address(&digest, &signature).unwrap(), wallet.address);
        assert!(verify_wallet_signature(
            SignStyle::Personal,
            "hello",
            &signature,
            &wallet.address
        ));
        assert!(!verify_wallet_signature(
            SignStyle::Personal,
            "other",
            &signature,
            &wallet.address
        ));
    }

    #[test]
    fn test_raw_style_differs_from_personal() {
        assert_ne!(
            message_hash(SignStyle::Personal, "x"),
            message_hash(SignStyle::Raw, "x")
        );
    }

    #[test]
    fn test_binding_from_enrollment_signature() {
        let wallet = LocalWallet::random(SignStyle::Personal);
        let enrollment_sig = wallet.sign_sync(ENROLLMENT_PHRASE).unwrap();

        let binding =
            AccountBinding::from_enrollment_signature(&wallet.address, &enrollment_sig).unwrap();
        assert_eq!(binding.keypair.secret_bytes()[..], enrollment_sig[..32]);
        assert_eq!(
            binding.expected_publication_message(),
            format!("My public messaging key is: {}", binding.messaging_address())
        );

        // Deterministic across sessions: same signature, same identity.
        let again =
            AccountBinding::from_enrollment_signature(&wallet.address, &enrollment_sig).unwrap();
        assert_eq!(again.messaging_address(), binding.messaging_address());
    }

    #[test]
    fn test_phrase_signature_recovers_messaging_address() {
        let wallet = LocalWallet::random(SignStyle::Personal);
        let enrollment_sig = wallet.sign_sync(ENROLLMENT_PHRASE).unwrap();
        let binding =
            AccountBinding::from_enrollment_signature(&wallet.address, &enrollment_sig).unwrap();

        let phs = hex::decode(binding.enrollment_phrase_signature().unwrap()).unwrap();
        let digest = personal_message_hash(ENROLLMENT_PHRASE.as_bytes());
        assert_eq!(
            recover_address(&digest, &phs).unwrap(),
            binding.messaging_address()
        );
    }

    #[test]
    fn test_injected_enrollment_checks_publication_signature() {
        let wallet = LocalWallet::random(SignStyle::Personal);
        let enrollment_sig = wallet.sign_sync(ENROLLMENT_PHRASE).unwrap();
        let binding =
            AccountBinding::from_enrollment_signature(&wallet.address, &enrollment_sig).unwrap();
        let publication_sig = wallet
            .sign_sync(&binding.expected_publication_message())
            .unwrap();

        let ok = Enrollment {
            enrollment_signature: enrollment_sig.clone(),
            publication_signature: publication_sig,
        }
        .into_binding(&wallet.address, SignStyle::Personal);
        assert!(ok.is_ok());

        let bad = Enrollment {
            enrollment_signature: enrollment_sig.clone(),
            publication_signature: enrollment_sig,
        }
        .into_binding(&wallet.address, SignStyle::Personal);
        assert!(bad.is_err());
    }
}
