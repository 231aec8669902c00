// src/crypto.rs
// Crypto primitives: symmetric message envelope, ECIES key wrap,
// messaging keypair derivation

use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use hmac::{Hmac, Mac};
use k256::elliptic_curve::sec1::{FromEncodedPoint, ToEncodedPoint};
use k256::{EncodedPoint, PublicKey, SecretKey};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha1::Sha1;
use sha2::{Digest, Sha512};

use crate::address::address_from_public_key;
use crate::error::{Error, Result};

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;
type HmacSha256 = Hmac<sha2::Sha256>;

pub const SYMMETRIC_KEY_SIZE: usize = 32;
const IV_SIZE: usize = 16;
// First 6 base64 chars of SHA-1(plaintext). A key discriminator, not a MAC.
const TAG_LEN: usize = 6;
const ECIES_PUBKEY_SIZE: usize = 65;
const ECIES_MAC_SIZE: usize = 32;

pub type SymmetricKey = [u8; SYMMETRIC_KEY_SIZE];

/// Encrypted message payload as carried on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SymmetricEnvelope {
    pub iv: String,         // Base64 encoded IV
    pub ciphertext: String, // Base64 encoded ciphertext
}

/// Fresh random 32-byte room key.
pub fn generate_symmetric_key() -> SymmetricKey {
    let mut key = [0u8; SYMMETRIC_KEY_SIZE];
    rand::thread_rng().fill_bytes(&mut key);
    key
}

fn integrity_tag(plaintext: &str) -> String {
    let digest = Sha1::digest(plaintext.as_bytes());
    BASE64.encode(digest)[..TAG_LEN].to_string()
}

/// AES-256-CBC encryption of `plaintext || tag` under a random IV.
pub fn encrypt_with_key(key: &SymmetricKey, plaintext: &str) -> Result<SymmetricEnvelope> {
    let mut iv = [0u8; IV_SIZE];
    rand::thread_rng().fill_bytes(&mut iv);

    let tagged = format!("{}{}", plaintext, integrity_tag(plaintext));
    let cipher = Aes256CbcEnc::new_from_slices(key, &iv)
        .map_err(|e| Error::Crypto(e.to_string()))?;
    let ciphertext = cipher.encrypt_padded_vec_mut::<Pkcs7>(tagged.as_bytes());

    Ok(SymmetricEnvelope {
        iv: BASE64.encode(iv),
        ciphertext: BASE64.encode(ciphertext),
    })
}

/// Try one candidate key. `None` means "undecryptable with this key":
/// bad padding, non-UTF-8, too short, or tag mismatch. The caller walks
/// the room keystore in insertion order until a key succeeds.
pub fn decrypt_with_key(key: &SymmetricKey, envelope: &SymmetricEnvelope) -> Option<String> {
    let iv = BASE64.decode(&envelope.iv).ok()?;
    let ciphertext = BASE64.decode(&envelope.ciphertext).ok()?;

    let cipher = Aes256CbcDec::new_from_slices(key, &iv).ok()?;
    let plaintext = cipher.decrypt_padded_vec_mut::<Pkcs7>(&ciphertext).ok()?;
    let text = String::from_utf8(plaintext).ok()?;

    if text.len() <= TAG_LEN {
        return None;
    }
    let split = text.len() - TAG_LEN;
    if !text.is_char_boundary(split) {
        return None;
    }
    let (body, tag) = text.split_at(split);
    (integrity_tag(body) == tag).then(|| body.to_string())
}

fn public_key_from_untagged(pubkey64: &[u8]) -> Result<PublicKey> {
    let bytes: [u8; 64] = pubkey64
        .try_into()
        .map_err(|_| Error::Crypto("public key must be 64 bytes".into()))?;
    let point = EncodedPoint::from_untagged_bytes(&bytes.into());
    PublicKey::from_encoded_point(&point)
        .into_option()
        .ok_or_else(|| Error::Crypto("point not on curve".into()))
}

fn ecdh_shared_secret(secret: &SecretKey, public: &PublicKey) -> [u8; 32] {
    let shared = k256::ecdh::diffie_hellman(secret.to_nonzero_scalar(), public.as_affine());
    let mut out = [0u8; 32];
    out.copy_from_slice(&shared.raw_secret_bytes()[..32]);
    out
}

// Wrapped-key blob layout: iv(16) || ephemeral pubkey(65) || mac(32) ||
// ciphertext. AES and MAC keys are the two halves of SHA-512(ecdh
// x-coordinate); the MAC covers iv || ephemeral pubkey || ciphertext.

/// ECIES key wrap to a 64-byte uncompressed secp256k1 public key.
pub fn wrap_key(recipient_pubkey64: &[u8], plaintext: &[u8]) -> Result<Vec<u8>> {
    let recipient = public_key_from_untagged(recipient_pubkey64)?;
    let ephemeral = SecretKey::random(&mut rand::thread_rng());

    let shared = ecdh_shared_secret(&ephemeral, &recipient);
    let schedule = Sha512::digest(shared);
    let (enc_key, mac_key) = schedule.split_at(32);

    let mut iv = [0u8; IV_SIZE];
    rand::thread_rng().fill_bytes(&mut iv);
    let cipher = Aes256CbcEnc::new_from_slices(enc_key, &iv)
        .map_err(|e| Error::Crypto(e.to_string()))?;
    let ciphertext = cipher.encrypt_padded_vec_mut::<Pkcs7>(plaintext);

    let ephemeral_pub = ephemeral.public_key().to_encoded_point(false);

    let mut mac = HmacSha256::new_from_slice(mac_key)
        .map_err(|e| Error::Crypto(e.to_string()))?;
    mac.update(&iv);
    mac.update(ephemeral_pub.as_bytes());
    mac.update(&ciphertext);
    let mac = mac.finalize().into_bytes();

    let mut blob =
        Vec::with_capacity(IV_SIZE + ECIES_PUBKEY_SIZE + ECIES_MAC_SIZE + ciphertext.len());
    blob.extend_from_slice(&iv);
    blob.extend_from_slice(ephemeral_pub.as_bytes());
    blob.extend_from_slice(&mac);
    blob.extend_from_slice(&ciphertext);
    Ok(blob)
}

/// ECIES unwrap with a 32-byte private scalar. Fails on truncated blobs,
/// MAC mismatch, or padding errors.
pub fn unwrap_key(private_key: &[u8], blob: &[u8]) -> Result<Vec<u8>> {
    if blob.len() < IV_SIZE + ECIES_PUBKEY_SIZE + ECIES_MAC_SIZE + 16 {
        return Err(Error::Crypto("wrapped key blob too short".into()));
    }
    let (iv, rest) = blob.split_at(IV_SIZE);
    let (ephemeral_bytes, rest) = rest.split_at(ECIES_PUBKEY_SIZE);
    let (mac_bytes, ciphertext) = rest.split_at(ECIES_MAC_SIZE);

    let secret = SecretKey::from_slice(private_key)
        .map_err(|e| Error::Crypto(e.to_string()))?;
    let ephemeral = PublicKey::from_sec1_bytes(ephemeral_bytes)
        .map_err(|e| Error::Crypto(e.to_string()))?;

    let shared = ecdh_shared_secret(&secret, &ephemeral);
    let schedule = Sha512::digest(shared);
    let (enc_key, mac_key) = schedule.split_at(32);

    let mut mac = HmacSha256::new_from_slice(mac_key)
        .map_err(|e| Error::Crypto(e.to_string()))?;
    mac.update(iv);
    mac.update(ephemeral_bytes);
    mac.update(ciphertext);
    mac.verify_slice(mac_bytes)
        .map_err(|_| Error::Crypto("wrapped key MAC mismatch".into()))?;

    let cipher = Aes256CbcDec::new_from_slices(enc_key, iv)
        .map_err(|e| Error::Crypto(e.to_string()))?;
    cipher
        .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
        .map_err(|_| Error::Crypto("wrapped key padding invalid".into()))
}

/// The derived messaging identity: secp256k1 scalar, 64-byte public key
/// (hex, tag byte stripped), and the corresponding checksummed address.
#[derive(Clone)]
pub struct MessagingKeypair {
    pub secret: SecretKey,
    pub public_key_hex: String,
    pub address: String,
}

impl std::fmt::Debug for MessagingKeypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never log the scalar.
        f.debug_struct("MessagingKeypair")
            .field("address", &self.address)
            .finish()
    }
}

impl MessagingKeypair {
    pub fn from_secret(secret: SecretKey) -> Self {
        let point = secret.public_key().to_encoded_point(false);
        let pub64 = &point.as_bytes()[1..];
        MessagingKeypair {
            public_key_hex: hex::encode(pub64),
            address: address_from_public_key(pub64),
            secret,
        }
    }

    pub fn from_secret_bytes(bytes: &[u8]) -> Result<Self> {
        let secret =
            SecretKey::from_slice(bytes).map_err(|e| Error::Crypto(e.to_string()))?;
        Ok(Self::from_secret(secret))
    }

    pub fn secret_bytes(&self) -> [u8; 32] {
        self.secret.to_bytes().into()
    }
}

/// Messaging keypair from a wallet's enrollment signature: the private
/// key is exactly the first 32 bytes of the signature. Any other
/// derivation breaks cross-client compatibility.
pub fn derive_messaging_keypair(enrollment_signature: &[u8]) -> Result<MessagingKeypair> {
    if enrollment_signature.len() < 32 {
        return Err(Error::Crypto(
            "enrollment signature shorter than 32 bytes".into(),
        ));
    }
    MessagingKeypair::from_secret_bytes(&enrollment_signature[..32])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_symmetric_roundtrip() {
        let key = generate_symmetric_key();
        let envelope = encrypt_with_key(&key, "Hello, secure world!").unwrap();
        let decrypted = decrypt_with_key(&key, &envelope).unwrap();
        assert_eq!(decrypted, "Hello, secure world!");
    }

    #[test]
    fn test_symmetric_wrong_key_fails() {
        let k1 = generate_symmetric_key();
        let k2 = generate_symmetric_key();
        let envelope = encrypt_with_key(&k1, "secret").unwrap();
        assert!(decrypt_with_key(&k2, &envelope).is_none());
    }

    #[test]
    fn test_symmetric_garbage_ciphertext_fails() {
        let key = generate_symmetric_key();
        let envelope = encrypt_with_key(&key, "payload").unwrap();
        let broken = SymmetricEnvelope {
            iv: envelope.iv.clone(),
            ciphertext: envelope.iv,
        };
        assert!(decrypt_with_key(&key, &broken).is_none());
    }

    #[test]
    fn test_symmetric_unicode_plaintext() {
        let key = generate_symmetric_key();
        let envelope = encrypt_with_key(&key, "héllo 日本語").unwrap();
        assert_eq!(decrypt_with_key(&key, &envelope).unwrap(), "héllo 日本語");
    }

    #[test]
    fn test_ecies_roundtrip() {
        let recipient =
            MessagingKeypair::from_secret(SecretKey::random(&mut rand::thread_rng()));
        let pub64 = hex::decode(&recipient.public_key_hex).unwrap();

        let room_key = generate_symmetric_key();
        let blob = wrap_key(&pub64, &room_key).unwrap();
        let unwrapped = unwrap_key(&recipient.secret_bytes(), &blob).unwrap();
        assert_eq!(unwrapped, room_key);
    }

    #[test]
    fn test_ecies_wrong_recipient_fails() {
        let recipient =
            MessagingKeypair::from_secret(SecretKey::random(&mut rand::thread_rng()));
        let other = MessagingKeypair::from_secret(SecretKey::random(&mut rand::thread_rng()));
        let pub64 = hex::decode(&recipient.public_key_hex).unwrap();

        let blob = wrap_key(&pub64, b"room key material").unwrap();
        assert!(unwrap_key(&other.secret_bytes(), &blob).is_err());
    }

    #[test]
    fn test_ecies_mac_tamper_fails() {
        let recipient =
            MessagingKeypair::from_secret(SecretKey::random(&mut rand::thread_rng()));
        let pub64 = hex::decode(&recipient.public_key_hex).unwrap();

        let mut blob = wrap_key(&pub64, b"room key material").unwrap();
        let last = blob.len() - 1;
        blob[last] ^= 0x01;
        assert!(unwrap_key(&recipient.secret_bytes(), &blob).is_err());
    }

    #[test]
    fn test_keypair_derivation_is_deterministic() {
        let signature = [0x42u8; 65];
        let a = derive_messaging_keypair(&signature).unwrap();
        let b = derive_messaging_keypair(&signature).unwrap();
        assert_eq!(a.address, b.address);
        assert_eq!(a.public_key_hex, b.public_key_hex);
        assert_eq!(a.secret_bytes(), signature[..32]);
        assert_eq!(a.public_key_hex.len(), 128);
        assert!(a.address.starts_with("0x"));
    }
}
