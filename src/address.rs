// src/address.rs
// Checksummed wallet addresses and canonical room ids

use sha3::{Digest, Keccak256};

use crate::error::{Error, Result};

/// Participant separator inside a room id. A string containing this is
/// assumed to be a room id rather than a wallet address.
pub const ROOM_ID_SEPARATOR: &str = "-";

pub fn keccak256(data: &[u8]) -> [u8; 32] {
    Keccak256::digest(data).into()
}

/// EIP-55 mixed-case checksum encoding of a 20-byte address.
pub fn to_checksum_address(address: &[u8]) -> String {
    let lower = hex::encode(address);
    let hash = keccak256(lower.as_bytes());

    let mut result = String::from("0x");
    for (i, ch) in lower.chars().enumerate() {
        let byte = hash[i / 2];
        let nibble = if i % 2 == 0 { byte >> 4 } else { byte & 0x0f };

        if ch.is_ascii_digit() {
            result.push(ch);
        } else if nibble >= 8 {
            result.push(ch.to_ascii_uppercase());
        } else {
            result.push(ch);
        }
    }

    result
}

/// Derive the account address of an uncompressed secp256k1 public key
/// (64-byte form, tag byte already stripped).
pub fn address_from_public_key(pubkey64: &[u8]) -> String {
    let hash = keccak256(pubkey64);
    to_checksum_address(&hash[12..])
}

/// Syntactic validation: `0x` + 40 hex chars. Mixed-case input must carry
/// a correct EIP-55 checksum; all-lower or all-upper input is accepted.
pub fn is_valid_address(address: &str) -> bool {
    let trimmed = address.trim();
    if !trimmed.starts_with("0x") || trimmed.len() != 42 {
        return false;
    }

    let hex_part = &trimmed[2..];
    if !hex_part.chars().all(|c| c.is_ascii_hexdigit()) {
        return false;
    }

    let lower = hex_part.to_lowercase();
    if hex_part == lower || hex_part == hex_part.to_uppercase() {
        return true;
    }

    let bytes = match hex::decode(&lower) {
        Ok(b) => b,
        Err(_) => return false,
    };
    to_checksum_address(&bytes).get(2..) == Some(hex_part)
}

/// Normalize a wallet address to its checksummed form, rejecting
/// malformed input synchronously.
pub fn checksum(address: &str) -> Result<String> {
    if !is_valid_address(address) {
        return Err(Error::InvalidAddress(address.to_string()));
    }
    let bytes = hex::decode(&address.trim()[2..].to_lowercase())
        .map_err(|e| Error::InvalidAddress(e.to_string()))?;
    Ok(to_checksum_address(&bytes))
}

/// Canonical room id: checksummed participant addresses, sorted
/// lexicographically, joined with `-`. Commutative by construction.
pub fn room_id(participants: &[&str]) -> Result<String> {
    let mut checksummed = participants
        .iter()
        .map(|p| checksum(p))
        .collect::<Result<Vec<_>>>()?;
    checksummed.sort();
    Ok(checksummed.join(ROOM_ID_SEPARATOR))
}

/// Whether a conversation identifier is a room id (as opposed to a bare
/// wallet address).
pub fn is_room_id(id: &str) -> bool {
    id.contains(ROOM_ID_SEPARATOR)
}

/// The wallet addresses participating in a room.
pub fn room_participants(room_id: &str) -> Vec<String> {
    room_id.split(ROOM_ID_SEPARATOR).map(String::from).collect()
}

/// The participant that is not `own_address`, for pairwise rooms.
pub fn room_counterparty(room_id: &str, own_address: &str) -> Option<String> {
    room_participants(room_id)
        .into_iter()
        .find(|p| p != own_address)
}
