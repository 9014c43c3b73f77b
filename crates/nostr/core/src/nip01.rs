//! NIP-01: Basic protocol flow description.
//!
//! This module implements the core Nostr event structure and operations:
//! - Event structure (id, pubkey, created_at, kind, tags, content, sig)
//! - Canonical serialization for hashing
//! - Event signing with Schnorr signatures (requires `full` feature)
//! - Id and signature verification (requires `full` feature)
//! - Kind classification (regular, replaceable, ephemeral, addressable)

#[cfg(feature = "full")]
use bitcoin::hashes::{Hash, sha256};
#[cfg(feature = "full")]
use bitcoin::key::Secp256k1;
#[cfg(feature = "full")]
use bitcoin::secp256k1::{Message, SecretKey, XOnlyPublicKey, schnorr};
#[cfg(feature = "full")]
use rand::RngCore;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors that can occur during NIP-01 operations.
#[derive(Debug, Error)]
pub enum Nip01Error {
    #[error("invalid event: {0}")]
    InvalidEvent(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("signing error: {0}")]
    Signing(String),

    #[error("verification error: {0}")]
    Verification(String),

    #[error("invalid hex: {0}")]
    InvalidHex(String),

    #[error("invalid public key: {0}")]
    InvalidPublicKey(String),

    #[error("invalid signature: {0}")]
    InvalidSignature(String),
}

/// A signed Nostr event.
///
/// Tags are arrays of strings only; anything else is rejected when the event
/// is deserialized.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    /// 32-bytes lowercase hex-encoded sha256 of the serialized event data
    pub id: String,
    /// 32-bytes lowercase hex-encoded public key of the event creator
    pub pubkey: String,
    /// Unix timestamp in seconds
    pub created_at: u64,
    /// Event kind (integer between 0 and 65535)
    pub kind: u16,
    /// Array of arrays of strings (tags)
    pub tags: Vec<Vec<String>>,
    /// Arbitrary string content
    pub content: String,
    /// 64-bytes lowercase hex signature
    pub sig: String,
}

impl Event {
    /// First tag whose name is `name`.
    pub fn find_tag(&self, name: &str) -> Option<&[String]> {
        self.tags
            .iter()
            .find(|tag| tag.first().is_some_and(|n| n == name))
            .map(|tag| tag.as_slice())
    }

    /// Second element of every tag named `name`.
    pub fn tag_values<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.tags
            .iter()
            .filter(move |tag| tag.len() >= 2 && tag[0] == name)
            .map(|tag| tag[1].as_str())
    }

    /// The unsigned part of the event, i.e. everything covered by the id.
    pub fn to_unsigned(&self) -> UnsignedEvent {
        UnsignedEvent {
            pubkey: self.pubkey.clone(),
            created_at: self.created_at,
            kind: self.kind,
            tags: self.tags.clone(),
            content: self.content.clone(),
        }
    }
}

/// An unsigned event (before signing).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnsignedEvent {
    /// 32-bytes lowercase hex-encoded public key of the event creator
    pub pubkey: String,
    /// Unix timestamp in seconds
    pub created_at: u64,
    /// Event kind
    pub kind: u16,
    /// Array of arrays of strings (tags)
    pub tags: Vec<Vec<String>>,
    /// Arbitrary string content
    pub content: String,
}

/// A template for creating events (without pubkey, which comes from the signing key).
///
/// ```
/// use nostr::EventTemplate;
///
/// let template = EventTemplate {
///     created_at: 1_700_000_000,
///     kind: 1,
///     tags: vec![vec!["t".to_string(), "news".to_string()]],
///     content: "Hello Nostr!".to_string(),
/// };
/// assert_eq!(template.kind, 1);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventTemplate {
    /// Unix timestamp in seconds
    pub created_at: u64,
    /// Event kind
    pub kind: u16,
    /// Array of arrays of strings (tags)
    pub tags: Vec<Vec<String>>,
    /// Arbitrary string content
    pub content: String,
}

/// Event kind classification according to NIP-01.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KindClassification {
    /// Events expected to be stored by relays
    Regular,
    /// Only latest event per pubkey+kind is stored
    Replaceable,
    /// Not expected to be stored by relays
    Ephemeral,
    /// Only latest event per pubkey+kind+d-tag is stored
    Addressable,
}

// Standard event kinds
pub const KIND_METADATA: u16 = 0;
pub const KIND_SHORT_TEXT_NOTE: u16 = 1;
pub const KIND_RECOMMEND_RELAY: u16 = 2;
pub const KIND_CONTACTS: u16 = 3;
pub const KIND_ENCRYPTED_DIRECT_MESSAGE: u16 = 4;
pub const KIND_REPOST: u16 = 6;
pub const KIND_REACTION: u16 = 7;
pub const KIND_CHANNEL_CREATION: u16 = 40;
pub const KIND_REPORT: u16 = 1984;
pub const KIND_ZAP_RECEIPT: u16 = 9735;
pub const KIND_LONG_FORM: u16 = 30023;

/// Returns true when `s` is exactly `len` lowercase hex characters.
pub fn is_lower_hex(s: &str, len: usize) -> bool {
    s.len() == len && s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

/// Generate a random 32-byte secret key.
#[cfg(feature = "full")]
pub fn generate_secret_key() -> [u8; 32] {
    let mut key = [0u8; 32];
    rand::rng().fill_bytes(&mut key);
    key
}

/// Get the public key (x-only, 32 bytes) from a secret key.
#[cfg(feature = "full")]
pub fn get_public_key(secret_key: &[u8; 32]) -> Result<[u8; 32], Nip01Error> {
    let secp = Secp256k1::new();
    let sk = SecretKey::from_slice(secret_key)
        .map_err(|e| Nip01Error::InvalidPublicKey(e.to_string()))?;
    let (xonly, _parity) = sk.x_only_public_key(&secp);
    Ok(xonly.serialize())
}

/// Get the public key as a hex string from a secret key.
#[cfg(feature = "full")]
pub fn get_public_key_hex(secret_key: &[u8; 32]) -> Result<String, Nip01Error> {
    Ok(hex::encode(get_public_key(secret_key)?))
}

/// Serialize an unsigned event for hashing.
///
/// Format: `[0, pubkey, created_at, kind, tags, content]` as compact JSON.
/// These exact bytes are hashed, so the output must match every other
/// implementation byte for byte.
pub fn serialize_event(event: &UnsignedEvent) -> Result<String, Nip01Error> {
    if !validate_unsigned_event(event) {
        return Err(Nip01Error::InvalidEvent(
            "can't serialize event with wrong or missing properties".to_string(),
        ));
    }

    serde_json::to_string(&(
        0,
        &event.pubkey,
        event.created_at,
        event.kind,
        &event.tags,
        &event.content,
    ))
    .map_err(|e| Nip01Error::Serialization(e.to_string()))
}

/// SHA-256 of `data`, lowercase hex.
#[cfg(feature = "full")]
pub fn sha256_hex(data: &[u8]) -> String {
    let hash = sha256::Hash::hash(data);
    hex::encode(hash.as_byte_array())
}

/// Get the event hash (id) from an unsigned event.
#[cfg(feature = "full")]
pub fn get_event_hash(event: &UnsignedEvent) -> Result<String, Nip01Error> {
    let serialized = serialize_event(event)?;
    Ok(sha256_hex(serialized.as_bytes()))
}

/// Validate an unsigned event structure.
pub fn validate_unsigned_event(event: &UnsignedEvent) -> bool {
    is_lower_hex(&event.pubkey, 64)
}

/// Validate a signed event structure (not including id or signature verification).
pub fn validate_event(event: &Event) -> Result<(), Nip01Error> {
    if !is_lower_hex(&event.id, 64) {
        return Err(Nip01Error::InvalidEvent(
            "id must be 64 lowercase hex characters".to_string(),
        ));
    }
    if !is_lower_hex(&event.pubkey, 64) {
        return Err(Nip01Error::InvalidEvent(
            "pubkey must be 64 lowercase hex characters".to_string(),
        ));
    }
    if !is_lower_hex(&event.sig, 128) {
        return Err(Nip01Error::InvalidEvent(
            "sig must be 128 lowercase hex characters".to_string(),
        ));
    }
    Ok(())
}

/// Sign an event template with a secret key, producing a complete signed event.
#[cfg(feature = "full")]
pub fn finalize_event(
    template: &EventTemplate,
    secret_key: &[u8; 32],
) -> Result<Event, Nip01Error> {
    let pubkey = get_public_key_hex(secret_key).map_err(|e| Nip01Error::Signing(e.to_string()))?;

    let unsigned = UnsignedEvent {
        pubkey: pubkey.clone(),
        created_at: template.created_at,
        kind: template.kind,
        tags: template.tags.clone(),
        content: template.content.clone(),
    };

    let id = get_event_hash(&unsigned)?;
    let sig = sign_hash(&id, secret_key)?;

    Ok(Event {
        id,
        pubkey,
        created_at: template.created_at,
        kind: template.kind,
        tags: template.tags.clone(),
        content: template.content.clone(),
        sig,
    })
}

/// Schnorr-sign a 32-byte hex digest, returning the hex signature.
#[cfg(feature = "full")]
pub fn sign_hash(hash_hex: &str, secret_key: &[u8; 32]) -> Result<String, Nip01Error> {
    let secp = Secp256k1::new();
    let sk = SecretKey::from_slice(secret_key).map_err(|e| Nip01Error::Signing(e.to_string()))?;
    let digest =
        hex::decode(hash_hex).map_err(|e| Nip01Error::Signing(format!("invalid hash hex: {}", e)))?;
    let message = Message::from_digest_slice(&digest)
        .map_err(|e| Nip01Error::Signing(format!("invalid message: {}", e)))?;

    let keypair = bitcoin::secp256k1::Keypair::from_secret_key(&secp, &sk);
    let sig = secp.sign_schnorr_no_aux_rand(&message, &keypair);
    Ok(hex::encode(sig.serialize()))
}

/// Verify a hex Schnorr signature over a hex 32-byte digest.
///
/// Returns `Ok(false)` when the signature simply does not verify, and an
/// error when one of the inputs cannot even be decoded.
#[cfg(feature = "full")]
pub fn verify_signature(sig_hex: &str, hash_hex: &str, pubkey_hex: &str) -> Result<bool, Nip01Error> {
    let secp = Secp256k1::verification_only();

    let digest = hex::decode(hash_hex)
        .map_err(|e| Nip01Error::Verification(format!("invalid hash hex: {}", e)))?;
    let message = Message::from_digest_slice(&digest)
        .map_err(|e| Nip01Error::Verification(format!("invalid message: {}", e)))?;

    let sig_bytes = hex::decode(sig_hex)
        .map_err(|e| Nip01Error::InvalidSignature(format!("invalid sig hex: {}", e)))?;
    let sig = schnorr::Signature::from_slice(&sig_bytes)
        .map_err(|e| Nip01Error::InvalidSignature(e.to_string()))?;

    let pubkey_bytes = hex::decode(pubkey_hex)
        .map_err(|e| Nip01Error::InvalidPublicKey(format!("invalid pubkey hex: {}", e)))?;
    let pubkey = XOnlyPublicKey::from_slice(&pubkey_bytes)
        .map_err(|e| Nip01Error::InvalidPublicKey(e.to_string()))?;

    Ok(secp.verify_schnorr(&sig, &message, &pubkey).is_ok())
}

/// Verify an event's structure, id and signature.
#[cfg(feature = "full")]
pub fn verify_event(event: &Event) -> Result<bool, Nip01Error> {
    if validate_event(event).is_err() {
        return Ok(false);
    }

    let computed_id = get_event_hash(&event.to_unsigned())?;
    if computed_id != event.id {
        return Ok(false);
    }

    verify_signature(&event.sig, &event.id, &event.pubkey)
}

/// Classify an event kind according to NIP-01 rules.
///
/// Kind 2 (recommend relay) is treated as replaceable alongside metadata and
/// contacts. Kinds at or above 40000 have no defined treatment and are stored
/// as regular events.
pub fn classify_kind(kind: u16) -> KindClassification {
    match kind {
        0 | 2 | 3 | 10000..=19999 => KindClassification::Replaceable,
        20000..=29999 => KindClassification::Ephemeral,
        30000..=39999 => KindClassification::Addressable,
        _ => KindClassification::Regular,
    }
}

/// Check if a kind is regular.
pub fn is_regular_kind(kind: u16) -> bool {
    matches!(classify_kind(kind), KindClassification::Regular)
}

/// Check if a kind is replaceable.
pub fn is_replaceable_kind(kind: u16) -> bool {
    matches!(classify_kind(kind), KindClassification::Replaceable)
}

/// Check if a kind is ephemeral.
pub fn is_ephemeral_kind(kind: u16) -> bool {
    matches!(classify_kind(kind), KindClassification::Ephemeral)
}

/// Check if a kind is addressable.
pub fn is_addressable_kind(kind: u16) -> bool {
    matches!(classify_kind(kind), KindClassification::Addressable)
}
