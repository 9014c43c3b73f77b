//! Nostr protocol primitives used by the relay.
//!
//! This crate provides:
//! - NIP-01: Basic protocol (events, canonical serialization, signing, verification)
//! - NIP-09: Event Deletion Request
//! - NIP-13: Proof of Work
//! - NIP-26: Delegated Event Signing
//! - NIP-33: Addressable events (`d` tag lookup)
//! - NIP-40: Expiration Timestamp
//! - NIP-42: Authentication of Clients to Relays
//!
//! # Features
//!
//! - `full` (default): Full crypto support including key generation, signing and verification
//! - `minimal`: Just Event type, serialization and tag helpers

mod nip01;
mod nip09;
mod nip13;
#[cfg(feature = "full")]
mod nip26;
mod nip33;
mod nip40;
#[cfg(feature = "full")]
mod nip42;


// NIP-01: Basic protocol (Event type always available)
pub use nip01::{
    Event, EventTemplate, KIND_CHANNEL_CREATION, KIND_CONTACTS, KIND_ENCRYPTED_DIRECT_MESSAGE,
    KIND_LONG_FORM, KIND_METADATA, KIND_REACTION, KIND_RECOMMEND_RELAY, KIND_REPORT, KIND_REPOST,
    KIND_SHORT_TEXT_NOTE, KIND_ZAP_RECEIPT, KindClassification, Nip01Error, UnsignedEvent,
    classify_kind, is_addressable_kind, is_ephemeral_kind, is_lower_hex, is_regular_kind,
    is_replaceable_kind, serialize_event, validate_event, validate_unsigned_event,
};

// NIP-01: Crypto functions (require full feature)
#[cfg(feature = "full")]
pub use nip01::{
    finalize_event, generate_secret_key, get_event_hash, get_public_key, get_public_key_hex,
    sha256_hex, sign_hash, verify_event, verify_signature,
};

// NIP-09: Event Deletion Request
pub use nip09::{DELETION_REQUEST_KIND, get_deleted_event_ids, is_deletion_request};

// NIP-13: Proof of Work
pub use nip13::{Nip13Error, NONCE_TAG, check_pow, count_leading_zero_bits, parse_nonce_tag};

// NIP-26: Delegated Event Signing
#[cfg(feature = "full")]
pub use nip26::{
    Condition, DELEGATION_TAG, Delegation, Nip26Error, create_delegation_token,
    delegation_message, parse_conditions, resolve_delegator,
};

// NIP-33: Addressable events
pub use nip33::{D_TAG, get_d_tag};

// NIP-40: Expiration Timestamp
pub use nip40::{EXPIRATION_TAG, get_expiration, is_expired};

// NIP-42: Authentication of Clients to Relays
#[cfg(feature = "full")]
pub use nip42::{
    AUTH_KIND, CHALLENGE_TAG, Nip42Error, RELAY_TAG, create_auth_event_tags, normalize_relay_url,
    validate_auth_event,
};
