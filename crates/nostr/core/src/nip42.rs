//! NIP-42: Authentication of Clients to Relays
//!
//! The relay sends `["AUTH", <challenge>]`; the client answers with
//! `["AUTH", <signed event>]` where the event is kind 22242 and carries the
//! challenge and the relay URL as tags:
//!
//! ```json
//! {
//!   "kind": 22242,
//!   "tags": [
//!     ["relay", "wss://relay.example.com/"],
//!     ["challenge", "challengestringhere"]
//!   ]
//! }
//! ```

use crate::nip01::{Event, verify_event};
use thiserror::Error;

/// Event kind for authentication
pub const AUTH_KIND: u16 = 22242;

/// Tag name for the challenge string
pub const CHALLENGE_TAG: &str = "challenge";

/// Tag name for the relay URL
pub const RELAY_TAG: &str = "relay";

/// Errors that can occur during NIP-42 validation.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum Nip42Error {
    #[error("not an auth event (kind {0})")]
    WrongKind(u16),

    #[error("missing challenge tag")]
    MissingChallenge,

    #[error("challenge mismatch")]
    ChallengeMismatch,

    #[error("relay tag mismatch")]
    RelayMismatch,

    #[error("invalid id or signature")]
    InvalidSignature,
}

/// Build the tags for an auth event.
pub fn create_auth_event_tags(relay_url: &str, challenge: &str) -> Vec<Vec<String>> {
    vec![
        vec![RELAY_TAG.to_string(), relay_url.to_string()],
        vec![CHALLENGE_TAG.to_string(), challenge.to_string()],
    ]
}

/// Normalize a relay URL for comparison: lowercase, no trailing slash.
pub fn normalize_relay_url(url: &str) -> String {
    url.trim().trim_end_matches('/').to_lowercase()
}

/// Validate an auth event against the outstanding challenge.
///
/// When `relay_url` is given the event must also name this relay.
pub fn validate_auth_event(
    event: &Event,
    challenge: &str,
    relay_url: Option<&str>,
) -> Result<(), Nip42Error> {
    if event.kind != AUTH_KIND {
        return Err(Nip42Error::WrongKind(event.kind));
    }

    let tagged = event
        .find_tag(CHALLENGE_TAG)
        .and_then(|tag| tag.get(1))
        .ok_or(Nip42Error::MissingChallenge)?;
    if tagged != challenge {
        return Err(Nip42Error::ChallengeMismatch);
    }

    if let Some(expected) = relay_url {
        let named = event.find_tag(RELAY_TAG).and_then(|tag| tag.get(1));
        if named.map(|url| normalize_relay_url(url)) != Some(normalize_relay_url(expected)) {
            return Err(Nip42Error::RelayMismatch);
        }
    }

    match verify_event(event) {
        Ok(true) => Ok(()),
        _ => Err(Nip42Error::InvalidSignature),
    }
}
