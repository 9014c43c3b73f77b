//! NIP-26: Delegated Event Signing
//!
//! An event may carry a tag allowing another key (the delegator) to be
//! treated as its author:
//!
//! ```json
//! ["delegation", "<delegator pubkey>", "<conditions>", "<delegation token>"]
//! ```
//!
//! The conditions string is a `&`-separated list of clauses. Supported are
//! `kind=<n>`, `created_at<<t>` and `created_at><t>`. The token is a Schnorr
//! signature by the delegator over SHA-256 of
//! `nostr:delegation:<delegatee pubkey>:<conditions>`.
//!
//! Resolution is deliberately asymmetric: conditions the event does not meet
//! make the tag count as absent, while a bad token on an applicable tag is an
//! error.

use crate::nip01::{Event, is_lower_hex, sha256_hex, sign_hash, verify_signature};
use thiserror::Error;

/// Tag name for delegations
pub const DELEGATION_TAG: &str = "delegation";

/// Errors that can occur during NIP-26 operations.
#[derive(Debug, Error)]
pub enum Nip26Error {
    #[error("invalid delegation signature")]
    InvalidSignature,

    #[error("signing error: {0}")]
    Signing(String),
}

/// A single delegation clause.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Condition {
    /// `kind=<n>`
    Kind(u16),
    /// `created_at<<t>`
    CreatedBefore(u64),
    /// `created_at><t>`
    CreatedAfter(u64),
}

/// The parts of a delegation tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delegation {
    pub delegator: String,
    pub conditions: String,
    pub token: String,
}

impl Delegation {
    /// First delegation tag of the event with all four elements.
    pub fn from_event(event: &Event) -> Option<Self> {
        event
            .tags
            .iter()
            .find(|tag| tag.len() >= 4 && tag[0] == DELEGATION_TAG)
            .map(|tag| Self {
                delegator: tag[1].clone(),
                conditions: tag[2].clone(),
                token: tag[3].clone(),
            })
    }

    /// Whether the conditions cover this event.
    ///
    /// Any violated `created_at` clause makes the delegation inapplicable, and
    /// at least one `kind` clause must match.
    pub fn applies_to(&self, event: &Event) -> bool {
        let mut kind_matched = false;
        for condition in parse_conditions(&self.conditions) {
            match condition {
                Condition::Kind(kind) => {
                    if kind == event.kind {
                        kind_matched = true;
                    }
                }
                Condition::CreatedBefore(ts) => {
                    if event.created_at > ts {
                        return false;
                    }
                }
                Condition::CreatedAfter(ts) => {
                    if event.created_at < ts {
                        return false;
                    }
                }
            }
        }
        kind_matched
    }
}

/// Parse a conditions string. Clauses that are not understood are skipped.
pub fn parse_conditions(conditions: &str) -> Vec<Condition> {
    conditions
        .split('&')
        .filter_map(|clause| {
            if let Some(value) = clause.strip_prefix("kind=") {
                value.parse().ok().map(Condition::Kind)
            } else if let Some(value) = clause.strip_prefix("created_at<") {
                value.parse().ok().map(Condition::CreatedBefore)
            } else if let Some(value) = clause.strip_prefix("created_at>") {
                value.parse().ok().map(Condition::CreatedAfter)
            } else {
                None
            }
        })
        .collect()
}

/// The string whose hash the delegator signs.
pub fn delegation_message(delegatee_pubkey: &str, conditions: &str) -> String {
    format!("nostr:delegation:{}:{}", delegatee_pubkey, conditions)
}

/// Sign a delegation token for `delegatee_pubkey`.
pub fn create_delegation_token(
    delegator_secret_key: &[u8; 32],
    delegatee_pubkey: &str,
    conditions: &str,
) -> Result<String, Nip26Error> {
    let hash = sha256_hex(delegation_message(delegatee_pubkey, conditions).as_bytes());
    sign_hash(&hash, delegator_secret_key).map_err(|e| Nip26Error::Signing(e.to_string()))
}

/// Resolve the effective delegator of an event.
///
/// Returns `Ok(None)` when there is no usable delegation tag or its
/// conditions do not cover the event, and an error only when the conditions
/// apply but the token does not verify.
pub fn resolve_delegator(event: &Event) -> Result<Option<String>, Nip26Error> {
    let Some(delegation) = Delegation::from_event(event) else {
        return Ok(None);
    };

    if !delegation.applies_to(event) {
        return Ok(None);
    }

    if !is_lower_hex(&delegation.delegator, 64) || !is_lower_hex(&delegation.token, 128) {
        return Err(Nip26Error::InvalidSignature);
    }

    let hash = sha256_hex(delegation_message(&event.pubkey, &delegation.conditions).as_bytes());
    match verify_signature(&delegation.token, &hash, &delegation.delegator) {
        Ok(true) => Ok(Some(delegation.delegator)),
        _ => Err(Nip26Error::InvalidSignature),
    }
}
