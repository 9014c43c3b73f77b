//! Event validation pipeline
//!
//! Every incoming event runs through the same ordered checks:
//! structure, time window, proof of work, delegation, then id and signature.
//! The first failure wins and is reported as a [`ValidationError`] whose
//! [`reason`](ValidationError::reason) is sent back in the OK frame.

use crate::config::Limits;
use nostr::{
    Event, KindClassification, check_pow, classify_kind, get_event_hash, get_expiration,
    resolve_delegator, validate_event, verify_signature,
};
use thiserror::Error;

/// Why an event was rejected.
///
/// A delegation whose conditions do not cover the event is not an error:
/// the event is accepted with no delegator.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("{0}")]
    Structural(String),

    #[error("event id does not match the event content")]
    IdMismatch,

    #[error("signature verification failed")]
    Signature,

    #[error("created_at {created_at} is outside the accepted range [{lower}, {upper}]")]
    TimeRange { created_at: u64, lower: i64, upper: i64 },

    #[error("proof of work: {0}")]
    Pow(String),

    #[error("delegation token does not verify")]
    DelegationSignature,
}

impl ValidationError {
    /// Reason string for an OK frame.
    pub fn reason(&self) -> String {
        format!("invalid: {}", self)
    }
}

/// Accepted window for `created_at`, as signed offsets from now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeWindow {
    pub lower: i64,
    pub upper: i64,
}

impl TimeWindow {
    /// Absolute bounds at `now`.
    pub fn bounds(&self, now: u64) -> (i64, i64) {
        let now = i64::try_from(now).unwrap_or(i64::MAX);
        (now.saturating_add(self.lower), now.saturating_add(self.upper))
    }
}

/// Settings the pipeline checks against.
#[derive(Debug, Clone)]
pub struct ValidationPolicy {
    pub window: TimeWindow,
    pub min_pow_difficulty: u32,
    pub max_event_tags: usize,
    pub max_content_length: usize,
}

impl From<&Limits> for ValidationPolicy {
    fn from(limits: &Limits) -> Self {
        Self {
            window: TimeWindow {
                lower: limits.created_at_lower,
                upper: limits.created_at_upper,
            },
            min_pow_difficulty: limits.min_pow_difficulty,
            max_event_tags: limits.max_event_tags,
            max_content_length: limits.max_content_length,
        }
    }
}

impl Default for ValidationPolicy {
    fn default() -> Self {
        Self::from(&Limits::default())
    }
}

/// A validated event together with what the relay derived from it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventRecord {
    pub event: Event,
    /// Delegator pubkey from a verified delegation tag.
    pub delegator: Option<String>,
    /// From the `expiration` tag.
    pub expires_at: Option<u64>,
}

impl EventRecord {
    pub fn new(event: Event, delegator: Option<String>) -> Self {
        let expires_at = get_expiration(&event);
        Self {
            event,
            delegator,
            expires_at,
        }
    }

    pub fn is_expired(&self, now: u64) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }

    pub fn classification(&self) -> KindClassification {
        classify_kind(self.event.kind)
    }
}

/// Field shape and relay size limits.
pub fn check_structure(event: &Event, policy: &ValidationPolicy) -> Result<(), ValidationError> {
    validate_event(event).map_err(|e| ValidationError::Structural(e.to_string()))?;

    if event.tags.len() > policy.max_event_tags {
        return Err(ValidationError::Structural(format!(
            "too many tags: {} (max {})",
            event.tags.len(),
            policy.max_event_tags
        )));
    }
    if event.content.len() > policy.max_content_length {
        return Err(ValidationError::Structural(format!(
            "content too long: {} bytes (max {})",
            event.content.len(),
            policy.max_content_length
        )));
    }
    Ok(())
}

/// `created_at` must lie inside the window around `now`, bounds inclusive.
pub fn check_time_window(event: &Event, now: u64, window: TimeWindow) -> Result<(), ValidationError> {
    let (lower, upper) = window.bounds(now);
    let created_at = i64::try_from(event.created_at).unwrap_or(i64::MAX);
    if created_at < lower || created_at > upper {
        return Err(ValidationError::TimeRange {
            created_at: event.created_at,
            lower,
            upper,
        });
    }
    Ok(())
}

/// Recompute the id and verify the signature over it.
pub fn check_id_and_signature(event: &Event) -> Result<(), ValidationError> {
    let computed = get_event_hash(&event.to_unsigned())
        .map_err(|e| ValidationError::Structural(e.to_string()))?;
    if computed != event.id {
        return Err(ValidationError::IdMismatch);
    }

    match verify_signature(&event.sig, &event.id, &event.pubkey) {
        Ok(true) => Ok(()),
        _ => Err(ValidationError::Signature),
    }
}

/// Run the full pipeline and derive the stored record.
pub fn validate(
    event: Event,
    policy: &ValidationPolicy,
    now: u64,
) -> Result<EventRecord, ValidationError> {
    check_structure(&event, policy)?;
    check_time_window(&event, now, policy.window)?;
    check_pow(&event, policy.min_pow_difficulty).map_err(|e| ValidationError::Pow(e.to_string()))?;
    let delegator = resolve_delegator(&event).map_err(|_| ValidationError::DelegationSignature)?;
    check_id_and_signature(&event)?;

    Ok(EventRecord::new(event, delegator))
}
