//! NIP-40: Expiration Timestamp
//!
//! ```json
//! ["expiration", "<unix timestamp in seconds>"]
//! ```
//!
//! Relays should not serve an event once its expiration has passed.

use crate::nip01::Event;

/// Tag name for expiration
pub const EXPIRATION_TAG: &str = "expiration";

/// Expiration timestamp of an event, if it carries a parseable one.
pub fn get_expiration(event: &Event) -> Option<u64> {
    event
        .find_tag(EXPIRATION_TAG)
        .and_then(|tag| tag.get(1))
        .and_then(|value| value.trim().parse().ok())
}

/// Whether the event has expired at `now`.
pub fn is_expired(event: &Event, now: u64) -> bool {
    get_expiration(event).is_some_and(|expires_at| expires_at <= now)
}
