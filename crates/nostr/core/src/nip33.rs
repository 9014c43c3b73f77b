//! NIP-33: Parameterized Replaceable Events
//!
//! **DEPRECATED:** This NIP has been renamed to "Addressable events" and moved to NIP-01.
//!
//! Events with kinds in the range 30000-39999 are identified by the
//! combination of (kind, pubkey, d tag value). For each combination only the
//! latest event is kept.
//!
//! ```json
//! ["d", "<identifier>"]
//! ```

use crate::nip01::Event;

/// Tag name for the d-identifier
pub const D_TAG: &str = "d";

/// Get the d-tag value of an event.
///
/// A missing `d` tag, or one without a value, is the empty identifier.
///
/// ```
/// use nostr::{Event, get_d_tag};
///
/// let event = Event {
///     id: "0".repeat(64),
///     pubkey: "0".repeat(64),
///     created_at: 0,
///     kind: 30023,
///     tags: vec![vec!["d".to_string(), "my-article".to_string()]],
///     content: String::new(),
///     sig: "0".repeat(128),
/// };
/// assert_eq!(get_d_tag(&event), "my-article");
/// ```
pub fn get_d_tag(event: &Event) -> String {
    event
        .find_tag(D_TAG)
        .and_then(|tag| tag.get(1))
        .cloned()
        .unwrap_or_default()
}
