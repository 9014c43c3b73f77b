//! NIP-09: Event Deletion Request
//!
//! A kind 5 event lists the ids of events its author wants removed in `e`
//! tags. Relays only honour the request for events signed by the same key.

use crate::nip01::Event;

/// Kind for deletion requests
pub const DELETION_REQUEST_KIND: u16 = 5;

/// Check if an event is a deletion request.
pub fn is_deletion_request(event: &Event) -> bool {
    event.kind == DELETION_REQUEST_KIND
}

/// Ids referenced by the `e` tags of a deletion request, in tag order.
pub fn get_deleted_event_ids(event: &Event) -> Vec<String> {
    event.tag_values("e").map(str::to_string).collect()
}
