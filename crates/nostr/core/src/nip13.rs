//! NIP-13: Proof of Work
//!
//! Difficulty is the number of leading zero bits in the event id. The author
//! commits to a target difficulty in the third element of the `nonce` tag:
//!
//! ```json
//! ["nonce", "<counter>", "<target difficulty>"]
//! ```

use crate::nip01::Event;
use thiserror::Error;

/// Tag carrying the mining nonce and committed difficulty
pub const NONCE_TAG: &str = "nonce";

/// Errors that can occur during NIP-13 checks.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum Nip13Error {
    #[error("missing nonce tag")]
    MissingNonce,

    #[error("nonce tag has no valid target difficulty")]
    InvalidTarget,

    #[error("committed difficulty {committed} is below the minimum {required}")]
    TargetTooLow { committed: u32, required: u32 },

    #[error("id has {actual} leading zero bits, committed to {committed}")]
    InsufficientWork { actual: u32, committed: u32 },
}

/// Count leading zero bits of a hex string.
///
/// Stops at the first non-zero nibble; characters that are not hex count as
/// a non-zero nibble.
pub fn count_leading_zero_bits(hex_str: &str) -> u32 {
    let mut count = 0;
    for c in hex_str.chars() {
        let Some(nibble) = c.to_digit(16) else {
            break;
        };
        if nibble == 0 {
            count += 4;
        } else {
            count += nibble.leading_zeros() - 28;
            break;
        }
    }
    count
}

/// Committed target difficulty of the event's first `nonce` tag.
pub fn parse_nonce_tag(event: &Event) -> Result<u32, Nip13Error> {
    let tag = event.find_tag(NONCE_TAG).ok_or(Nip13Error::MissingNonce)?;
    tag.get(2)
        .and_then(|target| target.trim().parse::<u32>().ok())
        .ok_or(Nip13Error::InvalidTarget)
}

/// Check an event's proof of work against a relay minimum.
///
/// A minimum of zero disables the check, even when a nonce tag is present.
/// Otherwise the committed target must reach `min_difficulty` and the id must
/// carry at least the committed number of leading zero bits.
pub fn check_pow(event: &Event, min_difficulty: u32) -> Result<(), Nip13Error> {
    if min_difficulty == 0 {
        return Ok(());
    }

    let committed = parse_nonce_tag(event)?;
    if committed < min_difficulty {
        return Err(Nip13Error::TargetTooLow {
            committed,
            required: min_difficulty,
        });
    }

    let actual = count_leading_zero_bits(&event.id);
    if actual < committed {
        return Err(Nip13Error::InsufficientWork { actual, committed });
    }
    Ok(())
}
