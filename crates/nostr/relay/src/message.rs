//! Wire frames
//!
//! Client frames are JSON arrays tagged by their first element. They are
//! parsed once into [`ClientMessage`] so the connection handler can match
//! exhaustively; relay frames are rendered from [`RelayMessage`].

use crate::subscription::Filter;
use nostr::Event;
use serde_json::{Value, json};
use thiserror::Error;

/// Filter keys understood by the relay. Other keys without a `#` are dropped.
const FILTER_FIELDS: &[&str] = &["ids", "authors", "kinds", "since", "until", "limit", "search"];

/// A parsed client frame
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    /// `["EVENT", event]`
    Event(Box<Event>),
    /// `["REQ", subscription_id, filter, ...]`
    Req {
        subscription_id: String,
        filters: Vec<Filter>,
    },
    /// `["CLOSE", subscription_id]`
    Close(String),
    /// `["AUTH", event]`
    Auth(Box<Event>),
}

/// Why a frame could not be parsed. Answered with a NOTICE, or with an OK
/// frame when the event id could still be read.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MessageError {
    #[error("invalid JSON: {0}")]
    Json(String),

    #[error("message must be a non-empty array")]
    NotAnArray,

    #[error("message type must be a string")]
    MissingType,

    #[error("unknown message type: {0}")]
    UnknownType(String),

    #[error("{command} message must have {expected}")]
    Arity {
        command: &'static str,
        expected: &'static str,
    },

    #[error("subscription ID must be a string")]
    SubscriptionId,

    #[error("failed to parse event: {reason}")]
    Event { id: Option<String>, reason: String },

    #[error("failed to parse filter: {0}")]
    Filter(String),
}

impl MessageError {
    /// Text for the NOTICE or OK reason.
    pub fn reason(&self) -> String {
        format!("invalid: {}", self)
    }

    /// Id of the event that failed to parse, when it had a readable one.
    pub fn event_id(&self) -> Option<&str> {
        match self {
            Self::Event { id, .. } => id.as_deref(),
            _ => None,
        }
    }
}

impl ClientMessage {
    /// Parse one text frame
    pub fn parse(text: &str) -> Result<Self, MessageError> {
        let value: Value =
            serde_json::from_str(text).map_err(|e| MessageError::Json(e.to_string()))?;
        Self::from_value(value)
    }

    pub fn from_value(value: Value) -> Result<Self, MessageError> {
        let Value::Array(mut items) = value else {
            return Err(MessageError::NotAnArray);
        };
        if items.is_empty() {
            return Err(MessageError::NotAnArray);
        }

        let command = match items[0].as_str() {
            Some(c) => c.to_string(),
            None => return Err(MessageError::MissingType),
        };

        match command.as_str() {
            "EVENT" => {
                if items.len() != 2 {
                    return Err(MessageError::Arity {
                        command: "EVENT",
                        expected: "2 elements",
                    });
                }
                Ok(Self::Event(Box::new(parse_event(items.swap_remove(1))?)))
            }
            "AUTH" => {
                if items.len() != 2 {
                    return Err(MessageError::Arity {
                        command: "AUTH",
                        expected: "2 elements",
                    });
                }
                Ok(Self::Auth(Box::new(parse_event(items.swap_remove(1))?)))
            }
            "REQ" => {
                if items.len() < 3 {
                    return Err(MessageError::Arity {
                        command: "REQ",
                        expected: "at least 3 elements",
                    });
                }
                let subscription_id = subscription_id(&items[1])?;
                let filters = items
                    .drain(2..)
                    .map(parse_filter)
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(Self::Req {
                    subscription_id,
                    filters,
                })
            }
            "CLOSE" => {
                if items.len() != 2 {
                    return Err(MessageError::Arity {
                        command: "CLOSE",
                        expected: "2 elements",
                    });
                }
                Ok(Self::Close(subscription_id(&items[1])?))
            }
            _ => Err(MessageError::UnknownType(command)),
        }
    }
}

fn subscription_id(value: &Value) -> Result<String, MessageError> {
    value
        .as_str()
        .map(str::to_string)
        .ok_or(MessageError::SubscriptionId)
}

fn parse_event(value: Value) -> Result<Event, MessageError> {
    let id = value
        .get("id")
        .and_then(Value::as_str)
        .map(str::to_string);
    serde_json::from_value(value).map_err(|e| MessageError::Event {
        id,
        reason: e.to_string(),
    })
}

fn parse_filter(mut value: Value) -> Result<Filter, MessageError> {
    if let Value::Object(ref mut fields) = value {
        fields.retain(|key, _| key.starts_with('#') || FILTER_FIELDS.contains(&key.as_str()));
    }
    serde_json::from_value(value).map_err(|e| MessageError::Filter(e.to_string()))
}

/// A relay frame
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RelayMessage<'a> {
    /// `["EVENT", subscription_id, event]`
    Event {
        subscription_id: &'a str,
        event: &'a Event,
    },
    /// `["EOSE", subscription_id]`
    Eose(&'a str),
    /// `["OK", event_id, accepted, reason]`
    Ok {
        event_id: &'a str,
        accepted: bool,
        reason: &'a str,
    },
    /// `["NOTICE", message]`
    Notice(&'a str),
    /// `["AUTH", challenge]`
    Auth(&'a str),
}

impl RelayMessage<'_> {
    pub fn to_value(&self) -> Value {
        match *self {
            Self::Event {
                subscription_id,
                event,
            } => json!(["EVENT", subscription_id, event]),
            Self::Eose(subscription_id) => json!(["EOSE", subscription_id]),
            Self::Ok {
                event_id,
                accepted,
                reason,
            } => json!(["OK", event_id, accepted, reason]),
            Self::Notice(message) => json!(["NOTICE", message]),
            Self::Auth(challenge) => json!(["AUTH", challenge]),
        }
    }

    /// Compact JSON text for the socket
    pub fn to_json(&self) -> String {
        self.to_value().to_string()
    }
}
