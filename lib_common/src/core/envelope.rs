//! # Share Envelopes
//!
//! The JSON shapes exchanged with clients and carried by the queue.
//!
//! The relay treats every payload as opaque: peer frames are only checked for
//! JSON syntax and then re-broadcast byte-for-byte, and queue payloads are
//! embedded verbatim inside the `{ "source": "realtime", "payload": ... }`
//! wrapper. The typed `ShareEnvelope` / `SharedItem` structs exist for
//! producers (the publisher CLI, tests) that need to build well-formed events.
//!
//! Queue-origin frames are wrapped while peer-origin frames are not. Clients
//! rely on that asymmetry to tell the two sources apart, so it is kept as-is.

use serde::de::{Error as _, IgnoredAny};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::value::RawValue;
use serde_json::{Map, Value};

use crate::core::error::RelayError;

/// The `source` tag stamped on every queue-origin frame.
pub const REALTIME_SOURCE: &str = "realtime";

/// Identifier of a shared item.
///
/// Producers are not consistent about the type of `id`, so both JSON numbers
/// and strings holding an integer (`"7"`) are accepted. It is always written
/// back out as a number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct ItemId(pub i64);

impl<'de> Deserialize<'de> for ItemId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum RawId {
            Int(i64),
            Float(f64),
            Text(String),
        }

        match RawId::deserialize(deserializer)? {
            RawId::Int(value) => Ok(ItemId(value)),
            RawId::Float(value) if value.is_finite() && value.fract() == 0.0 => {
                Ok(ItemId(value as i64))
            }
            RawId::Float(value) => Err(D::Error::custom(format!(
                "item id {value} is not an integer"
            ))),
            RawId::Text(text) => text
                .trim()
                .parse::<i64>()
                .map(ItemId)
                .map_err(|_| D::Error::custom(format!("item id `{text}` is not numeric"))),
        }
    }
}

impl From<i64> for ItemId {
    fn from(value: i64) -> Self {
        ItemId(value)
    }
}

/// A shared item as produced by the item API.
///
/// Only `id` is required. Unknown fields are kept in `extra` so that a
/// round-trip through this type does not lose producer data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SharedItem {
    /// Item identifier.
    pub id: ItemId,
    /// Display title.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    /// Display description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Link or inline image reference.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Any other producer-supplied fields.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl SharedItem {
    /// Creates an item carrying only an identifier.
    pub fn new(id: impl Into<ItemId>) -> Self {
        Self {
            id: id.into(),
            title: None,
            description: None,
            url: None,
            extra: Map::new(),
        }
    }
}

/// The `action` discriminator of a client envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShareAction {
    /// A viewer shared an item with everyone else.
    ShareItem,
}

/// `{ "action": "share_item", "item": { ... } }`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShareEnvelope {
    /// What happened.
    pub action: ShareAction,
    /// The item it happened to.
    pub item: SharedItem,
}

impl ShareEnvelope {
    /// Builds a `share_item` envelope.
    pub fn share(item: SharedItem) -> Self {
        Self {
            action: ShareAction::ShareItem,
            item,
        }
    }

    /// Serializes the envelope to its compact wire form.
    pub fn to_json(&self) -> Result<String, RelayError> {
        Ok(serde_json::to_string(self)?)
    }
}

/// `{ "source": "realtime", "payload": <verbatim JSON> }`
#[derive(Serialize)]
struct RealtimeFrame<'a> {
    source: &'static str,
    payload: &'a RawValue,
}

/// Stand-in payload for queue messages that are not JSON.
#[derive(Serialize)]
struct RawText<'a> {
    raw: &'a str,
}

/// Wraps a queue payload for broadcast.
///
/// JSON payloads are embedded without re-encoding. Anything else is carried
/// as `{ "raw": text }`, with invalid UTF-8 sequences replaced by U+FFFD.
pub fn wrap_queue_payload(bytes: &[u8]) -> Result<String, RelayError> {
    let text = String::from_utf8_lossy(bytes);

    let payload: Box<RawValue> = match serde_json::from_str::<Box<RawValue>>(&text) {
        Ok(json) => json,
        Err(_) => serde_json::value::to_raw_value(&RawText { raw: &text })?,
    };

    let frame = RealtimeFrame {
        source: REALTIME_SOURCE,
        payload: &payload,
    };
    Ok(serde_json::to_string(&frame)?)
}

/// Checks that a peer frame is well-formed JSON without building a tree.
pub fn validate_peer_message(text: &str) -> Result<(), RelayError> {
    serde_json::from_str::<IgnoredAny>(text)?;
    Ok(())
}
