//! # Relay Processing Errors

use thiserror::Error;

/// Failures raised while turning an inbound frame into a broadcast.
///
/// None of these ever reach a client. Peer frames that fail are logged and
/// dropped; queue deliveries that fail are negatively acknowledged.
#[derive(Debug, Error)]
pub enum RelayError {
    /// The frame is not syntactically valid JSON, or could not be encoded.
    #[error("malformed JSON: {0}")]
    Json(#[from] serde_json::Error),
}
