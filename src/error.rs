//! Typed fault taxonomy. Transport faults (`drop`, `cut`) are never
//! represented here -- they are `History` entries, not errors.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DynamoError {
    #[error("vector clock regression at node {node}: {previous} -> {attempted}")]
    ClockRegression {
        node: String,
        previous: u64,
        attempted: u64,
    },

    #[error("unrecognized message delivered to {at}")]
    UnknownMessage { at: String },

    /// Merkle-tree variant; never raised since the Merkle tree itself is
    /// omitted here, kept for taxonomy parity with an anti-entropy layer.
    #[error("key {key} hashes outside tree range [{min}, {max})")]
    KeyOutOfRange { key: String, min: u128, max: u128 },
}
