//! Error types surfaced by the node API. Protocol-level staleness (old
//! prepares, duplicate accepted messages, out-of-sequence traffic) is
//! absorbed inside the Paxos layer and never raised as an error.

use thiserror::Error;

/// Why `propose_value` refused a submission.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProposalError {
    /// The caller's sequence number does not match the open instance.
    /// Carries the current sequence number so the client can retry.
    #[error("sequence number mismatch, current sequence is {0}")]
    SequenceMismatch(u64),

    /// Another value is already in flight for the open instance.
    #[error("a value has already been proposed for this instance")]
    ValueAlreadyProposed,
}

/// Why an inbound frame stack was dropped.
#[derive(Error, Debug)]
pub enum MessageError {
    /// The frame stack could not be decoded.
    #[error("malformed message: {0}")]
    Malformed(String),

    /// The header decoded but named a type nothing dispatches on.
    #[error("unknown message type `{0}`")]
    UnknownType(String),
}

/// Store adapter failures.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("store io: {0}")]
    Io(#[from] std::io::Error),

    #[error("store encoding: {0}")]
    Encoding(#[from] serde_json::Error),
}
