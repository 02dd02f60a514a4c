//! Protocol core for privacy-preserving joint Gram matrix computation.
//!
//! A set of mutually distrusting input peers each holds a row block of a
//! shared-schema data matrix. Peers exchange additively masked copies of
//! their blocks pairwise, then a single aggregator (the function party)
//! pulls Gram fragments from every peer over an at-least-once mailbox
//! conversation and assembles the full pairwise inner-product matrix
//! without ever seeing a raw row.
//!
//! The crate is transport-agnostic: both state machines only consume the
//! [`mailbox::Mailbox`] contract. An in-memory hub with fault injection is
//! provided for tests and single-process runs; `shroud_net` supplies the
//! TCP deployment.

pub mod config;
pub mod function_party;
pub mod mailbox;
pub mod masking;
pub mod matrix;
pub mod messages;
pub mod outlier;
pub mod peer;

use thiserror::Error;

/// Well-known participant id of the aggregator.
pub const FP_ID: &str = "function_party";

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("duplicate participant id `{0}`")]
    DuplicatePeerId(String),
    #[error("invalid mask sampling interval [{min}, {max}): lower bound must be positive and below the upper bound")]
    InvalidMaskInterval { min: f64, max: f64 },
    #[error("timeout threshold must be positive, got {0}s")]
    InvalidTimeout(f64),
    #[error("no gram fragment accumulated for pair ({0}, {1})")]
    MissingFragment(String, String),
    #[error("gram fragment for pair ({0}, {1}) is incomplete")]
    IncompleteFragment(String, String),
    #[error("transport: {0}")]
    Transport(String),
}

pub use config::ProtocolConfig;
pub use function_party::{FpHooks, FunctionParty};
pub use mailbox::{Mailbox, MemoryHub, MemoryMailbox};
pub use masking::{MaskedShare, Role};
pub use matrix::Matrix;
pub use messages::{
    FpRequest, PairingId, PeerGram, PeerId, PeerMsg, PeerReply, ReplyBody, ReqKind, Unmasker,
    WireMsg,
};
pub use peer::{PeerEngine, PeerHooks};
