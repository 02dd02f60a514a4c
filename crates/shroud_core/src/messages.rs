//! Wire message types.
//!
//! Three conversations share one mailbox payload type: peers exchange
//! masked blocks with each other, the function party issues numbered
//! requests, and peers answer with numbered data replies. Every variant is
//! a plain serde struct so any transport that can move bytes can carry the
//! protocol.

use serde::{Deserialize, Serialize};

use crate::matrix::Matrix;

pub type PeerId = String;

/// Ordered pair identifying one cross-block of the Gram matrix. The first
/// entry is always the Alice side of the exchange.
pub type PairingId = (PeerId, PeerId);

/// Peer-to-peer traffic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PeerMsg {
    /// Alice's masked block plus the scalar-scaled mask her counterpart
    /// needs to build the dense unmasker.
    AliceMasked {
        masked_data: Matrix,
        partial_unmasker: Matrix,
    },
    /// Bob's masked block.
    BobMasked { masked_data: Matrix },
    /// Ask the counterpart to resend its masked exchange.
    Request,
}

/// Request kinds the function party may schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReqKind {
    YourGram,
    NextPeerGram,
    Label,
    UserDef,
    Teardown,
}

/// Function party → peer request. `request_id` starts at 1 and increases by
/// one per answered request; the teardown request carries the id after the
/// last scheduled one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FpRequest {
    pub request_id: u64,
    pub kind: ReqKind,
    /// Opaque payload for user-defined requests.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spec: Option<serde_json::Value>,
}

impl FpRequest {
    pub fn new(request_id: u64, kind: ReqKind) -> Self {
        Self {
            request_id,
            kind,
            spec: None,
        }
    }
}

/// One fragment of a cross-block: a component matrix plus the unmasker the
/// aggregator multiplies into the pair's running product.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerGram {
    pub pairing_id: PairingId,
    pub component: Matrix,
    pub unmasker: Unmasker,
}

/// Unmasking factor attached to a fragment. The Alice-side fragment carries
/// the scalar `1/alpha`; the Bob-side fragment carries the dense
/// `alpha · (M_A · M_Bᵀ)` correction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Unmasker {
    Scalar(f64),
    Dense(Matrix),
}

impl Unmasker {
    /// Fold another unmasker into this one. Scalars distribute over dense
    /// matrices; two dense factors combine elementwise.
    pub fn product(self, other: &Unmasker) -> Unmasker {
        match (self, other) {
            (Unmasker::Scalar(a), Unmasker::Scalar(b)) => Unmasker::Scalar(a * b),
            (Unmasker::Scalar(a), Unmasker::Dense(m)) => Unmasker::Dense(m.scale(a)),
            (Unmasker::Dense(m), Unmasker::Scalar(b)) => Unmasker::Dense(m.scale(*b)),
            (Unmasker::Dense(a), Unmasker::Dense(b)) => Unmasker::Dense(a.mul_elementwise(b)),
        }
    }
}

/// Peer → function party reply body. The variant doubles as the fragment
/// label (`AliceGram` / `BobGram`) from the original masking roles.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ReplyBody {
    OwnGram(Matrix),
    AliceGram(PeerGram),
    BobGram(PeerGram),
    Label(Vec<f64>),
    UserDef(serde_json::Value),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerReply {
    pub request_id: u64,
    pub body: ReplyBody,
}

/// The single payload type the mailbox carries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WireMsg {
    Peer(PeerMsg),
    Request(FpRequest),
    Reply(PeerReply),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unmasker_product_folds_scalar_into_dense() {
        let dense = Unmasker::Dense(Matrix::new(1, 2, vec![2.0, 4.0]));
        let folded = dense.product(&Unmasker::Scalar(0.5));
        match folded {
            Unmasker::Dense(m) => assert_eq!(m.as_slice(), &[1.0, 2.0]),
            other => panic!("expected dense unmasker, got {other:?}"),
        }
    }

    #[test]
    fn wire_messages_survive_json() {
        let msg = WireMsg::Reply(PeerReply {
            request_id: 3,
            body: ReplyBody::AliceGram(PeerGram {
                pairing_id: ("a".into(), "b".into()),
                component: Matrix::new(1, 1, vec![7.5]),
                unmasker: Unmasker::Scalar(0.25),
            }),
        });
        let bytes = serde_json::to_vec(&msg).unwrap();
        let back: WireMsg = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(back, msg);
    }
}
