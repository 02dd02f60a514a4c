//! Masking algebra.
//!
//! Each peer hides its row block `D` behind an additive mask `M` and a
//! multiplicative scalar `alpha`, both sampled uniform in a strictly
//! positive interval. For an ordered pair the lexicographically smaller id
//! acts as Alice and ships `(D - M, alpha·M)`; the larger acts as Bob and
//! ships only `D - M`. Combining the two resulting fragments cancels every
//! mask term and leaves the exact cross-block `D_A · D_Bᵀ`, as exercised by
//! the cancellation test at the bottom of this module.

use rand::Rng;

use crate::matrix::Matrix;
use crate::messages::{PeerMsg, Unmasker};
use crate::ProtocolError;

/// Side a peer takes in one ordered pairing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Alice,
    Bob,
}

impl Role {
    /// Role of `own` towards `peer`: Alice iff `own < peer` under the total
    /// order on identifier strings. Equal ids are a setup error.
    pub fn between(own: &str, peer: &str) -> Result<Role, ProtocolError> {
        match own.cmp(peer) {
            std::cmp::Ordering::Less => Ok(Role::Alice),
            std::cmp::Ordering::Greater => Ok(Role::Bob),
            std::cmp::Ordering::Equal => Err(ProtocolError::DuplicatePeerId(own.to_string())),
        }
    }
}

/// A peer's masked view of its own row block, fixed for the whole run.
#[derive(Debug, Clone)]
pub struct MaskedShare {
    data: Matrix,
    mask: Matrix,
    alpha: f64,
    pub own_gram: Matrix,
    pub masked_data: Matrix,
    pub partial_unmasker: Matrix,
}

impl MaskedShare {
    /// Sample mask and scalar for `data` from `[rand_min, rand_max)`. The
    /// caller must have validated the interval (`rand_min > 0`).
    pub fn sample<R: Rng + ?Sized>(data: Matrix, rand_min: f64, rand_max: f64, rng: &mut R) -> Self {
        let (rows, cols) = data.shape();
        let mask = Matrix::sample_uniform(rows, cols, rand_min, rand_max, rng);
        let alpha = rng.gen_range(rand_min..rand_max);
        let own_gram = data.matmul_nt(&data);
        let masked_data = data.sub(&mask);
        let partial_unmasker = mask.scale(alpha);
        Self {
            data,
            mask,
            alpha,
            own_gram,
            masked_data,
            partial_unmasker,
        }
    }

    pub fn rows(&self) -> usize {
        self.data.rows()
    }

    /// Message this share contributes when acting as Alice.
    pub fn alice_msg(&self) -> PeerMsg {
        PeerMsg::AliceMasked {
            masked_data: self.masked_data.clone(),
            partial_unmasker: self.partial_unmasker.clone(),
        }
    }

    /// Message this share contributes when acting as Bob.
    pub fn bob_msg(&self) -> PeerMsg {
        PeerMsg::BobMasked {
            masked_data: self.masked_data.clone(),
        }
    }

    /// Fragment produced on the Bob side after receiving Alice's exchange:
    /// component `D̃_A · Dᵀ`, dense unmasker `(alpha_A·M_A) · Mᵀ`.
    pub fn bob_fragment(
        &self,
        alice_masked: &Matrix,
        alice_partial_unmasker: &Matrix,
    ) -> (Matrix, Unmasker) {
        let component = alice_masked.matmul_nt(&self.data);
        let unmasker = Unmasker::Dense(alice_partial_unmasker.matmul_nt(&self.mask));
        (component, unmasker)
    }

    /// Fragment produced on the Alice side after receiving Bob's exchange:
    /// component `M · D̃_Bᵀ`, scalar unmasker `1/alpha`.
    pub fn alice_fragment(&self, bob_masked: &Matrix) -> (Matrix, Unmasker) {
        let component = self.mask.matmul_nt(bob_masked);
        let unmasker = Unmasker::Scalar(1.0 / self.alpha);
        (component, unmasker)
    }
}

#[cfg(test)]
mod tests {
    use rand_chacha::rand_core::SeedableRng;
    use rand_chacha::ChaCha20Rng;

    use super::*;

    #[test]
    fn roles_are_antisymmetric() {
        assert_eq!(Role::between("client_1", "client_2").unwrap(), Role::Alice);
        assert_eq!(Role::between("client_2", "client_1").unwrap(), Role::Bob);
        assert!(matches!(
            Role::between("client_1", "client_1"),
            Err(ProtocolError::DuplicatePeerId(_))
        ));
    }

    #[test]
    fn fragments_cancel_to_exact_cross_block() {
        let mut rng = ChaCha20Rng::from_seed([7u8; 32]);
        let d_a = Matrix::sample_uniform(3, 4, -2.0, 2.0, &mut rng);
        let d_b = Matrix::sample_uniform(5, 4, -2.0, 2.0, &mut rng);
        let expected = d_a.matmul_nt(&d_b);

        let alice = MaskedShare::sample(d_a, 1.0, 42.0, &mut rng);
        let bob = MaskedShare::sample(d_b, 1.0, 42.0, &mut rng);

        // Bob combines Alice's exchange, Alice combines Bob's.
        let (c_bob, u_bob) = bob.bob_fragment(&alice.masked_data, &alice.partial_unmasker);
        let (c_alice, u_alice) = alice.alice_fragment(&bob.masked_data);

        // Accumulate the way the aggregator does: components add, unmaskers
        // multiply, then the block is the sum of the two accumulator fields.
        let component_sum = c_bob.add(&c_alice);
        let unmasker_product = match u_bob.product(&u_alice) {
            Unmasker::Dense(m) => m,
            Unmasker::Scalar(_) => panic!("pair product must be dense"),
        };
        let block = component_sum.add(&unmasker_product);

        assert!(
            block.allclose(&expected, 1e-6, 1e-6),
            "masked fragments failed to reconstruct the cross-block"
        );
    }

    #[test]
    fn masked_data_hides_the_rows() {
        let mut rng = ChaCha20Rng::from_seed([9u8; 32]);
        let d = Matrix::sample_uniform(2, 3, 0.0, 1.0, &mut rng);
        let share = MaskedShare::sample(d.clone(), 1.0, 42.0, &mut rng);
        // The mask is at least 1.0 per entry, so no masked entry can equal
        // its plain counterpart.
        assert!(share
            .masked_data
            .as_slice()
            .iter()
            .zip(d.as_slice())
            .all(|(&m, &p)| (m - p).abs() >= 1.0 - 1e-12));
    }
}
