//! 256-bit peer identifiers and the XOR log-distance metric

use serde::{Deserialize, Serialize};
use std::fmt;

/// Size of a node ID in bytes
pub const NODE_ID_SIZE: usize = 32;

/// Size of a node ID in bits, also the largest possible log-distance
pub const NODE_ID_BITS: usize = NODE_ID_SIZE * 8;

/// Opaque peer identity used for XOR-distance routing
///
/// Equality is byte-exact. There is no ordering between identifiers other than
/// the one induced by [`log_distance`] to some center.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeId([u8; NODE_ID_SIZE]);

impl NodeId {
    /// Create a NodeId from a byte array
    pub fn from_bytes(bytes: [u8; NODE_ID_SIZE]) -> Self {
        NodeId(bytes)
    }

    /// Get the bytes of this NodeId
    pub fn as_bytes(&self) -> &[u8; NODE_ID_SIZE] {
        &self.0
    }

    /// Convert to hex string
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Log-distance to another identifier, see [`log_distance`]
    pub fn log_distance(&self, other: &NodeId) -> usize {
        log_distance(self, other)
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", self.to_hex())
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", &self.to_hex()[..8])
    }
}

/// XOR log-distance between two identifiers
///
/// This is the bit length of `a XOR b`: 0 for identical identifiers and
/// [`NODE_ID_BITS`] when the most significant bit differs.
pub fn log_distance(a: &NodeId, b: &NodeId) -> usize {
    for (byte_idx, (x, y)) in a.0.iter().zip(b.0.iter()).enumerate() {
        let xor = x ^ y;
        if xor != 0 {
            let leading = byte_idx * 8 + xor.leading_zeros() as usize;
            return NODE_ID_BITS - leading;
        }
    }
    0
}

/// Coarsened log-distance, `ceil(log_distance / divisor)`
///
/// Shrinks the number of usable buckets for small experiments. Monotonic in
/// [`log_distance`], so it never reorders two candidates. A divisor of 0 is
/// treated as 1.
pub fn sim_distance(a: &NodeId, b: &NodeId, divisor: usize) -> usize {
    let divisor = divisor.max(1);
    log_distance(a, b).div_ceil(divisor)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn id_with_first_byte(value: u8) -> NodeId {
        let mut bytes = [0u8; NODE_ID_SIZE];
        bytes[0] = value;
        NodeId::from_bytes(bytes)
    }

    #[test]
    fn test_distance_to_self_is_zero() {
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..32 {
            let id = NodeId::from_bytes(rng.gen());
            assert_eq!(log_distance(&id, &id), 0);
        }
    }

    #[test]
    fn test_distance_is_symmetric() {
        let mut rng = StdRng::seed_from_u64(11);
        for _ in 0..64 {
            let a = NodeId::from_bytes(rng.gen());
            let b = NodeId::from_bytes(rng.gen());
            assert_eq!(log_distance(&a, &b), log_distance(&b, &a));
        }
    }

    #[test]
    fn test_maximal_distance() {
        let zero = NodeId::from_bytes([0u8; NODE_ID_SIZE]);
        let ones = NodeId::from_bytes([0xFF; NODE_ID_SIZE]);
        assert_eq!(log_distance(&zero, &ones), NODE_ID_BITS);
        assert_eq!(log_distance(&zero, &id_with_first_byte(0x80)), 256);
    }

    #[test]
    fn test_distance_last_bit() {
        let zero = NodeId::from_bytes([0u8; NODE_ID_SIZE]);
        let mut bytes = [0u8; NODE_ID_SIZE];
        bytes[NODE_ID_SIZE - 1] = 1;
        assert_eq!(log_distance(&zero, &NodeId::from_bytes(bytes)), 1);

        bytes[NODE_ID_SIZE - 1] = 0b0000_0110;
        assert_eq!(log_distance(&zero, &NodeId::from_bytes(bytes)), 3);
    }

    #[test]
    fn test_sim_distance_ceiling() {
        let zero = NodeId::from_bytes([0u8; NODE_ID_SIZE]);
        let far = id_with_first_byte(0x80);
        assert_eq!(sim_distance(&zero, &far, 1), 256);
        assert_eq!(sim_distance(&zero, &far, 3), 86);
        assert_eq!(sim_distance(&zero, &zero, 3), 0);
        assert_eq!(sim_distance(&zero, &far, 0), 256);
    }

    #[test]
    fn test_sim_distance_is_monotonic() {
        let center = NodeId::from_bytes([0u8; NODE_ID_SIZE]);
        let mut previous = 0;
        for bit in 0..NODE_ID_BITS {
            let mut bytes = [0u8; NODE_ID_SIZE];
            bytes[NODE_ID_SIZE - 1 - bit / 8] = 1 << (bit % 8);
            let coarse = sim_distance(&center, &NodeId::from_bytes(bytes), 5);
            assert!(coarse >= previous);
            previous = coarse;
        }
    }

    #[test]
    fn test_display_is_short_hex() {
        let id = id_with_first_byte(0xAB);
        assert_eq!(id.to_string(), "ab000000");
    }
}
