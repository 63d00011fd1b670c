//! One- and two-leaf tap trees over the protocol's unspendable internal key.
//!
//! The output key is computed here from the tagged hashes and the curve
//! arithmetic in [`crate::crypto`]; the `bitcoin` crate is only used to encode
//! the result as an address and script.

use super::tagged::{tap_branch_hash, tap_leaf_hash, tap_tweak_hash};
use crate::crypto::{generator, has_even_y, point_add, point_mul, Point, CURVE_ORDER};
use crate::error::{GrailError, GrailResult};
use bitcoin::key::{TweakedPublicKey, XOnlyPublicKey};
use bitcoin::{Address, Network, ScriptBuf};
use num_bigint::BigUint;

/// Leaf version for BIP342 tapscript
pub const TAPSCRIPT_LEAF_VERSION: u8 = 0xc0;

/// NUMS point H from BIP341: no known discrete log, so the key path is unusable
pub const INTERNAL_KEY: [u8; 32] = [
    0x50, 0x92, 0x9b, 0x74, 0xc1, 0xa0, 0x49, 0x54, 0xb7, 0x8b, 0x4b, 0x60, 0x35, 0xe9, 0x7a,
    0x5e, 0x07, 0x8a, 0x5a, 0x0f, 0x28, 0xec, 0x96, 0xd5, 0x47, 0xbf, 0xee, 0x9a, 0xce, 0x80,
    0x3a, 0xc0,
];

const MAX_LEAVES: usize = 2;

/// Proof that a leaf is committed in a tree
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlBlock {
    /// Leaf version with the output key's parity in the low bit
    pub leaf_version_and_parity: u8,
    pub internal_key: [u8; 32],
    /// Sibling hashes from the leaf up to the root
    pub merkle_path: Vec<[u8; 32]>,
}

impl ControlBlock {
    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(33 + 32 * self.merkle_path.len());
        out.push(self.leaf_version_and_parity);
        out.extend_from_slice(&self.internal_key);
        for node in &self.merkle_path {
            out.extend_from_slice(node);
        }
        out
    }

    /// Parse a serialized control block (33 + 32·k bytes)
    pub fn from_slice(bytes: &[u8]) -> GrailResult<Self> {
        if bytes.len() < 33 || (bytes.len() - 33) % 32 != 0 {
            return Err(GrailError::transaction(format!(
                "control block has invalid length {}",
                bytes.len()
            )));
        }

        let mut internal_key = [0u8; 32];
        internal_key.copy_from_slice(&bytes[1..33]);
        let merkle_path = bytes[33..]
            .chunks_exact(32)
            .map(|chunk| {
                let mut node = [0u8; 32];
                node.copy_from_slice(chunk);
                node
            })
            .collect();

        Ok(Self {
            leaf_version_and_parity: bytes[0],
            internal_key,
            merkle_path,
        })
    }
}

/// A committed set of one or two leaf scripts
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TapTree {
    scripts: Vec<ScriptBuf>,
    leaf_hashes: Vec<[u8; 32]>,
    merkle_root: [u8; 32],
    output_key: [u8; 32],
    output_parity: u8,
    network: Network,
}

impl TapTree {
    /// Build the tree for `scripts` in the given order
    pub fn new(scripts: Vec<ScriptBuf>, network: Network) -> GrailResult<Self> {
        if scripts.is_empty() || scripts.len() > MAX_LEAVES {
            return Err(GrailError::InvalidLeafCount {
                count: scripts.len(),
            });
        }

        let leaf_hashes: Vec<[u8; 32]> = scripts
            .iter()
            .map(|script| tap_leaf_hash(TAPSCRIPT_LEAF_VERSION, script.as_bytes()))
            .collect();
        let merkle_root = match leaf_hashes.as_slice() {
            [leaf] => *leaf,
            [left, right] => tap_branch_hash(left, right),
            _ => {
                return Err(GrailError::InvalidLeafCount {
                    count: leaf_hashes.len(),
                })
            }
        };

        let (output_key, output_parity) = tweak_internal_key(&INTERNAL_KEY, &merkle_root)?;

        Ok(Self {
            scripts,
            leaf_hashes,
            merkle_root,
            output_key,
            output_parity,
            network,
        })
    }

    pub fn leaf_count(&self) -> usize {
        self.scripts.len()
    }

    pub fn script(&self, index: usize) -> GrailResult<&ScriptBuf> {
        self.scripts.get(index).ok_or(GrailError::InvalidLeafIndex {
            index,
            leaves: self.scripts.len(),
        })
    }

    pub fn leaf_hash(&self, index: usize) -> GrailResult<[u8; 32]> {
        self.leaf_hashes
            .get(index)
            .copied()
            .ok_or(GrailError::InvalidLeafIndex {
                index,
                leaves: self.leaf_hashes.len(),
            })
    }

    pub fn merkle_root(&self) -> [u8; 32] {
        self.merkle_root
    }

    /// x-only tweaked output key
    pub fn output_key(&self) -> GrailResult<XOnlyPublicKey> {
        XOnlyPublicKey::from_slice(&self.output_key)
            .map_err(|e| GrailError::crypto(format!("output key: {}", e)))
    }

    /// 0 for even y, 1 for odd
    pub fn output_parity(&self) -> u8 {
        self.output_parity
    }

    /// bech32m address for the tree's network
    pub fn address(&self) -> GrailResult<Address> {
        let output_key = TweakedPublicKey::dangerous_assume_tweaked(self.output_key()?);
        Ok(Address::p2tr_tweaked(output_key, self.network))
    }

    /// `OP_1 <output key>`
    pub fn script_pubkey(&self) -> GrailResult<ScriptBuf> {
        Ok(self.address()?.script_pubkey())
    }

    /// Control block for the leaf at `index`
    pub fn control_block(&self, index: usize) -> GrailResult<ControlBlock> {
        self.leaf_hash(index)?;

        let merkle_path = match self.leaf_hashes.len() {
            1 => Vec::new(),
            _ => vec![self.leaf_hashes[1 - index]],
        };

        Ok(ControlBlock {
            leaf_version_and_parity: TAPSCRIPT_LEAF_VERSION | self.output_parity,
            internal_key: INTERNAL_KEY,
            merkle_path,
        })
    }
}

/// Q = lift_x(P) + t·G with t = TapTweak(P || root); returns Q's x and parity
fn tweak_internal_key(
    internal_key: &[u8; 32],
    merkle_root: &[u8; 32],
) -> GrailResult<([u8; 32], u8)> {
    let tweak = BigUint::from_bytes_be(&tap_tweak_hash(internal_key, merkle_root));
    if tweak >= *CURVE_ORDER {
        return Err(GrailError::InvalidScalar {
            reason: "taproot tweak exceeds the curve order".to_string(),
        });
    }

    let internal_point = Point::from_x_only(internal_key)?;
    let tweak_point = point_mul(Some(&generator()), &tweak);
    let output = point_add(Some(&internal_point), tweak_point.as_ref()).ok_or_else(|| {
        GrailError::InvalidPoint {
            reason: "tweaked output key is the point at infinity".to_string(),
        }
    })?;

    let parity = if has_even_y(&output) { 0 } else { 1 };
    Ok((output.x_only_bytes(), parity))
}
