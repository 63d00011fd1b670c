//! BIP340/341 tagged hashes used to build tap trees.

use sha2::{Digest, Sha256};

const TAP_LEAF_TAG: &str = "TapLeaf";
const TAP_BRANCH_TAG: &str = "TapBranch";
const TAP_TWEAK_TAG: &str = "TapTweak";

/// SHA256(SHA256(tag) || SHA256(tag) || msg)
pub fn tagged_hash(tag: &str, msg: &[u8]) -> [u8; 32] {
    let tag_hash = Sha256::digest(tag.as_bytes());
    let mut hasher = Sha256::new();
    hasher.update(tag_hash);
    hasher.update(tag_hash);
    hasher.update(msg);
    hasher.finalize().into()
}

/// TapLeaf(version || compact_size(len) || script)
pub fn tap_leaf_hash(leaf_version: u8, script: &[u8]) -> [u8; 32] {
    let mut msg = Vec::with_capacity(1 + 9 + script.len());
    msg.push(leaf_version);
    write_compact_size(&mut msg, script.len() as u64);
    msg.extend_from_slice(script);
    tagged_hash(TAP_LEAF_TAG, &msg)
}

/// TapBranch over the two children in ascending byte order
pub fn tap_branch_hash(left: &[u8; 32], right: &[u8; 32]) -> [u8; 32] {
    let (first, second) = if left <= right { (left, right) } else { (right, left) };
    let mut msg = [0u8; 64];
    msg[..32].copy_from_slice(first);
    msg[32..].copy_from_slice(second);
    tagged_hash(TAP_BRANCH_TAG, &msg)
}

/// TapTweak(internal_key || merkle_root)
pub fn tap_tweak_hash(internal_key: &[u8; 32], merkle_root: &[u8; 32]) -> [u8; 32] {
    let mut msg = [0u8; 64];
    msg[..32].copy_from_slice(internal_key);
    msg[32..].copy_from_slice(merkle_root);
    tagged_hash(TAP_TWEAK_TAG, &msg)
}

/// Bitcoin CompactSize length prefix
fn write_compact_size(out: &mut Vec<u8>, n: u64) {
    match n {
        0..=252 => out.push(n as u8),
        253..=0xFFFF => {
            out.push(253);
            out.extend_from_slice(&(n as u16).to_le_bytes());
        }
        0x1_0000..=0xFFFF_FFFF => {
            out.push(254);
            out.extend_from_slice(&(n as u32).to_le_bytes());
        }
        _ => {
            out.push(255);
            out.extend_from_slice(&n.to_le_bytes());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::hashes::Hash;
    use bitcoin::taproot::{LeafVersion, TapLeafHash, TapNodeHash};
    use bitcoin::ScriptBuf;

    #[test]
    fn test_leaf_hash_matches_bitcoin() {
        for len in [0usize, 1, 75, 252, 253, 300] {
            let script = ScriptBuf::from_bytes(vec![0x51; len]);
            let ours = tap_leaf_hash(0xc0, script.as_bytes());
            let theirs = TapLeafHash::from_script(&script, LeafVersion::TapScript);
            assert_eq!(ours, theirs.to_byte_array(), "script length {}", len);
        }
    }

    #[test]
    fn test_branch_hash_is_order_independent() {
        let a = tap_leaf_hash(0xc0, &[0x51]);
        let b = tap_leaf_hash(0xc0, &[0x52]);
        assert_eq!(tap_branch_hash(&a, &b), tap_branch_hash(&b, &a));

        let theirs = TapNodeHash::from_node_hashes(
            TapNodeHash::from_byte_array(a),
            TapNodeHash::from_byte_array(b),
        );
        assert_eq!(tap_branch_hash(&a, &b), theirs.to_byte_array());
    }

    #[test]
    fn test_compact_size() {
        let mut out = Vec::new();
        write_compact_size(&mut out, 253);
        assert_eq!(out, vec![253, 253, 0]);
    }
}
