//! # Custody Scripts
//!
//! Tapscript leaves for the protocol and the tap trees that wrap them:
//!
//! - grail output: one leaf, `<k0> CHECKSIG <k1> CHECKSIGADD … <T> NUMEQUAL`
//! - user payment output: the grail leaf plus `<blocks> CSV DROP <user> CHECKSIG`
//!
//! Cosigner keys are always sorted before they reach a script, so the same set
//! gives the same leaf hash (and address) whatever order it was supplied in.

use crate::crypto::parse_x_only;
use crate::error::{GrailError, GrailResult};
use crate::taproot::{ControlBlock, TapTree};
use bitcoin::key::XOnlyPublicKey;
use bitcoin::opcodes::all::{OP_CHECKSIG, OP_CHECKSIGADD, OP_CSV, OP_DROP, OP_NUMEQUAL};
use bitcoin::script::Builder;
use bitcoin::{Address, Network, ScriptBuf};
use std::fmt;

/// Largest relative timelock expressible in blocks (BIP68)
pub const MAX_TIMELOCK_BLOCKS: u32 = 0xFFFF;

/// Leaf index of the custody script in a user payment tree
pub const USER_PAYMENT_GRAIL_LEAF: usize = 0;

/// Leaf index of the recovery script in a user payment tree
pub const USER_PAYMENT_RECOVERY_LEAF: usize = 1;

/// Sort keys the way scripts list them.
///
/// Byte order of the x-only serialization equals lexicographic order of the
/// lowercase hex encoding.
fn sorted_keys(keys: &[XOnlyPublicKey]) -> Vec<XOnlyPublicKey> {
    let mut sorted = keys.to_vec();
    sorted.sort_by_key(|key| key.serialize());
    sorted
}

fn check_threshold(threshold: usize, cosigners: usize) -> GrailResult<()> {
    if threshold < 1 || threshold > cosigners {
        return Err(GrailError::InvalidThreshold {
            threshold,
            cosigners,
        });
    }
    Ok(())
}

/// An authorized cosigner group and its signature threshold
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CosignerSet {
    keys: Vec<XOnlyPublicKey>,
    threshold: usize,
}

impl CosignerSet {
    /// Keys are sorted on construction; duplicates are rejected
    pub fn new(keys: Vec<XOnlyPublicKey>, threshold: usize) -> GrailResult<Self> {
        let keys = sorted_keys(&keys);
        if keys.windows(2).any(|pair| pair[0] == pair[1]) {
            return Err(GrailError::config("cosigner set contains a duplicate key"));
        }
        check_threshold(threshold, keys.len())?;
        Ok(Self { keys, threshold })
    }

    /// Parse hex-encoded x-only keys
    pub fn from_hex<S: AsRef<str>>(keys: &[S], threshold: usize) -> GrailResult<Self> {
        let keys = keys
            .iter()
            .map(|key| parse_x_only(key.as_ref()))
            .collect::<GrailResult<Vec<_>>>()?;
        Self::new(keys, threshold)
    }

    /// Parse the comma-joined key list used in state records and on the CLI
    pub fn from_record(keys: &str, threshold: usize) -> GrailResult<Self> {
        let keys: Vec<&str> = keys
            .split(',')
            .map(str::trim)
            .filter(|key| !key.is_empty())
            .collect();
        Self::from_hex(&keys, threshold)
    }

    /// Sorted keys
    pub fn keys(&self) -> &[XOnlyPublicKey] {
        &self.keys
    }

    pub fn threshold(&self) -> usize {
        self.threshold
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn contains(&self, key: &XOnlyPublicKey) -> bool {
        self.keys.contains(key)
    }

    pub fn keys_hex(&self) -> Vec<String> {
        self.keys.iter().map(|key| hex::encode(key.serialize())).collect()
    }

    /// Comma-joined sorted hex keys, as written into the NFT state record
    pub fn record_string(&self) -> String {
        self.keys_hex().join(",")
    }
}

impl fmt::Display for CosignerSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-of-{} [{}]", self.threshold, self.keys.len(), self.record_string())
    }
}

/// `<k0> CHECKSIG <k1> CHECKSIGADD … <kN> CHECKSIGADD <threshold> NUMEQUAL`
pub fn multisig_script(cosigners: &[XOnlyPublicKey], threshold: usize) -> GrailResult<ScriptBuf> {
    check_threshold(threshold, cosigners.len())?;

    let mut builder = Builder::new();
    for (index, key) in sorted_keys(cosigners).iter().enumerate() {
        builder = builder.push_x_only_key(key);
        builder = if index == 0 {
            builder.push_opcode(OP_CHECKSIG)
        } else {
            builder.push_opcode(OP_CHECKSIGADD)
        };
    }

    Ok(builder
        .push_int(threshold as i64)
        .push_opcode(OP_NUMEQUAL)
        .into_script())
}

/// `<timelock_blocks> CHECKSEQUENCEVERIFY DROP <recovery_key> CHECKSIG`
pub fn recovery_script(
    recovery_key: &XOnlyPublicKey,
    timelock_blocks: u32,
) -> GrailResult<ScriptBuf> {
    if timelock_blocks == 0 || timelock_blocks > MAX_TIMELOCK_BLOCKS {
        return Err(GrailError::config(format!(
            "recovery timelock must be 1..={} blocks, got {}",
            MAX_TIMELOCK_BLOCKS, timelock_blocks
        )));
    }

    Ok(Builder::new()
        .push_int(timelock_blocks as i64)
        .push_opcode(OP_CSV)
        .push_opcode(OP_DROP)
        .push_x_only_key(recovery_key)
        .push_opcode(OP_CHECKSIG)
        .into_script())
}

/// A leaf script together with its proof of inclusion
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpendingScript {
    pub script: ScriptBuf,
    pub control_block: ControlBlock,
}

impl SpendingScript {
    fn from_tree(tree: &TapTree, index: usize) -> GrailResult<Self> {
        Ok(Self {
            script: tree.script(index)?.clone(),
            control_block: tree.control_block(index)?,
        })
    }
}

/// Single-leaf tree holding the grail multisig for `cosigners`
pub fn grail_tree(cosigners: &CosignerSet, network: Network) -> GrailResult<TapTree> {
    let script = multisig_script(cosigners.keys(), cosigners.threshold())?;
    TapTree::new(vec![script], network)
}

/// Address of the NFT and of grail-held BTC for a cosigner set
pub fn grail_address(cosigners: &CosignerSet, network: Network) -> GrailResult<Address> {
    grail_tree(cosigners, network)?.address()
}

/// Multisig leaf and control block for spending a grail output
pub fn grail_spending_script(
    cosigners: &CosignerSet,
    network: Network,
) -> GrailResult<SpendingScript> {
    SpendingScript::from_tree(&grail_tree(cosigners, network)?, 0)
}

/// Terms of a user payment: who may take it and how the payer gets it back
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserPaymentPolicy {
    pub grail_state: CosignerSet,
    pub recovery_key: XOnlyPublicKey,
    pub timelock_blocks: u32,
}

impl UserPaymentPolicy {
    /// `[grail multisig, recovery]`
    pub fn tree(&self, network: Network) -> GrailResult<TapTree> {
        let grail = multisig_script(self.grail_state.keys(), self.grail_state.threshold())?;
        let recovery = recovery_script(&self.recovery_key, self.timelock_blocks)?;
        TapTree::new(vec![grail, recovery], network)
    }

    pub fn address(&self, network: Network) -> GrailResult<Address> {
        self.tree(network)?.address()
    }

    /// Cosigner path
    pub fn grail_spend(&self, network: Network) -> GrailResult<SpendingScript> {
        SpendingScript::from_tree(&self.tree(network)?, USER_PAYMENT_GRAIL_LEAF)
    }

    /// Payer's timelocked path
    pub fn recovery_spend(&self, network: Network) -> GrailResult<SpendingScript> {
        SpendingScript::from_tree(&self.tree(network)?, USER_PAYMENT_RECOVERY_LEAF)
    }
}
