//! # Bitcoin Grail: Threshold Custody for Tokenized BTC
//!
//! Library for moving a custody NFT, and the BTC and tokens it controls,
//! between cosigner sets on Bitcoin. Each cosigner set is committed to a
//! taproot output whose single leaf is a `CHECKSIGADD` threshold multisig, and
//! every state transition is a commitment/spell transaction pair produced by
//! an external spell prover and authorized by the outgoing cosigners.
//!
//! ## Layers
//!
//! - [`crypto`]: secp256k1 field and point arithmetic, x-only keys
//! - [`taproot`]: BIP-341 tagged hashes, one- and two-leaf tap trees, control blocks
//! - [`scripts`]: cosigner sets, multisig and recovery leaves, grail and user payment addresses
//! - [`signing`]: tapscript sighashes, deterministic signing, witness assembly, offline cosigning
//! - [`custody`]: the transition pipeline, user payment recovery and token transfers
//! - [`services`]: Bitcoin Core RPC and the `charms` prover

pub mod config;
pub mod crypto;
pub mod custody;
pub mod error;
pub mod scripts;
pub mod services;
pub mod signing;
pub mod taproot;
pub mod utils;

// Re-export commonly used types
pub use config::{GrailConfig, RpcConfig};
pub use custody::{GrailCustody, Operation, PreparedTransition, TokenWallet};
pub use error::{GrailError, GrailResult};
pub use scripts::{CosignerSet, UserPaymentPolicy};
pub use services::{BitcoinRpcClient, CharmsProver};
