//! # Services Module
//!
//! External collaborators of the custody pipeline.
//!
//! ## Components
//!
//! - **RPC Client**: Bitcoin Core wallet RPC behind the [`NodeRpc`] trait
//! - **Prover**: the `charms` spell prover behind the [`SpellProver`] trait

pub mod prover;
pub mod rpc_client;

pub use prover::{CharmsProver, Spell, SpellProver};
pub use rpc_client::{BitcoinRpcClient, NodeRpc};
