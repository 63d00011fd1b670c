//! # Tap Trees
//!
//! Tagged hashes and the small tap-tree builder the custody scripts are
//! committed with: one leaf for a grail output, two leaves (custody plus
//! recovery) for a user payment output.

pub mod tagged;
pub mod tree;

pub use tagged::{tagged_hash, tap_branch_hash, tap_leaf_hash, tap_tweak_hash};
pub use tree::{ControlBlock, TapTree, INTERNAL_KEY, TAPSCRIPT_LEAF_VERSION};
