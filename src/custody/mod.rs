//! # Custody Module
//!
//! The state machine that moves a custody NFT, and the BTC and tokens it
//! controls, from one cosigner set to the next.
//!
//! ## Components
//!
//! - **State**: phases, operations and the typed read side of the on-chain record
//! - **Request**: spell requests, transfer plans and their sanity checks
//! - **Machine**: the prepare, sign and transmit pipeline
//! - **Recovery**: timelocked reclaim of user payments
//! - **Tokens**: wallet token listing and transfers

pub mod machine;
pub mod recovery;
pub mod request;
pub mod state;
pub mod tokens;

#[cfg(test)]
mod tests;

pub use machine::{GrailCustody, PreparedTransition, TransitionReceipt};
pub use recovery::{build_recovery_transaction, find_user_payment_vout};
pub use request::{
    balance_plan, select_token_utxos, NftAction, Outgoing, PlanAmounts, PreviousNft, SpellDocument,
    SpellRequest, TokenAction, TokenTransfer, TokenUtxo, TransferPlan, TransferRequest, UserPayment,
};
pub use state::{parse_state_record, token_amount, CustodyPhase, Operation, StateRecord};
pub use tokens::TokenWallet;
