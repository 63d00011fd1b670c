//! Custody phases, operations, and the typed read side of the on-chain state
//! record.

use super::request::{NftAction, Outgoing, TokenAction, TransferPlan, UserPayment};
use crate::config::custody::{NFT_RECORD_KEYS, TOKEN_RECORD_KEYS};
use crate::error::{GrailError, GrailResult};
use crate::scripts::CosignerSet;
use bitcoin::OutPoint;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Where a custody chain stands after its latest transition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CustodyPhase {
    Deployed,
    Updated,
    Minted,
    PeggedIn,
    PeggedOut,
    Burned,
}

impl fmt::Display for CustodyPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CustodyPhase::Deployed => "deployed",
            CustodyPhase::Updated => "updated",
            CustodyPhase::Minted => "minted",
            CustodyPhase::PeggedIn => "pegged-in",
            CustodyPhase::PeggedOut => "pegged-out",
            CustodyPhase::Burned => "burned",
        };
        f.write_str(name)
    }
}

/// A requested state transition
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    /// Start a chain controlled by a single deployer key
    Deploy,
    /// Rotate the cosigner set or threshold
    Update,
    /// Issue tokens without BTC backing
    Mint { amount: u64, user_address: String },
    /// Take a user's BTC payment and issue the same amount of tokens
    PegIn { payment: UserPayment },
    /// Take a user's tokens and release the same amount of grail BTC
    PegOut {
        payment: UserPayment,
        locked_utxos: Vec<OutPoint>,
    },
    /// Destroy a user's tokens
    Burn { payment: UserPayment },
}

impl Operation {
    /// Phase the chain enters when this operation lands
    pub fn phase(&self) -> CustodyPhase {
        match self {
            Operation::Deploy => CustodyPhase::Deployed,
            Operation::Update => CustodyPhase::Updated,
            Operation::Mint { .. } => CustodyPhase::Minted,
            Operation::PegIn { .. } => CustodyPhase::PeggedIn,
            Operation::PegOut { .. } => CustodyPhase::PeggedOut,
            Operation::Burn { .. } => CustodyPhase::Burned,
        }
    }

    pub fn nft_action(&self) -> NftAction {
        match self {
            Operation::Deploy => NftAction::Deploy,
            _ => NftAction::Update,
        }
    }

    pub fn token_action(&self) -> Option<TokenAction> {
        match self {
            Operation::Deploy | Operation::Update => None,
            Operation::Mint { .. } | Operation::PegIn { .. } => Some(TokenAction::Mint),
            Operation::PegOut { .. } | Operation::Burn { .. } => Some(TokenAction::Burn),
        }
    }

    /// Value movements implied by the operation
    pub fn transfer_plan(&self) -> TransferPlan {
        match self {
            Operation::Deploy | Operation::Update => TransferPlan::default(),
            Operation::Mint { amount, user_address } => TransferPlan {
                outgoing_user_tokens: vec![Outgoing {
                    address: user_address.clone(),
                    amount: *amount,
                }],
                ..Default::default()
            },
            // outgoing amounts mirror what the user hands in, see TransferPlan::mirror_amounts
            Operation::PegIn { payment } => TransferPlan {
                incoming_user_btc: vec![payment.clone()],
                outgoing_user_tokens: vec![Outgoing {
                    address: payment.user_address.clone(),
                    amount: 0,
                }],
                enforce_balance: true,
                ..Default::default()
            },
            Operation::PegOut {
                payment,
                locked_utxos,
            } => TransferPlan {
                incoming_user_tokens: vec![payment.clone()],
                incoming_grail_btc: locked_utxos.clone(),
                outgoing_user_btc: vec![Outgoing {
                    address: payment.user_address.clone(),
                    amount: 0,
                }],
                enforce_balance: true,
                ..Default::default()
            },
            Operation::Burn { payment } => TransferPlan {
                incoming_user_tokens: vec![payment.clone()],
                ..Default::default()
            },
        }
    }
}

/// The custody state committed in a spell's first output
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateRecord {
    pub cosigners: CosignerSet,
    pub ticker: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DecodedSpell {
    /// slot -> `n/...` or `t/...`
    #[serde(default)]
    apps: Map<String, Value>,
    outs: Vec<DecodedOutput>,
}

#[derive(Debug, Deserialize)]
struct DecodedOutput {
    #[serde(default)]
    charms: Map<String, Value>,
}

#[derive(Debug, Deserialize)]
struct NftCharm {
    current_cosigners: String,
    current_threshold: usize,
    #[serde(default)]
    ticker: Option<String>,
}

fn decode_spell(spell: &Value) -> GrailResult<DecodedSpell> {
    DecodedSpell::deserialize(spell).map_err(|e| GrailError::malformed(format!("spell: {}", e)))
}

fn find_charm<'a>(output: &'a DecodedOutput, keys: &[&str]) -> Option<&'a Value> {
    keys.iter().find_map(|key| output.charms.get(*key))
}

/// Parse `outs[0]`'s NFT charm into the cosigner set it records
pub fn parse_state_record(spell: &Value) -> GrailResult<StateRecord> {
    let decoded = decode_spell(spell)?;
    let first = decoded
        .outs
        .first()
        .ok_or_else(|| GrailError::malformed("spell has no outputs"))?;
    let charm = find_charm(first, &NFT_RECORD_KEYS)
        .ok_or_else(|| GrailError::malformed("first output carries no NFT charm"))?;
    let charm = NftCharm::deserialize(charm)
        .map_err(|e| GrailError::malformed(format!("NFT charm: {}", e)))?;

    let cosigners = CosignerSet::from_record(&charm.current_cosigners, charm.current_threshold)
        .map_err(|e| GrailError::malformed(format!("recorded cosigner set: {}", e)))?;

    Ok(StateRecord {
        cosigners,
        ticker: charm.ticker,
    })
}

/// Amount of `token_app` held by output `vout` of a decoded spell.
///
/// The token's slot is looked up in the spell's `apps`; spells shown without
/// an app table fall back to the slot custody spells put the token in.
pub fn token_amount(spell: &Value, vout: u32, token_app: &str) -> GrailResult<u64> {
    let decoded = decode_spell(spell)?;
    let output = decoded
        .outs
        .get(vout as usize)
        .ok_or_else(|| GrailError::malformed(format!("spell has no output {}", vout)))?;

    let found = if decoded.apps.is_empty() {
        find_charm(output, &TOKEN_RECORD_KEYS)
    } else {
        let slot = decoded
            .apps
            .iter()
            .find(|(_, app)| app.as_str() == Some(token_app))
            .map(|(slot, _)| slot.as_str())
            .ok_or_else(|| GrailError::malformed(format!("spell carries no {}", token_app)))?;
        output.charms.get(slot)
    };
    let charm =
        found.ok_or_else(|| GrailError::malformed(format!("output {} carries no tokens", vout)))?;

    charm
        .as_u64()
        .or_else(|| charm.get("amount").and_then(Value::as_u64))
        .ok_or_else(|| {
            GrailError::malformed(format!("output {} token amount is not a number", vout))
        })
}
