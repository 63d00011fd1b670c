//! Spell requests: plain values describing one state transition or token
//! transfer, and the pure functions that render them as the prover's request
//! document.

use crate::config::custody::{DUST_LIMIT_SATS, NFT_SLOT, SPELL_VERSION, TOKEN_SLOT, TRANSFER_SLOT};
use crate::config::GrailConfig;
use crate::error::{GrailError, GrailResult};
use crate::scripts::{CosignerSet, UserPaymentPolicy};
use crate::utils::utxo::Utxo;
use bitcoin::{OutPoint, Txid};
use serde_json::{json, Map, Value};

/// What happens to the custody NFT
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NftAction {
    Deploy,
    Update,
}

impl NftAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            NftAction::Deploy => "deploy",
            NftAction::Update => "update",
        }
    }
}

/// What happens to the fungible token
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenAction {
    Mint,
    Burn,
    Transfer,
}

impl TokenAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            TokenAction::Mint => "mint",
            TokenAction::Burn => "burn",
            TokenAction::Transfer => "transfer",
        }
    }
}

/// A request the prover turns into a commitment/spell pair
pub trait SpellDocument {
    /// Render the request document (JSON, which the prover reads as YAML)
    fn to_document(&self) -> Value;

    /// Wallet UTXO paying for the commitment transaction
    fn funding(&self) -> &Utxo;

    /// Wallet address receiving what is left of the funding UTXO
    fn change_address(&self) -> &str;

    /// sat/vB
    fn fee_rate(&self) -> f64;

    /// Outpoints the spell transaction spends ahead of the funding inputs
    fn spent_outpoints(&self) -> Vec<OutPoint>;

    /// Short name for logs
    fn action(&self) -> &'static str;
}

/// A user's output locked to a user payment address
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserPayment {
    pub policy: UserPaymentPolicy,
    pub outpoint: OutPoint,
    /// The user's own wallet address, matched against outgoing transfers
    pub user_address: String,
}

/// An output paid to a user
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outgoing {
    pub address: String,
    pub amount: u64,
}

/// Value moved by a transition besides the NFT itself
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransferPlan {
    pub incoming_user_btc: Vec<UserPayment>,
    pub incoming_grail_btc: Vec<OutPoint>,
    pub incoming_user_tokens: Vec<UserPayment>,
    pub outgoing_user_btc: Vec<Outgoing>,
    pub outgoing_user_tokens: Vec<Outgoing>,
    /// Enforce the peg rules in [`balance_plan`]
    pub enforce_balance: bool,
}

impl TransferPlan {
    pub fn is_empty(&self) -> bool {
        self.incoming_user_btc.is_empty()
            && self.incoming_grail_btc.is_empty()
            && self.incoming_user_tokens.is_empty()
            && self.outgoing_user_btc.is_empty()
            && self.outgoing_user_tokens.is_empty()
    }

    /// Set each outgoing amount to what the same user hands in.
    ///
    /// Pegs pay out exactly what comes in: tokens for a BTC payment, BTC for
    /// tokens. Outgoing entries without a matching incoming entry are left as
    /// they are for [`balance_plan`] to reject.
    pub fn mirror_amounts(&mut self, amounts: &PlanAmounts) {
        for outgoing in &mut self.outgoing_user_tokens {
            if let Some(position) = self
                .incoming_user_btc
                .iter()
                .position(|p| p.user_address == outgoing.address)
            {
                if let Some(sats) = amounts.user_btc_sats.get(position) {
                    outgoing.amount = *sats;
                }
            }
        }
        for outgoing in &mut self.outgoing_user_btc {
            if let Some(position) = self
                .incoming_user_tokens
                .iter()
                .position(|p| p.user_address == outgoing.address)
            {
                if let Some(tokens) = amounts.user_token_amounts.get(position) {
                    outgoing.amount = *tokens;
                }
            }
        }
    }

    /// Prior transactions holding the plan's inputs
    pub fn input_txids(&self) -> Vec<Txid> {
        self.incoming_user_btc
            .iter()
            .map(|p| p.outpoint.txid)
            .chain(self.incoming_grail_btc.iter().map(|o| o.txid))
            .chain(self.incoming_user_tokens.iter().map(|p| p.outpoint.txid))
            .collect()
    }
}

/// Amounts found on chain for the plan's inputs, index-aligned with the plan
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PlanAmounts {
    pub user_btc_sats: Vec<u64>,
    pub grail_btc_sats: Vec<u64>,
    pub user_token_amounts: Vec<u64>,
}

/// Check the plan and return the BTC left to the grail.
///
/// BTC paid out never exceeds BTC coming in. With `enforce_balance`, every
/// outgoing user BTC amount must equal the tokens that user hands in, every
/// outgoing token amount must equal the BTC that user pays in, and no user
/// output may be dust. Change below the dust limit is left to fees.
pub fn balance_plan(plan: &TransferPlan, amounts: &PlanAmounts) -> GrailResult<u64> {
    if amounts.user_btc_sats.len() != plan.incoming_user_btc.len()
        || amounts.grail_btc_sats.len() != plan.incoming_grail_btc.len()
        || amounts.user_token_amounts.len() != plan.incoming_user_tokens.len()
    {
        return Err(GrailError::transaction(
            "plan amounts do not line up with plan inputs",
        ));
    }

    if plan.enforce_balance {
        for outgoing in &plan.outgoing_user_btc {
            let position = plan
                .incoming_user_tokens
                .iter()
                .position(|p| p.user_address == outgoing.address)
                .ok_or_else(|| GrailError::SanityCheckFailed {
                    message: format!(
                        "BTC to {} is not matched by incoming tokens",
                        outgoing.address
                    ),
                })?;
            let handed_in = amounts.user_token_amounts[position];
            if handed_in != outgoing.amount {
                return Err(GrailError::SanityCheckFailed {
                    message: format!(
                        "BTC to {} is {} sats but {} tokens were handed in",
                        outgoing.address, outgoing.amount, handed_in
                    ),
                });
            }
        }

        for outgoing in &plan.outgoing_user_tokens {
            let position = plan
                .incoming_user_btc
                .iter()
                .position(|p| p.user_address == outgoing.address)
                .ok_or_else(|| GrailError::SanityCheckFailed {
                    message: format!(
                        "tokens to {} are not matched by incoming BTC",
                        outgoing.address
                    ),
                })?;
            let paid_in = amounts.user_btc_sats[position];
            if paid_in != outgoing.amount {
                return Err(GrailError::SanityCheckFailed {
                    message: format!(
                        "{} tokens to {} but {} sats were paid in",
                        outgoing.amount, outgoing.address, paid_in
                    ),
                });
            }
        }

        if let Some(dust) = plan
            .outgoing_user_btc
            .iter()
            .chain(plan.outgoing_user_tokens.iter())
            .find(|o| o.amount < DUST_LIMIT_SATS)
        {
            return Err(GrailError::SanityCheckFailed {
                message: format!(
                    "output to {} is below the dust limit: {} < {}",
                    dust.address, dust.amount, DUST_LIMIT_SATS
                ),
            });
        }
    }

    let btc_in: u64 = amounts
        .user_btc_sats
        .iter()
        .chain(amounts.grail_btc_sats.iter())
        .sum();
    let btc_out: u64 = plan.outgoing_user_btc.iter().map(|o| o.amount).sum();
    let change = btc_in.checked_sub(btc_out).ok_or(GrailError::InsufficientFunds {
        required: btc_out,
        available: btc_in,
    })?;

    Ok(if change < DUST_LIMIT_SATS { 0 } else { change })
}

/// The NFT being spent and the state it carries
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreviousNft {
    pub txid: Txid,
    pub cosigners: CosignerSet,
}

/// One state transition, ready for the prover
#[derive(Debug, Clone, PartialEq)]
pub struct SpellRequest {
    pub app_id: String,
    pub app_vk: String,
    pub ticker: String,
    pub nft_action: NftAction,
    pub token_action: Option<TokenAction>,
    /// `None` only for deploy
    pub previous: Option<PreviousNft>,
    pub next_cosigners: CosignerSet,
    pub next_address: String,
    pub plan: TransferPlan,
    /// BTC returned to the grail at `next_address`
    pub grail_change: u64,
    pub funding: Utxo,
    pub change_address: String,
    pub fee_rate: f64,
}

fn nft_charm(ticker: &str, cosigners: &CosignerSet) -> Value {
    json!({
        "ticker": ticker,
        "current_cosigners": cosigners.record_string(),
        "current_threshold": cosigners.threshold(),
    })
}

fn utxo_ref(outpoint: &OutPoint) -> Value {
    json!({ "utxo_id": format!("{}:{}", outpoint.txid, outpoint.vout) })
}

impl SpellDocument for SpellRequest {
    fn to_document(&self) -> Value {
        let app_ref = format!("{}/{}", self.app_id, self.app_vk);

        let mut apps = Map::new();
        apps.insert(NFT_SLOT.into(), json!(format!("n/{}", app_ref)));
        let mut public_inputs = Map::new();
        public_inputs.insert(NFT_SLOT.into(), json!({ "action": self.nft_action.as_str() }));
        if let Some(token_action) = self.token_action {
            apps.insert(TOKEN_SLOT.into(), json!(format!("t/{}", app_ref)));
            public_inputs.insert(TOKEN_SLOT.into(), json!({ "action": token_action.as_str() }));
        }

        let mut ins = Vec::new();
        if let Some(previous) = &self.previous {
            ins.push(json!({
                "utxo_id": format!("{}:0", previous.txid),
                "charms": { NFT_SLOT: nft_charm(&self.ticker, &previous.cosigners) },
            }));
        }
        ins.extend(self.plan.incoming_user_btc.iter().map(|p| utxo_ref(&p.outpoint)));
        ins.extend(self.plan.incoming_grail_btc.iter().map(utxo_ref));
        ins.extend(self.plan.incoming_user_tokens.iter().map(|p| utxo_ref(&p.outpoint)));

        let mut outs = vec![json!({
            "address": self.next_address,
            "charms": { NFT_SLOT: nft_charm(&self.ticker, &self.next_cosigners) },
        })];
        outs.extend(self.plan.outgoing_user_btc.iter().map(|o| {
            json!({
                "address": o.address,
                "amount": o.amount,
                "charms": { NFT_SLOT: { "type": "user_btc" } },
            })
        }));
        outs.extend(self.plan.outgoing_user_tokens.iter().map(|o| {
            json!({
                "address": o.address,
                "charms": {
                    NFT_SLOT: { "type": "user_charms" },
                    TOKEN_SLOT: { "amount": o.amount },
                },
            })
        }));
        if self.grail_change > 0 {
            outs.push(json!({
                "address": self.next_address,
                "amount": self.grail_change,
                "charms": { NFT_SLOT: { "type": "grail_btc" } },
            }));
        }

        let mut document = Map::new();
        document.insert("version".into(), json!(SPELL_VERSION));
        document.insert("apps".into(), Value::Object(apps));
        if self.nft_action == NftAction::Deploy {
            document.insert(
                "private_inputs".into(),
                json!({ NFT_SLOT: self.funding.outpoint_id() }),
            );
        }
        document.insert("public_inputs".into(), Value::Object(public_inputs));
        document.insert("ins".into(), Value::Array(ins));
        document.insert("outs".into(), Value::Array(outs));
        Value::Object(document)
    }

    fn funding(&self) -> &Utxo {
        &self.funding
    }

    fn change_address(&self) -> &str {
        &self.change_address
    }

    fn fee_rate(&self) -> f64 {
        self.fee_rate
    }

    fn spent_outpoints(&self) -> Vec<OutPoint> {
        let mut outpoints = Vec::new();
        if let Some(previous) = &self.previous {
            outpoints.push(OutPoint::new(previous.txid, 0));
        }
        outpoints.extend(self.plan.incoming_user_btc.iter().map(|p| p.outpoint));
        outpoints.extend(self.plan.incoming_grail_btc.iter().copied());
        outpoints.extend(self.plan.incoming_user_tokens.iter().map(|p| p.outpoint));
        outpoints
    }

    fn action(&self) -> &'static str {
        self.nft_action.as_str()
    }
}

/// A token UTXO and the amount it holds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenUtxo {
    pub outpoint: OutPoint,
    pub amount: u64,
}

/// Take token UTXOs in the given order until they cover `amount`
pub fn select_token_utxos(available: &[TokenUtxo], amount: u64) -> GrailResult<Vec<TokenUtxo>> {
    if amount == 0 {
        return Err(GrailError::config("transfer amount must be positive"));
    }

    let mut selected = Vec::new();
    let mut total = 0u64;
    for utxo in available {
        if total >= amount {
            break;
        }
        total = total.saturating_add(utxo.amount);
        selected.push(*utxo);
    }

    if total < amount {
        return Err(GrailError::InsufficientTokens {
            required: amount,
            available: total,
        });
    }
    Ok(selected)
}

/// Tokens moving from the wallet to another address
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenTransfer {
    pub inputs: Vec<TokenUtxo>,
    pub output_address: String,
    /// Receives whatever the inputs hold beyond `amount`
    pub change_address: String,
    pub amount: u64,
}

impl TokenTransfer {
    pub fn input_total(&self) -> u64 {
        self.inputs.iter().map(|utxo| utxo.amount).sum()
    }

    /// Tokens returned to `change_address`
    pub fn change(&self) -> GrailResult<u64> {
        let total = self.input_total();
        if self.inputs.is_empty() || total == 0 {
            return Err(GrailError::config("transfer has no token inputs"));
        }
        total
            .checked_sub(self.amount)
            .ok_or(GrailError::InsufficientTokens {
                required: self.amount,
                available: total,
            })
    }
}

/// A token transfer, ready for the prover
#[derive(Debug, Clone, PartialEq)]
pub struct TransferRequest {
    pub token_app: String,
    pub transfer: TokenTransfer,
    pub token_change: u64,
    pub funding: Utxo,
    pub funding_change_address: String,
    pub fee_rate: f64,
}

impl TransferRequest {
    pub fn new(
        config: &GrailConfig,
        transfer: TokenTransfer,
        funding: Utxo,
        funding_change_address: String,
    ) -> GrailResult<Self> {
        let token_change = transfer.change()?;
        Ok(Self {
            token_app: config.token_app(),
            transfer,
            token_change,
            funding,
            funding_change_address,
            fee_rate: config.fee_rate,
        })
    }
}

impl SpellDocument for TransferRequest {
    fn to_document(&self) -> Value {
        let ins: Vec<Value> = self
            .transfer
            .inputs
            .iter()
            .map(|utxo| {
                json!({
                    "utxo_id": format!("{}:{}", utxo.outpoint.txid, utxo.outpoint.vout),
                    "charms": { TRANSFER_SLOT: utxo.amount },
                })
            })
            .collect();

        let mut outs = vec![json!({
            "address": self.transfer.output_address,
            "charms": { TRANSFER_SLOT: self.transfer.amount },
        })];
        if self.token_change > 0 {
            outs.push(json!({
                "address": self.transfer.change_address,
                "charms": { TRANSFER_SLOT: self.token_change },
            }));
        }

        json!({
            "version": SPELL_VERSION,
            "apps": { TRANSFER_SLOT: self.token_app },
            "public_inputs": { TRANSFER_SLOT: { "action": TokenAction::Transfer.as_str() } },
            "ins": ins,
            "outs": outs,
        })
    }

    fn funding(&self) -> &Utxo {
        &self.funding
    }

    fn change_address(&self) -> &str {
        &self.funding_change_address
    }

    fn fee_rate(&self) -> f64 {
        self.fee_rate
    }

    fn spent_outpoints(&self) -> Vec<OutPoint> {
        self.transfer.inputs.iter().map(|utxo| utxo.outpoint).collect()
    }

    fn action(&self) -> &'static str {
        TokenAction::Transfer.as_str()
    }
}
