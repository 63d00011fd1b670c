//! # Custody Pipeline
//!
//! Every transition runs the same sequence against one custody chain:
//!
//! 1. read the state committed by the previous spell (fetched, never recomputed)
//! 2. derive the grail address of the next cosigner set
//! 3. have the prover build the unsigned commitment/spell pair
//! 4. check that the spell commits to exactly the requested state
//! 5. sign the custody inputs with the *previous* cosigners
//! 6. broadcast commitment, then spell
//!
//! Steps 1 to 4 produce a [`PreparedTransition`] that can be signed locally or
//! handed to cosigners offline. Nothing is broadcast until
//! [`GrailCustody::transmit`].

use super::request::{
    balance_plan, PlanAmounts, PreviousNft, SpellDocument, SpellRequest, TransferPlan, UserPayment,
};
use super::state::{parse_state_record, token_amount, CustodyPhase, Operation, StateRecord};
use crate::config::{custody::WALLET_SIGHASH, GrailConfig};
use crate::crypto::KeyPair;
use crate::error::{GrailError, GrailResult};
use crate::scripts::{grail_address, grail_tree, CosignerSet, SpendingScript};
use crate::services::{NodeRpc, Spell, SpellProver};
use crate::signing::{
    finalize_signatures, sign_with_keys, InputAuthorization, SignatureRequest, SignatureResponse,
};
use crate::taproot::TapTree;
use crate::utils::{tx, utxo::Utxo};
use bitcoin::{OutPoint, Transaction, TxOut, Txid};
use serde::{Deserialize, Serialize};

/// A proved transition awaiting cosigner signatures
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreparedTransition {
    pub phase: CustodyPhase,
    pub app_id: String,
    pub next_address: String,
    pub next_cosigners: Vec<String>,
    pub next_threshold: usize,
    /// Commitment transaction hex, signed by the node wallet at transmit time
    pub commitment: String,
    /// The spell transaction and what each custody input needs
    pub signatures: SignatureRequest,
}

/// Txids of a broadcast transition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransitionReceipt {
    pub phase: CustodyPhase,
    pub commitment_txid: Txid,
    pub spell_txid: Txid,
    pub next_address: String,
}

/// How one custody input is unlocked
struct Authority {
    cosigners: CosignerSet,
    tree: TapTree,
    leaf: usize,
}

impl Authority {
    fn grail(cosigners: &CosignerSet, config: &GrailConfig) -> GrailResult<Self> {
        Ok(Self {
            cosigners: cosigners.clone(),
            tree: grail_tree(cosigners, config.network)?,
            leaf: 0,
        })
    }

    fn user_payment(payment: &UserPayment, config: &GrailConfig) -> GrailResult<Self> {
        Ok(Self {
            cosigners: payment.policy.grail_state.clone(),
            tree: payment.policy.tree(config.network)?,
            leaf: crate::scripts::USER_PAYMENT_GRAIL_LEAF,
        })
    }
}

/// Plan inputs resolved against the chain
struct ResolvedPlan {
    amounts: PlanAmounts,
    locked_states: Vec<CosignerSet>,
    previous_txs: Vec<String>,
}

pub(super) fn push_unique(txs: &mut Vec<String>, hex: String) {
    if !txs.contains(&hex) {
        txs.push(hex);
    }
}

/// Fetch a transaction or fail with `PreviousStateNotFound`
pub(super) fn fetch_hex<N: NodeRpc>(node: &N, txid: &Txid) -> GrailResult<String> {
    node.get_transaction_hex(txid)?
        .ok_or_else(|| GrailError::PreviousStateNotFound {
            txid: txid.to_string(),
        })
}

/// The node signs its commitment inputs, then commitment and spell go out in that order
pub(super) fn transmit_spell<N: NodeRpc>(node: &N, spell: &Spell) -> GrailResult<(Txid, Txid)> {
    let signed_commitment =
        node.sign_transaction(&tx::encode(&spell.commitment), &[], WALLET_SIGHASH)?;

    let commitment_txid = node.broadcast(&signed_commitment)?;
    log::info!("broadcast commitment {}", commitment_txid);
    let spell_txid = node.broadcast(&tx::encode(&spell.spell))?;
    log::info!("broadcast spell {}", spell_txid);

    Ok((commitment_txid, spell_txid))
}

/// State machine for one custody chain
pub struct GrailCustody<'a, N: NodeRpc, P: SpellProver> {
    config: &'a GrailConfig,
    node: &'a N,
    prover: &'a P,
}

impl<'a, N: NodeRpc, P: SpellProver> GrailCustody<'a, N, P> {
    pub fn new(config: &'a GrailConfig, node: &'a N, prover: &'a P) -> Self {
        Self { config, node, prover }
    }

    fn fetch_hex(&self, txid: &Txid) -> GrailResult<String> {
        fetch_hex(self.node, txid)
    }

    fn fetch_output(&self, outpoint: &OutPoint) -> GrailResult<(String, TxOut)> {
        let hex = self.fetch_hex(&outpoint.txid)?;
        let transaction = tx::decode(&hex)?;
        let output = transaction
            .output
            .get(outpoint.vout as usize)
            .cloned()
            .ok_or_else(|| {
                GrailError::transaction(format!(
                    "{} has no output {}",
                    outpoint.txid, outpoint.vout
                ))
            })?;
        Ok((hex, output))
    }

    /// State committed by the spell in `txid`
    pub fn read_previous_state(&self, txid: &Txid) -> GrailResult<StateRecord> {
        let hex = self.fetch_hex(txid)?;
        let spell = self.prover.show_spell(&hex)?;
        let record = parse_state_record(&spell)?;
        log::info!("state at {}: {}", txid, record.cosigners);
        Ok(record)
    }

    /// Look up every plan input on chain
    fn resolve_plan(&self, plan: &TransferPlan) -> GrailResult<ResolvedPlan> {
        let mut resolved = ResolvedPlan {
            amounts: PlanAmounts::default(),
            locked_states: Vec::new(),
            previous_txs: Vec::new(),
        };

        for payment in &plan.incoming_user_btc {
            let (hex, output) = self.fetch_output(&payment.outpoint)?;
            resolved.amounts.user_btc_sats.push(output.value.to_sat());
            push_unique(&mut resolved.previous_txs, hex);
        }

        for outpoint in &plan.incoming_grail_btc {
            let (hex, output) = self.fetch_output(outpoint)?;
            let record = parse_state_record(&self.prover.show_spell(&hex)?)?;
            resolved.amounts.grail_btc_sats.push(output.value.to_sat());
            resolved.locked_states.push(record.cosigners);
            push_unique(&mut resolved.previous_txs, hex);
        }

        let token_app = self.config.token_app();
        for payment in &plan.incoming_user_tokens {
            let hex = self.fetch_hex(&payment.outpoint.txid)?;
            let spell = self.prover.show_spell(&hex)?;
            resolved
                .amounts
                .user_token_amounts
                .push(token_amount(&spell, payment.outpoint.vout, &token_app)?);
            push_unique(&mut resolved.previous_txs, hex);
        }

        Ok(resolved)
    }

    /// Run steps 1 to 4 for `operation`.
    ///
    /// `previous_nft` is the txid of the last spell of the chain and must be
    /// absent exactly for deploy. The funding UTXO is taken from the node
    /// wallet unless given.
    pub fn prepare(
        &self,
        operation: &Operation,
        previous_nft: Option<&Txid>,
        next_cosigners: &CosignerSet,
        funding: Option<Utxo>,
    ) -> GrailResult<PreparedTransition> {
        let phase = operation.phase();
        let funding = match funding {
            Some(utxo) => utxo,
            None => self.node.get_funding_utxo()?,
        };

        let (config, previous) = match (operation, previous_nft) {
            (Operation::Deploy, None) => {
                if next_cosigners.len() != 1 || next_cosigners.threshold() != 1 {
                    return Err(GrailError::config(format!(
                        "deploy takes a single deployer key with threshold 1, got {}",
                        next_cosigners
                    )));
                }
                (self.config.for_deploy(&funding), None)
            }
            (Operation::Deploy, Some(_)) => {
                return Err(GrailError::config(
                    "deploy starts a new chain and spends no previous NFT",
                ))
            }
            (_, None) => {
                return Err(GrailError::config(format!(
                    "{} needs the previous NFT transaction",
                    phase
                )))
            }
            (_, Some(txid)) => {
                let record = self.read_previous_state(txid)?;
                (self.config.clone(), Some((*txid, record)))
            }
        };
        config.require_app()?;

        let next_address = grail_address(next_cosigners, config.network)?;
        log::info!("preparing {} transition to {} ({})", phase, next_address, next_cosigners);

        let mut plan = operation.transfer_plan();
        let resolved = self.resolve_plan(&plan)?;
        plan.mirror_amounts(&resolved.amounts);
        let grail_change = balance_plan(&plan, &resolved.amounts)?;

        let mut previous_txs = Vec::new();
        if let Some((txid, _)) = &previous {
            previous_txs.push(self.fetch_hex(txid)?);
        }
        for hex in &resolved.previous_txs {
            push_unique(&mut previous_txs, hex.clone());
        }
        push_unique(&mut previous_txs, self.fetch_hex(&funding.txid)?);

        let ticker = previous
            .as_ref()
            .and_then(|(_, record)| record.ticker.clone())
            .unwrap_or_else(|| config.ticker.clone());

        let request = SpellRequest {
            app_id: config.app_id.clone(),
            app_vk: config.app_vk.clone(),
            ticker,
            nft_action: operation.nft_action(),
            token_action: operation.token_action(),
            previous: previous.as_ref().map(|(txid, record)| PreviousNft {
                txid: *txid,
                cosigners: record.cosigners.clone(),
            }),
            next_cosigners: next_cosigners.clone(),
            next_address: next_address.to_string(),
            plan,
            grail_change,
            funding,
            change_address: self.node.get_change_address()?,
            fee_rate: config.fee_rate,
        };

        let spell = self.prover.prove(&request, &previous_txs)?;
        self.verify_commitment(&spell.spell, next_cosigners, &config)?;

        let authorities = self.authorities(&request, &resolved, &config)?;
        let prevouts = self.collect_prevouts(&spell)?;
        let signatures = self.authorize_inputs(&request, &spell.spell, &prevouts, authorities)?;
        log::debug!(
            "prepared {} with {} custody input(s)",
            spell.spell.compute_txid(),
            signatures.inputs.len()
        );

        Ok(PreparedTransition {
            phase,
            app_id: config.app_id,
            next_address: next_address.to_string(),
            next_cosigners: next_cosigners.keys_hex(),
            next_threshold: next_cosigners.threshold(),
            commitment: tx::encode(&spell.commitment),
            signatures,
        })
    }

    /// Output 0 must pay the next grail address and carry the requested state
    fn verify_commitment(
        &self,
        spell: &Transaction,
        next_cosigners: &CosignerSet,
        config: &GrailConfig,
    ) -> GrailResult<()> {
        let expected_script = grail_tree(next_cosigners, config.network)?.script_pubkey()?;
        let first = spell
            .output
            .first()
            .ok_or_else(|| GrailError::StateCommitmentMismatch {
                expected: expected_script.to_hex_string(),
                actual: "no outputs".to_string(),
            })?;
        if first.script_pubkey != expected_script {
            return Err(GrailError::StateCommitmentMismatch {
                expected: expected_script.to_hex_string(),
                actual: first.script_pubkey.to_hex_string(),
            });
        }

        let committed = parse_state_record(&self.prover.show_spell(&tx::encode(spell))?)?;
        if committed.cosigners != *next_cosigners {
            log::warn!("spell commits to {} instead of {}", committed.cosigners, next_cosigners);
            return Err(GrailError::StateCommitmentMismatch {
                expected: next_cosigners.to_string(),
                actual: committed.cosigners.to_string(),
            });
        }
        Ok(())
    }

    /// Unlocking authority for each spent outpoint, in spend order
    fn authorities(
        &self,
        request: &SpellRequest,
        resolved: &ResolvedPlan,
        config: &GrailConfig,
    ) -> GrailResult<Vec<Authority>> {
        let mut authorities = Vec::new();
        if let Some(previous) = &request.previous {
            authorities.push(Authority::grail(&previous.cosigners, config)?);
        }
        for payment in &request.plan.incoming_user_btc {
            authorities.push(Authority::user_payment(payment, config)?);
        }
        for state in &resolved.locked_states {
            authorities.push(Authority::grail(state, config)?);
        }
        for payment in &request.plan.incoming_user_tokens {
            authorities.push(Authority::user_payment(payment, config)?);
        }
        Ok(authorities)
    }

    /// Prevouts of every spell input, custody or not
    fn collect_prevouts(&self, spell: &Spell) -> GrailResult<Vec<TxOut>> {
        let commitment_txid = spell.commitment.compute_txid();
        spell
            .spell
            .input
            .iter()
            .map(|input| {
                let outpoint = input.previous_output;
                if outpoint.txid == commitment_txid {
                    spell
                        .commitment
                        .output
                        .get(outpoint.vout as usize)
                        .cloned()
                        .ok_or_else(|| {
                            GrailError::transaction(format!(
                                "commitment has no output {}",
                                outpoint.vout
                            ))
                        })
                } else {
                    Ok(self.fetch_output(&outpoint)?.1)
                }
            })
            .collect()
    }

    /// Match spell inputs to the requested outpoints and record who signs each
    fn authorize_inputs(
        &self,
        request: &SpellRequest,
        spell: &Transaction,
        prevouts: &[TxOut],
        authorities: Vec<Authority>,
    ) -> GrailResult<SignatureRequest> {
        let outpoints = request.spent_outpoints();
        let mut inputs = Vec::with_capacity(outpoints.len());

        for (index, (outpoint, authority)) in outpoints.iter().zip(authorities).enumerate() {
            let input = spell.input.get(index).ok_or_else(|| GrailError::StateCommitmentMismatch {
                expected: format!("input {} spending {}", index, outpoint),
                actual: format!("{} inputs", spell.input.len()),
            })?;
            if input.previous_output != *outpoint {
                return Err(GrailError::StateCommitmentMismatch {
                    expected: format!("input {} spending {}", index, outpoint),
                    actual: input.previous_output.to_string(),
                });
            }

            let expected_script = authority.tree.script_pubkey()?;
            if prevouts[index].script_pubkey != expected_script {
                return Err(GrailError::StateCommitmentMismatch {
                    expected: expected_script.to_hex_string(),
                    actual: prevouts[index].script_pubkey.to_hex_string(),
                });
            }

            let spend = SpendingScript {
                script: authority.tree.script(authority.leaf)?.clone(),
                control_block: authority.tree.control_block(authority.leaf)?,
            };
            inputs.push(InputAuthorization::new(index, &authority.cosigners, &spend));
        }

        Ok(SignatureRequest::new(spell, prevouts, inputs))
    }

    /// Step 5 with locally held keys. Keys outside an input's cosigner set are
    /// ignored.
    pub fn sign(&self, prepared: &PreparedTransition, key_pairs: &[KeyPair]) -> GrailResult<Spell> {
        Ok(Spell {
            commitment: tx::decode(&prepared.commitment)?,
            spell: sign_with_keys(&prepared.signatures, key_pairs)?,
        })
    }

    /// Step 5 from signatures collected offline
    pub fn finalize(
        &self,
        prepared: &PreparedTransition,
        responses: &[SignatureResponse],
    ) -> GrailResult<Spell> {
        Ok(Spell {
            commitment: tx::decode(&prepared.commitment)?,
            spell: finalize_signatures(&prepared.signatures, responses)?,
        })
    }

    /// Step 6: the node signs the commitment, which is broadcast before the spell
    pub fn transmit(&self, spell: &Spell) -> GrailResult<(Txid, Txid)> {
        transmit_spell(self.node, spell)
    }

    /// The whole pipeline with local keys
    pub fn execute(
        &self,
        operation: &Operation,
        previous_nft: Option<&Txid>,
        next_cosigners: &CosignerSet,
        key_pairs: &[KeyPair],
    ) -> GrailResult<TransitionReceipt> {
        let prepared = self.prepare(operation, previous_nft, next_cosigners, None)?;
        let spell = self.sign(&prepared, key_pairs)?;
        let (commitment_txid, spell_txid) = self.transmit(&spell)?;

        Ok(TransitionReceipt {
            phase: prepared.phase,
            commitment_txid,
            spell_txid,
            next_address: prepared.next_address,
        })
    }
}
