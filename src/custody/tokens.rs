//! Token transfers between wallet-held outputs.
//!
//! Unlike custody transitions these spells carry no NFT and need no cosigner
//! signatures: every token input belongs to the node wallet, which signs the
//! spell itself.

use super::machine::{fetch_hex, push_unique, transmit_spell};
use super::request::{select_token_utxos, SpellDocument, TokenTransfer, TokenUtxo, TransferRequest};
use super::state::token_amount;
use crate::config::{custody::WALLET_SIGHASH, GrailConfig};
use crate::error::{GrailError, GrailResult};
use crate::services::{NodeRpc, Spell, SpellProver};
use crate::utils::{address, tx};
use bitcoin::Txid;

/// Token operations on the node wallet
pub struct TokenWallet<'a, N: NodeRpc, P: SpellProver> {
    config: &'a GrailConfig,
    node: &'a N,
    prover: &'a P,
}

impl<'a, N: NodeRpc, P: SpellProver> TokenWallet<'a, N, P> {
    pub fn new(config: &'a GrailConfig, node: &'a N, prover: &'a P) -> Self {
        Self { config, node, prover }
    }

    /// Wallet UTXOs holding the configured token, in wallet order.
    ///
    /// Outputs whose transaction carries no spell, or whose spell holds no
    /// tokens of this app at that output, are skipped.
    pub fn list_token_utxos(&self) -> GrailResult<Vec<TokenUtxo>> {
        self.config.require_app()?;
        let token_app = self.config.token_app();

        let mut found = Vec::new();
        for utxo in self.node.list_wallet_utxos()? {
            let hex = fetch_hex(self.node, &utxo.txid)?;
            let spell = match self.prover.show_spell(&hex) {
                Ok(spell) => spell,
                Err(GrailError::ExternalProverFailure { message }) => {
                    log::debug!("{} carries no spell: {}", utxo.txid, message.trim());
                    continue;
                }
                Err(e) => return Err(e),
            };
            match token_amount(&spell, utxo.vout, &token_app) {
                Ok(0) | Err(GrailError::MalformedStateRecord { .. }) => continue,
                Ok(amount) => found.push(TokenUtxo {
                    outpoint: utxo.outpoint(),
                    amount,
                }),
                Err(e) => return Err(e),
            }
        }

        log::info!(
            "wallet holds {} {} UTXO(s), {} tokens in total",
            found.len(),
            token_app,
            found.iter().map(|utxo| utxo.amount).sum::<u64>()
        );
        Ok(found)
    }

    /// Prove a transfer of `amount` tokens and have the node sign it.
    ///
    /// Addresses left out are taken fresh from the node wallet. Nothing is
    /// broadcast until [`TokenWallet::transmit`].
    pub fn prepare_transfer(
        &self,
        amount: u64,
        output_address: Option<&str>,
        change_address: Option<&str>,
    ) -> GrailResult<Spell> {
        self.config.require_app()?;

        let funding = self.node.get_funding_utxo()?;
        let candidates: Vec<TokenUtxo> = self
            .list_token_utxos()?
            .into_iter()
            .filter(|utxo| utxo.outpoint != funding.outpoint())
            .collect();
        let inputs = select_token_utxos(&candidates, amount)?;

        let transfer = TokenTransfer {
            inputs,
            output_address: self.wallet_address(output_address)?,
            change_address: self.wallet_address(change_address)?,
            amount,
        };
        log::info!(
            "transferring {} tokens to {} from {} input(s)",
            amount,
            transfer.output_address,
            transfer.inputs.len()
        );
        let request = TransferRequest::new(
            self.config,
            transfer,
            funding,
            self.node.get_change_address()?,
        )?;

        let mut previous_txs = Vec::new();
        for outpoint in request.spent_outpoints() {
            push_unique(&mut previous_txs, fetch_hex(self.node, &outpoint.txid)?);
        }
        push_unique(&mut previous_txs, fetch_hex(self.node, &funding.txid)?);

        let mut spell = self.prover.prove(&request, &previous_txs)?;
        check_spent_inputs(&spell, &request)?;

        let commitment_txid = spell.commitment.compute_txid();
        let pending: Vec<_> = spell
            .spell
            .input
            .iter()
            .filter(|input| input.previous_output.txid == commitment_txid)
            .filter_map(|input| {
                let outpoint = input.previous_output;
                let output = spell.commitment.output.get(outpoint.vout as usize)?;
                Some((outpoint, output.clone()))
            })
            .collect();
        let signed = self
            .node
            .sign_transaction(&tx::encode(&spell.spell), &pending, WALLET_SIGHASH)?;
        spell.spell = tx::decode(&signed)?;
        log::debug!("node signed transfer spell {}", spell.spell.compute_txid());

        Ok(spell)
    }

    /// Broadcast commitment, then the signed transfer spell
    pub fn transmit(&self, spell: &Spell) -> GrailResult<(Txid, Txid)> {
        transmit_spell(self.node, spell)
    }

    fn wallet_address(&self, given: Option<&str>) -> GrailResult<String> {
        let address = match given {
            Some(address) => address.to_string(),
            None => self.node.get_change_address()?,
        };
        address::validate_and_parse(&address, self.config.network)?;
        Ok(address)
    }
}

/// The spell must spend the selected token outputs first, in order
fn check_spent_inputs(spell: &Spell, request: &TransferRequest) -> GrailResult<()> {
    for (index, outpoint) in request.spent_outpoints().iter().enumerate() {
        let actual = spell
            .spell
            .input
            .get(index)
            .map(|input| input.previous_output.to_string())
            .unwrap_or_else(|| format!("{} inputs", spell.spell.input.len()));
        if actual != outpoint.to_string() {
            return Err(GrailError::StateCommitmentMismatch {
                expected: format!("input {} spending {}", index, outpoint),
                actual,
            });
        }
    }
    Ok(())
}
