//! # Threshold Signature Assembly
//!
//! Signs tapscript inputs for a cosigner quorum and turns the collected
//! signatures into script-path witnesses.
//!
//! Signatures are BIP-340 Schnorr without auxiliary randomness, so signing the
//! same sighash with the same key always yields the same bytes and a rerun of
//! a failed pipeline reproduces its witnesses exactly.
//!
//! ## Witness layout
//!
//! The multisig leaf checks keys in sorted order and `OP_CHECKSIG` for the
//! first key consumes the top stack element. Slots are therefore computed in
//! key order and pushed last-key-first, which leaves the first key's slot on
//! top of the initial stack:
//!
//! ```text
//! bottom  [slot n-1] … [slot 1] [slot 0] [script] [control block]  top
//! ```
//!
//! A cosigner that did not sign contributes an empty push, which the script
//! counts as zero.

use crate::crypto::{parse_x_only, KeyPair};
use crate::error::{GrailError, GrailResult};
use crate::scripts::{CosignerSet, SpendingScript};
use crate::taproot::ControlBlock;
use crate::utils::tx;
use bitcoin::hashes::Hash;
use bitcoin::key::XOnlyPublicKey;
use bitcoin::secp256k1::{schnorr, Message, Secp256k1};
use bitcoin::sighash::{Prevouts, SighashCache};
use bitcoin::taproot::{LeafVersion, TapLeafHash};
use bitcoin::{Amount, ScriptBuf, TapSighash, TapSighashType, Transaction, TxOut, Witness};
use serde::{Deserialize, Serialize};

/// One cosigner's signature over one input
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartialSignature {
    pub public_key: XOnlyPublicKey,
    pub signature: schnorr::Signature,
}

/// BIP341 script-path sighash (`SIGHASH_DEFAULT`, all prevouts committed)
pub fn tapscript_sighash(
    transaction: &Transaction,
    input_index: usize,
    prevouts: &[TxOut],
    script: &ScriptBuf,
) -> GrailResult<TapSighash> {
    let leaf_hash = TapLeafHash::from_script(script, LeafVersion::TapScript);
    let mut cache = SighashCache::new(transaction);
    cache
        .taproot_script_spend_signature_hash(
            input_index,
            &Prevouts::All(prevouts),
            leaf_hash,
            TapSighashType::Default,
        )
        .map_err(|e| GrailError::transaction(format!("sighash for input {}: {}", input_index, e)))
}

/// Sign `sighash` with the first `threshold` key pairs
pub fn collect_signatures(
    sighash: &TapSighash,
    key_pairs: &[KeyPair],
    threshold: usize,
) -> GrailResult<Vec<PartialSignature>> {
    if key_pairs.len() < threshold {
        return Err(GrailError::InsufficientSigners {
            required: threshold,
            available: key_pairs.len(),
        });
    }

    let secp = Secp256k1::new();
    let message = Message::from_digest(sighash.to_byte_array());

    Ok(key_pairs
        .iter()
        .take(threshold)
        .map(|pair| PartialSignature {
            public_key: pair.public_key(),
            signature: secp.sign_schnorr_no_aux_rand(&message, pair.keypair()),
        })
        .collect())
}

/// Signature slots in `public_keys` order, empty where a key did not sign
pub fn order_signatures(
    public_keys: &[XOnlyPublicKey],
    threshold: usize,
    signatures: &[PartialSignature],
) -> GrailResult<Vec<Vec<u8>>> {
    if signatures.len() != threshold {
        return Err(GrailError::WrongSignatureCount {
            expected: threshold,
            actual: signatures.len(),
        });
    }

    let mut slots: Vec<Option<Vec<u8>>> = vec![None; public_keys.len()];
    for partial in signatures {
        let position = public_keys
            .iter()
            .position(|key| *key == partial.public_key)
            .ok_or_else(|| GrailError::UnauthorizedSigner {
                public_key: hex::encode(partial.public_key.serialize()),
            })?;
        slots[position] = Some(partial.signature.serialize().to_vec());
    }

    let filled = slots.iter().filter(|slot| slot.is_some()).count();
    if filled != threshold {
        // the same cosigner appeared twice
        return Err(GrailError::WrongSignatureCount {
            expected: threshold,
            actual: filled,
        });
    }

    Ok(slots.into_iter().map(Option::unwrap_or_default).collect())
}

/// Script-path witness: signature slots, then the script, then the control block
pub fn assemble_witness(
    public_keys: &[XOnlyPublicKey],
    threshold: usize,
    signatures: &[PartialSignature],
    script: &ScriptBuf,
    control_block: &ControlBlock,
) -> GrailResult<Witness> {
    let slots = order_signatures(public_keys, threshold, signatures)?;

    let mut witness = Witness::new();
    for slot in slots.iter().rev() {
        witness.push(slot);
    }
    witness.push(script.as_bytes());
    witness.push(control_block.serialize());
    Ok(witness)
}

/// Output being spent, in transport form
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrevoutRecord {
    pub value: u64,
    pub script_pubkey: String,
}

/// An input the cosigners must authorize
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputAuthorization {
    pub index: usize,
    pub cosigners: Vec<String>,
    pub threshold: usize,
    pub script: String,
    pub control_block: String,
}

impl InputAuthorization {
    pub fn new(index: usize, cosigners: &CosignerSet, spend: &SpendingScript) -> Self {
        Self {
            index,
            cosigners: cosigners.keys_hex(),
            threshold: cosigners.threshold(),
            script: hex::encode(spend.script.as_bytes()),
            control_block: hex::encode(spend.control_block.serialize()),
        }
    }

    pub fn cosigner_set(&self) -> GrailResult<CosignerSet> {
        CosignerSet::from_hex(&self.cosigners, self.threshold)
    }

    pub fn script(&self) -> GrailResult<ScriptBuf> {
        let bytes = hex::decode(&self.script)
            .map_err(|e| GrailError::transaction(format!("script hex: {}", e)))?;
        Ok(ScriptBuf::from_bytes(bytes))
    }

    pub fn control_block(&self) -> GrailResult<ControlBlock> {
        let bytes = hex::decode(&self.control_block)
            .map_err(|e| GrailError::transaction(format!("control block hex: {}", e)))?;
        ControlBlock::from_slice(&bytes)
    }
}

/// Everything a cosigner needs to sign a transaction offline
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignatureRequest {
    pub transaction: String,
    pub prevouts: Vec<PrevoutRecord>,
    pub inputs: Vec<InputAuthorization>,
}

impl SignatureRequest {
    pub fn new(
        transaction: &Transaction,
        prevouts: &[TxOut],
        inputs: Vec<InputAuthorization>,
    ) -> Self {
        Self {
            transaction: tx::encode(transaction),
            prevouts: prevouts
                .iter()
                .map(|out| PrevoutRecord {
                    value: out.value.to_sat(),
                    script_pubkey: hex::encode(out.script_pubkey.as_bytes()),
                })
                .collect(),
            inputs,
        }
    }

    pub fn transaction(&self) -> GrailResult<Transaction> {
        tx::decode(&self.transaction)
    }

    pub fn prevouts(&self) -> GrailResult<Vec<TxOut>> {
        self.prevouts
            .iter()
            .map(|record| {
                let script = hex::decode(&record.script_pubkey)
                    .map_err(|e| GrailError::transaction(format!("prevout script hex: {}", e)))?;
                Ok(TxOut {
                    value: Amount::from_sat(record.value),
                    script_pubkey: ScriptBuf::from_bytes(script),
                })
            })
            .collect()
    }

    fn sighash(
        &self,
        transaction: &Transaction,
        prevouts: &[TxOut],
        input: &InputAuthorization,
    ) -> GrailResult<TapSighash> {
        tapscript_sighash(transaction, input.index, prevouts, &input.script()?)
    }
}

/// A signature for one input of a request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputSignature {
    pub index: usize,
    pub signature: String,
}

/// One cosigner's answer to a [`SignatureRequest`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignatureResponse {
    pub public_key: String,
    pub signatures: Vec<InputSignature>,
}

/// Sign every input of `request` that `key_pair` is a cosigner for
pub fn sign_as_cosigner(
    request: &SignatureRequest,
    key_pair: &KeyPair,
) -> GrailResult<SignatureResponse> {
    let transaction = request.transaction()?;
    let prevouts = request.prevouts()?;

    let mut signatures = Vec::new();
    for input in &request.inputs {
        if !input.cosigner_set()?.contains(&key_pair.public_key()) {
            continue;
        }
        let sighash = request.sighash(&transaction, &prevouts, input)?;
        let partial = collect_signatures(&sighash, std::slice::from_ref(key_pair), 1)?;
        signatures.extend(partial.into_iter().map(|p| InputSignature {
            index: input.index,
            signature: hex::encode(p.signature.serialize()),
        }));
    }

    if signatures.is_empty() {
        return Err(GrailError::UnauthorizedSigner {
            public_key: key_pair.public_key_hex(),
        });
    }

    Ok(SignatureResponse {
        public_key: key_pair.public_key_hex(),
        signatures,
    })
}

/// Combine cosigner responses into a fully witnessed transaction.
///
/// Each signature is checked against its sighash. Inputs keep the first
/// `threshold` valid signatures in key order.
pub fn finalize_signatures(
    request: &SignatureRequest,
    responses: &[SignatureResponse],
) -> GrailResult<Transaction> {
    let secp = Secp256k1::verification_only();
    let mut transaction = request.transaction()?;
    let prevouts = request.prevouts()?;

    let mut witnesses = Vec::with_capacity(request.inputs.len());
    for input in &request.inputs {
        let cosigners = input.cosigner_set()?;
        let sighash = request.sighash(&transaction, &prevouts, input)?;
        let message = Message::from_digest(sighash.to_byte_array());

        let mut collected: Vec<PartialSignature> = Vec::new();
        for response in responses {
            let public_key = parse_x_only(&response.public_key)?;
            for entry in response.signatures.iter().filter(|s| s.index == input.index) {
                if !cosigners.contains(&public_key) {
                    return Err(GrailError::UnauthorizedSigner {
                        public_key: response.public_key.clone(),
                    });
                }
                let bytes = hex::decode(&entry.signature)
                    .map_err(|e| GrailError::crypto(format!("signature hex: {}", e)))?;
                let signature = schnorr::Signature::from_slice(&bytes)
                    .map_err(|e| GrailError::crypto(format!("signature: {}", e)))?;
                secp.verify_schnorr(&signature, &message, &public_key).map_err(|_| {
                    GrailError::crypto(format!(
                        "signature from {} does not verify for input {}",
                        response.public_key, input.index
                    ))
                })?;
                if !collected.iter().any(|p| p.public_key == public_key) {
                    collected.push(PartialSignature {
                        public_key,
                        signature,
                    });
                }
            }
        }

        if collected.len() < cosigners.threshold() {
            return Err(GrailError::InsufficientSigners {
                required: cosigners.threshold(),
                available: collected.len(),
            });
        }
        collected.sort_by_key(|p| p.public_key.serialize());
        collected.truncate(cosigners.threshold());

        let witness = assemble_witness(
            cosigners.keys(),
            cosigners.threshold(),
            &collected,
            &input.script()?,
            &input.control_block()?,
        )?;
        witnesses.push((input.index, witness));
    }

    apply_witnesses(&mut transaction, witnesses)?;
    Ok(transaction)
}

/// Sign every input of `request` with whichever of `key_pairs` are cosigners.
///
/// Key pairs outside an input's cosigner set are ignored for that input and a
/// key given twice counts once, so a quorum that is too small surfaces as
/// `InsufficientSigners`.
pub fn sign_with_keys(
    request: &SignatureRequest,
    key_pairs: &[KeyPair],
) -> GrailResult<Transaction> {
    let mut transaction = request.transaction()?;
    let prevouts = request.prevouts()?;

    let mut witnesses = Vec::with_capacity(request.inputs.len());
    for input in &request.inputs {
        let cosigners = input.cosigner_set()?;
        let mut members: Vec<KeyPair> = Vec::new();
        for pair in key_pairs {
            let public_key = pair.public_key();
            if cosigners.contains(&public_key)
                && !members.iter().any(|m| m.public_key() == public_key)
            {
                members.push(pair.clone());
            }
        }

        let sighash = request.sighash(&transaction, &prevouts, input)?;
        let signatures = collect_signatures(&sighash, &members, cosigners.threshold())?;
        log::debug!(
            "input {}: {} of {} cosigners signed",
            input.index,
            signatures.len(),
            cosigners.len()
        );

        let witness = assemble_witness(
            cosigners.keys(),
            cosigners.threshold(),
            &signatures,
            &input.script()?,
            &input.control_block()?,
        )?;
        witnesses.push((input.index, witness));
    }

    apply_witnesses(&mut transaction, witnesses)?;
    Ok(transaction)
}

fn apply_witnesses(
    transaction: &mut Transaction,
    witnesses: Vec<(usize, Witness)>,
) -> GrailResult<()> {
    for (index, witness) in witnesses {
        let input = transaction.input.get_mut(index).ok_or_else(|| {
            GrailError::transaction(format!("signature request names missing input {}", index))
        })?;
        input.witness = witness;
    }
    Ok(())
}
