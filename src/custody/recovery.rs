//! User payment outputs: locating them and reclaiming them after the timelock.

use crate::crypto::KeyPair;
use crate::error::{GrailError, GrailResult};
use crate::scripts::UserPaymentPolicy;
use crate::signing::{assemble_witness, collect_signatures, tapscript_sighash};
use bitcoin::absolute::LockTime;
use bitcoin::transaction::Version;
use bitcoin::{
    Address, Amount, Network, OutPoint, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Witness,
};

/// Index of the first output of `transaction` paying `address`
pub fn find_user_payment_vout(transaction: &Transaction, address: &Address) -> GrailResult<u32> {
    let script_pubkey = address.script_pubkey();
    transaction
        .output
        .iter()
        .position(|output| output.script_pubkey == script_pubkey)
        .map(|vout| vout as u32)
        .ok_or_else(|| GrailError::PaymentOutputNotFound {
            txid: transaction.compute_txid().to_string(),
            address: address.to_string(),
        })
}

/// Spend a user payment back to its payer through the recovery leaf.
///
/// The input sequence carries the relative timelock, so the transaction is
/// only valid once the payment has `timelock_blocks` confirmations.
pub fn build_recovery_transaction(
    policy: &UserPaymentPolicy,
    outpoint: OutPoint,
    prevout: &TxOut,
    recovery_key: &KeyPair,
    destination: &Address,
    fee_sats: u64,
    network: Network,
) -> GrailResult<Transaction> {
    if recovery_key.public_key() != policy.recovery_key {
        return Err(GrailError::UnauthorizedSigner {
            public_key: recovery_key.public_key_hex(),
        });
    }
    let value = prevout.value.to_sat();
    let remaining = value
        .checked_sub(fee_sats)
        .filter(|sats| *sats > 0)
        .ok_or(GrailError::InsufficientFunds {
            required: fee_sats,
            available: value,
        })?;

    let spend = policy.recovery_spend(network)?;
    let blocks = u16::try_from(policy.timelock_blocks).map_err(|_| {
        GrailError::transaction(format!(
            "timelock {} does not fit a sequence",
            policy.timelock_blocks
        ))
    })?;

    let mut transaction = Transaction {
        version: Version::TWO,
        lock_time: LockTime::ZERO,
        input: vec![TxIn {
            previous_output: outpoint,
            script_sig: ScriptBuf::new(),
            sequence: Sequence::from_height(blocks),
            witness: Witness::new(),
        }],
        output: vec![TxOut {
            value: Amount::from_sat(remaining),
            script_pubkey: destination.script_pubkey(),
        }],
    };

    let sighash = tapscript_sighash(&transaction, 0, std::slice::from_ref(prevout), &spend.script)?;
    let signatures = collect_signatures(&sighash, std::slice::from_ref(recovery_key), 1)?;
    transaction.input[0].witness = assemble_witness(
        &[policy.recovery_key],
        1,
        &signatures,
        &spend.script,
        &spend.control_block,
    )?;

    log::info!(
        "recovery of {} after {} blocks: {} sats to {}",
        outpoint,
        blocks,
        remaining,
        destination
    );
    Ok(transaction)
}
