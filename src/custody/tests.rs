//! End-to-end tests of the custody pipeline against an in-memory node and prover.

use super::*;
use crate::config::GrailConfig;
use crate::crypto::KeyPair;
use crate::error::{GrailError, GrailResult};
use crate::scripts::{grail_address, CosignerSet, UserPaymentPolicy};
use crate::services::{NodeRpc, Spell, SpellProver};
use crate::signing::{sign_as_cosigner, tapscript_sighash};
use crate::utils::{tx, utxo::Utxo};
use bitcoin::absolute::LockTime;
use bitcoin::hashes::Hash;
use bitcoin::secp256k1::{schnorr, Message, Secp256k1};
use bitcoin::transaction::Version;
use bitcoin::{
    Address, Amount, Network, OutPoint, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Txid,
    Witness,
};
use serde_json::{json, Value};
use std::cell::RefCell;
use std::collections::HashMap;
use std::str::FromStr;

fn pair(byte: u8) -> KeyPair {
    let mut secret = [0u8; 32];
    secret[31] = byte;
    KeyPair::from_secret_bytes(&secret).unwrap()
}

fn single(key: &KeyPair) -> CosignerSet {
    CosignerSet::new(vec![key.public_key()], 1).unwrap()
}

/// A wallet address owned by someone outside the custody chain
fn user_address(byte: u8) -> String {
    grail_address(&single(&pair(byte)), Network::Regtest).unwrap().to_string()
}

fn unsigned_tx(inputs: Vec<OutPoint>, outputs: Vec<TxOut>) -> Transaction {
    Transaction {
        version: Version::TWO,
        lock_time: LockTime::ZERO,
        input: inputs
            .into_iter()
            .map(|previous_output| TxIn {
                previous_output,
                script_sig: ScriptBuf::new(),
                sequence: Sequence::ENABLE_RBF_NO_LOCKTIME,
                witness: Witness::new(),
            })
            .collect(),
        output: outputs,
    }
}

fn script_of(address: &str) -> ScriptBuf {
    Address::from_str(address).unwrap().assume_checked().script_pubkey()
}

/// Node with a fixed funding UTXO that records what it is asked to do
struct MemoryNode {
    transactions: RefCell<HashMap<Txid, String>>,
    funding: Utxo,
    /// Wallet UTXOs besides the funding one
    wallet: RefCell<Vec<Utxo>>,
    broadcasts: RefCell<Vec<Txid>>,
    sighash_types: RefCell<Vec<String>>,
    signed_prevouts: RefCell<Vec<OutPoint>>,
}

impl MemoryNode {
    fn new() -> Self {
        let funding_tx = unsigned_tx(
            vec![OutPoint::new(Txid::from_str(&"11".repeat(32)).unwrap(), 0)],
            vec![TxOut {
                value: Amount::from_sat(100_000),
                script_pubkey: script_of(&user_address(90)),
            }],
        );
        let node = MemoryNode {
            transactions: RefCell::new(HashMap::new()),
            funding: Utxo {
                txid: funding_tx.compute_txid(),
                vout: 0,
                value: 100_000,
            },
            wallet: RefCell::new(Vec::new()),
            broadcasts: RefCell::new(Vec::new()),
            sighash_types: RefCell::new(Vec::new()),
            signed_prevouts: RefCell::new(Vec::new()),
        };
        node.insert(&funding_tx);
        node
    }

    fn insert(&self, transaction: &Transaction) -> Txid {
        let txid = transaction.compute_txid();
        self.transactions.borrow_mut().insert(txid, tx::encode(transaction));
        txid
    }
}

impl NodeRpc for MemoryNode {
    fn get_transaction_hex(&self, txid: &Txid) -> GrailResult<Option<String>> {
        Ok(self.transactions.borrow().get(txid).cloned())
    }

    fn get_funding_utxo(&self) -> GrailResult<Utxo> {
        Ok(self.funding)
    }

    fn list_wallet_utxos(&self) -> GrailResult<Vec<Utxo>> {
        let mut utxos = vec![self.funding];
        utxos.extend(self.wallet.borrow().iter().copied());
        Ok(utxos)
    }

    fn sign_transaction(
        &self,
        tx_hex: &str,
        prevouts: &[(OutPoint, TxOut)],
        sighash_type: &str,
    ) -> GrailResult<String> {
        self.sighash_types.borrow_mut().push(sighash_type.to_string());
        self.signed_prevouts
            .borrow_mut()
            .extend(prevouts.iter().map(|(outpoint, _)| *outpoint));
        Ok(tx_hex.to_string())
    }

    fn broadcast(&self, tx_hex: &str) -> GrailResult<Txid> {
        let txid = self.insert(&tx::decode(tx_hex)?);
        self.broadcasts.borrow_mut().push(txid);
        Ok(txid)
    }

    fn get_change_address(&self) -> GrailResult<String> {
        Ok(user_address(91))
    }
}

/// Prover that lays the request out as a transaction pair and remembers the
/// request document as the spell each transaction carries
#[derive(Default)]
struct ScriptedProver {
    spells: RefCell<HashMap<Txid, Value>>,
    requests: RefCell<Vec<Value>>,
    fail: bool,
    /// Commit to a different cosigner set than requested
    tamper: bool,
}

impl SpellProver for ScriptedProver {
    fn prove(&self, request: &dyn SpellDocument, _previous_txs: &[String]) -> GrailResult<Spell> {
        if self.fail {
            return Err(GrailError::prover("app contract not satisfied"));
        }
        let mut document = request.to_document();
        self.requests.borrow_mut().push(document.clone());

        let funding = request.funding();
        let commitment = unsigned_tx(
            vec![funding.outpoint()],
            vec![TxOut {
                value: Amount::from_sat(funding.value - 2_000),
                script_pubkey: script_of(document["outs"][0]["address"].as_str().unwrap()),
            }],
        );

        let mut inputs = request.spent_outpoints();
        inputs.push(OutPoint::new(commitment.compute_txid(), 0));
        let outputs = document["outs"]
            .as_array()
            .unwrap()
            .iter()
            .map(|out| TxOut {
                value: Amount::from_sat(out["amount"].as_u64().unwrap_or(1_000)),
                script_pubkey: script_of(out["address"].as_str().unwrap()),
            })
            .collect();
        let spell = unsigned_tx(inputs, outputs);

        if self.tamper {
            document["outs"][0]["charms"]["$00"]["current_cosigners"] =
                json!(pair(50).public_key_hex());
            document["outs"][0]["charms"]["$00"]["current_threshold"] = json!(1);
        }
        self.spells.borrow_mut().insert(spell.compute_txid(), document);

        Ok(Spell { commitment, spell })
    }

    fn show_spell(&self, tx_hex: &str) -> GrailResult<Value> {
        let txid = tx::decode(tx_hex)?.compute_txid();
        self.spells
            .borrow()
            .get(&txid)
            .cloned()
            .ok_or_else(|| GrailError::prover(format!("no spell in {}", txid)))
    }
}

fn config() -> GrailConfig {
    GrailConfig::new(Network::Regtest, "app", "vk")
}

fn deploy(
    custody: &GrailCustody<MemoryNode, ScriptedProver>,
    deployer: &KeyPair,
) -> TransitionReceipt {
    custody
        .execute(&Operation::Deploy, None, &single(deployer), std::slice::from_ref(deployer))
        .unwrap()
}

#[test]
fn test_deploy_then_update_moves_the_nft() {
    let (node, prover, config) = (MemoryNode::new(), ScriptedProver::default(), config());
    let custody = GrailCustody::new(&config, &node, &prover);
    let (a, b) = (pair(1), pair(2));

    let deployed = deploy(&custody, &a);
    assert_eq!(deployed.phase, CustodyPhase::Deployed);
    assert_eq!(custody.read_previous_state(&deployed.spell_txid).unwrap().cosigners, single(&a));

    let both = CosignerSet::new(vec![a.public_key(), b.public_key()], 2).unwrap();
    let updated = custody
        .execute(&Operation::Update, Some(&deployed.spell_txid), &both, &[a.clone()])
        .unwrap();
    assert_eq!(updated.phase, CustodyPhase::Updated);
    assert_ne!(updated.next_address, deployed.next_address);
    assert_eq!(
        updated.next_address,
        grail_address(&both, Network::Regtest).unwrap().to_string()
    );
    assert_eq!(custody.read_previous_state(&updated.spell_txid).unwrap().cosigners, both);

    // authority now rests with A and B together
    let err = custody
        .execute(&Operation::Update, Some(&updated.spell_txid), &both, &[a.clone()])
        .unwrap_err();
    assert!(matches!(
        err,
        GrailError::InsufficientSigners {
            required: 2,
            available: 1
        }
    ));
    assert!(err.is_quorum_violation());

    // the incoming cosigners cannot authorize their own state
    let err = custody
        .execute(&Operation::Update, Some(&deployed.spell_txid), &both, &[b.clone()])
        .unwrap_err();
    assert!(matches!(err, GrailError::InsufficientSigners { .. }));

    // one key twice is still one signer
    let err = custody
        .execute(&Operation::Update, Some(&updated.spell_txid), &both, &[a.clone(), a.clone()])
        .unwrap_err();
    assert!(matches!(
        err,
        GrailError::InsufficientSigners {
            required: 2,
            available: 1
        }
    ));

    custody
        .execute(&Operation::Update, Some(&updated.spell_txid), &both, &[b, a])
        .unwrap();
}

#[test]
fn test_spell_witness_verifies() {
    let (node, prover, config) = (MemoryNode::new(), ScriptedProver::default(), config());
    let custody = GrailCustody::new(&config, &node, &prover);
    let a = pair(1);
    let deployed = deploy(&custody, &a);

    let prepared = custody
        .prepare(&Operation::Update, Some(&deployed.spell_txid), &single(&a), None)
        .unwrap();
    assert_eq!(prepared.signatures.inputs.len(), 1);
    let spell = custody.sign(&prepared, &[a.clone()]).unwrap().spell;

    let authorization = &prepared.signatures.inputs[0];
    let script = authorization.script().unwrap();
    let witness: Vec<&[u8]> = spell.input[0].witness.iter().collect();
    assert_eq!(witness.len(), 3);
    assert_eq!(witness[1], script.as_bytes());

    let prevouts = prepared.signatures.prevouts().unwrap();
    assert_eq!(prevouts.len(), spell.input.len());
    let sighash = tapscript_sighash(&spell, 0, &prevouts, &script).unwrap();
    Secp256k1::verification_only()
        .verify_schnorr(
            &schnorr::Signature::from_slice(witness[0]).unwrap(),
            &Message::from_digest(sighash.to_byte_array()),
            &a.public_key(),
        )
        .unwrap();

    // the commitment input is left to the node wallet
    assert!(spell.input[1].witness.is_empty());
}

#[test]
fn test_commitment_is_broadcast_before_spell() {
    let (node, prover, config) = (MemoryNode::new(), ScriptedProver::default(), config());
    let custody = GrailCustody::new(&config, &node, &prover);

    let deployed = deploy(&custody, &pair(1));
    assert_eq!(
        *node.broadcasts.borrow(),
        vec![deployed.commitment_txid, deployed.spell_txid]
    );
    assert_eq!(*node.sighash_types.borrow(), vec!["ALL|ANYONECANPAY".to_string()]);

    let request = prover.requests.borrow()[0].clone();
    assert_eq!(request["public_inputs"]["$00"]["action"], json!("deploy"));
    assert_eq!(request["private_inputs"]["$00"], json!(node.funding.outpoint_id()));
    assert_eq!(
        request["apps"]["$00"],
        json!(format!("n/{}/vk", crate::config::derive_app_id(&node.funding)))
    );
}

#[test]
fn test_prover_failure_broadcasts_nothing() {
    let node = MemoryNode::new();
    let prover = ScriptedProver {
        fail: true,
        ..Default::default()
    };
    let config = config();
    let custody = GrailCustody::new(&config, &node, &prover);

    let a = pair(1);
    let err = custody
        .execute(&Operation::Deploy, None, &single(&a), &[a.clone()])
        .unwrap_err();
    match err {
        GrailError::ExternalProverFailure { message } => {
            assert_eq!(message, "app contract not satisfied")
        }
        other => panic!("unexpected error: {}", other),
    }
    assert!(node.broadcasts.borrow().is_empty());
}

#[test]
fn test_commitment_mismatch_is_fatal() {
    let node = MemoryNode::new();
    let prover = ScriptedProver {
        tamper: true,
        ..Default::default()
    };
    let config = config();
    let custody = GrailCustody::new(&config, &node, &prover);

    let a = pair(1);
    let err = custody
        .execute(&Operation::Deploy, None, &single(&a), &[a.clone()])
        .unwrap_err();
    assert!(matches!(err, GrailError::StateCommitmentMismatch { .. }));
    assert!(err.is_security_critical());
    assert!(!err.is_retryable());
    assert!(node.broadcasts.borrow().is_empty());
}

#[test]
fn test_missing_previous_state() {
    let (node, prover, config) = (MemoryNode::new(), ScriptedProver::default(), config());
    let custody = GrailCustody::new(&config, &node, &prover);
    let a = pair(1);

    let unknown = Txid::from_str(&"22".repeat(32)).unwrap();
    let err = custody
        .execute(&Operation::Update, Some(&unknown), &single(&a), &[a.clone()])
        .unwrap_err();
    assert!(matches!(
        err,
        GrailError::PreviousStateNotFound { ref txid } if *txid == unknown.to_string()
    ));
    assert!(err.is_retryable());
    assert!(prover.requests.borrow().is_empty());
}

#[test]
fn test_transition_shape_is_checked() {
    let (node, prover, config) = (MemoryNode::new(), ScriptedProver::default(), config());
    let custody = GrailCustody::new(&config, &node, &prover);
    let (a, b) = (pair(1), pair(2));

    let two = CosignerSet::new(vec![a.public_key(), b.public_key()], 1).unwrap();
    assert!(matches!(
        custody.prepare(&Operation::Deploy, None, &two, None),
        Err(GrailError::Configuration { .. })
    ));
    assert!(matches!(
        custody.prepare(&Operation::Update, None, &single(&a), None),
        Err(GrailError::Configuration { .. })
    ));

    let deployed = deploy(&custody, &a);
    assert!(matches!(
        custody.prepare(&Operation::Deploy, Some(&deployed.spell_txid), &single(&a), None),
        Err(GrailError::Configuration { .. })
    ));
}

#[test]
fn test_peg_in_then_peg_out() {
    let (node, prover, config) = (MemoryNode::new(), ScriptedProver::default(), config());
    let custody = GrailCustody::new(&config, &node, &prover);
    let a = pair(1);
    let grail = single(&a);
    let deployed = deploy(&custody, &a);

    let policy = UserPaymentPolicy {
        grail_state: grail.clone(),
        recovery_key: pair(7).public_key(),
        timelock_blocks: 144,
    };
    let payment_address = policy.address(Network::Regtest).unwrap();
    let user = user_address(8);

    // the user pays 5000 sats into the payment address
    let payment_tx = unsigned_tx(
        vec![OutPoint::new(Txid::from_str(&"33".repeat(32)).unwrap(), 0)],
        vec![TxOut {
            value: Amount::from_sat(5_000),
            script_pubkey: payment_address.script_pubkey(),
        }],
    );
    let payment_txid = node.insert(&payment_tx);
    let peg_in = Operation::PegIn {
        payment: UserPayment {
            policy: policy.clone(),
            outpoint: OutPoint::new(payment_txid, 0),
            user_address: user.clone(),
        },
    };

    let prepared = custody
        .prepare(&peg_in, Some(&deployed.spell_txid), &grail, None)
        .unwrap();
    assert_eq!(prepared.phase, CustodyPhase::PeggedIn);
    assert_eq!(prepared.signatures.inputs.len(), 2);
    assert_eq!(prepared.signatures.inputs[1].index, 1);

    let request = prover.requests.borrow().last().cloned().unwrap();
    assert_eq!(request["public_inputs"]["$01"]["action"], json!("mint"));
    assert_eq!(request["outs"][1]["address"], json!(user));
    assert_eq!(request["outs"][1]["charms"]["$01"]["amount"], json!(5_000));
    assert_eq!(request["outs"][2]["amount"], json!(5_000));

    let signed = custody.sign(&prepared, &[a.clone()]).unwrap();
    let (_, pegged_in) = custody.transmit(&signed).unwrap();

    // the user hands 4000 tokens back through a payment address
    let token_tx = unsigned_tx(
        vec![OutPoint::new(Txid::from_str(&"44".repeat(32)).unwrap(), 0)],
        vec![TxOut {
            value: Amount::from_sat(1_000),
            script_pubkey: payment_address.script_pubkey(),
        }],
    );
    let token_txid = node.insert(&token_tx);
    prover
        .spells
        .borrow_mut()
        .insert(token_txid, json!({ "outs": [{ "charms": { "$0001": 4_000 } }] }));

    let peg_out = Operation::PegOut {
        payment: UserPayment {
            policy,
            outpoint: OutPoint::new(token_txid, 0),
            user_address: user.clone(),
        },
        locked_utxos: vec![OutPoint::new(pegged_in, 2)],
    };
    let prepared = custody.prepare(&peg_out, Some(&pegged_in), &grail, None).unwrap();
    assert_eq!(prepared.signatures.inputs.len(), 3);

    let request = prover.requests.borrow().last().cloned().unwrap();
    assert_eq!(request["public_inputs"]["$01"]["action"], json!("burn"));
    assert_eq!(request["outs"][1]["amount"], json!(4_000));
    assert_eq!(request["outs"][2]["amount"], json!(1_000));

    custody.sign(&prepared, &[a]).unwrap();
}

#[test]
fn test_peg_out_beyond_locked_btc() {
    let (node, prover, config) = (MemoryNode::new(), ScriptedProver::default(), config());
    let custody = GrailCustody::new(&config, &node, &prover);
    let a = pair(1);
    let grail = single(&a);
    let deployed = deploy(&custody, &a);

    let policy = UserPaymentPolicy {
        grail_state: grail.clone(),
        recovery_key: pair(7).public_key(),
        timelock_blocks: 144,
    };
    let token_tx = unsigned_tx(
        vec![OutPoint::new(Txid::from_str(&"55".repeat(32)).unwrap(), 0)],
        vec![TxOut {
            value: Amount::from_sat(1_000),
            script_pubkey: policy.address(Network::Regtest).unwrap().script_pubkey(),
        }],
    );
    let token_txid = node.insert(&token_tx);
    prover
        .spells
        .borrow_mut()
        .insert(token_txid, json!({ "outs": [{ "charms": { "$0001": 4_000 } }] }));

    let peg_out = Operation::PegOut {
        payment: UserPayment {
            policy,
            outpoint: OutPoint::new(token_txid, 0),
            user_address: user_address(8),
        },
        locked_utxos: vec![],
    };
    let err = custody
        .prepare(&peg_out, Some(&deployed.spell_txid), &grail, None)
        .unwrap_err();
    assert!(matches!(
        err,
        GrailError::InsufficientFunds {
            required: 4_000,
            available: 0
        }
    ));
    assert_eq!(prover.requests.borrow().len(), 1);
}

#[test]
fn test_offline_cosigning() {
    let (node, prover, config) = (MemoryNode::new(), ScriptedProver::default(), config());
    let custody = GrailCustody::new(&config, &node, &prover);
    let (a, b) = (pair(1), pair(2));
    let both = CosignerSet::new(vec![a.public_key(), b.public_key()], 2).unwrap();

    let deployed = deploy(&custody, &a);
    let updated = custody
        .execute(&Operation::Update, Some(&deployed.spell_txid), &both, &[a.clone()])
        .unwrap();

    let prepared = custody
        .prepare(&Operation::Update, Some(&updated.spell_txid), &both, None)
        .unwrap();

    // what travels to the cosigners survives a round through JSON
    let shipped: PreparedTransition =
        serde_json::from_str(&serde_json::to_string(&prepared).unwrap()).unwrap();
    assert_eq!(shipped, prepared);

    let from_a = sign_as_cosigner(&shipped.signatures, &a).unwrap();
    let from_b = sign_as_cosigner(&shipped.signatures, &b).unwrap();

    assert!(matches!(
        custody.finalize(&prepared, std::slice::from_ref(&from_a)),
        Err(GrailError::InsufficientSigners { .. })
    ));

    let spell = custody.finalize(&prepared, &[from_b, from_a]).unwrap();
    let local = custody.sign(&prepared, &[a, b]).unwrap();
    assert_eq!(spell, local);

    let (_, spell_txid) = custody.transmit(&spell).unwrap();
    assert_eq!(custody.read_previous_state(&spell_txid).unwrap().cosigners, both);
}

#[test]
fn test_mint_then_burn() {
    let (node, prover, config) = (MemoryNode::new(), ScriptedProver::default(), config());
    let custody = GrailCustody::new(&config, &node, &prover);
    let a = pair(1);
    let grail = single(&a);
    let deployed = deploy(&custody, &a);

    let policy = UserPaymentPolicy {
        grail_state: grail.clone(),
        recovery_key: pair(7).public_key(),
        timelock_blocks: 144,
    };
    let payment_address = policy.address(Network::Regtest).unwrap().to_string();

    let mint = Operation::Mint {
        amount: 2_500,
        user_address: payment_address.clone(),
    };
    let minted = custody
        .execute(&mint, Some(&deployed.spell_txid), &grail, &[a.clone()])
        .unwrap();
    assert_eq!(minted.phase, CustodyPhase::Minted);

    let request = prover.requests.borrow().last().cloned().unwrap();
    assert_eq!(request["apps"]["$01"], json!("t/app/vk"));
    assert_eq!(request["public_inputs"]["$01"]["action"], json!("mint"));
    assert_eq!(request["ins"].as_array().unwrap().len(), 1);
    assert_eq!(request["outs"][1]["address"], json!(payment_address));
    assert_eq!(request["outs"][1]["charms"]["$00"]["type"], json!("user_charms"));
    assert_eq!(request["outs"][1]["charms"]["$01"]["amount"], json!(2_500));

    let burn = Operation::Burn {
        payment: UserPayment {
            policy,
            outpoint: OutPoint::new(minted.spell_txid, 1),
            user_address: payment_address,
        },
    };
    let prepared = custody
        .prepare(&burn, Some(&minted.spell_txid), &grail, None)
        .unwrap();
    assert_eq!(prepared.phase, CustodyPhase::Burned);
    assert_eq!(prepared.signatures.inputs.len(), 2);

    let request = prover.requests.borrow().last().cloned().unwrap();
    assert_eq!(request["public_inputs"]["$01"]["action"], json!("burn"));
    assert_eq!(
        request["ins"][1]["utxo_id"],
        json!(format!("{}:1", minted.spell_txid))
    );
    // tokens go nowhere, only the NFT comes out
    assert_eq!(request["outs"].as_array().unwrap().len(), 1);

    let signed = custody.sign(&prepared, &[a]).unwrap();
    let (_, burned) = custody.transmit(&signed).unwrap();
    assert_eq!(custody.read_previous_state(&burned).unwrap().cosigners, grail);
}

/// Put a transaction paying the wallet into the node, and its spell into the prover
fn wallet_token_tx(
    node: &MemoryNode,
    prover: &ScriptedProver,
    seed: &str,
    token_app: &str,
    amounts: &[u64],
) -> Txid {
    let token_tx = unsigned_tx(
        vec![OutPoint::new(Txid::from_str(&seed.repeat(32)).unwrap(), 0)],
        amounts
            .iter()
            .map(|_| TxOut {
                value: Amount::from_sat(1_000),
                script_pubkey: script_of(&user_address(91)),
            })
            .collect(),
    );
    let txid = node.insert(&token_tx);
    let outs: Vec<Value> = amounts
        .iter()
        .map(|amount| json!({ "charms": { "$00": amount } }))
        .collect();
    prover
        .spells
        .borrow_mut()
        .insert(txid, json!({ "apps": { "$00": token_app }, "outs": outs }));
    for vout in 0..amounts.len() as u32 {
        node.wallet.borrow_mut().push(Utxo {
            txid,
            vout,
            value: 1_000,
        });
    }
    txid
}

#[test]
fn test_token_transfer() {
    let (node, prover, config) = (MemoryNode::new(), ScriptedProver::default(), config());
    let first = wallet_token_tx(&node, &prover, "61", "t/app/vk", &[600]);
    let second = wallet_token_tx(&node, &prover, "62", "t/app/vk", &[0, 500]);
    wallet_token_tx(&node, &prover, "63", "t/other/vk", &[900]);
    let wallet = TokenWallet::new(&config, &node, &prover);

    let held = wallet.list_token_utxos().unwrap();
    assert_eq!(
        held,
        vec![
            TokenUtxo {
                outpoint: OutPoint::new(first, 0),
                amount: 600
            },
            TokenUtxo {
                outpoint: OutPoint::new(second, 1),
                amount: 500
            },
        ]
    );

    let destination = user_address(8);
    let spell = wallet
        .prepare_transfer(1_000, Some(destination.as_str()), None)
        .unwrap();
    assert!(node.broadcasts.borrow().is_empty());

    let request = prover.requests.borrow().last().cloned().unwrap();
    assert_eq!(request["apps"], json!({ "$00": "t/app/vk" }));
    assert_eq!(request["public_inputs"]["$00"]["action"], json!("transfer"));
    assert_eq!(request["ins"][0]["utxo_id"], json!(format!("{}:0", first)));
    assert_eq!(request["ins"][1]["charms"]["$00"], json!(500));
    assert_eq!(request["outs"][0]["address"], json!(destination));
    assert_eq!(request["outs"][0]["charms"]["$00"], json!(1_000));
    assert_eq!(request["outs"][1]["address"], json!(user_address(91)));
    assert_eq!(request["outs"][1]["charms"]["$00"], json!(100));

    // the node signs its token inputs, told about the unconfirmed commitment output
    assert_eq!(*node.sighash_types.borrow(), vec!["ALL|ANYONECANPAY".to_string()]);
    assert_eq!(
        *node.signed_prevouts.borrow(),
        vec![OutPoint::new(spell.commitment.compute_txid(), 0)]
    );

    let (commitment_txid, spell_txid) = wallet.transmit(&spell).unwrap();
    assert_eq!(*node.broadcasts.borrow(), vec![commitment_txid, spell_txid]);
    assert_eq!(node.sighash_types.borrow().len(), 2);
}

#[test]
fn test_transfer_beyond_wallet_tokens() {
    let (node, prover, config) = (MemoryNode::new(), ScriptedProver::default(), config());
    wallet_token_tx(&node, &prover, "61", "t/app/vk", &[600]);
    let wallet = TokenWallet::new(&config, &node, &prover);

    assert!(matches!(
        wallet.prepare_transfer(5_000, None, None),
        Err(GrailError::InsufficientTokens {
            required: 5_000,
            available: 600
        })
    ));
    assert!(matches!(
        wallet.prepare_transfer(100, Some("not-an-address"), None),
        Err(GrailError::InvalidAddress { .. })
    ));
    assert!(prover.requests.borrow().is_empty());
}
