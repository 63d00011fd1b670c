use crate::config::{custody::MIN_FUNDING_SATS, RpcConfig};
use crate::error::{GrailError, GrailResult};
use crate::utils::utxo::Utxo;
use bitcoin::{OutPoint, TxOut, Txid};
use bitcoincore_rpc::{jsonrpc, Auth, Client, RpcApi};
use serde_json::{json, Value};
use std::str::FromStr;

/// `RPC_INVALID_ADDRESS_OR_KEY`, returned for unknown transactions
const RPC_NOT_FOUND: i32 = -5;

/// The Bitcoin node as seen by the custody pipeline
pub trait NodeRpc {
    /// Raw transaction hex, `None` if the node does not know the transaction
    fn get_transaction_hex(&self, txid: &Txid) -> GrailResult<Option<String>>;

    /// First spendable wallet UTXO worth at least `MIN_FUNDING_SATS`
    fn get_funding_utxo(&self) -> GrailResult<Utxo>;

    /// Every spendable wallet UTXO
    fn list_wallet_utxos(&self) -> GrailResult<Vec<Utxo>>;

    /// Sign the wallet's inputs of `tx_hex` with the given sighash type.
    /// `prevouts` describes spent outputs the node has not seen yet.
    fn sign_transaction(
        &self,
        tx_hex: &str,
        prevouts: &[(OutPoint, TxOut)],
        sighash_type: &str,
    ) -> GrailResult<String>;

    fn broadcast(&self, tx_hex: &str) -> GrailResult<Txid>;

    /// Fresh wallet address for prover change
    fn get_change_address(&self) -> GrailResult<String>;
}

/// `prevtxs` entry of `signrawtransactionwithwallet`
fn prevtx_entry((outpoint, output): &(OutPoint, TxOut)) -> Value {
    json!({
        "txid": outpoint.txid.to_string(),
        "vout": outpoint.vout,
        "scriptPubKey": output.script_pubkey.to_hex_string(),
        "amount": output.value.to_btc(),
    })
}

#[derive(Debug)]
pub struct BitcoinRpcClient {
    client: Client,
}

impl BitcoinRpcClient {
    /// Connect to the wallet endpoint described by `config`
    pub fn new(config: &RpcConfig) -> GrailResult<Self> {
        let auth = Auth::UserPass(config.user.clone(), config.password.clone());
        let client = Client::new(&config.url(), auth).map_err(|e| GrailError::Rpc { source: e })?;

        Ok(BitcoinRpcClient { client })
    }
}

impl NodeRpc for BitcoinRpcClient {
    fn get_transaction_hex(&self, txid: &Txid) -> GrailResult<Option<String>> {
        match self
            .client
            .call::<String>("getrawtransaction", &[txid.to_string().into()])
        {
            Ok(hex) => Ok(Some(hex)),
            Err(bitcoincore_rpc::Error::JsonRpc(jsonrpc::Error::Rpc(ref e)))
                if e.code == RPC_NOT_FOUND =>
            {
                log::debug!("node has no transaction {}", txid);
                Ok(None)
            }
            Err(e) => Err(GrailError::Rpc { source: e }),
        }
    }

    fn get_funding_utxo(&self) -> GrailResult<Utxo> {
        let unspent = self.list_wallet_utxos()?;
        let available = unspent.len();

        unspent
            .into_iter()
            .find(|utxo| utxo.value >= MIN_FUNDING_SATS)
            .ok_or_else(|| {
                log::warn!("none of {} wallet UTXOs can fund a transition", available);
                GrailError::InsufficientFunds {
                    required: MIN_FUNDING_SATS,
                    available: 0,
                }
            })
    }

    fn list_wallet_utxos(&self) -> GrailResult<Vec<Utxo>> {
        let unspent = self.client.list_unspent(None, None, None, None, None)?;
        Ok(unspent
            .into_iter()
            .filter(|entry| entry.spendable)
            .map(|entry| Utxo {
                txid: entry.txid,
                vout: entry.vout,
                value: entry.amount.to_sat(),
            })
            .collect())
    }

    fn sign_transaction(
        &self,
        tx_hex: &str,
        prevouts: &[(OutPoint, TxOut)],
        sighash_type: &str,
    ) -> GrailResult<String> {
        let prevtxs = if prevouts.is_empty() {
            Value::Null
        } else {
            Value::Array(prevouts.iter().map(prevtx_entry).collect())
        };
        let result: Value = self.client.call(
            "signrawtransactionwithwallet",
            &[tx_hex.into(), prevtxs, sighash_type.into()],
        )?;

        if !result["complete"].as_bool().unwrap_or(false) {
            return Err(GrailError::transaction(format!(
                "wallet could not fully sign transaction: {}",
                result["errors"]
            )));
        }
        result["hex"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| GrailError::transaction("signrawtransactionwithwallet returned no hex"))
    }

    fn broadcast(&self, tx_hex: &str) -> GrailResult<Txid> {
        let result = self
            .client
            .call::<String>("sendrawtransaction", &[tx_hex.into()])?;
        Txid::from_str(&result)
            .map_err(|e| GrailError::transaction(format!("node returned bad txid: {}", e)))
    }

    fn get_change_address(&self) -> GrailResult<String> {
        let result = self.client.call::<String>("getnewaddress", &[])?;
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::{Amount, ScriptBuf};

    #[test]
    fn test_prevtx_entry() {
        let outpoint = OutPoint::new(Txid::from_str(&"ab".repeat(32)).unwrap(), 1);
        let output = TxOut {
            value: Amount::from_sat(1_000),
            script_pubkey: ScriptBuf::from_hex("5120").unwrap(),
        };
        let entry = prevtx_entry(&(outpoint, output));
        assert_eq!(entry["txid"], json!("ab".repeat(32)));
        assert_eq!(entry["vout"], json!(1));
        assert_eq!(entry["scriptPubKey"], json!("5120"));
        assert_eq!(entry["amount"], json!(0.00001));
    }
}
