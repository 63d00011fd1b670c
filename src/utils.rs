//! # Utility Functions
//!
//! Small parsing helpers shared by the custody pipeline and the CLI.

use crate::error::{GrailError, GrailResult};
use bitcoin::{Address, Network};
use std::str::FromStr;

/// Address and network parsing
pub mod address {
    use super::*;

    /// Parse a network tag (`mainnet`, `testnet`, `regtest`)
    pub fn parse_network(tag: &str) -> GrailResult<Network> {
        match tag.to_lowercase().as_str() {
            "mainnet" | "bitcoin" => Ok(Network::Bitcoin),
            "testnet" => Ok(Network::Testnet),
            "regtest" => Ok(Network::Regtest),
            other => Err(GrailError::config(format!("Unknown network: {}", other))),
        }
    }

    /// Validate and parse a Bitcoin address for the given network
    pub fn validate_and_parse(address_str: &str, network: Network) -> GrailResult<Address> {
        let address = Address::from_str(address_str).map_err(|_| GrailError::InvalidAddress {
            address: address_str.to_string(),
        })?;

        address
            .require_network(network)
            .map_err(|_| GrailError::InvalidAddress {
                address: address_str.to_string(),
            })
    }
}

/// Transaction encoding helpers
pub mod tx {
    use super::*;
    use bitcoin::consensus::encode::{deserialize, serialize_hex};
    use bitcoin::Transaction;

    /// Decode a consensus-encoded transaction from hex
    pub fn decode(tx_hex: &str) -> GrailResult<Transaction> {
        let bytes = hex::decode(tx_hex.trim())
            .map_err(|e| GrailError::transaction(format!("transaction hex: {}", e)))?;
        deserialize(&bytes)
            .map_err(|e| GrailError::transaction(format!("transaction decode: {}", e)))
    }

    /// Consensus-encode a transaction to hex
    pub fn encode(tx: &Transaction) -> String {
        serialize_hex(tx)
    }
}

/// Unspent output references
pub mod utxo {
    use super::*;
    use bitcoin::{OutPoint, Txid};
    use std::fmt;

    /// A spendable output with its value in satoshis
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Utxo {
        pub txid: Txid,
        pub vout: u32,
        pub value: u64,
    }

    impl Utxo {
        /// `txid:vout`, the form used by the prover and by application ids
        pub fn outpoint_id(&self) -> String {
            format!("{}:{}", self.txid, self.vout)
        }

        pub fn outpoint(&self) -> OutPoint {
            OutPoint::new(self.txid, self.vout)
        }
    }

    impl fmt::Display for Utxo {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "{} ({} sats)", self.outpoint_id(), self.value)
        }
    }

    /// Parse `txid:vout` into an outpoint
    pub fn parse_outpoint(s: &str) -> GrailResult<OutPoint> {
        let (txid, vout) = s
            .split_once(':')
            .ok_or_else(|| GrailError::config(format!("Expected txid:vout, got {}", s)))?;
        let txid = Txid::from_str(txid)
            .map_err(|e| GrailError::config(format!("Invalid txid {}: {}", txid, e)))?;
        let vout = vout
            .parse::<u32>()
            .map_err(|e| GrailError::config(format!("Invalid vout {}: {}", vout, e)))?;
        Ok(OutPoint::new(txid, vout))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_network() {
        assert_eq!(address::parse_network("mainnet").unwrap(), Network::Bitcoin);
        assert_eq!(address::parse_network("Regtest").unwrap(), Network::Regtest);
        assert!(address::parse_network("signet-ish").is_err());
    }

    #[test]
    fn test_parse_outpoint() {
        let txid = "aa".repeat(32);
        let outpoint = utxo::parse_outpoint(&format!("{}:3", txid)).unwrap();
        assert_eq!(outpoint.vout, 3);
        assert_eq!(outpoint.txid.to_string(), txid);

        assert!(utxo::parse_outpoint(&txid).is_err());
        assert!(utxo::parse_outpoint(&format!("{}:x", txid)).is_err());
    }

    #[test]
    fn test_address_network_check() {
        use bitcoin::key::{TweakedPublicKey, XOnlyPublicKey};

        let key = XOnlyPublicKey::from_str(
            "79be667ef9dcbbac55a06295ce870b07029bfcdb2dce28d959f2815b16f81798",
        )
        .unwrap();
        let regtest = Address::p2tr_tweaked(
            TweakedPublicKey::dangerous_assume_tweaked(key),
            Network::Regtest,
        )
        .to_string();
        assert!(regtest.starts_with("bcrt1p"));
        assert!(address::validate_and_parse(&regtest, Network::Regtest).is_ok());
        assert!(address::validate_and_parse(&regtest, Network::Bitcoin).is_err());
        assert!(address::validate_and_parse("not-an-address", Network::Regtest).is_err());
    }
}
