//! # Configuration
//!
//! Protocol constants plus the explicit configuration values that every custody
//! operation receives. Nothing here is read implicitly by the core: the CLI
//! loads a [`GrailConfig`] and an [`RpcConfig`] once and passes them down.

use crate::error::{GrailError, GrailResult};
use crate::utils::{address::parse_network, utxo::Utxo};
use bitcoin::Network;
use sha2::{Digest, Sha256};
use std::env as std_env;

/// Network and RPC configuration
pub mod network {
    /// Default Bitcoin Core RPC host
    pub const DEFAULT_RPC_HOST: &str = "127.0.0.1";

    /// Default RPC port (regtest)
    pub const DEFAULT_RPC_PORT: &str = "18443";

    /// Default RPC username
    pub const DEFAULT_RPC_USER: &str = "bitcoin";

    /// Default RPC password
    pub const DEFAULT_RPC_PASSWORD: &str = "bitcoin";

    /// Default wallet name for funding and node-assisted signing
    pub const DEFAULT_WALLET_NAME: &str = "grail";

    /// Default network tag
    pub const DEFAULT_NETWORK: &str = "regtest";
}

/// Custody protocol constants
///
/// These values are part of the protocol: changing the leaf version, the spell
/// version or the state-record keys produces transactions that older chain
/// instances cannot read.
pub mod custody {
    /// Smallest wallet UTXO the node may hand out for funding a spell.
    pub const MIN_FUNDING_SATS: u64 = 1_000;

    /// Outputs below this value are not relayed.
    ///
    /// A grail change output under the limit is dropped and its value left to
    /// the miner; user outputs under the limit fail the sanity check.
    pub const DUST_LIMIT_SATS: u64 = 546;

    /// Version of the spell request document understood by the prover
    pub const SPELL_VERSION: u32 = 4;

    /// Default ticker written into the NFT state record
    pub const DEFAULT_TICKER: &str = "GRAIL-NFT";

    /// Default relative timelock for user payment recovery (one day on mainnet)
    pub const DEFAULT_TIMELOCK_BLOCKS: u32 = 144;

    /// Default fee rate in sat/vB passed to the prover
    pub const DEFAULT_FEE_RATE: f64 = 2.0;

    /// Sighash flags the node wallet signs its own inputs with
    pub const WALLET_SIGHASH: &str = "ALL|ANYONECANPAY";

    /// App slot of the custody NFT in request documents
    pub const NFT_SLOT: &str = "$00";

    /// App slot of the fungible token in request documents
    pub const TOKEN_SLOT: &str = "$01";

    /// App slot of the token in a transfer, where it is the only app
    pub const TRANSFER_SLOT: &str = "$00";

    /// Keys under which decoded spells report the NFT charm
    pub const NFT_RECORD_KEYS: [&str; 2] = ["$0000", "$00"];

    /// Keys under which decoded spells report the token charm
    pub const TOKEN_RECORD_KEYS: [&str; 2] = ["$0001", "$01"];
}

/// External prover defaults
pub mod prover {
    /// Name of the charms binary looked up on PATH
    pub const DEFAULT_CHARMS_BIN: &str = "charms";

    /// Compiled grail application binary
    pub const DEFAULT_APP_BIN: &str = "./zkapp/target/charms-app";
}

/// Environment variable names
pub mod env {
    /// RPC host override
    pub const RPC_HOST: &str = "RPC_HOST";

    /// RPC port override
    pub const RPC_PORT: &str = "RPC_PORT";

    /// RPC username override
    pub const RPC_USER: &str = "RPC_USER";

    /// RPC password override
    pub const RPC_PASSWORD: &str = "RPC_PASSWORD";

    /// Wallet name override
    pub const RPC_WALLET: &str = "RPC_WALLET";

    /// `mainnet`, `testnet` or `regtest`
    pub const NETWORK: &str = "GRAIL_NETWORK";

    /// Application identity
    pub const APP_ID: &str = "GRAIL_APP_ID";
    pub const APP_VK: &str = "GRAIL_APP_VK";

    /// NFT ticker override
    pub const TICKER: &str = "GRAIL_TICKER";

    /// Fee rate override (sat/vB)
    pub const FEE_RATE: &str = "GRAIL_FEE_RATE";

    /// Prover binaries
    pub const CHARMS_BIN: &str = "CHARMS_BIN";
    pub const APP_BIN: &str = "GRAIL_APP_BIN";

    /// Ask the prover for mock proofs (`1`/`true`)
    pub const MOCK_PROOF: &str = "USE_MOCK_PROOF";
}

fn var_or(name: &str, default: &str) -> String {
    std_env::var(name).unwrap_or_else(|_| default.to_string())
}

/// Connection settings for the Bitcoin Core node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcConfig {
    pub host: String,
    pub port: String,
    pub user: String,
    pub password: String,
    pub wallet: String,
}

impl RpcConfig {
    /// Load RPC settings from the environment (and `.env`), falling back to defaults
    pub fn from_env() -> Self {
        dotenv::dotenv().ok();

        Self {
            host: var_or(env::RPC_HOST, network::DEFAULT_RPC_HOST),
            port: var_or(env::RPC_PORT, network::DEFAULT_RPC_PORT),
            user: var_or(env::RPC_USER, network::DEFAULT_RPC_USER),
            password: var_or(env::RPC_PASSWORD, network::DEFAULT_RPC_PASSWORD),
            wallet: var_or(env::RPC_WALLET, network::DEFAULT_WALLET_NAME),
        }
    }

    /// Wallet-scoped endpoint URL
    pub fn url(&self) -> String {
        format!("http://{}:{}/wallet/{}", self.host, self.port, self.wallet)
    }
}

/// Explicit configuration threaded into every custody operation
#[derive(Debug, Clone, PartialEq)]
pub struct GrailConfig {
    pub network: Network,
    pub app_id: String,
    pub app_vk: String,
    pub ticker: String,
    pub fee_rate: f64,
    pub charms_bin: String,
    pub app_bin: String,
    pub mock_proof: bool,
}

impl GrailConfig {
    /// Configuration with protocol defaults for the given network and application
    pub fn new(network: Network, app_id: impl Into<String>, app_vk: impl Into<String>) -> Self {
        Self {
            network,
            app_id: app_id.into(),
            app_vk: app_vk.into(),
            ticker: custody::DEFAULT_TICKER.to_string(),
            fee_rate: custody::DEFAULT_FEE_RATE,
            charms_bin: prover::DEFAULT_CHARMS_BIN.to_string(),
            app_bin: prover::DEFAULT_APP_BIN.to_string(),
            mock_proof: false,
        }
    }

    /// Load the configuration from the environment (and `.env`)
    ///
    /// The application id may be left empty: it is only required for
    /// operations on an existing chain, and deploy derives its own through
    /// [`GrailConfig::for_deploy`].
    pub fn from_env() -> GrailResult<Self> {
        dotenv::dotenv().ok();

        let network = parse_network(&var_or(env::NETWORK, network::DEFAULT_NETWORK))?;
        let fee_rate = match std_env::var(env::FEE_RATE) {
            Ok(raw) => raw
                .parse::<f64>()
                .map_err(|_| {
                    GrailError::config(format!("{} is not a number: {}", env::FEE_RATE, raw))
                })?,
            Err(_) => custody::DEFAULT_FEE_RATE,
        };
        let mock_proof = matches!(
            std_env::var(env::MOCK_PROOF).as_deref(),
            Ok("1") | Ok("true") | Ok("yes")
        );

        Ok(Self {
            network,
            app_id: var_or(env::APP_ID, ""),
            app_vk: var_or(env::APP_VK, ""),
            ticker: var_or(env::TICKER, custody::DEFAULT_TICKER),
            fee_rate,
            charms_bin: var_or(env::CHARMS_BIN, prover::DEFAULT_CHARMS_BIN),
            app_bin: var_or(env::APP_BIN, prover::DEFAULT_APP_BIN),
            mock_proof,
        })
    }

    /// Same configuration with the application id derived from the funding UTXO
    pub fn for_deploy(&self, funding: &Utxo) -> Self {
        Self {
            app_id: derive_app_id(funding),
            ..self.clone()
        }
    }

    /// `t/<app id>/<vk>`, the token app as spells name it
    pub fn token_app(&self) -> String {
        format!("t/{}/{}", self.app_id, self.app_vk)
    }

    /// Fail unless an application identity is present
    pub fn require_app(&self) -> GrailResult<()> {
        if self.app_id.is_empty() || self.app_vk.is_empty() {
            return Err(GrailError::config(format!(
                "application identity missing: set {} and {}",
                env::APP_ID,
                env::APP_VK
            )));
        }
        Ok(())
    }
}

/// Application id of a new chain: SHA-256 of the funding outpoint `txid:vout`
pub fn derive_app_id(funding: &Utxo) -> String {
    hex::encode(Sha256::digest(funding.outpoint_id().as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::Txid;
    use std::str::FromStr;

    fn funding() -> Utxo {
        Utxo {
            txid: Txid::from_str(
                "9bc1a5f3a9ad27fd8dbd3cb2b6c7e52b1d2c7e4fbd3d9a2e6a0b3e3f6e7d8c9b",
            )
            .unwrap(),
            vout: 1,
            value: 50_000,
        }
    }

    #[test]
    fn test_app_id_is_hash_of_outpoint() {
        let utxo = funding();
        let expected = hex::encode(Sha256::digest(
            b"9bc1a5f3a9ad27fd8dbd3cb2b6c7e52b1d2c7e4fbd3d9a2e6a0b3e3f6e7d8c9b:1",
        ));
        assert_eq!(derive_app_id(&utxo), expected);

        let config = GrailConfig::new(Network::Regtest, "", "vk").for_deploy(&utxo);
        assert_eq!(config.app_id, expected);
        assert_eq!(config.app_vk, "vk");
        assert!(config.require_app().is_ok());
        assert_eq!(config.token_app(), format!("t/{}/vk", expected));
    }

    #[test]
    fn test_require_app() {
        let config = GrailConfig::new(Network::Regtest, "", "");
        assert!(matches!(
            config.require_app(),
            Err(GrailError::Configuration { .. })
        ));
    }

    #[test]
    fn test_rpc_url() {
        let rpc = RpcConfig {
            host: "127.0.0.1".into(),
            port: "18443".into(),
            user: "u".into(),
            password: "p".into(),
            wallet: "grail".into(),
        };
        assert_eq!(rpc.url(), "http://127.0.0.1:18443/wallet/grail");
    }
}
