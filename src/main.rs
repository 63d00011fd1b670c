//! # Grail: Threshold Custody CLI
//!
//! Command line front end for the grail custody protocol. A custody chain is a
//! sequence of spells, each moving a custody NFT to the taproot address of the
//! next cosigner set:
//!
//! ```text
//! ┌──────────┐  update  ┌──────────┐  mint / peg-in  ┌──────────┐  peg-out / burn  ┌──────────┐
//! │ Deployed │ ───────> │ Updated  │ ──────────────> │  Minted  │ ───────────────> │  Burned  │
//! │ 1-of-1   │          │  T-of-N  │                 │ PeggedIn │                  │PeggedOut │
//! └──────────┘          └──────────┘                 └──────────┘                  └──────────┘
//! ```
//!
//! Every transition is authorized by the cosigners recorded in the previous
//! spell. Signing happens either locally (`--private-keys`) or offline: the
//! prepared transition is written with `--request-out`, each cosigner runs
//! `grail sign`, and `grail finalize` assembles the witnesses.
//!
//! ## Usage
//!
//! ```bash
//! # New cosigner keys
//! grail generate-keypairs --count 3
//!
//! # Start a chain and hand it to a 2-of-3 set
//! grail deploy --private-keys <deployer secret> --transmit
//! grail update --previous <spell txid> --cosigners <k1>,<k2>,<k3> --threshold 2 \
//!     --private-keys <deployer secret> --transmit
//!
//! # Inspect the state committed by any spell
//! grail show <spell txid>
//!
//! # Tokens held by the node wallet, and moving them
//! grail wallet-charms
//! grail transfer --amount 1000 --output-address <address> --transmit
//! ```
//!
//! Node and prover settings come from the environment (and `.env`); see
//! `bitcoin_grail::config::env` for the variable names.

use anyhow::{anyhow, Result};
use bitcoin::{OutPoint, Txid};
use bitcoin_grail::config::custody::DEFAULT_TIMELOCK_BLOCKS;
use bitcoin_grail::crypto::{generate_keypairs, parse_x_only, KeyPair};
use bitcoin_grail::custody::{
    build_recovery_transaction, find_user_payment_vout, GrailCustody, Operation,
    PreparedTransition, TokenWallet, UserPayment,
};
use bitcoin_grail::scripts::{grail_address, CosignerSet, UserPaymentPolicy};
use bitcoin_grail::services::{BitcoinRpcClient, CharmsProver, NodeRpc};
use bitcoin_grail::signing::{sign_as_cosigner, SignatureResponse};
use bitcoin_grail::utils::{address, tx, utxo::parse_outpoint};
use bitcoin_grail::{GrailConfig, RpcConfig};
use clap::{Args, Parser, Subcommand};
use std::{
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};

#[derive(Parser)]
#[command(name = "grail")]
#[command(about = "Threshold custody of tokenized BTC with charms spells")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

/// The cosigner set a command targets
#[derive(Args, Clone)]
struct CosignerArgs {
    /// Comma-separated x-only public keys (hex)
    #[arg(long, value_delimiter = ',', required = true)]
    cosigners: Vec<String>,
    /// Signatures required to spend
    #[arg(long)]
    threshold: usize,
}

impl CosignerArgs {
    fn cosigner_set(&self) -> Result<CosignerSet> {
        Ok(CosignerSet::from_hex(&self.cosigners, self.threshold)?)
    }
}

/// How a prepared transition is signed and whether it is broadcast
#[derive(Args, Clone)]
struct TransitionArgs {
    /// Comma-separated secret keys (hex) of the signing cosigners
    #[arg(long, value_delimiter = ',')]
    private_keys: Vec<String>,
    /// Write the prepared transition for offline cosigning instead of signing
    #[arg(long)]
    request_out: Option<PathBuf>,
    /// Broadcast commitment and spell once signed
    #[arg(long, default_value_t = false)]
    transmit: bool,
}

/// A user payment spent by a peg or burn
#[derive(Args, Clone)]
struct PaymentArgs {
    /// Payment UTXO (txid:vout)
    #[arg(long)]
    payment: String,
    /// The user's own address, receiving what the transition pays out
    #[arg(long)]
    user_address: String,
    /// Key the user can reclaim the payment with
    #[arg(long)]
    recovery_key: String,
    /// Blocks before the user can reclaim the payment
    #[arg(long, default_value_t = DEFAULT_TIMELOCK_BLOCKS)]
    timelock: u32,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate random cosigner key pairs
    GenerateKeypairs {
        #[arg(short, long, default_value_t = 1)]
        count: usize,
    },
    /// Show the grail address of a cosigner set
    Address {
        #[command(flatten)]
        cosigners: CosignerArgs,
    },
    /// Show the address a user pays into before a peg-in, peg-out or burn
    UserPayment {
        #[command(flatten)]
        cosigners: CosignerArgs,
        /// User's recovery key (x-only hex)
        #[arg(long)]
        recovery_key: String,
        #[arg(long, default_value_t = DEFAULT_TIMELOCK_BLOCKS)]
        timelock: u32,
        /// Locate the payment output in this transaction
        #[arg(long)]
        payment_txid: Option<String>,
    },
    /// Start a new custody chain controlled by one deployer key
    Deploy {
        /// Deployer public key; defaults to the first private key's
        #[arg(long)]
        deployer: Option<String>,
        #[command(flatten)]
        transition: TransitionArgs,
    },
    /// Hand the NFT to a new cosigner set
    Update {
        /// Spell transaction holding the NFT
        #[arg(long)]
        previous: String,
        #[command(flatten)]
        cosigners: CosignerArgs,
        #[command(flatten)]
        transition: TransitionArgs,
    },
    /// Issue tokens without BTC backing
    Mint {
        #[arg(long)]
        previous: String,
        #[command(flatten)]
        cosigners: CosignerArgs,
        #[arg(long)]
        amount: u64,
        #[arg(long)]
        user_address: String,
        #[command(flatten)]
        transition: TransitionArgs,
    },
    /// Take a user's BTC payment and issue the same amount of tokens
    PegIn {
        #[arg(long)]
        previous: String,
        #[command(flatten)]
        cosigners: CosignerArgs,
        #[command(flatten)]
        payment: PaymentArgs,
        #[command(flatten)]
        transition: TransitionArgs,
    },
    /// Take a user's tokens and release the same amount of grail BTC
    PegOut {
        #[arg(long)]
        previous: String,
        #[command(flatten)]
        cosigners: CosignerArgs,
        #[command(flatten)]
        payment: PaymentArgs,
        /// Grail-held UTXOs to release BTC from (txid:vout, comma-separated)
        #[arg(long, value_delimiter = ',', required = true)]
        locked: Vec<String>,
        #[command(flatten)]
        transition: TransitionArgs,
    },
    /// Destroy a user's tokens
    Burn {
        #[arg(long)]
        previous: String,
        #[command(flatten)]
        cosigners: CosignerArgs,
        #[command(flatten)]
        payment: PaymentArgs,
        #[command(flatten)]
        transition: TransitionArgs,
    },
    /// Sign a prepared transition as one cosigner
    Sign {
        /// Prepared transition file
        #[arg(long)]
        request: PathBuf,
        /// Cosigner secret key (hex)
        #[arg(long)]
        private_key: String,
        /// Response file; printed when omitted
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Combine cosigner responses into the signed transition
    Finalize {
        #[arg(long)]
        request: PathBuf,
        /// Response files
        #[arg(long, value_delimiter = ',', required = true)]
        responses: Vec<PathBuf>,
        #[arg(long, default_value_t = false)]
        transmit: bool,
    },
    /// Print the custody state committed by a spell
    Show {
        /// Spell transaction id
        txid: String,
    },
    /// List wallet UTXOs holding the configured token
    WalletCharms,
    /// Send tokens held by the node wallet
    Transfer {
        #[arg(long)]
        amount: u64,
        /// Receives the tokens; a fresh wallet address when omitted
        #[arg(long)]
        output_address: Option<String>,
        /// Receives leftover tokens; a fresh wallet address when omitted
        #[arg(long)]
        change_address: Option<String>,
        #[arg(long, default_value_t = false)]
        transmit: bool,
    },
    /// Reclaim a user payment after its timelock
    Recover {
        /// Payment UTXO (txid:vout)
        #[arg(long)]
        payment: String,
        /// Cosigners the payment was made out to
        #[command(flatten)]
        cosigners: CosignerArgs,
        /// User's recovery secret key (hex)
        #[arg(long)]
        private_key: String,
        #[arg(long, default_value_t = DEFAULT_TIMELOCK_BLOCKS)]
        timelock: u32,
        #[arg(long)]
        destination: String,
        #[arg(long, default_value_t = 500)]
        fee: u64,
        #[arg(long, default_value_t = false)]
        transmit: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    // node RPC and the prover block, keep them off the runtime
    tokio::task::spawn_blocking(move || run(cli)).await?
}

fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::GenerateKeypairs { count } => {
            generate(count)?;
        }
        Commands::Address { cosigners } => {
            show_address(&cosigners)?;
        }
        Commands::UserPayment {
            cosigners,
            recovery_key,
            timelock,
            payment_txid,
        } => {
            user_payment_address(&cosigners, &recovery_key, timelock, payment_txid.as_deref())?;
        }
        Commands::Deploy {
            deployer,
            transition,
        } => {
            deploy(deployer.as_deref(), &transition)?;
        }
        Commands::Update {
            previous,
            cosigners,
            transition,
        } => {
            run_transition(Operation::Update, &previous, &cosigners, &transition)?;
        }
        Commands::Mint {
            previous,
            cosigners,
            amount,
            user_address,
            transition,
        } => {
            let operation = Operation::Mint {
                amount,
                user_address,
            };
            run_transition(operation, &previous, &cosigners, &transition)?;
        }
        Commands::PegIn {
            previous,
            cosigners,
            payment,
            transition,
        } => {
            let payment = user_payment(&previous, &payment)?;
            run_transition(Operation::PegIn { payment }, &previous, &cosigners, &transition)?;
        }
        Commands::PegOut {
            previous,
            cosigners,
            payment,
            locked,
            transition,
        } => {
            let payment = user_payment(&previous, &payment)?;
            let locked_utxos = locked
                .iter()
                .map(|utxo| parse_outpoint(utxo))
                .collect::<Result<Vec<OutPoint>, _>>()?;
            let operation = Operation::PegOut {
                payment,
                locked_utxos,
            };
            run_transition(operation, &previous, &cosigners, &transition)?;
        }
        Commands::Burn {
            previous,
            cosigners,
            payment,
            transition,
        } => {
            let payment = user_payment(&previous, &payment)?;
            run_transition(Operation::Burn { payment }, &previous, &cosigners, &transition)?;
        }
        Commands::Sign {
            request,
            private_key,
            out,
        } => {
            sign(&request, &private_key, out.as_deref())?;
        }
        Commands::Finalize {
            request,
            responses,
            transmit,
        } => {
            finalize(&request, &responses, transmit)?;
        }
        Commands::Show { txid } => {
            show(&txid)?;
        }
        Commands::WalletCharms => {
            wallet_charms()?;
        }
        Commands::Transfer {
            amount,
            output_address,
            change_address,
            transmit,
        } => {
            transfer(
                amount,
                output_address.as_deref(),
                change_address.as_deref(),
                transmit,
            )?;
        }
        Commands::Recover {
            payment,
            cosigners,
            private_key,
            timelock,
            destination,
            fee,
            transmit,
        } => {
            let key = KeyPair::from_hex(&private_key)?;
            let policy = UserPaymentPolicy {
                grail_state: cosigners.cosigner_set()?,
                recovery_key: key.public_key(),
                timelock_blocks: timelock,
            };
            recover(&payment, &policy, &key, &destination, fee, transmit)?;
        }
    }

    Ok(())
}

/// Configuration, node and prover from the environment
fn connect() -> Result<(GrailConfig, BitcoinRpcClient, CharmsProver)> {
    let config = GrailConfig::from_env()?;
    let node = BitcoinRpcClient::new(&RpcConfig::from_env())?;
    let prover = CharmsProver::new(&config);
    Ok((config, node, prover))
}

fn parse_keys(secrets: &[String]) -> Result<Vec<KeyPair>> {
    Ok(secrets
        .iter()
        .map(|secret| KeyPair::from_hex(secret))
        .collect::<Result<Vec<_>, _>>()?)
}

/// Payment policy made out to the cosigners recorded in `previous`
fn user_payment(previous: &str, args: &PaymentArgs) -> Result<UserPayment> {
    let (config, node, prover) = connect()?;
    let custody = GrailCustody::new(&config, &node, &prover);
    let state = custody.read_previous_state(&Txid::from_str(previous)?)?;

    Ok(UserPayment {
        policy: UserPaymentPolicy {
            grail_state: state.cosigners,
            recovery_key: parse_x_only(&args.recovery_key)?,
            timelock_blocks: args.timelock,
        },
        outpoint: parse_outpoint(&args.payment)?,
        user_address: args.user_address.clone(),
    })
}

fn generate(count: usize) -> Result<()> {
    for (index, pair) in generate_keypairs(count)?.iter().enumerate() {
        println!("Key pair {}:", index + 1);
        println!("  Secret: {}", pair.secret_hex());
        println!("  Public: {}", pair.public_key_hex());
    }
    Ok(())
}

fn show_address(cosigners: &CosignerArgs) -> Result<()> {
    let config = GrailConfig::from_env()?;
    let set = cosigners.cosigner_set()?;
    println!("Cosigners: {}", set);
    println!("Grail address: {}", grail_address(&set, config.network)?);
    Ok(())
}

fn user_payment_address(
    cosigners: &CosignerArgs,
    recovery_key: &str,
    timelock: u32,
    payment_txid: Option<&str>,
) -> Result<()> {
    let config = GrailConfig::from_env()?;
    let policy = UserPaymentPolicy {
        grail_state: cosigners.cosigner_set()?,
        recovery_key: parse_x_only(recovery_key)?,
        timelock_blocks: timelock,
    };
    let payment_address = policy.address(config.network)?;
    println!("User payment address: {}", payment_address);
    println!("Recoverable by {} after {} blocks", recovery_key, timelock);

    if let Some(txid) = payment_txid {
        let txid = Txid::from_str(txid)?;
        let node = BitcoinRpcClient::new(&RpcConfig::from_env())?;
        let hex = node
            .get_transaction_hex(&txid)?
            .ok_or_else(|| anyhow!("node does not know transaction {}", txid))?;
        let vout = find_user_payment_vout(&tx::decode(&hex)?, &payment_address)?;
        println!("Payment UTXO: {}:{}", txid, vout);
    }
    Ok(())
}

fn deploy(deployer: Option<&str>, transition: &TransitionArgs) -> Result<()> {
    let (mut config, node, prover) = connect()?;
    if config.app_vk.is_empty() {
        config.app_vk = prover.verification_key()?;
        println!("App verification key: {}", config.app_vk);
    }

    let keys = parse_keys(&transition.private_keys)?;
    let deployer = match deployer {
        Some(key) => parse_x_only(key)?,
        None => keys
            .first()
            .map(KeyPair::public_key)
            .ok_or_else(|| anyhow!("pass --deployer or --private-keys"))?,
    };
    let cosigners = CosignerSet::new(vec![deployer], 1)?;

    let custody = GrailCustody::new(&config, &node, &prover);
    let prepared = custody.prepare(&Operation::Deploy, None, &cosigners, None)?;
    println!("App id: {}", prepared.app_id);
    complete(&custody, prepared, &keys, transition)
}

fn run_transition(
    operation: Operation,
    previous: &str,
    cosigners: &CosignerArgs,
    transition: &TransitionArgs,
) -> Result<()> {
    let (config, node, prover) = connect()?;
    config.require_app()?;
    let previous = Txid::from_str(previous)?;
    let next = cosigners.cosigner_set()?;

    let custody = GrailCustody::new(&config, &node, &prover);
    let prepared = custody
        .prepare(&operation, Some(&previous), &next, None)
        .inspect_err(|e| {
            if e.is_retryable() {
                log::warn!("{}: nothing was broadcast, re-run once the node has caught up", e);
            }
        })?;
    let keys = parse_keys(&transition.private_keys)?;
    complete(&custody, prepared, &keys, transition)
}

/// Sign and optionally broadcast a prepared transition, or hand it off
fn complete(
    custody: &GrailCustody<BitcoinRpcClient, CharmsProver>,
    prepared: PreparedTransition,
    keys: &[KeyPair],
    transition: &TransitionArgs,
) -> Result<()> {
    println!("Transition: {}", prepared.phase);
    println!("Next grail address: {}", prepared.next_address);

    if let Some(path) = &transition.request_out {
        fs::write(path, serde_json::to_string_pretty(&prepared)?)?;
        println!(
            "Signature request for {} custody input(s) written to {}",
            prepared.signatures.inputs.len(),
            path.display()
        );
        return Ok(());
    }

    let spell = custody.sign(&prepared, keys)?;
    if transition.transmit {
        let (commitment_txid, spell_txid) = custody.transmit(&spell)?;
        println!("Commitment: {}", commitment_txid);
        println!("Spell:      {}", spell_txid);
    } else {
        println!("Commitment hex: {}", tx::encode(&spell.commitment));
        println!("Spell hex:      {}", tx::encode(&spell.spell));
    }
    Ok(())
}

fn wallet_charms() -> Result<()> {
    let (config, node, prover) = connect()?;
    let wallet = TokenWallet::new(&config, &node, &prover);
    let held = wallet.list_token_utxos()?;

    println!("Token: {}", config.token_app());
    for utxo in &held {
        println!("  {}  {}", utxo.outpoint, utxo.amount);
    }
    println!("Total: {}", held.iter().map(|utxo| utxo.amount).sum::<u64>());
    Ok(())
}

fn transfer(
    amount: u64,
    output_address: Option<&str>,
    change_address: Option<&str>,
    transmit: bool,
) -> Result<()> {
    let (config, node, prover) = connect()?;
    let wallet = TokenWallet::new(&config, &node, &prover);
    let spell = wallet.prepare_transfer(amount, output_address, change_address)?;

    if transmit {
        let (commitment_txid, spell_txid) = wallet.transmit(&spell)?;
        println!("Commitment: {}", commitment_txid);
        println!("Spell:      {}", spell_txid);
    } else {
        println!("Commitment hex: {}", tx::encode(&spell.commitment));
        println!("Spell hex:      {}", tx::encode(&spell.spell));
    }
    Ok(())
}

fn load_prepared(path: &Path) -> Result<PreparedTransition> {
    Ok(serde_json::from_str(&fs::read_to_string(path)?)?)
}

fn sign(request: &Path, private_key: &str, out: Option<&Path>) -> Result<()> {
    let prepared = load_prepared(request)?;
    let key = KeyPair::from_hex(private_key)?;
    let response = sign_as_cosigner(&prepared.signatures, &key)?;
    let encoded = serde_json::to_string_pretty(&response)?;

    match out {
        Some(path) => {
            fs::write(path, encoded)?;
            println!(
                "Signed {} input(s) as {}; response written to {}",
                response.signatures.len(),
                response.public_key,
                path.display()
            );
        }
        None => println!("{}", encoded),
    }
    Ok(())
}

fn finalize(request: &Path, responses: &[PathBuf], transmit: bool) -> Result<()> {
    let prepared = load_prepared(request)?;
    let responses = responses
        .iter()
        .map(|path| -> Result<SignatureResponse> {
            Ok(serde_json::from_str(&fs::read_to_string(path)?)?)
        })
        .collect::<Result<Vec<_>>>()?;

    let (config, node, prover) = connect()?;
    let custody = GrailCustody::new(&config, &node, &prover);
    let spell = custody.finalize(&prepared, &responses)?;

    if transmit {
        let (commitment_txid, spell_txid) = custody.transmit(&spell)?;
        println!("Commitment: {}", commitment_txid);
        println!("Spell:      {}", spell_txid);
    } else {
        println!("Commitment hex: {}", tx::encode(&spell.commitment));
        println!("Spell hex:      {}", tx::encode(&spell.spell));
    }
    Ok(())
}

fn show(txid: &str) -> Result<()> {
    let (config, node, prover) = connect()?;
    let custody = GrailCustody::new(&config, &node, &prover);
    let record = custody.read_previous_state(&Txid::from_str(txid)?)?;

    println!("Cosigners: {}", record.cosigners);
    for key in record.cosigners.keys_hex() {
        println!("  {}", key);
    }
    if let Some(ticker) = &record.ticker {
        println!("Ticker: {}", ticker);
    }
    println!("Grail address: {}", grail_address(&record.cosigners, config.network)?);
    Ok(())
}

fn recover(
    payment: &str,
    policy: &UserPaymentPolicy,
    key: &KeyPair,
    destination: &str,
    fee: u64,
    transmit: bool,
) -> Result<()> {
    let config = GrailConfig::from_env()?;
    let node = BitcoinRpcClient::new(&RpcConfig::from_env())?;
    let outpoint = parse_outpoint(payment)?;

    let hex = node
        .get_transaction_hex(&outpoint.txid)?
        .ok_or_else(|| anyhow!("node does not know transaction {}", outpoint.txid))?;
    let funding = tx::decode(&hex)?;
    let prevout = funding
        .output
        .get(outpoint.vout as usize)
        .ok_or_else(|| anyhow!("{} has no output {}", outpoint.txid, outpoint.vout))?;

    let destination = address::validate_and_parse(destination, config.network)?;
    let recovery = build_recovery_transaction(
        policy,
        outpoint,
        prevout,
        key,
        &destination,
        fee,
        config.network,
    )?;

    if transmit {
        let txid = node.broadcast(&tx::encode(&recovery))?;
        println!("Recovery broadcast: {}", txid);
    } else {
        println!("Recovery hex: {}", tx::encode(&recovery));
    }
    Ok(())
}
