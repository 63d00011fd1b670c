//! Spell proving through the external `charms` binary.
//!
//! The prover turns a spell request into an unsigned commitment/spell
//! transaction pair. Its output is treated as opaque apart from the two
//! transaction hex strings it prints last.

use crate::config::{env, GrailConfig};
use crate::custody::SpellDocument;
use crate::error::{GrailError, GrailResult};
use crate::utils::tx;
use bitcoin::Transaction;
use serde_json::Value;
use std::io::Write;
use std::process::{Command, Output, Stdio};

/// The unsigned transaction pair returned by the prover
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Spell {
    /// Pays into the output the spell transaction spends; signed by the node wallet
    pub commitment: Transaction,
    /// Spends the custody inputs and carries the new state in output 0
    pub spell: Transaction,
}

/// Proof generation and spell decoding
pub trait SpellProver {
    /// Build the transaction pair for `request`. `previous_txs` holds the hex of
    /// every transaction whose outputs the spell spends, plus the funding one.
    fn prove(&self, request: &dyn SpellDocument, previous_txs: &[String]) -> GrailResult<Spell>;

    /// Decode the spell carried by a transaction
    fn show_spell(&self, tx_hex: &str) -> GrailResult<Value>;
}

#[derive(Debug, Clone)]
pub struct CharmsProver {
    charms_bin: String,
    app_bin: String,
    mock_proof: bool,
}

impl CharmsProver {
    pub fn new(config: &GrailConfig) -> Self {
        Self {
            charms_bin: config.charms_bin.clone(),
            app_bin: config.app_bin.clone(),
            mock_proof: config.mock_proof,
        }
    }

    /// Verification key of the application binary
    pub fn verification_key(&self) -> GrailResult<String> {
        let output = self.command().args(["app", "vk", &self.app_bin]).output()?;
        let stdout = checked_stdout(output)?;
        last_line(&stdout)
            .map(str::to_string)
            .ok_or_else(|| GrailError::prover("charms app vk printed nothing"))
    }

    fn command(&self) -> Command {
        let mut command = Command::new(&self.charms_bin);
        command.env(env::MOCK_PROOF, if self.mock_proof { "true" } else { "false" });
        command
    }
}

impl SpellProver for CharmsProver {
    fn prove(&self, request: &dyn SpellDocument, previous_txs: &[String]) -> GrailResult<Spell> {
        let document = serde_json::to_string_pretty(&request.to_document())?;
        log::debug!("spell request:\n{}", document);

        let funding = request.funding();
        let mut command = self.command();
        command
            .args(["spell", "prove", "--app-bins", &self.app_bin])
            .args(["--funding-utxo", &funding.outpoint_id()])
            .args(["--funding-utxo-value", &funding.value.to_string()])
            .args(["--change-address", request.change_address()]);
        if !previous_txs.is_empty() {
            command.args(["--prev-txs", &previous_txs.join(",")]);
        }
        command
            .args(["--fee-rate", &request.fee_rate().to_string()])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        log::info!(
            "proving {} spell (mock proof: {})",
            request.action(),
            self.mock_proof
        );
        let mut child = command.spawn()?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(document.as_bytes())?;
        }
        let output = child.wait_with_output()?;
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        let stdout = checked_stdout(output)?;

        let [commitment, spell] = parse_prover_output(&stdout, &stderr)?;
        Ok(Spell {
            commitment: tx::decode(&commitment)?,
            spell: tx::decode(&spell)?,
        })
    }

    fn show_spell(&self, tx_hex: &str) -> GrailResult<Value> {
        let output = self
            .command()
            .args(["tx", "show-spell", "--tx", tx_hex, "--json"])
            .output()?;
        let stdout = checked_stdout(output)?;
        Ok(serde_json::from_str(stdout.trim())?)
    }
}

fn checked_stdout(output: Output) -> GrailResult<String> {
    if !output.status.success() {
        return Err(GrailError::prover(String::from_utf8_lossy(&output.stderr).into_owned()));
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

fn last_line(text: &str) -> Option<&str> {
    text.lines().rev().map(str::trim).find(|line| !line.is_empty())
}

/// Extract `[commitment, spell]` from the last non-empty line of prover output
pub fn parse_prover_output(stdout: &str, stderr: &str) -> GrailResult<[String; 2]> {
    let failure = |what: &str| {
        GrailError::prover(if stderr.trim().is_empty() {
            what.to_string()
        } else {
            stderr.to_string()
        })
    };

    let line = last_line(stdout).ok_or_else(|| failure("prover printed no transactions"))?;
    let parsed: Vec<String> = serde_json::from_str(line)
        .map_err(|_| failure("prover output is not a JSON array of transactions"))?;

    match <[String; 2]>::try_from(parsed) {
        Ok(pair) => Ok(pair),
        Err(parsed) => Err(failure(&format!(
            "prover returned {} transactions, expected 2",
            parsed.len()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_prover_output() {
        let stdout = "building proof\n\n[\"0200aa\",\"0200bb\"]\n\n";
        let [commitment, spell] = parse_prover_output(stdout, "").unwrap();
        assert_eq!(commitment, "0200aa");
        assert_eq!(spell, "0200bb");
    }

    #[test]
    fn test_wrong_transaction_count() {
        let err = parse_prover_output("[\"aa\"]", "").unwrap_err();
        assert!(matches!(err, GrailError::ExternalProverFailure { .. }));
        assert!(err.to_string().contains("expected 2"));

        assert!(parse_prover_output("[\"aa\",\"bb\",\"cc\"]", "").is_err());
    }

    #[test]
    fn test_failure_carries_stderr_verbatim() {
        let err = parse_prover_output("not json", "error: app binary not found\n").unwrap_err();
        match err {
            GrailError::ExternalProverFailure { message } => {
                assert_eq!(message, "error: app binary not found\n");
            }
            other => panic!("unexpected error: {}", other),
        }

        assert!(parse_prover_output("", "").is_err());
    }
}
