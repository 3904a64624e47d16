//! Job handlers run by the daemon.
//!
//! Each handler validates and normalises its request and records the
//! normalised form as the job result. Signing and submission are wired in by
//! the deployment by registering its own handler under the same job type.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use walletflow::jobs::handlers::{boxed, parse_payload, BAD_PAYLOAD};
use walletflow::jobs::{HandlerOptions, HandlerRegistry, JobError, JobOutput};

pub const ACCOUNT_CREATE: &str = "account_create";
pub const TOKEN_TRANSFER: &str = "token_transfer";

const SIGNATURE_ALGOS: [&str; 2] = ["ECDSA_P256", "ECDSA_secp256k1"];
const HASH_ALGOS: [&str; 2] = ["SHA2_256", "SHA3_256"];

#[derive(Debug, Deserialize, Serialize, PartialEq, Eq)]
struct AccountCreate {
    /// Key index reserved for the new account's first key.
    key_index: u32,
    #[serde(default = "default_signature_algo")]
    signature_algo: String,
    #[serde(default = "default_hash_algo")]
    hash_algo: String,
}

fn default_signature_algo() -> String {
    SIGNATURE_ALGOS[0].to_string()
}

fn default_hash_algo() -> String {
    HASH_ALGOS[1].to_string()
}

impl AccountCreate {
    fn validate(self) -> Result<Self, JobError> {
        if !SIGNATURE_ALGOS.contains(&self.signature_algo.as_str()) {
            return Err(JobError::new(
                BAD_PAYLOAD,
                format!("unsupported signature algorithm {}", self.signature_algo),
            ));
        }
        if !HASH_ALGOS.contains(&self.hash_algo.as_str()) {
            return Err(JobError::new(
                BAD_PAYLOAD,
                format!("unsupported hash algorithm {}", self.hash_algo),
            ));
        }
        Ok(self)
    }
}

#[derive(Debug, Deserialize, Serialize, PartialEq, Eq)]
struct TokenTransfer {
    token: String,
    recipient: String,
    amount: String,
}

impl TokenTransfer {
    fn validate(self) -> Result<Self, JobError> {
        if self.token.trim().is_empty() {
            return Err(JobError::new(BAD_PAYLOAD, "token is empty"));
        }
        Ok(Self {
            recipient: normalize_address(&self.recipient)?,
            amount: normalize_amount(&self.amount)?,
            token: self.token,
        })
    }
}

/// `0x`-prefixed, 16 lowercase hex digits.
fn normalize_address(raw: &str) -> Result<String, JobError> {
    let trimmed = raw.trim();
    let hex = trimmed.strip_prefix("0x").unwrap_or(trimmed);
    if hex.is_empty() || hex.len() > 16 || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(JobError::new(BAD_PAYLOAD, format!("invalid address {raw:?}")));
    }
    Ok(format!("0x{:0>16}", hex.to_ascii_lowercase()))
}

/// Fixed point with 8 decimals, strictly positive.
fn normalize_amount(raw: &str) -> Result<String, JobError> {
    let invalid = || JobError::new(BAD_PAYLOAD, format!("invalid amount {raw:?}"));

    let (int, frac) = raw.trim().split_once('.').unwrap_or((raw.trim(), ""));
    let digits = |s: &str| s.chars().all(|c| c.is_ascii_digit());
    if int.is_empty() || frac.len() > 8 || !digits(int) || !digits(frac) {
        return Err(invalid());
    }

    let int = int.trim_start_matches('0');
    let int = if int.is_empty() { "0" } else { int };
    let amount = format!("{int}.{frac:0<8}");
    if amount.chars().all(|c| c == '0' || c == '.') {
        return Err(invalid());
    }
    Ok(amount)
}

fn output<T: Serialize>(request: &T) -> Result<JobOutput, JobError> {
    let result = serde_json::to_string(request)
        .map_err(|e| JobError::new("ENCODE_FAILED", e.to_string()))?;
    Ok(JobOutput {
        result: Some(result),
        transaction_id: None,
    })
}

pub fn build_registry() -> Arc<HandlerRegistry> {
    let mut registry = HandlerRegistry::new();

    // Key indices are handed out in order, one account at a time.
    registry.register_with_options(
        ACCOUNT_CREATE,
        |job, ctx| {
            boxed(async move {
                let request = parse_payload::<AccountCreate>(job)?.validate()?;
                tracing::info!(
                    job_id = %job.id,
                    worker_id = %ctx.worker_id,
                    key_index = request.key_index,
                    "account creation prepared"
                );
                output(&request)
            })
        },
        HandlerOptions::new()
            .max_concurrency(1)
            .timeout(Duration::from_secs(60)),
    );

    registry.register_with_options(
        TOKEN_TRANSFER,
        |job, ctx| {
            boxed(async move {
                let request = parse_payload::<TokenTransfer>(job)?.validate()?;
                tracing::info!(
                    job_id = %job.id,
                    worker_id = %ctx.worker_id,
                    token = %request.token,
                    recipient = %request.recipient,
                    amount = %request.amount,
                    "token transfer prepared"
                );
                output(&request)
            })
        },
        HandlerOptions::new()
            .max_concurrency(16)
            .timeout(Duration::from_secs(30)),
    );

    Arc::new(registry)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registers_the_wallet_job_types() {
        assert_eq!(
            build_registry().job_types(),
            vec![ACCOUNT_CREATE, TOKEN_TRANSFER]
        );
    }

    #[test]
    fn addresses_are_padded_and_lowercased() {
        assert_eq!(normalize_address("0xF8D6E0586B0A20C7").unwrap(), "0xf8d6e0586b0a20c7");
        assert_eq!(normalize_address("1cf0e2f2").unwrap(), "0x000000001cf0e2f2");
        assert!(normalize_address("0x").is_err());
        assert!(normalize_address("0xzz").is_err());
        assert!(normalize_address("0x0x01").is_err());
        assert!(normalize_address("0x1234567890abcdef0").is_err());
    }

    #[test]
    fn amounts_use_eight_decimals() {
        assert_eq!(normalize_amount("12.5").unwrap(), "12.50000000");
        assert_eq!(normalize_amount("007").unwrap(), "7.00000000");
        assert_eq!(normalize_amount("0.00000001").unwrap(), "0.00000001");
        assert!(normalize_amount("0.0").is_err());
        assert!(normalize_amount("1.000000001").is_err());
        assert!(normalize_amount("-3").is_err());
        assert!(normalize_amount(".5").is_err());
    }

    #[test]
    fn transfer_is_normalised() {
        let request = TokenTransfer {
            token: "FlowToken".into(),
            recipient: "0x01".into(),
            amount: "1".into(),
        }
        .validate()
        .unwrap();
        assert_eq!(request.recipient, "0x0000000000000001");
        assert_eq!(request.amount, "1.00000000");
    }

    #[test]
    fn unknown_signature_algorithm_is_a_bad_payload() {
        let err = AccountCreate {
            key_index: 3,
            signature_algo: "RSA".into(),
            hash_algo: default_hash_algo(),
        }
        .validate()
        .unwrap_err();
        assert_eq!(err.code, BAD_PAYLOAD);
        assert!(!err.is_retryable());
    }
}
