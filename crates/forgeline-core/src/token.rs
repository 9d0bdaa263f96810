//! Per-step bearer tokens (§6): a one-time credential a dispatched
//! step uses to call back into the API (log append, result report).

use chrono::{DateTime, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use crate::ResourceId;

pub const DEFAULT_TOKEN_TTL_SECONDS: i64 = 24 * 3600;

/// The plaintext token handed to the step's container. Never stored;
/// only its hash is persisted (`StepToken::hash`).
#[derive(Debug, Clone)]
pub struct StepTokenSecret(pub String);

/// A persisted, hashed step token. `hash` is SHA-256 of the plaintext
/// secret that was handed to the executing container.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepToken {
    pub id: ResourceId,
    pub step_run_id: ResourceId,
    pub hash: String,
    pub expires_at: DateTime<Utc>,
    pub revoked: bool,
}

fn hash_token(secret: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(secret.as_bytes());
    hex::encode(hasher.finalize())
}

/// Generates a fresh token for `step_run_id`, returning both the
/// plaintext (to hand to the container) and the record to persist.
pub fn generate_step_token(step_run_id: ResourceId, ttl_seconds: i64) -> (StepTokenSecret, StepToken) {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    let secret = base64_url_encode(&bytes);
    let record = StepToken {
        id: ResourceId::new(),
        step_run_id,
        hash: hash_token(&secret),
        expires_at: Utc::now() + chrono::Duration::seconds(ttl_seconds),
        revoked: false,
    };
    (StepTokenSecret(secret), record)
}

fn base64_url_encode(bytes: &[u8]) -> String {
    use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Validates a presented plaintext token against its stored record.
/// Callers must also check that `record.step_run_id` matches the step
/// id in the request URL — a token is only valid for the step it was
/// minted for, which prevents token-swapping between concurrently
/// running steps.
pub fn validate_step_token(record: &StepToken, presented: &str, now: DateTime<Utc>) -> bool {
    if record.revoked || now > record.expires_at {
        return false;
    }
    let presented_hash = hash_token(presented);
    presented_hash.as_bytes().ct_eq(record.hash.as_bytes()).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_token_validates_against_its_own_record() {
        let (secret, record) = generate_step_token(ResourceId::new(), DEFAULT_TOKEN_TTL_SECONDS);
        assert!(validate_step_token(&record, &secret.0, Utc::now()));
    }

    #[test]
    fn wrong_secret_is_rejected() {
        let (_secret, record) = generate_step_token(ResourceId::new(), DEFAULT_TOKEN_TTL_SECONDS);
        assert!(!validate_step_token(&record, "not-the-token", Utc::now()));
    }

    #[test]
    fn expired_token_is_rejected() {
        let (secret, record) = generate_step_token(ResourceId::new(), -1);
        assert!(!validate_step_token(&record, &secret.0, Utc::now()));
    }

    #[test]
    fn revoked_token_is_rejected() {
        let (secret, mut record) = generate_step_token(ResourceId::new(), DEFAULT_TOKEN_TTL_SECONDS);
        record.revoked = true;
        assert!(!validate_step_token(&record, &secret.0, Utc::now()));
    }
}
