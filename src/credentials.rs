// 🔑 Credentials - pluggable secret encoding and verification
// The orchestrator only asks "does this secret match"; storage format lives here.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;

pub trait CredentialVerifier: Send + Sync {
    /// Stored form of a secret, written at import time
    fn encode(&self, secret: &str) -> String;

    fn verify(&self, provided: &str, stored: &str) -> bool;
}

/// Secrets stored as given and compared for equality
#[derive(Debug, Clone, Copy, Default)]
pub struct PlainText;

impl CredentialVerifier for PlainText {
    fn encode(&self, secret: &str) -> String {
        secret.to_string()
    }

    fn verify(&self, provided: &str, stored: &str) -> bool {
        constant_time_eq(provided.as_bytes(), stored.as_bytes())
    }
}

/// Secrets stored as hex SHA-256 digests
#[derive(Debug, Clone, Copy, Default)]
pub struct Sha256Digest;

impl CredentialVerifier for Sha256Digest {
    fn encode(&self, secret: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(secret.as_bytes());
        format!("{:x}", hasher.finalize())
    }

    fn verify(&self, provided: &str, stored: &str) -> bool {
        constant_time_eq(self.encode(provided).as_bytes(), stored.to_lowercase().as_bytes())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CredentialScheme {
    #[default]
    Plain,
    Sha256,
}

impl CredentialScheme {
    pub fn verifier(&self) -> Arc<dyn CredentialVerifier> {
        match self {
            CredentialScheme::Plain => Arc::new(PlainText),
            CredentialScheme::Sha256 => Arc::new(Sha256Digest),
        }
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
