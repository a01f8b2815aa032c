//! Trusted-header tool filtering for `tools/list`.
//!
//! When a public key is configured, the broker accepts an
//! `x-allowed-tools` header: a signed token whose payload maps backend
//! hostnames to the original tool names the caller may see. A valid
//! signature narrows the catalog to the intersection; a bad signature
//! yields an empty catalog (fail-closed); no header means no filtering.

use crate::error::{Error, Result};
use crate::registry::ToolRecord;
use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode};
use serde::Deserialize;
use std::collections::HashMap;

/// Decoded allow-list payload: backend hostname to permitted original
/// tool names.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AllowedTools {
    #[serde(flatten)]
    by_hostname: HashMap<String, Vec<String>>,
}

impl AllowedTools {
    /// Whether a tool (by its original name) on a backend hostname is
    /// permitted.
    pub fn permits(&self, hostname: &str, original_name: &str) -> bool {
        self.by_hostname
            .get(hostname)
            .is_some_and(|names| names.iter().any(|n| n == original_name))
    }

    /// Keep only the records the allow-list permits. `hostnames` maps
    /// backend names to their hostnames; a record whose backend has no
    /// known hostname is dropped.
    pub fn filter(&self, records: Vec<ToolRecord>, hostnames: &HashMap<String, String>) -> Vec<ToolRecord> {
        records
            .into_iter()
            .filter(|record| {
                hostnames
                    .get(&record.backend)
                    .is_some_and(|hostname| self.permits(hostname, &record.original_name))
            })
            .collect()
    }

    #[cfg(test)]
    pub fn from_map(by_hostname: HashMap<String, Vec<String>>) -> Self {
        Self { by_hostname }
    }
}

/// Verifies `x-allowed-tools` headers against a configured public key.
pub struct TrustedHeaderFilter {
    decoding: DecodingKey,
    validation: Validation,
}

impl TrustedHeaderFilter {
    /// Build a filter from an Ed25519 public key in PEM form.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the PEM is invalid.
    pub fn from_ed25519_pem(pem: &[u8]) -> Result<Self> {
        let decoding = DecodingKey::from_ed_pem(pem)
            .map_err(|e| Error::Config(format!("invalid trusted-header public key: {e}")))?;

        // The token is an authorization artifact minted by an external
        // engine; it carries no time bounds or audience of its own.
        let mut validation = Validation::new(Algorithm::EdDSA);
        validation.validate_exp = false;
        validation.validate_aud = false;
        validation.required_spec_claims = std::collections::HashSet::new();

        Ok(Self { decoding, validation })
    }

    /// Verify the header token and return its allow-list payload.
    ///
    /// # Errors
    ///
    /// Returns an error on any signature or format failure; callers must
    /// treat that as an empty allow-list.
    pub fn decode(&self, token: &str) -> Result<AllowedTools> {
        decode::<AllowedTools>(token, &self.decoding, &self.validation)
            .map(|data| data.claims)
            .map_err(|e| Error::SessionInvalid(format!("allowed-tools token rejected: {e}")))
    }
}
