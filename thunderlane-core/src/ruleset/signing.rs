//! Ed25519 signatures over the canonical ruleset content.
//!
//! The signed message is the compact JSON of `{boundaries, coupling, lanes,
//! schedule}` with keys in that order and every parameter map key-sorted, so
//! the same content always yields the same bytes.

use base64::{Engine, engine::general_purpose::STANDARD};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::RngCore;
use rand::rngs::OsRng;
use serde::Serialize;

use super::model::{CouplingMatrix, LaneRules, Params, RuleSetContent};
use crate::error::Result;

/// Label stored alongside every signature.
pub const SIGNING_ALGORITHM: &str = "ed25519";

#[derive(Serialize)]
struct SignedFields<'a> {
    boundaries: &'a Params,
    coupling: &'a CouplingMatrix,
    lanes: &'a LaneRules,
    schedule: &'a str,
}

/// Canonical bytes covered by the signature.
pub fn canonical_bytes(content: &RuleSetContent) -> Result<Vec<u8>> {
    let fields = SignedFields {
        boundaries: &content.boundaries,
        coupling: &content.coupling,
        lanes: &content.lanes,
        schedule: &content.schedule,
    };
    Ok(serde_json::to_vec(&fields)?)
}

/// Holds the registry's signing key.
pub struct RuleSigner {
    key: SigningKey,
}

impl RuleSigner {
    /// Fresh key from the operating system RNG.
    #[must_use]
    pub fn generate() -> Self {
        let mut seed = [0_u8; 32];
        OsRng.fill_bytes(&mut seed);
        Self::from_seed(seed)
    }

    /// Deterministic key, for fixtures and key restore.
    #[must_use]
    pub fn from_seed(seed: [u8; 32]) -> Self {
        Self {
            key: SigningKey::from_bytes(&seed),
        }
    }

    /// Public half, for nodes that verify deployments.
    #[must_use]
    pub fn verifying_key(&self) -> VerifyingKey {
        self.key.verifying_key()
    }

    /// Base64 signature over the canonical content.
    pub fn sign(&self, content: &RuleSetContent) -> Result<String> {
        let message = canonical_bytes(content)?;
        Ok(STANDARD.encode(self.key.sign(&message).to_bytes()))
    }

    /// Check a base64 signature against content.
    pub fn verify(&self, content: &RuleSetContent, signature: &str) -> Result<(), String> {
        let raw = STANDARD
            .decode(signature)
            .map_err(|err| format!("invalid base64 signature: {err}"))?;
        let signature =
            Signature::from_slice(&raw).map_err(|err| format!("malformed signature: {err}"))?;
        let message = canonical_bytes(content).map_err(|err| err.to_string())?;
        self.key
            .verifying_key()
            .verify(&message, &signature)
            .map_err(|_| "signature does not match content".to_string())
    }
}

impl std::fmt::Debug for RuleSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuleSigner")
            .field("algorithm", &SIGNING_ALGORITHM)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use crate::ruleset::model::LaneRule;

    fn content() -> RuleSetContent {
        RuleSetContent::uniform(&LaneRule::new("life").param("birth", 3))
    }

    #[test]
    fn signature_verifies_until_content_changes() {
        let signer = RuleSigner::from_seed([7; 32]);
        let mut content = content();
        let signature = signer.sign(&content).unwrap();
        signer.verify(&content, &signature).unwrap();

        content.coupling.alpha_xz = 0.9;
        assert!(signer.verify(&content, &signature).is_err());
    }

    #[test]
    fn schedule_params_are_not_covered() {
        let signer = RuleSigner::from_seed([7; 32]);
        let mut content = content();
        let signature = signer.sign(&content).unwrap();
        content
            .schedule_params
            .insert("steps".into(), serde_json::json!(10));
        signer.verify(&content, &signature).unwrap();
    }

    #[test]
    fn canonical_bytes_order_keys() {
        let bytes = canonical_bytes(&content()).unwrap();
        let text = String::from_utf8(bytes).unwrap();
        assert!(text.starts_with(r#"{"boundaries":{},"coupling":{"alpha_xy":0.5"#));
    }

    #[test]
    fn garbage_signature_is_rejected() {
        let signer = RuleSigner::generate();
        assert!(signer.verify(&content(), "not base64!").is_err());
        assert!(signer.verify(&content(), "AAAA").is_err());
    }
}
