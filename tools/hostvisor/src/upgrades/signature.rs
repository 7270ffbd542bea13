// Copyright 2025 - Nym Technologies SA <contact@nymtech.net>
// SPDX-License-Identifier: Apache-2.0

use crate::error::HostvisorError;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use ed25519_dalek::{Signature, VerifyingKey, PUBLIC_KEY_LENGTH};
use semver::Version;

/// Verifies release artifacts against the single embedded ed25519 public key.
#[derive(Debug, Clone)]
pub struct UpdateVerifier {
    key: VerifyingKey,
}

impl UpdateVerifier {
    pub fn new(key: VerifyingKey) -> Self {
        UpdateVerifier { key }
    }

    pub fn from_base64(encoded: &str) -> Result<Self, HostvisorError> {
        let raw = STANDARD
            .decode(encoded.trim())
            .map_err(|err| HostvisorError::InvalidPublicKey {
                reason: err.to_string(),
            })?;
        let raw: [u8; PUBLIC_KEY_LENGTH] =
            raw.try_into()
                .map_err(|raw: Vec<u8>| HostvisorError::InvalidPublicKey {
                    reason: format!(
                        "expected {PUBLIC_KEY_LENGTH} bytes, got {}",
                        raw.len()
                    ),
                })?;
        let key = VerifyingKey::from_bytes(&raw).map_err(|err| {
            HostvisorError::InvalidPublicKey {
                reason: err.to_string(),
            }
        })?;
        Ok(UpdateVerifier { key })
    }

    /// Decodes the base64 signature attached to the artifact of `version`.
    pub fn decode_signature(
        &self,
        version: &Version,
        encoded: &str,
    ) -> Result<Signature, HostvisorError> {
        let raw = STANDARD
            .decode(encoded.trim())
            .map_err(|err| HostvisorError::MalformedSignature {
                version: version.clone(),
                reason: err.to_string(),
            })?;
        Signature::from_slice(&raw).map_err(|err| HostvisorError::MalformedSignature {
            version: version.clone(),
            reason: err.to_string(),
        })
    }

    pub fn verify(
        &self,
        version: &Version,
        artifact: &[u8],
        signature: &Signature,
    ) -> Result<(), HostvisorError> {
        self.key
            .verify_strict(artifact, signature)
            .map_err(|_| HostvisorError::SignatureVerificationFailure {
                version: version.clone(),
            })
    }
}
