// SPDX-License-Identifier: MIT OR Apache-2.0
//! PEM encoding for the node's Ed25519 signing key (
//! `SVM_SIGNING_PRIVATE_KEY_PEM`). The composition root needs its own copy
//! of this codec, independent of the `eyeflow-cli` binary crate, since a
//! long-running node and an operator tool are separate deployables that
//! happen to share a key format.

use anyhow::{anyhow, Context, Result};
use base64::Engine;
use ed25519_dalek::{SigningKey, VerifyingKey};
use rand::rngs::OsRng;

const PUBLIC_HEADER: &str = "-----BEGIN PUBLIC KEY-----";
const PUBLIC_FOOTER: &str = "-----END PUBLIC KEY-----";

fn decode_pem_body(pem: &str) -> Result<Vec<u8>> {
    let b64: String = pem
        .lines()
        .filter(|line| !line.starts_with("-----"))
        .collect::<Vec<_>>()
        .join("");
    base64::engine::general_purpose::STANDARD
        .decode(b64.trim())
        .context("decode base64 PEM body")
}

/// Decode a PEM-wrapped Ed25519 private key.
///
/// # Errors
///
/// Returns an error if the PEM is malformed or does not decode to exactly
/// 32 bytes.
pub fn decode_private_key_pem(pem: &str) -> Result<SigningKey> {
    let bytes = decode_pem_body(pem)?;
    let array: [u8; 32] = bytes
        .try_into()
        .map_err(|_| anyhow!("private key is not 32 bytes"))?;
    Ok(SigningKey::from_bytes(&array))
}

/// PEM-encode a verifying key, for operators who want to publish the
/// node's public key out of band (wire events exclude it).
#[must_use]
pub fn encode_public_key_pem(key: &VerifyingKey) -> String {
    let b64 = base64::engine::general_purpose::STANDARD.encode(key.to_bytes());
    format!("{PUBLIC_HEADER}\n{b64}\n{PUBLIC_FOOTER}\n")
}

/// Resolve the node's signing key from `eyeflow.toml`'s `signing` table:
/// decode `private_key_pem` if configured, otherwise generate an ephemeral
/// key and warn that nothing signed this process's lifetime can be
/// re-verified by a node started later under the same `node_id`.
pub fn resolve_signing_key(pem: Option<&str>) -> Result<SigningKey> {
    match pem {
        Some(pem) => decode_private_key_pem(pem).context("decode signing.private_key_pem"),
        None => {
            tracing::warn!(
                "no signing.private_key_pem configured; generating an ephemeral key for this process"
            );
            Ok(SigningKey::generate(&mut OsRng))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_without_pem_generates_ephemeral_key() {
        let key = resolve_signing_key(None).unwrap();
        assert_eq!(key.to_bytes().len(), 32);
    }

    #[test]
    fn malformed_pem_is_rejected() {
        assert!(decode_private_key_pem("not a pem").is_err());
    }

    #[test]
    fn public_key_pem_has_expected_header() {
        let key = SigningKey::generate(&mut OsRng);
        let pem = encode_public_key_pem(&key.verifying_key());
        assert!(pem.starts_with(PUBLIC_HEADER));
        assert!(pem.trim_end().ends_with(PUBLIC_FOOTER));
    }
}
