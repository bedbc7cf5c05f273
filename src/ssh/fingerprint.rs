//! Host key fingerprints
//!
//! Servers are pinned by the SHA-256 digest of their public key blob. The raw
//! digest is what profiles store; the hex and OpenSSH forms are for logs.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

/// Outcome of checking a presented key against the pinned digest
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostKeyVerification {
    /// Pinned digest matches
    Verified,
    /// Nothing pinned yet; the presented key is trusted on first use
    FirstUse,
    Mismatch { expected: String, actual: String },
}

/// SHA-256 digest of a public key blob
pub fn fingerprint(key_blob: &[u8]) -> Vec<u8> {
    Sha256::digest(key_blob).to_vec()
}

/// `aa:bb:cc:...`
pub fn to_hex(digest: &[u8]) -> String {
    digest
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect::<Vec<_>>()
        .join(":")
}

/// `SHA256:<unpadded base64>`, as printed by `ssh-keygen -l`
pub fn to_openssh(digest: &[u8]) -> String {
    format!("SHA256:{}", BASE64.encode(digest).trim_end_matches('='))
}

pub fn verify(pinned: &[u8], actual: &[u8]) -> HostKeyVerification {
    if pinned.is_empty() {
        return HostKeyVerification::FirstUse;
    }
    if bool::from(pinned.ct_eq(actual)) {
        HostKeyVerification::Verified
    } else {
        HostKeyVerification::Mismatch {
            expected: to_hex(pinned),
            actual: to_hex(actual),
        }
    }
}
