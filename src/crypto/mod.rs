//! Cryptographic primitives (spec §4.1 "Crypto / PSI-Ca").

pub mod psi;

use sha2::{Digest, Sha256};

pub use psi::{ClientPsi, ServerReply};

/// Hex-encoded SHA-256 digest of `bytes`.
pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Raw SHA-256 digest of `bytes`.
pub fn sha256(bytes: &[u8]) -> [u8; 32] {
    Sha256::digest(bytes).into()
}
