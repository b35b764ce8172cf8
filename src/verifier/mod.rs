//! APK verifier interface (spec §4.8 "APK Verifier (interface only)").
//!
//! The core never implements signature/hash verification itself — that's
//! a signed-package verifier external collaborator (spec §1 "Out of
//! scope"). This module only defines the typed seam the embedding
//! application plugs its real implementation into, mirroring how
//! [`crate::transport::TransportAdapter`] defines a seam for transport
//! drivers it doesn't own.

use async_trait::async_trait;

/// What the core asks an external verifier to check a candidate update
/// package against.
#[derive(Debug, Clone)]
pub struct ExpectedPackage {
    pub sha256: String,
    pub size: u64,
    pub version_code: u32,
    pub signing_fingerprint: String,
}

/// A verified package's actual identity, returned on success.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedPackage {
    pub version_code: u32,
    pub version_name: String,
    pub fingerprint: String,
}

/// Typed verification failures (spec §4.8). Never carries a file path or
/// raw hash — [`VerificationFailure::user_message`] is what's safe to
/// show (spec §7 "User-visible messages ... MUST NOT include file paths
/// or raw hashes").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerificationFailure {
    FileNotFound,
    InvalidPackage,
    HashMismatch,
    SignatureMismatch,
    DowngradeRejected,
    PackageMismatch,
    VerificationError,
}

impl VerificationFailure {
    pub fn user_message(self) -> &'static str {
        match self {
            Self::FileNotFound => "update package could not be found",
            Self::InvalidPackage => "update package is invalid",
            Self::HashMismatch => "update package failed integrity verification",
            Self::SignatureMismatch => "update package signature is not trusted",
            Self::DowngradeRejected => "update package is an older version",
            Self::PackageMismatch => "update package does not match this app",
            Self::VerificationError => "update package could not be verified",
        }
    }
}

/// The seam the core consumes; the embedding application supplies a real
/// implementation backed by its platform's package manager (spec §6
/// "Environment ... driven by the embedding application", §4.8).
#[async_trait]
pub trait ApkVerifier: Send + Sync {
    async fn verify(
        &self,
        file_path: &std::path::Path,
        expected: &ExpectedPackage,
    ) -> Result<VerifiedPackage, VerificationFailure>;
}
