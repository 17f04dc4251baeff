//! Signing-root construction.
//!
//! Every signature in the protocol is made over
//! `sha256(message_root || domain || signature_type)`. The 4-byte domain tag
//! separates networks; the 4-byte signature type separates consensus
//! signatures from post-consensus partial signatures.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Network domain tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DomainType(pub [u8; 4]);

/// Signature kind tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SignatureType(pub [u8; 4]);

/// Default domain for the primary network.
pub const DOMAIN_PRIMARY_NET: DomainType = DomainType([0x00, 0x00, 0x01, 0x01]);

/// Consensus (QBFT) signatures.
pub const SIG_TYPE_QBFT: SignatureType = SignatureType([0x01, 0x00, 0x00, 0x00]);

/// Post-consensus partial signatures.
pub const SIG_TYPE_PARTIAL: SignatureType = SignatureType([0x02, 0x00, 0x00, 0x00]);

/// Concatenate domain and signature type into the 8-byte signature domain.
pub fn compute_signature_domain(domain: DomainType, sig_type: SignatureType) -> [u8; 8] {
    let mut out = [0u8; 8];
    out[..4].copy_from_slice(&domain.0);
    out[4..].copy_from_slice(&sig_type.0);
    out
}

/// Compute the root actually handed to the BLS signer.
pub fn compute_signing_root(
    message_root: &[u8; 32],
    domain: DomainType,
    sig_type: SignatureType,
) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(message_root);
    hasher.update(compute_signature_domain(domain, sig_type));
    hasher.finalize().into()
}
