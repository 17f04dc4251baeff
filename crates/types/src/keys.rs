//! Key management.
//!
//! The engine never touches raw secret keys outside of a [`KeyManager`]
//! implementation. Production deployments plug in a remote signer with
//! slashing protection; [`LocalKeyManager`] keeps shares in memory and is
//! sufficient for consensus signatures and tests.

use crate::crypto::{BlsPublicKey, BlsSignature, KeyPair};
use parking_lot::RwLock;
use std::collections::HashMap;

/// Errors surfaced by signers.
#[derive(Debug, thiserror::Error)]
pub enum KeyManagerError {
    #[error("no share for public key")]
    UnknownShare,
    #[error("signer rejected the request: {0}")]
    Rejected(String),
}

/// Abstract signer for operator shares.
pub trait KeyManager: Send + Sync {
    /// Sign a 32-byte signing root with the share identified by `pk`.
    fn sign_root(&self, root: &[u8; 32], pk: &BlsPublicKey) -> Result<BlsSignature, KeyManagerError>;

    /// Register a share with the signer.
    fn add_share(&self, keypair: KeyPair);
}

/// In-memory signer holding shares keyed by public key.
#[derive(Default)]
pub struct LocalKeyManager {
    shares: RwLock<HashMap<[u8; 48], KeyPair>>,
}

impl LocalKeyManager {
    /// Create a signer pre-loaded with one share.
    pub fn with_share(keypair: KeyPair) -> LocalKeyManager {
        let km = LocalKeyManager::default();
        km.add_share(keypair);
        km
    }
}

impl KeyManager for LocalKeyManager {
    fn sign_root(&self, root: &[u8; 32], pk: &BlsPublicKey) -> Result<BlsSignature, KeyManagerError> {
        let shares = self.shares.read();
        let keypair = shares
            .get(&pk.to_bytes())
            .ok_or(KeyManagerError::UnknownShare)?;
        Ok(keypair.sign(root))
    }

    fn add_share(&self, keypair: KeyPair) {
        self.shares
            .write()
            .insert(keypair.public_key().to_bytes(), keypair);
    }
}
