//! BLS12-381 primitives.
//!
//! Thin wrappers around `blst` in the `min_pk` configuration: 48-byte public
//! keys on G1, 96-byte signatures on G2. All signing happens over 32-byte
//! roots produced by [`crate::compute_signing_root`].

use blst::min_pk::{AggregatePublicKey, AggregateSignature, PublicKey, SecretKey, Signature};
use blst::BLST_ERROR;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Ciphersuite domain separation tag for all protocol signatures.
pub const BLS_DST: &[u8] = b"BLS_SIG_BLS12381G2_XMD:SHA-256_SSWU_RO_POP_";

/// Length of a compressed G1 public key.
pub const PUBLIC_KEY_LENGTH: usize = 48;

/// Length of a compressed G2 signature.
pub const SIGNATURE_LENGTH: usize = 96;

/// Errors from key parsing, verification and aggregation.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum AggregateError {
    #[error("invalid public key bytes")]
    InvalidPublicKey,
    #[error("invalid signature bytes")]
    InvalidSignature,
    #[error("nothing to aggregate")]
    Empty,
    #[error("bls operation failed: {0:?}")]
    Bls(BLST_ERROR),
}

/// A validated BLS public key.
#[derive(Clone)]
pub struct BlsPublicKey(PublicKey);

impl BlsPublicKey {
    /// Parse and group-check a compressed public key.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, AggregateError> {
        PublicKey::key_validate(bytes)
            .map(Self)
            .map_err(|_| AggregateError::InvalidPublicKey)
    }

    /// Compressed serialization.
    pub fn to_bytes(&self) -> [u8; PUBLIC_KEY_LENGTH] {
        self.0.compress()
    }

    /// Aggregate a set of public keys into one.
    pub fn aggregate(keys: &[BlsPublicKey]) -> Result<BlsPublicKey, AggregateError> {
        if keys.is_empty() {
            return Err(AggregateError::Empty);
        }
        let refs: Vec<&PublicKey> = keys.iter().map(|k| &k.0).collect();
        let agg = AggregatePublicKey::aggregate(&refs, false).map_err(AggregateError::Bls)?;
        Ok(BlsPublicKey(agg.to_public_key()))
    }

    fn inner(&self) -> &PublicKey {
        &self.0
    }
}

impl PartialEq for BlsPublicKey {
    fn eq(&self, other: &Self) -> bool {
        self.to_bytes() == other.to_bytes()
    }
}

impl Eq for BlsPublicKey {}

impl fmt::Debug for BlsPublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlsPublicKey({})", hex::encode(&self.to_bytes()[..8]))
    }
}

/// A parsed BLS signature.
#[derive(Clone)]
pub struct BlsSignature(Signature);

impl BlsSignature {
    /// Parse and group-check a compressed signature.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, AggregateError> {
        Signature::sig_validate(bytes, false)
            .map(Self)
            .map_err(|_| AggregateError::InvalidSignature)
    }

    /// Compressed serialization.
    pub fn to_bytes(&self) -> [u8; SIGNATURE_LENGTH] {
        self.0.compress()
    }

    /// Verify against a single public key.
    pub fn verify(&self, root: &[u8], pk: &BlsPublicKey) -> bool {
        self.0.verify(false, root, BLS_DST, &[], pk.inner(), false) == BLST_ERROR::BLST_SUCCESS
    }

    /// Verify an aggregated signature where every signer signed the same root.
    pub fn fast_aggregate_verify(&self, root: &[u8], pks: &[BlsPublicKey]) -> bool {
        if pks.is_empty() {
            return false;
        }
        let refs: Vec<&PublicKey> = pks.iter().map(|k| k.inner()).collect();
        self.0.fast_aggregate_verify(false, root, BLS_DST, &refs) == BLST_ERROR::BLST_SUCCESS
    }

    /// Aggregate signatures over the same root into one.
    pub fn aggregate(sigs: &[BlsSignature]) -> Result<BlsSignature, AggregateError> {
        if sigs.is_empty() {
            return Err(AggregateError::Empty);
        }
        let refs: Vec<&Signature> = sigs.iter().map(|s| &s.0).collect();
        let agg = AggregateSignature::aggregate(&refs, false).map_err(AggregateError::Bls)?;
        Ok(BlsSignature(agg.to_signature()))
    }
}

impl fmt::Debug for BlsSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlsSignature({})", hex::encode(&self.to_bytes()[..8]))
    }
}

/// Raw signature bytes as carried on the wire.
///
/// Parsing is deferred to verification time so that malformed signatures are
/// rejected by the validation pipeline rather than the codec.
#[derive(Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignatureBytes(#[serde(with = "hex::serde")] pub [u8; SIGNATURE_LENGTH]);

impl SignatureBytes {
    /// All-zero placeholder, used before a message is signed.
    pub const ZERO: SignatureBytes = SignatureBytes([0u8; SIGNATURE_LENGTH]);

    /// Parse into a group-checked signature.
    pub fn to_signature(&self) -> Result<BlsSignature, AggregateError> {
        BlsSignature::from_bytes(&self.0)
    }
}

impl From<BlsSignature> for SignatureBytes {
    fn from(sig: BlsSignature) -> Self {
        SignatureBytes(sig.to_bytes())
    }
}

impl Default for SignatureBytes {
    fn default() -> Self {
        Self::ZERO
    }
}

impl fmt::Debug for SignatureBytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SignatureBytes({})", hex::encode(&self.0[..8]))
    }
}

impl ssz::Encode for SignatureBytes {
    fn is_ssz_fixed_len() -> bool {
        true
    }

    fn ssz_fixed_len() -> usize {
        SIGNATURE_LENGTH
    }

    fn ssz_bytes_len(&self) -> usize {
        SIGNATURE_LENGTH
    }

    fn ssz_append(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.0);
    }
}

impl ssz::Decode for SignatureBytes {
    fn is_ssz_fixed_len() -> bool {
        true
    }

    fn ssz_fixed_len() -> usize {
        SIGNATURE_LENGTH
    }

    fn from_ssz_bytes(bytes: &[u8]) -> Result<Self, ssz::DecodeError> {
        if bytes.len() != SIGNATURE_LENGTH {
            return Err(ssz::DecodeError::InvalidByteLength {
                len: bytes.len(),
                expected: SIGNATURE_LENGTH,
            });
        }
        let mut out = [0u8; SIGNATURE_LENGTH];
        out.copy_from_slice(bytes);
        Ok(SignatureBytes(out))
    }
}

/// Signing key for one operator share.
pub struct KeyPair {
    sk: SecretKey,
    pk: BlsPublicKey,
}

impl KeyPair {
    /// Generate a fresh keypair from OS randomness.
    pub fn generate() -> KeyPair {
        let mut ikm = [0u8; 32];
        rand::Rng::fill(&mut rand::thread_rng(), &mut ikm);
        let sk = SecretKey::key_gen(&ikm, &[]).expect("32 bytes of ikm is sufficient");
        let pk = BlsPublicKey(sk.sk_to_pk());
        KeyPair { sk, pk }
    }

    /// Restore a keypair from a 32-byte scalar.
    pub fn from_secret_bytes(bytes: &[u8]) -> Result<KeyPair, AggregateError> {
        let sk = SecretKey::from_bytes(bytes).map_err(|_| AggregateError::InvalidPublicKey)?;
        let pk = BlsPublicKey(sk.sk_to_pk());
        Ok(KeyPair { sk, pk })
    }

    /// The secret scalar, for handing shares to a signer.
    pub fn secret_bytes(&self) -> [u8; 32] {
        self.sk.to_bytes()
    }

    /// The corresponding public key.
    pub fn public_key(&self) -> &BlsPublicKey {
        &self.pk
    }

    /// Sign a 32-byte root.
    pub fn sign(&self, root: &[u8]) -> BlsSignature {
        BlsSignature(self.sk.sign(root, BLS_DST, &[]))
    }
}

impl Clone for KeyPair {
    fn clone(&self) -> Self {
        let sk = SecretKey::from_bytes(&self.sk.to_bytes()).expect("secret key round-trips");
        KeyPair {
            sk,
            pk: self.pk.clone(),
        }
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair").field("pk", &self.pk).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_and_verify() {
        let kp = KeyPair::generate();
        let root = [7u8; 32];
        let sig = kp.sign(&root);
        assert!(sig.verify(&root, kp.public_key()));
        assert!(!sig.verify(&[8u8; 32], kp.public_key()));
    }

    #[test]
    fn aggregate_verifies_under_aggregated_keys() {
        let root = [3u8; 32];
        let kps: Vec<KeyPair> = (0..3).map(|_| KeyPair::generate()).collect();
        let sigs: Vec<BlsSignature> = kps.iter().map(|k| k.sign(&root)).collect();
        let pks: Vec<BlsPublicKey> = kps.iter().map(|k| k.public_key().clone()).collect();

        let agg = BlsSignature::aggregate(&sigs).unwrap();
        assert!(agg.fast_aggregate_verify(&root, &pks));
        // Dropping one key must break verification.
        assert!(!agg.fast_aggregate_verify(&root, &pks[..2]));
    }

    #[test]
    fn aggregation_is_commutative() {
        let root = [9u8; 32];
        let a = KeyPair::generate();
        let b = KeyPair::generate();
        let ab = BlsSignature::aggregate(&[a.sign(&root), b.sign(&root)]).unwrap();
        let ba = BlsSignature::aggregate(&[b.sign(&root), a.sign(&root)]).unwrap();
        assert_eq!(ab.to_bytes(), ba.to_bytes());
    }

    #[test]
    fn aggregate_of_one_is_identity() {
        let root = [1u8; 32];
        let kp = KeyPair::generate();
        let sig = kp.sign(&root);
        let agg = BlsSignature::aggregate(std::slice::from_ref(&sig)).unwrap();
        assert_eq!(agg.to_bytes(), sig.to_bytes());
    }

    #[test]
    fn signature_bytes_reject_bad_length() {
        use ssz::Decode;
        assert!(SignatureBytes::from_ssz_bytes(&[0u8; 95]).is_err());
    }
}
