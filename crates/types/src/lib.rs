//! Core types for the dvq consensus engine.
//!
//! This crate provides the foundational types used throughout the QBFT
//! implementation:
//!
//! - **Primitives**: heights, rounds, operator identifiers
//! - **Crypto**: BLS12-381 keys, signatures and aggregation
//! - **Committee view**: operators, shares and quorum arithmetic
//! - **Identity**: the 56-byte message identifier binding a validator to a duty role
//!
//! # Design Philosophy
//!
//! This crate is self-contained with minimal dependencies. It does not depend
//! on any other workspace crates, making it the foundation layer.

mod crypto;
mod identifiers;
mod keys;
mod message_id;
mod share;
mod signing;

pub use crypto::{
    AggregateError, BlsPublicKey, BlsSignature, KeyPair, SignatureBytes, BLS_DST,
    PUBLIC_KEY_LENGTH, SIGNATURE_LENGTH,
};
pub use identifiers::{Height, OperatorId, Round};
pub use keys::{KeyManager, KeyManagerError, LocalKeyManager};
pub use message_id::{MessageId, Role, MESSAGE_ID_LENGTH};
pub use share::{Operator, Share, ValidatorPublicKey};
pub use signing::{
    compute_signature_domain, compute_signing_root, DomainType, SignatureType, DOMAIN_PRIMARY_NET,
    SIG_TYPE_PARTIAL, SIG_TYPE_QBFT,
};
