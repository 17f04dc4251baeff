//! Scalar identifiers used across the protocol.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Unique identifier of an operator inside a committee.
///
/// Operator ids are small positive integers assigned at registration time;
/// id `0` is never a valid member.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct OperatorId(pub u64);

/// Height of a consensus decision. Each duty for a validator advances the
/// height by one; heights start at zero and never decrease.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Height(pub u64);

/// Round within a single height. The first round is `1`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Round(pub u64);

impl Height {
    /// The first height of a fresh identifier.
    pub const FIRST: Height = Height(0);

    /// The next height.
    pub fn next(self) -> Height {
        Height(self.0 + 1)
    }
}

impl Round {
    /// The first round of every instance.
    pub const FIRST: Round = Round(1);

    /// The next round.
    pub fn next(self) -> Round {
        Round(self.0 + 1)
    }
}

impl fmt::Display for OperatorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for Height {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for Round {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// SSZ support for `u64` newtypes: encoded exactly as the inner integer.
macro_rules! impl_ssz_for_u64_newtype {
    ($t:ty) => {
        impl ssz::Encode for $t {
            fn is_ssz_fixed_len() -> bool {
                true
            }

            fn ssz_fixed_len() -> usize {
                <u64 as ssz::Encode>::ssz_fixed_len()
            }

            fn ssz_bytes_len(&self) -> usize {
                self.0.ssz_bytes_len()
            }

            fn ssz_append(&self, buf: &mut Vec<u8>) {
                self.0.ssz_append(buf)
            }
        }

        impl ssz::Decode for $t {
            fn is_ssz_fixed_len() -> bool {
                true
            }

            fn ssz_fixed_len() -> usize {
                <u64 as ssz::Decode>::ssz_fixed_len()
            }

            fn from_ssz_bytes(bytes: &[u8]) -> Result<Self, ssz::DecodeError> {
                u64::from_ssz_bytes(bytes).map(Self)
            }
        }
    };
}

impl_ssz_for_u64_newtype!(OperatorId);
impl_ssz_for_u64_newtype!(Height);
impl_ssz_for_u64_newtype!(Round);

#[cfg(test)]
mod tests {
    use super::*;
    use ssz::{Decode, Encode};

    #[test]
    fn round_and_height_advance() {
        assert_eq!(Round::FIRST.next(), Round(2));
        assert_eq!(Height::FIRST.next(), Height(1));
    }

    #[test]
    fn ssz_round_trip() {
        let h = Height(42);
        let bytes = h.as_ssz_bytes();
        assert_eq!(bytes.len(), 8);
        assert_eq!(Height::from_ssz_bytes(&bytes).unwrap(), h);
    }
}
