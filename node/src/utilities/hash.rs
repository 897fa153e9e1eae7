use std::fmt::Display;

use digest::consts::U32;
use digest::Digest;
use serde::{Deserialize, Serialize};

use crate::utilities::encoding;

/// A 32 byte blake2b digest.
#[derive(
    Copy, Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct Hash([u8; 32]);

impl Hash {
    pub fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn inner(&self) -> &[u8; 32] {
        &self.0
    }
}

impl AsRef<[u8]> for Hash {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl Display for Hash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", encoding::to_hex(self.0))
    }
}

pub fn blake2_256(data: &[u8]) -> Hash {
    let mut dest = [0; 32];
    type Blake2b256 = blake2::Blake2b<U32>;
    dest.copy_from_slice(Blake2b256::digest(data).as_slice());
    Hash(dest)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_blake2_deterministic() {
        assert_eq!(blake2_256(b"payload"), blake2_256(b"payload"));
        assert_ne!(blake2_256(b"payload"), blake2_256(b"other"));
    }
}
