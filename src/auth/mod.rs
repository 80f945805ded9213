//! Salted credential hashing.
//!
//! Passwords are never stored: each user record keeps a random 16-byte
//! salt and `SHA-256(salt ‖ password)`. Records persist inside the
//! catalog snapshot (see [`crate::catalog`]); verification recomputes the
//! hash and compares.

use rand::Rng;
use sha2::{Digest, Sha256};

use crate::encoding::{Decode, Encode, EncodingError};

/// Salt length in bytes.
pub const SALT_LEN: usize = 16;

/// A stored username + salted password hash.
#[derive(Debug, Clone, PartialEq)]
pub struct Credential {
    /// Login name, unique within the catalog.
    pub username: String,
    salt: [u8; SALT_LEN],
    hash: [u8; 32],
}

impl Credential {
    /// Creates a record with a fresh random salt.
    pub fn new(username: &str, password: &str) -> Self {
        let salt: [u8; SALT_LEN] = rand::rng().random();
        let hash = hash_password(&salt, password);
        Self {
            username: username.to_string(),
            salt,
            hash,
        }
    }

    /// True when `password` hashes to the stored digest.
    #[must_use]
    pub fn verify(&self, password: &str) -> bool {
        let candidate = hash_password(&self.salt, password);
        // Fold over every byte; no early exit on the first mismatch.
        candidate
            .iter()
            .zip(&self.hash)
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0
    }
}

fn hash_password(salt: &[u8; SALT_LEN], password: &str) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(salt);
    hasher.update(password.as_bytes());
    hasher.finalize().into()
}

impl Encode for Credential {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.username.encode_to(buf)?;
        self.salt.encode_to(buf)?;
        self.hash.encode_to(buf)
    }
}

impl Decode for Credential {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut off = 0;
        let (username, n) = String::decode_from(&buf[off..])?;
        off += n;
        let (salt, n) = <[u8; SALT_LEN]>::decode_from(&buf[off..])?;
        off += n;
        let (hash, n) = <[u8; 32]>::decode_from(&buf[off..])?;
        off += n;
        Ok((
            Self {
                username,
                salt,
                hash,
            },
            off,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoding::{decode_from_slice, encode_to_vec};

    #[test]
    fn correct_password_verifies() {
        let cred = Credential::new("alice", "s3cret");
        assert!(cred.verify("s3cret"));
    }

    #[test]
    fn wrong_password_rejected() {
        let cred = Credential::new("alice", "s3cret");
        assert!(!cred.verify("S3cret"));
        assert!(!cred.verify(""));
        assert!(!cred.verify("s3cret "));
    }

    #[test]
    fn same_password_different_salt_different_hash() {
        let a = Credential::new("alice", "pw");
        let b = Credential::new("bob", "pw");
        assert_ne!(a.hash, b.hash);
    }

    #[test]
    fn roundtrips_through_encoding() {
        let cred = Credential::new("carol", "hunter2");
        let bytes = encode_to_vec(&cred).unwrap();
        let (decoded, consumed) = decode_from_slice::<Credential>(&bytes).unwrap();
        assert_eq!(consumed, bytes.len());
        assert_eq!(decoded, cred);
        assert!(decoded.verify("hunter2"));
    }
}
