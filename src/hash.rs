use std::fmt;
use std::str::FromStr;

use thiserror::Error;

/// 32 bytes content hash identifying a value or a task.
///
/// Two values with the same canonical serialisation hash equal in every
/// process; the digest is a plain blake3 over the canonical bytes.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Hash([u8; 32]);

impl Hash {
    pub(crate) fn digest(buffer: impl AsRef<[u8]>) -> Self {
        Hash(blake3::Hasher::new().update(buffer.as_ref()).finalize().into())
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Hash(bytes)
    }

    pub fn to_hex(self) -> String {
        use std::fmt::Write;

        self.0
            .iter()
            .fold(String::with_capacity(64), |mut out, byte| {
                // Writing into a String cannot fail.
                let _ = write!(out, "{byte:02x}");
                out
            })
    }

    /// Short prefix used in labels and log lines.
    pub(crate) fn tag(&self) -> String {
        self.to_hex()[..6].to_string()
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid hash literal: {0:?}")]
pub struct ParseHashError(String);

impl FromStr for Hash {
    type Err = ParseHashError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != 64 {
            return Err(ParseHashError(s.to_string()));
        }

        let mut bytes = [0u8; 32];
        for (i, chunk) in s.as_bytes().chunks(2).enumerate() {
            let hi = (chunk[0] as char).to_digit(16);
            let lo = (chunk[1] as char).to_digit(16);
            match (hi, lo) {
                (Some(hi), Some(lo)) => bytes[i] = ((hi << 4) | lo) as u8,
                _ => return Err(ParseHashError(s.to_string())),
            }
        }

        Ok(Hash(bytes))
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash({})", self.tag())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_is_stable() {
        assert_eq!(Hash::digest(b"abc"), Hash::digest(b"abc"));
        assert_ne!(Hash::digest(b"abc"), Hash::digest(b"abd"));
    }

    #[test]
    fn hex_round_trip() {
        let hash = Hash::digest(b"round trip");
        let parsed: Hash = hash.to_hex().parse().unwrap();
        assert_eq!(hash, parsed);
    }

    #[test]
    fn rejects_malformed_literals() {
        assert!("zz".parse::<Hash>().is_err());
        assert!("0123".parse::<Hash>().is_err());
    }
}
