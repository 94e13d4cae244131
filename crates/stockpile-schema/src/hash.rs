use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Length of a hex-encoded SHA-256 digest.
pub const HASH_HEX_LEN: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HashError {
    #[error("invalid hash length: expected 64, got {0}")]
    InvalidLength(usize),
    #[error("invalid hash '{0}': expected lowercase hex digits")]
    InvalidHex(String),
}

/// SHA-256 digest of a package file, kept as 64 lowercase hex characters.
///
/// Serves both as the identity of a cached package and as its integrity
/// check. Construction validates the encoding, so any `ContentHash` value
/// can be used directly as a file name.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ContentHash(String);

impl ContentHash {
    pub fn parse(s: &str) -> Result<Self, HashError> {
        if s.len() != HASH_HEX_LEN {
            return Err(HashError::InvalidLength(s.len()));
        }
        if !s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f')) {
            return Err(HashError::InvalidHex(s.to_owned()));
        }
        Ok(Self(s.to_owned()))
    }

    /// Hash an in-memory buffer.
    pub fn of_bytes(data: &[u8]) -> Self {
        Self::from_digest(&Sha256::digest(data))
    }

    /// Wrap a finished SHA-256 digest.
    pub fn from_digest(digest: &[u8]) -> Self {
        Self(hex::encode(digest))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First 12 hex digits, for display.
    pub fn short(&self) -> &str {
        &self.0[..12]
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for ContentHash {
    type Err = HashError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for ContentHash {
    type Error = HashError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::parse(&s)
    }
}

impl From<ContentHash> for String {
    fn from(h: ContentHash) -> Self {
        h.0
    }
}

impl AsRef<str> for ContentHash {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HELLO: &str = "2d8bd7d9bb5f85ba643f0110d50cb506a1fe439e769a22503193ea6046bb87f7";

    #[test]
    fn of_bytes_matches_known_digest() {
        assert_eq!(ContentHash::of_bytes(b"Hello.").as_str(), HELLO);
        assert_eq!(
            ContentHash::of_bytes(b"Hello ex.").as_str(),
            "35514dabff674e92dcb50380047b415d5a0bcaa037a9f436ea510eba1a61aba5"
        );
    }

    #[test]
    fn parse_accepts_lowercase_hex() {
        let h = ContentHash::parse(HELLO).unwrap();
        assert_eq!(h.to_string(), HELLO);
        assert_eq!(h.short(), "2d8bd7d9bb5f");
    }

    #[test]
    fn parse_rejects_wrong_length() {
        assert_eq!(
            ContentHash::parse("abc"),
            Err(HashError::InvalidLength(3))
        );
    }

    #[test]
    fn parse_rejects_uppercase() {
        let upper = HELLO.to_uppercase();
        assert!(matches!(
            ContentHash::parse(&upper),
            Err(HashError::InvalidHex(_))
        ));
    }

    #[test]
    fn parse_rejects_non_hex() {
        let bad = format!("{}z", &HELLO[..63]);
        assert!(ContentHash::parse(&bad).is_err());
    }

    #[test]
    fn serde_validates_on_deserialize() {
        let ok: ContentHash = serde_json::from_str(&format!("\"{HELLO}\"")).unwrap();
        assert_eq!(ok.as_str(), HELLO);
        let bad: Result<ContentHash, _> = serde_json::from_str("\"nothex\"");
        assert!(bad.is_err());
    }

    #[test]
    fn equality_is_structural() {
        let a = ContentHash::parse(HELLO).unwrap();
        let b: ContentHash = HELLO.parse().unwrap();
        assert_eq!(a, b);
    }
}
