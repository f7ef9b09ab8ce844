//! SHA-256 digest newtype used for package integrity checks.
//!
//! Digests are stored as 64 lowercase hexadecimal characters. Parsing trims
//! and lower-cases operator input, so comparisons are case-insensitive.

use sha2::{Digest, Sha256};
use std::fmt;
use std::fs::File;
use std::io;
use std::path::Path;
use thiserror::Error;

/// Expected length of a hex-encoded SHA-256 digest.
const DIGEST_HEX_LEN: usize = 64;

/// Reasons a string is not a valid SHA-256 digest.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DigestError {
    /// The value does not have exactly 64 characters.
    #[error("expected {DIGEST_HEX_LEN} hex characters, got {len}")]
    Length {
        /// Length of the rejected value.
        len: usize,
    },

    /// The value contains a non-hexadecimal character.
    #[error("non-hex character '{ch}'")]
    NonHex {
        /// First offending character.
        ch: char,
    },
}

/// A validated, lowercase hex-encoded SHA-256 digest.
///
/// # Examples
///
/// ```
/// use rulegate::package::sha256_digest::Sha256Digest;
///
/// let digest = Sha256Digest::parse(&format!(" {} ", "AB".repeat(32))).unwrap();
/// assert_eq!(digest.as_str(), "ab".repeat(32));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Sha256Digest(String);

impl Sha256Digest {
    /// Parse operator-supplied input, trimming whitespace and ignoring case.
    ///
    /// # Errors
    ///
    /// Returns [`DigestError`] when the normalised value is not 64 hex
    /// characters.
    pub fn parse(value: &str) -> Result<Self, DigestError> {
        Self::try_from(value.trim().to_ascii_lowercase())
    }

    /// Return the digest as a hex string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Consume the wrapper and return the inner string.
    #[must_use]
    pub fn into_inner(self) -> String {
        self.0
    }
}

impl TryFrom<&str> for Sha256Digest {
    type Error = DigestError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::try_from(value.to_owned())
    }
}

impl TryFrom<String> for Sha256Digest {
    type Error = DigestError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        validate_sha256(&value)?;
        Ok(Self(value))
    }
}

impl AsRef<str> for Sha256Digest {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Sha256Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Hash the whole file at `path`.
///
/// # Errors
///
/// Returns any I/O error raised while opening or reading the file.
pub fn compute_sha256(path: &Path) -> io::Result<Sha256Digest> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher)?;
    Ok(Sha256Digest(format!("{:x}", hasher.finalize())))
}

fn validate_sha256(value: &str) -> Result<(), DigestError> {
    if value.len() != DIGEST_HEX_LEN {
        return Err(DigestError::Length { len: value.len() });
    }
    match value
        .chars()
        .find(|c| !(c.is_ascii_digit() || ('a'..='f').contains(c)))
    {
        Some(ch) => Err(DigestError::NonHex { ch }),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn parse_normalises_case_and_whitespace() {
        let digest = Sha256Digest::parse(&format!("  {}\n", "F".repeat(64))).expect("valid");
        assert_eq!(digest.as_str(), "f".repeat(64));
    }

    #[rstest]
    #[case::too_short("abcdef")]
    #[case::too_long(&"a".repeat(65))]
    #[case::non_hex(&format!("{}g", "a".repeat(63)))]
    fn rejects_malformed_digests(#[case] value: &str) {
        assert!(Sha256Digest::parse(value).is_err());
    }

    #[test]
    fn strict_conversion_rejects_uppercase() {
        let result = Sha256Digest::try_from("A".repeat(64));
        assert_eq!(result, Err(DigestError::NonHex { ch: 'A' }));
    }

    #[rstest]
    #[case::abc(b"abc", "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad")]
    #[case::empty(b"", "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855")]
    fn computes_known_digest(#[case] contents: &[u8], #[case] expected: &str) {
        let temp = tempfile::NamedTempFile::new().expect("temp file");
        std::fs::write(temp.path(), contents).expect("write");
        let digest = compute_sha256(temp.path()).expect("hash");
        assert_eq!(digest.as_str(), expected);
        assert_eq!(Sha256Digest::try_from(digest.as_str()), Ok(digest.clone()));
    }
}
