//! Public-key identities and their `npub` / hex encodings.

use std::{fmt, str::FromStr};

use bech32::{Bech32, Hrp};
use thiserror::Error;

/// Human-readable part of bech32-encoded public keys.
const NPUB_HRP: &str = "npub";

/// Errors produced while decoding an identity.
#[derive(Debug, Error, PartialEq)]
pub enum IdentityError {
    #[error("invalid encoding: {0}")]
    InvalidEncoding(String),

    #[error("invalid prefix: expected {expected}, got {got}")]
    InvalidPrefix { expected: String, got: String },

    #[error("invalid key length: expected 32 bytes, got {0}")]
    InvalidLength(usize),
}

/// A 32-byte x-only public key identifying an event author.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Identity([u8; 32]);

impl Identity {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Decode a 64-character hex public key, as carried in event `pubkey` fields.
    pub fn from_hex(input: &str) -> Result<Self, IdentityError> {
        let bytes =
            hex::decode(input).map_err(|e| IdentityError::InvalidEncoding(e.to_string()))?;
        Self::from_slice(&bytes)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Decode a bech32 `npub1...` string.
    pub fn from_npub(input: &str) -> Result<Self, IdentityError> {
        let (hrp, data) =
            bech32::decode(input).map_err(|e| IdentityError::InvalidEncoding(e.to_string()))?;
        if !hrp.as_str().eq_ignore_ascii_case(NPUB_HRP) {
            return Err(IdentityError::InvalidPrefix {
                expected: NPUB_HRP.into(),
                got: hrp.to_string(),
            });
        }
        Self::from_slice(&data)
    }

    /// Encode as a bech32 `npub1...` string.
    pub fn to_npub(&self) -> Result<String, IdentityError> {
        let hrp = Hrp::parse(NPUB_HRP).map_err(|e| IdentityError::InvalidEncoding(e.to_string()))?;
        bech32::encode::<Bech32>(hrp, &self.0)
            .map_err(|e| IdentityError::InvalidEncoding(e.to_string()))
    }

    fn from_slice(bytes: &[u8]) -> Result<Self, IdentityError> {
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| IdentityError::InvalidLength(bytes.len()))?;
        Ok(Self(arr))
    }
}

/// Accepts either the `npub` or the hex form.
impl FromStr for Identity {
    type Err = IdentityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let has_prefix = s
            .get(..NPUB_HRP.len())
            .is_some_and(|p| p.eq_ignore_ascii_case(NPUB_HRP));
        if has_prefix {
            Self::from_npub(s)
        } else {
            Self::from_hex(s)
        }
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}
