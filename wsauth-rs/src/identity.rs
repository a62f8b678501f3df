//! Client identifiers.
//!
//! A client presents a single opaque identifier when it connects. The identifier is the unpadded,
//! standard-alphabet base64 encoding of a fixed 67-byte buffer:
//!
//! ```txt
//! [0:2]   version, big-endian u16, must be 0x0001
//! [2]     key kind, must be 0x04 (uncompressed SEC1 point)
//! [3:35]  X coordinate, big-endian
//! [35:67] Y coordinate, big-endian
//! ```
//!
//! Bytes `[2:67]` are exactly the SEC1 uncompressed encoding of a NIST P-256 point, so decoding
//! hands them straight to the curve-point construction.

use base64::engine::general_purpose::STANDARD_NO_PAD;
use base64::Engine;
use p256::ecdsa::VerifyingKey;
use thiserror::Error;

/// The only supported identifier version.
pub const IDENTITY_VERSION: u16 = 1;

/// SEC1 tag for an uncompressed curve point.
pub const UNCOMPRESSED_KEY_KIND: u8 = 0x04;

const COORDINATE_LEN: usize = 32;

/// Length of the decoded identifier buffer: version, key kind, X, Y.
pub const IDENTITY_LEN: usize = 2 + 1 + COORDINATE_LEN + COORDINATE_LEN;

/// Reasons a client identifier could not be decoded. All of these are attributable to the client.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("the client ID was not supplied by the client")]
    MissingIdentifier,
    #[error("the client ID is not valid unpadded base64: {0}")]
    MalformedEncoding(String),
    #[error(
        "the client ID is of a bad format: expected a base64 string encoding a buffer of \
         {IDENTITY_LEN} bytes, but it encodes {0} bytes"
    )]
    MalformedIdentifier(usize),
    #[error("the client ID version ({0}) is unsupported: the first two bytes must encode exactly 0x0001")]
    UnsupportedVersion(u16),
    #[error("the ECDSA key must be of kind 0x04 (uncompressed point), got {0:#04x}")]
    UnsupportedKeyKind(u8),
    #[error("the client ID does not encode a valid P-256 public key")]
    InvalidPublicKey,
}

impl DecodeError {
    /// Stable machine-readable code, sent alongside the human-readable message.
    pub fn code(&self) -> &'static str {
        match self {
            DecodeError::MissingIdentifier => "MISSING_IDENTIFIER",
            DecodeError::MalformedEncoding(_) => "MALFORMED_ENCODING",
            DecodeError::MalformedIdentifier(_) => "MALFORMED_IDENTIFIER",
            DecodeError::UnsupportedVersion(_) => "UNSUPPORTED_VERSION",
            DecodeError::UnsupportedKeyKind(_) => "UNSUPPORTED_KEY_KIND",
            DecodeError::InvalidPublicKey => "INVALID_PUBLIC_KEY",
        }
    }
}

/// A decoded client identity: identifier metadata plus the client's public key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientIdentity {
    version: u16,
    key_kind: u8,
    key: VerifyingKey,
}

impl ClientIdentity {
    /// Decode a client identifier. Validation stops at the first failing check, in the order
    /// documented on [`DecodeError`]'s variants.
    pub fn decode(identifier: &str) -> Result<Self, DecodeError> {
        let identifier = identifier.trim();
        if identifier.is_empty() {
            return Err(DecodeError::MissingIdentifier);
        }

        let buf = STANDARD_NO_PAD
            .decode(identifier)
            .map_err(|e| DecodeError::MalformedEncoding(e.to_string()))?;
        if buf.len() != IDENTITY_LEN {
            return Err(DecodeError::MalformedIdentifier(buf.len()));
        }

        let version = u16::from_be_bytes([buf[0], buf[1]]);
        if version != IDENTITY_VERSION {
            return Err(DecodeError::UnsupportedVersion(version));
        }

        let key_kind = buf[2];
        if key_kind != UNCOMPRESSED_KEY_KIND {
            return Err(DecodeError::UnsupportedKeyKind(key_kind));
        }

        let key =
            VerifyingKey::from_sec1_bytes(&buf[2..]).map_err(|_| DecodeError::InvalidPublicKey)?;

        Ok(ClientIdentity {
            version,
            key_kind,
            key,
        })
    }

    /// Build the identity a client holding `key` would present.
    pub fn from_verifying_key(key: VerifyingKey) -> Self {
        ClientIdentity {
            version: IDENTITY_VERSION,
            key_kind: UNCOMPRESSED_KEY_KIND,
            key,
        }
    }

    /// Encode this identity as a client identifier string.
    pub fn to_client_id(&self) -> String {
        let point = self.key.to_encoded_point(false);
        let mut buf = Vec::with_capacity(IDENTITY_LEN);
        buf.extend_from_slice(&self.version.to_be_bytes());
        // Uncompressed SEC1 encoding: 0x04 || X || Y
        buf.extend_from_slice(point.as_bytes());
        STANDARD_NO_PAD.encode(buf)
    }

    pub fn version(&self) -> u16 {
        self.version
    }

    pub fn key_kind(&self) -> u8 {
        self.key_kind
    }

    pub fn verifying_key(&self) -> &VerifyingKey {
        &self.key
    }

    /// Big-endian X coordinate of the public key.
    pub fn x(&self) -> [u8; COORDINATE_LEN] {
        self.coordinates().0
    }

    /// Big-endian Y coordinate of the public key.
    pub fn y(&self) -> [u8; COORDINATE_LEN] {
        self.coordinates().1
    }

    fn coordinates(&self) -> ([u8; COORDINATE_LEN], [u8; COORDINATE_LEN]) {
        let point = self.key.to_encoded_point(false);
        // 0x04 || X || Y
        let bytes = &point.as_bytes()[1..];
        let mut x = [0; COORDINATE_LEN];
        let mut y = [0; COORDINATE_LEN];
        x.copy_from_slice(&bytes[..COORDINATE_LEN]);
        y.copy_from_slice(&bytes[COORDINATE_LEN..]);
        (x, y)
    }
}
