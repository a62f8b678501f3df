//! Types used in the interface between a connecting client and the server.
//!
//! Every message on the wire is a JSON envelope `{"type": ..., "data": ...}`. The server inspects
//! `type` before it interprets `data`.

use crate::challenge::{Challenge, CHALLENGE_LEN};
use crate::verify::ChallengeResponseClaim;
use base64::engine::general_purpose::STANDARD_NO_PAD;
use base64::Engine;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::value::RawValue;
use serde_with::base64::Base64;
use serde_with::{serde_as, DeserializeAs, SerializeAs};

/// Query parameter carrying the client identifier on the upgrade request.
pub const CLIENT_ID_QUERY_PARAM: &str = "client_id";

/// Message kinds a client may send.
pub mod kind {
    pub const CHALLENGE_RESPONSE: &str = "CHALLENGE_RESPONSE";
    pub const TEXT_MESSAGE: &str = "TEXT_MESSAGE";
}

// -- Server -> client -----------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServerMessage {
    /// Sent once, when the server starts waiting for a challenge response.
    Challenge(ChallengePayload),
    /// The client did something wrong.
    ClientError(ErrorPayload),
    /// The server failed; the client is not at fault.
    ServerError(ErrorPayload),
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChallengePayload {
    /// Standard, padded base64.
    #[serde_as(as = "Base64")]
    pub payload: [u8; CHALLENGE_LEN],
}

impl From<&Challenge> for ChallengePayload {
    fn from(challenge: &Challenge) -> Self {
        ChallengePayload {
            payload: *challenge.payload(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ErrorPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<serde_json::Value>,
}

impl ErrorPayload {
    pub fn new(title: impl Into<String>, detail: impl Into<String>) -> Self {
        ErrorPayload {
            title: Some(title.into()),
            detail: Some(detail.into()),
            ..Default::default()
        }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    pub fn with_meta(mut self, meta: serde_json::Value) -> Self {
        self.meta = Some(meta);
        self
    }
}

// -- Client -> server -----------------------------------------------------------------------------

/// Envelope of any message sent by a client. `data` is kept as unparsed JSON until the receiver
/// knows what `type` it is dealing with.
#[derive(Debug, Deserialize, Serialize)]
pub struct ClientMessage {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub data: Option<Box<RawValue>>,
}

impl ClientMessage {
    pub fn is(&self, kind: &str) -> bool {
        self.kind == kind
    }

    /// Interpret `data` as a `T`. A missing `data` field is treated as JSON `null`.
    pub fn data_as<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_str(self.data.as_deref().map_or("null", RawValue::get))
    }
}

/// Standard-alphabet base64 with no padding. Unlike `serde_with`'s `Base64<_, Unpadded>`, padded
/// input is rejected when decoding.
pub struct StrictUnpaddedBase64;

impl SerializeAs<Vec<u8>> for StrictUnpaddedBase64 {
    fn serialize_as<S: Serializer>(source: &Vec<u8>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD_NO_PAD.encode(source))
    }
}

impl<'de> DeserializeAs<'de, Vec<u8>> for StrictUnpaddedBase64 {
    fn deserialize_as<D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD_NO_PAD
            .decode(encoded)
            .map_err(serde::de::Error::custom)
    }
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChallengeResponse {
    /// Echo of the decoded challenge bytes.
    #[serde_as(as = "StrictUnpaddedBase64")]
    pub payload: Vec<u8>,
    /// `r || s`.
    #[serde_as(as = "StrictUnpaddedBase64")]
    pub signature: Vec<u8>,
}

impl From<ChallengeResponse> for ChallengeResponseClaim {
    fn from(response: ChallengeResponse) -> Self {
        ChallengeResponseClaim {
            plaintext: response.payload,
            signature: response.signature,
        }
    }
}
