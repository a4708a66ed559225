//! Versioned binary encoding of [`IdentityRecord`].
//!
//! Layout: one schema version byte followed by the record as JSON. Claims are
//! kept in ordered maps so the same record always encodes to the same bytes.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Current schema version, written as the first byte.
pub const SCHEMA_VERSION: u8 = 1;

/// A verified identity, persisted between requests.
///
/// Records are never mutated after creation; a refresh replaces the record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdentityRecord {
    /// Stable user identifier (`sub`).
    pub subject: String,

    /// Claims from the ID token. `email` is read from here.
    #[serde(default)]
    pub claims: BTreeMap<String, serde_json::Value>,

    /// Group names without any external prefix.
    #[serde(default)]
    pub groups: Vec<String>,

    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,

    /// Raw ID token, kept for the forward-token header.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id_token: Option<String>,
}

impl IdentityRecord {
    pub fn email(&self) -> Option<&str> {
        self.claims.get("email").and_then(|v| v.as_str())
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    fn check_shape(&self) -> Result<(), CodecError> {
        if self.subject.is_empty() {
            return Err(CodecError::Malformed("empty subject".into()));
        }
        if self.issued_at >= self.expires_at {
            return Err(CodecError::Malformed(
                "issued_at must be before expires_at".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    #[error("malformed session record: {0}")]
    Malformed(String),

    #[error("session record expired")]
    Expired,
}

/// Encode a record. Records that could never decode are refused.
pub fn encode(record: &IdentityRecord) -> Result<Vec<u8>, CodecError> {
    record.check_shape()?;
    let mut out = vec![SCHEMA_VERSION];
    serde_json::to_writer(&mut out, record)
        .map_err(|e| CodecError::Malformed(format!("serialize: {e}")))?;
    Ok(out)
}

/// Decode a record and reject it if it has expired.
pub fn decode(bytes: &[u8]) -> Result<IdentityRecord, CodecError> {
    decode_at(bytes, Utc::now())
}

pub fn decode_at(bytes: &[u8], now: DateTime<Utc>) -> Result<IdentityRecord, CodecError> {
    let record = decode_ignoring_expiry(bytes)?;
    if record.is_expired_at(now) {
        return Err(CodecError::Expired);
    }
    Ok(record)
}

/// Decode without the expiry check, for callers that act on expiry
/// themselves (garbage collection).
pub fn decode_ignoring_expiry(bytes: &[u8]) -> Result<IdentityRecord, CodecError> {
    let (version, body) = bytes
        .split_first()
        .ok_or_else(|| CodecError::Malformed("empty payload".into()))?;

    match *version {
        SCHEMA_VERSION => {
            let record: IdentityRecord = serde_json::from_slice(body)
                .map_err(|e| CodecError::Malformed(format!("v{SCHEMA_VERSION} body: {e}")))?;
            record.check_shape()?;
            Ok(record)
        }
        other => Err(CodecError::Malformed(format!(
            "unknown schema version {other}"
        ))),
    }
}
