//! HTTP publish payload: chunks of binary-encoded objects.
//!
//! The aggregation server accepts POST bodies of the form
//! `{"v": <sol major>, "o": ["<base64>", ...]}` where each entry is one
//! framed binary object.  A chunk carries at most [`HTTP_CHUNK_SIZE`]
//! objects; a drain of N objects produces ceil(N / 10) chunks in buffer
//! order.

use crate::bin_codec::{self, CodecError};
use crate::object::SolObject;
use base64::{engine::general_purpose::STANDARD, Engine};
use serde::{Deserialize, Serialize};

/// Maximum number of objects per HTTP payload chunk.
pub const HTTP_CHUNK_SIZE: usize = 10;

/// One POST body for the aggregation server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpPayload {
    /// SOL payload format major version.
    pub v: u32,
    /// Base64 of framed binary objects, in buffer order.
    pub o: Vec<String>,
}

/// Encode `objects` and group them into payload chunks of at most
/// [`HTTP_CHUNK_SIZE`], preserving order.
pub fn to_chunks(objects: &[SolObject]) -> Result<Vec<HttpPayload>, CodecError> {
    let mut encoded = Vec::with_capacity(objects.len());
    for obj in objects {
        encoded.push(STANDARD.encode(bin_codec::encode(obj)?));
    }
    Ok(encoded
        .chunks(HTTP_CHUNK_SIZE)
        .map(|chunk| HttpPayload {
            v: crate::SOL_VERSION[0],
            o: chunk.to_vec(),
        })
        .collect())
}

/// Decode a payload back into objects.  Test-side inverse of
/// [`to_chunks`]; the production gateway never receives payloads.
pub fn from_payload(payload: &HttpPayload) -> Result<Vec<SolObject>, PayloadError> {
    let mut objects = Vec::with_capacity(payload.o.len());
    for entry in &payload.o {
        let bytes = STANDARD
            .decode(entry)
            .map_err(|e| PayloadError::Base64(e.to_string()))?;
        let (obj, consumed) = bin_codec::decode(&bytes)?;
        if consumed != bytes.len() {
            return Err(PayloadError::TrailingBytes(bytes.len() - consumed));
        }
        objects.push(obj);
    }
    Ok(objects)
}

#[derive(Debug, thiserror::Error)]
pub enum PayloadError {
    #[error("base64: {0}")]
    Base64(String),
    #[error("{0} trailing bytes after object frame")]
    TrailingBytes(usize),
    #[error(transparent)]
    Codec(#[from] CodecError),
}
