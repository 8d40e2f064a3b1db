//! Framed binary encoding for SOL objects.
//!
//! # Layout
//! One record per object, all integers big-endian:
//!
//! ```text
//! [magic 0xA5][type u8][mac 8B][timestamp u64][value_len u32][value JSON bytes]
//! ```
//!
//! The value payload is the object's JSON value serialized compactly.  The
//! frame is self-delimiting, so records can be concatenated back-to-back
//! (the backup file) or carried individually (the HTTP publish payload).

use crate::object::{Mac, SolObject, SolType};

/// Leading byte of every encoded record.
pub const FRAME_MAGIC: u8 = 0xA5;

/// Fixed header size: magic + type + mac + timestamp + value length.
pub const HEADER_LEN: usize = 1 + 1 + 8 + 8 + 4;

// ---------------------------------------------------------------------------
// Encode
// ---------------------------------------------------------------------------

/// Encode one object into its framed binary form.
pub fn encode(obj: &SolObject) -> Result<Vec<u8>, CodecError> {
    let value_bytes = serde_json::to_vec(&obj.value)?;
    let value_len =
        u32::try_from(value_bytes.len()).map_err(|_| CodecError::ValueTooLarge(value_bytes.len()))?;

    let mut out = Vec::with_capacity(HEADER_LEN + value_bytes.len());
    out.push(FRAME_MAGIC);
    out.push(obj.sol_type.code());
    out.extend_from_slice(obj.mac.as_bytes());
    out.extend_from_slice(&(obj.timestamp as u64).to_be_bytes());
    out.extend_from_slice(&value_len.to_be_bytes());
    out.extend_from_slice(&value_bytes);
    Ok(out)
}

// ---------------------------------------------------------------------------
// Decode
// ---------------------------------------------------------------------------

/// Decode one object from the head of `buf`.
///
/// Returns the object and the number of bytes consumed, so callers can
/// walk a concatenated stream record by record.
pub fn decode(buf: &[u8]) -> Result<(SolObject, usize), CodecError> {
    if buf.len() < HEADER_LEN {
        return Err(CodecError::Truncated {
            needed: HEADER_LEN,
            got: buf.len(),
        });
    }
    if buf[0] != FRAME_MAGIC {
        return Err(CodecError::BadMagic(buf[0]));
    }
    let sol_type = SolType::from_code(buf[1]).ok_or(CodecError::UnknownType(buf[1]))?;
    let mac = Mac::from_slice(&buf[2..10]).ok_or(CodecError::Malformed("mac"))?;

    let mut ts_bytes = [0u8; 8];
    ts_bytes.copy_from_slice(&buf[10..18]);
    let timestamp = u64::from_be_bytes(ts_bytes) as i64;
    if timestamp <= 0 {
        return Err(CodecError::Malformed("timestamp"));
    }

    let mut len_bytes = [0u8; 4];
    len_bytes.copy_from_slice(&buf[18..22]);
    let value_len = u32::from_be_bytes(len_bytes) as usize;

    let total = HEADER_LEN + value_len;
    if buf.len() < total {
        return Err(CodecError::Truncated {
            needed: total,
            got: buf.len(),
        });
    }
    let value: serde_json::Value = serde_json::from_slice(&buf[HEADER_LEN..total])?;
    let obj = SolObject {
        mac,
        timestamp,
        sol_type,
        value,
    };
    Ok((obj, total))
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("bad frame magic 0x{0:02x}")]
    BadMagic(u8),
    #[error("unknown object type code 0x{0:02x}")]
    UnknownType(u8),
    #[error("truncated frame: need {needed} bytes, got {got}")]
    Truncated { needed: usize, got: usize },
    #[error("malformed frame field: {0}")]
    Malformed(&'static str),
    #[error("value payload too large: {0} bytes")]
    ValueTooLarge(usize),
    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),
}

impl CodecError {
    /// True when more bytes might complete the frame (vs. corrupt data).
    pub fn is_truncated(&self) -> bool {
        matches!(self, CodecError::Truncated { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample(ts: i64) -> SolObject {
        SolObject::new(
            Mac([0, 0x17, 0x0d, 0, 0, 0x38, 6, 0x5b]),
            ts,
            SolType::Event,
            json!({"eventType": "moteJoin", "moteId": 3}),
        )
        .unwrap()
    }

    #[test]
    fn encode_decode_is_identity() {
        let obj = sample(1_700_000_000);
        let bytes = encode(&obj).unwrap();
        let (back, consumed) = decode(&bytes).unwrap();
        assert_eq!(back, obj);
        assert_eq!(consumed, bytes.len());
    }

    #[test]
    fn decode_walks_concatenated_records() {
        let a = sample(1000);
        let b = sample(2000);
        let mut stream = encode(&a).unwrap();
        stream.extend(encode(&b).unwrap());

        let (first, n) = decode(&stream).unwrap();
        let (second, m) = decode(&stream[n..]).unwrap();
        assert_eq!(first.timestamp, 1000);
        assert_eq!(second.timestamp, 2000);
        assert_eq!(n + m, stream.len());
    }

    #[test]
    fn decode_rejects_bad_magic_and_unknown_type() {
        let mut bytes = encode(&sample(1000)).unwrap();
        bytes[0] = 0x00;
        assert!(matches!(decode(&bytes), Err(CodecError::BadMagic(0x00))));

        let mut bytes = encode(&sample(1000)).unwrap();
        bytes[1] = 0xee;
        assert!(matches!(decode(&bytes), Err(CodecError::UnknownType(0xee))));
    }

    #[test]
    fn decode_reports_truncation() {
        let bytes = encode(&sample(1000)).unwrap();
        let err = decode(&bytes[..bytes.len() - 3]).unwrap_err();
        assert!(err.is_truncated());
        let err = decode(&bytes[..4]).unwrap_err();
        assert!(err.is_truncated());
    }
}
