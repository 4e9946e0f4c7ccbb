//! Staged vector mutations and their durable record format.
//!
//! One record (version 1), big-endian:
//!
//! ```text
//! ver u8 | op u8 | key_len u8 | scalar u8 | dims u32 | ordinal u32 |
//! token u128 | payload_len u32 | crc32 u32 | key bytes | payload bytes
//! ```
//!
//! The checksum covers key and payload. Vector keys are 8 big-endian bytes;
//! the payload of an add or replace is the vector as little-endian f32s, a
//! remove has no payload. Each record carries the scalar kind and
//! dimensionality it was staged under, so a reader can reject a record that
//! disagrees with the domain's stored geometry. Records live both in WAL
//! segment frames and in the domain's delta catalog keyed by log sequence.

use byteorder::{BigEndian, ByteOrder, LittleEndian};
use cairn_core::{Error, Result};
use uuid::Uuid;

use super::ann::ScalarKind;

const RECORD_VERSION: u8 = 1;
const HEADER_LEN: usize = 36;

const OP_ADD: u8 = 1;
const OP_REMOVE: u8 = 2;
const OP_REPLACE: u8 = 3;

/// One staged mutation.
#[derive(Debug, Clone, PartialEq)]
pub enum DeltaOp {
    Add(Vec<f32>),
    Replace(Vec<f32>),
    Remove,
}

/// A staged mutation tagged with its transaction token and frame ordinal.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingUpdate {
    pub key: u64,
    pub op: DeltaOp,
    pub scalar: ScalarKind,
    pub dimensions: u32,
    pub ordinal: u32,
    pub token: Uuid,
}

impl PendingUpdate {
    pub fn encode(&self) -> Vec<u8> {
        let mut key = [0u8; 8];
        BigEndian::write_u64(&mut key, self.key);
        let payload = match &self.op {
            DeltaOp::Add(vector) | DeltaOp::Replace(vector) => {
                let mut buf = vec![0u8; vector.len() * 4];
                LittleEndian::write_f32_into(vector, &mut buf);
                buf
            }
            DeltaOp::Remove => Vec::new(),
        };
        let mut crc = crc32fast::Hasher::new();
        crc.update(&key);
        crc.update(&payload);

        let mut out = Vec::with_capacity(HEADER_LEN + key.len() + payload.len());
        out.push(RECORD_VERSION);
        out.push(match self.op {
            DeltaOp::Add(_) => OP_ADD,
            DeltaOp::Replace(_) => OP_REPLACE,
            DeltaOp::Remove => OP_REMOVE,
        });
        out.push(key.len() as u8);
        out.push(self.scalar.wire_code());
        let mut word = [0u8; 4];
        BigEndian::write_u32(&mut word, self.dimensions);
        out.extend_from_slice(&word);
        BigEndian::write_u32(&mut word, self.ordinal);
        out.extend_from_slice(&word);
        out.extend_from_slice(self.token.as_bytes());
        BigEndian::write_u32(&mut word, payload.len() as u32);
        out.extend_from_slice(&word);
        BigEndian::write_u32(&mut word, crc.finalize());
        out.extend_from_slice(&word);
        out.extend_from_slice(&key);
        out.extend_from_slice(&payload);
        out
    }

    pub fn decode(buf: &[u8]) -> Result<PendingUpdate> {
        if buf.len() < HEADER_LEN {
            return Err(Error::corruption("delta record is truncated"));
        }
        let version = buf[0];
        if version != RECORD_VERSION {
            return Err(Error::corruption(format!(
                "delta record version {version} unsupported"
            )));
        }
        let op = buf[1];
        let key_len = buf[2] as usize;
        let scalar = ScalarKind::from_wire_code(buf[3]).ok_or_else(|| {
            Error::corruption(format!("delta record scalar kind {} unknown", buf[3]))
        })?;
        let dimensions = BigEndian::read_u32(&buf[4..8]);
        let ordinal = BigEndian::read_u32(&buf[8..12]);
        let token = Uuid::from_slice(&buf[12..28])
            .map_err(|e| Error::corruption(format!("delta record token: {e}")))?;
        let payload_len = BigEndian::read_u32(&buf[28..32]) as usize;
        let expected_crc = BigEndian::read_u32(&buf[32..36]);
        if buf.len() != HEADER_LEN + key_len + payload_len {
            return Err(Error::corruption("delta record length mismatch"));
        }
        let key_bytes = &buf[HEADER_LEN..HEADER_LEN + key_len];
        let payload = &buf[HEADER_LEN + key_len..];
        let mut crc = crc32fast::Hasher::new();
        crc.update(key_bytes);
        crc.update(payload);
        if crc.finalize() != expected_crc {
            return Err(Error::corruption("delta record checksum mismatch"));
        }
        if key_len != 8 {
            return Err(Error::corruption(format!(
                "delta record key is {key_len} bytes, expected 8"
            )));
        }
        let key = BigEndian::read_u64(key_bytes);
        let decode_vector = |payload: &[u8]| -> Result<Vec<f32>> {
            if payload.len() != dimensions as usize * 4 {
                return Err(Error::corruption(format!(
                    "payload is {} bytes for {dimensions} f32 dimensions",
                    payload.len()
                )));
            }
            let mut vector = vec![0f32; payload.len() / 4];
            LittleEndian::read_f32_into(payload, &mut vector);
            Ok(vector)
        };
        let op = match op {
            OP_ADD => DeltaOp::Add(decode_vector(payload)?),
            OP_REPLACE => DeltaOp::Replace(decode_vector(payload)?),
            OP_REMOVE => DeltaOp::Remove,
            other => {
                return Err(Error::corruption(format!(
                    "delta record op {other} unknown"
                )))
            }
        };
        Ok(PendingUpdate {
            key,
            op,
            scalar,
            dimensions,
            ordinal,
            token,
        })
    }
}
