//! Strict CBOR helpers shared by the mirror and resync codecs.
//!
//! Bodies are definite-length maps with text keys. Unknown keys are skipped;
//! indefinite-length items and trailing bytes are rejected.

use std::convert::Infallible;

use minicbor::data::Type;
use minicbor::{Decoder, Encoder};
use thiserror::Error;

use crate::core::OpsErr;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DecodeLimits {
    pub max_map_entries: usize,
    pub max_text_len: usize,
    pub max_bytes_len: usize,
}

impl Default for DecodeLimits {
    fn default() -> Self {
        Self {
            max_map_entries: 64,
            max_text_len: 64 * 1024,
            max_bytes_len: 64 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Error)]
pub enum PacketEncodeError {
    #[error("cbor encode: {0}")]
    Cbor(#[from] minicbor::encode::Error<Infallible>),
}

#[derive(Debug, Error)]
pub enum PacketDecodeError {
    #[error("decode limit exceeded: {0}")]
    DecodeLimit(&'static str),
    #[error("indefinite-length CBOR not allowed")]
    IndefiniteLength,
    #[error("missing required field: {0}")]
    MissingField(&'static str),
    #[error("invalid field {field}: {reason}")]
    InvalidField { field: &'static str, reason: String },
    #[error("unknown packet kind: {0}")]
    UnknownKind(String),
    #[error("trailing bytes after packet body")]
    TrailingBytes,
    #[error("cbor decode: {0}")]
    Cbor(#[from] minicbor::decode::Error),
}

pub(crate) type Enc<'a> = Encoder<&'a mut Vec<u8>>;

pub(crate) fn encoder(buf: &mut Vec<u8>) -> Enc<'_> {
    Encoder::new(buf)
}

pub(crate) fn decode_map_len(
    dec: &mut Decoder,
    limits: &DecodeLimits,
) -> Result<usize, PacketDecodeError> {
    let len = dec.map()?;
    let Some(len) = len else {
        return Err(PacketDecodeError::IndefiniteLength);
    };
    if len > limits.max_map_entries as u64 {
        return Err(PacketDecodeError::DecodeLimit("max_map_entries"));
    }
    usize::try_from(len).map_err(|_| PacketDecodeError::DecodeLimit("max_map_entries"))
}

pub(crate) fn decode_text<'a>(
    dec: &mut Decoder<'a>,
    limits: &DecodeLimits,
) -> Result<&'a str, PacketDecodeError> {
    let ty = dec.datatype()?;
    if matches!(ty, Type::StringIndef) {
        return Err(PacketDecodeError::IndefiniteLength);
    }
    let s = dec.str()?;
    if s.len() > limits.max_text_len {
        return Err(PacketDecodeError::DecodeLimit("max_text_len"));
    }
    Ok(s)
}

pub(crate) fn decode_bytes<'a>(
    dec: &mut Decoder<'a>,
    limits: &DecodeLimits,
    field: &'static str,
) -> Result<&'a [u8], PacketDecodeError> {
    let ty = dec.datatype()?;
    if matches!(ty, Type::BytesIndef) {
        return Err(PacketDecodeError::IndefiniteLength);
    }
    let bytes = dec.bytes()?;
    if bytes.len() > limits.max_bytes_len {
        return Err(PacketDecodeError::InvalidField {
            field,
            reason: "bytes length exceeds limit".into(),
        });
    }
    Ok(bytes)
}

pub(crate) fn decode_u16(dec: &mut Decoder, field: &'static str) -> Result<u16, PacketDecodeError> {
    let value = dec.u64()?;
    u16::try_from(value).map_err(|_| PacketDecodeError::InvalidField {
        field,
        reason: format!("value {value} out of range for u16"),
    })
}

pub(crate) fn decode_u32(dec: &mut Decoder, field: &'static str) -> Result<u32, PacketDecodeError> {
    let value = dec.u64()?;
    u32::try_from(value).map_err(|_| PacketDecodeError::InvalidField {
        field,
        reason: format!("value {value} out of range for u32"),
    })
}

pub(crate) fn decode_ops_err(
    dec: &mut Decoder,
    field: &'static str,
) -> Result<OpsErr, PacketDecodeError> {
    let code = decode_u32(dec, field)?;
    OpsErr::from_code(code).ok_or_else(|| PacketDecodeError::InvalidField {
        field,
        reason: format!("unknown result code {code}"),
    })
}

/// Skip a value under an unknown key, refusing indefinite-length items.
pub(crate) fn skip_value(dec: &mut Decoder) -> Result<(), PacketDecodeError> {
    if is_indefinite(dec)? {
        return Err(PacketDecodeError::IndefiniteLength);
    }
    dec.skip()?;
    Ok(())
}

pub(crate) fn is_indefinite(dec: &Decoder) -> Result<bool, PacketDecodeError> {
    let ty = dec.datatype()?;
    Ok(matches!(
        ty,
        Type::BytesIndef | Type::StringIndef | Type::ArrayIndef | Type::MapIndef
    ))
}

pub(crate) fn ensure_consumed(dec: &Decoder, bytes: &[u8]) -> Result<(), PacketDecodeError> {
    if dec.position() != bytes.len() {
        return Err(PacketDecodeError::TrailingBytes);
    }
    Ok(())
}

pub(crate) fn require<T>(value: Option<T>, field: &'static str) -> Result<T, PacketDecodeError> {
    value.ok_or(PacketDecodeError::MissingField(field))
}
