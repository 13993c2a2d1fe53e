//! Wire form of forwarded mirror requests and their responses.

use bytes::Bytes;
use minicbor::Decoder;

use crate::core::{EntryId, NodeId, OpsErr};
use crate::transport::cbor::{
    DecodeLimits, Enc, decode_bytes, decode_map_len, decode_ops_err, decode_text, decode_u32,
    encoder, ensure_consumed, require, skip_value,
};
use crate::transport::{PacketDecodeError, PacketEncodeError};

/// Set on a request that a primary forwarded to its secondary.
pub const BUDDY_MIRROR_SECOND: u32 = 1 << 0;

/// The mutation carried by a forwarded request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MirrorOp {
    MkFile {
        parent: EntryId,
        name: String,
        entry_id: EntryId,
    },
    UnlinkFile {
        parent: EntryId,
        name: String,
    },
    CloseFile {
        entry_id: EntryId,
    },
}

impl MirrorOp {
    pub fn kind(&self) -> &'static str {
        match self {
            MirrorOp::MkFile { .. } => "mk_file",
            MirrorOp::UnlinkFile { .. } => "unlink_file",
            MirrorOp::CloseFile { .. } => "close_file",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MirrorRequest {
    pub requestor: NodeId,
    pub seq: Option<u64>,
    pub seq_done: u64,
    pub flags: u32,
    pub op: MirrorOp,
}

impl MirrorRequest {
    pub fn is_secondary(&self) -> bool {
        self.flags & BUDDY_MIRROR_SECOND != 0
    }

    pub fn encode(&self) -> Result<Vec<u8>, PacketEncodeError> {
        let mut buf = Vec::new();
        let mut enc = encoder(&mut buf);
        let len = if self.seq.is_some() { 5 } else { 4 };
        enc.map(len)?;
        enc.str("requestor")?;
        enc.u32(self.requestor.get())?;
        if let Some(seq) = self.seq {
            enc.str("seq")?;
            enc.u64(seq)?;
        }
        enc.str("seq_done")?;
        enc.u64(self.seq_done)?;
        enc.str("flags")?;
        enc.u32(self.flags)?;
        enc.str("op")?;
        encode_op(&mut enc, &self.op)?;
        Ok(buf)
    }

    pub fn decode(bytes: &[u8], limits: &DecodeLimits) -> Result<Self, PacketDecodeError> {
        let mut dec = Decoder::new(bytes);
        let len = decode_map_len(&mut dec, limits)?;
        let mut requestor = None;
        let mut seq = None;
        let mut seq_done = None;
        let mut flags = None;
        let mut op = None;
        for _ in 0..len {
            match decode_text(&mut dec, limits)? {
                "requestor" => requestor = Some(NodeId::new(decode_u32(&mut dec, "requestor")?)),
                "seq" => seq = Some(dec.u64()?),
                "seq_done" => seq_done = Some(dec.u64()?),
                "flags" => flags = Some(decode_u32(&mut dec, "flags")?),
                "op" => op = Some(decode_op(&mut dec, limits)?),
                _ => skip_value(&mut dec)?,
            }
        }
        ensure_consumed(&dec, bytes)?;
        Ok(Self {
            requestor: require(requestor, "requestor")?,
            seq,
            seq_done: seq_done.unwrap_or(0),
            flags: flags.unwrap_or(0),
            op: require(op, "op")?,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MirrorResponse {
    pub result: OpsErr,
    pub payload: Bytes,
}

impl MirrorResponse {
    pub fn new(result: OpsErr) -> Self {
        Self {
            result,
            payload: Bytes::new(),
        }
    }

    pub fn with_payload(result: OpsErr, payload: Bytes) -> Self {
        Self { result, payload }
    }

    pub fn encode(&self) -> Result<Vec<u8>, PacketEncodeError> {
        let mut buf = Vec::new();
        let mut enc = encoder(&mut buf);
        enc.map(2)?;
        enc.str("result")?;
        enc.u32(self.result.code())?;
        enc.str("payload")?;
        enc.bytes(&self.payload)?;
        Ok(buf)
    }

    pub fn decode(bytes: &[u8], limits: &DecodeLimits) -> Result<Self, PacketDecodeError> {
        let mut dec = Decoder::new(bytes);
        let len = decode_map_len(&mut dec, limits)?;
        let mut result = None;
        let mut payload = None;
        for _ in 0..len {
            match decode_text(&mut dec, limits)? {
                "result" => result = Some(decode_ops_err(&mut dec, "result")?),
                "payload" => {
                    payload = Some(Bytes::copy_from_slice(decode_bytes(
                        &mut dec, limits, "payload",
                    )?))
                }
                _ => skip_value(&mut dec)?,
            }
        }
        ensure_consumed(&dec, bytes)?;
        Ok(Self {
            result: require(result, "result")?,
            payload: payload.unwrap_or_default(),
        })
    }
}

fn encode_op(enc: &mut Enc<'_>, op: &MirrorOp) -> Result<(), PacketEncodeError> {
    match op {
        MirrorOp::MkFile {
            parent,
            name,
            entry_id,
        } => {
            enc.map(4)?;
            enc.str("kind")?.str(op.kind())?;
            enc.str("parent")?.str(parent.as_str())?;
            enc.str("name")?.str(name)?;
            enc.str("entry_id")?.str(entry_id.as_str())?;
        }
        MirrorOp::UnlinkFile { parent, name } => {
            enc.map(3)?;
            enc.str("kind")?.str(op.kind())?;
            enc.str("parent")?.str(parent.as_str())?;
            enc.str("name")?.str(name)?;
        }
        MirrorOp::CloseFile { entry_id } => {
            enc.map(2)?;
            enc.str("kind")?.str(op.kind())?;
            enc.str("entry_id")?.str(entry_id.as_str())?;
        }
    }
    Ok(())
}

fn decode_op(dec: &mut Decoder<'_>, limits: &DecodeLimits) -> Result<MirrorOp, PacketDecodeError> {
    let len = decode_map_len(dec, limits)?;
    let mut kind = None;
    let mut parent = None;
    let mut name = None;
    let mut entry_id = None;
    for _ in 0..len {
        match decode_text(dec, limits)? {
            "kind" => kind = Some(decode_text(dec, limits)?.to_string()),
            "parent" => parent = Some(EntryId::new(decode_text(dec, limits)?)),
            "name" => name = Some(decode_text(dec, limits)?.to_string()),
            "entry_id" => entry_id = Some(EntryId::new(decode_text(dec, limits)?)),
            _ => skip_value(dec)?,
        }
    }
    let kind = require(kind, "kind")?;
    match kind.as_str() {
        "mk_file" => Ok(MirrorOp::MkFile {
            parent: require(parent, "parent")?,
            name: require(name, "name")?,
            entry_id: require(entry_id, "entry_id")?,
        }),
        "unlink_file" => Ok(MirrorOp::UnlinkFile {
            parent: require(parent, "parent")?,
            name: require(name, "name")?,
        }),
        "close_file" => Ok(MirrorOp::CloseFile {
            entry_id: require(entry_id, "entry_id")?,
        }),
        _ => Err(PacketDecodeError::UnknownKind(kind)),
    }
}
