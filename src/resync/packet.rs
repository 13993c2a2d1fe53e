//! Records carried on a raw resync stream.
//!
//! Every record is one frame whose body is a CBOR map tagged by `"t"`. The
//! stream looks like:
//!
//! ```text
//! session -> ack
//! (packet [xattr* xattr_end] -> ack)*
//! <end marker> -> ack
//! ```
//!
//! A failed packet ack is followed by a second ack carrying the session
//! result, after which the receiver stops reading.

use minicbor::Decoder;

use crate::core::OpsErr;
use crate::transport::cbor::{
    DecodeLimits, Enc, decode_bytes, decode_map_len, decode_ops_err, decode_text, encoder,
    ensure_consumed, require, skip_value,
};
use crate::transport::{PacketDecodeError, PacketEncodeError};

const KIND_SESSION: &str = "session";
const KIND_INODE: &str = "inode";
const KIND_DIR: &str = "dir";
const KIND_DENTRY: &str = "dentry";
const KIND_XATTR: &str = "xattr";
const KIND_XATTR_END: &str = "xattr_end";
const KIND_ACK: &str = "ack";

/// First record of every session.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResyncSessionParams {
    /// Directory the session works in, relative to the mirror root.
    pub base_path: String,
    /// Bulk mode: entries below `base_path` not sent during the session are
    /// removed at the end.
    pub whole_directory: bool,
    /// Inode and directory packets are followed by their user xattrs.
    pub sync_xattrs: bool,
}

impl ResyncSessionParams {
    pub fn encode(&self) -> Result<Vec<u8>, PacketEncodeError> {
        let mut buf = Vec::new();
        let mut enc = encoder(&mut buf);
        enc.map(4)?;
        enc.str("t")?.str(KIND_SESSION)?;
        enc.str("base")?.str(&self.base_path)?;
        enc.str("whole")?.bool(self.whole_directory)?;
        enc.str("xattrs")?.bool(self.sync_xattrs)?;
        Ok(buf)
    }

    pub fn decode(bytes: &[u8], limits: &DecodeLimits) -> Result<Self, PacketDecodeError> {
        let fields = RecordFields::decode(bytes, limits)?;
        fields.expect_kind(KIND_SESSION)?;
        Ok(Self {
            base_path: fields.base.unwrap_or_default(),
            whole_directory: fields.whole.unwrap_or(false),
            sync_xattrs: fields.xattrs.unwrap_or(false),
        })
    }
}

/// Target of a dentry packet.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DentryLink {
    /// Self-contained dentry, applied like an inode.
    Inline { content: Vec<u8>, deletion: bool },
    /// Hard link to the inode stored under the parent's fsid directory.
    FsId { fs_id: String, deletion: bool },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ResyncPacket {
    Inode {
        path: String,
        content: Vec<u8>,
        deletion: bool,
    },
    Directory {
        path: String,
        content: Vec<u8>,
        deletion: bool,
    },
    Dentry {
        path: String,
        link: DentryLink,
    },
}

impl ResyncPacket {
    pub fn inode(path: impl Into<String>, content: impl Into<Vec<u8>>) -> Self {
        ResyncPacket::Inode {
            path: path.into(),
            content: content.into(),
            deletion: false,
        }
    }

    pub fn inode_tombstone(path: impl Into<String>) -> Self {
        ResyncPacket::Inode {
            path: path.into(),
            content: Vec::new(),
            deletion: true,
        }
    }

    pub fn directory(path: impl Into<String>) -> Self {
        ResyncPacket::Directory {
            path: path.into(),
            content: Vec::new(),
            deletion: false,
        }
    }

    pub fn directory_tombstone(path: impl Into<String>) -> Self {
        ResyncPacket::Directory {
            path: path.into(),
            content: Vec::new(),
            deletion: true,
        }
    }

    pub fn fs_id_link(path: impl Into<String>, fs_id: impl Into<String>) -> Self {
        ResyncPacket::Dentry {
            path: path.into(),
            link: DentryLink::FsId {
                fs_id: fs_id.into(),
                deletion: false,
            },
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ResyncPacket::Inode { .. } => KIND_INODE,
            ResyncPacket::Directory { .. } => KIND_DIR,
            ResyncPacket::Dentry { .. } => KIND_DENTRY,
        }
    }

    pub fn path(&self) -> &str {
        match self {
            ResyncPacket::Inode { path, .. }
            | ResyncPacket::Directory { path, .. }
            | ResyncPacket::Dentry { path, .. } => path,
        }
    }

    pub fn is_deletion(&self) -> bool {
        match self {
            ResyncPacket::Inode { deletion, .. } | ResyncPacket::Directory { deletion, .. } => {
                *deletion
            }
            ResyncPacket::Dentry { link, .. } => match link {
                DentryLink::Inline { deletion, .. } | DentryLink::FsId { deletion, .. } => {
                    *deletion
                }
            },
        }
    }

    /// Whether an xattr sub-stream follows this packet. Dentries never carry
    /// xattrs.
    pub fn carries_xattrs(&self, session: &ResyncSessionParams) -> bool {
        session.sync_xattrs
            && !self.is_deletion()
            && matches!(
                self,
                ResyncPacket::Inode { .. } | ResyncPacket::Directory { .. }
            )
    }

    pub fn encode(&self) -> Result<Vec<u8>, PacketEncodeError> {
        let mut buf = Vec::new();
        let mut enc = encoder(&mut buf);
        match self {
            ResyncPacket::Inode {
                path,
                content,
                deletion,
            }
            | ResyncPacket::Directory {
                path,
                content,
                deletion,
            } => {
                enc.map(4)?;
                enc.str("t")?.str(self.kind())?;
                enc.str("path")?.str(path)?;
                enc.str("content")?.bytes(content)?;
                enc.str("del")?.bool(*deletion)?;
            }
            ResyncPacket::Dentry { path, link } => {
                enc.map(4)?;
                enc.str("t")?.str(KIND_DENTRY)?;
                enc.str("path")?.str(path)?;
                encode_link(&mut enc, link)?;
            }
        }
        Ok(buf)
    }

    pub fn decode(bytes: &[u8], limits: &DecodeLimits) -> Result<Self, PacketDecodeError> {
        let fields = RecordFields::decode(bytes, limits)?;
        let kind = require(fields.kind.clone(), "t")?;
        let path = require(fields.path, "path")?;
        let deletion = fields.del.unwrap_or(false);
        match kind.as_str() {
            KIND_INODE => Ok(ResyncPacket::Inode {
                path,
                content: fields.content.unwrap_or_default(),
                deletion,
            }),
            KIND_DIR => Ok(ResyncPacket::Directory {
                path,
                content: fields.content.unwrap_or_default(),
                deletion,
            }),
            KIND_DENTRY => {
                let link = match fields.fs_id {
                    Some(fs_id) => DentryLink::FsId { fs_id, deletion },
                    None => DentryLink::Inline {
                        content: fields.content.unwrap_or_default(),
                        deletion,
                    },
                };
                Ok(ResyncPacket::Dentry { path, link })
            }
            _ => Err(PacketDecodeError::UnknownKind(kind)),
        }
    }
}

fn encode_link(enc: &mut Enc<'_>, link: &DentryLink) -> Result<(), PacketEncodeError> {
    match link {
        DentryLink::Inline { content, deletion } => {
            enc.str("content")?.bytes(content)?;
            enc.str("del")?.bool(*deletion)?;
        }
        DentryLink::FsId { fs_id, deletion } => {
            enc.str("fs_id")?.str(fs_id)?;
            enc.str("del")?.bool(*deletion)?;
        }
    }
    Ok(())
}

/// One record of the xattr sub-stream following an inode or directory.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum XAttrRecord {
    /// Name without the `user.` namespace prefix.
    Entry { name: String, value: Vec<u8> },
    End,
}

impl XAttrRecord {
    pub fn encode(&self) -> Result<Vec<u8>, PacketEncodeError> {
        let mut buf = Vec::new();
        let mut enc = encoder(&mut buf);
        match self {
            XAttrRecord::Entry { name, value } => {
                enc.map(3)?;
                enc.str("t")?.str(KIND_XATTR)?;
                enc.str("name")?.str(name)?;
                enc.str("value")?.bytes(value)?;
            }
            XAttrRecord::End => {
                enc.map(1)?;
                enc.str("t")?.str(KIND_XATTR_END)?;
            }
        }
        Ok(buf)
    }

    pub fn decode(bytes: &[u8], limits: &DecodeLimits) -> Result<Self, PacketDecodeError> {
        let fields = RecordFields::decode(bytes, limits)?;
        let kind = require(fields.kind, "t")?;
        match kind.as_str() {
            KIND_XATTR => {
                let name = require(fields.name, "name")?;
                if name.is_empty() {
                    return Err(PacketDecodeError::InvalidField {
                        field: "name",
                        reason: "xattr name is empty".into(),
                    });
                }
                Ok(XAttrRecord::Entry {
                    name,
                    value: fields.value.unwrap_or_default(),
                })
            }
            KIND_XATTR_END => Ok(XAttrRecord::End),
            _ => Err(PacketDecodeError::UnknownKind(kind)),
        }
    }
}

/// Per-packet and per-session result.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ResyncAck {
    pub result: OpsErr,
}

impl ResyncAck {
    pub fn new(result: OpsErr) -> Self {
        Self { result }
    }

    pub fn encode(&self) -> Result<Vec<u8>, PacketEncodeError> {
        let mut buf = Vec::new();
        let mut enc = encoder(&mut buf);
        enc.map(2)?;
        enc.str("t")?.str(KIND_ACK)?;
        enc.str("result")?.u32(self.result.code())?;
        Ok(buf)
    }

    pub fn decode(bytes: &[u8], limits: &DecodeLimits) -> Result<Self, PacketDecodeError> {
        let fields = RecordFields::decode(bytes, limits)?;
        fields.expect_kind(KIND_ACK)?;
        Ok(Self {
            result: require(fields.result, "result")?,
        })
    }
}

/// Union of all keys a record may carry; each record type picks its own.
#[derive(Default)]
struct RecordFields {
    kind: Option<String>,
    base: Option<String>,
    whole: Option<bool>,
    xattrs: Option<bool>,
    path: Option<String>,
    content: Option<Vec<u8>>,
    del: Option<bool>,
    fs_id: Option<String>,
    name: Option<String>,
    value: Option<Vec<u8>>,
    result: Option<OpsErr>,
}

impl RecordFields {
    fn decode(bytes: &[u8], limits: &DecodeLimits) -> Result<Self, PacketDecodeError> {
        let mut dec = Decoder::new(bytes);
        let len = decode_map_len(&mut dec, limits)?;
        let mut fields = RecordFields::default();
        for _ in 0..len {
            match decode_text(&mut dec, limits)? {
                "t" => fields.kind = Some(decode_text(&mut dec, limits)?.to_string()),
                "base" => fields.base = Some(decode_text(&mut dec, limits)?.to_string()),
                "whole" => fields.whole = Some(dec.bool()?),
                "xattrs" => fields.xattrs = Some(dec.bool()?),
                "path" => fields.path = Some(decode_text(&mut dec, limits)?.to_string()),
                "content" => {
                    fields.content = Some(decode_bytes(&mut dec, limits, "content")?.to_vec())
                }
                "del" => fields.del = Some(dec.bool()?),
                "fs_id" => fields.fs_id = Some(decode_text(&mut dec, limits)?.to_string()),
                "name" => fields.name = Some(decode_text(&mut dec, limits)?.to_string()),
                "value" => fields.value = Some(decode_bytes(&mut dec, limits, "value")?.to_vec()),
                "result" => fields.result = Some(decode_ops_err(&mut dec, "result")?),
                _ => skip_value(&mut dec)?,
            }
        }
        ensure_consumed(&dec, bytes)?;
        Ok(fields)
    }

    fn expect_kind(&self, expected: &'static str) -> Result<(), PacketDecodeError> {
        match self.kind.as_deref() {
            Some(kind) if kind == expected => Ok(()),
            Some(kind) => Err(PacketDecodeError::UnknownKind(kind.to_string())),
            None => Err(PacketDecodeError::MissingField("t")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits() -> DecodeLimits {
        DecodeLimits::default()
    }

    #[test]
    fn fs_id_dentry_keeps_its_link() {
        let packet = ResyncPacket::fs_id_link("a/f", "1-2-3");
        let decoded = ResyncPacket::decode(&packet.encode().unwrap(), &limits()).unwrap();
        assert_eq!(decoded, packet);
        assert!(!decoded.is_deletion());
    }

    #[test]
    fn inline_dentry_decodes_without_fs_id() {
        let packet = ResyncPacket::Dentry {
            path: "a/d".into(),
            link: DentryLink::Inline {
                content: b"dentry".to_vec(),
                deletion: true,
            },
        };
        let decoded = ResyncPacket::decode(&packet.encode().unwrap(), &limits()).unwrap();
        assert_eq!(decoded, packet);
        assert!(decoded.is_deletion());
    }

    #[test]
    fn xattrs_follow_only_live_inodes_and_dirs() {
        let session = ResyncSessionParams {
            base_path: "a".into(),
            whole_directory: true,
            sync_xattrs: true,
        };
        assert!(ResyncPacket::inode("a/f", b"x".to_vec()).carries_xattrs(&session));
        assert!(ResyncPacket::directory("a/d").carries_xattrs(&session));
        assert!(!ResyncPacket::inode_tombstone("a/f").carries_xattrs(&session));
        assert!(!ResyncPacket::fs_id_link("a/f", "id").carries_xattrs(&session));

        let plain = ResyncSessionParams {
            sync_xattrs: false,
            ..session
        };
        assert!(!ResyncPacket::inode("a/f", b"x".to_vec()).carries_xattrs(&plain));
    }

    #[test]
    fn packet_without_path_is_rejected() {
        let mut buf = Vec::new();
        let mut enc = encoder(&mut buf);
        enc.map(1).unwrap();
        enc.str("t").unwrap().str(KIND_INODE).unwrap();
        assert!(matches!(
            ResyncPacket::decode(&buf, &limits()),
            Err(PacketDecodeError::MissingField("path"))
        ));
    }

    #[test]
    fn ack_is_not_a_packet() {
        let ack = ResyncAck::new(OpsErr::Internal).encode().unwrap();
        assert!(matches!(
            ResyncPacket::decode(&ack, &limits()),
            Err(PacketDecodeError::MissingField("path"))
        ));
        assert_eq!(
            ResyncAck::decode(&ack, &limits()).unwrap().result,
            OpsErr::Internal
        );
    }

    #[test]
    fn session_header_decodes() {
        let params = ResyncSessionParams {
            base_path: "dentries/3A".into(),
            whole_directory: true,
            sync_xattrs: false,
        };
        let decoded = ResyncSessionParams::decode(&params.encode().unwrap(), &limits()).unwrap();
        assert_eq!(decoded, params);
        let xattr_end = XAttrRecord::End.encode().unwrap();
        assert!(matches!(
            ResyncSessionParams::decode(&xattr_end, &limits()),
            Err(PacketDecodeError::UnknownKind(kind)) if kind == KIND_XATTR_END
        ));
    }

    #[test]
    fn empty_xattr_name_is_invalid() {
        let record = XAttrRecord::Entry {
            name: String::new(),
            value: b"v".to_vec(),
        };
        assert!(matches!(
            XAttrRecord::decode(&record.encode().unwrap(), &limits()),
            Err(PacketDecodeError::InvalidField { field: "name", .. })
        ));
    }
}
