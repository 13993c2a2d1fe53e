//! Request/response round trips to a buddy node.

use std::collections::BTreeMap;
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::time::Duration;

use parking_lot::RwLock;
use thiserror::Error;

use super::proto::{MirrorRequest, MirrorResponse};
use crate::core::{NodeId, TargetId};
use crate::transport::{
    DecodeLimits, FrameError, FrameReader, FrameWriter, PacketDecodeError, PacketEncodeError,
};

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("no address known for node {0}")]
    UnknownNode(NodeId),
    #[error("failed to resolve {addr}: {source}")]
    Resolve {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),
    #[error("encode error: {0}")]
    Encode(#[from] PacketEncodeError),
    #[error("decode error: {0}")]
    Decode(#[from] PacketDecodeError),
    #[error("peer closed the connection before responding")]
    Closed,
}

/// Messaging boundary. A failed round trip is `None`, never an error value:
/// the executor classifies failures using the target state store.
pub trait Messenger: Send + Sync {
    fn request_response(&self, node: NodeId, request: &MirrorRequest) -> Option<MirrorResponse>;
}

/// Which node currently hosts a target.
#[derive(Debug, Default)]
pub struct TargetRoutes {
    routes: RwLock<BTreeMap<TargetId, NodeId>>,
}

impl TargetRoutes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_route(&self, target: TargetId, node: NodeId) {
        self.routes.write().insert(target, node);
    }

    pub fn remove_route(&self, target: TargetId) {
        self.routes.write().remove(&target);
    }

    pub fn node_of(&self, target: TargetId) -> Option<NodeId> {
        self.routes.read().get(&target).copied()
    }
}

#[derive(Clone, Debug)]
pub struct TcpMessengerConfig {
    pub nodes: BTreeMap<NodeId, String>,
    pub timeout: Duration,
    pub max_frame_bytes: usize,
    pub limits: DecodeLimits,
}

/// Opens one connection per round trip.
pub struct TcpMessenger {
    config: TcpMessengerConfig,
}

impl TcpMessenger {
    pub fn new(config: TcpMessengerConfig) -> Self {
        Self { config }
    }

    pub fn round_trip(
        &self,
        node: NodeId,
        request: &MirrorRequest,
    ) -> Result<MirrorResponse, TransportError> {
        let addr = self
            .config
            .nodes
            .get(&node)
            .ok_or(TransportError::UnknownNode(node))?;
        let socket = resolve(addr)?;
        let stream = TcpStream::connect_timeout(&socket, self.config.timeout)?;
        stream.set_nodelay(true)?;
        stream.set_read_timeout(Some(self.config.timeout))?;
        stream.set_write_timeout(Some(self.config.timeout))?;

        let mut writer = FrameWriter::new(stream.try_clone()?, self.config.max_frame_bytes);
        let mut reader = FrameReader::new(stream, self.config.max_frame_bytes);
        writer.write_frame(&request.encode()?)?;
        let Some(body) = reader.read_next()? else {
            return Err(TransportError::Closed);
        };
        Ok(MirrorResponse::decode(&body, &self.config.limits)?)
    }
}

impl Messenger for TcpMessenger {
    fn request_response(&self, node: NodeId, request: &MirrorRequest) -> Option<MirrorResponse> {
        match self.round_trip(node, request) {
            Ok(response) => Some(response),
            Err(err) => {
                tracing::warn!(node_id = %node, op = request.op.kind(), "forward failed: {err}");
                None
            }
        }
    }
}

fn resolve(addr: &str) -> Result<SocketAddr, TransportError> {
    addr.to_socket_addrs()
        .map_err(|source| TransportError::Resolve {
            addr: addr.to_string(),
            source,
        })?
        .next()
        .ok_or_else(|| TransportError::Resolve {
            addr: addr.to_string(),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "no socket address"),
        })
}
