//! Secondary side: accepts forwarded requests and applies them.

use std::net::TcpStream;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use thiserror::Error;

use super::executor::MirrorExecutor;
use super::ops::{CloseFile, MkFile, UnlinkFile};
use super::proto::{MirrorOp, MirrorRequest, MirrorResponse};
use super::request::{MirroredRequest, RequestMeta};
use crate::core::OpsErr;
use crate::transport::{
    ConnectionHandler, DecodeLimits, FrameError, FrameReader, FrameWriter, ListenerConfig,
    ListenerError, ListenerHandle, PacketEncodeError, spawn_listener,
};

pub trait RequestHandler: Send + Sync + 'static {
    fn handle(&self, request: MirrorRequest) -> MirrorResponse;
}

/// Dispatches forwarded metadata operations into a [`MirrorExecutor`].
pub struct MetaRequestHandler {
    executor: Arc<MirrorExecutor>,
}

impl MetaRequestHandler {
    pub fn new(executor: Arc<MirrorExecutor>) -> Self {
        Self { executor }
    }

    fn run<R: MirroredRequest>(&self, mut op: R, meta: &RequestMeta) -> MirrorResponse {
        let outcome = self.executor.process(&mut op, meta);
        MirrorResponse::with_payload(outcome.result(), outcome.body())
    }
}

impl RequestHandler for MetaRequestHandler {
    fn handle(&self, request: MirrorRequest) -> MirrorResponse {
        let meta = RequestMeta {
            requestor: request.requestor,
            seq: request.seq,
            seq_done: request.seq_done,
            flags: request.flags,
        };
        // Anything that reaches us over the mirror channel belongs to a
        // mirror group.
        match request.op {
            MirrorOp::MkFile {
                parent,
                name,
                entry_id,
            } => self.run(
                MkFile {
                    parent,
                    name,
                    entry_id,
                    mirrored: true,
                },
                &meta,
            ),
            MirrorOp::UnlinkFile { parent, name } => self.run(
                UnlinkFile {
                    parent,
                    name,
                    mirrored: true,
                },
                &meta,
            ),
            MirrorOp::CloseFile { entry_id } => self.run(
                CloseFile {
                    entry_id,
                    mirrored: true,
                },
                &meta,
            ),
        }
    }
}

#[derive(Debug, Error)]
pub enum MirrorSessionError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),
    #[error("encode error: {0}")]
    Encode(#[from] PacketEncodeError),
}

pub struct MirrorServerConfig {
    pub listener: ListenerConfig,
    pub max_frame_bytes: usize,
    pub limits: DecodeLimits,
}

struct MirrorConnection<H> {
    handler: H,
    max_frame_bytes: usize,
    limits: DecodeLimits,
}

impl<H: RequestHandler> ConnectionHandler for MirrorConnection<H> {
    type Error = MirrorSessionError;

    fn handle(&self, stream: TcpStream, shutdown: &AtomicBool) -> Result<(), MirrorSessionError> {
        let mut reader = FrameReader::new(stream.try_clone()?, self.max_frame_bytes);
        let mut writer = FrameWriter::new(stream, self.max_frame_bytes);
        while !shutdown.load(Ordering::Relaxed) {
            let body = match reader.read_next() {
                Ok(Some(body)) => body,
                Ok(None) => break,
                Err(err) if err.is_disconnect() => break,
                Err(err) => return Err(err.into()),
            };
            let response = match MirrorRequest::decode(&body, &self.limits) {
                Ok(request) => self.handler.handle(request),
                Err(err) => {
                    tracing::warn!("malformed mirror request: {err}");
                    MirrorResponse::new(OpsErr::Inval)
                }
            };
            writer.write_frame(&response.encode()?)?;
        }
        Ok(())
    }
}

pub struct MirrorServer;

impl MirrorServer {
    pub fn start<H: RequestHandler>(
        config: MirrorServerConfig,
        handler: H,
    ) -> Result<ListenerHandle, ListenerError> {
        spawn_listener(
            config.listener,
            MirrorConnection {
                handler,
                max_frame_bytes: config.max_frame_bytes,
                limits: config.limits,
            },
        )
    }
}
