//! Listener accepting raw resync sessions, one per connection.

use std::net::TcpStream;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use super::error::ResyncError;
use super::handler::RawResyncHandler;
use super::packet::{ResyncAck, ResyncSessionParams};
use super::raw_store::RawMetaStore;
use crate::core::OpsErr;
use crate::transport::{
    ConnectionHandler, DecodeLimits, FrameReader, FrameWriter, ListenerConfig, ListenerError,
    ListenerHandle, spawn_listener,
};

pub struct ResyncServerConfig {
    pub listener: ListenerConfig,
    pub max_frame_bytes: usize,
    pub store_client_xattrs: bool,
    pub limits: DecodeLimits,
}

struct ResyncConnection {
    store: Arc<dyn RawMetaStore>,
    store_client_xattrs: bool,
    max_frame_bytes: usize,
    limits: DecodeLimits,
}

impl ConnectionHandler for ResyncConnection {
    type Error = ResyncError;

    fn handle(&self, stream: TcpStream, _shutdown: &AtomicBool) -> Result<(), ResyncError> {
        let peer = stream.peer_addr().ok();
        let mut reader =
            FrameReader::new(stream.try_clone()?, self.max_frame_bytes).with_end_markers();
        let mut writer = FrameWriter::new(stream, self.max_frame_bytes);

        let Some(header) = reader.read_next()? else {
            return Ok(());
        };
        let params = match ResyncSessionParams::decode(&header, &self.limits) {
            Ok(params) => params,
            Err(err) => {
                writer.write_frame(&ResyncAck::new(OpsErr::Inval).encode()?)?;
                return Err(err.into());
            }
        };

        let handler = RawResyncHandler::new(self.store.as_ref(), self.store_client_xattrs)
            .with_limits(self.limits);
        let result = handler.run(&mut reader, &mut writer, &params)?;
        tracing::info!(
            peer = ?peer,
            base = %params.base_path,
            whole_directory = params.whole_directory,
            %result,
            "resync session finished"
        );
        Ok(())
    }
}

pub struct ResyncServer;

impl ResyncServer {
    pub fn start(
        config: ResyncServerConfig,
        store: Arc<dyn RawMetaStore>,
    ) -> Result<ListenerHandle, ListenerError> {
        spawn_listener(
            config.listener,
            ResyncConnection {
                store,
                store_client_xattrs: config.store_client_xattrs,
                max_frame_bytes: config.max_frame_bytes,
                limits: config.limits,
            },
        )
    }
}
