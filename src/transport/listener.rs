//! Shared TCP accept loop for the mirror and resync servers.

use std::fmt::Display;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use thiserror::Error;

const ACCEPT_POLL: Duration = Duration::from_millis(25);

#[derive(Debug, Error)]
pub enum ListenerError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Serves one accepted connection on its own thread.
pub trait ConnectionHandler: Send + Sync + 'static {
    type Error: Display;

    /// Called for every accepted stream. `shutdown` flips when the listener
    /// is stopped; long-running sessions should poll it between frames.
    fn handle(&self, stream: TcpStream, shutdown: &AtomicBool) -> Result<(), Self::Error>;

    /// Called instead of [`handle`](Self::handle) when the connection limit
    /// is reached.
    fn reject(&self, stream: TcpStream) {
        let _ = stream.shutdown(std::net::Shutdown::Both);
    }
}

#[derive(Clone, Debug)]
pub struct ListenerConfig {
    pub name: &'static str,
    pub listen_addr: String,
    pub max_connections: NonZeroUsize,
    pub io_timeout: Option<Duration>,
}

pub struct ListenerHandle {
    shutdown: Arc<AtomicBool>,
    join: JoinHandle<()>,
    local_addr: SocketAddr,
    active: Arc<AtomicUsize>,
}

impl ListenerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn active_connections(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    pub fn shutdown(self) {
        self.shutdown.store(true, Ordering::Relaxed);
        let _ = self.join.join();
    }
}

pub fn spawn_listener<H: ConnectionHandler>(
    config: ListenerConfig,
    handler: H,
) -> Result<ListenerHandle, ListenerError> {
    let listener = TcpListener::bind(&config.listen_addr)?;
    let local_addr = listener.local_addr()?;
    listener.set_nonblocking(true)?;

    let shutdown = Arc::new(AtomicBool::new(false));
    let active = Arc::new(AtomicUsize::new(0));
    let runtime = AcceptRuntime {
        config,
        handler: Arc::new(handler),
        shutdown: Arc::clone(&shutdown),
        active: Arc::clone(&active),
    };
    let join = thread::spawn(move || run_accept_loop(listener, runtime));

    tracing::info!(addr = %local_addr, "listener started");
    Ok(ListenerHandle {
        shutdown,
        join,
        local_addr,
        active,
    })
}

struct AcceptRuntime<H> {
    config: ListenerConfig,
    handler: Arc<H>,
    shutdown: Arc<AtomicBool>,
    active: Arc<AtomicUsize>,
}

fn run_accept_loop<H: ConnectionHandler>(listener: TcpListener, runtime: AcceptRuntime<H>) {
    let name = runtime.config.name;
    loop {
        if runtime.shutdown.load(Ordering::Relaxed) {
            break;
        }

        match listener.accept() {
            Ok((stream, peer)) => {
                if let Err(err) = prepare_stream(&stream, runtime.config.io_timeout) {
                    tracing::warn!(server = name, %peer, "failed to configure stream: {err}");
                    continue;
                }
                let Some(guard) =
                    ConnectionGuard::try_acquire(&runtime.active, runtime.config.max_connections)
                else {
                    tracing::warn!(server = name, %peer, "connection limit reached");
                    runtime.handler.reject(stream);
                    continue;
                };
                let handler = Arc::clone(&runtime.handler);
                let shutdown = Arc::clone(&runtime.shutdown);
                thread::spawn(move || {
                    let _guard = guard;
                    if let Err(err) = handler.handle(stream, &shutdown) {
                        tracing::warn!(server = name, %peer, "session error: {err}");
                    }
                });
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                thread::sleep(ACCEPT_POLL);
            }
            Err(err) => {
                tracing::warn!(server = name, "accept error: {err}");
                thread::sleep(ACCEPT_POLL);
            }
        }
    }
}

fn prepare_stream(stream: &TcpStream, io_timeout: Option<Duration>) -> std::io::Result<()> {
    stream.set_nonblocking(false)?;
    stream.set_nodelay(true)?;
    stream.set_read_timeout(io_timeout)?;
    stream.set_write_timeout(io_timeout)?;
    Ok(())
}

struct ConnectionGuard {
    active: Arc<AtomicUsize>,
}

impl ConnectionGuard {
    fn try_acquire(active: &Arc<AtomicUsize>, max: NonZeroUsize) -> Option<Self> {
        let mut current = active.load(Ordering::Acquire);
        loop {
            if current >= max.get() {
                return None;
            }
            match active.compare_exchange(
                current,
                current.saturating_add(1),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    return Some(Self {
                        active: Arc::clone(active),
                    });
                }
                Err(next) => current = next,
            }
        }
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        let prev = self.active.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "active connection counter underflow");
    }
}
