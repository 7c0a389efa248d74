//! The listener side of the remote-debug server (§4.8/§5): a background
//! thread bound to a single port, serving one client connection at a time.

use crate::session::Session;
use crate::transport::SELECT_TIMEOUT;
use labwired_core::debug::DebugTarget;
use socket2::{Domain, Socket, Type};
use std::net::{SocketAddr, TcpListener};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

#[derive(Debug, thiserror::Error)]
pub enum GdbError {
    #[error("failed to bind debug server socket: {0}")]
    Bind(#[source] std::io::Error),
}

pub struct GdbServer {
    listener: TcpListener,
    shutdown: Arc<AtomicBool>,
}

impl GdbServer {
    /// Binds `127.0.0.1:port` (or `0.0.0.0:port` when `localhost_only` is
    /// false) with a non-blocking accept loop, so the 1-second select
    /// timeout lets the server notice `shutdown` between connections.
    pub fn bind(port: u16, localhost_only: bool) -> Result<Self, GdbError> {
        let addr = if localhost_only { format!("127.0.0.1:{port}") } else { format!("0.0.0.0:{port}") };
        let sock_addr: SocketAddr = addr.parse().expect("constructed address is always valid");

        // SO_REUSEADDR must be set before bind, so go through socket2 and
        // convert into a std TcpListener once the socket is listening.
        let socket = Socket::new(Domain::for_address(sock_addr), Type::STREAM, None).map_err(GdbError::Bind)?;
        socket.set_reuse_address(true).map_err(GdbError::Bind)?;
        socket.bind(&sock_addr.into()).map_err(GdbError::Bind)?;
        socket.listen(128).map_err(GdbError::Bind)?;
        let listener: TcpListener = socket.into();
        listener.set_nonblocking(true).map_err(GdbError::Bind)?;

        tracing::info!("debug server listening on {addr}");
        Ok(Self { listener, shutdown: Arc::new(AtomicBool::new(false)) })
    }

    pub fn shutdown_handle(&self) -> Arc<AtomicBool> {
        self.shutdown.clone()
    }

    /// Runs the accept/serve loop until `shutdown` is set. Blocks the
    /// calling thread — spawn this on its own OS thread (§5's "debug-server
    /// thread").
    pub fn serve(&self, target: Arc<Mutex<dyn DebugTarget>>) {
        while !self.shutdown.load(Ordering::Acquire) {
            match self.listener.accept() {
                Ok((stream, addr)) => {
                    tracing::debug!(%addr, "debug client connected");
                    if let Err(e) = stream.set_read_timeout(Some(SELECT_TIMEOUT)) {
                        tracing::warn!("failed to configure debug client socket: {e}");
                        continue;
                    }
                    let mut session = Session::new(stream, target.clone(), self.shutdown.clone());
                    session.run();
                    tracing::debug!("debug client session ended");
                }
                Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    std::thread::sleep(SELECT_TIMEOUT);
                }
                Err(e) => {
                    tracing::warn!("debug server accept error: {e}");
                    std::thread::sleep(SELECT_TIMEOUT);
                }
            }
        }
        tracing::info!("debug server shut down");
    }
}
