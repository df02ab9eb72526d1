//! Local HTTP server used to check the device can reach this host
//!
//! Serves `GET /` with a fixed `PASS` body. The listener is bound
//! synchronously so an in-use port comes back as
//! `ProbeServerError::AddrInUse` and the caller can move on to another port.
//! The server itself runs on a dedicated thread with a current-thread tokio
//! runtime and is shut down and joined by `stop` or on drop.

use std::io;
use std::net::{IpAddr, SocketAddr, TcpListener};
use std::thread::JoinHandle;

use axum::routing::get;
use axum::Router;
use tokio::sync::oneshot;
use tracing::debug;

/// Body served at `/`
pub const PROBE_BODY: &str = "PASS";

/// Probe server errors
#[derive(Debug, thiserror::Error)]
pub enum ProbeServerError {
    #[error("address {0} already in use")]
    AddrInUse(SocketAddr),

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("failed to start probe server: {0}")]
    Start(#[source] io::Error),

    #[error("probe server failed: {0}")]
    Serve(#[source] io::Error),

    #[error("probe server thread panicked")]
    Panicked,
}

/// Router with the single probe route
pub fn probe_router() -> Router {
    Router::new().route("/", get(|| async { PROBE_BODY }))
}

/// A running probe server
pub struct ProbeServer {
    addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    thread: Option<JoinHandle<io::Result<()>>>,
}

impl ProbeServer {
    /// Bind `host:port` and start serving. Port 0 picks a free port.
    pub fn start(host: IpAddr, port: u16) -> Result<Self, ProbeServerError> {
        let requested = SocketAddr::new(host, port);
        let listener = TcpListener::bind(requested).map_err(|source| {
            if source.kind() == io::ErrorKind::AddrInUse {
                ProbeServerError::AddrInUse(requested)
            } else {
                ProbeServerError::Bind {
                    addr: requested,
                    source,
                }
            }
        })?;
        listener.set_nonblocking(true).map_err(ProbeServerError::Start)?;
        let addr = listener.local_addr().map_err(ProbeServerError::Start)?;

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_io()
            .build()
            .map_err(ProbeServerError::Start)?;
        let (shutdown, shutdown_rx) = oneshot::channel::<()>();

        let thread = std::thread::Builder::new()
            .name("probe-server".to_string())
            .spawn(move || {
                runtime.block_on(async move {
                    let listener = tokio::net::TcpListener::from_std(listener)?;
                    axum::serve(listener, probe_router())
                        .with_graceful_shutdown(async {
                            let _ = shutdown_rx.await;
                        })
                        .await
                })
            })
            .map_err(ProbeServerError::Start)?;

        debug!(%addr, "Probe server started");
        Ok(Self {
            addr,
            shutdown: Some(shutdown),
            thread: Some(thread),
        })
    }

    /// Address actually bound
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Shut down and join the server thread
    pub fn stop(mut self) -> Result<(), ProbeServerError> {
        self.shutdown_and_join()
    }

    fn shutdown_and_join(&mut self) -> Result<(), ProbeServerError> {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        let Some(thread) = self.thread.take() else {
            return Ok(());
        };
        debug!(addr = %self.addr, "Stopping probe server");
        match thread.join() {
            Ok(result) => result.map_err(ProbeServerError::Serve),
            Err(_) => Err(ProbeServerError::Panicked),
        }
    }
}

impl Drop for ProbeServer {
    fn drop(&mut self) {
        let _ = self.shutdown_and_join();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::{Ipv4Addr, TcpStream};

    fn get_root(addr: SocketAddr) -> String {
        let mut stream = TcpStream::connect(addr).unwrap();
        stream
            .write_all(b"GET / HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
            .unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).unwrap();
        response
    }

    #[test]
    fn test_serves_pass() {
        let server = ProbeServer::start(IpAddr::V4(Ipv4Addr::LOCALHOST), 0).unwrap();
        let response = get_root(server.local_addr());
        assert!(response.starts_with("HTTP/1.1 200"));
        assert!(response.ends_with(PROBE_BODY));
        server.stop().unwrap();
    }

    #[test]
    fn test_port_in_use_is_reported() {
        let first = ProbeServer::start(IpAddr::V4(Ipv4Addr::LOCALHOST), 0).unwrap();
        let port = first.local_addr().port();
        let second = ProbeServer::start(IpAddr::V4(Ipv4Addr::LOCALHOST), port);
        assert!(matches!(second, Err(ProbeServerError::AddrInUse(_))));
        first.stop().unwrap();
    }

    #[test]
    fn test_stop_releases_port() {
        let server = ProbeServer::start(IpAddr::V4(Ipv4Addr::LOCALHOST), 0).unwrap();
        let port = server.local_addr().port();
        drop(server);
        let again = ProbeServer::start(IpAddr::V4(Ipv4Addr::LOCALHOST), port).unwrap();
        again.stop().unwrap();
    }
}
