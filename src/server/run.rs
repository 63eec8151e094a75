//! Server bind/accept loops.

use std::net::{SocketAddr, TcpListener};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crate::Result;
use crate::config::{Config, Limits};
use crate::server::action::EndpointFactory;
use crate::server::connection::handle_connection;
use crate::server::mux::Mux;

/// State shared by every connection thread.
pub(crate) struct ServerShared {
    pub factory: EndpointFactory,
    pub mux: Mux,
    pub limits: Limits,
}

/// A bound, not-yet-running server.
pub struct Server {
    listener: TcpListener,
    shared: Arc<ServerShared>,
    shutdown: Arc<AtomicBool>,
}

/// Handle for stopping a running server from another thread.
#[derive(Clone)]
pub struct ServerHandle {
    shutdown: Arc<AtomicBool>,
    addr: SocketAddr,
}

impl ServerHandle {
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }
}

impl Server {
    /// Bind the listen address from `config`. Port 0 picks an ephemeral
    /// port; see [`Server::local_addr`].
    pub fn bind(config: &Config, factory: EndpointFactory) -> Result<Self> {
        let listener = TcpListener::bind(&config.listen_addr)?;
        tracing::info!(addr = %config.listen_addr, "server listening");
        Ok(Self {
            listener,
            shared: Arc::new(ServerShared {
                factory,
                mux: Mux::new(config.limits.clone()),
                limits: config.limits.clone(),
            }),
            shutdown: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn handle(&self) -> Result<ServerHandle> {
        Ok(ServerHandle {
            shutdown: Arc::clone(&self.shutdown),
            addr: self.local_addr()?,
        })
    }

    /// Accept connections until the shutdown flag is set.
    ///
    /// Each connection gets its own handler thread; in-flight
    /// connections finish on their own when their peers hang up.
    pub fn run(self) -> Result<()> {
        self.listener.set_nonblocking(true)?;

        loop {
            if self.shutdown.load(Ordering::Relaxed) {
                tracing::info!("shutdown requested");
                break;
            }

            match self.listener.accept() {
                Ok((stream, _)) => {
                    let shared = Arc::clone(&self.shared);
                    std::thread::spawn(move || {
                        let _ = stream.set_nonblocking(false);
                        handle_connection(stream, shared);
                    });
                }
                Err(ref err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                    std::thread::sleep(Duration::from_millis(100));
                }
                Err(err) => {
                    tracing::error!(error = %err, "accept error");
                }
            }
        }

        tracing::info!("server stopped");
        Ok(())
    }
}

/// Run a server until SIGTERM/SIGINT.
pub fn run(config: Config, factory: EndpointFactory) -> Result<()> {
    let server = Server::bind(&config, factory)?;

    let shutdown = Arc::clone(&server.shutdown);
    let _ = signal_hook::flag::register(signal_hook::consts::SIGTERM, Arc::clone(&shutdown));
    let _ = signal_hook::flag::register(signal_hook::consts::SIGINT, shutdown);

    server.run()
}
