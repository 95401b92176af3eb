//! TCP lock server.
//!
//! Each accepted connection is served on its own task and gets a unique
//! client id. Connections must [authenticate](crate::proto::Op::Authenticate)
//! when a [token](Cfg::token) is configured; operations of unauthenticated
//! connections are ignored and such connections are closed after the
//! [authentication timeout](Cfg::auth_timeout).
//!
//! When a connection ends, all its pending lock requests are aborted and all
//! resources it holds are released.

use std::{fmt, io, net::SocketAddr, sync::Arc};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};

use crate::{broker::Broker, Cfg};

mod session;

/// Lock server accepting TCP connections.
pub struct Server {
    listener: TcpListener,
    broker: Broker,
    cfg: Arc<Cfg>,
}

impl fmt::Debug for Server {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Server").field("local_addr", &self.listener.local_addr().ok()).finish()
    }
}

impl Server {
    /// Binds a lock server with a newly spawned [Broker] to the specified address.
    ///
    /// # Panics
    /// Panics if the configuration is invalid or when not called from within a Tokio runtime.
    pub async fn bind(addr: impl ToSocketAddrs, cfg: Cfg) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let broker = Broker::new(&cfg);
        Ok(Self::new(listener, broker, cfg))
    }

    /// Creates a lock server accepting connections from `listener` and
    /// serving them using `broker`.
    ///
    /// # Panics
    /// Panics if the configuration is invalid.
    pub fn new(listener: TcpListener, broker: Broker, cfg: Cfg) -> Self {
        cfg.check();
        Self { listener, broker, cfg: Arc::new(cfg) }
    }

    /// Address the server is listening on.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// The broker serving the connections.
    pub fn broker(&self) -> &Broker {
        &self.broker
    }

    /// Accepts and serves connections.
    ///
    /// Returns only if accepting a connection fails.
    pub async fn run(self) -> io::Result<()> {
        log::info!("lock server listening on {}", self.listener.local_addr()?);

        loop {
            let (socket, addr) = self.listener.accept().await?;
            self.spawn_session(socket, addr);
        }
    }

    fn spawn_session(&self, socket: TcpStream, addr: SocketAddr) {
        if let Err(err) = socket.set_nodelay(true) {
            log::warn!("cannot set TCP_NODELAY for connection from {}: {}", addr, err);
        }

        let (socket_rx, socket_tx) = socket.into_split();
        let broker = self.broker.clone();
        let cfg = self.cfg.clone();
        tokio::spawn(session::serve(broker, cfg, socket_rx, socket_tx, addr.to_string()));
    }
}
