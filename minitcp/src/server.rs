//! Server role: accept one connection at a time and report each stream.
//!
//! The handshake and the receive loop run sequentially on the calling
//! task.  The listening socket outlives each connection, so datagrams left
//! over from a finished stream are simply ignored by the next `Listen`.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;

use crate::connection::{ConnError, Connection, HandshakeConfig};
use crate::receiver::{receive_stream, Delivery};
use crate::sender::{data_per_segment, DEFAULT_MSS};
use crate::socket::Socket;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind: SocketAddr,
    /// Largest datagram accepted, header included.  Longer datagrams are
    /// discarded unread, so the peer's MSS must not exceed this.
    pub mss: usize,
    pub handshake: HandshakeConfig,
}

impl ServerConfig {
    /// Listen on every IPv4 interface at `port`.
    pub fn new(port: u16) -> Self {
        Self {
            bind: (Ipv4Addr::UNSPECIFIED, port).into(),
            mss: DEFAULT_MSS,
            handshake: HandshakeConfig::default(),
        }
    }

    pub fn validate(&self) -> Result<(), ConnError> {
        data_per_segment(self.mss)?;
        self.handshake.validate()
    }
}

/// A bound server socket.
#[derive(Debug)]
pub struct Server {
    socket: Arc<Socket>,
    config: ServerConfig,
}

impl Server {
    pub async fn bind(config: ServerConfig) -> Result<Self, ConnError> {
        config.validate()?;
        let socket = Socket::bind_with_mss(config.bind, config.mss).await?;
        log::info!("[server] bound to {} (mss {})", socket.local_addr, socket.mss());
        Ok(Self {
            socket: Arc::new(socket),
            config,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.socket.local_addr
    }

    /// Accept one connection and receive its stream.
    pub async fn serve_one(&self) -> Result<Delivery, ConnError> {
        let mut conn = Connection::accept(Arc::clone(&self.socket), &self.config.handshake).await?;
        receive_stream(&mut conn).await
    }

    /// Serve connections forever, handing each completed stream to
    /// `on_delivery`.  A reset connection is logged and skipped; only
    /// socket-level failures end the loop.
    pub async fn run<F>(&self, mut on_delivery: F) -> Result<(), ConnError>
    where
        F: FnMut(&Delivery),
    {
        loop {
            match self.serve_one().await {
                Ok(delivery) => on_delivery(&delivery),
                Err(ConnError::Reset) => log::warn!("[server] stream aborted by peer; listening again"),
                Err(e) => return Err(e),
            }
        }
    }
}

/// Bind per `config` and serve forever.
pub async fn run<F>(config: ServerConfig, on_delivery: F) -> Result<(), ConnError>
where
    F: FnMut(&Delivery),
{
    Server::bind(config).await?.run(on_delivery).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_listens_on_all_interfaces() {
        let c = ServerConfig::new(4000);
        assert_eq!(c.bind, "0.0.0.0:4000".parse::<SocketAddr>().unwrap());
        assert_eq!(c.mss, DEFAULT_MSS);
    }

    #[tokio::test]
    async fn bind_rejects_bad_mss() {
        let c = ServerConfig {
            mss: 10,
            ..ServerConfig::new(0)
        };
        assert!(matches!(Server::bind(c).await, Err(ConnError::InvalidConfig(_))));
    }

    #[tokio::test]
    async fn bind_reports_the_resolved_port() {
        let c = ServerConfig {
            bind: "127.0.0.1:0".parse().unwrap(),
            ..ServerConfig::new(0)
        };
        let server = Server::bind(c).await.unwrap();
        assert_ne!(server.local_addr().port(), 0);
    }

    #[tokio::test]
    async fn socket_is_sized_from_the_configured_mss() {
        let c = ServerConfig {
            bind: "127.0.0.1:0".parse().unwrap(),
            mss: 128,
            ..ServerConfig::new(0)
        };
        let server = Server::bind(c).await.unwrap();
        assert_eq!(server.socket.mss(), 128);
    }
}
