//! Client role: connect, stream a payload, report.
//!
//! After the handshake the client runs two tasks over one shared socket.
//! The current task drives the [`Sender`]; a spawned task runs
//! [`monitor_acks`] and publishes the cumulative ACK back over a `watch`
//! channel.  The monitor is stopped once the sender is done.

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use tokio::sync::{oneshot, watch};

use crate::connection::{ConnError, Connection, HandshakeConfig};
use crate::packet::{flags, Packet};
use crate::receiver::md5_hex;
use crate::sender::{
    data_per_segment, monitor_acks, AckProgress, SendReport, Sender, SenderConfig,
    DEFAULT_DATA_RETRIES, DEFAULT_MSS, DEFAULT_PACING,
};
use crate::socket::Socket;

/// Everything the client needs to know.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub server: SocketAddr,
    /// Total bytes per datagram, header included.
    pub mss: usize,
    pub handshake: HandshakeConfig,
    /// Delay between consecutive data segments.
    pub pacing: Duration,
    /// Data retransmission rounds; `0` never resends data.
    pub data_retries: u32,
}

impl ClientConfig {
    pub fn new(server: SocketAddr) -> Self {
        Self {
            server,
            mss: DEFAULT_MSS,
            handshake: HandshakeConfig::default(),
            pacing: DEFAULT_PACING,
            data_retries: DEFAULT_DATA_RETRIES,
        }
    }

    pub fn validate(&self) -> Result<(), ConnError> {
        data_per_segment(self.mss)?;
        self.handshake.validate()
    }

    fn sender_config(&self) -> SenderConfig {
        SenderConfig {
            mss: self.mss,
            pacing: self.pacing,
            retransmit_timeout: self.handshake.timeout,
            max_retries: self.data_retries,
        }
    }
}

/// Outcome of one client run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferReport {
    pub bytes: usize,
    pub segments: usize,
    /// MD5 of the bytes sent, lowercase hex.
    pub digest: String,
    pub retransmitted: usize,
    /// The server acknowledged the end of the stream.
    pub fully_acknowledged: bool,
    /// Handshakes repeated because the server reset before any data ACK.
    pub reconnects: u32,
}

/// Read `path` and send its contents.
pub async fn send_file(path: impl AsRef<Path>, config: &ClientConfig) -> Result<TransferReport, ConnError> {
    let path = path.as_ref();
    let data = tokio::fs::read(path).await?;
    log::info!("[client] read {} bytes from {}", data.len(), path.display());
    send_bytes(&data, config).await
}

/// Bind an ephemeral socket, connect, and send `data` as one stream.
pub async fn send_bytes(data: &[u8], config: &ClientConfig) -> Result<TransferReport, ConnError> {
    config.validate()?;
    let bind: SocketAddr = if config.server.is_ipv4() {
        (std::net::Ipv4Addr::UNSPECIFIED, 0).into()
    } else {
        (std::net::Ipv6Addr::UNSPECIFIED, 0).into()
    };
    let socket = Socket::bind_with_mss(bind, config.mss).await?;
    let conn = Connection::connect(socket, config.server, &config.handshake).await?;
    transfer(conn, data, config).await
}

/// Send `data` over an established connection and close it.
///
/// An RST that arrives before the peer has acknowledged any data means the
/// peer never left the handshake: it rejected our final ACK and went back to
/// listening.  The client then connects again on the same socket and resends
/// the stream, at most `handshake.max_attempts` times.  An RST after the
/// first data ACK is fatal.
pub async fn transfer(
    mut conn: Connection,
    data: &[u8],
    config: &ClientConfig,
) -> Result<TransferReport, ConnError> {
    let digest = md5_hex(data);
    let peer = conn.peer();
    let mut reconnects = 0u32;

    let report = loop {
        let sender = Sender::new(data, conn.local_seq(), config.sender_config())?;
        let (sent, progress) = stream_once(&conn, sender).await;
        conn.close()?;

        match sent {
            Err(ConnError::Reset)
                if progress.acks_seen == 0 && reconnects < config.handshake.max_attempts =>
            {
                reconnects += 1;
                log::warn!(
                    "[client] {peer} reset before acknowledging any data; reconnecting ({reconnects}/{})",
                    config.handshake.max_attempts
                );
                conn = Connection::connect(conn.shared_socket(), peer, &config.handshake).await?;
            }
            sent => break sent?,
        }
    };

    if report.fully_acknowledged {
        log::info!("[client] {} bytes acknowledged by {peer}", report.bytes);
    } else {
        log::warn!("[client] {peer} did not acknowledge the whole stream");
    }
    Ok(TransferReport {
        bytes: report.bytes,
        segments: report.segments,
        digest,
        retransmitted: report.retransmitted,
        fully_acknowledged: report.fully_acknowledged,
        reconnects,
    })
}

/// Run `sender` against the ACK monitor once.  Also returns the last
/// progress the monitor published.
async fn stream_once(conn: &Connection, sender: Sender) -> (Result<SendReport, ConnError>, AckProgress) {
    let peer = conn.peer();
    let handshake_ack = Packet::control(conn.local_seq(), conn.rcv_nxt(), flags::ACK);
    let (progress_tx, progress_rx) = watch::channel(AckProgress::new(sender.start_seq()));
    let observer = progress_rx.clone();
    let (stop_tx, stop_rx) = oneshot::channel();
    let monitor = tokio::spawn(monitor_acks(
        conn.shared_socket(),
        peer,
        handshake_ack,
        sender.end_seq(),
        progress_tx,
        stop_rx,
    ));

    let sent = sender.run(conn.socket(), peer, progress_rx).await;
    // The monitor may already have exited on RST.
    let _ = stop_tx.send(());
    match monitor.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => log::warn!("[client] ACK monitor failed: {e}"),
        Err(e) => log::warn!("[client] ACK monitor task failed: {e}"),
    }
    let progress = *observer.borrow();
    (sent, progress)
}
