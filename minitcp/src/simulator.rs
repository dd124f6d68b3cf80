//! Network impairment relay.
//!
//! Two UDP mailboxes stand between the endpoints:
//!
//! ```text
//!   client ──▶ A ═══(via B's socket)══▶ a_out (server)
//!   client ◀══(via A's socket)═══ B ◀── server replies
//! ```
//!
//! Mailbox A forwards everything it receives to `a_out`, sending from B's
//! socket, so the server's replies land in B.  B forwards to `b_out` from
//! A's socket, so the client sees replies coming from the address it sent
//! to.  Each datagram passes through a [`FaultModel`] that either drops it
//! or forwards it after a delay.  Delayed datagrams are sent independently,
//! so a short delay can overtake a long one.  A model may also rewrite a
//! forwarded datagram through [`FaultModel::tamper`]; [`RandomFaults`]
//! never does.
//!
//! [`RandomFaults`] is the model used by the `disrupt` subcommand: uniform
//! drops with probability `drop_rate` and a uniform delay in
//! `[0, max_delay]`.  Seeding it makes a run reproducible.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use rand::{rngs::StdRng, Rng, SeedableRng};
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;

use crate::socket::MAX_DATAGRAM;

/// Which mailbox a datagram arrived at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Arrived at A, heading to `a_out`.
    AtoB,
    /// Arrived at B, heading to `b_out`.
    BtoA,
}

/// Fate of one datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Drop,
    Forward(Duration),
}

/// Decides what happens to each relayed datagram.
///
/// Each direction owns its own model.  `n` counts datagrams seen in that
/// direction, starting at 0.
pub trait FaultModel: Send + 'static {
    fn decide(&mut self, n: u64, datagram: &[u8]) -> Verdict;

    /// Rewrite datagram `n` before it is forwarded.  Only called for
    /// datagrams `decide` did not drop.
    fn tamper(&mut self, _n: u64, _datagram: &mut [u8]) {}
}

#[derive(Debug, Error)]
pub enum SimulatorError {
    #[error("invalid simulator configuration: {0}")]
    InvalidConfig(String),
    #[error("simulator I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Parameters of [`RandomFaults`].
#[derive(Debug, Clone, Default)]
pub struct SimulatorConfig {
    /// Fraction of datagrams dropped, in `[0, 1]`.
    pub drop_rate: f64,
    /// Upper bound of the uniform per-datagram delay.
    pub max_delay: Duration,
    /// RNG seed; random when `None`.
    pub seed: Option<u64>,
}

impl SimulatorConfig {
    pub fn validate(&self) -> Result<(), SimulatorError> {
        if !(0.0..=1.0).contains(&self.drop_rate) {
            return Err(SimulatorError::InvalidConfig(format!(
                "drop rate must be within [0, 1], got {}",
                self.drop_rate
            )));
        }
        Ok(())
    }
}

/// Uniform random drops and delays.
#[derive(Debug)]
pub struct RandomFaults {
    drop_rate: f64,
    max_delay: Duration,
    rng: StdRng,
}

impl RandomFaults {
    /// `stream` separates the two directions when they share one seed.
    pub fn new(config: &SimulatorConfig, stream: u64) -> Result<Self, SimulatorError> {
        config.validate()?;
        let seed = config.seed.unwrap_or_else(rand::random).wrapping_add(stream);
        Ok(Self {
            drop_rate: config.drop_rate,
            max_delay: config.max_delay,
            rng: StdRng::seed_from_u64(seed),
        })
    }
}

impl FaultModel for RandomFaults {
    fn decide(&mut self, _n: u64, _datagram: &[u8]) -> Verdict {
        if self.rng.random_bool(self.drop_rate) {
            return Verdict::Drop;
        }
        let max = self.max_delay.as_micros() as u64;
        if max == 0 {
            return Verdict::Forward(Duration::ZERO);
        }
        Verdict::Forward(Duration::from_micros(self.rng.random_range(0..=max)))
    }
}

/// A running relay.  Dropping it stops forwarding.
#[derive(Debug)]
pub struct Simulator {
    a_addr: SocketAddr,
    b_addr: SocketAddr,
    tasks: Vec<JoinHandle<()>>,
}

impl Simulator {
    /// Bind both mailboxes and start forwarding with the given models.
    pub async fn start<F, G>(
        a_bind: SocketAddr,
        a_out: SocketAddr,
        b_bind: SocketAddr,
        b_out: SocketAddr,
        a_model: F,
        b_model: G,
    ) -> Result<Self, SimulatorError>
    where
        F: FaultModel,
        G: FaultModel,
    {
        let a = Arc::new(UdpSocket::bind(a_bind).await?);
        let b = Arc::new(UdpSocket::bind(b_bind).await?);
        let a_addr = a.local_addr()?;
        let b_addr = b.local_addr()?;
        log::info!("[disrupt] A {a_addr} → {a_out}, B {b_addr} → {b_out}");

        let tasks = vec![
            tokio::spawn(relay(
                Direction::AtoB,
                Arc::clone(&a),
                Arc::clone(&b),
                a_out,
                a_model,
            )),
            tokio::spawn(relay(Direction::BtoA, b, a, b_out, b_model)),
        ];
        Ok(Self {
            a_addr,
            b_addr,
            tasks,
        })
    }

    /// Start with [`RandomFaults`] in both directions.
    pub async fn with_config(
        a_bind: SocketAddr,
        a_out: SocketAddr,
        b_bind: SocketAddr,
        b_out: SocketAddr,
        config: &SimulatorConfig,
    ) -> Result<Self, SimulatorError> {
        let a_model = RandomFaults::new(config, 0)?;
        let b_model = RandomFaults::new(config, 1)?;
        Self::start(a_bind, a_out, b_bind, b_out, a_model, b_model).await
    }

    pub fn a_addr(&self) -> SocketAddr {
        self.a_addr
    }

    pub fn b_addr(&self) -> SocketAddr {
        self.b_addr
    }

    /// Run until both relay tasks end, which only happens on abort.
    pub async fn join(mut self) {
        for task in std::mem::take(&mut self.tasks) {
            if let Err(e) = task.await {
                log::warn!("[disrupt] relay task ended: {e}");
            }
        }
    }
}

impl Drop for Simulator {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

async fn relay<M: FaultModel>(
    dir: Direction,
    inbox: Arc<UdpSocket>,
    outbox: Arc<UdpSocket>,
    dest: SocketAddr,
    mut model: M,
) {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    let mut n: u64 = 0;
    loop {
        let len = match inbox.recv_from(&mut buf).await {
            Ok((len, _)) => len,
            Err(e) => {
                log::debug!("[disrupt] {dir:?} receive failed: {e}");
                continue;
            }
        };
        let mut datagram = buf[..len].to_vec();
        let verdict = model.decide(n, &datagram);
        if verdict != Verdict::Drop {
            model.tamper(n, &mut datagram);
        }
        n += 1;

        match verdict {
            Verdict::Drop => log::debug!("[disrupt] {dir:?} dropped datagram #{} ({len} bytes)", n - 1),
            Verdict::Forward(delay) if delay.is_zero() => send(&outbox, &datagram, dest).await,
            Verdict::Forward(delay) => {
                let outbox = Arc::clone(&outbox);
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    send(&outbox, &datagram, dest).await;
                });
            }
        }
    }
}

async fn send(socket: &UdpSocket, datagram: &[u8], dest: SocketAddr) {
    if let Err(e) = socket.send_to(datagram, dest).await {
        log::warn!("[disrupt] forward to {dest} failed: {e}");
    }
}
