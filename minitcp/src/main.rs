//! Entry point for `minitcp`.
//!
//! Parses CLI arguments and dispatches into server, client, or relay mode.
//! All protocol work lives in the library; `main.rs` owns only process
//! setup (logging, argument parsing, output).

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use minitcp::client::{self, ClientConfig};
use minitcp::connection::HandshakeConfig;
use minitcp::sender::DEFAULT_MSS;
use minitcp::server::{self, ServerConfig};
use minitcp::simulator::{Simulator, SimulatorConfig};

/// A simplified, TCP-shaped reliable byte stream over UDP.
#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    /// Log every packet (debug level).  `RUST_LOG` overrides.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    mode: Mode,
}

#[derive(Subcommand)]
enum Mode {
    /// Receive streams and print the MD5 of each.
    Server {
        /// UDP port to listen on.
        #[arg(short, long)]
        port: u16,
        /// Largest datagram accepted in bytes, header included.  Longer
        /// datagrams are discarded.
        #[arg(long, default_value_t = DEFAULT_MSS)]
        mss: usize,
        /// Handshake retransmission timeout in milliseconds.
        #[arg(long, default_value_t = 1000)]
        timeout: u64,
    },
    /// Send a file to a server and print its MD5.
    Client {
        /// File to send.
        #[arg(short, long)]
        file: PathBuf,
        /// Server host name or address.
        #[arg(long)]
        host: String,
        /// Server UDP port.
        #[arg(short, long)]
        port: u16,
        /// Maximum segment size in bytes, header included.
        #[arg(long, default_value_t = DEFAULT_MSS)]
        mss: usize,
        /// Retransmission timeout in milliseconds.
        #[arg(long, default_value_t = 1000)]
        timeout: u64,
    },
    /// Relay datagrams between two endpoints, dropping and delaying them.
    Disrupt {
        /// Address mailbox A listens on.
        a_in: SocketAddr,
        /// Where A forwards to.
        a_out: SocketAddr,
        /// Address mailbox B listens on.
        b_in: SocketAddr,
        /// Where B forwards to.
        b_out: SocketAddr,
        /// Maximum per-datagram delay in milliseconds.
        #[arg(long, default_value_t = 0)]
        delay: u64,
        /// Fraction of datagrams to drop, 0.0 to 1.0.
        #[arg(long, default_value_t = 0.0)]
        drop: f64,
        /// RNG seed for a reproducible run.
        #[arg(long)]
        seed: Option<u64>,
    },
}

fn handshake(timeout_ms: u64) -> HandshakeConfig {
    HandshakeConfig {
        timeout: Duration::from_millis(timeout_ms),
        ..HandshakeConfig::default()
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level)).init();

    match cli.mode {
        Mode::Server { port, mss, timeout } => {
            let config = ServerConfig {
                mss,
                handshake: handshake(timeout),
                ..ServerConfig::new(port)
            };
            server::run(config, |delivery| {
                println!("MD5: {}", delivery.digest);
            })
            .await
            .context("server failed")?;
        }
        Mode::Client {
            file,
            host,
            port,
            mss,
            timeout,
        } => {
            let server = tokio::net::lookup_host((host.as_str(), port))
                .await
                .with_context(|| format!("resolving {host}:{port}"))?
                .next()
                .with_context(|| format!("no address found for {host}"))?;
            let config = ClientConfig {
                mss,
                handshake: handshake(timeout),
                ..ClientConfig::new(server)
            };
            let report = client::send_file(&file, &config)
                .await
                .with_context(|| format!("sending {}", file.display()))?;
            println!("MD5: {}", report.digest);
            if !report.fully_acknowledged {
                log::warn!("server did not confirm the whole file");
            }
        }
        Mode::Disrupt {
            a_in,
            a_out,
            b_in,
            b_out,
            delay,
            drop,
            seed,
        } => {
            let config = SimulatorConfig {
                drop_rate: drop,
                max_delay: Duration::from_millis(delay),
                seed,
            };
            let relay = Simulator::with_config(a_in, a_out, b_in, b_out, &config)
                .await
                .context("starting relay")?;
            relay.join().await;
        }
    }

    Ok(())
}
