//! Minimal echo server.
//!
//! Accepts TCP connections into a single poll group and writes every received
//! byte back through queued asynchronous writes.

use bytes::Bytes;
use clap::Parser;
use serde::Deserialize;
use sockq::{AbortReason, Config, LoggingConfig, SockDriver, SockId, WriteRequest};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Parser)]
#[command(name = "sockq-echo")]
#[command(about = "Echo server over non-blocking sockets and poll groups")]
struct Args {
    /// Config file path (optional, CLI args override config)
    config: Option<String>,

    /// Listen address (IPv4)
    #[arg(short, long)]
    listen: Option<String>,

    /// Listen port
    #[arg(short, long)]
    port: Option<u16>,

    /// Maximum ready sockets handled per poll cycle
    #[arg(long)]
    max_events: Option<usize>,
}

/// Server configuration loaded from TOML file.
#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct EchoConfig {
    #[serde(default)]
    server: ServerConfig,
    #[serde(default)]
    sock: Config,
    #[serde(default)]
    logging: LoggingConfig,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ServerConfig {
    #[serde(default = "default_listen")]
    listen: String,
    #[serde(default = "default_port")]
    port: u16,
    #[serde(default = "default_max_events")]
    max_events: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            port: default_port(),
            max_events: default_max_events(),
        }
    }
}

fn default_listen() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    4420
}

fn default_max_events() -> usize {
    32
}

impl EchoConfig {
    fn load(path: &Path) -> Result<Self, Box<dyn std::error::Error>> {
        let contents = std::fs::read_to_string(path)?;
        let config: EchoConfig = toml::from_str(&contents)?;
        config.sock.validate()?;
        Ok(config)
    }
}

fn echo_request(data: &[u8]) -> WriteRequest {
    WriteRequest::from_bytes(Bytes::copy_from_slice(data)).on_complete(
        |driver, id, status| match status {
            Ok(()) => {}
            Err(AbortReason::Transport(kind)) => {
                debug!(sock = ?id, ?kind, "echo write failed, closing");
                // A sibling request may already have closed it.
                let _ = driver.close(id);
            }
            Err(reason) => debug!(sock = ?id, %reason, "echo write aborted"),
        },
    )
}

/// Read what is available on `id` and queue it back. Closes the socket on
/// end-of-stream or error.
fn service(driver: &mut SockDriver, id: SockId, buf: &mut [u8]) {
    match driver.recv(id, buf) {
        Ok(0) => {
            debug!(sock = ?id, "peer closed");
            let _ = driver.close(id);
        }
        Ok(n) => {
            if let Err(e) = driver.writev_async(id, echo_request(&buf[..n])) {
                warn!(sock = ?id, error = %e, "failed to queue echo");
            }
        }
        Err(e) if e.is_would_block() => {}
        Err(e) => {
            debug!(sock = ?id, error = %e, "recv failed, closing");
            let _ = driver.close(id);
        }
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Load config file if provided
    let config = if let Some(ref path) = args.config {
        EchoConfig::load(Path::new(path))?
    } else {
        EchoConfig::default()
    };

    sockq::logging::init(&config.logging);

    // CLI args override config file
    let ip = args.listen.unwrap_or(config.server.listen);
    let port = args.port.unwrap_or(config.server.port);
    let max_events = args.max_events.unwrap_or(config.server.max_events);

    let mut driver = SockDriver::mio(config.sock)?;
    let listener = driver.listen(&ip, port)?;
    let group = driver.create_group();

    info!(
        addr = %driver.local_addr(listener)?,
        max_events,
        batch_size = driver.config().batch_size,
        "echo server listening"
    );

    let mut buf = vec![0u8; 16 * 1024];

    loop {
        let mut accepted = 0;
        loop {
            match driver.accept(listener) {
                Ok(Some(id)) => {
                    driver.add_to_group(group, id)?;
                    accepted += 1;
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    break;
                }
            }
        }
        if accepted > 0 {
            debug!(accepted, total = driver.socket_count() - 1, "accepted connections");
        }

        let ready = driver.poll_group(group, max_events)?;
        for &id in &ready {
            service(&mut driver, id, &mut buf);
        }

        if ready.is_empty() && accepted == 0 {
            std::thread::sleep(Duration::from_millis(1));
        }
    }
}
