//! echo-loop: a single-threaded, readiness-driven TCP server
//!
//! Clients send length-prefixed frames (4-byte little-endian length,
//! then the payload) and get each payload echoed back in a frame of the
//! same shape.
//!
//! Features:
//! - Many concurrent connections multiplexed over one edge-triggered poller
//! - Request pipelining: every complete frame in a read is answered, in order
//! - Bounded message size; oversized frames drop the connection
//! - Optional connection limit and idle timeout
//! - Configuration via CLI arguments or TOML file

mod config;
mod protocols;
mod runtime;

use config::Config;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        listen = %config.listen,
        max_message_size = config.max_message_size,
        max_connections = config.max_connections,
        idle_timeout = config.idle_timeout,
        "Starting echo-loop server"
    );

    if let Err(e) = runtime::run(config) {
        error!(error = %e, "Server failed");
        return Err(e);
    }
    Ok(())
}
