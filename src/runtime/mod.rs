//! Readiness-driven runtime.
//!
//! One thread, one poller, many connections:
//! - `Buffer`: per-connection byte staging
//! - `Connection`: per-socket read/write state machine
//! - `Poller`: edge-triggered readiness with tagged registrations
//! - `ConnectionRegistry`: owning arena of live connections
//! - `EventLoop`: accepts, dispatches events, tears connections down

mod buffer;
mod connection;
mod event_loop;
mod poller;
mod registry;

pub(crate) use buffer::Buffer;
pub(crate) use connection::Connection;
pub(crate) use event_loop::EventLoop;

use crate::config::Config;
use crate::protocols::echo::Echo;

/// Bind the configured address and serve echo frames until the loop stops.
pub fn run(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    let mut event_loop = EventLoop::bind(&config, Echo)?;
    event_loop.run()?;
    Ok(())
}
