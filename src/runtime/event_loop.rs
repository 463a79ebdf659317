//! mio event loop implementation.
//!
//! Readiness-based model: poll tells us when sockets are ready,
//! then we perform non-blocking read/write syscalls.
//! Uses epoll on Linux, kqueue on macOS.
//!
//! One thread owns everything: the listener, the poller and the registry
//! of connections. Each iteration waits for a batch of events, then for
//! every event in reported order:
//!
//! - listener: accept until `WouldBlock`, register each peer for reads
//! - client: run the read handler, then the write handler, then either
//!   tear the connection down or push its new interest to the poller
//!
//! Interest changes are the only re-arming edge-triggered mode needs,
//! because both handlers drain the socket before returning.
//!
//! A batch can hold several events for one connection (kqueue reports the
//! read and write filters separately). A connection closed mid-batch is
//! deregistered right away but keeps its registry slot and descriptor until
//! the batch is done, so a peer accepted later in the same batch can never
//! inherit the id that those leftover events carry.

use crate::config::Config;
use crate::protocols::echo::{FrameCodec, Service};
use crate::runtime::connection::{CloseReason, Connection};
use crate::runtime::poller::{Interest, Poller, Readiness, Tag};
use crate::runtime::registry::{ConnId, ConnectionRegistry};
use mio::net::{TcpListener, TcpStream};
use mio::Waker;
use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::os::unix::io::AsRawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, trace, warn};

/// Shortest interval between idle sweeps.
const MIN_SWEEP_INTERVAL: Duration = Duration::from_millis(10);

/// Startup failures. Fatal to the process.
#[derive(Debug)]
pub enum SetupError {
    /// The listen address could not be resolved.
    Resolve { addr: String, source: io::Error },
    /// The listen address resolved to nothing.
    NoAddress(String),
    /// No resolved address could be bound; holds the last failure.
    Bind { addr: SocketAddr, source: io::Error },
    /// The readiness poller could not be set up.
    Poller(io::Error),
}

impl std::fmt::Display for SetupError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SetupError::Resolve { addr, source } => {
                write!(f, "Failed to resolve listen address '{addr}': {source}")
            }
            SetupError::NoAddress(addr) => {
                write!(f, "Listen address '{addr}' resolved to no addresses")
            }
            SetupError::Bind { addr, source } => {
                write!(f, "Failed to bind {addr}: {source}")
            }
            SetupError::Poller(e) => write!(f, "Failed to set up poller: {e}"),
        }
    }
}

impl std::error::Error for SetupError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SetupError::Resolve { source, .. } | SetupError::Bind { source, .. } => Some(source),
            SetupError::Poller(e) => Some(e),
            SetupError::NoAddress(_) => None,
        }
    }
}

/// Stops a running event loop from another thread.
#[derive(Clone)]
pub struct ShutdownHandle {
    flag: Arc<AtomicBool>,
    waker: Arc<Waker>,
}

#[cfg_attr(not(test), allow(dead_code))]
impl ShutdownHandle {
    /// Ask the loop to stop after its current batch.
    pub fn shutdown(&self) {
        self.flag.store(true, Ordering::Release);
        if let Err(e) = self.waker.wake() {
            warn!(error = %e, "Failed to wake event loop");
        }
    }

    fn is_set(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }
}

/// Single-threaded server loop, generic over the request service.
pub struct EventLoop<H> {
    poller: Poller,
    listener: TcpListener,
    local_addr: SocketAddr,
    connections: ConnectionRegistry<TcpStream>,
    codec: FrameCodec,
    service: H,
    read_chunk: usize,
    idle_timeout: Option<Duration>,
    sweep_interval: Option<Duration>,
    last_sweep: Instant,
    /// Closed during the current batch, released once it is done.
    closed: Vec<ConnId>,
    nodelay: bool,
    shutdown: ShutdownHandle,
}

impl<H: Service> EventLoop<H> {
    /// Bind the listener and set up the poller.
    pub fn bind(config: &Config, service: H) -> Result<Self, SetupError> {
        let mut poller = Poller::new(config.event_capacity).map_err(SetupError::Poller)?;

        let (listener, local_addr) = bind_listener(&config.listen, config.backlog)?;
        let mut listener = TcpListener::from_std(listener);
        poller
            .register(&mut listener, Interest::READABLE, Tag::Listener)
            .map_err(SetupError::Poller)?;

        let waker = poller.waker().map_err(SetupError::Poller)?;

        info!(
            addr = %local_addr,
            backlog = config.backlog,
            "Listening"
        );

        let idle_timeout = config.idle_timeout();

        Ok(Self {
            poller,
            listener,
            local_addr,
            connections: ConnectionRegistry::new(config.connection_limit()),
            codec: FrameCodec::new(config.max_message_size),
            service,
            read_chunk: config.read_buffer_size,
            idle_timeout,
            sweep_interval: idle_timeout.map(|limit| (limit / 4).max(MIN_SWEEP_INTERVAL)),
            last_sweep: Instant::now(),
            closed: Vec::new(),
            nodelay: config.nodelay,
            shutdown: ShutdownHandle {
                flag: Arc::new(AtomicBool::new(false)),
                waker,
            },
        })
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    #[cfg_attr(not(test), allow(dead_code))]
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    /// Run until shut down. Returns an error only if waiting on the
    /// poller itself fails.
    pub fn run(&mut self) -> io::Result<()> {
        info!(
            max_message_size = self.codec.max_message_size(),
            idle_timeout = ?self.idle_timeout,
            "Event loop started"
        );

        let mut ready = Vec::new();

        while !self.shutdown.is_set() {
            self.poller.wait(self.sweep_interval, &mut ready)?;
            self.dispatch(&ready);
            self.evict_idle(Instant::now());
            self.release_closed();
        }

        self.close_all();
        info!("Event loop stopped");
        Ok(())
    }

    fn dispatch(&mut self, ready: &[(Tag, Readiness)]) {
        for &(tag, readiness) in ready {
            match tag {
                Tag::Listener => self.accept_connections(),
                Tag::Client(id) => self.handle_client(id, readiness),
                Tag::Waker => trace!("Woken"),
            }
        }
    }

    fn accept_connections(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => self.admit(stream, peer),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::Interrupted | io::ErrorKind::ConnectionAborted
                    ) =>
                {
                    continue
                }
                Err(e) => {
                    error!(error = %e, "Accept error");
                    break;
                }
            }
        }
    }

    fn admit(&mut self, stream: TcpStream, peer: SocketAddr) {
        if self.connections.is_full() {
            warn!(
                peer = %peer,
                active = self.connections.len(),
                "Connection limit reached, rejecting"
            );
            return;
        }

        if self.nodelay {
            if let Err(e) = stream.set_nodelay(true) {
                debug!(peer = %peer, error = %e, "Failed to set TCP_NODELAY");
            }
        }

        let fd = stream.as_raw_fd();
        debug_assert!(self.connections.id_of(fd).is_none(), "descriptor {fd} still registered");

        let Ok(id) = self.connections.insert(Connection::new(fd, stream)) else {
            return;
        };
        let Some(conn) = self.connections.get_mut(id) else {
            return;
        };

        if let Err(e) = self
            .poller
            .register(conn.stream_mut(), Interest::READABLE, Tag::Client(id))
        {
            warn!(peer = %peer, error = %e, "Failed to register connection");
            self.connections.remove(id);
            return;
        }

        debug!(conn_id = id, fd, peer = %peer, "Accepted connection");
    }

    fn handle_client(&mut self, id: ConnId, readiness: Readiness) {
        let Some(conn) = self.connections.get_mut(id) else {
            return;
        };
        // Leftover event for a connection closed earlier in this batch.
        if conn.wants_close() {
            return;
        }

        if readiness.readable {
            conn.on_readable(&self.codec, &mut self.service, self.read_chunk);
        }

        if readiness.writable {
            conn.on_writable();
        }

        conn.on_poll_error(readiness);

        trace!(conn_id = id, phase = ?conn.phase(), "Handled event");

        if conn.wants_close() {
            self.close_connection(id);
            return;
        }

        if let Some(interest) = conn.take_interest_change() {
            if let Err(e) = self.poller.modify(conn.stream_mut(), interest) {
                conn.close(CloseReason::Io(e));
                self.close_connection(id);
            }
        }
    }

    /// Deregister a connection and queue it for release at the end of the
    /// batch. The socket stays open until then.
    fn close_connection(&mut self, id: ConnId) {
        if self.closed.contains(&id) {
            return;
        }
        let Some(conn) = self.connections.get_mut(id) else {
            return;
        };
        self.closed.push(id);

        if let Err(e) = self.poller.deregister(conn.stream_mut()) {
            debug!(conn_id = id, error = %e, "Deregister failed");
        }

        let unsent = conn.pending_output();
        match conn.take_close_reason() {
            Some(CloseReason::UnexpectedEof { pending }) => {
                warn!(conn_id = id, pending, "Peer closed mid-message");
            }
            Some(reason) if reason.is_clean() => {
                debug!(conn_id = id, "Connection closed by peer");
            }
            Some(reason) => {
                warn!(conn_id = id, unsent, reason = %reason, "Closing connection");
            }
            None => debug!(conn_id = id, "Connection closed"),
        }
    }

    /// Drop connections closed during the batch, closing their sockets.
    fn release_closed(&mut self) {
        for id in self.closed.drain(..) {
            self.connections.remove(id);
        }
    }

    /// Close connections idle longer than the timeout, at most once per
    /// sweep interval.
    fn evict_idle(&mut self, now: Instant) {
        let (Some(limit), Some(interval)) = (self.idle_timeout, self.sweep_interval) else {
            return;
        };
        if now.saturating_duration_since(self.last_sweep) < interval {
            return;
        }
        self.last_sweep = now;

        for id in self.connections.ids() {
            let Some(conn) = self.connections.get_mut(id) else {
                continue;
            };
            if !conn.wants_close() && conn.idle_for(now) >= limit {
                conn.close(CloseReason::IdleTimeout);
                self.close_connection(id);
            }
        }
    }

    fn close_all(&mut self) {
        self.release_closed();
        let count = self.connections.len();
        for mut conn in self.connections.drain() {
            let _ = self.poller.deregister(conn.stream_mut());
        }
        if count > 0 {
            debug!(count, "Closed remaining connections");
        }
    }
}

/// Resolve `listen` and bind the first address that works.
fn bind_listener(
    listen: &str,
    backlog: i32,
) -> Result<(std::net::TcpListener, SocketAddr), SetupError> {
    let addrs = listen
        .to_socket_addrs()
        .map_err(|source| SetupError::Resolve {
            addr: listen.to_string(),
            source,
        })?;

    let mut last_error = None;
    for addr in addrs {
        match create_listener(addr, backlog) {
            Ok(listener) => {
                let local_addr = listener.local_addr().map_err(|source| SetupError::Bind {
                    addr,
                    source,
                })?;
                return Ok((listener, local_addr));
            }
            Err(e) => {
                warn!(addr = %addr, error = %e, "Bind failed");
                last_error = Some((addr, e));
            }
        }
    }

    match last_error {
        Some((addr, source)) => Err(SetupError::Bind { addr, source }),
        None => Err(SetupError::NoAddress(listen.to_string())),
    }
}

/// Create a non-blocking TCP listener with SO_REUSEADDR.
fn create_listener(addr: SocketAddr, backlog: i32) -> io::Result<std::net::TcpListener> {
    let socket = socket2::Socket::new(
        socket2::Domain::for_address(addr),
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    if addr.is_ipv6() {
        // Accept IPv4-mapped peers too.
        socket.set_only_v6(false)?;
    }
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog)?;

    Ok(socket.into())
}
