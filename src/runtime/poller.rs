//! Readiness multiplexer.
//!
//! Thin layer over `mio::Poll` (epoll on Linux, kqueue on macOS). Both
//! backends are edge-triggered: an event fires once per readiness
//! transition, so whoever handles it must drain the socket until
//! `WouldBlock`.
//!
//! Every registration carries a [`Tag`]. Tags live in a slab whose keys
//! are the mio tokens, so an event is resolved back to what was registered
//! by lookup, never by comparing against reserved token values.

use crate::runtime::registry::ConnId;
use mio::event::Source;
use mio::{Events, Poll, Token, Waker};
use slab::Slab;
use std::collections::HashMap;
use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::Arc;
use std::time::Duration;

/// What a registered descriptor is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tag {
    /// The listening socket.
    Listener,
    /// Cross-thread wakeup.
    Waker,
    /// An accepted client connection.
    Client(ConnId),
}

/// Readiness a registration asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interest {
    pub read: bool,
    pub write: bool,
}

impl Interest {
    pub const READABLE: Interest = Interest {
        read: true,
        write: false,
    };
    pub const WRITABLE: Interest = Interest {
        read: false,
        write: true,
    };

    /// mio cannot register an empty interest; that maps to readable.
    fn to_mio(self) -> mio::Interest {
        match (self.read, self.write) {
            (true, true) => mio::Interest::READABLE | mio::Interest::WRITABLE,
            (false, true) => mio::Interest::WRITABLE,
            _ => mio::Interest::READABLE,
        }
    }
}

/// Event bits reported for one descriptor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Readiness {
    pub readable: bool,
    pub writable: bool,
    pub error: bool,
    /// Both directions shut down.
    pub hangup: bool,
}

impl From<&mio::event::Event> for Readiness {
    fn from(event: &mio::event::Event) -> Self {
        Self {
            // A read-side close is delivered as readable so the reader sees EOF.
            readable: event.is_readable() || event.is_read_closed(),
            writable: event.is_writable(),
            error: event.is_error(),
            hangup: event.is_read_closed() && event.is_write_closed(),
        }
    }
}

/// Edge-triggered poller with tagged registrations.
pub struct Poller {
    poll: Poll,
    events: Events,
    tags: Slab<Tag>,
    tokens: HashMap<RawFd, Token>,
}

impl Poller {
    /// Create a poller that reports at most `capacity` events per wait.
    pub fn new(capacity: usize) -> io::Result<Self> {
        Ok(Self {
            poll: Poll::new()?,
            events: Events::with_capacity(capacity),
            tags: Slab::new(),
            tokens: HashMap::new(),
        })
    }

    /// Start watching `source` for `interest`; its events will carry `tag`.
    pub fn register<S>(&mut self, source: &mut S, interest: Interest, tag: Tag) -> io::Result<()>
    where
        S: Source + AsRawFd,
    {
        let fd = source.as_raw_fd();
        if self.tokens.contains_key(&fd) {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("descriptor {fd} already registered"),
            ));
        }

        let token = Token(self.tags.insert(tag));
        if let Err(e) = self
            .poll
            .registry()
            .register(source, token, interest.to_mio())
        {
            self.tags.remove(token.0);
            return Err(e);
        }
        self.tokens.insert(fd, token);
        Ok(())
    }

    /// Replace the interest of a registered source. Also re-arms the edge:
    /// if the descriptor is already ready, the next wait reports it.
    pub fn modify<S>(&mut self, source: &mut S, interest: Interest) -> io::Result<()>
    where
        S: Source + AsRawFd,
    {
        let token = self.token(source.as_raw_fd())?;
        self.poll
            .registry()
            .reregister(source, token, interest.to_mio())
    }

    /// Stop watching `source` and forget its tag.
    pub fn deregister<S>(&mut self, source: &mut S) -> io::Result<()>
    where
        S: Source + AsRawFd,
    {
        let fd = source.as_raw_fd();
        let token = self.token(fd)?;
        self.tokens.remove(&fd);
        self.tags.try_remove(token.0);
        self.poll.registry().deregister(source)
    }

    /// Create a waker whose wakeups arrive as [`Tag::Waker`] events.
    pub fn waker(&mut self) -> io::Result<Arc<Waker>> {
        let token = Token(self.tags.insert(Tag::Waker));
        match Waker::new(self.poll.registry(), token) {
            Ok(waker) => Ok(Arc::new(waker)),
            Err(e) => {
                self.tags.remove(token.0);
                Err(e)
            }
        }
    }

    /// Block until something is ready or `timeout` passes, then fill
    /// `ready` with the reported events in order.
    ///
    /// A signal interrupting the wait yields an empty batch.
    pub fn wait(
        &mut self,
        timeout: Option<Duration>,
        ready: &mut Vec<(Tag, Readiness)>,
    ) -> io::Result<()> {
        ready.clear();

        match self.poll.poll(&mut self.events, timeout) {
            Ok(()) => {}
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => return Ok(()),
            Err(e) => return Err(e),
        }

        for event in self.events.iter() {
            // Tokens of sources deregistered earlier have no tag.
            if let Some(&tag) = self.tags.get(event.token().0) {
                ready.push((tag, Readiness::from(event)));
            }
        }
        Ok(())
    }

    fn token(&self, fd: RawFd) -> io::Result<Token> {
        self.tokens.get(&fd).copied().ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("descriptor {fd} not registered"),
            )
        })
    }
}
