//! Connection state machine for managing TCP connections.
//!
//! Each connection owns its socket, an incoming buffer of bytes not yet
//! framed, an outgoing buffer of encoded responses not yet sent, and the
//! readiness interest it currently wants from the poller.
//!
//! The request/response cycle alternates between two phases:
//!
//! ```text
//!   AwaitingRequest --(response queued)--> SendingResponse
//!         ^                                      |
//!         +-------------(outgoing drained)-------+
//!
//!   any phase --(EOF, protocol violation, I/O error)--> Closing
//! ```
//!
//! Readiness is edge-triggered, so both handlers keep going until the
//! socket reports `WouldBlock`.

use crate::protocols::echo::{FrameCodec, FrameError, Service};
use crate::runtime::poller::{Interest, Readiness};
use crate::runtime::Buffer;
use std::io::{self, Read, Write};
use std::os::unix::io::RawFd;
use std::time::{Duration, Instant};
use tracing::trace;

/// Observable phase of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Reading requests.
    AwaitingRequest,
    /// Draining queued responses.
    SendingResponse,
    /// Marked for teardown.
    Closing,
}

/// Why a connection was torn down.
#[derive(Debug)]
pub enum CloseReason {
    /// Peer shut down with no partial request pending.
    PeerClosed,
    /// Peer shut down in the middle of a request.
    UnexpectedEof {
        /// Bytes of the unfinished request that were discarded.
        pending: usize,
    },
    /// Peer broke the framing contract.
    Protocol(FrameError),
    /// Hard socket error.
    Io(io::Error),
    /// No traffic for longer than the idle timeout.
    IdleTimeout,
}

impl CloseReason {
    /// Whether this is an ordinary disconnect.
    pub fn is_clean(&self) -> bool {
        matches!(self, CloseReason::PeerClosed)
    }
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CloseReason::PeerClosed => write!(f, "closed by peer"),
            CloseReason::UnexpectedEof { pending } => {
                write!(f, "peer closed mid-message with {pending} bytes pending")
            }
            CloseReason::Protocol(e) => write!(f, "protocol violation: {e}"),
            CloseReason::Io(e) => write!(f, "I/O error: {e}"),
            CloseReason::IdleTimeout => write!(f, "idle timeout"),
        }
    }
}

/// Sockets that can report a pending asynchronous error (`SO_ERROR`).
pub trait SocketError {
    fn take_error(&self) -> io::Result<Option<io::Error>>;
}

impl SocketError for mio::net::TcpStream {
    fn take_error(&self) -> io::Result<Option<io::Error>> {
        mio::net::TcpStream::take_error(self)
    }
}

/// A single client connection.
#[derive(Debug)]
pub struct Connection<S> {
    /// Raw descriptor of `stream`, used as the registry key.
    fd: RawFd,
    stream: S,
    incoming: Buffer,
    outgoing: Buffer,
    wants_read: bool,
    wants_write: bool,
    wants_close: bool,
    close_reason: Option<CloseReason>,
    /// Interest last pushed to the poller.
    registered: Interest,
    last_active: Instant,
}

impl<S> Connection<S> {
    /// Create a new connection in the reading phase.
    pub fn new(fd: RawFd, stream: S) -> Self {
        Self {
            fd,
            stream,
            incoming: Buffer::new(),
            outgoing: Buffer::new(),
            wants_read: true,
            wants_write: false,
            wants_close: false,
            close_reason: None,
            registered: Interest::READABLE,
            last_active: Instant::now(),
        }
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn stream_mut(&mut self) -> &mut S {
        &mut self.stream
    }

    pub fn phase(&self) -> Phase {
        if self.wants_close {
            Phase::Closing
        } else if self.wants_write {
            Phase::SendingResponse
        } else {
            Phase::AwaitingRequest
        }
    }

    pub fn wants_close(&self) -> bool {
        self.wants_close
    }

    /// Interest matching the current phase.
    pub fn interest(&self) -> Interest {
        Interest {
            read: self.wants_read,
            write: self.wants_write,
        }
    }

    /// Interest that needs pushing to the poller, if it changed since the
    /// last call. Marks it as pushed.
    pub fn take_interest_change(&mut self) -> Option<Interest> {
        let interest = self.interest();
        if interest == self.registered {
            return None;
        }
        self.registered = interest;
        Some(interest)
    }

    /// Bytes received but not yet framed.
    pub fn pending_input(&self) -> usize {
        self.incoming.len()
    }

    /// Encoded responses not yet sent.
    pub fn pending_output(&self) -> usize {
        self.outgoing.len()
    }

    /// Time since the last byte moved in either direction.
    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_active)
    }

    /// Why the connection is closing. Only the first reason is kept.
    pub fn take_close_reason(&mut self) -> Option<CloseReason> {
        self.close_reason.take()
    }

    /// Mark the connection for teardown.
    pub fn close(&mut self, reason: CloseReason) {
        if !self.wants_close {
            self.wants_close = true;
            self.wants_read = false;
            self.wants_write = false;
            self.close_reason = Some(reason);
        }
    }

    fn start_reading(&mut self) {
        if !self.wants_read {
            trace!(fd = self.fd, "Switching to read");
        }
        self.wants_read = true;
        self.wants_write = false;
    }

    fn start_writing(&mut self) {
        if !self.wants_write {
            trace!(fd = self.fd, pending = self.outgoing.len(), "Switching to write");
        }
        self.wants_read = false;
        self.wants_write = true;
    }
}

impl<S: SocketError> Connection<S> {
    /// Handle error and hangup bits reported by the poller.
    ///
    /// Runs after the read and write handlers, so a connection they already
    /// closed keeps the reason they gave.
    pub fn on_poll_error(&mut self, readiness: Readiness) {
        if self.wants_close {
            return;
        }

        if readiness.error {
            let e = match self.stream.take_error() {
                Ok(Some(e)) | Err(e) => e,
                Ok(None) => io::Error::other("socket error reported by poller"),
            };
            self.close(CloseReason::Io(e));
        } else if readiness.hangup {
            let reason = match self.pending_input() {
                0 => CloseReason::PeerClosed,
                pending => CloseReason::UnexpectedEof { pending },
            };
            self.close(reason);
        }
    }
}

impl<S: Read + Write> Connection<S> {
    /// Handle read readiness.
    ///
    /// Reads at most `chunk` bytes per call to the socket and keeps reading
    /// until it would block. Every complete frame is answered right away;
    /// once a response is queued it is written opportunistically, and
    /// reading only resumes if that write drained everything.
    pub fn on_readable<H: Service>(&mut self, codec: &FrameCodec, service: &mut H, chunk: usize) {
        while self.wants_read && !self.wants_close {
            match self.incoming.read_from(&mut self.stream, chunk) {
                Ok(0) => {
                    let reason = if self.incoming.is_empty() {
                        CloseReason::PeerClosed
                    } else {
                        CloseReason::UnexpectedEof {
                            pending: self.incoming.len(),
                        }
                    };
                    self.close(reason);
                    return;
                }
                Ok(n) => {
                    trace!(fd = self.fd, bytes = n, "Read");
                    self.last_active = Instant::now();
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.close(CloseReason::Io(e));
                    return;
                }
            }

            if let Err(e) = self.process_incoming(codec, service) {
                self.close(CloseReason::Protocol(e));
                return;
            }

            if !self.outgoing.is_empty() {
                self.start_writing();
                self.on_writable();
            }
        }
    }

    /// Answer every complete frame in `incoming`, in order.
    fn process_incoming<H: Service>(
        &mut self,
        codec: &FrameCodec,
        service: &mut H,
    ) -> Result<(), FrameError> {
        let mut consumed = 0;
        let mut result = Ok(());

        loop {
            let frame = match codec.try_decode(&self.incoming.as_slice()[consumed..]) {
                Ok(Some(frame)) => frame,
                Ok(None) => break,
                Err(e) => {
                    result = Err(e);
                    break;
                }
            };

            let response = service.process(frame.payload);
            if let Err(e) = codec.encode(&response, &mut self.outgoing) {
                result = Err(e);
                break;
            }
            consumed += frame.consumed;
        }

        self.incoming.consume(consumed);
        result
    }

    /// Handle write readiness.
    ///
    /// Sends until `outgoing` is empty or the socket would block. Once
    /// drained the connection goes back to reading.
    pub fn on_writable(&mut self) {
        if self.wants_close {
            return;
        }

        while !self.outgoing.is_empty() {
            match self.stream.write(self.outgoing.as_slice()) {
                Ok(0) => {
                    self.close(CloseReason::Io(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "write returned 0",
                    )));
                    return;
                }
                Ok(n) => {
                    trace!(fd = self.fd, bytes = n, "Wrote");
                    self.outgoing.consume(n);
                    self.last_active = Instant::now();
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.close(CloseReason::Io(e));
                    return;
                }
            }
        }

        self.start_reading();
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::protocols::echo::Echo;
    use std::collections::VecDeque;

    /// In-memory socket with scripted behaviour.
    ///
    /// Each read pops the next entry of `reads` (empty vec = EOF, nothing
    /// left = `WouldBlock`). Each write accepts up to the next entry of
    /// `write_caps` (0 or nothing left = `WouldBlock`).
    #[derive(Debug, Default)]
    pub(crate) struct ScriptedStream {
        pub reads: VecDeque<io::Result<Vec<u8>>>,
        pub write_caps: VecDeque<usize>,
        pub write_error: Option<io::ErrorKind>,
        pub socket_error: Option<io::ErrorKind>,
        pub written: Vec<u8>,
    }

    impl ScriptedStream {
        pub fn unlimited_writes() -> Self {
            Self {
                write_caps: VecDeque::from(vec![usize::MAX]),
                ..Self::default()
            }
        }

        pub fn push_read(&mut self, data: &[u8]) {
            self.reads.push_back(Ok(data.to_vec()));
        }
    }

    impl Read for ScriptedStream {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            match self.reads.pop_front() {
                None => Err(io::ErrorKind::WouldBlock.into()),
                Some(Err(e)) => Err(e),
                Some(Ok(data)) => {
                    let n = data.len().min(buf.len());
                    buf[..n].copy_from_slice(&data[..n]);
                    if n < data.len() {
                        self.reads.push_front(Ok(data[n..].to_vec()));
                    }
                    Ok(n)
                }
            }
        }
    }

    impl Write for ScriptedStream {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if let Some(kind) = self.write_error {
                return Err(kind.into());
            }
            match self.write_caps.pop_front() {
                None | Some(0) => Err(io::ErrorKind::WouldBlock.into()),
                Some(cap) => {
                    let n = cap.min(buf.len());
                    self.written.extend_from_slice(&buf[..n]);
                    if cap > n {
                        self.write_caps.push_front(cap - n);
                    }
                    Ok(n)
                }
            }
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl SocketError for ScriptedStream {
        fn take_error(&self) -> io::Result<Option<io::Error>> {
            Ok(self.socket_error.map(io::Error::from))
        }
    }

    pub(crate) fn frame(payload: &[u8]) -> Vec<u8> {
        let mut buf = Buffer::new();
        FrameCodec::default().encode(payload, &mut buf).unwrap();
        buf.as_slice().to_vec()
    }

    fn read_all(conn: &mut Connection<ScriptedStream>) {
        conn.on_readable(&FrameCodec::default(), &mut Echo, 64 * 1024);
    }

    #[test]
    fn test_pipelined_requests_in_one_read() {
        let mut stream = ScriptedStream::unlimited_writes();
        let mut input = frame(b"a");
        input.extend(frame(b"bb"));
        input.extend(frame(b"ccc"));
        stream.push_read(&input);

        let mut conn = Connection::new(3, stream);
        read_all(&mut conn);

        let mut expected = frame(b"a");
        expected.extend(frame(b"bb"));
        expected.extend(frame(b"ccc"));
        assert_eq!(conn.stream.written, expected);
        assert_eq!(conn.pending_input(), 0);
        assert_eq!(conn.pending_output(), 0);
        assert_eq!(conn.phase(), Phase::AwaitingRequest);
    }

    #[test]
    fn test_frame_split_across_reads() {
        let mut stream = ScriptedStream::unlimited_writes();
        let input = frame(b"split payload");
        stream.push_read(&input[..2]);
        stream.push_read(&input[2..7]);

        let mut conn = Connection::new(3, stream);
        read_all(&mut conn);
        assert!(conn.stream.written.is_empty());
        assert_eq!(conn.pending_input(), 7);
        assert_eq!(conn.phase(), Phase::AwaitingRequest);

        conn.stream_mut().push_read(&input[7..]);
        read_all(&mut conn);
        assert_eq!(conn.stream.written, input);
        assert_eq!(conn.pending_input(), 0);
    }

    #[test]
    fn test_small_read_chunks() {
        let mut stream = ScriptedStream::unlimited_writes();
        let mut input = frame(b"one");
        input.extend(frame(b"two"));
        stream.push_read(&input);

        let mut conn = Connection::new(3, stream);
        conn.on_readable(&FrameCodec::default(), &mut Echo, 3);
        assert_eq!(conn.stream.written, input);
    }

    #[test]
    fn test_blocked_write_switches_to_write_interest() {
        let mut stream = ScriptedStream::default();
        stream.push_read(&frame(b"hello"));
        stream.push_read(&frame(b"unread"));

        let mut conn = Connection::new(3, stream);
        read_all(&mut conn);

        assert_eq!(conn.phase(), Phase::SendingResponse);
        assert_eq!(conn.interest(), Interest::WRITABLE);
        assert_eq!(conn.pending_output(), 9);
        // Reading stopped while output is pending.
        assert_eq!(conn.stream.reads.len(), 1);

        conn.stream_mut().write_caps.push_back(usize::MAX);
        conn.on_writable();
        assert_eq!(conn.stream.written, frame(b"hello"));
        assert_eq!(conn.phase(), Phase::AwaitingRequest);
        assert_eq!(conn.interest(), Interest::READABLE);
    }

    #[test]
    fn test_partial_writes_drain_in_order() {
        let payload: Vec<u8> = (0..7996u32).map(|i| (i % 251) as u8).collect();
        let response = frame(&payload);
        assert_eq!(response.len(), 8000);

        let mut conn = Connection::new(3, ScriptedStream::default());
        FrameCodec::default()
            .encode(&payload, &mut conn.outgoing)
            .unwrap();
        conn.start_writing();

        for accepted in [5000, 3000, 0] {
            conn.stream_mut().write_caps.push_back(accepted);
            conn.on_writable();
        }

        assert_eq!(conn.stream.written, response);
        assert_eq!(conn.pending_output(), 0);
        assert_eq!(conn.phase(), Phase::AwaitingRequest);
    }

    #[test]
    fn test_would_block_leaves_interest_unchanged() {
        let mut conn = Connection::new(3, ScriptedStream::default());
        conn.outgoing.append(b"queued");
        conn.start_writing();
        assert_eq!(conn.take_interest_change(), Some(Interest::WRITABLE));

        conn.on_writable();
        assert_eq!(conn.phase(), Phase::SendingResponse);
        assert_eq!(conn.take_interest_change(), None);
        assert_eq!(conn.pending_output(), 6);
    }

    #[test]
    fn test_clean_close() {
        let mut stream = ScriptedStream::unlimited_writes();
        stream.push_read(&frame(b"bye"));
        stream.push_read(b"");

        let mut conn = Connection::new(3, stream);
        read_all(&mut conn);
        assert_eq!(conn.stream.written, frame(b"bye"));
        assert_eq!(conn.phase(), Phase::Closing);
        assert!(conn.close_reason.as_ref().unwrap().is_clean());
    }

    #[test]
    fn test_unexpected_eof() {
        let mut stream = ScriptedStream::unlimited_writes();
        stream.push_read(&frame(b"truncated")[..6]);
        stream.push_read(b"");

        let mut conn = Connection::new(3, stream);
        read_all(&mut conn);
        assert!(conn.wants_close());
        assert!(matches!(
            conn.close_reason.as_ref(),
            Some(CloseReason::UnexpectedEof { pending: 6 })
        ));
    }

    #[test]
    fn test_oversized_frame_closes_without_response() {
        let mut stream = ScriptedStream::unlimited_writes();
        let mut input = frame(b"ok");
        input.extend_from_slice(&5u32.to_le_bytes());
        stream.push_read(&input);

        let mut conn = Connection::new(3, stream);
        conn.on_readable(&FrameCodec::new(4), &mut Echo, 1024);

        assert!(conn.wants_close());
        assert!(matches!(
            conn.close_reason.as_ref(),
            Some(CloseReason::Protocol(FrameError::Oversized { length: 5, max: 4 }))
        ));
        // Frames ahead of the bad one are still answered and queued, but
        // the connection no longer writes.
        assert!(conn.stream.written.is_empty());
        assert_eq!(conn.pending_output(), 6);
    }

    #[test]
    fn test_read_error_closes() {
        let mut stream = ScriptedStream::unlimited_writes();
        stream
            .reads
            .push_back(Err(io::ErrorKind::ConnectionReset.into()));

        let mut conn = Connection::new(3, stream);
        read_all(&mut conn);
        assert!(matches!(conn.close_reason.as_ref(), Some(CloseReason::Io(e)) if e.kind() == io::ErrorKind::ConnectionReset));
    }

    #[test]
    fn test_interrupted_read_is_retried() {
        let mut stream = ScriptedStream::unlimited_writes();
        stream.reads.push_back(Err(io::ErrorKind::Interrupted.into()));
        stream.push_read(&frame(b"again"));

        let mut conn = Connection::new(3, stream);
        read_all(&mut conn);
        assert_eq!(conn.stream.written, frame(b"again"));
        assert!(!conn.wants_close());
    }

    #[test]
    fn test_write_error_closes() {
        let mut stream = ScriptedStream::default();
        stream.write_error = Some(io::ErrorKind::BrokenPipe);
        stream.push_read(&frame(b"x"));

        let mut conn = Connection::new(3, stream);
        read_all(&mut conn);
        assert_eq!(conn.phase(), Phase::Closing);
        assert!(matches!(conn.close_reason.as_ref(), Some(CloseReason::Io(_))));
    }

    #[test]
    fn test_first_close_reason_wins() {
        let mut conn = Connection::new(3, ScriptedStream::default());
        conn.close(CloseReason::IdleTimeout);
        conn.close(CloseReason::PeerClosed);
        assert!(matches!(
            conn.take_close_reason(),
            Some(CloseReason::IdleTimeout)
        ));
        assert!(conn.take_close_reason().is_none());
    }

    #[test]
    fn test_poll_error_uses_socket_error() {
        let mut stream = ScriptedStream::default();
        stream.socket_error = Some(io::ErrorKind::ConnectionRefused);

        let mut conn = Connection::new(3, stream);
        conn.on_poll_error(Readiness {
            error: true,
            ..Readiness::default()
        });
        assert_eq!(conn.phase(), Phase::Closing);
        assert!(matches!(
            conn.close_reason.as_ref(),
            Some(CloseReason::Io(e)) if e.kind() == io::ErrorKind::ConnectionRefused
        ));
    }

    #[test]
    fn test_poll_error_without_socket_error() {
        let mut conn = Connection::new(3, ScriptedStream::default());
        conn.on_poll_error(Readiness {
            error: true,
            hangup: true,
            ..Readiness::default()
        });
        assert!(matches!(
            conn.close_reason.as_ref(),
            Some(CloseReason::Io(e)) if e.kind() == io::ErrorKind::Other
        ));
    }

    #[test]
    fn test_hangup_with_pending_input() {
        let mut stream = ScriptedStream::unlimited_writes();
        stream.push_read(&frame(b"cut short")[..5]);

        let mut conn = Connection::new(3, stream);
        read_all(&mut conn);
        assert_eq!(conn.pending_input(), 5);

        conn.on_poll_error(Readiness {
            hangup: true,
            ..Readiness::default()
        });
        assert!(matches!(
            conn.close_reason.as_ref(),
            Some(CloseReason::UnexpectedEof { pending: 5 })
        ));
    }

    #[test]
    fn test_hangup_without_pending_input() {
        let mut conn = Connection::new(3, ScriptedStream::default());
        conn.on_poll_error(Readiness {
            hangup: true,
            ..Readiness::default()
        });
        assert!(conn.close_reason.as_ref().unwrap().is_clean());
    }

    #[test]
    fn test_poll_error_keeps_earlier_reason() {
        let mut stream = ScriptedStream::unlimited_writes();
        stream.push_read(b"");

        let mut conn = Connection::new(3, stream);
        read_all(&mut conn);
        assert!(conn.close_reason.as_ref().unwrap().is_clean());

        conn.stream_mut().socket_error = Some(io::ErrorKind::ConnectionReset);
        conn.on_poll_error(Readiness {
            error: true,
            hangup: true,
            ..Readiness::default()
        });
        assert!(conn.close_reason.as_ref().unwrap().is_clean());
    }

    #[test]
    fn test_plain_readiness_is_not_an_error() {
        let mut conn = Connection::new(3, ScriptedStream::default());
        conn.on_poll_error(Readiness {
            readable: true,
            writable: true,
            ..Readiness::default()
        });
        assert!(!conn.wants_close());
        assert_eq!(conn.phase(), Phase::AwaitingRequest);
    }
}
