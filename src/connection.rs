//! The send side of a connection.
//!
//! A connection's socket is shared between the interface thread (which
//! reads) and any number of request handles (which write). All writes go
//! through the connection's [`SendChannel`]: a mutex over the socket plus
//! the send-corrupt flag. Holding the channel across an entire scatter/
//! gather write is what guarantees that concurrent requests interleave on
//! the wire at record boundaries only.

use crate::assembler::RecordAssembler;
use crate::codec::ScatterList;
use std::io::{self, IoSlice, Write};
use std::net::TcpStream;
use std::os::fd::{AsRawFd, RawFd};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// What became of an attempted send
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// Every byte was written
    Sent,
    /// The peer closed its end; nothing about the local stream is damaged
    Closed,
    /// The write stopped mid-record (short write, timeout, or an already
    /// corrupt channel); the byte stream can no longer carry framed
    /// records and the connection must be torn down
    Corrupt,
}

#[derive(Debug)]
struct SendState {
    stream: Arc<TcpStream>,
    corrupt: bool,
}

/// Serializes writes on one connection and owns its send-corrupt flag
#[derive(Debug)]
pub struct SendChannel {
    state: Mutex<SendState>,
}

impl SendChannel {
    pub fn new(stream: Arc<TcpStream>) -> Self {
        SendChannel {
            state: Mutex::new(SendState {
                stream,
                corrupt: false,
            }),
        }
    }

    // A poisoned send lock means a writer panicked mid-write; the stream
    // position is unknowable, which is exactly what the corrupt flag means.
    fn lock(&self) -> MutexGuard<'_, SendState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                let mut guard = poisoned.into_inner();
                guard.corrupt = true;
                guard
            }
        }
    }

    /// Acquires and immediately releases the send lock, waiting out any
    /// in-flight write. Used by the interface before tearing a
    /// connection down.
    pub fn quiesce(&self) {
        drop(self.lock());
    }

    /// True once a write has left the stream mid-record
    pub fn is_corrupt(&self) -> bool {
        self.lock().corrupt
    }

    /// Writes a scatter/gather plan under the send lock
    pub fn send_plan(&self, plan: &ScatterList<'_>, timeout: Duration) -> SendOutcome {
        self.send_with(plan.total_len(), |skip| plan.io_slices_from(skip), timeout)
    }

    /// Writes a contiguous buffer under the send lock
    pub fn send_bytes(&self, bytes: &[u8], timeout: Duration) -> SendOutcome {
        self.send_with(
            bytes.len(),
            |skip| vec![IoSlice::new(&bytes[skip..])],
            timeout,
        )
    }

    fn send_with<'a, F>(&self, total: usize, slices: F, timeout: Duration) -> SendOutcome
    where
        F: Fn(usize) -> Vec<IoSlice<'a>>,
    {
        let mut state = self.lock();
        if state.corrupt {
            return SendOutcome::Corrupt;
        }
        if total == 0 {
            return SendOutcome::Sent;
        }

        let deadline = Instant::now() + timeout;
        let mut written = 0;

        while written < total {
            let list = slices(written);
            match (&*state.stream).write_vectored(&list) {
                // A zero-byte completion with bytes outstanding behaves
                // like a peer close.
                Ok(0) => return SendOutcome::Closed,
                Ok(n) => written += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    match wait_writable(state.stream.as_raw_fd(), deadline) {
                        Ok(true) => continue,
                        // Timed out, or the wait itself failed. The peer
                        // has stopped reading and the record may be
                        // half-delivered.
                        Ok(false) | Err(_) => {
                            state.corrupt = true;
                            return SendOutcome::Corrupt;
                        }
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if is_disconnect(&e) => return SendOutcome::Closed,
                Err(_) => {
                    state.corrupt = true;
                    return SendOutcome::Corrupt;
                }
            }
        }

        SendOutcome::Sent
    }
}

fn is_disconnect(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::NotConnected
    )
}

// Blocks until the socket is writable or the deadline passes. Connection
// sockets are non-blocking (the interface multiplexes reads on them), so a
// blocked writer parks on a private one-shot poll instead.
fn wait_writable(fd: RawFd, deadline: Instant) -> io::Result<bool> {
    use mio::unix::SourceFd;
    use mio::{Events, Interest, Poll, Token};

    let mut poll = Poll::new()?;
    poll.registry()
        .register(&mut SourceFd(&fd), Token(0), Interest::WRITABLE)?;
    let mut events = Events::with_capacity(4);

    loop {
        let now = Instant::now();
        if now >= deadline {
            return Ok(false);
        }
        match poll.poll(&mut events, Some(deadline - now)) {
            Ok(()) => {
                if !events.is_empty() {
                    return Ok(true);
                }
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
}

/// An open connection as the interface tracks it: the socket, its send
/// channel, and its receive state machine
#[derive(Debug)]
pub struct Connection {
    pub stream: Arc<TcpStream>,
    pub send: Arc<SendChannel>,
    pub assembler: RecordAssembler,
}

impl Connection {
    pub fn new(stream: TcpStream) -> Self {
        let stream = Arc::new(stream);
        Connection {
            send: Arc::new(SendChannel::new(Arc::clone(&stream))),
            stream,
            assembler: RecordAssembler::new(),
        }
    }
}
