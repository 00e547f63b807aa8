//! Session registry
//!
//! The registry is the relay's only shared mutable state. One mutex guards
//! the identity → session map; every mutation and every multi-session read
//! takes it, and none of them holds it across network I/O. Broadcasts work on
//! a [`Registry::snapshot`] and hand each frame to that target's own
//! [`ControlSink`]. On the relay that is a [`QueuedSink`], so a slow target
//! only ever stalls its own writer thread.

use std::collections::HashMap;
use std::fmt;
use std::io::{self, ErrorKind, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    mpsc::{self, Receiver, SyncSender, TrySendError},
    Arc, Mutex, MutexGuard, PoisonError,
};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::debug;

/// Write side of a session's control connection.
pub trait ControlSink: Send + Sync {
    /// Write, or queue, one complete encoded frame.
    fn send(&self, frame: &[u8]) -> io::Result<()>;

    /// Tear the connection down. Later sends fail.
    fn close(&self) {}
}

/// [`ControlSink`] over a TCP stream. Whole frames are written under a
/// per-connection lock so concurrent writers never interleave.
///
/// A failed write may leave half a frame on the wire, so the first failure
/// shuts the stream down and every later send is refused.
#[derive(Debug)]
pub struct TcpSink {
    stream: Mutex<TcpStream>,
    /// Second handle for shutdown, usable while a write holds the lock
    handle: TcpStream,
    closed: AtomicBool,
}

impl TcpSink {
    pub fn new(stream: TcpStream, write_timeout: Duration) -> io::Result<Self> {
        stream.set_write_timeout(Some(write_timeout))?;
        Ok(Self {
            handle: stream.try_clone()?,
            stream: Mutex::new(stream),
            closed: AtomicBool::new(false),
        })
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn lock(&self) -> MutexGuard<'_, TcpStream> {
        self.stream.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl ControlSink for TcpSink {
    fn send(&self, frame: &[u8]) -> io::Result<()> {
        let mut stream = self.lock();
        if self.is_closed() {
            return Err(io::Error::new(ErrorKind::NotConnected, "control connection closed"));
        }

        let written = stream.write_all(frame).and_then(|()| stream.flush());
        if written.is_err() {
            self.close();
        }
        written
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            let _ = self.handle.shutdown(Shutdown::Both);
        }
    }
}

/// [`ControlSink`] that queues frames for a dedicated writer thread.
///
/// `send` never blocks: a full queue is reported as
/// [`ErrorKind::WouldBlock`] and the caller treats the target as failed.
pub struct QueuedSink {
    queue: Mutex<Option<SyncSender<Vec<u8>>>>,
    sink: Arc<TcpSink>,
}

/// The draining half of a [`QueuedSink`], not yet running.
pub struct SinkWriter {
    frames: Receiver<Vec<u8>>,
    sink: Arc<TcpSink>,
}

impl QueuedSink {
    /// Up to `capacity` frames wait for the writer. Frames sent before
    /// [`SinkWriter::spawn`] are kept and written after its preamble.
    pub fn new(sink: TcpSink, capacity: usize) -> (Self, SinkWriter) {
        let (tx, rx) = mpsc::sync_channel(capacity);
        let sink = Arc::new(sink);
        (
            Self {
                queue: Mutex::new(Some(tx)),
                sink: sink.clone(),
            },
            SinkWriter { frames: rx, sink },
        )
    }

    fn queue(&self) -> MutexGuard<'_, Option<SyncSender<Vec<u8>>>> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl ControlSink for QueuedSink {
    fn send(&self, frame: &[u8]) -> io::Result<()> {
        let queue = self.queue();
        let Some(tx) = queue.as_ref() else {
            return Err(io::Error::new(ErrorKind::NotConnected, "control connection closed"));
        };

        match tx.try_send(frame.to_vec()) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                Err(io::Error::new(ErrorKind::WouldBlock, "send queue full"))
            }
            Err(TrySendError::Disconnected(_)) => {
                Err(io::Error::new(ErrorKind::BrokenPipe, "control writer stopped"))
            }
        }
    }

    /// Drop whatever is still queued and shut the stream down, which also
    /// unblocks a writer stuck on a stalled peer.
    fn close(&self) {
        self.queue().take();
        self.sink.close();
    }
}

impl SinkWriter {
    /// Write `preamble` raw, then every queued frame in order, until the
    /// sink closes or a write fails.
    pub fn spawn(self, preamble: Vec<u8>) -> JoinHandle<()> {
        thread::spawn(move || {
            if let Err(e) = self.sink.send(&preamble) {
                debug!("Control preamble not written: {}", e);
                return;
            }
            for frame in self.frames {
                if let Err(e) = self.sink.send(&frame) {
                    debug!("Control writer stopped: {}", e);
                    return;
                }
            }
        })
    }
}

/// One connected peer, as the relay sees it.
#[derive(Clone)]
pub struct Session {
    pub identity: String,
    pub control: Arc<dyn ControlSink>,
    /// Remote address of the control connection
    pub control_addr: SocketAddr,
    /// Set once by `udp-register`
    pub media_addr: Option<SocketAddr>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("identity", &self.identity)
            .field("control_addr", &self.control_addr)
            .field("media_addr", &self.media_addr)
            .finish_non_exhaustive()
    }
}

impl Session {
    fn claim_media_address(&mut self, addr: SocketAddr) -> MediaRegistration {
        match self.media_addr {
            Some(existing) => MediaRegistration::AlreadyRegistered(existing),
            None => {
                self.media_addr = Some(addr);
                MediaRegistration::Registered(addr)
            }
        }
    }
}

/// Outcome of [`Registry::set_media_address`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaRegistration {
    Registered(SocketAddr),
    /// The session already has a media address; it is kept.
    AlreadyRegistered(SocketAddr),
    UnknownSession,
}

/// Where a media datagram goes: its sender, and every other registered
/// media address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaRoute {
    pub sender: String,
    pub targets: Vec<(String, SocketAddr)>,
}

/// Identity → session table.
#[derive(Default)]
pub struct Registry {
    sessions: Mutex<HashMap<String, Session>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    fn sessions(&self) -> MutexGuard<'_, HashMap<String, Session>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Insert a session under `candidate`, or `candidate_1`, `candidate_2`, …
    /// if taken. The chosen name is returned.
    pub fn register(
        &self,
        candidate: &str,
        control: Arc<dyn ControlSink>,
        control_addr: SocketAddr,
    ) -> String {
        let mut sessions = self.sessions();

        let mut identity = candidate.to_string();
        let mut suffix = 1;
        while sessions.contains_key(&identity) {
            identity = format!("{candidate}_{suffix}");
            suffix += 1;
        }

        sessions.insert(
            identity.clone(),
            Session {
                identity: identity.clone(),
                control,
                control_addr,
                media_addr: None,
            },
        );

        identity
    }

    pub fn set_media_address(&self, identity: &str, addr: SocketAddr) -> MediaRegistration {
        match self.sessions().get_mut(identity) {
            Some(session) => session.claim_media_address(addr),
            None => MediaRegistration::UnknownSession,
        }
    }

    /// Register `port` on the IP the session's control connection came from.
    pub fn set_media_port(&self, identity: &str, port: u16) -> MediaRegistration {
        match self.sessions().get_mut(identity) {
            Some(session) => {
                let addr = SocketAddr::new(session.control_addr.ip(), port);
                session.claim_media_address(addr)
            }
            None => MediaRegistration::UnknownSession,
        }
    }

    pub fn lookup_by_media_address(&self, addr: SocketAddr) -> Option<String> {
        self.sessions()
            .values()
            .find(|s| s.media_addr == Some(addr))
            .map(|s| s.identity.clone())
    }

    /// Sender lookup and target list taken under one lock.
    pub fn media_route(&self, source: SocketAddr) -> Option<MediaRoute> {
        let sessions = self.sessions();
        let sender = sessions
            .values()
            .find(|s| s.media_addr == Some(source))?
            .identity
            .clone();

        let targets = sessions
            .values()
            .filter(|s| s.identity != sender)
            .filter_map(|s| s.media_addr.map(|addr| (s.identity.clone(), addr)))
            .collect();

        Some(MediaRoute { sender, targets })
    }

    pub fn remove(&self, identity: &str) -> Option<Session> {
        self.sessions().remove(identity)
    }

    /// Point-in-time copy of every session, ordered by identity.
    pub fn snapshot(&self) -> Vec<Session> {
        let mut sessions: Vec<Session> = self.sessions().values().cloned().collect();
        sessions.sort_by(|a, b| a.identity.cmp(&b.identity));
        sessions
    }

    pub fn contains(&self, identity: &str) -> bool {
        self.sessions().contains_key(identity)
    }

    pub fn len(&self) -> usize {
        self.sessions().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
