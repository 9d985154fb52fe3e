//! The acceptor / multiplexer.
//!
//! One thread owns an [`FcgiInterface`] and calls
//! [`accept_requests`](FcgiInterface::accept_requests) in a loop. Each call
//! runs deferred cleanup, blocks in the poller across the listener, the
//! waker, and every open connection, ingests whatever arrived, and returns
//! the requests that became ready as [`FcgiRequest`] handles for worker
//! threads.
//!
//! Two locks govern the shared state. The interface lock (the mutex over
//! [`SharedState`]) protects the request store, the closure-request and
//! dummy sets, the corruption flag, and the interface generation. Each
//! connection's send lock protects its socket writes and send-corrupt
//! flag. Lock ordering: the interface lock may be held alone, a send lock
//! may be held alone, or a send lock may be acquired inside the interface
//! lock. Acquiring the interface lock while holding a send lock is
//! forbidden.

use crate::assembler::{ContentRoute, ReadStatus, RecordSink};
use crate::codec::{self, encode_nv_pairs, RecordHeader};
use crate::connection::{Connection, SendChannel, SendOutcome};
use crate::error::InterfaceError;
use crate::protocol::*;
use crate::request::FcgiRequest;
use crate::store::{ConnId, RequestEntry, RequestKey, RequestPhase, RequestStore, StreamKind};
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token, Waker};
use std::collections::{BTreeSet, HashMap};
use std::io;
use std::net::{IpAddr, Shutdown, SocketAddr, TcpListener};
use std::os::fd::AsRawFd;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

const LISTENER: Token = Token(usize::MAX);
const WAKER: Token = Token(usize::MAX - 1);

// At most one interface exists per process; request handles recognize
// their interface by generation, with 0 reserved for "no interface".
static INTERFACE_EXISTS: AtomicBool = AtomicBool::new(false);
static NEXT_INTERFACE_ID: AtomicU64 = AtomicU64::new(1);
pub(crate) const NO_INTERFACE: u64 = 0;

/// State shared between the interface thread and request handles,
/// guarded by the interface lock
#[derive(Debug)]
pub(crate) struct SharedState {
    pub interface_id: u64,
    pub corrupt: bool,
    pub store: RequestStore,
    pub closure_requests: BTreeSet<ConnId>,
    pub dummies: BTreeSet<ConnId>,
}

// A poisoned interface lock means a holder panicked mid-update; shared
// state can no longer be trusted.
pub(crate) fn lock_shared(shared: &Mutex<SharedState>) -> MutexGuard<'_, SharedState> {
    match shared.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            let mut guard = poisoned.into_inner();
            guard.corrupt = true;
            guard
        }
    }
}

/// Health of the interface as reported by [`FcgiInterface::status`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterfaceStatus {
    /// The interface is operating normally
    Ok,
    /// An invariant was violated; the interface must be dropped
    Corrupt,
}

/// Configuration of an [`FcgiInterface`]
#[derive(Debug, Clone)]
pub struct InterfaceConfig {
    pub(crate) max_connections: usize,
    pub(crate) max_requests_per_connection: usize,
    pub(crate) app_status_on_abort: i32,
    pub(crate) role: Role,
    pub(crate) write_timeout: Duration,
}

impl InterfaceConfig {
    /// Creates a configuration with the given connection and
    /// per-connection request limits.
    ///
    /// The remaining knobs default to serving the Responder role, an
    /// application status of 1 for requests the interface rejects or
    /// aborts on the application's behalf, and a 300 second write timeout.
    pub fn new(max_connections: usize, max_requests_per_connection: usize) -> Self {
        InterfaceConfig {
            max_connections,
            max_requests_per_connection,
            app_status_on_abort: 1,
            role: Role::Responder,
            write_timeout: Duration::from_secs(300),
        }
    }

    /// Sets the FastCGI role this application serves. `BEGIN_REQUEST`
    /// records naming any other role are rejected with `UNKNOWN_ROLE`.
    pub fn role(mut self, role: Role) -> Self {
        self.role = role;
        self
    }

    /// Sets the application status reported when the interface ends a
    /// request without involving the application
    pub fn app_status_on_abort(mut self, status: i32) -> Self {
        self.app_status_on_abort = status;
        self
    }

    /// Sets the limit on how long a single write call may stay blocked
    /// before its connection is declared dead
    pub fn write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }
}

// Releases the process-wide singleton slot.
#[derive(Debug)]
struct SingletonGuard;

impl Drop for SingletonGuard {
    fn drop(&mut self) {
        INTERFACE_EXISTS.store(false, Ordering::SeqCst);
    }
}

/// The FastCGI server runtime.
///
/// Constructed over an already-listening socket; produces
/// [`FcgiRequest`] handles from [`accept_requests`] for worker threads to
/// service. All methods must be called from the thread that owns the
/// interface; the handles are what cross threads.
#[derive(Debug)]
pub struct FcgiInterface {
    config: InterfaceConfig,
    allowlist: Option<BTreeSet<IpAddr>>,
    listener: TcpListener,
    poll: Poll,
    events: Events,
    waker: Arc<Waker>,
    connections: HashMap<ConnId, Connection>,
    shared: Arc<Mutex<SharedState>>,
    interface_id: u64,
    overload: bool,
    // Handles constructed before a failed accept_requests call, returned
    // by the next call so no accepted work is lost.
    recovered: Vec<FcgiRequest>,
    _singleton: SingletonGuard,
}

impl FcgiInterface {
    /// Builds an interface over `listener`.
    ///
    /// The listener is made non-blocking but remains owned by the
    /// interface for its lifetime. If the `FCGI_WEB_SERVER_ADDRS`
    /// environment variable is set to a non-empty comma-separated list of
    /// IP addresses, only peers at those addresses are accepted.
    ///
    /// Fails if another interface currently exists in this process, if
    /// either limit is zero, or if the address list cannot be parsed.
    pub fn new(listener: TcpListener, config: InterfaceConfig) -> Result<Self, InterfaceError> {
        if config.max_connections == 0 {
            return Err(InterfaceError::ZeroConnectionLimit);
        }
        if config.max_requests_per_connection == 0 {
            return Err(InterfaceError::ZeroRequestLimit);
        }
        let allowlist = parse_allowlist(std::env::var(FCGI_WEB_SERVER_ADDRS).ok().as_deref())?;

        if INTERFACE_EXISTS
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(InterfaceError::AlreadyRunning);
        }
        let singleton = SingletonGuard;

        listener.set_nonblocking(true)?;
        let poll = Poll::new()?;
        poll.registry().register(
            &mut SourceFd(&listener.as_raw_fd()),
            LISTENER,
            Interest::READABLE,
        )?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER)?);

        let interface_id = NEXT_INTERFACE_ID.fetch_add(1, Ordering::Relaxed);
        let shared = Arc::new(Mutex::new(SharedState {
            interface_id,
            corrupt: false,
            store: RequestStore::new(),
            closure_requests: BTreeSet::new(),
            dummies: BTreeSet::new(),
        }));

        if let Ok(address) = listener.local_addr() {
            log::info!("FastCGI interface listening on {address}");
        }

        Ok(FcgiInterface {
            config,
            allowlist,
            listener,
            poll,
            events: Events::with_capacity(128),
            waker,
            connections: HashMap::new(),
            shared,
            interface_id,
            overload: false,
            recovered: Vec::new(),
            _singleton: singleton,
        })
    }

    /// Waits for client activity and returns the requests that became
    /// ready for service.
    ///
    /// An empty batch is normal: it is returned when the wait was
    /// interrupted by a signal or when the interface was woken for
    /// housekeeping (for example by a handle queueing a connection
    /// closure). After an error, check [`status`](Self::status); a corrupt
    /// interface must be dropped, while handles built before the failure
    /// are preserved and returned by the next successful call.
    pub fn accept_requests(&mut self) -> Result<Vec<FcgiRequest>, InterfaceError> {
        if lock_shared(&self.shared).corrupt {
            return Err(InterfaceError::Corrupt);
        }

        let mut batch = std::mem::take(&mut self.recovered);
        match self.poll_once(&mut batch) {
            Ok(()) => Ok(batch),
            Err(e) => {
                self.recovered = batch;
                if matches!(e, InterfaceError::Store(_)) {
                    lock_shared(&self.shared).corrupt = true;
                }
                Err(e)
            }
        }
    }

    /// Puts the interface into or takes it out of the overloaded state.
    ///
    /// While overloaded, new connections are accepted and immediately
    /// closed, and new `BEGIN_REQUEST` records are rejected with
    /// `OVERLOADED`; requests already in flight are unaffected.
    pub fn set_overload(&mut self, overload: bool) {
        if overload != self.overload {
            log::info!("FastCGI interface overload {}", if overload { "on" } else { "off" });
        }
        self.overload = overload;
    }

    /// Returns the current overload flag
    pub fn overload(&self) -> bool {
        self.overload
    }

    /// Reports whether the interface is still usable
    pub fn status(&self) -> InterfaceStatus {
        if lock_shared(&self.shared).corrupt {
            InterfaceStatus::Corrupt
        } else {
            InterfaceStatus::Ok
        }
    }

    /// Number of connections the interface currently holds, counting
    /// dummy connections whose descriptors are still pinned by
    /// outstanding requests
    pub fn connection_count(&self) -> usize {
        self.connections.len() + lock_shared(&self.shared).dummies.len()
    }

    fn poll_once(&mut self, batch: &mut Vec<FcgiRequest>) -> Result<(), InterfaceError> {
        self.reap_dummies();
        self.process_closure_requests()?;

        match self.poll.poll(&mut self.events, None) {
            Ok(()) => {}
            // A signal hit the interface thread; report an empty batch.
            Err(e) if e.kind() == io::ErrorKind::Interrupted => return Ok(()),
            Err(e) => return Err(e.into()),
        }

        let tokens: Vec<Token> = self.events.iter().map(|event| event.token()).collect();
        let mut ready = Vec::new();
        let mut listener_ready = false;

        for token in tokens {
            match token {
                WAKER => {
                    // Nothing to read; whatever state changed is picked up
                    // by the cleanup pass of the next call.
                }
                LISTENER => listener_ready = true,
                Token(fd) => self.read_connection(fd as ConnId, &mut ready)?,
            }
        }

        if listener_ready {
            self.accept_connections()?;
        }

        for key in ready {
            if let Some(request) = self.assign_request(key) {
                batch.push(request);
            }
        }
        Ok(())
    }

    // Drives one readable connection through the record assembler.
    fn read_connection(
        &mut self,
        conn: ConnId,
        ready: &mut Vec<RequestKey>,
    ) -> Result<(), InterfaceError> {
        let result = {
            let Some(connection) = self.connections.get_mut(&conn) else {
                // The connection was torn down earlier in this pass.
                return Ok(());
            };
            let mut ingest = Ingest {
                shared: &self.shared,
                config: &self.config,
                overload: self.overload,
                conn,
                send: &connection.send,
            };
            connection
                .assembler
                .read_records(&*connection.stream, &mut ingest, ready)
        };

        match result {
            Ok(ReadStatus::WouldBlock) => Ok(()),
            Ok(ReadStatus::Closed) => self.remove_connection(conn),
            Err(e) => {
                log::debug!(error:err = e; "read failed; closing connection {conn}");
                self.remove_connection(conn)
            }
        }
    }

    // Accepts and validates queued connection requests until the listener
    // would block.
    fn accept_connections(&mut self) -> Result<(), InterfaceError> {
        loop {
            let (stream, peer) = match self.listener.accept() {
                Ok(accepted) => accepted,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                // The peer gave up while queued; not our problem.
                Err(e) if e.kind() == io::ErrorKind::ConnectionAborted => continue,
                Err(e) => return Err(e.into()),
            };

            if !self.admit(&peer) {
                drop(stream);
                continue;
            }

            stream.set_nonblocking(true)?;
            let conn = stream.as_raw_fd();
            self.poll.registry().register(
                &mut SourceFd(&conn),
                Token(conn as usize),
                Interest::READABLE,
            )?;
            lock_shared(&self.shared).store.register_connection(conn);
            self.connections.insert(conn, Connection::new(stream));
            log::debug!("accepted FastCGI connection from {peer}");
        }
    }

    fn admit(&self, peer: &SocketAddr) -> bool {
        if let Some(allowed) = &self.allowlist {
            if !allowed.contains(&peer.ip()) {
                log::warn!("rejecting connection from unauthorized address {peer}");
                return false;
            }
        }
        if self.connection_count() >= self.config.max_connections {
            log::debug!("rejecting connection from {peer}: connection limit reached");
            return false;
        }
        if self.overload {
            log::debug!("rejecting connection from {peer}: interface is overloaded");
            return false;
        }
        true
    }

    // Hands a completed request to the application: the entry flips from
    // pending to assigned and its accumulated data moves into the handle.
    fn assign_request(&mut self, key: RequestKey) -> Option<FcgiRequest> {
        let connection = self.connections.get(&key.conn)?;
        let mut shared = lock_shared(&self.shared);
        let entry = shared.store.get_mut(key)?;
        entry.phase = RequestPhase::Assigned;
        let role = Role::from_id(entry.role).unwrap_or(self.config.role);
        let keep_conn = entry.keep_conn;
        let env = std::mem::take(&mut entry.env);
        let stdin = entry.take_stdin();
        let data = entry.take_data();
        drop(shared);

        Some(FcgiRequest::new(
            Arc::clone(&self.shared),
            Arc::clone(&connection.send),
            Arc::clone(&self.waker),
            self.interface_id,
            key,
            role,
            keep_conn,
            env,
            stdin,
            data,
            self.config.write_timeout,
        ))
    }

    // Closes dummy descriptors whose requests have all been destroyed.
    fn reap_dummies(&mut self) {
        let mut shared = lock_shared(&self.shared);
        let SharedState { dummies, store, .. } = &mut *shared;
        dummies.retain(|&conn| {
            if store.count(conn) == 0 {
                store.forget_connection(conn);
                false
            } else {
                true
            }
        });
    }

    // Removes every connection whose closure was requested by a handle or
    // by record processing.
    fn process_closure_requests(&mut self) -> Result<(), InterfaceError> {
        loop {
            let next = lock_shared(&self.shared)
                .closure_requests
                .iter()
                .next()
                .copied();
            let Some(conn) = next else { return Ok(()) };
            self.remove_connection(conn)?;
        }
    }

    // Tears a connection down. Pending requests vanish; assigned requests
    // are marked closed-by-interface and pin the descriptor (the
    // connection demotes to a dummy) until their handles are destroyed.
    fn remove_connection(&mut self, conn: ConnId) -> Result<(), InterfaceError> {
        let Some(connection) = self.connections.remove(&conn) else {
            // Already dummy or absent; just retire the closure request.
            lock_shared(&self.shared).closure_requests.remove(&conn);
            return Ok(());
        };

        let assigned_remain;
        {
            let mut shared = lock_shared(&self.shared);
            shared.closure_requests.remove(&conn);
            // Wait out any in-flight write before the socket goes away.
            connection.send.quiesce();
            assigned_remain = shared.store.close_connection_requests(conn)?;
            if assigned_remain {
                shared.dummies.insert(conn);
            } else {
                shared.store.forget_connection(conn);
            }
        }

        self.poll.registry().deregister(&mut SourceFd(&conn))?;
        let _ = connection.stream.shutdown(Shutdown::Both);
        if assigned_remain {
            log::debug!("connection {conn} demoted to dummy; assigned requests remain");
        } else {
            log::debug!("connection {conn} closed");
        }
        Ok(())
    }
}

impl Drop for FcgiInterface {
    fn drop(&mut self) {
        let mut shared = lock_shared(&self.shared);
        shared.interface_id = NO_INTERFACE;
        drop(shared);
        for connection in self.connections.values() {
            let _ = connection.stream.shutdown(Shutdown::Both);
        }
    }
}

fn parse_allowlist(raw: Option<&str>) -> Result<Option<BTreeSet<IpAddr>>, InterfaceError> {
    let Some(raw) = raw else { return Ok(None) };
    if raw.trim().is_empty() {
        return Ok(None);
    }
    let mut allowed = BTreeSet::new();
    for part in raw.split(',') {
        let text = part.trim();
        if text.is_empty() {
            continue;
        }
        // Parsing into IpAddr is the normalizing round trip: textual
        // variants of one address compare equal as values.
        let address: IpAddr = text
            .parse()
            .map_err(|_| InterfaceError::InvalidAddressList(text.to_string()))?;
        allowed.insert(address);
    }
    if allowed.is_empty() {
        Ok(None)
    } else {
        Ok(Some(allowed))
    }
}

// The interface's view of one connection while its records are ingested.
// Implements the assembler's protocol decisions against shared state.
struct Ingest<'a> {
    shared: &'a Mutex<SharedState>,
    config: &'a InterfaceConfig,
    overload: bool,
    conn: ConnId,
    send: &'a SendChannel,
}

impl Ingest<'_> {
    fn key(&self, header: &RecordHeader) -> RequestKey {
        RequestKey {
            conn: self.conn,
            fcgi_id: header.request_id,
        }
    }

    // A failed management or rejection send means the connection is done.
    fn after_send(&mut self, outcome: SendOutcome) {
        if outcome != SendOutcome::Sent {
            lock_shared(self.shared).closure_requests.insert(self.conn);
        }
    }

    fn send_end_request(&mut self, fcgi_id: u16, app_status: i32, status: ProtocolStatus) {
        let mut record = [0u8; 16];
        record[..8].copy_from_slice(&RecordHeader::encode(FCGI_END_REQUEST, fcgi_id, 8, 0));
        record[8..].copy_from_slice(&codec::end_request_body(app_status, status.id()));
        let outcome = self.send.send_bytes(&record, self.config.write_timeout);
        self.after_send(outcome);
    }

    fn send_unknown_type(&mut self, rtype: u8) {
        let mut record = [0u8; 16];
        record[..8].copy_from_slice(&RecordHeader::encode(
            FCGI_UNKNOWN_TYPE,
            FCGI_NULL_REQUEST_ID,
            8,
            0,
        ));
        record[8..].copy_from_slice(&codec::unknown_type_body(rtype));
        let outcome = self.send.send_bytes(&record, self.config.write_timeout);
        self.after_send(outcome);
    }

    fn send_get_values_result(&mut self, query: &[u8]) {
        let requested = codec::decode_nv_pairs(query);
        let wants = |name: &[u8]| requested.iter().any(|(n, _)| n.as_slice() == name);

        // Unknown names are omitted, never faulted; a malformed query
        // decodes to nothing and produces an empty (but valid) reply.
        let mut values: Vec<(Vec<u8>, Vec<u8>)> = Vec::new();
        if wants(FCGI_MAX_CONNS) {
            values.push((
                FCGI_MAX_CONNS.to_vec(),
                self.config.max_connections.to_string().into_bytes(),
            ));
        }
        if wants(FCGI_MAX_REQS) {
            values.push((
                FCGI_MAX_REQS.to_vec(),
                self.config
                    .max_requests_per_connection
                    .to_string()
                    .into_bytes(),
            ));
        }
        if wants(FCGI_MPXS_CONNS) {
            let mpxs = if self.config.max_requests_per_connection > 1 {
                b"1"
            } else {
                b"0"
            };
            values.push((FCGI_MPXS_CONNS.to_vec(), mpxs.to_vec()));
        }

        let outcome = if values.is_empty() {
            let header = RecordHeader::encode(FCGI_GET_VALUES_RESULT, FCGI_NULL_REQUEST_ID, 0, 0);
            self.send.send_bytes(&header, self.config.write_timeout)
        } else {
            // The three known values always fit one record.
            let encoded = encode_nv_pairs(&values, FCGI_GET_VALUES_RESULT, FCGI_NULL_REQUEST_ID, 0);
            self.send.send_plan(&encoded.plan, self.config.write_timeout)
        };
        self.after_send(outcome);
    }

    fn begin_request(&mut self, header: &RecordHeader, body: &[u8]) {
        let key = self.key(header);
        // Content length 8 was checked when the header was assessed.
        let role = u16::from_be_bytes([body[0], body[1]]);
        let keep_conn = body[2] & FCGI_KEEP_CONN != 0;
        let abort_status = self.config.app_status_on_abort;

        if role != self.config.role.id() {
            log::debug!(
                "rejecting request {} on connection {}: role {role} is not served",
                key.fcgi_id,
                key.conn
            );
            self.send_end_request(key.fcgi_id, abort_status, ProtocolStatus::UnknownRole);
            return;
        }

        let at_limit = lock_shared(self.shared).store.count(self.conn)
            >= self.config.max_requests_per_connection;
        if at_limit {
            let status = if self.config.max_requests_per_connection == 1 {
                ProtocolStatus::CantMultiplex
            } else {
                ProtocolStatus::Overloaded
            };
            self.send_end_request(key.fcgi_id, abort_status, status);
            return;
        }

        if self.overload {
            self.send_end_request(key.fcgi_id, abort_status, ProtocolStatus::Overloaded);
            return;
        }

        let mut shared = lock_shared(self.shared);
        if let Err(e) = shared.store.insert(key, RequestEntry::new(role, keep_conn)) {
            shared.corrupt = true;
            log::error!(error:err = e; "request store rejected a new request; interface is corrupt");
        }
    }

    fn abort_request(&mut self, header: &RecordHeader, ready: &mut Vec<RequestKey>) {
        let key = self.key(header);
        {
            let mut shared = lock_shared(self.shared);
            let Some(phase) = shared.store.get(key).map(|entry| entry.phase) else {
                // The request raced with its own completion.
                return;
            };
            match phase {
                RequestPhase::Assigned => {
                    if let Some(entry) = shared.store.get_mut(key) {
                        entry.client_abort = true;
                    }
                    return;
                }
                RequestPhase::Pending => {
                    if let Err(e) = shared.store.remove(key) {
                        shared.corrupt = true;
                        log::error!(error:err = e; "request removal failed; interface is corrupt");
                        return;
                    }
                    // The request may have become ready earlier in this
                    // same read batch.
                    ready.retain(|&ready_key| ready_key != key);
                }
            }
        }
        self.send_end_request(
            key.fcgi_id,
            self.config.app_status_on_abort,
            ProtocolStatus::RequestComplete,
        );
    }

    fn close_stream(&mut self, header: &RecordHeader, ready: &mut Vec<RequestKey>) {
        let Some(kind) = stream_kind(header.rtype) else { return };
        let key = self.key(header);
        let mut shared = lock_shared(self.shared);
        let Some(entry) = shared.store.get_mut(key) else { return };

        entry.close_stream(kind);
        if !entry.check_completion() {
            return;
        }
        if entry.process_params() {
            ready.push(key);
        } else {
            log::debug!(
                "rejecting request {} on connection {}: malformed or conflicting PARAMS",
                key.fcgi_id,
                key.conn
            );
            if let Err(e) = shared.store.remove(key) {
                shared.corrupt = true;
                log::error!(error:err = e; "request removal failed; interface is corrupt");
            }
        }
    }
}

impl RecordSink for Ingest<'_> {
    fn assess(&mut self, header: &RecordHeader) -> ContentRoute {
        if header.request_id == FCGI_NULL_REQUEST_ID {
            // Management records are always accepted.
            return ContentRoute::Local;
        }
        let key = self.key(header);
        let shared = lock_shared(self.shared);
        match header.rtype {
            FCGI_BEGIN_REQUEST => {
                if shared.store.contains(key) || header.content_length != 8 {
                    ContentRoute::Discard
                } else {
                    ContentRoute::Local
                }
            }
            FCGI_ABORT_REQUEST => match shared.store.get(key) {
                Some(entry) if !entry.client_abort && header.content_length == 0 => {
                    ContentRoute::Local
                }
                _ => ContentRoute::Discard,
            },
            FCGI_PARAMS | FCGI_STDIN | FCGI_DATA => {
                let kind = stream_kind(header.rtype).expect("stream record type");
                match shared.store.get(key) {
                    Some(entry) if !entry.stream_complete(kind) => ContentRoute::Stream,
                    _ => ContentRoute::Discard,
                }
            }
            _ => ContentRoute::Discard,
        }
    }

    fn append_stream(&mut self, header: &RecordHeader, chunk: &[u8]) {
        let Some(kind) = stream_kind(header.rtype) else { return };
        let key = self.key(header);
        let mut shared = lock_shared(self.shared);
        if let Some(entry) = shared.store.get_mut(key) {
            entry.append_stream(kind, chunk);
        }
    }

    fn finish_record(
        &mut self,
        header: &RecordHeader,
        local: Vec<u8>,
        ready: &mut Vec<RequestKey>,
    ) {
        if header.request_id == FCGI_NULL_REQUEST_ID {
            match header.rtype {
                FCGI_GET_VALUES => self.send_get_values_result(&local),
                other => self.send_unknown_type(other),
            }
            return;
        }
        match header.rtype {
            FCGI_BEGIN_REQUEST => self.begin_request(header, &local),
            FCGI_ABORT_REQUEST => self.abort_request(header, ready),
            FCGI_PARAMS | FCGI_STDIN | FCGI_DATA if header.content_length == 0 => {
                self.close_stream(header, ready)
            }
            // Non-empty stream records already routed their content.
            _ => {}
        }
    }
}

fn stream_kind(rtype: u8) -> Option<StreamKind> {
    match rtype {
        FCGI_PARAMS => Some(StreamKind::Params),
        FCGI_STDIN => Some(StreamKind::Stdin),
        FCGI_DATA => Some(StreamKind::Data),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn allowlist_parsing_normalizes_and_filters() {
        assert_matches!(parse_allowlist(None), Ok(None));
        assert_matches!(parse_allowlist(Some("")), Ok(None));
        assert_matches!(parse_allowlist(Some("  ,  ")), Ok(None));

        let allowed = parse_allowlist(Some("127.0.0.1, ::1,10.0.0.7"))
            .unwrap()
            .unwrap();
        assert_eq!(allowed.len(), 3);
        assert!(allowed.contains(&"127.0.0.1".parse::<IpAddr>().unwrap()));
        // Textual variants of one address normalize to the same value.
        assert!(allowed.contains(&"0:0:0:0:0:0:0:1".parse::<IpAddr>().unwrap()));

        assert_matches!(
            parse_allowlist(Some("127.0.0.1,not-an-address")),
            Err(InterfaceError::InvalidAddressList(text)) if text == "not-an-address"
        );
    }

    #[test]
    fn config_defaults() {
        let config = InterfaceConfig::new(10, 100);
        assert_eq!(config.max_connections, 10);
        assert_eq!(config.max_requests_per_connection, 100);
        assert_eq!(config.app_status_on_abort, 1);
        assert_eq!(config.role, Role::Responder);
        assert_eq!(config.write_timeout, Duration::from_secs(300));

        let config = InterfaceConfig::new(1, 1)
            .role(Role::Authorizer)
            .app_status_on_abort(7)
            .write_timeout(Duration::from_secs(5));
        assert_eq!(config.role, Role::Authorizer);
        assert_eq!(config.app_status_on_abort, 7);
        assert_eq!(config.write_timeout, Duration::from_secs(5));
    }
}
