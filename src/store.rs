//! In-flight request bookkeeping.
//!
//! Requests live here from the receipt of their FCGI_BEGIN_REQUEST record
//! until their terminal FCGI_END_REQUEST is sent (or their connection is
//! torn down). The store also maintains a per-connection active-request
//! count in lockstep with insertions and removals; the two going out of
//! sync is unrecoverable and reported as a [`StoreError`].

use crate::codec::decode_nv_pairs;
use crate::error::StoreError;
use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::ops::Bound;
use std::os::fd::RawFd;

/// Identifier of a connection tracked by the interface
pub type ConnId = RawFd;

/// Key of an in-flight request: the connection it arrived on and the
/// 16-bit id the client chose for it. Id 0 never appears here; it is
/// reserved for management records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RequestKey {
    pub conn: ConnId,
    pub fcgi_id: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestPhase {
    /// The interface is still accumulating the request
    Pending,
    /// A request handle has been handed to a worker
    Assigned,
}

/// One of the three client-to-server streams of a request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Params,
    Stdin,
    Data,
}

#[derive(Debug, Default)]
struct StreamBuf {
    complete: bool,
    bytes: Vec<u8>,
}

impl StreamBuf {
    // "No records received" is distinct from "received and closed empty":
    // the former leaves `complete` unset with an empty buffer.
    fn untouched_or_complete(&self) -> bool {
        self.complete || self.bytes.is_empty()
    }
}

/// Everything the interface knows about one in-flight request
#[derive(Debug)]
pub struct RequestEntry {
    pub role: u16,
    pub keep_conn: bool,
    pub phase: RequestPhase,
    pub client_abort: bool,
    pub connection_closed: bool,
    params: StreamBuf,
    stdin: StreamBuf,
    data: StreamBuf,
    pub env: BTreeMap<Vec<u8>, Vec<u8>>,
}

impl RequestEntry {
    pub fn new(role: u16, keep_conn: bool) -> Self {
        RequestEntry {
            role,
            keep_conn,
            phase: RequestPhase::Pending,
            client_abort: false,
            connection_closed: false,
            params: StreamBuf::default(),
            stdin: StreamBuf::default(),
            data: StreamBuf::default(),
            env: BTreeMap::new(),
        }
    }

    fn stream(&mut self, kind: StreamKind) -> &mut StreamBuf {
        match kind {
            StreamKind::Params => &mut self.params,
            StreamKind::Stdin => &mut self.stdin,
            StreamKind::Data => &mut self.data,
        }
    }

    pub fn stream_complete(&self, kind: StreamKind) -> bool {
        match kind {
            StreamKind::Params => self.params.complete,
            StreamKind::Stdin => self.stdin.complete,
            StreamKind::Data => self.data.complete,
        }
    }

    pub fn append_stream(&mut self, kind: StreamKind, chunk: &[u8]) {
        self.stream(kind).bytes.extend_from_slice(chunk);
    }

    pub fn close_stream(&mut self, kind: StreamKind) {
        self.stream(kind).complete = true;
    }

    /// Checks the role's completion rule and, when it holds, marks every
    /// stream complete so stray stream records arriving later are invalid.
    ///
    /// Responder needs PARAMS and STDIN (DATA may be absent); Authorizer
    /// needs PARAMS (both others may be absent); Filter and unknown roles
    /// need all three.
    pub fn check_completion(&mut self) -> bool {
        let complete = match self.role {
            1 => {
                self.params.complete && self.stdin.complete && self.data.untouched_or_complete()
            }
            2 => {
                self.params.complete
                    && self.stdin.untouched_or_complete()
                    && self.data.untouched_or_complete()
            }
            _ => self.params.complete && self.stdin.complete && self.data.complete,
        };
        if complete {
            self.params.complete = true;
            self.stdin.complete = true;
            self.data.complete = true;
        }
        complete
    }

    /// Decodes the PARAMS byte stream into the environment map.
    ///
    /// A name defined twice with the same value is merged silently; a name
    /// defined twice with different values, or a malformed byte stream,
    /// rejects the whole request.
    pub fn process_params(&mut self) -> bool {
        let pairs = decode_nv_pairs(&self.params.bytes);
        if pairs.is_empty() && !self.params.bytes.is_empty() {
            return false;
        }
        let mut env = BTreeMap::new();
        for (name, value) in pairs {
            match env.entry(name) {
                Entry::Vacant(vacant) => {
                    vacant.insert(value);
                }
                Entry::Occupied(occupied) => {
                    if *occupied.get() != value {
                        return false;
                    }
                }
            }
        }
        self.env = env;
        true
    }

    pub fn take_stdin(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.stdin.bytes)
    }

    pub fn take_data(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.data.bytes)
    }
}

/// The request dictionary plus its per-connection active-request counts
#[derive(Debug, Default)]
pub struct RequestStore {
    map: BTreeMap<RequestKey, RequestEntry>,
    counts: BTreeMap<ConnId, usize>,
}

impl RequestStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts tracking a connection with zero active requests
    pub fn register_connection(&mut self, conn: ConnId) {
        self.counts.entry(conn).or_insert(0);
    }

    /// Stops tracking a connection. Only legal once its count is zero.
    pub fn forget_connection(&mut self, conn: ConnId) {
        debug_assert_eq!(self.counts.get(&conn).copied(), Some(0));
        self.counts.remove(&conn);
    }

    pub fn connection_known(&self, conn: ConnId) -> bool {
        self.counts.contains_key(&conn)
    }

    /// Number of active requests on `conn`
    pub fn count(&self, conn: ConnId) -> usize {
        self.counts.get(&conn).copied().unwrap_or(0)
    }

    pub fn contains(&self, key: RequestKey) -> bool {
        self.map.contains_key(&key)
    }

    pub fn get(&self, key: RequestKey) -> Option<&RequestEntry> {
        self.map.get(&key)
    }

    pub fn get_mut(&mut self, key: RequestKey) -> Option<&mut RequestEntry> {
        self.map.get_mut(&key)
    }

    /// Inserts a new pending request, incrementing its connection's count
    pub fn insert(&mut self, key: RequestKey, entry: RequestEntry) -> Result<(), StoreError> {
        if key.fcgi_id == 0 {
            return Err(StoreError::NullRequestId);
        }
        let count = self
            .counts
            .get_mut(&key.conn)
            .ok_or(StoreError::UnknownConnection)?;
        *count += 1;
        self.map.insert(key, entry);
        Ok(())
    }

    /// Removes a request, decrementing its connection's count
    pub fn remove(&mut self, key: RequestKey) -> Result<Option<RequestEntry>, StoreError> {
        let Some(entry) = self.map.remove(&key) else {
            return Ok(None);
        };
        let count = self
            .counts
            .get_mut(&key.conn)
            .ok_or(StoreError::UnknownConnection)?;
        if *count == 0 {
            return Err(StoreError::CountUnderflow);
        }
        *count -= 1;
        Ok(Some(entry))
    }

    /// Keys of every request on `conn`
    pub fn keys_for(&self, conn: ConnId) -> Vec<RequestKey> {
        self.map
            .range((
                Bound::Included(RequestKey { conn, fcgi_id: 0 }),
                Bound::Included(RequestKey {
                    conn,
                    fcgi_id: u16::MAX,
                }),
            ))
            .map(|(key, _)| *key)
            .collect()
    }

    /// The connection-closure sweep: pending requests are erased, assigned
    /// requests are marked closed-by-interface and aborted but stay until
    /// their handles let go. Returns whether any assigned requests remain.
    pub fn close_connection_requests(&mut self, conn: ConnId) -> Result<bool, StoreError> {
        let mut assigned_remain = false;
        for key in self.keys_for(conn) {
            let phase = self.map.get(&key).map(|entry| entry.phase);
            match phase {
                Some(RequestPhase::Pending) => {
                    self.remove(key)?;
                }
                Some(RequestPhase::Assigned) => {
                    let entry = self.map.get_mut(&key).expect("key was just listed");
                    entry.connection_closed = true;
                    entry.client_abort = true;
                    assigned_remain = true;
                }
                None => {}
            }
        }
        Ok(assigned_remain)
    }

    #[cfg(test)]
    fn check_count_invariant(&self) -> bool {
        self.counts.iter().all(|(&conn, &count)| {
            self.map.keys().filter(|key| key.conn == conn).count() == count
        }) && self.map.keys().all(|key| {
            key.fcgi_id != 0 && self.counts.contains_key(&key.conn)
        })
    }
}
