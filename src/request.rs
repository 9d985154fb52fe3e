//! The worker-facing request handle.
//!
//! An [`FcgiRequest`] is produced by the interface once a request has been
//! received in full, and is the only object a worker thread needs: it
//! carries the request's environment and input streams, and writes the
//! response back over the originating connection without any explicit
//! synchronization with the interface thread.
//!
//! A handle never touches interface state it cannot prove is its own:
//! every mutating operation re-checks the interface generation captured at
//! construction, re-resolves its store entry under the interface lock, and
//! becomes a permanent no-op the moment any check fails.

use crate::codec::{self, partition_stream, RecordHeader};
use crate::connection::{SendChannel, SendOutcome};
use crate::interface::{lock_shared, SharedState};
use crate::protocol::*;
use crate::store::RequestKey;
use mio::Waker;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// One FastCGI request, owned by one worker at a time.
///
/// Writes return `false` once the request is completed, the connection is
/// gone, or the interface has been destroyed; workers are expected to
/// abandon a request when its writes start failing. Dropping a handle
/// without calling [`complete`](Self::complete) is permitted: interface
/// bookkeeping is maintained, but the peer never receives terminal
/// records.
#[derive(Debug)]
pub struct FcgiRequest {
    shared: Arc<Mutex<SharedState>>,
    send: Arc<SendChannel>,
    waker: Arc<Waker>,
    interface_id: u64,
    key: RequestKey,
    role: Role,
    keep_conn: bool,
    env: BTreeMap<Vec<u8>, Vec<u8>>,
    stdin: Vec<u8>,
    data: Vec<u8>,
    write_timeout: Duration,
    completed: bool,
    // Local abort verdict, set when a write or validity check fails, so
    // abort_status converges with failing writes even after the handle
    // has entered its terminal state.
    aborted: bool,
}

impl FcgiRequest {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        shared: Arc<Mutex<SharedState>>,
        send: Arc<SendChannel>,
        waker: Arc<Waker>,
        interface_id: u64,
        key: RequestKey,
        role: Role,
        keep_conn: bool,
        env: BTreeMap<Vec<u8>, Vec<u8>>,
        stdin: Vec<u8>,
        data: Vec<u8>,
        write_timeout: Duration,
    ) -> Self {
        FcgiRequest {
            shared,
            send,
            waker,
            interface_id,
            key,
            role,
            keep_conn,
            env,
            stdin,
            data,
            write_timeout,
            completed: false,
            aborted: false,
        }
    }

    /// The role the client requested
    pub fn role(&self) -> Role {
        self.role
    }

    /// Value of the `KEEP_CONN` flag from the request's `BEGIN_REQUEST`
    /// record. When false, completing the request closes its connection.
    pub fn keep_conn(&self) -> bool {
        self.keep_conn
    }

    /// The identifier of this request: its connection and FastCGI id
    pub fn request_key(&self) -> RequestKey {
        self.key
    }

    /// The FastCGI id the client assigned to this request
    pub fn request_id(&self) -> u16 {
        self.key.fcgi_id
    }

    /// The environment variables decoded from the PARAMS stream
    pub fn environment(&self) -> &BTreeMap<Vec<u8>, Vec<u8>> {
        &self.env
    }

    /// Looks up an environment variable whose value is valid UTF-8
    pub fn env_str(&self, name: &str) -> Option<&str> {
        self.env
            .get(name.as_bytes())
            .and_then(|value| std::str::from_utf8(value).ok())
    }

    /// The request body received on the STDIN stream
    pub fn stdin(&self) -> &[u8] {
        &self.stdin
    }

    /// The bytes received on the DATA stream (Filter role)
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// True once the request has been completed (or has failed
    /// permanently); all further operations are no-ops
    pub fn completed(&self) -> bool {
        self.completed
    }

    /// Reports whether the request has been aborted, either by an
    /// `ABORT_REQUEST` record from the peer or by the interface closing
    /// the connection. Only meaningful between assignment and completion.
    pub fn abort_status(&self) -> bool {
        if self.aborted {
            return true;
        }
        if self.completed {
            return false;
        }
        let shared = lock_shared(&self.shared);
        if shared.interface_id != self.interface_id || shared.corrupt {
            // No response can ever be delivered; report the request as
            // aborted so polling workers converge with failing writes.
            return true;
        }
        match shared.store.get(self.key) {
            Some(entry) => entry.client_abort || entry.connection_closed,
            None => false,
        }
    }

    /// Sends `bytes` on the STDOUT stream.
    ///
    /// Empty input is a no-op returning `true`; the stream is closed by
    /// [`complete`](Self::complete), not by empty writes. Returns `false`
    /// if the request is over, the connection was lost or corrupted, or
    /// the write stayed blocked past the configured timeout.
    pub fn write_stdout(&mut self, bytes: &[u8]) -> bool {
        self.write_stream(FCGI_STDOUT, bytes)
    }

    /// As [`write_stdout`](Self::write_stdout), for the STDERR stream
    pub fn write_stderr(&mut self, bytes: &[u8]) -> bool {
        self.write_stream(FCGI_STDERR, bytes)
    }

    /// Finishes the response: closes the STDOUT and STDERR streams and
    /// sends `END_REQUEST` with the given application status and a
    /// protocol status of `REQUEST_COMPLETE`.
    ///
    /// If `keep_conn` was false the connection is queued for closure and
    /// the interface performs the close on its next pass. Idempotent:
    /// repeated calls return `false` and transmit nothing.
    pub fn complete(&mut self, app_status: i32) -> bool {
        self.end_request(app_status, ProtocolStatus::RequestComplete)
    }

    /// As [`complete`](Self::complete), but reports to the peer that this
    /// application does not implement the request's role
    /// (protocol status `UNKNOWN_ROLE`)
    pub fn reject_role(&mut self, app_status: i32) -> bool {
        self.end_request(app_status, ProtocolStatus::UnknownRole)
    }

    fn write_stream(&mut self, rtype: u8, bytes: &[u8]) -> bool {
        if self.completed || !self.connection_usable() {
            return false;
        }
        if bytes.is_empty() {
            return true;
        }
        let plan = partition_stream(bytes, rtype, self.key.fcgi_id);
        match self.send.send_plan(&plan, self.write_timeout) {
            SendOutcome::Sent => true,
            _ => {
                self.fail_connection();
                false
            }
        }
    }

    fn end_request(&mut self, app_status: i32, status: ProtocolStatus) -> bool {
        if self.completed {
            return false;
        }
        if !self.connection_usable() {
            // Nothing can be sent, but the entry must not linger.
            self.retire_entry(false);
            return false;
        }

        // Both stream closures and the terminal record go out in one
        // locked write, so nothing can interleave inside them.
        let id = self.key.fcgi_id;
        let mut terminal = [0u8; 32];
        terminal[..8].copy_from_slice(&RecordHeader::encode(FCGI_STDOUT, id, 0, 0));
        terminal[8..16].copy_from_slice(&RecordHeader::encode(FCGI_STDERR, id, 0, 0));
        terminal[16..24].copy_from_slice(&RecordHeader::encode(FCGI_END_REQUEST, id, 8, 0));
        terminal[24..].copy_from_slice(&codec::end_request_body(app_status, status.id()));

        match self.send.send_bytes(&terminal, self.write_timeout) {
            SendOutcome::Sent => {
                self.retire_entry(!self.keep_conn);
                true
            }
            _ => {
                self.fail_connection();
                self.retire_entry(false);
                false
            }
        }
    }

    // The validity check at the head of every write path: the interface
    // generation must match, the interface must be intact, and the
    // connection must still be open. Failure completes the handle; when
    // the connection was closed under it, the abort bit is set so pollers
    // of abort_status converge with the failed write.
    fn connection_usable(&mut self) -> bool {
        let mut shared = lock_shared(&self.shared);
        if shared.interface_id != self.interface_id || shared.corrupt {
            drop(shared);
            self.completed = true;
            self.aborted = true;
            return false;
        }
        match shared.store.get_mut(self.key) {
            Some(entry) if !entry.connection_closed => true,
            Some(entry) => {
                entry.client_abort = true;
                drop(shared);
                self.completed = true;
                self.aborted = true;
                false
            }
            None => {
                drop(shared);
                self.completed = true;
                self.aborted = true;
                false
            }
        }
    }

    // A write died under this handle. Mark the request aborted and ask the
    // interface to tear the connection down.
    fn fail_connection(&mut self) {
        self.completed = true;
        self.aborted = true;
        let mut shared = lock_shared(&self.shared);
        if shared.interface_id != self.interface_id {
            return;
        }
        if let Some(entry) = shared.store.get_mut(self.key) {
            entry.client_abort = true;
        }
        if !shared.dummies.contains(&self.key.conn) {
            shared.closure_requests.insert(self.key.conn);
        }
        drop(shared);
        let _ = self.waker.wake();
    }

    // Removes this request's store entry and optionally queues its
    // connection for closure, waking the acceptor when anything needs its
    // attention.
    fn retire_entry(&mut self, queue_closure: bool) {
        self.completed = true;
        let mut shared = lock_shared(&self.shared);
        if shared.interface_id != self.interface_id {
            return;
        }
        let mut wake = false;
        match shared.store.remove(self.key) {
            // The last request of a dummy connection lets its pinned
            // descriptor be reaped.
            Ok(Some(_)) => wake = shared.dummies.contains(&self.key.conn),
            Ok(None) => {}
            Err(e) => {
                shared.corrupt = true;
                log::error!(error:err = e; "request removal failed; interface is corrupt");
            }
        }
        if queue_closure && !shared.dummies.contains(&self.key.conn) {
            shared.closure_requests.insert(self.key.conn);
            wake = true;
        }
        drop(shared);
        if wake {
            let _ = self.waker.wake();
        }
    }
}

impl Drop for FcgiRequest {
    // Destruction without completion maintains interface bookkeeping but
    // sends nothing: the peer never sees terminal records. Non-keep-alive
    // connections are still queued for closure.
    fn drop(&mut self) {
        let queue_closure = !self.completed && !self.keep_conn;
        self.retire_entry(queue_closure);
    }
}
