//! Shared harness for the end-to-end tests: a blocking FastCGI test
//! client built on the public codec, and a runner that drives an
//! interface on its own thread with a worker pool, the way an application
//! embedding the runtime would.
#![allow(dead_code)]

use bufstream::BufStream;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{channel, Sender};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use switchboard::codec::{encode_nv_pairs, partition_stream, RecordHeader};
use switchboard::protocol::*;
use switchboard::{
    FcgiInterface, FcgiRequest, InterfaceConfig, InterfaceError, RequestIdAllocator,
};

// At most one interface may exist per process, so every test that starts
// one holds this gate for the server's lifetime.
static SERVER_GATE: OnceLock<Mutex<()>> = OnceLock::new();

pub fn server_gate() -> MutexGuard<'static, ()> {
    match SERVER_GATE.get_or_init(|| Mutex::new(())).lock() {
        Ok(guard) => guard,
        // A previous test failed while holding the gate; the interface it
        // held is gone, so the gate itself is fine.
        Err(poisoned) => poisoned.into_inner(),
    }
}

pub fn wait_until(mut condition: impl FnMut() -> bool, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    false
}

enum Command {
    SetOverload(bool),
}

/// An interface running on its own thread, handing requests to a pool
pub struct Server {
    pub address: SocketAddr,
    thread: JoinHandle<(FcgiInterface, Vec<InterfaceError>)>,
    stop: Arc<AtomicBool>,
    commands: Sender<Command>,
    _gate: MutexGuard<'static, ()>,
}

impl Server {
    pub fn start<W>(config: InterfaceConfig, worker: W) -> Server
    where
        W: Fn(FcgiRequest) + Send + Sync + 'static,
    {
        let gate = server_gate();
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let address = listener.local_addr().unwrap();
        let mut interface = FcgiInterface::new(listener, config).unwrap();

        let stop = Arc::new(AtomicBool::new(false));
        let (commands, command_queue) = channel();
        let worker = Arc::new(worker);

        let thread = std::thread::spawn({
            let stop = Arc::clone(&stop);
            move || {
                let pool = threadpool::Builder::new().num_threads(4).build();
                let mut errors = Vec::new();
                while !stop.load(Ordering::SeqCst) {
                    while let Ok(Command::SetOverload(overload)) = command_queue.try_recv() {
                        interface.set_overload(overload);
                    }
                    match interface.accept_requests() {
                        Ok(batch) => {
                            for request in batch {
                                let worker = Arc::clone(&worker);
                                pool.execute(move || worker(request));
                            }
                        }
                        Err(e) => {
                            errors.push(e);
                            break;
                        }
                    }
                }
                pool.join();
                (interface, errors)
            }
        });

        Server {
            address,
            thread,
            stop,
            commands,
            _gate: gate,
        }
    }

    /// Applies an overload change on the interface thread
    pub fn set_overload(&self, overload: bool) {
        self.commands.send(Command::SetOverload(overload)).unwrap();
        self.kick();
        // Give the interface thread a moment to pick the command up.
        std::thread::sleep(Duration::from_millis(50));
    }

    // Unblocks the poller with a throwaway connection.
    fn kick(&self) {
        let _ = TcpStream::connect(self.address);
    }

    /// Stops the loop and returns the interface for final assertions
    pub fn stop(self) -> FcgiInterface {
        self.stop.store(true, Ordering::SeqCst);
        self.kick();
        let (interface, errors) = self.thread.join().unwrap();
        assert!(errors.is_empty(), "interface reported errors: {errors:?}");
        interface
    }
}

/// A blocking FastCGI client, one connection per instance
pub struct TestClient {
    stream: BufStream<TcpStream>,
    pub ids: RequestIdAllocator,
}

impl TestClient {
    pub fn connect(address: SocketAddr) -> TestClient {
        let stream = TcpStream::connect(address).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(10)))
            .unwrap();
        TestClient {
            stream: BufStream::new(stream),
            ids: RequestIdAllocator::new(),
        }
    }

    /// Starts a request under a freshly allocated id
    pub fn begin_request(&mut self, role: u16, keep_conn: bool) -> u16 {
        let id = self.ids.allocate().unwrap();
        self.begin_request_with_id(id, role, keep_conn);
        id
    }

    pub fn begin_request_with_id(&mut self, id: u16, role: u16, keep_conn: bool) {
        let role_bytes = role.to_be_bytes();
        let body = [
            role_bytes[0],
            role_bytes[1],
            keep_conn as u8,
            0,
            0,
            0,
            0,
            0,
        ];
        self.send_record(FCGI_BEGIN_REQUEST, id, &body);
    }

    /// Writes a single record with 8-byte alignment padding
    pub fn send_record(&mut self, rtype: u8, id: u16, content: &[u8]) {
        let padding = (8 - content.len() % 8) % 8;
        self.stream
            .write_all(&RecordHeader::encode(
                rtype,
                id,
                content.len() as u16,
                padding as u8,
            ))
            .unwrap();
        self.stream.write_all(content).unwrap();
        self.stream.write_all(&vec![0u8; padding]).unwrap();
        self.stream.flush().unwrap();
    }

    /// Sends a PARAMS payload (without the closing record)
    pub fn send_params(&mut self, id: u16, pairs: &[(&[u8], &[u8])]) {
        let owned: Vec<(Vec<u8>, Vec<u8>)> = pairs
            .iter()
            .map(|(name, value)| (name.to_vec(), value.to_vec()))
            .collect();
        let encoded = encode_nv_pairs(&owned, FCGI_PARAMS, id, 0);
        assert!(encoded.finished(owned.len()));
        self.stream.write_all(&encoded.plan.to_bytes()).unwrap();
        self.stream.flush().unwrap();
    }

    /// Sends stream content, fragmented exactly as the runtime would
    pub fn send_stream(&mut self, rtype: u8, id: u16, bytes: &[u8]) {
        let plan = partition_stream(bytes, rtype, id);
        self.stream.write_all(&plan.to_bytes()).unwrap();
        self.stream.flush().unwrap();
    }

    /// Closes a stream with its empty terminal record
    pub fn close_stream(&mut self, rtype: u8, id: u16) {
        self.send_stream(rtype, id, b"");
    }

    pub fn abort_request(&mut self, id: u16) {
        self.send_record(FCGI_ABORT_REQUEST, id, b"");
    }

    pub fn get_values(&mut self, names: &[&[u8]]) {
        if names.is_empty() {
            self.send_record(FCGI_GET_VALUES, FCGI_NULL_REQUEST_ID, b"");
            return;
        }
        let pairs: Vec<(Vec<u8>, Vec<u8>)> = names
            .iter()
            .map(|name| (name.to_vec(), Vec::new()))
            .collect();
        let encoded = encode_nv_pairs(&pairs, FCGI_GET_VALUES, FCGI_NULL_REQUEST_ID, 0);
        self.stream.write_all(&encoded.plan.to_bytes()).unwrap();
        self.stream.flush().unwrap();
    }

    /// Reads one record, panicking on EOF
    pub fn read_record(&mut self) -> (RecordHeader, Vec<u8>) {
        self.try_read_record().expect("peer closed the connection")
    }

    /// Reads one record; `None` once the peer has closed the connection
    pub fn try_read_record(&mut self) -> Option<(RecordHeader, Vec<u8>)> {
        let mut header_bytes = [0u8; 8];
        if let Err(e) = self.stream.read_exact(&mut header_bytes) {
            assert!(
                matches!(
                    e.kind(),
                    std::io::ErrorKind::UnexpectedEof | std::io::ErrorKind::ConnectionReset
                ),
                "unexpected read failure: {e}"
            );
            return None;
        }
        let header = RecordHeader::decode(&header_bytes);
        let mut content = vec![0u8; header.content_length as usize];
        self.stream.read_exact(&mut content).unwrap();
        let mut padding = vec![0u8; header.padding_length as usize];
        self.stream.read_exact(&mut padding).unwrap();
        Some((header, content))
    }

    /// Asserts the next record is `END_REQUEST` for `id` and returns its
    /// application and protocol statuses
    pub fn expect_end_request(&mut self, id: u16) -> (i32, u8) {
        let (header, content) = self.read_record();
        assert_eq!(header.rtype, FCGI_END_REQUEST, "expected END_REQUEST");
        assert_eq!(header.request_id, id);
        assert_eq!(content.len(), 8);
        let app_status = i32::from_be_bytes([content[0], content[1], content[2], content[3]]);
        (app_status, content[4])
    }

    /// Asserts the next two records close the STDOUT and STDERR streams
    pub fn expect_stream_closures(&mut self, id: u16) {
        let (header, content) = self.read_record();
        assert_eq!((header.rtype, header.request_id), (FCGI_STDOUT, id));
        assert!(content.is_empty(), "expected empty terminal STDOUT");
        let (header, content) = self.read_record();
        assert_eq!((header.rtype, header.request_id), (FCGI_STDERR, id));
        assert!(content.is_empty(), "expected empty terminal STDERR");
    }
}

/// A worker body's observations, collected for assertions on the test
/// thread (panics inside pool threads would otherwise vanish)
#[derive(Default)]
pub struct Observations {
    inner: Mutex<Vec<String>>,
}

impl Observations {
    pub fn note(&self, observation: impl Into<String>) {
        self.inner.lock().unwrap().push(observation.into());
    }

    pub fn take(&self) -> Vec<String> {
        std::mem::take(&mut *self.inner.lock().unwrap())
    }
}
