//! Per-connection record assembly.
//!
//! A [`RecordAssembler`] turns the raw byte stream of one connection back
//! into FastCGI records. It only understands framing; every protocol
//! decision (is this record valid right now, where does its content go,
//! what happens when it completes) is delegated to a [`RecordSink`], which
//! the interface implements against its shared state. That split keeps the
//! state machine testable without sockets.

use crate::codec::{RecordHeader, HEADER_LEN};
use crate::protocol::FCGI_VERSION_1;
use crate::store::RequestKey;
use std::io::{self, Read};

/// Where the content bytes of an accepted record are routed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentRoute {
    /// Materialized in the assembler's local buffer (management records
    /// and FCGI_BEGIN_REQUEST, which have no request entry to land in)
    Local,
    /// Appended directly to the request entry's stream buffer
    Stream,
    /// The record is invalid; its content and padding are discarded
    Discard,
}

/// Protocol decisions the assembler defers to its owner
pub trait RecordSink {
    /// Classifies a record whose header just completed
    fn assess(&mut self, header: &RecordHeader) -> ContentRoute;

    /// Receives a chunk of stream content for a [`ContentRoute::Stream`] record
    fn append_stream(&mut self, header: &RecordHeader, chunk: &[u8]);

    /// Acts on a completed, accepted record. `local` holds the content of
    /// [`ContentRoute::Local`] records and is empty otherwise. Requests
    /// that became ready for assignment are pushed onto (or, for aborts,
    /// removed from) `ready`.
    fn finish_record(&mut self, header: &RecordHeader, local: Vec<u8>, ready: &mut Vec<RequestKey>);
}

/// Why a read loop stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadStatus {
    /// The source would block; the connection stays in the ingest set
    WouldBlock,
    /// The peer closed its end
    Closed,
}

/// The receive state machine of a single connection
#[derive(Debug)]
pub struct RecordAssembler {
    header_buf: [u8; HEADER_LEN],
    header_fill: usize,
    header: Option<RecordHeader>,
    route: ContentRoute,
    content_remaining: usize,
    padding_remaining: usize,
    local: Vec<u8>,
}

impl RecordAssembler {
    pub fn new() -> Self {
        RecordAssembler {
            header_buf: [0; HEADER_LEN],
            header_fill: 0,
            header: None,
            route: ContentRoute::Discard,
            content_remaining: 0,
            padding_remaining: 0,
            local: Vec::new(),
        }
    }

    /// Reads from `source` until it would block or reports EOF, feeding
    /// every received byte through the record state machine.
    pub fn read_records(
        &mut self,
        mut source: impl Read,
        sink: &mut impl RecordSink,
        ready: &mut Vec<RequestKey>,
    ) -> io::Result<ReadStatus> {
        let mut buf = [0u8; 8192];
        loop {
            match source.read(&mut buf) {
                Ok(0) => return Ok(ReadStatus::Closed),
                Ok(n) => self.feed(&buf[..n], sink, ready),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return Ok(ReadStatus::WouldBlock)
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// Advances the state machine over a chunk of received bytes
    pub fn feed(
        &mut self,
        mut bytes: &[u8],
        sink: &mut impl RecordSink,
        ready: &mut Vec<RequestKey>,
    ) {
        while !bytes.is_empty() {
            if self.header.is_none() {
                let take = (HEADER_LEN - self.header_fill).min(bytes.len());
                self.header_buf[self.header_fill..self.header_fill + take]
                    .copy_from_slice(&bytes[..take]);
                self.header_fill += take;
                bytes = &bytes[take..];

                if self.header_fill == HEADER_LEN {
                    let header = RecordHeader::decode(&self.header_buf);
                    self.content_remaining = header.content_length as usize;
                    self.padding_remaining = header.padding_length as usize;
                    self.route = if header.version == FCGI_VERSION_1 {
                        sink.assess(&header)
                    } else {
                        ContentRoute::Discard
                    };
                    self.header = Some(header);
                    self.finish_if_complete(sink, ready);
                }
                continue;
            }

            if self.content_remaining > 0 {
                let take = self.content_remaining.min(bytes.len());
                match self.route {
                    ContentRoute::Local => self.local.extend_from_slice(&bytes[..take]),
                    ContentRoute::Stream => {
                        let header = self.header.expect("content implies a header");
                        sink.append_stream(&header, &bytes[..take]);
                    }
                    ContentRoute::Discard => {}
                }
                self.content_remaining -= take;
                bytes = &bytes[take..];
                self.finish_if_complete(sink, ready);
                continue;
            }

            let take = self.padding_remaining.min(bytes.len());
            self.padding_remaining -= take;
            bytes = &bytes[take..];
            self.finish_if_complete(sink, ready);
        }
    }

    fn finish_if_complete(&mut self, sink: &mut impl RecordSink, ready: &mut Vec<RequestKey>) {
        if self.header.is_none() || self.content_remaining > 0 || self.padding_remaining > 0 {
            return;
        }
        let header = self.header.take().expect("record is in progress");
        let local = std::mem::take(&mut self.local);
        self.header_fill = 0;
        if self.route != ContentRoute::Discard {
            sink.finish_record(&header, local, ready);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::RecordHeader;
    use crate::protocol::*;
    use assert_matches::assert_matches;
    use std::collections::VecDeque;

    #[derive(Debug, PartialEq)]
    enum Call {
        Assessed(u8, u16, u16),
        Appended(u8, u16, Vec<u8>),
        Finished(u8, u16, Vec<u8>),
    }

    // A sink that records every delegation and classifies by a fixed rule:
    // management and BEGIN_REQUEST are Local, streams are Stream, and any
    // type in `reject` is Discard.
    struct Recorder {
        calls: Vec<Call>,
        reject: Vec<u8>,
    }

    impl Recorder {
        fn new() -> Self {
            Recorder {
                calls: Vec::new(),
                reject: Vec::new(),
            }
        }
    }

    impl RecordSink for Recorder {
        fn assess(&mut self, header: &RecordHeader) -> ContentRoute {
            self.calls.push(Call::Assessed(
                header.rtype,
                header.request_id,
                header.content_length,
            ));
            if self.reject.contains(&header.rtype) {
                ContentRoute::Discard
            } else if header.request_id == FCGI_NULL_REQUEST_ID
                || header.rtype == FCGI_BEGIN_REQUEST
            {
                ContentRoute::Local
            } else {
                ContentRoute::Stream
            }
        }

        fn append_stream(&mut self, header: &RecordHeader, chunk: &[u8]) {
            self.calls.push(Call::Appended(
                header.rtype,
                header.request_id,
                chunk.to_vec(),
            ));
        }

        fn finish_record(
            &mut self,
            header: &RecordHeader,
            local: Vec<u8>,
            _ready: &mut Vec<RequestKey>,
        ) {
            self.calls
                .push(Call::Finished(header.rtype, header.request_id, local));
        }
    }

    fn record_bytes(rtype: u8, request_id: u16, content: &[u8], padding: u8) -> Vec<u8> {
        let mut out =
            RecordHeader::encode(rtype, request_id, content.len() as u16, padding).to_vec();
        out.extend_from_slice(content);
        out.extend_from_slice(&vec![0u8; padding as usize]);
        out
    }

    #[test]
    fn local_records_accumulate_in_the_local_buffer() {
        let mut assembler = RecordAssembler::new();
        let mut sink = Recorder::new();
        let mut ready = Vec::new();

        let body = [0, 1, 0, 0, 0, 0, 0, 0];
        assembler.feed(
            &record_bytes(FCGI_BEGIN_REQUEST, 7, &body, 0),
            &mut sink,
            &mut ready,
        );

        assert_eq!(
            sink.calls,
            vec![
                Call::Assessed(FCGI_BEGIN_REQUEST, 7, 8),
                Call::Finished(FCGI_BEGIN_REQUEST, 7, body.to_vec()),
            ]
        );
    }

    #[test]
    fn stream_content_is_routed_without_buffering() {
        let mut assembler = RecordAssembler::new();
        let mut sink = Recorder::new();
        let mut ready = Vec::new();

        assembler.feed(
            &record_bytes(FCGI_STDIN, 3, b"hello", 3),
            &mut sink,
            &mut ready,
        );

        assert_eq!(
            sink.calls,
            vec![
                Call::Assessed(FCGI_STDIN, 3, 5),
                Call::Appended(FCGI_STDIN, 3, b"hello".to_vec()),
                Call::Finished(FCGI_STDIN, 3, vec![]),
            ]
        );
    }

    #[test]
    fn byte_at_a_time_delivery_produces_the_same_events() {
        let mut wire = record_bytes(FCGI_STDIN, 3, b"split", 3);
        wire.extend_from_slice(&record_bytes(FCGI_PARAMS, 3, b"", 0));

        let mut assembler = RecordAssembler::new();
        let mut sink = Recorder::new();
        let mut ready = Vec::new();
        for byte in wire {
            assembler.feed(&[byte], &mut sink, &mut ready);
        }

        // Stream content arrives in single-byte chunks when delivered that
        // way; what matters is the reassembled sequence and the terminal
        // events.
        let appended: Vec<u8> = sink
            .calls
            .iter()
            .filter_map(|c| match c {
                Call::Appended(FCGI_STDIN, 3, chunk) => Some(chunk.clone()),
                _ => None,
            })
            .flatten()
            .collect();
        assert_eq!(appended, b"split");
        assert_matches!(
            sink.calls.last(),
            Some(Call::Finished(FCGI_PARAMS, 3, local)) if local.is_empty()
        );
    }

    #[test]
    fn rejected_records_are_consumed_and_silenced() {
        let mut assembler = RecordAssembler::new();
        let mut sink = Recorder::new();
        sink.reject.push(FCGI_STDOUT);
        let mut ready = Vec::new();

        let mut wire = record_bytes(FCGI_STDOUT, 5, b"should vanish", 3);
        wire.extend_from_slice(&record_bytes(FCGI_STDIN, 5, b"kept", 4));
        assembler.feed(&wire, &mut sink, &mut ready);

        assert_eq!(
            sink.calls,
            vec![
                Call::Assessed(FCGI_STDOUT, 5, 13),
                Call::Assessed(FCGI_STDIN, 5, 4),
                Call::Appended(FCGI_STDIN, 5, b"kept".to_vec()),
                Call::Finished(FCGI_STDIN, 5, vec![]),
            ]
        );
    }

    #[test]
    fn wrong_version_records_are_discarded_without_assessment() {
        let mut assembler = RecordAssembler::new();
        let mut sink = Recorder::new();
        let mut ready = Vec::new();

        let mut wire = record_bytes(FCGI_STDIN, 1, b"xx", 6);
        wire[0] = 9;
        wire.extend_from_slice(&record_bytes(FCGI_ABORT_REQUEST, 1, b"", 0));
        assembler.feed(&wire, &mut sink, &mut ready);

        assert_eq!(
            sink.calls,
            vec![
                Call::Assessed(FCGI_ABORT_REQUEST, 1, 0),
                Call::Finished(FCGI_ABORT_REQUEST, 1, vec![]),
            ]
        );
    }

    #[test]
    fn read_records_drains_until_wouldblock() {
        struct Chunked(VecDeque<Vec<u8>>);
        impl Read for Chunked {
            fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
                match self.0.pop_front() {
                    Some(chunk) => {
                        buf[..chunk.len()].copy_from_slice(&chunk);
                        Ok(chunk.len())
                    }
                    None => Err(io::ErrorKind::WouldBlock.into()),
                }
            }
        }

        let wire = record_bytes(FCGI_STDIN, 2, b"abcdef", 2);
        let mut chunks = VecDeque::new();
        for piece in wire.chunks(5) {
            chunks.push_back(piece.to_vec());
        }

        let mut assembler = RecordAssembler::new();
        let mut sink = Recorder::new();
        let mut ready = Vec::new();
        let status = assembler
            .read_records(Chunked(chunks), &mut sink, &mut ready)
            .unwrap();

        assert_eq!(status, ReadStatus::WouldBlock);
        assert_matches!(sink.calls.last(), Some(Call::Finished(FCGI_STDIN, 2, _)));
    }

    #[test]
    fn read_records_reports_eof() {
        let mut assembler = RecordAssembler::new();
        let mut sink = Recorder::new();
        let mut ready = Vec::new();
        let status = assembler
            .read_records(&b""[..], &mut sink, &mut ready)
            .unwrap();
        assert_eq!(status, ReadStatus::Closed);
    }
}
