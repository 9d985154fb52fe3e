//! Record-level encoding: headers, stream fragmentation, and the FastCGI
//! name-value pair format.
//!
//! Everything the crate sends is staged as a [`ScatterList`]: a plan whose
//! segments reference either a small local buffer (headers, length
//! prefixes, padding) or the caller's own memory, so user byte streams are
//! framed without being copied.

use crate::protocol::FCGI_VERSION_1;
use std::io::IoSlice;

/// Length of the fixed FastCGI record header
pub const HEADER_LEN: usize = 8;

/// Largest value of the 16-bit content length field
pub const MAX_CONTENT_LEN: usize = 65535;

/// Largest record content length that keeps header + content 8-aligned.
///
/// 65528 = 8 * 8191. Records filled to this cap need no padding; only a
/// terminal fragment does.
pub const MAX_ALIGNED_CONTENT_LEN: usize = 65528;

// Name-value pair length encoding thresholds. A length of 127 or less fits
// the one-byte form; up to 2^31 - 1 fits the four-byte form with the high
// bit of the first byte set. Anything larger cannot be transmitted.
const NV_ONE_BYTE_MAX: usize = 127;
const NV_FOUR_BYTE_MAX: usize = 0x7fff_ffff;

// Budget for a single vectored write. Stands in for IOV_MAX; one segment
// is always held back so terminal padding can be attached.
pub(crate) const MAX_WRITE_SEGMENTS: usize = 1024;
const MAX_WRITE_BYTES: usize = isize::MAX as usize;

/// A decoded FastCGI record header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordHeader {
    pub version: u8,
    pub rtype: u8,
    pub request_id: u16,
    pub content_length: u16,
    pub padding_length: u8,
}

impl RecordHeader {
    pub fn encode(rtype: u8, request_id: u16, content_length: u16, padding_length: u8) -> [u8; 8] {
        let id = request_id.to_be_bytes();
        let len = content_length.to_be_bytes();
        [
            FCGI_VERSION_1,
            rtype,
            id[0],
            id[1],
            len[0],
            len[1],
            padding_length,
            0,
        ]
    }

    pub fn decode(bytes: &[u8; 8]) -> RecordHeader {
        RecordHeader {
            version: bytes[0],
            rtype: bytes[1],
            request_id: u16::from_be_bytes([bytes[2], bytes[3]]),
            content_length: u16::from_be_bytes([bytes[4], bytes[5]]),
            padding_length: bytes[6],
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Segment<'a> {
    // A range of the plan's local buffer
    Local { start: usize, len: usize },
    // A slice of caller memory
    Caller(&'a [u8]),
}

/// A scatter/gather write plan over framing bytes and caller memory
#[derive(Debug)]
pub struct ScatterList<'a> {
    // The first HEADER_LEN bytes stay zero and serve as the padding source.
    local: Vec<u8>,
    segments: Vec<Segment<'a>>,
    total: usize,
}

impl<'a> ScatterList<'a> {
    fn new() -> Self {
        ScatterList {
            local: vec![0u8; HEADER_LEN],
            segments: Vec::new(),
            total: 0,
        }
    }

    /// Total number of bytes the plan writes
    pub fn total_len(&self) -> usize {
        self.total
    }

    pub fn is_empty(&self) -> bool {
        self.total == 0
    }

    /// Builds the `IoSlice` list for a write resumed `skip` bytes in
    pub fn io_slices_from(&self, skip: usize) -> Vec<IoSlice<'_>> {
        let mut out = Vec::with_capacity(self.segments.len());
        let mut skip = skip;
        for segment in &self.segments {
            let bytes: &[u8] = match segment {
                Segment::Local { start, len } => &self.local[*start..*start + *len],
                Segment::Caller(b) => b,
            };
            if skip >= bytes.len() {
                skip -= bytes.len();
                continue;
            }
            out.push(IoSlice::new(&bytes[skip..]));
            skip = 0;
        }
        out
    }

    /// Serializes the plan into one contiguous buffer
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.total);
        for slice in self.io_slices_from(0) {
            out.extend_from_slice(&slice);
        }
        out
    }

    fn push_header(&mut self, rtype: u8, request_id: u16) -> usize {
        let start = self.local.len();
        self.local
            .extend_from_slice(&RecordHeader::encode(rtype, request_id, 0, 0));
        self.segments.push(Segment::Local {
            start,
            len: HEADER_LEN,
        });
        self.total += HEADER_LEN;
        start
    }

    fn patch_content_length(&mut self, header_start: usize, content_length: u16) {
        let bytes = content_length.to_be_bytes();
        self.local[header_start + 4] = bytes[0];
        self.local[header_start + 5] = bytes[1];
    }

    // Pads the record whose header starts at `header_start` out to an
    // 8-byte boundary, referencing the zero prefix of the local buffer.
    fn pad_record(&mut self, header_start: usize, content_length: usize) {
        let overhang = content_length % HEADER_LEN;
        if overhang == 0 {
            return;
        }
        let padding = HEADER_LEN - overhang;
        self.local[header_start + 6] = padding as u8;
        self.segments.push(Segment::Local {
            start: 0,
            len: padding,
        });
        self.total += padding;
    }
}

/// Fragments `bytes` into a plan of stream records of the given type.
///
/// Every produced record has a content length of at most
/// [`MAX_ALIGNED_CONTENT_LEN`] and a total length that is a multiple of 8.
/// Empty input produces exactly one empty record: the stream-terminating
/// record of the FastCGI protocol.
pub fn partition_stream(bytes: &[u8], rtype: u8, request_id: u16) -> ScatterList<'_> {
    let mut plan = ScatterList::new();

    if bytes.is_empty() {
        plan.push_header(rtype, request_id);
        return plan;
    }

    for chunk in bytes.chunks(MAX_ALIGNED_CONTENT_LEN) {
        let header_start = plan.push_header(rtype, request_id);
        plan.patch_content_length(header_start, chunk.len() as u16);
        plan.segments.push(Segment::Caller(chunk));
        plan.total += chunk.len();
        plan.pad_record(header_start, chunk.len());
    }

    plan
}

/// The result of [`encode_nv_pairs`]
#[derive(Debug)]
pub struct NvEncode<'a> {
    /// The write plan for everything that was emitted
    pub plan: ScatterList<'a>,
    /// True when a name or value exceeded the four-byte length form
    pub rejected: bool,
    /// Index of the first pair that was not fully emitted
    pub next_pair: usize,
    /// Byte offset within that pair at which a resumed call must continue
    pub resume_offset: usize,
}

impl NvEncode<'_> {
    /// True when every pair was emitted in full
    pub fn finished(&self, pair_count: usize) -> bool {
        !self.rejected && self.next_pair == pair_count
    }
}

/// Encodes name-value pairs as one or more records of the given type.
///
/// Pairs are walked in order. Each record is filled up to the aligned
/// content cap; the terminal record is padded to an 8-byte boundary. When
/// the per-call segment or byte budget runs out mid-pair, encoding stops
/// and the result identifies the interrupted pair and the byte offset
/// within it; passing that offset back (with the pair slice re-sliced to
/// start at `next_pair`) resumes exactly where the previous call stopped.
///
/// A name or value longer than 2^31 - 1 bytes cannot be length-prefixed;
/// such a pair emits nothing, `rejected` is set, and encoding stops.
pub fn encode_nv_pairs<'a>(
    pairs: &'a [(Vec<u8>, Vec<u8>)],
    rtype: u8,
    request_id: u16,
    offset: usize,
) -> NvEncode<'a> {
    encode_nv_pairs_bounded(
        pairs,
        rtype,
        request_id,
        offset,
        MAX_WRITE_SEGMENTS,
        MAX_WRITE_BYTES,
    )
}

fn encode_nv_pairs_bounded<'a>(
    pairs: &'a [(Vec<u8>, Vec<u8>)],
    rtype: u8,
    request_id: u16,
    offset: usize,
    max_segments: usize,
    max_bytes: usize,
) -> NvEncode<'a> {
    let mut plan = ScatterList::new();
    let mut rejected = false;
    let mut next_pair = pairs.len();
    let mut resume_offset = 0;

    // Hold back one segment and seven bytes so terminal padding always fits.
    let mut segments_left = max_segments.saturating_sub(1);
    let mut bytes_left = max_bytes.saturating_sub(HEADER_LEN - 1);

    // The currently open record, if any.
    let mut header_start: Option<usize> = None;
    let mut content_length = 0usize;

    'pairs: for (index, (name, value)) in pairs.iter().enumerate() {
        if name.len() > NV_FOUR_BYTE_MAX || value.len() > NV_FOUR_BYTE_MAX {
            rejected = true;
            next_pair = index;
            resume_offset = 0;
            break;
        }

        let mut prefix = Vec::with_capacity(8);
        push_nv_length(name.len(), &mut prefix);
        push_nv_length(value.len(), &mut prefix);

        // The pair's logical byte sequence is prefix, then name, then
        // value; `bounds` are the exclusive ends of those three regions.
        let bounds = [
            prefix.len(),
            prefix.len() + name.len(),
            prefix.len() + name.len() + value.len(),
        ];
        let pair_total = bounds[2];
        let mut placed = if index == 0 {
            offset.min(pair_total)
        } else {
            0
        };

        while placed < pair_total {
            if header_start.is_none() {
                // A fresh record needs a header segment plus at least one
                // content segment, and the header bytes plus at least one
                // content byte.
                if segments_left < 2 || bytes_left < HEADER_LEN + 1 {
                    next_pair = index;
                    resume_offset = placed;
                    break 'pairs;
                }
                header_start = Some(plan.push_header(rtype, request_id));
                segments_left -= 1;
                bytes_left -= HEADER_LEN;
                content_length = 0;
            }

            if segments_left == 0 || bytes_left == 0 {
                next_pair = index;
                resume_offset = placed;
                break 'pairs;
            }

            let region = bounds
                .iter()
                .position(|&end| placed < end)
                .expect("placed < pair_total");
            let region_start = if region == 0 { 0 } else { bounds[region - 1] };
            let region_remaining = bounds[region] - placed;
            let room = MAX_ALIGNED_CONTENT_LEN - content_length;
            let take = region_remaining.min(room).min(bytes_left);
            let skip = placed - region_start;

            match region {
                0 => {
                    let start = plan.local.len();
                    plan.local.extend_from_slice(&prefix[skip..skip + take]);
                    plan.segments.push(Segment::Local { start, len: take });
                }
                1 => plan.segments.push(Segment::Caller(&name[skip..skip + take])),
                _ => plan
                    .segments
                    .push(Segment::Caller(&value[skip..skip + take])),
            }
            plan.total += take;
            segments_left -= 1;
            bytes_left -= take;
            placed += take;
            content_length += take;

            let start = header_start.expect("record is open");
            plan.patch_content_length(start, content_length as u16);

            if content_length == MAX_ALIGNED_CONTENT_LEN {
                header_start = None;
            }
        }
    }

    if let Some(start) = header_start {
        plan.pad_record(start, content_length);
    }

    NvEncode {
        plan,
        rejected,
        next_pair,
        resume_offset,
    }
}

fn push_nv_length(len: usize, out: &mut Vec<u8>) {
    if len <= NV_ONE_BYTE_MAX {
        out.push(len as u8);
    } else {
        let mut bytes = (len as u32).to_be_bytes();
        bytes[0] |= 0x80;
        out.extend_from_slice(&bytes);
    }
}

fn read_nv_length(bytes: &[u8], pos: &mut usize) -> Option<usize> {
    let first = *bytes.get(*pos)?;
    if first <= NV_ONE_BYTE_MAX as u8 {
        *pos += 1;
        return Some(first as usize);
    }
    let rest = bytes.get(*pos + 1..*pos + 4)?;
    *pos += 4;
    Some(u32::from_be_bytes([first & 0x7f, rest[0], rest[1], rest[2]]) as usize)
}

/// Decodes a name-value pair byte sequence.
///
/// Returns an empty vector when the input is malformed; callers that need
/// to distinguish malformed input from an empty sequence check the input
/// length first.
pub fn decode_nv_pairs(bytes: &[u8]) -> Vec<(Vec<u8>, Vec<u8>)> {
    let mut pairs = Vec::new();
    let mut pos = 0;

    while pos < bytes.len() {
        let Some(name_len) = read_nv_length(bytes, &mut pos) else {
            return Vec::new();
        };
        let Some(value_len) = read_nv_length(bytes, &mut pos) else {
            return Vec::new();
        };
        let Some(end) = name_len
            .checked_add(value_len)
            .and_then(|n| n.checked_add(pos))
        else {
            return Vec::new();
        };
        if end > bytes.len() {
            return Vec::new();
        }
        let name = bytes[pos..pos + name_len].to_vec();
        let value = bytes[pos + name_len..end].to_vec();
        pos = end;
        pairs.push((name, value));
    }

    pairs
}

/// Encodes the 8-byte FCGI_END_REQUEST body
pub fn end_request_body(app_status: i32, protocol_status: u8) -> [u8; 8] {
    let status = app_status.to_be_bytes();
    [
        status[0],
        status[1],
        status[2],
        status[3],
        protocol_status,
        0,
        0,
        0,
    ]
}

/// Encodes the 8-byte FCGI_UNKNOWN_TYPE body
pub fn unknown_type_body(rtype: u8) -> [u8; 8] {
    [rtype, 0, 0, 0, 0, 0, 0, 0]
}
