//! Frame Reader (C1): parses the bus response envelope and record frames.
//!
//! Grammar (spec.md §4.1):
//! ```text
//! Response    := EnvHdr Count "\n" Record*
//! EnvHdr      := "KAF_MSGS|v1|"
//! Count       := ascii-decimal, up to 32 digits, terminated by "\n"
//! Record      := RecHdr MsgNum "|" Size "\n" Payload "\n"
//! RecHdr      := "KAF_MSG|"
//! MsgNum      := ascii-decimal, up to 32 digits, terminated by "|"
//! Size        := ascii-decimal, up to 32 digits, terminated by "\n", <= 1024
//! Payload     := exactly Size bytes
//! ```
//!
//! Parsing is strictly sequential and single-pass. A malformed frame aborts
//! the current batch (the records parsed before the error are still
//! returned) but never the poller itself.

use thiserror::Error;

const ENV_HDR: &[u8] = b"KAF_MSGS|v1|";
const REC_HDR: &[u8] = b"KAF_MSG|";
const MAX_DIGITS: usize = 32;
const MAX_PAYLOAD_SIZE: usize = 1024;

/// A single parsed `(msgnum, payload)` pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub msgnum: u32,
    pub payload: Vec<u8>,
}

/// Framing error. Carries the best-known `msgnum` at the point of failure
/// (`0` if a `msgnum` had not yet been read for the record in progress).
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("missing or malformed envelope header")]
    BadEnvelope,
    #[error("missing or malformed record header")]
    BadRecordHeader,
    #[error("malformed numeric field at msgnum={msgnum}: {what}")]
    BadNumber { msgnum: u32, what: &'static str },
    #[error("record at msgnum={msgnum} declares size {size} > {MAX_PAYLOAD_SIZE}")]
    OversizePayload { msgnum: u32, size: u64 },
    #[error("unexpected end of stream while reading msgnum={msgnum}: {what}")]
    Truncated { msgnum: u32, what: &'static str },
    #[error("record at msgnum={msgnum} missing trailing newline terminator")]
    MissingTerminator { msgnum: u32 },
}

impl FrameError {
    /// The `msgnum` known at the point of failure, or `0` if none.
    pub fn msgnum(&self) -> u32 {
        match *self {
            FrameError::BadEnvelope | FrameError::BadRecordHeader => 0,
            FrameError::BadNumber { msgnum, .. }
            | FrameError::OversizePayload { msgnum, .. }
            | FrameError::Truncated { msgnum, .. }
            | FrameError::MissingTerminator { msgnum } => msgnum,
        }
    }
}

/// Result of parsing one response body: the records parsed before any
/// error, plus the error itself if parsing was aborted mid-batch.
#[derive(Debug, Default)]
pub struct ParsedBatch {
    pub records: Vec<Record>,
    pub error: Option<FrameError>,
}

impl ParsedBatch {
    /// `true` when the envelope declared zero records and none were parsed
    /// (spec.md §4.1: "the envelope alone indicates no new records").
    pub fn is_end(&self) -> bool {
        self.records.is_empty() && self.error.is_none()
    }
}

/// Parse a full response body per the grammar above.
pub fn parse_batch(body: &[u8]) -> ParsedBatch {
    let mut cur = Cursor::new(body);

    if !cur.consume_literal(ENV_HDR) {
        return ParsedBatch {
            records: Vec::new(),
            error: Some(FrameError::BadEnvelope),
        };
    }

    let count = match cur.read_num_until(b'\n', 0, "count") {
        Ok(n) => n,
        Err(e) => {
            return ParsedBatch {
                records: Vec::new(),
                error: Some(e),
            };
        }
    };

    let mut records = Vec::with_capacity(count.min(1024) as usize);
    for _ in 0..count {
        match parse_record(&mut cur) {
            Ok(record) => records.push(record),
            Err(e) => {
                return ParsedBatch {
                    records,
                    error: Some(e),
                };
            }
        }
    }

    ParsedBatch {
        records,
        error: None,
    }
}

fn parse_record(cur: &mut Cursor<'_>) -> Result<Record, FrameError> {
    if !cur.consume_literal(REC_HDR) {
        return Err(FrameError::BadRecordHeader);
    }

    let msgnum = cur.read_num_until(b'|', 0, "msgnum")? as u32;
    let size = cur.read_num_until(b'\n', msgnum, "size")?;

    if size > MAX_PAYLOAD_SIZE as u64 {
        return Err(FrameError::OversizePayload { msgnum, size });
    }
    let size = size as usize;

    let payload = cur
        .take(size)
        .ok_or(FrameError::Truncated {
            msgnum,
            what: "payload",
        })?
        .to_vec();

    match cur.next_byte() {
        Some(b'\n') => Ok(Record { msgnum, payload }),
        Some(_) => Err(FrameError::MissingTerminator { msgnum }),
        None => Err(FrameError::Truncated {
            msgnum,
            what: "payload terminator",
        }),
    }
}

/// Minimal byte-at-a-time cursor over a borrowed buffer.
struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Cursor { buf, pos: 0 }
    }

    fn consume_literal(&mut self, lit: &[u8]) -> bool {
        if self.buf.get(self.pos..).unwrap_or(&[]).starts_with(lit) {
            self.pos += lit.len();
            true
        } else {
            false
        }
    }

    fn next_byte(&mut self) -> Option<u8> {
        let b = *self.buf.get(self.pos)?;
        self.pos += 1;
        Some(b)
    }

    fn take(&mut self, n: usize) -> Option<&'a [u8]> {
        let end = self.pos.checked_add(n)?;
        let slice = self.buf.get(self.pos..end)?;
        self.pos = end;
        Some(slice)
    }

    /// Read ASCII-decimal digits (up to [`MAX_DIGITS`]) until `terminator`
    /// is seen, consuming the terminator. An EOF encountered before the
    /// terminator is a framing error, never a silently-accepted short read
    /// (spec.md §9, first Open Question).
    fn read_num_until(
        &mut self,
        terminator: u8,
        msgnum_ctx: u32,
        what: &'static str,
    ) -> Result<u64, FrameError> {
        let mut value: u64 = 0;
        let mut digits = 0usize;
        loop {
            let b = self.next_byte().ok_or(FrameError::Truncated {
                msgnum: msgnum_ctx,
                what,
            })?;
            if b == terminator {
                if digits == 0 {
                    return Err(FrameError::BadNumber {
                        msgnum: msgnum_ctx,
                        what,
                    });
                }
                return Ok(value);
            }
            if !b.is_ascii_digit() {
                return Err(FrameError::BadNumber {
                    msgnum: msgnum_ctx,
                    what,
                });
            }
            digits += 1;
            if digits > MAX_DIGITS {
                return Err(FrameError::BadNumber {
                    msgnum: msgnum_ctx,
                    what,
                });
            }
            value = value * 10 + u64::from(b - b'0');
        }
    }
}

/// Classified payload kind, per spec.md §4.1's substring rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadKind {
    Start,
    Ack,
}

/// Errors classifying / decoding. Kept as one enum since spec.md §7 treats
/// classification and decode errors identically (skip, cursor still
/// advances).
#[derive(Debug, Error)]
pub enum ClassifyError {
    #[error("payload is neither a start request nor an ack")]
    Unclassifiable,
    #[error("classified payload failed JSON decode: {0}")]
    Decode(#[from] serde_json::Error),
}

/// Classify a raw payload by literal substring presence, per spec.md §4.1.
///
/// Rationale: the bus topic is heterogeneous; a full parse is deferred
/// until classification succeeds.
pub fn classify(payload: &[u8]) -> Result<PayloadKind, ClassifyError> {
    if contains(payload, b"\"exe\":") {
        Ok(PayloadKind::Start)
    } else if contains(payload, b"\"ref\":") {
        Ok(PayloadKind::Ack)
    } else {
        Err(ClassifyError::Unclassifiable)
    }
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|w| w == needle)
}
