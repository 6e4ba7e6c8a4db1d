//! Poller (C2): drives the long-poll loop against the bus, advances the
//! cursor, and adapts cadence between caught-up and more-available states.

use crate::frame::{self, ClassifyError, PayloadKind};
use crate::model::{AckRef, StartRequest};
use crate::pending::PendingSet;
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

/// Delay before the next poll when the previous batch still had records
/// (spec.md §4.2).
const CADENCE_MORE: Duration = Duration::from_millis(200);
/// Delay before the next poll once caught up (spec.md §4.2).
const CADENCE_CAUGHT_UP: Duration = Duration::from_secs(7);
/// Bytes of a non-200 response body retained for diagnostic logging
/// (spec.md §6).
const OPAQUE_ERROR_BYTES: usize = 256;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport error: {0}")]
    Request(String),
    #[error("bus responded with status {status}: {body}")]
    HttpStatus { status: u16, body: String },
}

/// Pluggable cadence policy: given whether the last batch was empty
/// ("end"), return the delay before the next poll, or `None` to stop the
/// loop. `None` is used only by tests (spec.md §4.2, §5).
pub trait Cadence: Send {
    fn next_delay(&mut self, end: bool) -> Option<Duration>;
}

/// Default cadence: 200ms when more records are likely available, 7s once
/// caught up.
pub struct DefaultCadence;

impl Cadence for DefaultCadence {
    fn next_delay(&mut self, end: bool) -> Option<Duration> {
        Some(if end { CADENCE_CAUGHT_UP } else { CADENCE_MORE })
    }
}

/// Drives the poll loop. Owns `latest`, the `PendingSet`, and the
/// normalized bus address — no other component may reach these (spec.md
/// §9: the pending set must be poller-scoped, not global).
pub struct Poller {
    client: reqwest::Client,
    base: String,
    latest: u32,
    pending: PendingSet,
    cadence: Box<dyn Cadence>,
}

impl Poller {
    pub fn new(bus_addr: &str, client: reqwest::Client) -> Self {
        Poller {
            client,
            base: normalize(bus_addr),
            latest: 0,
            pending: PendingSet::new(),
            cadence: Box::new(DefaultCadence),
        }
    }

    pub fn with_cadence(mut self, cadence: Box<dyn Cadence>) -> Self {
        self.cadence = cadence;
        self
    }

    /// The normalized, cached bus address (for diagnostics / tests).
    pub fn base_url(&self) -> &str {
        &self.base
    }

    pub fn latest(&self) -> u32 {
        self.latest
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Run the poll loop. `dispatch` is invoked with the pending set's
    /// contents whenever a batch is empty (caught up) and the set is
    /// non-empty — the end-of-batch hook from spec.md §4.2.
    pub async fn run<F>(mut self, mut dispatch: F)
    where
        F: FnMut(Vec<StartRequest>),
    {
        let mut end = false;
        loop {
            end = self.poll_once(end).await;

            if end && !self.pending.is_empty() {
                dispatch(self.pending.drain());
            }

            match self.cadence.next_delay(end) {
                Some(delay) => tokio::time::sleep(delay).await,
                None => break,
            }
        }
    }

    /// Perform one GET + parse cycle. Returns the "end" flag to use for
    /// cadence: unchanged from the previous value on transport/framing
    /// error, recomputed otherwise.
    async fn poll_once(&mut self, previous_end: bool) -> bool {
        let url = format!("{}get/xx?from={}", self.base, self.latest + 1);

        let resp = match self.client.get(&url).send().await {
            Ok(resp) => resp,
            Err(e) => {
                warn!(error = %e, "transport error polling bus");
                return previous_end;
            }
        };

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = read_opaque_text(resp).await;
            warn!(status, body, "bus responded with non-200 status");
            return previous_end;
        }

        let body = match resp.bytes().await {
            Ok(b) => b,
            Err(e) => {
                warn!(error = %e, "transport error reading response body");
                return previous_end;
            }
        };

        let batch = frame::parse_batch(&body);

        for record in &batch.records {
            self.latest = self.latest.max(record.msgnum);
            self.process_record(record.msgnum, &record.payload);
        }

        if let Some(err) = batch.error {
            warn!(msgnum = err.msgnum(), error = %err, "framing error, batch aborted");
            return previous_end;
        }

        batch.records.is_empty()
    }

    fn process_record(&mut self, msgnum: u32, payload: &[u8]) {
        match frame::classify(payload) {
            Ok(PayloadKind::Start) => match serde_json::from_slice::<StartRequest>(payload) {
                Ok(mut req) => {
                    req.msgnum = msgnum;
                    self.pending.insert(req);
                }
                Err(e) => warn!(msgnum, error = %e, "decode error on start payload"),
            },
            Ok(PayloadKind::Ack) => match serde_json::from_slice::<AckRef>(payload) {
                Ok(ack) => self.pending.remove_by_ref(ack.ref_),
                Err(e) => warn!(msgnum, error = %e, "decode error on ack payload"),
            },
            Err(ClassifyError::Unclassifiable) => {
                warn!(msgnum, "classification error, message skipped, cursor still advances");
            }
            Err(ClassifyError::Decode(e)) => {
                warn!(msgnum, error = %e, "decode error, message skipped");
            }
        }
    }
}

async fn read_opaque_text(resp: reqwest::Response) -> String {
    match resp.bytes().await {
        Ok(bytes) => {
            let take = bytes.len().min(OPAQUE_ERROR_BYTES);
            String::from_utf8_lossy(&bytes[..take]).into_owned()
        }
        Err(_) => String::new(),
    }
}

/// Normalize the caller-supplied bus address once: append `/` if missing,
/// prepend `http://` if no scheme (spec.md §4.2).
fn normalize(addr: &str) -> String {
    let mut addr = addr.to_owned();
    if !addr.starts_with("http://") && !addr.starts_with("https://") {
        addr = format!("http://{addr}");
    }
    if !addr.ends_with('/') {
        addr.push('/');
    }
    addr
}
