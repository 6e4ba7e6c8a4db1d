//! Executor (C4): spawns each dispatched `StartRequest` as a child process,
//! rotates its captured output, and emits periodic + terminal status
//! records through the Status Publisher.
//!
//! Each request runs on its own task; the core imposes no cap on
//! concurrent jobs (spec.md §4.4, §5).

use crate::buffer::RotatingBuffer;
use crate::model::{StartRequest, StatusRecord};
use crate::publisher::PublisherHandle;
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::sync::oneshot;
use tracing::{info, warn};

/// Capacity of the rotating output buffer, per spec.md §4.4.
const BUFFER_CAPACITY: usize = 900;

/// A child failed to spawn. Carries the `msgnum` it was dispatched for so
/// the terminal `StatusRecord` can cite it in `op`.
#[derive(Debug, Error)]
#[error("msgnum={msgnum}: spawn error: {source}")]
pub struct SpawnError {
    msgnum: u32,
    #[source]
    source: std::io::Error,
}

/// Dispatch every request onto its own task. Returns immediately; callers
/// that need to observe completion (tests) should use [`dispatch_one`]
/// directly and await its `JoinHandle`.
pub fn dispatch_all(requests: Vec<StartRequest>, publisher: PublisherHandle) {
    for req in requests {
        let publisher = publisher.clone();
        tokio::spawn(async move {
            dispatch_one(req, publisher).await;
        });
    }
}

/// Run a single `StartRequest` to completion: spawn, capture, report.
///
/// Every call results in exactly one terminal `StatusRecord` offered to
/// the publisher (spec.md §3 invariant), whether the child spawned
/// successfully or not.
pub async fn dispatch_one(req: StartRequest, publisher: PublisherHandle) {
    let buffer = RotatingBuffer::new(BUFFER_CAPACITY);

    let mut command = Command::new(&req.exe);
    command.args(&req.args);
    if !req.dir.is_empty() {
        command.current_dir(&req.dir);
    }
    command.stdout(Stdio::piped()).stderr(Stdio::piped());

    let mut child = match command.spawn() {
        Ok(child) => child,
        Err(e) => {
            let err = SpawnError {
                msgnum: req.msgnum,
                source: e,
            };
            warn!(msgnum = req.msgnum, exe = %req.exe, error = %err, "spawn failed");
            buffer.write(err.to_string().as_bytes()).await;
            let op = buffer.drain().await;
            emit(&publisher, StatusRecord::now(req.msgnum, 0, -1, op)).await;
            return;
        }
    };

    let pid = child.id().unwrap_or(0);
    info!(msgnum = req.msgnum, pid, exe = %req.exe, "child spawned");

    let stdout = child.stdout.take().expect("stdout piped at spawn");
    let stderr = child.stderr.take().expect("stderr piped at spawn");
    let stdout_task = tokio::spawn(drain_pipe(stdout, buffer.clone()));
    let stderr_task = tokio::spawn(drain_pipe(stderr, buffer.clone()));

    let (stop_tx, stop_rx) = oneshot::channel();
    let periodic_task = (req.secs > 0).then(|| {
        tokio::spawn(periodic_reporter(
            req.msgnum,
            pid,
            buffer.clone(),
            req.secs,
            publisher.clone(),
            stop_rx,
        ))
    });

    let wait_result = child.wait().await;
    let _ = stdout_task.await;
    let _ = stderr_task.await;

    // Signal the periodic task exactly once, after the child has exited.
    if let Some(task) = periodic_task {
        let _ = stop_tx.send(());
        let _ = task.await;
    } else {
        drop(stop_tx);
    }

    let exit = match wait_result {
        Ok(status) => status.code().unwrap_or(-1),
        Err(e) => {
            warn!(msgnum = req.msgnum, pid, error = %e, "wait failed");
            -1
        }
    };

    info!(msgnum = req.msgnum, pid, exit, "child exited");
    let op = buffer.drain().await;
    emit(&publisher, StatusRecord::now(req.msgnum, pid, exit, op)).await;
}

async fn emit(publisher: &PublisherHandle, record: StatusRecord) {
    let msgnum = record.ref_;
    if let Err(e) = publisher.publish(record).await {
        warn!(msgnum, error = %e, "publish failed");
    }
}

async fn drain_pipe<R: tokio::io::AsyncRead + Unpin>(mut reader: R, buffer: RotatingBuffer) {
    let mut chunk = [0u8; 4096];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => buffer.write(&chunk[..n]).await,
        }
    }
}

/// Drain the buffer every `secs` seconds until `stop_rx` fires, emitting a
/// periodic status record whenever the drain is non-empty. `exit` is
/// conventionally `0` on periodic records (spec.md §9 — a known wart, not
/// a claim the child has exited).
async fn periodic_reporter(
    ref_: u32,
    pid: u32,
    buffer: RotatingBuffer,
    secs: u64,
    publisher: PublisherHandle,
    mut stop_rx: oneshot::Receiver<()>,
) {
    let mut interval = tokio::time::interval(Duration::from_secs(secs));
    interval.tick().await; // first tick resolves immediately; skip it
    loop {
        tokio::select! {
            _ = interval.tick() => {
                let drained = buffer.drain().await;
                if !drained.is_empty() {
                    emit(&publisher, StatusRecord::now(ref_, pid, 0, drained)).await;
                }
            }
            _ = &mut stop_rx => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::publisher::PublishError;
    use tokio::sync::mpsc;

    /// Test double for `PublisherHandle` that records every submitted
    /// record without going over the network.
    fn spy_publisher() -> (PublisherHandle, mpsc::UnboundedReceiver<StatusRecord>) {
        let (tx, rx) = mpsc::unbounded_channel();
        // Build a real PublisherHandle backed by a local relay task so the
        // public API under test (emit/publish) exercises the real channel.
        let (relay_tx, mut relay_rx) = tokio::sync::mpsc::channel::<(
            StatusRecord,
            tokio::sync::oneshot::Sender<Result<(), PublishError>>,
        )>(1);
        tokio::spawn(async move {
            while let Some((record, reply)) = relay_rx.recv().await {
                let _ = tx.send(record);
                let _ = reply.send(Ok(()));
            }
        });
        (PublisherHandle::from_sender(relay_tx), rx)
    }

    #[tokio::test]
    async fn spawn_failure_emits_single_terminal_record_with_exit_minus_one() {
        let (publisher, mut rx) = spy_publisher();
        let req = StartRequest {
            msgnum: 42,
            src: "s".to_owned(),
            exe: "/no/such/path".to_owned(),
            dir: String::new(),
            args: Vec::new(),
            secs: 0,
        };
        dispatch_one(req, publisher).await;

        let record = rx.recv().await.expect("one status record");
        assert_eq!(record.ref_, 42);
        assert_eq!(record.exit, -1);
        assert!(!record.op.is_empty());
        assert!(rx.try_recv().is_err(), "exactly one record expected");
    }

    #[tokio::test]
    async fn successful_exit_emits_terminal_record_with_observed_code() {
        let (publisher, mut rx) = spy_publisher();
        let req = StartRequest {
            msgnum: 1,
            src: "s".to_owned(),
            exe: "/bin/sh".to_owned(),
            dir: String::new(),
            args: vec!["-c".to_owned(), "exit 3".to_owned()],
            secs: 0,
        };
        dispatch_one(req, publisher).await;

        let record = rx.recv().await.expect("one status record");
        assert_eq!(record.ref_, 1);
        assert_eq!(record.exit, 3);
    }

    #[tokio::test]
    async fn periodic_reports_precede_terminal_report_when_child_is_slow() {
        let (publisher, mut rx) = spy_publisher();
        let req = StartRequest {
            msgnum: 9,
            src: "s".to_owned(),
            exe: "/bin/sh".to_owned(),
            dir: String::new(),
            args: vec![
                "-c".to_owned(),
                "echo hello; sleep 2".to_owned(),
            ],
            secs: 1,
        };
        dispatch_one(req, publisher).await;

        let mut saw_periodic_hello = false;
        let mut terminal = None;
        while let Some(record) = rx.recv().await {
            if record.op.contains("hello") && record.exit == 0 && terminal.is_none() {
                saw_periodic_hello = true;
            }
            terminal = Some(record);
        }
        assert!(saw_periodic_hello, "expected at least one periodic record containing child output");
        let terminal = terminal.expect("terminal record");
        assert_eq!(terminal.exit, 0);
    }
}
