//! Status Publisher (C5): single long-lived task owning the outbound
//! channel. Serializes StatusRecords to JSON and POSTs them to the bus,
//! one at a time — this serializes cross-job status emission and gives
//! the Executor natural back-pressure.

use crate::model::StatusRecord;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

#[derive(Debug, Error, Clone)]
pub enum PublishError {
    #[error("transport error posting status: {0}")]
    Transport(String),
    #[error("bus responded with non-success status {0}")]
    HttpStatus(u16),
}

type ReplyTx = oneshot::Sender<Result<(), PublishError>>;

/// Handle used by job tasks to submit a status record for publishing.
///
/// Cloning is cheap (wraps an `mpsc::Sender`); every clone feeds the same
/// single publisher task, preserving the "one POST in flight at a time"
/// invariant.
#[derive(Clone)]
pub struct PublisherHandle {
    tx: mpsc::Sender<(StatusRecord, ReplyTx)>,
}

impl PublisherHandle {
    /// Build a handle directly from a sender. Exposed for tests that want
    /// to substitute a fake publisher task without going over HTTP.
    pub fn from_sender(tx: mpsc::Sender<(StatusRecord, ReplyTx)>) -> Self {
        PublisherHandle { tx }
    }

    /// Submit a status record and wait for the publish outcome.
    pub async fn publish(&self, record: StatusRecord) -> Result<(), PublishError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send((record, reply_tx))
            .await
            .map_err(|_| PublishError::Transport("publisher task gone".to_owned()))?;
        reply_rx
            .await
            .unwrap_or_else(|_| Err(PublishError::Transport("publisher task dropped reply".to_owned())))
    }
}

/// Spawn the publisher task. `put_url` is the full `<base>/put/xx` URL.
///
/// The channel has capacity 1 — the closest stable-`tokio` approximation
/// of the source's unbuffered rendezvous channel (`mpsc::channel(0)` is
/// rejected by tokio). The effect is the same: at most one record is ever
/// buffered ahead of the in-flight POST.
pub fn spawn(client: reqwest::Client, put_url: String) -> PublisherHandle {
    let (tx, mut rx) = mpsc::channel::<(StatusRecord, ReplyTx)>(1);

    tokio::spawn(async move {
        while let Some((record, reply)) = rx.recv().await {
            let result = post_status(&client, &put_url, &record).await;
            let _ = reply.send(result);
        }
    });

    PublisherHandle { tx }
}

async fn post_status(
    client: &reqwest::Client,
    put_url: &str,
    record: &StatusRecord,
) -> Result<(), PublishError> {
    let resp = client
        .post(put_url)
        .json(record)
        .send()
        .await
        .map_err(|e| PublishError::Transport(e.to_string()))?;

    if resp.status().is_success() {
        Ok(())
    } else {
        Err(PublishError::HttpStatus(resp.status().as_u16()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{Json, Router, routing::post};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    async fn spawn_test_server(
        status: u16,
    ) -> (String, Arc<AtomicUsize>, tokio::task::JoinHandle<()>) {
        let counter = Arc::new(AtomicUsize::new(0));
        let counter_clone = counter.clone();
        let app = Router::new().route(
            "/put/xx",
            post(move |Json(_body): Json<serde_json::Value>| {
                let counter = counter_clone.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    axum::http::StatusCode::from_u16(status).unwrap()
                }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{addr}/put/xx"), counter, handle)
    }

    #[tokio::test]
    async fn publish_success_reports_ok() {
        let (url, counter, _server) = spawn_test_server(200).await;
        let handle = spawn(reqwest::Client::new(), url);
        let record = StatusRecord::now(7, 100, 0, "hi".to_owned());
        handle.publish(record).await.unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn publish_failure_surfaces_http_status() {
        let (url, _counter, _server) = spawn_test_server(500).await;
        let handle = spawn(reqwest::Client::new(), url);
        let record = StatusRecord::now(7, 100, 0, "hi".to_owned());
        let err = handle.publish(record).await.unwrap_err();
        assert!(matches!(err, PublishError::HttpStatus(500)));
    }

    #[tokio::test]
    async fn publisher_serializes_many_submissions() {
        let (url, counter, _server) = spawn_test_server(200).await;
        let handle = spawn(reqwest::Client::new(), url);
        for i in 0..5 {
            handle
                .publish(StatusRecord::now(i, 1, 0, "x".to_owned()))
                .await
                .unwrap();
        }
        assert_eq!(counter.load(Ordering::SeqCst), 5);
    }
}
