//! WebSocket client for the document server.
//!
//! Provides:
//! - Lazy connect on first call, reconnect after the link drops
//! - Request/response matching by request id over one connection
//! - `RemoteDocService` implementation for `RemoteSyncClient`
//!
//! No offline queue lives here: anything not acknowledged is still in the
//! local update log and is pushed again on the next sync.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use super::protocol::{DocRequest, DocResponse, ProtocolError, RequestBody, ResponseBody};
use super::{
    CompactAck, PushAck, RemoteDocService, RemoteError, RemoteSnapshot, SnapshotAck, UpsertMode,
};
use crate::config::RemoteConfig;
use crate::doc_id::DocumentId;

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connected,
}

type PendingReplies = Arc<std::sync::Mutex<HashMap<Uuid, oneshot::Sender<ResponseBody>>>>;

/// Reply slot of one in-flight request, freed when the caller stops
/// waiting, including when its future is dropped on a timeout.
struct PendingReply {
    pending: PendingReplies,
    request_id: Uuid,
}

impl Drop for PendingReply {
    fn drop(&mut self) {
        lock_pending(&self.pending).remove(&self.request_id);
    }
}

struct Connection {
    outgoing: mpsc::Sender<Vec<u8>>,
    pending: PendingReplies,
    alive: Arc<AtomicBool>,
}

/// Remote document service reached over WebSocket.
pub struct WsDocService {
    url: String,
    connection: Mutex<Option<Connection>>,
}

impl WsDocService {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            connection: Mutex::new(None),
        }
    }

    pub fn from_config(config: &RemoteConfig) -> Self {
        Self::new(config.url.clone())
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub async fn connection_state(&self) -> ConnectionState {
        match self.connection.lock().await.as_ref() {
            Some(conn) if conn.alive.load(Ordering::SeqCst) => ConnectionState::Connected,
            _ => ConnectionState::Disconnected,
        }
    }

    /// Drop the current connection; the next call reconnects.
    pub async fn disconnect(&self) {
        self.connection.lock().await.take();
    }

    #[cfg(test)]
    async fn pending_replies(&self) -> usize {
        match self.connection.lock().await.as_ref() {
            Some(conn) => lock_pending(&conn.pending).len(),
            None => 0,
        }
    }

    async fn connect(&self) -> Result<Connection, RemoteError> {
        let (ws_stream, _) = tokio_tungstenite::connect_async(self.url.as_str())
            .await
            .map_err(|e| RemoteError::Network(e.to_string()))?;
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(256);
        let pending: PendingReplies = Arc::new(std::sync::Mutex::new(HashMap::new()));
        let alive = Arc::new(AtomicBool::new(true));

        // Writer task: forward outgoing frames to the socket
        let writer_alive = alive.clone();
        tokio::spawn(async move {
            while let Some(data) = out_rx.recv().await {
                if ws_writer.send(Message::Binary(data.into())).await.is_err() {
                    break;
                }
            }
            writer_alive.store(false, Ordering::SeqCst);
        });

        // Reader task: route responses to their waiting callers
        let reader_pending = pending.clone();
        let reader_alive = alive.clone();
        let url = self.url.clone();
        tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Binary(data)) => {
                        let bytes: Vec<u8> = data.into();
                        match DocResponse::decode(&bytes) {
                            Ok(response) => {
                                let waiter = lock_pending(&reader_pending).remove(&response.request_id);
                                if let Some(tx) = waiter {
                                    let _ = tx.send(response.body);
                                }
                            }
                            Err(e) => log::warn!("Undecodable response from {url}: {e}"),
                        }
                    }
                    Ok(Message::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }

            // Connection lost: fail everyone still waiting
            reader_alive.store(false, Ordering::SeqCst);
            lock_pending(&reader_pending).clear();
            log::debug!("Disconnected from {url}");
        });

        log::info!("Connected to document server {}", self.url);
        Ok(Connection {
            outgoing: out_tx,
            pending,
            alive,
        })
    }

    async fn call(&self, body: RequestBody) -> Result<ResponseBody, RemoteError> {
        let (outgoing, pending) = {
            let mut guard = self.connection.lock().await;
            let usable = guard
                .as_ref()
                .is_some_and(|conn| conn.alive.load(Ordering::SeqCst));
            if !usable {
                *guard = Some(self.connect().await?);
            }
            match guard.as_ref() {
                Some(conn) => (conn.outgoing.clone(), conn.pending.clone()),
                None => return Err(RemoteError::Protocol(ProtocolError::ConnectionClosed)),
            }
        };

        let request = DocRequest::new(body);
        let encoded = request.encode()?;
        let (tx, rx) = oneshot::channel();
        lock_pending(&pending).insert(request.request_id, tx);
        let _slot = PendingReply {
            pending,
            request_id: request.request_id,
        };

        if outgoing.send(encoded).await.is_err() {
            return Err(RemoteError::Network("connection closed".into()));
        }

        match rx.await {
            Ok(ResponseBody::Error(reason)) => Err(RemoteError::Rejected(reason)),
            Ok(body) => Ok(body),
            Err(_) => Err(RemoteError::Network("connection closed before response".into())),
        }
    }
}

fn lock_pending(
    pending: &PendingReplies,
) -> std::sync::MutexGuard<'_, HashMap<Uuid, oneshot::Sender<ResponseBody>>> {
    pending.lock().unwrap_or_else(|e| e.into_inner())
}

fn unexpected(body: ResponseBody) -> RemoteError {
    RemoteError::Protocol(ProtocolError::UnexpectedResponse(format!("{body:?}")))
}

#[async_trait]
impl RemoteDocService for WsDocService {
    async fn fetch_snapshot(&self, key: &DocumentId) -> Result<Option<RemoteSnapshot>, RemoteError> {
        match self.call(RequestBody::FetchSnapshot { key: *key }).await? {
            ResponseBody::Snapshot(snapshot) => Ok(snapshot),
            other => Err(unexpected(other)),
        }
    }

    async fn upsert_snapshot(
        &self,
        key: &DocumentId,
        payload: &[u8],
        mode: UpsertMode,
    ) -> Result<SnapshotAck, RemoteError> {
        let body = RequestBody::UpsertSnapshot {
            key: *key,
            payload: payload.to_vec(),
            mode,
        };
        match self.call(body).await? {
            ResponseBody::SnapshotAck(ack) => Ok(ack),
            other => Err(unexpected(other)),
        }
    }

    async fn push_update(
        &self,
        key: &DocumentId,
        payload: &[u8],
        client_id: Option<&str>,
    ) -> Result<PushAck, RemoteError> {
        let body = RequestBody::PushUpdate {
            key: *key,
            payload: payload.to_vec(),
            client_id: client_id.map(str::to_string),
        };
        match self.call(body).await? {
            ResponseBody::PushAck(ack) => Ok(ack),
            other => Err(unexpected(other)),
        }
    }

    async fn compact(&self, key: &DocumentId, before_or_eq: u64) -> Result<CompactAck, RemoteError> {
        match self.call(RequestBody::Compact { key: *key, before_or_eq }).await? {
            ResponseBody::CompactAck(ack) => Ok(ack),
            other => Err(unexpected(other)),
        }
    }

    async fn remove_document(&self, key: &DocumentId) -> Result<(), RemoteError> {
        match self.call(RequestBody::RemoveDocument { key: *key }).await? {
            ResponseBody::Removed => Ok(()),
            other => Err(unexpected(other)),
        }
    }
}
