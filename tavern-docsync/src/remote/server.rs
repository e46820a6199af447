//! WebSocket document server.
//!
//! Architecture:
//! ```text
//! Client A ──┐                        ┌── fetch / upsert
//!             ├── DocServer ── dispatch ┼── push (client id dedup)
//! Client B ──┘   (one task per conn)   ├── compact (≤ snapshot watermark)
//!                                      └── remove
//!                                             │
//!                                             ▼
//!                                   dyn RemoteDocService
//! ```
//!
//! Each binary frame is one `DocRequest`; the server answers with exactly
//! one `DocResponse` carrying the same request id. Requests on one
//! connection are handled in arrival order.

use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::RwLock;
use tokio_tungstenite::tungstenite::Message;

use super::protocol::{DocRequest, DocResponse, RequestBody, ResponseBody};
use super::{MemoryDocService, RemoteDocService};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9190".to_string(),
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_requests: u64,
    pub failed_requests: u64,
    pub total_bytes: u64,
}

/// The document server.
pub struct DocServer {
    config: ServerConfig,
    service: Arc<dyn RemoteDocService>,
    stats: Arc<RwLock<ServerStats>>,
}

impl DocServer {
    /// Server over a fresh in-memory service.
    pub fn new(config: ServerConfig) -> Self {
        Self::with_service(config, Arc::new(MemoryDocService::new()))
    }

    pub fn with_service(config: ServerConfig, service: Arc<dyn RemoteDocService>) -> Self {
        Self {
            config,
            service,
            stats: Arc::new(RwLock::new(ServerStats::default())),
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub async fn stats(&self) -> ServerStats {
        self.stats.read().await.clone()
    }

    /// Bind to `bind_addr` and serve forever.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error>> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Document server listening on {}", listener.local_addr()?);
        self.serve(listener).await?;
        Ok(())
    }

    /// Accept connections on an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> std::io::Result<()> {
        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let service = self.service.clone();
            let stats = self.stats.clone();
            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, service, stats).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        service: Arc<dyn RemoteDocService>,
        stats: Arc<RwLock<ServerStats>>,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        log::info!("WebSocket connection established from {addr}");
        {
            let mut s = stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        let result = async {
            while let Some(msg) = ws_receiver.next().await {
                match msg? {
                    Message::Binary(data) => {
                        let bytes: Vec<u8> = data.into();
                        let request = match DocRequest::decode(&bytes) {
                            Ok(request) => request,
                            Err(e) => {
                                log::warn!("Failed to decode request from {addr}: {e}");
                                continue;
                            }
                        };

                        let body = dispatch(service.as_ref(), &request.body).await;
                        {
                            let mut s = stats.write().await;
                            s.total_requests += 1;
                            s.total_bytes += bytes.len() as u64;
                            if matches!(body, ResponseBody::Error(_)) {
                                s.failed_requests += 1;
                            }
                        }

                        let encoded = DocResponse::reply(&request, body).encode()?;
                        ws_sender.send(Message::Binary(encoded.into())).await?;
                    }
                    Message::Ping(data) => {
                        ws_sender.send(Message::Pong(data)).await?;
                    }
                    Message::Close(_) => break,
                    _ => {}
                }
            }
            Ok::<(), Box<dyn std::error::Error + Send + Sync>>(())
        }
        .await;

        stats.write().await.active_connections -= 1;
        log::info!("Connection closed from {addr}");
        result
    }
}

async fn dispatch(service: &dyn RemoteDocService, body: &RequestBody) -> ResponseBody {
    let result = match body {
        RequestBody::FetchSnapshot { key } => service.fetch_snapshot(key).await.map(ResponseBody::Snapshot),
        RequestBody::UpsertSnapshot { key, payload, mode } => service
            .upsert_snapshot(key, payload, *mode)
            .await
            .map(ResponseBody::SnapshotAck),
        RequestBody::PushUpdate {
            key,
            payload,
            client_id,
        } => service
            .push_update(key, payload, client_id.as_deref())
            .await
            .map(ResponseBody::PushAck),
        RequestBody::Compact { key, before_or_eq } => service
            .compact(key, *before_or_eq)
            .await
            .map(ResponseBody::CompactAck),
        RequestBody::RemoveDocument { key } => service.remove_document(key).await.map(|()| ResponseBody::Removed),
        RequestBody::Ping => Ok(ResponseBody::Pong),
    };
    result.unwrap_or_else(|e| ResponseBody::Error(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::doc_id::DocumentId;

    #[test]
    fn test_default_config() {
        let server = DocServer::new(ServerConfig::default());
        assert_eq!(server.config().bind_addr, "127.0.0.1:9190");
    }

    #[tokio::test]
    async fn test_initial_stats() {
        let server = DocServer::new(ServerConfig::default());
        let stats = server.stats().await;
        assert_eq!(stats.total_connections, 0);
        assert_eq!(stats.total_requests, 0);
    }

    #[tokio::test]
    async fn test_dispatch_maps_failures() {
        let service = MemoryDocService::new();
        let key = DocumentId::room_description(1);

        let body = dispatch(
            &service,
            &RequestBody::PushUpdate {
                key,
                payload: vec![0xFF],
                client_id: None,
            },
        )
        .await;
        assert!(matches!(body, ResponseBody::Error(_)));

        let body = dispatch(&service, &RequestBody::FetchSnapshot { key }).await;
        assert_eq!(body, ResponseBody::Snapshot(None));
        assert_eq!(dispatch(&service, &RequestBody::Ping).await, ResponseBody::Pong);
    }
}
