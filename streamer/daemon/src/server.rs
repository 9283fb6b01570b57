//! Streamer Server Implementation
//!
//! The server loop for the grid streamer daemon:
//! - Accepts TCP connections and upgrades them to WebSocket
//! - Gives each connection its own [`ConnectionBinder`] and handler task
//! - Tracks active connections and enforces the connection limit
//! - Supports graceful shutdown
//!
//! ```text
//!                     StreamerServer
//!                          │
//!          ┌───────────────┼───────────────┐
//!          │               │               │
//!       browser         browser         browser
//!       (conn-1)        (conn-2)        (conn-3)
//!          │               │               │
//!    ConnectionBinder ConnectionBinder ConnectionBinder
//!          │               │               │
//!          └───────────────┴───────────────┘
//!                          │
//!                  Arc<dyn ResultStore>
//! ```

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn, Instrument};

use grid_streamer_core::transport::frame::CLIENT_DISCONNECT_REASON;
use grid_streamer_core::transport::websocket::{
    decode_ws_message, encode_ws_message, WsInbound, TRANSPORT_CLOSE_REASON,
    TRANSPORT_ERROR_REASON,
};
use grid_streamer_core::{
    ChannelConnection, ClientEvent, ConnectionBinder, ConnectionId, ResultStore, StreamConfig,
    StreamerConfig,
};

/// How often the accept loop wakes up to check the shutdown flag
const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Connection state tracking
struct ConnectionState {
    /// When the connection was established
    connected_at: Instant,
    /// Remote address
    peer_addr: SocketAddr,
    /// Handle to abort the connection task
    abort_handle: tokio::task::AbortHandle,
}

/// Configuration for the streamer server
#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// Listen address
    pub bind_address: SocketAddr,
    /// Maximum number of concurrent connections
    pub max_connections: usize,
    /// Maximum inbound frame size
    pub max_frame_size: usize,
    /// Per-session streaming behaviour
    pub stream: StreamConfig,
}

impl From<&StreamerConfig> for ServerConfig {
    fn from(config: &StreamerConfig) -> Self {
        Self {
            bind_address: config.bind_address,
            max_connections: config.max_connections,
            max_frame_size: config.max_frame_size,
            stream: config.stream.clone(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::from(&StreamerConfig::default())
    }
}

/// The WebSocket streaming server
pub struct StreamerServer {
    config: ServerConfig,
    store: Arc<dyn ResultStore>,
    connection_states: Arc<DashMap<ConnectionId, ConnectionState>>,
}

impl StreamerServer {
    /// Create a new server reading from `store`
    pub fn new(config: ServerConfig, store: Arc<dyn ResultStore>) -> Self {
        Self {
            config,
            store,
            connection_states: Arc::new(DashMap::new()),
        }
    }

    /// Bind the configured address and serve until `shutdown` is set
    pub async fn run(&self, shutdown: Arc<AtomicBool>) -> Result<()> {
        let listener = TcpListener::bind(self.config.bind_address)
            .await
            .with_context(|| format!("Failed to bind to {}", self.config.bind_address))?;
        self.serve(listener, shutdown).await
    }

    /// Serve connections from an already-bound listener
    pub async fn serve(&self, listener: TcpListener, shutdown: Arc<AtomicBool>) -> Result<()> {
        let local_addr = listener
            .local_addr()
            .context("Failed to read listener address")?;
        info!(
            addr = %local_addr,
            store = self.store.name(),
            max_connections = self.config.max_connections,
            "Listening for connections"
        );

        loop {
            if shutdown.load(Ordering::SeqCst) {
                info!("Shutdown requested, stopping accept loop");
                break;
            }

            // Accept with timeout to allow checking shutdown flag
            let (stream, peer_addr) =
                match tokio::time::timeout(ACCEPT_POLL_INTERVAL, listener.accept()).await {
                    Ok(Ok(accepted)) => accepted,
                    Ok(Err(e)) => {
                        error!(error = %e, "Accept failed");
                        continue;
                    }
                    Err(_) => continue,
                };

            if self.connection_states.len() >= self.config.max_connections {
                warn!(peer = %peer_addr, "Connection limit reached, rejecting new connection");
                drop(stream);
                continue;
            }

            let conn_id = ConnectionId::new();
            info!(
                conn_id = %conn_id,
                peer = %peer_addr,
                active_connections = self.connection_states.len() + 1,
                "New connection accepted"
            );

            let task_handle = tokio::spawn(
                Self::handle_connection(
                    conn_id,
                    stream,
                    Arc::clone(&self.store),
                    self.config.clone(),
                    Arc::clone(&self.connection_states),
                )
                .instrument(tracing::info_span!("connection", %conn_id)),
            );

            self.connection_states.insert(
                conn_id,
                ConnectionState {
                    connected_at: Instant::now(),
                    peer_addr,
                    abort_handle: task_handle.abort_handle(),
                },
            );
            // The handler may have finished before it was registered
            if task_handle.is_finished() {
                self.connection_states.remove(&conn_id);
            }
        }

        self.shutdown().await;
        Ok(())
    }

    /// Handle a single client connection
    ///
    /// Inbound frames are decoded into events for the binder; outbound
    /// messages queued by the controller are written as text frames. The
    /// loop ends on close frame, EOF, or socket error, each of which becomes
    /// the connection's disconnect notification.
    async fn handle_connection(
        conn_id: ConnectionId,
        stream: TcpStream,
        store: Arc<dyn ResultStore>,
        config: ServerConfig,
        connection_states: Arc<DashMap<ConnectionId, ConnectionState>>,
    ) {
        let ws = match tokio_tungstenite::accept_async(stream).await {
            Ok(ws) => ws,
            Err(e) => {
                warn!(error = %e, "WebSocket handshake failed");
                connection_states.remove(&conn_id);
                return;
            }
        };
        debug!("WebSocket handshake complete");

        let (mut sink, mut source) = ws.split();
        let (connection, mut outbound_rx) = ChannelConnection::new_pair(conn_id);
        let mut binder = ConnectionBinder::new(connection, store, config.stream.clone());

        let reason = loop {
            tokio::select! {
                frame = source.next() => match frame {
                    Some(Ok(message)) => match decode_ws_message(message, config.max_frame_size) {
                        Ok(WsInbound::Event(event)) => {
                            debug!(event = event.name(), "Received event");
                            let client_left = matches!(event, ClientEvent::Disconnected { .. });
                            binder.handle_event(event);
                            if client_left {
                                break CLIENT_DISCONNECT_REASON.to_string();
                            }
                        }
                        Ok(WsInbound::Closed { reason }) => break reason,
                        Ok(WsInbound::Control) => {}
                        Err(e) => warn!(error = %e, "Failed to decode event frame"),
                    },
                    Some(Err(e)) => {
                        warn!(error = %e, "Read error");
                        break TRANSPORT_ERROR_REASON.to_string();
                    }
                    None => break TRANSPORT_CLOSE_REASON.to_string(),
                },

                msg = outbound_rx.recv() => match msg {
                    Some(message) => match encode_ws_message(&message) {
                        Ok(frame) => {
                            if let Err(e) = sink.send(frame).await {
                                warn!(error = %e, "Write error");
                                break TRANSPORT_ERROR_REASON.to_string();
                            }
                        }
                        Err(e) => warn!(error = %e, "Failed to encode message"),
                    },
                    None => break TRANSPORT_CLOSE_REASON.to_string(),
                },
            }
        };

        // No-op if the client already sent its own disconnect event
        binder.on_disconnect(reason);
        if let Err(e) = sink.close().await {
            debug!(error = %e, "Close after disconnect failed");
        }

        if let Some(result) = binder.finish().await {
            match result {
                Ok(report) => debug!(
                    outcome = ?report.outcome,
                    hours = report.next_hour,
                    "Stream finished"
                ),
                Err(e) => debug!(error = %e, "Stream failed"),
            }
        }

        connection_states.remove(&conn_id);
        info!(
            active_connections = connection_states.len(),
            "Connection handler finished"
        );
    }

    /// Graceful shutdown
    async fn shutdown(&self) {
        info!("Initiating graceful shutdown");

        let conn_ids: Vec<ConnectionId> =
            self.connection_states.iter().map(|r| *r.key()).collect();
        for conn_id in conn_ids {
            if let Some((_, state)) = self.connection_states.remove(&conn_id) {
                info!(
                    conn_id = %conn_id,
                    peer = %state.peer_addr,
                    uptime_secs = state.connected_at.elapsed().as_secs(),
                    "Aborting connection"
                );
                state.abort_handle.abort();
            }
        }

        // Aborted handlers drop their binders, which stop the bound streams
        // Give them a moment to drop their sockets
        tokio::time::sleep(ACCEPT_POLL_INTERVAL).await;
        info!("Shutdown complete");
    }

    /// Get number of active connections
    pub fn connection_count(&self) -> usize {
        self.connection_states.len()
    }
}
