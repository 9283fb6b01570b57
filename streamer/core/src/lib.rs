//! Grid Streamer Core - Per-Connection Streaming of Hourly Simulation Results
//!
//! Streams a simulation's grid output to one connected client, hour by hour,
//! while the simulation may still be producing it. The core knows nothing
//! about sockets; it talks to a [`ResultStore`] on one side and a
//! [`Connection`] on the other.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                     Transport (daemon)                        │
//! │   WebSocket frames ──► decode_event ──► ClientEvent           │
//! │   OutboundMessage ◄── channel rx ◄──────────────┐             │
//! └───────────────┬─────────────────────────────────┼─────────────┘
//!                 │                                 │
//! ┌───────────────┼─────────────────────────────────┼─────────────┐
//! │               ▼           GRID STREAMER CORE    │             │
//! │   ┌───────────────────┐   spawns   ┌────────────┴──────────┐  │
//! │   │ ConnectionBinder  ├───────────►│ StreamingController   │  │
//! │   │ (one per conn)    │            │ status → batch → emit │  │
//! │   └─────────┬─────────┘            └────────────┬──────────┘  │
//! │             │ mark_disconnected                 │             │
//! │             └──────────► Liveness ◄─────────────┘             │
//! │                                                 │             │
//! │                                    ┌────────────▼──────────┐  │
//! │                                    │ ResultStore           │  │
//! │                                    │ (fs, scripted)        │  │
//! │                                    └───────────────────────┘  │
//! └───────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Key Types
//!
//! - [`StreamingController`]: hour-ordered read/emit loop for one session
//! - [`ConnectionBinder`]: maps a connection's events onto one controller
//! - [`ResultStore`]: asynchronous status and hourly batch reads
//! - [`GridBatch`]: one hour of records plus its releasable resource
//! - [`OutboundMessage`]: the `gridData` messages a client receives
//!
//! # Module Overview
//!
//! - [`binder`]: connection lifecycle (start-streaming, disconnect)
//! - [`config`]: TOML/env configuration
//! - [`connection`]: connection handle and liveness flag
//! - [`controller`]: the streaming state machine
//! - [`events`]: events from clients
//! - [`messages`]: messages to clients
//! - [`store`]: result store abstraction and implementations
//! - [`transport`]: wire codec (JSON frames, WebSocket adapter)

#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod binder;
pub mod config;
pub mod connection;
pub mod controller;
pub mod events;
pub mod messages;
pub mod store;
pub mod transport;

pub use binder::{ConnectionBinder, DisconnectRecord, SessionResult, StartError};
pub use config::{load_config, ConfigError, ConfigOverrides, StreamerConfig};
pub use connection::{ChannelConnection, Connection, ConnectionError, ConnectionId, Liveness};
pub use controller::{
    SessionId, StreamConfig, StreamError, StreamOutcome, StreamReport, StreamState, StreamStats,
    StreamingController,
};
pub use events::ClientEvent;
pub use messages::{GridPayload, GridRecord, OutboundMessage, GRID_DATA_EVENT};
pub use store::{
    FsResultStore, GridBatch, ResultStore, RunStatus, SimulationId, SimulationStatus, StoreError,
};
pub use transport::{decode_event, encode_message, TransportError};
