//! # logsync — ordered state replication over WebSockets
//!
//! Keeps one shared application state synchronized across many observers.
//! The server holds the authoritative, ordered history of updates; clients
//! receive the full history in order and then every new update, folding each
//! into local state through a pure reducer.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     WebSocket       ┌─────────────┐
//! │ SyncClient  │ ◄─────────────────► │ SyncServer  │
//! │ (per user)  │    JSON frames      │ (sequencer) │
//! └──────┬──────┘                     └──────┬──────┘
//!        │                                   │
//!        ▼                                   ▼
//! ┌─────────────┐                     ┌─────────────┐
//! │ StateMachine│                     │ EventLog    │
//! │ (reducer)   │                     │ (durable)   │
//! └─────────────┘                     └──────┬──────┘
//!                                            │
//!                                 ┌──────────┴─────────┐
//!                                 │ ConnectionRegistry │
//!                                 │ (fan-out)          │
//!                                 └────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — JSON wire frames and the durable log record format
//! - [`event_log`] — append-only event log with file-backed durability
//! - [`broadcast`] — connection registry with replay + fan-out
//! - [`server`] — the WebSocket sequencer server
//! - [`client`] — the client synchronization state machine
//!
//! ## Ordering guarantee
//!
//! A connection registered at log length `n` receives entries `0..n` as
//! replay and every entry `>= n` as a live broadcast, with no gaps and no
//! duplicates. Clients validate this strictly: any entry whose index is not
//! the expected next index is unrecoverable desynchronization.

pub mod broadcast;
pub mod client;
pub mod event_log;
pub mod protocol;
pub mod server;

// Re-exports for convenience
pub use broadcast::{ConnectionHandle, ConnectionId, ConnectionRegistry};
pub use client::{
    connect, ChangeObserver, ClientError, ClientState, ConnectOptions, EntryOutcome, Reducer,
    StateMachine, SyncClient,
};
pub use event_log::{EventLog, EventLogError};
pub use protocol::{ClientMessage, LogEntry, ProtocolError};
pub use server::{ServerConfig, ServerError, SyncServer};
