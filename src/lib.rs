//! # collab-relay — Room signaling and CRDT document relay
//!
//! A WebSocket relay with two kinds of endpoints: signaling rooms, where
//! one owner connection exchanges JSON frames with addressable peers, and
//! document endpoints, where every connection converges on a shared CRDT
//! document.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   /rooms/{id}    ┌──────────────┐
//! │  Owner   │ ◄───────────────► │              │
//! └──────────┘   JSON frames    │ RelayServer  │
//! ┌──────────┐                  │              │
//! │  Peer N  │ ◄───────────────► │  RoomRegistry│
//! └──────────┘                  └──────┬───────┘
//!                                      │
//! ┌──────────┐  /crdt/{ns}/{id}        │
//! │ Client A │ ◄──────────────┐  ┌─────┴────────┐
//! └──────────┘  raw updates   ├──►   DocHub     │
//! ┌──────────┐  /yjs/{id}     │  │ (canonical + │
//! │ Client B │ ◄──────────────┘  │  ephemeral   │
//! └──────────┘  y-sync frames    │  replicas)   │
//!                                └─────┬────────┘
//!                 /yjs/ro--{alias}     │
//!                     AliasTable ──────┘ (read-only attach)
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — JSON envelope for room signaling
//! - [`routes`] — request-path routing table
//! - [`rooms`] — owner/peer room registry and frame routing
//! - [`hub`] — CRDT document hub (canonical + ephemeral replicas)
//! - [`alias`] — read-only alias table
//! - [`server`] — WebSocket relay server

pub mod alias;
pub mod hub;
pub mod protocol;
pub mod rooms;
pub mod routes;
pub mod server;

// Re-exports for convenience
pub use alias::AliasTable;
pub use hub::{DocEvent, DocEvents, DocHub, DocKey, DocPayload, DocSession, HubError};
pub use protocol::{
    parse_owner_frame, parse_peer_frame, EnvelopeError, Role, ServerNotice, Target,
};
pub use rooms::{RoomError, RoomEvent, RoomRegistry, RoomRole, RoomSink};
pub use routes::{parse_endpoint, Endpoint, READ_ONLY_PREFIX};
pub use server::{RelayServer, ServerConfig};
