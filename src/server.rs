//! WebSocket relay server: endpoint dispatch and per-connection loops.
//!
//! Architecture:
//! ```text
//!                         TcpListener
//!                              │
//!                     accept + handshake
//!                   (path → Endpoint, else 404)
//!                              │
//!            ┌─────────────────┼──────────────────┐
//!            ▼                 ▼                  ▼
//!      /rooms/{id}      /crdt/{ns}/{id}      /yjs/{id}
//!            │                 │                  │
//!       RoomRegistry        DocHub (legacy)    DocHub (y-sync)
//! ```
//!
//! One task per connection. Each task owns the WebSocket, runs a
//! `tokio::select!` loop over inbound frames and its outbound event
//! stream, and detaches from the shared state when the loop exits — on
//! clean close, transport error, or force-close alike.

use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use yrs::sync::{Message as YMessage, SyncMessage};
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;

use crate::alias::AliasTable;
use crate::hub::{DocEvents, DocHub, DocKey, DocPayload, DocSession, HubError};
use crate::protocol::{parse_owner_frame, parse_peer_frame, ServerNotice};
use crate::rooms::{RoomEvent, RoomRegistry, RoomRole};
use crate::routes::{parse_endpoint, Endpoint};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Fan-out channel capacity per document
    pub fanout_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:3000".to_string(),
            fanout_capacity: 256,
        }
    }
}

impl ServerConfig {
    /// Configuration from the environment: `PORT` selects the listen port
    /// (bound on all interfaces); everything else is defaulted.
    pub fn from_env() -> Self {
        match std::env::var("PORT").ok().and_then(|p| p.parse::<u16>().ok()) {
            Some(port) => Self {
                bind_addr: format!("0.0.0.0:{port}"),
                ..Self::default()
            },
            None => Self::default(),
        }
    }
}

/// Wire protocol spoken on a document connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WireProtocol {
    /// Every binary frame is one raw yrs v1 update.
    Legacy,
    /// y-sync framing: sync step 1/2, update, awareness.
    YSync,
}

/// The relay server.
pub struct RelayServer {
    config: ServerConfig,
    rooms: Arc<RoomRegistry>,
    hub: Arc<DocHub>,
    aliases: Arc<AliasTable>,
}

impl RelayServer {
    pub fn new(config: ServerConfig) -> Self {
        let hub = Arc::new(DocHub::new(config.fanout_capacity));
        Self {
            config,
            rooms: Arc::new(RoomRegistry::new()),
            hub,
            aliases: Arc::new(AliasTable::new()),
        }
    }

    /// Create with default configuration.
    pub fn with_defaults() -> Self {
        Self::new(ServerConfig::default())
    }

    /// Get the configured bind address.
    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    /// Start listening for WebSocket connections.
    ///
    /// This runs the server event loop. Call from an async runtime.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error>> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("relay listening on {}", self.config.bind_addr);

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("new TCP connection from {addr}");

            let rooms = self.rooms.clone();
            let hub = self.hub.clone();
            let aliases = self.aliases.clone();

            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, rooms, hub, aliases).await {
                    log::error!("connection error from {addr}: {e}");
                }
            });
        }
    }

    /// Handle a single WebSocket connection.
    ///
    /// The request path is inspected during the handshake; a path outside
    /// the routing table rejects the upgrade with 404 before any relay
    /// state is touched.
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        rooms: Arc<RoomRegistry>,
        hub: Arc<DocHub>,
        aliases: Arc<AliasTable>,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let mut endpoint: Option<Endpoint> = None;
        let ws_stream = tokio_tungstenite::accept_hdr_async(
            stream,
            |req: &Request, resp: Response| match parse_endpoint(req.uri().path(), req.uri().query())
            {
                Some(parsed) => {
                    endpoint = Some(parsed);
                    Ok(resp)
                }
                None => {
                    log::warn!("rejecting upgrade from {addr}: no endpoint at {}", req.uri());
                    let mut reject = ErrorResponse::new(Some("no such endpoint".to_string()));
                    *reject.status_mut() = StatusCode::NOT_FOUND;
                    Err(reject)
                }
            },
        )
        .await?;

        // The callback ran exactly once on the accept path.
        let endpoint = match endpoint {
            Some(endpoint) => endpoint,
            None => return Ok(()),
        };

        log::info!("WebSocket connection established from {addr}: {endpoint:?}");

        match endpoint {
            Endpoint::Room { room_id } => {
                Self::run_room(ws_stream, rooms, room_id).await;
            }
            Endpoint::LegacyDoc { ns, id } => {
                let (session, events) = hub.attach(DocKey::new(ns, id), false).await;
                Self::run_doc(ws_stream, session, events, WireProtocol::Legacy).await;
            }
            Endpoint::Doc { id, alias } => {
                if let Some(alias) = alias {
                    aliases.register(&alias, &id);
                }
                let (session, events) = hub.attach(DocKey::yjs(id), false).await;
                Self::run_doc(ws_stream, session, events, WireProtocol::YSync).await;
            }
            Endpoint::ReadOnlyDoc { alias } => match aliases.resolve(&alias) {
                Some(id) => {
                    let (session, events) = hub.attach(DocKey::yjs(id), true).await;
                    Self::run_doc(ws_stream, session, events, WireProtocol::YSync).await;
                }
                None => {
                    log::warn!("unknown read-only alias {alias:?} from {addr}, closing");
                    let mut ws = ws_stream;
                    let _ = ws.close(None).await;
                }
            },
        }

        Ok(())
    }

    /// Room connection loop: join, relay until the transport or the room
    /// goes away, then leave. `leave` always runs, so a dropped transport
    /// produces the same notices as a clean close.
    async fn run_room(
        ws_stream: WebSocketStream<TcpStream>,
        rooms: Arc<RoomRegistry>,
        room_id: String,
    ) {
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let role = rooms.join(&room_id, tx);

        loop {
            tokio::select! {
                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            if let Some(notice) =
                                route_room_frame(&rooms, &room_id, &role, text.as_str())
                            {
                                if ws_sender.send(Message::text(notice.to_frame())).await.is_err() {
                                    break;
                                }
                            }
                        }
                        Some(Ok(Message::Binary(_))) => {
                            // Rooms speak JSON text only.
                            let notice = ServerNotice::bad_payload();
                            if ws_sender.send(Message::text(notice.to_frame())).await.is_err() {
                                break;
                            }
                        }
                        Some(Ok(Message::Ping(data))) => {
                            if ws_sender.send(Message::Pong(data)).await.is_err() {
                                break;
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Err(e)) => {
                            log::debug!("room {room_id}: transport error: {e}");
                            break;
                        }
                        _ => {}
                    }
                }

                event = rx.recv() => {
                    match event {
                        Some(RoomEvent::Deliver(text)) => {
                            if ws_sender.send(Message::text(text)).await.is_err() {
                                break;
                            }
                        }
                        Some(RoomEvent::Shutdown) => {
                            let _ = ws_sender.send(Message::Close(None)).await;
                            break;
                        }
                        None => break,
                    }
                }
            }
        }

        rooms.leave(&room_id, &role);
    }

    /// Document connection loop: hello frame, then relay until the
    /// transport goes away. Dropping the session at the end is the detach.
    async fn run_doc(
        ws_stream: WebSocketStream<TcpStream>,
        session: DocSession,
        mut events: DocEvents,
        protocol: WireProtocol,
    ) {
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        // Hello: legacy clients get the full state as one update, y-sync
        // clients get sync step 1 carrying our state vector.
        let hello = match protocol {
            WireProtocol::Legacy => session.state_as_update(),
            WireProtocol::YSync => {
                YMessage::Sync(SyncMessage::SyncStep1(session.state_vector())).encode_v1()
            }
        };
        if ws_sender.send(Message::Binary(hello.into())).await.is_err() {
            return;
        }

        loop {
            tokio::select! {
                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(Message::Binary(data))) => {
                            let bytes: Vec<u8> = data.into();
                            if let Some(reply) = route_doc_frame(&session, protocol, &bytes).await {
                                if ws_sender.send(Message::Binary(reply.into())).await.is_err() {
                                    break;
                                }
                            }
                        }
                        Some(Ok(Message::Ping(data))) => {
                            if ws_sender.send(Message::Pong(data)).await.is_err() {
                                break;
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Err(e)) => {
                            log::debug!("document {}: transport error: {e}", session.key());
                            break;
                        }
                        _ => {}
                    }
                }

                event = events.next() => {
                    match event {
                        Some(event) => {
                            let frame = match event.payload {
                                DocPayload::Update(bytes) => {
                                    session.absorb(&bytes);
                                    match protocol {
                                        WireProtocol::Legacy => Some(bytes.to_vec()),
                                        WireProtocol::YSync => Some(
                                            YMessage::Sync(SyncMessage::Update(bytes.to_vec()))
                                                .encode_v1(),
                                        ),
                                    }
                                }
                                // Awareness frames are y-sync framing; a
                                // legacy client cannot decode them.
                                DocPayload::Relay(frame) => match protocol {
                                    WireProtocol::YSync => Some(frame.to_vec()),
                                    WireProtocol::Legacy => None,
                                },
                            };
                            if let Some(frame) = frame {
                                if ws_sender.send(Message::Binary(frame.into())).await.is_err() {
                                    break;
                                }
                            }
                        }
                        None => break,
                    }
                }
            }
        }
    }
}

/// Route one room text frame. Returns a notice to send back to the sender,
/// if any. Routing failures never touch the room's other participants.
fn route_room_frame(
    rooms: &RoomRegistry,
    room_id: &str,
    role: &RoomRole,
    text: &str,
) -> Option<ServerNotice> {
    match role {
        RoomRole::Owner => match parse_owner_frame(text) {
            Ok(target) => match rooms.relay_from_owner(room_id, &target, text) {
                Ok(()) => None,
                Err(crate::rooms::RoomError::UnknownPeer) => Some(ServerNotice::unknown_peer()),
                Err(crate::rooms::RoomError::UnknownRoom) => None,
            },
            Err(_) => Some(ServerNotice::bad_payload()),
        },
        RoomRole::Peer { peer_id } => match parse_peer_frame(text) {
            Ok(body) => {
                let _ = rooms.relay_from_peer(room_id, *peer_id, body);
                None
            }
            Err(_) => Some(ServerNotice::bad_payload()),
        },
    }
}

/// Route one document binary frame. Returns a reply frame, if any.
/// Malformed or rejected frames are dropped with a log line; the
/// connection stays up.
async fn route_doc_frame(
    session: &DocSession,
    protocol: WireProtocol,
    bytes: &[u8],
) -> Option<Vec<u8>> {
    match protocol {
        WireProtocol::Legacy => {
            match session.apply_remote(bytes).await {
                Ok(()) => {}
                Err(e) => log::warn!("document {}: dropped frame: {e}", session.key()),
            }
            None
        }
        WireProtocol::YSync => match YMessage::decode_v1(bytes) {
            Ok(YMessage::Sync(SyncMessage::SyncStep1(remote_sv))) => {
                let diff = session.diff(&remote_sv).await;
                Some(YMessage::Sync(SyncMessage::SyncStep2(diff)).encode_v1())
            }
            Ok(YMessage::Sync(SyncMessage::SyncStep2(update)))
            | Ok(YMessage::Sync(SyncMessage::Update(update))) => {
                match session.apply_remote(&update).await {
                    Ok(()) => {}
                    Err(HubError::ReadOnly) => {
                        log::debug!("document {}: update from read-only session dropped", session.key());
                    }
                    Err(e) => log::warn!("document {}: dropped frame: {e}", session.key()),
                }
                None
            }
            Ok(YMessage::Awareness(_)) | Ok(YMessage::AwarenessQuery) => {
                // Presence is not a document mutation; read-only sessions
                // may announce themselves too.
                session.relay(bytes);
                None
            }
            Ok(other) => {
                log::debug!("document {}: unhandled message {other:?}", session.key());
                None
            }
            Err(e) => {
                log::warn!("document {}: undecodable frame: {e}", session.key());
                None
            }
        },
    }
}
