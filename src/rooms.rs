//! Owner/peer room registry with addressed and broadcast routing.
//!
//! Per room id the state machine is:
//! ```text
//! Empty ── first join ──► Owned ── peer joins ──► Owned+Peers
//!   ▲                       │                        │
//!   └────── owner leaves (peers force-closed) ◄──────┘
//! ```
//!
//! The first connection to an unknown room id becomes its owner; everyone
//! after that is a peer. Owner frames are routed by their `to` field, peer
//! frames always go to the owner, wrapped. The registry is a sharded map so
//! operations on different room ids never contend; operations on one id are
//! serialized by its shard lock, which makes owner election deterministic
//! when two connections race on a fresh id.

use std::collections::HashMap;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::protocol::{ServerNotice, Target};

/// Outbound event for one room connection.
#[derive(Debug, Clone, PartialEq)]
pub enum RoomEvent {
    /// A text frame to deliver.
    Deliver(String),
    /// Force-close: the room is gone (owner left).
    Shutdown,
}

/// Per-connection outbound channel. Sends never block; a send to a closed
/// channel fails fast and is treated as the peer having disconnected.
pub type RoomSink = mpsc::UnboundedSender<RoomEvent>;

/// Role handed out by [`RoomRegistry::join`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoomRole {
    Owner,
    Peer { peer_id: Uuid },
}

struct Room {
    owner: RoomSink,
    peers: HashMap<Uuid, RoomSink>,
}

/// Registry of all live rooms, keyed by room id.
#[derive(Default)]
pub struct RoomRegistry {
    rooms: DashMap<String, Room>,
}

/// Room routing errors. All are local to the offending frame; none of them
/// affect the room's other participants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoomError {
    /// The room no longer exists (owner already left).
    UnknownRoom,
    /// An owner frame addressed a peer id that is not attached.
    UnknownPeer,
}

impl std::fmt::Display for RoomError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnknownRoom => write!(f, "unknown room"),
            Self::UnknownPeer => write!(f, "unknown peer"),
        }
    }
}

impl std::error::Error for RoomError {}

impl RoomRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a connection to a room, creating the room if the id is free.
    ///
    /// The role notice (`{"role":…}`) is queued on the joining connection's
    /// sink, and the owner is notified with `{"open":…}` when a peer joins.
    /// Both happen under the room's entry lock, so a racing pair of first
    /// connections resolves to exactly one owner and one peer.
    pub fn join(&self, room_id: &str, sink: RoomSink) -> RoomRole {
        match self.rooms.entry(room_id.to_string()) {
            Entry::Vacant(entry) => {
                let _ = sink.send(RoomEvent::Deliver(ServerNotice::owner_role().to_frame()));
                entry.insert(Room {
                    owner: sink,
                    peers: HashMap::new(),
                });
                log::info!("room {room_id}: created, owner attached");
                RoomRole::Owner
            }
            Entry::Occupied(mut entry) => {
                let peer_id = Uuid::new_v4();
                let room = entry.get_mut();
                let _ = sink.send(RoomEvent::Deliver(
                    ServerNotice::peer_role(peer_id).to_frame(),
                ));
                let _ = room
                    .owner
                    .send(RoomEvent::Deliver(ServerNotice::opened(peer_id).to_frame()));
                room.peers.insert(peer_id, sink);
                log::info!("room {room_id}: peer {peer_id} attached");
                RoomRole::Peer { peer_id }
            }
        }
    }

    /// Route an owner frame to its target(s). The frame text is delivered
    /// verbatim; it is never echoed back to the owner.
    ///
    /// A peer whose sink is already closed is pruned as if it had
    /// disconnected: the owner gets a `{"close":…}` notice for it.
    pub fn relay_from_owner(
        &self,
        room_id: &str,
        target: &Target,
        frame: &str,
    ) -> Result<(), RoomError> {
        let mut room = self.rooms.get_mut(room_id).ok_or(RoomError::UnknownRoom)?;
        match target {
            Target::Broadcast => {
                let dead: Vec<Uuid> = room
                    .peers
                    .iter()
                    .filter(|(_, sink)| {
                        sink.send(RoomEvent::Deliver(frame.to_string())).is_err()
                    })
                    .map(|(id, _)| *id)
                    .collect();
                for peer_id in dead {
                    log::warn!("room {room_id}: delivery to peer {peer_id} failed, pruning");
                    room.peers.remove(&peer_id);
                    let _ = room
                        .owner
                        .send(RoomEvent::Deliver(ServerNotice::closed(peer_id).to_frame()));
                }
                Ok(())
            }
            Target::Peer(raw_id) => {
                let peer_id = Uuid::parse_str(raw_id).map_err(|_| RoomError::UnknownPeer)?;
                let sink = room.peers.get(&peer_id).ok_or(RoomError::UnknownPeer)?;
                if sink.send(RoomEvent::Deliver(frame.to_string())).is_err() {
                    log::warn!("room {room_id}: delivery to peer {peer_id} failed, pruning");
                    room.peers.remove(&peer_id);
                    let _ = room
                        .owner
                        .send(RoomEvent::Deliver(ServerNotice::closed(peer_id).to_frame()));
                    return Err(RoomError::UnknownPeer);
                }
                Ok(())
            }
        }
    }

    /// Route a peer frame to the owner, wrapped as `{"from":…,"body":…}`.
    pub fn relay_from_peer(
        &self,
        room_id: &str,
        peer_id: Uuid,
        body: Value,
    ) -> Result<(), RoomError> {
        let room = self.rooms.get(room_id).ok_or(RoomError::UnknownRoom)?;
        let frame = ServerNotice::forward(peer_id, body).to_frame();
        if room.owner.send(RoomEvent::Deliver(frame)).is_err() {
            // Owner handler is already winding down; its leave() will
            // cascade shortly.
            log::debug!("room {room_id}: owner sink closed, dropping peer frame");
        }
        Ok(())
    }

    /// Detach a connection.
    ///
    /// Owner: the room entry is removed and every peer is force-closed; the
    /// room id is immediately available for re-creation. Peer: the entry is
    /// removed and the owner gets a `{"close":…}` notice.
    pub fn leave(&self, room_id: &str, role: &RoomRole) {
        match role {
            RoomRole::Owner => {
                if let Some((_, room)) = self.rooms.remove(room_id) {
                    for (peer_id, sink) in room.peers {
                        let _ = sink.send(RoomEvent::Shutdown);
                        log::debug!("room {room_id}: force-closing peer {peer_id}");
                    }
                    log::info!("room {room_id}: removed (owner left)");
                }
            }
            RoomRole::Peer { peer_id } => {
                if let Some(mut room) = self.rooms.get_mut(room_id) {
                    if room.peers.remove(peer_id).is_some() {
                        let _ = room
                            .owner
                            .send(RoomEvent::Deliver(ServerNotice::closed(*peer_id).to_frame()));
                        log::info!("room {room_id}: peer {peer_id} detached");
                    }
                }
            }
        }
    }

    /// Number of live rooms.
    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    /// Number of peers attached to a room, if it exists.
    pub fn peer_count(&self, room_id: &str) -> Option<usize> {
        self.rooms.get(room_id).map(|room| room.peers.len())
    }
}
