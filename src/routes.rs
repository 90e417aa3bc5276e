//! Request-path routing for relay connections.
//!
//! Every WebSocket upgrade carries a path that selects the relay endpoint:
//!
//! | Path | Endpoint |
//! |------|----------|
//! | `/rooms/{roomId}` | room signaling, JSON text frames |
//! | `/crdt/{ns}/{id}` | document hub, legacy raw-update frames |
//! | `/yjs/{id}` | document hub, y-sync protocol frames |
//! | `/yjs/{id}?roid={alias}` | as above, plus read-only alias registration |
//! | `/yjs/ro--{alias}` | resolve alias, attach read-only |

/// Document keys carrying this prefix are alias lookups, not document ids.
pub const READ_ONLY_PREFIX: &str = "ro--";

/// A parsed relay endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    /// Room signaling connection.
    Room { room_id: String },
    /// Document hub connection speaking the legacy protocol: every binary
    /// frame is one raw yrs v1 update.
    LegacyDoc { ns: String, id: String },
    /// Document hub connection speaking the y-sync protocol. `alias`, when
    /// present, registers a read-only alias for `id` before attaching.
    Doc { id: String, alias: Option<String> },
    /// Alias lookup: attach read-only to the document the alias resolves to.
    ReadOnlyDoc { alias: String },
}

/// Parse a request path (and optional query string) into an endpoint.
///
/// Returns `None` for anything outside the table above, which the server
/// rejects before the WebSocket upgrade completes.
pub fn parse_endpoint(path: &str, query: Option<&str>) -> Option<Endpoint> {
    let segments: Vec<&str> = path.trim_start_matches('/').split('/').collect();
    match segments.as_slice() {
        ["rooms", room_id] if !room_id.is_empty() => Some(Endpoint::Room {
            room_id: (*room_id).to_string(),
        }),
        ["crdt", ns, id] if !ns.is_empty() && !id.is_empty() => Some(Endpoint::LegacyDoc {
            ns: (*ns).to_string(),
            id: (*id).to_string(),
        }),
        ["yjs", key] if !key.is_empty() => match key.strip_prefix(READ_ONLY_PREFIX) {
            Some("") => None,
            Some(alias) => Some(Endpoint::ReadOnlyDoc {
                alias: alias.to_string(),
            }),
            None => Some(Endpoint::Doc {
                id: (*key).to_string(),
                alias: query.and_then(roid_param),
            }),
        },
        _ => None,
    }
}

fn roid_param(query: &str) -> Option<String> {
    query
        .split('&')
        .find_map(|pair| pair.strip_prefix("roid="))
        .filter(|alias| !alias.is_empty())
        .map(str::to_string)
}
