//! CRDT document hub: one canonical replica per key, one ephemeral replica
//! per connection, explicit merge links between them.
//!
//! Architecture:
//! ```text
//! Connection A ── DocSession A (ephemeral Doc) ──┐
//!                                                ├── SharedDoc (canonical Doc)
//! Connection B ── DocSession B (ephemeral Doc) ──┘         │
//!                                                          ▼
//!                                              broadcast fan-out (updates)
//!                                                          │
//!                                        ┌─────────────────┴───┐
//!                                        ▼                     ▼
//!                                   DocEvents A           DocEvents B
//! ```
//!
//! An update arriving on one connection is merged into that connection's
//! ephemeral replica, then into the canonical replica, then fanned out to
//! every other session on the key, which merges it into its own ephemeral
//! replica and forwards it to its transport. CRDT merge is commutative and
//! idempotent, so the replicas converge regardless of interleaving; that
//! property comes from yrs and is not reimplemented here.
//!
//! Teardown is explicit: dropping a [`DocSession`] / [`DocEvents`] pair
//! detaches the ephemeral replica and its fan-out subscription. Canonical
//! replicas are deliberately retained for the lifetime of the process —
//! there is no eviction.
//!
//! Reference: Kleppmann — Designing Data-Intensive Applications, Chapter 5

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{broadcast, Mutex};
use uuid::Uuid;
use yrs::updates::decoder::Decode;
use yrs::{Doc, ReadTxn, StateVector, Transact, Update};

/// Document key: namespace plus document id.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DocKey {
    pub ns: String,
    pub id: String,
}

impl DocKey {
    pub fn new(ns: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            ns: ns.into(),
            id: id.into(),
        }
    }

    /// Key for documents reached through the y-sync endpoints.
    pub fn yjs(id: impl Into<String>) -> Self {
        Self::new("yjs", id)
    }
}

impl std::fmt::Display for DocKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.ns, self.id)
    }
}

/// Payload of a fan-out event.
#[derive(Debug, Clone)]
pub enum DocPayload {
    /// A yrs v1 update that was merged into the canonical replica.
    Update(Arc<Vec<u8>>),
    /// A pre-encoded protocol frame relayed verbatim (awareness traffic);
    /// never merged into any replica.
    Relay(Arc<Vec<u8>>),
}

/// One fan-out event, tagged with the session that published it so
/// receivers can skip their own echo.
#[derive(Debug, Clone)]
pub struct DocEvent {
    pub source: Uuid,
    pub payload: DocPayload,
}

struct SharedDoc {
    key: DocKey,
    doc: Mutex<Doc>,
    updates: broadcast::Sender<DocEvent>,
}

impl SharedDoc {
    fn new(key: DocKey, capacity: usize) -> Self {
        let (updates, _) = broadcast::channel(capacity);
        log::info!("document {key}: canonical replica created");
        Self {
            key,
            doc: Mutex::new(Doc::new()),
            updates,
        }
    }
}

/// Hub errors. All are local to the offending frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HubError {
    /// The session is read-only; the update was not applied anywhere.
    ReadOnly,
    /// The payload did not decode as a yrs v1 update.
    InvalidUpdate(String),
    /// The update decoded but failed to merge.
    Merge(String),
}

impl std::fmt::Display for HubError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ReadOnly => write!(f, "session is read-only"),
            Self::InvalidUpdate(e) => write!(f, "invalid update: {e}"),
            Self::Merge(e) => write!(f, "merge failed: {e}"),
        }
    }
}

impl std::error::Error for HubError {}

/// Registry of canonical document replicas, keyed by `(namespace, id)`.
///
/// The map is sharded, so sessions on different keys never contend; two
/// simultaneous first-connections to one key create exactly one canonical
/// replica. Entries live for the process lifetime — no LRU, no TTL.
pub struct DocHub {
    docs: DashMap<DocKey, Arc<SharedDoc>>,
    fanout_capacity: usize,
}

impl DocHub {
    pub fn new(fanout_capacity: usize) -> Self {
        Self {
            docs: DashMap::new(),
            fanout_capacity,
        }
    }

    /// Attach a connection to a document key.
    ///
    /// Creates the canonical replica if the key is fresh, creates the
    /// connection's ephemeral replica primed with the canonical state, and
    /// subscribes it to the key's fan-out. Returns the session (the merge
    /// links) and its event stream; dropping them is the teardown.
    pub async fn attach(&self, key: DocKey, read_only: bool) -> (DocSession, DocEvents) {
        let capacity = self.fanout_capacity;
        let shared: Arc<SharedDoc> = self
            .docs
            .entry(key.clone())
            .or_insert_with(|| Arc::new(SharedDoc::new(key, capacity)))
            .clone();

        let conn_id = Uuid::new_v4();
        let rx = shared.updates.subscribe();
        let replica = Doc::new();

        let state = {
            let canonical = shared.doc.lock().await;
            let txn = canonical.transact();
            txn.encode_state_as_update_v1(&StateVector::default())
        };
        if let Ok(update) = Update::decode_v1(&state) {
            let mut txn = replica.transact_mut();
            let _ = txn.apply_update(update);
        }

        log::info!(
            "document {}: session {conn_id} attached{}",
            shared.key,
            if read_only { " (read-only)" } else { "" }
        );

        (
            DocSession {
                conn_id,
                read_only,
                replica,
                shared,
            },
            DocEvents { conn_id, rx },
        )
    }

    /// Number of canonical replicas currently held.
    pub fn doc_count(&self) -> usize {
        self.docs.len()
    }
}

impl Default for DocHub {
    fn default() -> Self {
        Self::new(256)
    }
}

/// A connection's attachment to one document: the ephemeral replica plus
/// its merge links to the canonical replica and the fan-out channel.
pub struct DocSession {
    conn_id: Uuid,
    read_only: bool,
    replica: Doc,
    shared: Arc<SharedDoc>,
}

impl DocSession {
    pub fn conn_id(&self) -> Uuid {
        self.conn_id
    }

    pub fn read_only(&self) -> bool {
        self.read_only
    }

    pub fn key(&self) -> &DocKey {
        &self.shared.key
    }

    /// The ephemeral replica. Mutations go through [`Self::apply_remote`]
    /// and [`Self::absorb`]; this is for inspection.
    pub fn replica(&self) -> &Doc {
        &self.replica
    }

    /// Full ephemeral state as one yrs v1 update.
    pub fn state_as_update(&self) -> Vec<u8> {
        let txn = self.replica.transact();
        txn.encode_state_as_update_v1(&StateVector::default())
    }

    /// State vector of the ephemeral replica.
    pub fn state_vector(&self) -> StateVector {
        self.replica.transact().state_vector()
    }

    /// Diff of the canonical replica against a remote state vector.
    pub async fn diff(&self, remote: &StateVector) -> Vec<u8> {
        let canonical = self.shared.doc.lock().await;
        let txn = canonical.transact();
        txn.encode_diff_v1(remote)
    }

    /// Merge an update received from this session's transport.
    ///
    /// The update flows ephemeral → canonical → fan-out. Read-only
    /// sessions reject it before anything is touched. Each update merged
    /// into the canonical replica leaves a structured log line naming the
    /// key and the update size; that logging is a side effect only and can
    /// never fail the merge.
    pub async fn apply_remote(&self, bytes: &[u8]) -> Result<(), HubError> {
        if self.read_only {
            return Err(HubError::ReadOnly);
        }
        if bytes.is_empty() {
            return Ok(());
        }

        let local = Update::decode_v1(bytes)
            .map_err(|e| HubError::InvalidUpdate(e.to_string()))?;
        {
            let mut txn = self.replica.transact_mut();
            txn.apply_update(local)
                .map_err(|e| HubError::Merge(e.to_string()))?;
        }

        let upstream = Update::decode_v1(bytes)
            .map_err(|e| HubError::InvalidUpdate(e.to_string()))?;
        {
            let canonical = self.shared.doc.lock().await;
            let mut txn = canonical.transact_mut();
            txn.apply_update(upstream)
                .map_err(|e| HubError::Merge(e.to_string()))?;
        }
        log::debug!(
            "UPDATE {} {} bytes from session {}",
            self.shared.key,
            bytes.len(),
            self.conn_id
        );

        let _ = self.shared.updates.send(DocEvent {
            source: self.conn_id,
            payload: DocPayload::Update(Arc::new(bytes.to_vec())),
        });
        Ok(())
    }

    /// Merge an update that arrived via fan-out from another session into
    /// the ephemeral replica.
    pub fn absorb(&self, bytes: &[u8]) {
        if let Ok(update) = Update::decode_v1(bytes) {
            let mut txn = self.replica.transact_mut();
            let _ = txn.apply_update(update);
        }
    }

    /// Relay a pre-encoded protocol frame (awareness traffic) to the other
    /// sessions on this key, verbatim.
    pub fn relay(&self, frame: &[u8]) {
        let _ = self.shared.updates.send(DocEvent {
            source: self.conn_id,
            payload: DocPayload::Relay(Arc::new(frame.to_vec())),
        });
    }
}

impl Drop for DocSession {
    fn drop(&mut self) {
        log::info!("document {}: session {} detached", self.shared.key, self.conn_id);
    }
}

/// Fan-out event stream for one session. Filters out the session's own
/// echo and survives lag by skipping (a lagged document client re-syncs
/// via the handshake).
pub struct DocEvents {
    conn_id: Uuid,
    rx: broadcast::Receiver<DocEvent>,
}

impl DocEvents {
    /// Next event originating from another session on the same key.
    pub async fn next(&mut self) -> Option<DocEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) if event.source == self.conn_id => continue,
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    log::warn!("session {} lagged by {n} document events", self.conn_id);
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::{timeout, Duration};
    use yrs::{GetString, Text, WriteTxn};

    /// Full state of a throwaway doc holding `content` in text `name`.
    fn text_update(name: &str, content: &str) -> Vec<u8> {
        let doc = Doc::new();
        {
            let mut txn = doc.transact_mut();
            let text = txn.get_or_insert_text(name);
            text.insert(&mut txn, 0, content);
        }
        let txn = doc.transact();
        txn.encode_state_as_update_v1(&StateVector::default())
    }

    fn text_of(doc: &Doc, name: &str) -> Option<String> {
        let txn = doc.transact();
        txn.get_text(name).map(|t| t.get_string(&txn))
    }

    #[tokio::test]
    async fn test_attach_creates_one_canonical_per_key() {
        let hub = DocHub::default();
        let (_s1, _e1) = hub.attach(DocKey::new("ns", "a"), false).await;
        let (_s2, _e2) = hub.attach(DocKey::new("ns", "a"), false).await;
        let (_s3, _e3) = hub.attach(DocKey::new("ns", "b"), false).await;
        assert_eq!(hub.doc_count(), 2);
    }

    #[tokio::test]
    async fn test_update_fans_out_and_converges() {
        let hub = DocHub::default();
        let key = DocKey::new("ns", "doc");
        let (s1, mut e1) = hub.attach(key.clone(), false).await;
        let (s2, mut e2) = hub.attach(key.clone(), false).await;

        // Disjoint edits from both sides.
        s1.apply_remote(&text_update("left", "ping")).await.unwrap();
        s2.apply_remote(&text_update("right", "pong")).await.unwrap();

        // Each side absorbs the other's update.
        match e2.next().await.unwrap().payload {
            DocPayload::Update(bytes) => s2.absorb(&bytes),
            DocPayload::Relay(_) => panic!("expected update"),
        }
        match e1.next().await.unwrap().payload {
            DocPayload::Update(bytes) => s1.absorb(&bytes),
            DocPayload::Relay(_) => panic!("expected update"),
        }

        for session in [&s1, &s2] {
            assert_eq!(text_of(session.replica(), "left").as_deref(), Some("ping"));
            assert_eq!(text_of(session.replica(), "right").as_deref(), Some("pong"));
        }
    }

    #[tokio::test]
    async fn test_no_echo_to_sender() {
        let hub = DocHub::default();
        let key = DocKey::new("ns", "doc");
        let (s1, mut e1) = hub.attach(key.clone(), false).await;
        let (_s2, _e2) = hub.attach(key, false).await;

        s1.apply_remote(&text_update("t", "x")).await.unwrap();
        let echoed = timeout(Duration::from_millis(100), e1.next()).await;
        assert!(echoed.is_err(), "sender must not receive its own update");
    }

    #[tokio::test]
    async fn test_late_session_primed_with_canonical_state() {
        let hub = DocHub::default();
        let key = DocKey::new("ns", "doc");
        let (s1, _e1) = hub.attach(key.clone(), false).await;
        s1.apply_remote(&text_update("t", "early")).await.unwrap();

        let (s2, _e2) = hub.attach(key, false).await;
        assert_eq!(text_of(s2.replica(), "t").as_deref(), Some("early"));
    }

    #[tokio::test]
    async fn test_read_only_session_rejects_updates() {
        let hub = DocHub::default();
        let key = DocKey::new("ns", "doc");
        let (ro, _e1) = hub.attach(key.clone(), true).await;

        assert_eq!(
            ro.apply_remote(&text_update("t", "nope")).await,
            Err(HubError::ReadOnly)
        );

        // Nothing reached the canonical replica.
        let (probe, _e2) = hub.attach(key, false).await;
        assert_eq!(text_of(probe.replica(), "t"), None);
    }

    #[tokio::test]
    async fn test_read_only_session_still_receives() {
        let hub = DocHub::default();
        let key = DocKey::new("ns", "doc");
        let (ro, mut events) = hub.attach(key.clone(), true).await;
        let (writer, _e2) = hub.attach(key, false).await;

        writer.apply_remote(&text_update("t", "hello")).await.unwrap();
        match events.next().await.unwrap().payload {
            DocPayload::Update(bytes) => ro.absorb(&bytes),
            DocPayload::Relay(_) => panic!("expected update"),
        }
        assert_eq!(text_of(ro.replica(), "t").as_deref(), Some("hello"));
    }

    #[tokio::test]
    async fn test_garbage_update_is_a_local_error() {
        let hub = DocHub::default();
        let (s1, _e1) = hub.attach(DocKey::new("ns", "doc"), false).await;
        assert!(matches!(
            s1.apply_remote(&[0xff, 0xfe, 0xfd]).await,
            Err(HubError::InvalidUpdate(_))
        ));
    }

    #[tokio::test]
    async fn test_detach_leaves_others_untouched() {
        let hub = DocHub::default();
        let key = DocKey::new("ns", "doc");
        let (s1, _e1) = hub.attach(key.clone(), false).await;
        let (s2, mut e2) = hub.attach(key.clone(), false).await;

        drop(s1);
        drop(_e1);

        s2.apply_remote(&text_update("t", "still here")).await.unwrap();
        assert_eq!(hub.doc_count(), 1);
        // s2's own echo is filtered; no event pending.
        assert!(timeout(Duration::from_millis(50), e2.next()).await.is_err());
    }

    #[tokio::test]
    async fn test_relay_frames_pass_through_unmerged() {
        let hub = DocHub::default();
        let key = DocKey::new("ns", "doc");
        let (s1, _e1) = hub.attach(key.clone(), false).await;
        let (_s2, mut e2) = hub.attach(key, false).await;

        s1.relay(&[1, 2, 3]);
        match e2.next().await.unwrap().payload {
            DocPayload::Relay(frame) => assert_eq!(*frame, vec![1, 2, 3]),
            DocPayload::Update(_) => panic!("expected relay"),
        }
    }
}
