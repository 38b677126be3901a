//! Replication core
//!
//! One actor owns every call to `EntryLog::append`:
//!
//! ```text
//!   session tasks          ReplicationHandle (Clone)
//!        │                          │
//!        └────── mpsc (bounded) ────┘
//!                      │
//!                      ▼
//!             ReplicationActor (single task)
//!               verify → order → append
//!                      │
//!          ┌───────────┴────────────┐
//!          ▼                        ▼
//!   EntryLog::append      SessionManager::broadcast
//! ```
//!
//! Per-session order is preserved because each session awaits the decision
//! for one envelope before forwarding the next.

use crate::codec::{CatchUpRange, Envelope, EnvelopeKind};
use crate::session::{CloseReason, SessionId, SessionManager};
use crate::{NodeConfig, NodeError, Result};
use ash_ledger::{Digest, EntryLog, HybridClock, KeyPair, LedgerEntry, PublicKey, StoreError};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Outcome of one call into the core
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// Appended at this sequence
    Accepted(u64),
    /// Already stored; nothing changed
    Duplicate(u64),
    /// Held until the gap before it closes
    Buffered(u64),
    /// Discarded
    Rejected(RejectReason),
    /// Catch-up request answered with this many entries
    Served(usize),
}

/// Why an envelope was discarded
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectReason {
    /// Hash or signature did not verify
    InvalidSignature,
    /// Signed by a key other than the session's
    SignerMismatch,
    /// Conflicts with the stored chain
    ChainMismatch {
        /// Sequence of the conflicting envelope
        sequence: u64,
    },
    /// Pending buffer full
    PendingFull,
    /// Handshake message after the handshake
    UnexpectedKind(EnvelopeKind),
    /// Catch-up payload invalid
    BadRange,
    /// Session not known to the core
    UnknownSession,
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RejectReason::InvalidSignature => f.write_str("invalid signature"),
            RejectReason::SignerMismatch => f.write_str("signer mismatch"),
            RejectReason::ChainMismatch { sequence } => {
                write!(f, "chain mismatch at {}", sequence)
            }
            RejectReason::PendingFull => f.write_str("pending buffer full"),
            RejectReason::UnexpectedKind(kind) => write!(f, "unexpected {}", kind),
            RejectReason::BadRange => f.write_str("bad catch-up range"),
            RejectReason::UnknownSession => f.write_str("unknown session"),
        }
    }
}

/// Snapshot returned by [`ReplicationHandle::status`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeStatus {
    /// Ledger tail sequence
    pub tail_sequence: u64,
    /// Ledger tail hash
    pub tail_hash: Digest,
    /// Envelopes waiting for a gap to close
    pub pending: usize,
    /// Sessions known to the core
    pub sessions: usize,
}

/// Tunables for the core
#[derive(Debug, Clone)]
pub struct ReplicationConfig {
    /// Verification failures tolerated per session
    pub failure_threshold: u32,
    /// Pending buffer bound
    pub max_pending: usize,
    /// Entries served or requested per catch-up
    pub catchup_batch_size: u64,
    /// Re-request after this long without progress
    pub catchup_timeout: Duration,
    /// Mailbox capacity
    pub mailbox_capacity: usize,
}

impl From<&NodeConfig> for ReplicationConfig {
    fn from(config: &NodeConfig) -> Self {
        Self {
            failure_threshold: config.failure_threshold,
            max_pending: config.max_pending,
            catchup_batch_size: config.catchup_batch_size,
            catchup_timeout: Duration::from_millis(config.catchup_timeout_ms),
            mailbox_capacity: config.mailbox_capacity,
        }
    }
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self::from(&NodeConfig::default())
    }
}

/// Message sent to the replication actor
#[derive(Debug)]
pub enum ReplicationMessage {
    /// Envelope received on an Active session
    Inbound {
        session: SessionId,
        envelope: Envelope,
        response: oneshot::Sender<Result<Decision>>,
    },

    /// Session finished its handshake
    SessionOpened {
        session: SessionId,
        peer: PublicKey,
        response: oneshot::Sender<()>,
    },

    /// Session gone
    SessionClosed { session: SessionId },

    /// Locally originated update
    Submit {
        payload: Vec<u8>,
        response: oneshot::Sender<Result<LedgerEntry>>,
    },

    /// Get status
    Status {
        response: oneshot::Sender<NodeStatus>,
    },

    /// Shutdown actor
    Shutdown,
}

struct PeerRecord {
    key: PublicKey,
    failures: u32,
}

struct PendingEnvelope {
    envelope: Envelope,
    origin: SessionId,
}

struct Outstanding {
    range: CatchUpRange,
    session: SessionId,
    issued_at: Instant,
}

/// Actor that serializes all ledger writes
pub struct ReplicationActor {
    store: Arc<dyn EntryLog>,
    sessions: Arc<SessionManager>,
    keypair: Arc<KeyPair>,
    clock: HybridClock,
    config: ReplicationConfig,
    mailbox: mpsc::Receiver<ReplicationMessage>,
    peers: HashMap<SessionId, PeerRecord>,
    pending: BTreeMap<u64, PendingEnvelope>,
    outstanding: Option<Outstanding>,
    fatal: watch::Sender<Option<String>>,
}

impl ReplicationActor {
    /// Run the actor event loop
    pub async fn run(mut self) {
        while let Some(msg) = self.mailbox.recv().await {
            if let ReplicationMessage::Shutdown = msg {
                break;
            }

            if let Err(NodeError::Fatal(reason)) = self.handle_message(msg) {
                tracing::error!(reason = %reason, "Ledger write failed; replication stopped");
                self.fatal.send_replace(Some(reason));
                break;
            }
        }

        tracing::info!(tail_sequence = self.store.tail_sequence(), "Replication core stopped");
    }

    fn handle_message(&mut self, msg: ReplicationMessage) -> Result<()> {
        match msg {
            ReplicationMessage::Inbound {
                session,
                envelope,
                response,
            } => {
                let result = self.on_inbound(session, envelope);
                let fatal = match &result {
                    Err(NodeError::Fatal(reason)) => Some(reason.clone()),
                    _ => None,
                };
                let _ = response.send(result);
                if let Some(reason) = fatal {
                    return Err(NodeError::Fatal(reason));
                }
            }

            ReplicationMessage::SessionOpened {
                session,
                peer,
                response,
            } => {
                self.peers.insert(
                    session,
                    PeerRecord {
                        key: peer,
                        failures: 0,
                    },
                );
                let _ = response.send(());
            }

            ReplicationMessage::SessionClosed { session } => {
                self.peers.remove(&session);
                if self.outstanding.as_ref().map(|o| o.session) == Some(session) {
                    self.outstanding = None;
                }
            }

            ReplicationMessage::Submit { payload, response } => {
                let result = self.on_submit(payload);
                let fatal = match &result {
                    Err(NodeError::Fatal(reason)) => Some(reason.clone()),
                    _ => None,
                };
                let _ = response.send(result);
                if let Some(reason) = fatal {
                    return Err(NodeError::Fatal(reason));
                }
            }

            ReplicationMessage::Status { response } => {
                let tail = self.store.tail();
                let _ = response.send(NodeStatus {
                    tail_sequence: tail.sequence,
                    tail_hash: tail.hash,
                    pending: self.pending.len(),
                    sessions: self.peers.len(),
                });
            }

            ReplicationMessage::Shutdown => {
                // Handled in main loop
            }
        }

        Ok(())
    }

    fn on_inbound(&mut self, session: SessionId, envelope: Envelope) -> Result<Decision> {
        let Some(peer) = self.peers.get(&session) else {
            return Ok(Decision::Rejected(RejectReason::UnknownSession));
        };
        let peer_key = peer.key;

        if !envelope.kind.carries_entry() && envelope.kind != EnvelopeKind::CatchupRequest {
            return Ok(self.strike(session, RejectReason::UnexpectedKind(envelope.kind)));
        }

        if !envelope.verify() {
            return Ok(self.strike(session, RejectReason::InvalidSignature));
        }

        if envelope.signer != peer_key {
            return Ok(self.strike(session, RejectReason::SignerMismatch));
        }

        match envelope.kind {
            EnvelopeKind::CatchupRequest => match CatchUpRange::decode(&envelope.payload) {
                Ok(range) => self.serve_catchup(session, range),
                Err(_) => Ok(self.strike(session, RejectReason::BadRange)),
            },
            _ => self.on_entry(session, envelope),
        }
    }

    /// Ordering rules for `update` and `catchup_response`
    fn on_entry(&mut self, session: SessionId, envelope: Envelope) -> Result<Decision> {
        let tail = self.store.tail_sequence();
        let sequence = envelope.sequence;

        if sequence == tail + 1 {
            let decision = self.accept(&envelope, Some(session))?;
            if let Decision::Accepted(_) = decision {
                self.drain_pending()?;
                self.request_missing(session);
            }
            return Ok(decision);
        }

        if sequence > tail + 1 {
            let decision = self.buffer(envelope, session);
            self.request_missing(session);
            return Ok(decision);
        }

        self.compare_stale(session, &envelope)
    }

    /// Append `envelope` at the tail and fan it out
    fn accept(&mut self, envelope: &Envelope, origin: Option<SessionId>) -> Result<Decision> {
        let Some(predecessor_hash) = envelope.predecessor_hash else {
            return Ok(Decision::Rejected(RejectReason::ChainMismatch {
                sequence: envelope.sequence,
            }));
        };

        let entry = LedgerEntry {
            sequence: envelope.sequence,
            payload: envelope.payload.clone(),
            accepted_at: self.clock.now(),
            predecessor_hash,
        };

        match self.append(&entry, origin)? {
            true => Ok(Decision::Accepted(entry.sequence)),
            false => Ok(Decision::Rejected(RejectReason::ChainMismatch {
                sequence: entry.sequence,
            })),
        }
    }

    /// Returns false on a recoverable ordering conflict
    fn append(&mut self, entry: &LedgerEntry, origin: Option<SessionId>) -> Result<bool> {
        match self.store.append(entry) {
            Ok(()) => {
                tracing::info!(
                    sequence = entry.sequence,
                    session = ?origin,
                    accepted_at = %entry.accepted_at,
                    "Entry accepted"
                );

                if let Some(outstanding) = &self.outstanding {
                    if entry.sequence >= outstanding.range.to {
                        self.outstanding = None;
                    }
                }

                let update = Envelope::update(entry, &self.keypair);
                let fanout = self.sessions.broadcast(&update, origin);
                tracing::debug!(sequence = entry.sequence, fanout, "Update broadcast");
                Ok(true)
            }
            Err(StoreError::ChainMismatch { sequence }) => {
                tracing::warn!(
                    sequence,
                    session = ?origin,
                    predecessor = %entry.predecessor_hash,
                    tail_hash = %self.store.tail_hash(),
                    "Chain mismatch anomaly"
                );
                Ok(false)
            }
            Err(StoreError::SequenceGap { expected, got }) => {
                tracing::warn!(expected, got, session = ?origin, "Sequence gap on append");
                Ok(false)
            }
            Err(e) if e.is_fatal() => Err(NodeError::Fatal(e.to_string())),
            Err(e) => Err(e.into()),
        }
    }

    /// Accept buffered envelopes that became contiguous
    fn drain_pending(&mut self) -> Result<()> {
        loop {
            let tail = self.store.tail_sequence();
            self.pending = self.pending.split_off(&(tail + 1));

            let Some(next) = self.pending.remove(&(tail + 1)) else {
                return Ok(());
            };

            match self.accept(&next.envelope, Some(next.origin))? {
                Decision::Accepted(_) => continue,
                _ => return Ok(()),
            }
        }
    }

    fn buffer(&mut self, envelope: Envelope, origin: SessionId) -> Decision {
        let sequence = envelope.sequence;

        if self.pending.contains_key(&sequence) {
            return Decision::Buffered(sequence);
        }

        if self.pending.len() >= self.config.max_pending {
            tracing::warn!(sequence, session = origin, "Pending buffer full");
            return Decision::Rejected(RejectReason::PendingFull);
        }

        tracing::debug!(sequence, session = origin, "Buffered out-of-order envelope");
        self.pending
            .insert(sequence, PendingEnvelope { envelope, origin });
        Decision::Buffered(sequence)
    }

    /// Ask `session` for the gap before the lowest pending envelope
    fn request_missing(&mut self, session: SessionId) {
        let tail = self.store.tail_sequence();
        let Some((&first_pending, _)) = self.pending.iter().next() else {
            return;
        };
        if first_pending <= tail + 1 {
            return;
        }

        let from = tail + 1;
        let to = (first_pending - 1).min(from + self.config.catchup_batch_size.saturating_sub(1));
        let wanted = CatchUpRange { from, to };

        if let Some(outstanding) = &self.outstanding {
            let fresh = outstanding.issued_at.elapsed() < self.config.catchup_timeout;
            if fresh && outstanding.range.covers(&CatchUpRange { from, to: from }) {
                return;
            }
        }

        let request = Envelope::catchup_request(wanted, &self.keypair);
        match self.sessions.deliver(session, request) {
            Ok(()) => {
                tracing::info!(session, range = %wanted, "Catch-up requested");
                self.outstanding = Some(Outstanding {
                    range: wanted,
                    session,
                    issued_at: Instant::now(),
                });
            }
            Err(e) => {
                tracing::warn!(session, range = %wanted, error = %e, "Catch-up request not sent");
            }
        }
    }

    /// Envelope at or below the tail: duplicate or conflict
    fn compare_stale(&mut self, session: SessionId, envelope: &Envelope) -> Result<Decision> {
        let stored = self.store.get(envelope.sequence)?;

        if Some(stored.predecessor_hash) == envelope.predecessor_hash
            && stored.payload == envelope.payload
        {
            tracing::debug!(sequence = envelope.sequence, session, "Duplicate envelope");
            return Ok(Decision::Duplicate(envelope.sequence));
        }

        tracing::warn!(
            sequence = envelope.sequence,
            session,
            "Chain mismatch anomaly: conflicting update for accepted sequence"
        );
        Ok(Decision::Rejected(RejectReason::ChainMismatch {
            sequence: envelope.sequence,
        }))
    }

    fn serve_catchup(&mut self, session: SessionId, range: CatchUpRange) -> Result<Decision> {
        // Never queue more than the requester can take right now
        let room = self.sessions.free_capacity(session).unwrap_or(0) as u64;
        let batch = self.config.catchup_batch_size.min(room);
        if batch == 0 {
            tracing::warn!(session, range = %range, "Catch-up deferred; outbound queue full");
            return Ok(Decision::Served(0));
        }
        let to = range.to.min(range.from.saturating_add(batch - 1));

        let mut served = 0;
        for entry in self.store.entries(range.from, to) {
            let entry = entry?;
            let response = Envelope::catchup_response(&entry, &self.keypair);
            if let Err(e) = self.sessions.deliver(session, response) {
                tracing::warn!(session, error = %e, served, "Catch-up interrupted");
                break;
            }
            served += 1;
        }

        tracing::info!(session, range = %range, served, "Catch-up served");
        Ok(Decision::Served(served))
    }

    fn on_submit(&mut self, payload: Vec<u8>) -> Result<LedgerEntry> {
        let tail = self.store.tail();
        let entry = LedgerEntry {
            sequence: tail.sequence + 1,
            payload,
            accepted_at: self.clock.now(),
            predecessor_hash: tail.hash,
        };

        if !self.append(&entry, None)? {
            return Err(StoreError::ChainMismatch {
                sequence: entry.sequence,
            }
            .into());
        }

        self.drain_pending()?;
        Ok(entry)
    }

    /// Count a failure; close the session once it exceeds the threshold
    fn strike(&mut self, session: SessionId, reason: RejectReason) -> Decision {
        if let Some(peer) = self.peers.get_mut(&session) {
            peer.failures += 1;
            tracing::warn!(
                session,
                peer = %peer.key,
                reason = %reason,
                failures = peer.failures,
                "Envelope rejected"
            );

            if peer.failures > self.config.failure_threshold {
                tracing::warn!(session, peer = %peer.key, "Failure threshold exceeded");
                self.sessions.close(session, CloseReason::ProtocolViolation);
            }
        }

        Decision::Rejected(reason)
    }
}

/// Handle for sending messages to the actor
#[derive(Debug, Clone)]
pub struct ReplicationHandle {
    sender: mpsc::Sender<ReplicationMessage>,
    fatal: watch::Receiver<Option<String>>,
}

impl ReplicationHandle {
    fn closed(&self) -> NodeError {
        match self.fatal.borrow().clone() {
            Some(reason) => NodeError::Fatal(reason),
            None => NodeError::Concurrency("Actor mailbox closed".to_string()),
        }
    }

    async fn request<T>(
        &self,
        msg: impl FnOnce(oneshot::Sender<T>) -> ReplicationMessage,
    ) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(msg(tx))
            .await
            .map_err(|_| self.closed())?;

        rx.await.map_err(|_| self.closed())
    }

    /// Process an envelope received on `session`
    pub async fn inbound(&self, session: SessionId, envelope: Envelope) -> Result<Decision> {
        self.request(|response| ReplicationMessage::Inbound {
            session,
            envelope,
            response,
        })
        .await?
    }

    /// Register an authenticated session
    pub async fn session_opened(&self, session: SessionId, peer: PublicKey) -> Result<()> {
        self.request(|response| ReplicationMessage::SessionOpened {
            session,
            peer,
            response,
        })
        .await
    }

    /// Forget a session
    pub async fn session_closed(&self, session: SessionId) -> Result<()> {
        self.sender
            .send(ReplicationMessage::SessionClosed { session })
            .await
            .map_err(|_| self.closed())
    }

    /// Append a locally originated update and broadcast it
    pub async fn submit(&self, payload: Vec<u8>) -> Result<LedgerEntry> {
        self.request(|response| ReplicationMessage::Submit { payload, response })
            .await?
    }

    /// Get status
    pub async fn status(&self) -> Result<NodeStatus> {
        self.request(|response| ReplicationMessage::Status { response })
            .await
    }

    /// Resolves once the actor has stopped on a fatal store error
    pub async fn fatal(&self) -> String {
        let mut fatal = self.fatal.clone();
        loop {
            if let Some(reason) = fatal.borrow_and_update().clone() {
                return reason;
            }
            if fatal.changed().await.is_err() {
                // Actor exited cleanly; never resolve
                std::future::pending::<()>().await;
            }
        }
    }

    /// Shutdown actor
    pub async fn shutdown(&self) -> Result<()> {
        self.sender
            .send(ReplicationMessage::Shutdown)
            .await
            .map_err(|_| self.closed())?;
        Ok(())
    }
}

/// Spawn the replication actor
pub fn spawn_replication_actor(
    store: Arc<dyn EntryLog>,
    sessions: Arc<SessionManager>,
    keypair: Arc<KeyPair>,
    config: ReplicationConfig,
) -> (ReplicationHandle, JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(config.mailbox_capacity.max(1)); // Bounded channel for backpressure
    let (fatal_tx, fatal_rx) = watch::channel(None);

    let actor = ReplicationActor {
        clock: HybridClock::starting_after(store.tail().accepted_at),
        store,
        sessions,
        keypair,
        config,
        mailbox: rx,
        peers: HashMap::new(),
        pending: BTreeMap::new(),
        outstanding: None,
        fatal: fatal_tx,
    };

    let task = tokio::spawn(async move {
        actor.run().await;
    });

    (
        ReplicationHandle {
            sender: tx,
            fatal: fatal_rx,
        },
        task,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionRegistration;
    use ash_ledger::{ChainTail, LedgerStore, StoreConfig};
    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tempfile::TempDir;

    struct Harness {
        handle: ReplicationHandle,
        store: Arc<LedgerStore>,
        sessions: Arc<SessionManager>,
        _temp: TempDir,
    }

    impl Harness {
        fn new(config: ReplicationConfig) -> Self {
            let temp = TempDir::new().unwrap();
            let store = Arc::new(LedgerStore::open(&StoreConfig::at(temp.path())).unwrap());
            let sessions = Arc::new(SessionManager::new(64));
            let keypair = Arc::new(KeyPair::from_seed(&[0xaa; 32]));
            let (handle, _task) =
                spawn_replication_actor(store.clone(), sessions.clone(), keypair, config);
            Self {
                handle,
                store,
                sessions,
                _temp: temp,
            }
        }

        async fn open(&self, peer: &KeyPair) -> SessionRegistration {
            let addr: SocketAddr = "127.0.0.1:1".parse().unwrap();
            let reg = self.sessions.register(peer.public_key(), addr);
            self.handle
                .session_opened(reg.id, peer.public_key())
                .await
                .unwrap();
            reg
        }
    }

    /// Store whose writes start failing once `fail` is set
    struct FailingLog {
        inner: LedgerStore,
        fail: AtomicBool,
    }

    impl EntryLog for FailingLog {
        fn append(&self, entry: &LedgerEntry) -> ash_ledger::Result<()> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(StoreError::Io(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    "device full",
                )));
            }
            self.inner.append(entry)
        }

        fn get(&self, sequence: u64) -> ash_ledger::Result<LedgerEntry> {
            self.inner.get(sequence)
        }

        fn entries(
            &self,
            from: u64,
            to: u64,
        ) -> Box<dyn Iterator<Item = ash_ledger::Result<LedgerEntry>> + '_> {
            Box::new(self.inner.range(from, to))
        }

        fn tail(&self) -> ChainTail {
            self.inner.tail()
        }
    }

    /// A chain of `n` entries as another node would have accepted them
    fn chain(n: u64) -> Vec<LedgerEntry> {
        let mut link = Digest::ZERO;
        (1..=n)
            .map(|sequence| {
                let entry = LedgerEntry {
                    sequence,
                    payload: format!("u{}", sequence).into_bytes(),
                    accepted_at: ash_ledger::LogicalTime::new(sequence, 0),
                    predecessor_hash: link,
                };
                link = entry.hash();
                entry
            })
            .collect()
    }

    #[tokio::test]
    async fn test_contiguous_updates_accepted() {
        let h = Harness::new(ReplicationConfig::default());
        let peer = KeyPair::generate();
        let reg = h.open(&peer).await;

        for entry in chain(3) {
            let decision = h
                .handle
                .inbound(reg.id, Envelope::update(&entry, &peer))
                .await
                .unwrap();
            assert_eq!(decision, Decision::Accepted(entry.sequence));
        }
        assert_eq!(h.store.tail_sequence(), 3);
    }

    #[tokio::test]
    async fn test_gap_buffers_and_requests_catchup() {
        let h = Harness::new(ReplicationConfig::default());
        let peer = KeyPair::generate();
        let mut reg = h.open(&peer).await;
        let entries = chain(4);

        for entry in &entries[..2] {
            h.handle
                .inbound(reg.id, Envelope::update(entry, &peer))
                .await
                .unwrap();
        }

        let decision = h
            .handle
            .inbound(reg.id, Envelope::update(&entries[3], &peer))
            .await
            .unwrap();
        assert_eq!(decision, Decision::Buffered(4));

        let request = reg.outbound.recv().await.unwrap();
        assert_eq!(request.kind, EnvelopeKind::CatchupRequest);
        assert_eq!(
            CatchUpRange::decode(&request.payload).unwrap(),
            CatchUpRange { from: 3, to: 3 }
        );

        let decision = h
            .handle
            .inbound(reg.id, Envelope::catchup_response(&entries[2], &peer))
            .await
            .unwrap();
        assert_eq!(decision, Decision::Accepted(3));
        assert_eq!(h.store.tail_sequence(), 4);
        assert_eq!(h.handle.status().await.unwrap().pending, 0);
    }

    #[tokio::test]
    async fn test_redelivery_is_duplicate() {
        let h = Harness::new(ReplicationConfig::default());
        let peer = KeyPair::generate();
        let reg = h.open(&peer).await;
        let entry = &chain(1)[0];

        h.handle
            .inbound(reg.id, Envelope::update(entry, &peer))
            .await
            .unwrap();
        let again = h
            .handle
            .inbound(reg.id, Envelope::update(entry, &peer))
            .await
            .unwrap();

        assert_eq!(again, Decision::Duplicate(1));
        assert_eq!(h.store.tail_sequence(), 1);
    }

    #[tokio::test]
    async fn test_failure_threshold_closes_session() {
        let h = Harness::new(ReplicationConfig {
            failure_threshold: 2,
            ..ReplicationConfig::default()
        });
        let peer = KeyPair::generate();
        let impostor = KeyPair::generate();
        let mut reg = h.open(&peer).await;
        let entry = &chain(1)[0];

        for _ in 0..2 {
            let decision = h
                .handle
                .inbound(reg.id, Envelope::update(entry, &impostor))
                .await
                .unwrap();
            assert_eq!(decision, Decision::Rejected(RejectReason::SignerMismatch));
            assert_eq!(h.sessions.len(), 1);
        }

        let mut tampered = Envelope::update(entry, &peer);
        tampered.payload = b"other".to_vec();
        let decision = h.handle.inbound(reg.id, tampered).await.unwrap();
        assert_eq!(decision, Decision::Rejected(RejectReason::InvalidSignature));

        reg.close.changed().await.unwrap();
        assert_eq!(*reg.close.borrow(), Some(CloseReason::ProtocolViolation));
        assert_eq!(h.store.tail_sequence(), 0);
    }

    #[tokio::test]
    async fn test_serves_catchup_in_batches() {
        let h = Harness::new(ReplicationConfig {
            catchup_batch_size: 2,
            ..ReplicationConfig::default()
        });
        for i in 0..5u8 {
            h.handle.submit(vec![i]).await.unwrap();
        }

        let peer = KeyPair::generate();
        let mut reg = h.open(&peer).await;
        let request = Envelope::catchup_request(CatchUpRange { from: 2, to: 5 }, &peer);
        let decision = h.handle.inbound(reg.id, request).await.unwrap();
        assert_eq!(decision, Decision::Served(2));

        let first = reg.outbound.recv().await.unwrap();
        let second = reg.outbound.recv().await.unwrap();
        assert_eq!(first.kind, EnvelopeKind::CatchupResponse);
        assert_eq!((first.sequence, second.sequence), (2, 3));
        assert_eq!(first.predecessor_hash, Some(h.store.get(1).unwrap().hash()));
    }

    #[tokio::test]
    async fn test_submit_broadcasts_update() {
        let h = Harness::new(ReplicationConfig::default());
        let peer = KeyPair::generate();
        let mut reg = h.open(&peer).await;

        let entry = h.handle.submit(b"local".to_vec()).await.unwrap();
        assert_eq!(entry.sequence, 1);
        assert_eq!(entry.predecessor_hash, Digest::ZERO);

        let update = reg.outbound.recv().await.unwrap();
        assert_eq!(update.kind, EnvelopeKind::Update);
        assert_eq!(update.payload, b"local");
        assert!(update.verify());

        let status = h.handle.status().await.unwrap();
        assert_eq!(status.tail_sequence, 1);
        assert_eq!(status.tail_hash, entry.hash());
        assert_eq!(status.sessions, 1);
    }

    #[tokio::test]
    async fn test_handshake_kind_after_handshake_is_rejected() {
        let h = Harness::new(ReplicationConfig::default());
        let peer = KeyPair::generate();
        let reg = h.open(&peer).await;

        let decision = h
            .handle
            .inbound(reg.id, Envelope::challenge([1u8; 32], &peer))
            .await
            .unwrap();
        assert_eq!(
            decision,
            Decision::Rejected(RejectReason::UnexpectedKind(EnvelopeKind::Challenge))
        );
    }

    #[tokio::test]
    async fn test_mailbox_closed_after_shutdown() {
        let h = Harness::new(ReplicationConfig::default());
        h.handle.shutdown().await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let err = h.handle.status().await.unwrap_err();
        assert!(matches!(err, NodeError::Concurrency(_)));
    }

    #[tokio::test]
    async fn test_conflicting_sequence_from_second_peer_is_rejected() {
        let h = Harness::new(ReplicationConfig::default());
        let alice = KeyPair::generate();
        let bob = KeyPair::generate();
        let a = h.open(&alice).await;
        let b = h.open(&bob).await;
        let entries = chain(5);

        for entry in &entries[..4] {
            h.handle
                .inbound(a.id, Envelope::update(entry, &alice))
                .await
                .unwrap();
        }

        // Both peers link their sequence 5 to the same tail
        let mut rival = entries[4].clone();
        rival.payload = b"rival".to_vec();

        let first = h
            .handle
            .inbound(a.id, Envelope::update(&entries[4], &alice))
            .await
            .unwrap();
        let second = h
            .handle
            .inbound(b.id, Envelope::update(&rival, &bob))
            .await
            .unwrap();

        assert_eq!(first, Decision::Accepted(5));
        assert_eq!(
            second,
            Decision::Rejected(RejectReason::ChainMismatch { sequence: 5 })
        );
        assert_eq!(h.store.tail_sequence(), 5);
        assert_eq!(h.store.get(5).unwrap().payload, entries[4].payload);
        assert_eq!(h.sessions.len(), 2);
    }

    #[tokio::test]
    async fn test_pending_buffer_is_bounded() {
        let h = Harness::new(ReplicationConfig {
            max_pending: 2,
            ..ReplicationConfig::default()
        });
        let peer = KeyPair::generate();
        let reg = h.open(&peer).await;
        let entries = chain(5);

        for entry in &entries[2..4] {
            let decision = h
                .handle
                .inbound(reg.id, Envelope::update(entry, &peer))
                .await
                .unwrap();
            assert_eq!(decision, Decision::Buffered(entry.sequence));
        }

        let decision = h
            .handle
            .inbound(reg.id, Envelope::update(&entries[4], &peer))
            .await
            .unwrap();
        assert_eq!(decision, Decision::Rejected(RejectReason::PendingFull));
        assert_eq!(h.handle.status().await.unwrap().pending, 2);
        assert_eq!(h.sessions.len(), 1);
    }

    #[tokio::test]
    async fn test_catchup_never_overflows_requester_queue() {
        // Queue holds 64; the batch size would allow 512
        let h = Harness::new(ReplicationConfig::default());
        for i in 0..100u8 {
            h.handle.submit(vec![i]).await.unwrap();
        }

        let peer = KeyPair::generate();
        let mut reg = h.open(&peer).await;
        let request = Envelope::catchup_request(CatchUpRange { from: 1, to: 100 }, &peer);
        let decision = h.handle.inbound(reg.id, request).await.unwrap();
        assert_eq!(decision, Decision::Served(64));
        assert_eq!(h.sessions.peer_key(reg.id), Some(peer.public_key()));
        assert_eq!(*reg.close.borrow(), None);

        for sequence in 1..=64 {
            assert_eq!(reg.outbound.recv().await.unwrap().sequence, sequence);
        }

        let request = Envelope::catchup_request(CatchUpRange { from: 65, to: 100 }, &peer);
        let decision = h.handle.inbound(reg.id, request).await.unwrap();
        assert_eq!(decision, Decision::Served(36));
        assert_eq!(h.sessions.len(), 1);
    }

    #[tokio::test]
    async fn test_store_failure_stops_actor() {
        let temp = TempDir::new().unwrap();
        let log = Arc::new(FailingLog {
            inner: LedgerStore::open(&StoreConfig::at(temp.path())).unwrap(),
            fail: AtomicBool::new(false),
        });
        let sessions = Arc::new(SessionManager::new(8));
        let (handle, task) = spawn_replication_actor(
            log.clone(),
            sessions,
            Arc::new(KeyPair::generate()),
            ReplicationConfig::default(),
        );

        handle.submit(b"kept".to_vec()).await.unwrap();
        log.fail.store(true, Ordering::SeqCst);

        let err = handle.submit(b"lost".to_vec()).await.unwrap_err();
        assert!(matches!(err, NodeError::Fatal(_)));

        let reason = tokio::time::timeout(Duration::from_secs(1), handle.fatal())
            .await
            .unwrap();
        assert!(reason.contains("device full"));

        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(handle.status().await, Err(NodeError::Fatal(_))));
        assert_eq!(log.inner.tail_sequence(), 1);
    }
}
