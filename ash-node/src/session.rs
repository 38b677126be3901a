//! Peer sessions over WebSocket
//!
//! Each connection is serviced by one task running [`run_session`]:
//!
//! ```text
//! Connecting -> Handshaking -> Active -> Draining -> Closed
//!                    |            |                   ^
//!                    +------------+-------------------+
//! ```
//!
//! The [`SessionManager`] is the registry of Active and Draining sessions. It holds only
//! the sending half of each session's bounded outbound queue and a close
//! signal; everything else belongs to the session task.

use crate::codec::{self, Envelope, EnvelopeKind};
use crate::replication::ReplicationHandle;
use crate::{HandshakeError, NodeConfig, NodeError, SessionError};
use ash_ledger::{KeyPair, PublicKey};
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, watch};
use tokio::time::{timeout, Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

/// Registry key of an Active session
pub type SessionId = u64;

/// Session lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    /// Transport being established
    Connecting,
    /// Exchanging challenge and proof
    Handshaking,
    /// Authenticated; exchanging envelopes
    Active,
    /// Flushing the outbound queue before closing
    Draining,
    /// Terminal
    Closed,
}

impl SessionState {
    /// Whether `self -> next` is a legal transition
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Connecting, Handshaking)
                | (Handshaking, Active)
                | (Handshaking, Closed)
                | (Active, Draining)
                | (Active, Closed)
                | (Draining, Closed)
        )
    }
}

/// Why a session ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// Node shutting down
    Shutdown,
    /// Peer exceeded the failure threshold
    ProtocolViolation,
    /// Outbound queue overflowed
    Overloaded,
    /// Socket error
    Transport,
    /// Nothing received within the idle timeout
    Idle,
    /// Peer sent a close frame or hung up
    PeerClosed,
    /// Handshake failed
    Handshake(HandshakeError),
}

impl CloseReason {
    /// Reasons that flush the outbound queue before closing
    pub fn drains(&self) -> bool {
        matches!(self, CloseReason::Shutdown | CloseReason::ProtocolViolation)
    }
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CloseReason::Shutdown => f.write_str("shutdown"),
            CloseReason::ProtocolViolation => f.write_str("protocol violation"),
            CloseReason::Overloaded => f.write_str("overloaded"),
            CloseReason::Transport => f.write_str("transport error"),
            CloseReason::Idle => f.write_str("idle"),
            CloseReason::PeerClosed => f.write_str("peer closed"),
            CloseReason::Handshake(e) => write!(f, "handshake: {}", e),
        }
    }
}

/// Authenticated peer as seen by the registry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerIdentity {
    /// Key proven during the handshake
    pub public_key: PublicKey,
    /// Remote socket address
    pub addr: SocketAddr,
    /// Lifecycle state
    pub state: SessionState,
}

#[derive(Debug)]
struct SessionSlot {
    peer: PeerIdentity,
    outbound: mpsc::Sender<Envelope>,
    close: watch::Sender<Option<CloseReason>>,
}

/// Receiving halves handed to the session task on registration
#[derive(Debug)]
pub struct SessionRegistration {
    /// Assigned session id
    pub id: SessionId,
    /// Outbound queue
    pub outbound: mpsc::Receiver<Envelope>,
    /// Close signal
    pub close: watch::Receiver<Option<CloseReason>>,
}

/// Registry of Active sessions
#[derive(Debug)]
pub struct SessionManager {
    sessions: DashMap<SessionId, SessionSlot>,
    next_id: AtomicU64,
    queue_capacity: usize,
}

impl SessionManager {
    /// Create a registry whose sessions queue at most `queue_capacity` envelopes
    pub fn new(queue_capacity: usize) -> Self {
        Self {
            sessions: DashMap::new(),
            next_id: AtomicU64::new(1),
            queue_capacity: queue_capacity.max(1),
        }
    }

    /// Register an authenticated peer
    pub fn register(&self, public_key: PublicKey, addr: SocketAddr) -> SessionRegistration {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (outbound_tx, outbound_rx) = mpsc::channel(self.queue_capacity);
        let (close_tx, close_rx) = watch::channel(None);

        self.sessions.insert(
            id,
            SessionSlot {
                peer: PeerIdentity {
                    public_key,
                    addr,
                    state: SessionState::Active,
                },
                outbound: outbound_tx,
                close: close_tx,
            },
        );

        SessionRegistration {
            id,
            outbound: outbound_rx,
            close: close_rx,
        }
    }

    /// Queue an envelope for one session without waiting
    ///
    /// A full queue closes the session with `Overloaded`.
    pub fn deliver(&self, id: SessionId, envelope: Envelope) -> Result<(), SessionError> {
        let result = {
            let slot = self.sessions.get(&id).ok_or(SessionError::Closed)?;
            if slot.peer.state != SessionState::Active {
                return Err(SessionError::Closed);
            }
            slot.outbound.try_send(envelope)
        };

        match result {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!(session = id, "Outbound queue full");
                self.close(id, CloseReason::Overloaded);
                Err(SessionError::Overloaded)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.remove(id);
                Err(SessionError::Closed)
            }
        }
    }

    /// Queue an envelope for every Active session except `except`
    ///
    /// Returns how many sessions accepted it. Overloaded sessions are dropped.
    pub fn broadcast(&self, envelope: &Envelope, except: Option<SessionId>) -> usize {
        let targets: Vec<SessionId> = self
            .sessions
            .iter()
            .filter(|slot| slot.peer.state == SessionState::Active)
            .map(|slot| *slot.key())
            .filter(|id| Some(*id) != except)
            .collect();

        targets
            .into_iter()
            .filter(|id| self.deliver(*id, envelope.clone()).is_ok())
            .count()
    }

    /// Signal a session task to close
    ///
    /// Draining reasons keep the session registered as `Draining` until its
    /// task has flushed the queue; it accepts no new envelopes meanwhile.
    /// Other reasons unregister it at once. Returns false if the session was
    /// not registered or is already draining.
    pub fn close(&self, id: SessionId, reason: CloseReason) -> bool {
        if reason.drains() {
            let Some(mut slot) = self.sessions.get_mut(&id) else {
                return false;
            };
            if slot.peer.state != SessionState::Active {
                return false;
            }
            slot.peer.state = SessionState::Draining;
            tracing::debug!(session = id, peer = %slot.peer.public_key, reason = %reason, "Draining session");
            let _ = slot.close.send(Some(reason));
            return true;
        }

        match self.sessions.remove(&id) {
            Some((_, slot)) => {
                tracing::debug!(session = id, peer = %slot.peer.public_key, reason = %reason, "Closing session");
                let _ = slot.close.send(Some(reason));
                true
            }
            None => false,
        }
    }

    /// Close every session
    pub fn close_all(&self, reason: CloseReason) -> usize {
        let ids: Vec<SessionId> = self.sessions.iter().map(|slot| *slot.key()).collect();
        ids.into_iter()
            .filter(|id| self.close(*id, reason.clone()))
            .count()
    }

    /// Identities of all registered sessions, Active or Draining
    pub fn active_peers(&self) -> Vec<PeerIdentity> {
        self.sessions.iter().map(|slot| slot.peer.clone()).collect()
    }

    /// Envelopes an Active session can still queue without overflowing
    pub fn free_capacity(&self, id: SessionId) -> Option<usize> {
        self.sessions
            .get(&id)
            .filter(|slot| slot.peer.state == SessionState::Active)
            .map(|slot| slot.outbound.capacity())
    }

    /// Key of a registered session
    pub fn peer_key(&self, id: SessionId) -> Option<PublicKey> {
        self.sessions.get(&id).map(|slot| slot.peer.public_key)
    }

    /// Number of registered sessions, including Draining ones
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Whether no session is registered
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub(crate) fn remove(&self, id: SessionId) {
        self.sessions.remove(&id);
    }
}

/// Timeouts and limits applied by session tasks
#[derive(Debug, Clone)]
pub struct SessionLimits {
    /// Maximum payload size
    pub max_frame_size: usize,
    /// Handshake deadline
    pub handshake_timeout: Duration,
    /// Idle cutoff
    pub idle_timeout: Duration,
    /// Ping interval
    pub ping_interval: Duration,
    /// Drain bound
    pub drain_timeout: Duration,
    /// Keys allowed to connect (empty = any)
    pub allowed_peers: Vec<PublicKey>,
}

impl SessionLimits {
    /// Limits from node configuration
    pub fn from_config(config: &NodeConfig) -> crate::Result<Self> {
        Ok(Self {
            max_frame_size: config.max_frame_size,
            handshake_timeout: config.handshake_timeout(),
            idle_timeout: config.idle_timeout(),
            ping_interval: config.ping_interval(),
            drain_timeout: config.drain_timeout(),
            allowed_peers: config.allowed_keys()?,
        })
    }

    /// Transport limits matching `max_frame_size`
    ///
    /// Oversized messages fail in the WebSocket layer before they are buffered.
    pub fn websocket_config(&self) -> WebSocketConfig {
        let limit = codec::frame_limit(self.max_frame_size);
        WebSocketConfig {
            max_message_size: Some(limit),
            max_frame_size: Some(limit),
            ..Default::default()
        }
    }
}

/// Shared state every session task needs
#[derive(Debug)]
pub struct SessionContext {
    /// This node's identity
    pub keypair: Arc<KeyPair>,
    /// Session registry
    pub manager: Arc<SessionManager>,
    /// Replication core
    pub replication: ReplicationHandle,
    /// Limits
    pub limits: SessionLimits,
}

/// Result of a finished session
#[derive(Debug, Clone)]
pub struct SessionOutcome {
    /// Authenticated peer, if the handshake succeeded
    pub peer: Option<PublicKey>,
    /// Why the session ended
    pub reason: CloseReason,
    /// Highest entry sequence written to the peer
    pub last_acked_sequence: u64,
}

impl SessionOutcome {
    /// Whether the session got past the handshake
    pub fn reached_active(&self) -> bool {
        self.peer.is_some()
    }
}

/// Per-connection state owned by the session task
struct Session {
    addr: SocketAddr,
    peer: Option<PublicKey>,
    state: SessionState,
    last_acked_sequence: u64,
}

impl Session {
    fn advance(&mut self, next: SessionState) {
        if self.state.can_transition_to(next) {
            tracing::trace!(peer_addr = %self.addr, from = ?self.state, to = ?next, "Session transition");
            self.state = next;
        } else {
            tracing::warn!(peer_addr = %self.addr, from = ?self.state, to = ?next, "Illegal session transition");
        }
    }

    fn finish(self, reason: CloseReason) -> SessionOutcome {
        SessionOutcome {
            peer: self.peer,
            reason,
            last_acked_sequence: self.last_acked_sequence,
        }
    }
}

/// Service one connection from handshake to close
pub async fn run_session<S>(
    mut ws: WebSocketStream<S>,
    addr: SocketAddr,
    ctx: Arc<SessionContext>,
) -> SessionOutcome
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut session = Session {
        addr,
        peer: None,
        state: SessionState::Connecting,
        last_acked_sequence: 0,
    };
    session.advance(SessionState::Handshaking);

    let handshake_result = match timeout(ctx.limits.handshake_timeout, handshake(&mut ws, &ctx)).await {
        Ok(result) => result,
        Err(_) => Err(HandshakeError::Timeout),
    };

    let peer = match handshake_result {
        Ok(peer) => peer,
        Err(e) => {
            tracing::warn!(peer_addr = %addr, reason = %e, "Handshake failed");
            session.advance(SessionState::Closed);
            let _ = timeout(ctx.limits.drain_timeout, ws.close(None)).await;
            return session.finish(CloseReason::Handshake(e));
        }
    };

    let SessionRegistration {
        id,
        mut outbound,
        mut close,
    } = ctx.manager.register(peer, addr);
    session.peer = Some(peer);
    session.advance(SessionState::Active);
    tracing::info!(session = id, peer = %peer, peer_addr = %addr, "Session active");

    let reason = match ctx.replication.session_opened(id, peer).await {
        Ok(()) => active_loop(&mut ws, &mut session, id, &mut outbound, &mut close, &ctx).await,
        Err(e) => {
            tracing::error!(session = id, error = %e, "Replication core unavailable");
            CloseReason::Shutdown
        }
    };

    if reason.drains() {
        // Stops new deliveries if the close came from this task
        ctx.manager.close(id, reason.clone());
        session.advance(SessionState::Draining);
        let flushed = timeout(
            ctx.limits.drain_timeout,
            drain(&mut ws, &mut session, &mut outbound),
        )
        .await;
        if flushed.is_err() {
            tracing::warn!(session = id, "Drain timed out");
        }
        ctx.manager.remove(id);
    } else {
        // No further deliveries once the task decides to close
        ctx.manager.remove(id);
        if reason != CloseReason::Overloaded {
            let _ = timeout(ctx.limits.drain_timeout, ws.close(None)).await;
        }
    }

    session.advance(SessionState::Closed);
    let _ = ctx.replication.session_closed(id).await;

    tracing::info!(
        session = id,
        peer = %peer,
        reason = %reason,
        last_acked_sequence = session.last_acked_sequence,
        "Session closed"
    );

    session.finish(reason)
}

/// Mutual challenge/proof exchange; returns the authenticated peer key
async fn handshake<S>(
    ws: &mut WebSocketStream<S>,
    ctx: &SessionContext,
) -> Result<PublicKey, HandshakeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let nonce: [u8; 32] = rand::random();
    send(ws, &Envelope::challenge(nonce, &ctx.keypair))
        .await
        .map_err(|e| HandshakeError::Transport(e.to_string()))?;

    let mut challenger: Option<PublicKey> = None;
    let mut proven: Option<PublicKey> = None;

    let (challenger, proven) = loop {
        if let (Some(challenger), Some(proven)) = (challenger, proven) {
            break (challenger, proven);
        }

        let frame = match ws.next().await {
            Some(Ok(Message::Text(text))) => text.into_bytes(),
            Some(Ok(Message::Binary(data))) => data,
            Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => continue,
            Some(Ok(Message::Close(_))) | None => {
                return Err(HandshakeError::Transport("connection closed".to_string()))
            }
            Some(Err(e)) => return Err(HandshakeError::Transport(e.to_string())),
        };

        let envelope = codec::decode(&frame, ctx.limits.max_frame_size)
            .map_err(|e| HandshakeError::UnexpectedMessage(e.to_string()))?;

        match envelope.kind {
            EnvelopeKind::Challenge if challenger.is_none() => {
                if envelope.payload.len() != 32 || !envelope.verify() {
                    return Err(HandshakeError::InvalidProof);
                }
                send(ws, &Envelope::proof(&envelope.payload, &ctx.keypair))
                    .await
                    .map_err(|e| HandshakeError::Transport(e.to_string()))?;
                challenger = Some(envelope.signer);
            }
            EnvelopeKind::Proof if proven.is_none() => {
                if !envelope.verify_proof(&nonce) {
                    return Err(HandshakeError::InvalidProof);
                }
                proven = Some(envelope.signer);
            }
            kind => {
                return Err(HandshakeError::UnexpectedMessage(format!(
                    "{} during handshake",
                    kind
                )))
            }
        }
    };

    // The key that answered our nonce must be the one that challenged us
    if challenger != proven {
        return Err(HandshakeError::InvalidProof);
    }

    if proven == ctx.keypair.public_key() {
        return Err(HandshakeError::NotAllowed(proven));
    }

    if !ctx.limits.allowed_peers.is_empty() && !ctx.limits.allowed_peers.contains(&proven) {
        return Err(HandshakeError::NotAllowed(proven));
    }

    Ok(proven)
}

async fn active_loop<S>(
    ws: &mut WebSocketStream<S>,
    session: &mut Session,
    id: SessionId,
    outbound: &mut mpsc::Receiver<Envelope>,
    close: &mut watch::Receiver<Option<CloseReason>>,
    ctx: &SessionContext,
) -> CloseReason
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut ping = tokio::time::interval(ctx.limits.ping_interval);
    ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ping.tick().await;

    let mut last_seen = Instant::now();

    loop {
        let idle_deadline = last_seen + ctx.limits.idle_timeout;

        tokio::select! {
            biased;

            _ = close.changed() => {
                return close.borrow().clone().unwrap_or(CloseReason::Shutdown);
            }

            // Writes before reads so an inbound flood cannot starve the queue
            queued = outbound.recv() => {
                match queued {
                    Some(envelope) => {
                        // A peer that stops reading blocks the write; the
                        // close signal must still get through. Draining
                        // closes finish the envelope already dequeued.
                        let write = write_envelope(ws, session, &envelope);
                        tokio::pin!(write);
                        let written = tokio::select! {
                            biased;
                            _ = close.changed() => {
                                let reason = close.borrow().clone().unwrap_or(CloseReason::Shutdown);
                                if reason.drains() {
                                    let _ = timeout(ctx.limits.drain_timeout, &mut write).await;
                                }
                                return reason;
                            }
                            written = &mut write => written,
                        };
                        if let Err(e) = written {
                            tracing::debug!(session = id, error = %e, "Write failed");
                            return CloseReason::Transport;
                        }
                    }
                    // Unregistered by the manager; the close signal carries the reason
                    None => return close.borrow().clone().unwrap_or(CloseReason::Shutdown),
                }
            }

            frame = ws.next() => {
                let bytes = match frame {
                    Some(Ok(Message::Text(text))) => text.into_bytes(),
                    Some(Ok(Message::Binary(data))) => data,
                    Some(Ok(Message::Ping(_) | Message::Pong(_))) => {
                        last_seen = Instant::now();
                        continue;
                    }
                    Some(Ok(Message::Frame(_))) => continue,
                    Some(Ok(Message::Close(_))) | None => return CloseReason::PeerClosed,
                    Some(Err(e)) => {
                        tracing::debug!(session = id, error = %e, "Read failed");
                        return CloseReason::Transport;
                    }
                };

                last_seen = Instant::now();
                if let Err(reason) = forward(&bytes, id, ctx).await {
                    return reason;
                }
            }

            _ = ping.tick() => {
                if let Err(e) = ws.send(Message::Ping(Vec::new())).await {
                    tracing::debug!(session = id, error = %e, "Ping failed");
                    return CloseReason::Transport;
                }
            }

            _ = tokio::time::sleep_until(idle_deadline) => {
                tracing::warn!(session = id, "Peer idle");
                return CloseReason::Idle;
            }
        }
    }
}

/// Decode a frame and hand it to the replication core
///
/// Undecodable frames are dropped; the session stays open.
async fn forward(bytes: &[u8], id: SessionId, ctx: &SessionContext) -> Result<(), CloseReason> {
    let envelope = match codec::decode(bytes, ctx.limits.max_frame_size) {
        Ok(envelope) => envelope,
        Err(e) => {
            tracing::warn!(session = id, error = %e, "Dropping undecodable frame");
            return Ok(());
        }
    };

    match ctx.replication.inbound(id, envelope).await {
        Ok(decision) => {
            tracing::trace!(session = id, decision = ?decision, "Envelope processed");
            Ok(())
        }
        Err(e @ (NodeError::Fatal(_) | NodeError::Concurrency(_))) => {
            tracing::error!(session = id, error = %e, "Replication core unavailable");
            Err(CloseReason::Shutdown)
        }
        Err(e) => {
            tracing::warn!(session = id, error = %e, "Envelope not processed");
            Ok(())
        }
    }
}

async fn drain<S>(
    ws: &mut WebSocketStream<S>,
    session: &mut Session,
    outbound: &mut mpsc::Receiver<Envelope>,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    while let Ok(envelope) = outbound.try_recv() {
        if write_envelope(ws, session, &envelope).await.is_err() {
            return;
        }
    }
    let _ = ws.close(None).await;
}

async fn write_envelope<S>(
    ws: &mut WebSocketStream<S>,
    session: &mut Session,
    envelope: &Envelope,
) -> Result<(), SessionError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    send(ws, envelope).await?;
    if envelope.kind.carries_entry() {
        session.last_acked_sequence = session.last_acked_sequence.max(envelope.sequence);
    }
    Ok(())
}

async fn send<S>(ws: &mut WebSocketStream<S>, envelope: &Envelope) -> Result<(), SessionError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    ws.send(Message::Text(codec::encode_text(envelope))).await?;
    Ok(())
}
