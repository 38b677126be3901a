//! Node wiring
//!
//! Owns the listener, the outbound dialers, the session registry and the
//! replication actor, and tears them down in that order.

use crate::config::{peer_authority, ReconnectConfig};
use crate::replication::{
    spawn_replication_actor, NodeStatus, ReplicationConfig, ReplicationHandle,
};
use crate::session::{run_session, CloseReason, SessionContext, SessionLimits, SessionManager};
use crate::{NodeConfig, NodeError, Result, SessionError};
use ash_ledger::{KeyPair, LedgerEntry, LedgerStore, PublicKey};
use backoff::backoff::Backoff;
use backoff::ExponentialBackoffBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{timeout, Instant};
use tokio_tungstenite::{accept_async_with_config, client_async_with_config, WebSocketStream};

/// Poll interval while waiting for tasks to wind down
const SHUTDOWN_POLL: Duration = Duration::from_millis(50);
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// A running node
pub struct Node {
    config: NodeConfig,
    keypair: Arc<KeyPair>,
    store: Arc<LedgerStore>,
    sessions: Arc<SessionManager>,
    replication: ReplicationHandle,
    context: Arc<SessionContext>,
    local_addr: SocketAddr,
    shutdown: watch::Sender<bool>,
    actor: JoinHandle<()>,
    tasks: Vec<JoinHandle<()>>,
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("local_addr", &self.local_addr)
            .field("public_key", &self.keypair.public_key())
            .field("sessions", &self.sessions.len())
            .field("tasks", &self.tasks.len())
            .finish()
    }
}

impl Node {
    /// Load the key, open the store and start serving
    pub async fn start(config: NodeConfig) -> Result<Self> {
        config.validate()?;
        let keypair = KeyPair::load_or_generate(&config.key_file)?;
        let store = LedgerStore::open(&config.store)?;
        Self::start_with(config, keypair, store).await
    }

    /// Start serving with an already loaded key and store
    pub async fn start_with(config: NodeConfig, keypair: KeyPair, store: LedgerStore) -> Result<Self> {
        config.validate()?;

        let keypair = Arc::new(keypair);
        let store = Arc::new(store);
        let sessions = Arc::new(SessionManager::new(config.session_queue_capacity));

        let (replication, actor) = spawn_replication_actor(
            store.clone(),
            sessions.clone(),
            keypair.clone(),
            ReplicationConfig::from(&config),
        );

        let context = Arc::new(SessionContext {
            keypair: keypair.clone(),
            manager: sessions.clone(),
            replication: replication.clone(),
            limits: SessionLimits::from_config(&config)?,
        });

        let listener = TcpListener::bind(&config.listen_addr).await?;
        let local_addr = listener.local_addr()?;
        let (shutdown, _) = watch::channel(false);

        tracing::info!(
            listen_addr = %local_addr,
            peer = %keypair.public_key(),
            tail_sequence = store.tail_sequence(),
            "Node started"
        );

        let accept = tokio::spawn(accept_loop(listener, context.clone(), shutdown.subscribe()));
        let peers = config.load_peers()?;

        let mut node = Self {
            config,
            keypair,
            store,
            sessions,
            replication,
            context,
            local_addr,
            shutdown,
            actor,
            tasks: vec![accept],
        };

        for url in peers {
            node.connect(&url)?;
        }

        Ok(node)
    }

    /// Keep a session to `url` open, redialing with backoff
    pub fn connect(&mut self, url: &str) -> Result<()> {
        peer_authority(url)?;

        let task = tokio::spawn(dial_loop(
            url.to_string(),
            self.context.clone(),
            self.config.reconnect.clone(),
            self.shutdown.subscribe(),
        ));
        self.tasks.push(task);
        Ok(())
    }

    /// Bound listen address
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// `ws://` URL peers can dial
    pub fn url(&self) -> String {
        format!("ws://{}", self.local_addr)
    }

    /// This node's identity
    pub fn public_key(&self) -> PublicKey {
        self.keypair.public_key()
    }

    /// Replication core handle
    pub fn handle(&self) -> ReplicationHandle {
        self.replication.clone()
    }

    /// Ledger store
    pub fn store(&self) -> &Arc<LedgerStore> {
        &self.store
    }

    /// Session registry
    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    /// Append a locally originated update
    pub async fn submit(&self, payload: Vec<u8>) -> Result<LedgerEntry> {
        self.replication.submit(payload).await
    }

    /// Get status
    pub async fn status(&self) -> Result<NodeStatus> {
        self.replication.status().await
    }

    /// Serve until ctrl-c or a fatal store error
    pub async fn run(self) -> Result<()> {
        let replication = self.replication.clone();

        let fatal = tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                signal?;
                tracing::info!("Shutdown requested");
                None
            }
            reason = replication.fatal() => Some(reason),
        };

        self.shutdown().await?;

        match fatal {
            Some(reason) => Err(NodeError::Fatal(reason)),
            None => Ok(()),
        }
    }

    /// Drain sessions, stop the core and close the store
    pub async fn shutdown(self) -> Result<()> {
        self.shutdown.send_replace(true);

        // Sessions still handshaking register late, so keep closing until
        // every task has finished or the deadline passes
        let deadline = Instant::now() + self.config.drain_timeout() + self.config.handshake_timeout();
        for mut task in self.tasks {
            loop {
                self.sessions.close_all(CloseReason::Shutdown);
                match timeout(SHUTDOWN_POLL, &mut task).await {
                    Ok(_) => break,
                    Err(_) if Instant::now() < deadline => continue,
                    Err(_) => {
                        tracing::warn!("Task did not finish in time; aborting");
                        task.abort();
                        break;
                    }
                }
            }
        }

        let _ = self.replication.shutdown().await;
        drop(self.replication);
        drop(self.context);

        if timeout(self.config.drain_timeout(), self.actor).await.is_err() {
            tracing::warn!("Replication core did not stop in time");
        }

        match Arc::try_unwrap(self.store) {
            Ok(store) => store.close()?,
            Err(_) => tracing::warn!("Ledger store still referenced; skipping close"),
        }

        tracing::info!("Node stopped");
        Ok(())
    }
}

async fn accept_loop(
    listener: TcpListener,
    ctx: Arc<SessionContext>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut sessions = JoinSet::new();

    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    tracing::debug!(peer_addr = %addr, "Connection accepted");
                    sessions.spawn(accept_session(stream, addr, ctx.clone()));
                }
                Err(e) => pause_after_accept_error(&e).await,
            },

            Some(_) = sessions.join_next(), if !sessions.is_empty() => {}

            _ = shutdown.changed() => break,
        }
    }

    drop(listener);
    while sessions.join_next().await.is_some() {}
}

/// Back off after a failed accept so descriptor exhaustion cannot spin the loop
async fn pause_after_accept_error(err: &std::io::Error) {
    tracing::warn!(error = %err, backoff_ms = ACCEPT_ERROR_BACKOFF.as_millis() as u64, "Accept failed");
    tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
}

async fn accept_session(stream: TcpStream, addr: SocketAddr, ctx: Arc<SessionContext>) {
    let upgrade = accept_async_with_config(stream, Some(ctx.limits.websocket_config()));
    let ws = match timeout(ctx.limits.handshake_timeout, upgrade).await {
        Ok(Ok(ws)) => ws,
        Ok(Err(e)) => {
            tracing::debug!(peer_addr = %addr, error = %e, "WebSocket upgrade failed");
            return;
        }
        Err(_) => {
            tracing::debug!(peer_addr = %addr, "WebSocket upgrade timed out");
            return;
        }
    };

    run_session(ws, addr, ctx).await;
}

async fn dial_loop(
    url: String,
    ctx: Arc<SessionContext>,
    reconnect: ReconnectConfig,
    mut shutdown: watch::Receiver<bool>,
) {
    let max_delay = Duration::from_millis(reconnect.max_ms);
    let mut backoff = ExponentialBackoffBuilder::new()
        .with_initial_interval(Duration::from_millis(reconnect.initial_ms))
        .with_max_interval(max_delay)
        .with_max_elapsed_time(None)
        .build();

    loop {
        if *shutdown.borrow() {
            return;
        }

        let dialed = tokio::select! {
            result = dial(&url, &ctx) => result,
            _ = shutdown.changed() => return,
        };

        match dialed {
            Ok((ws, addr)) => {
                let outcome = run_session(ws, addr, ctx.clone()).await;
                if outcome.reached_active() {
                    backoff.reset();
                }
            }
            Err(e) => tracing::debug!(url = %url, error = %e, "Dial failed"),
        }

        if *shutdown.borrow() {
            return;
        }

        let delay = backoff.next_backoff().unwrap_or(max_delay);
        tracing::debug!(url = %url, delay_ms = delay.as_millis() as u64, "Redialing");

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown.changed() => return,
        }
    }
}

async fn dial(url: &str, ctx: &SessionContext) -> Result<(WebSocketStream<TcpStream>, SocketAddr)> {
    let authority = peer_authority(url)?;
    let deadline = ctx.limits.handshake_timeout;

    let stream = timeout(deadline, TcpStream::connect(authority))
        .await
        .map_err(|_| SessionError::Transport(format!("connect to {} timed out", authority)))??;
    let addr = stream.peer_addr()?;

    let upgrade = client_async_with_config(url, stream, Some(ctx.limits.websocket_config()));
    let (ws, _response) = timeout(deadline, upgrade)
        .await
        .map_err(|_| SessionError::Transport(format!("upgrade to {} timed out", url)))?
        .map_err(SessionError::from)?;

    Ok((ws, addr))
}
