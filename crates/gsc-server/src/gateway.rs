//! WebSocket console gateway.
//!
//! Accepts console viewer connections, replays the retained backlog, relays
//! live lines, forwards typed commands into the supervisor, and enforces a
//! heartbeat so dead peers get reaped. Sessions are mutually independent:
//! each one runs in its own task behind its own delivery queue, so a slow
//! or failing viewer never delays another.

use crate::broadcast::LogBroadcaster;
use crate::supervisor::Supervisor;
use futures_util::{SinkExt, StreamExt};
use gsc_core::{GscError, GscResult};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, error, info, warn};

/// Session ids, monotonically assigned per accepted connection.
static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// How often a liveness probe is sent.
    pub heartbeat_interval: Duration,
    /// Consecutive unanswered probes before a peer is considered dead.
    pub missed_probe_limit: u32,
}

pub struct ConsoleGateway {
    supervisor: Arc<Supervisor>,
    broadcaster: Arc<LogBroadcaster>,
    config: GatewayConfig,
}

impl ConsoleGateway {
    pub fn new(
        supervisor: Arc<Supervisor>,
        broadcaster: Arc<LogBroadcaster>,
        config: GatewayConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            supervisor,
            broadcaster,
            config,
        })
    }

    /// Bind the console listener.
    pub async fn bind(addr: SocketAddr) -> GscResult<TcpListener> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| GscError::Transport(format!("console bind failed: {e}")))?;
        info!(addr = %addr, "console listener started");
        Ok(listener)
    }

    /// Accept loop: every connection gets its own session task.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> GscResult<()> {
        loop {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    let gateway = self.clone();
                    tokio::spawn(async move {
                        match tokio_tungstenite::accept_async(stream).await {
                            Ok(ws) => gateway.serve_session(ws, addr).await,
                            Err(e) => {
                                warn!(remote = %addr, error = %e, "websocket handshake failed")
                            }
                        }
                    });
                }
                Err(e) => error!(error = %e, "tcp accept failed"),
            }
        }
    }

    /// One session: subscribe, banner, then relay until the peer goes away.
    async fn serve_session(
        self: Arc<Self>,
        mut ws: WebSocketStream<TcpStream>,
        addr: SocketAddr,
    ) {
        let session_id = NEXT_SESSION_ID.fetch_add(1, Ordering::SeqCst);
        let subscription = self.broadcaster.subscribe();
        info!(session = session_id, remote = %addr, "console session opened");

        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        let banner = format!(
            "--- connected to game server console (session {session_id}, timestamp {timestamp}) ---"
        );
        if ws.send(Message::Text(banner)).await.is_err() {
            info!(session = session_id, "console session closed before banner");
            return;
        }

        let mut heartbeat = tokio::time::interval(self.config.heartbeat_interval);
        heartbeat.tick().await; // skip first immediate tick
        let probe_timeout = self.config.heartbeat_interval * self.config.missed_probe_limit;
        let mut last_heard = Instant::now();

        let reason = loop {
            tokio::select! {
                line = subscription.recv() => match line {
                    Some(line) => {
                        if ws.send(Message::Text(line.render())).await.is_err() {
                            break "send failed";
                        }
                    }
                    None => break "subscription closed",
                },

                msg = ws.next() => match msg {
                    Some(Ok(Message::Text(text))) => {
                        last_heard = Instant::now();
                        self.handle_command(&mut ws, session_id, text).await;
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        last_heard = Instant::now();
                        let _ = ws.send(Message::Pong(payload)).await;
                    }
                    Some(Ok(Message::Pong(_))) => {
                        last_heard = Instant::now();
                    }
                    Some(Ok(Message::Close(_))) => break "peer closed",
                    Some(Ok(_)) => {} // binary frames are not part of the protocol
                    Some(Err(e)) => {
                        debug!(session = session_id, error = %e, "socket error");
                        break "socket error";
                    }
                    None => break "stream ended",
                },

                _ = heartbeat.tick() => {
                    if last_heard.elapsed() > probe_timeout {
                        warn!(session = session_id, "heartbeat failed, disconnecting");
                        break "heartbeat timeout";
                    }
                    if ws.send(Message::Ping(Vec::new())).await.is_err() {
                        break "ping failed";
                    }
                }
            }
        };

        // Unsubscribe before the connection handle goes away, so no
        // orphaned subscriber outlives its session.
        drop(subscription);
        let _ = ws.close(None).await;
        info!(session = session_id, reason, "console session closed");
    }

    /// Forward one command line to the supervisor. The acknowledgement and
    /// any failure go only to the originating session, never broadcast.
    async fn handle_command(
        &self,
        ws: &mut WebSocketStream<TcpStream>,
        session_id: u64,
        text: String,
    ) {
        let command = text.trim();
        if command.is_empty() {
            return;
        }
        debug!(session = session_id, command, "command received");
        let _ = ws
            .send(Message::Text(format!("Command received: {command}")))
            .await;

        if let Err(e) = self.supervisor.send_command(command).await {
            warn!(session = session_id, error = %e, "command rejected");
            let _ = ws
                .send(Message::Text(format!("--- command failed: {e} ---")))
                .await;
        }
    }
}
