//! The console link: one process-wide connection to the console gateway.
//!
//! Any number of UI consumers share the single underlying WebSocket via the
//! singleton; the link reconnects with exponential backoff when the
//! connection drops out from under it, and fans every inbound frame out to
//! the local subscribers in registration order.

use crate::backoff::ReconnectPolicy;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use gsc_core::{GscError, GscResult};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch, Mutex};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

/// Client-side view of the link state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;
type WsStream = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

/// Outcome of a connect attempt, shared by every caller awaiting it.
#[derive(Debug, Clone)]
enum AttemptOutcome {
    Pending,
    Connected,
    Failed(String),
}

struct LinkInner {
    url: String,
    policy: ReconnectPolicy,
    state: ConnectionState,
    /// Write half of the live socket, if any.
    sink: Option<WsSink>,
    /// Bumped for every new socket life. A reader or reconnect timer from
    /// a superseded life sees the mismatch and stays quiet, which is how
    /// an on-purpose closure is told apart from a failure.
    generation: u64,
    /// Shared completion for the connect attempt in flight, if any.
    in_flight: Option<watch::Receiver<AttemptOutcome>>,
    message_subs: Vec<(u64, mpsc::UnboundedSender<String>)>,
    state_subs: Vec<(u64, mpsc::UnboundedSender<ConnectionState>)>,
    next_sub_id: u64,
}

/// The process-wide console link.
pub struct ConsoleLink {
    inner: Mutex<LinkInner>,
}

static INSTANCE: OnceLock<Arc<ConsoleLink>> = OnceLock::new();

impl ConsoleLink {
    /// The process-wide link instance, created lazily on first access.
    ///
    /// Every caller shares this one instance, so at most one underlying
    /// connection exists no matter how many components ask for one.
    pub fn instance() -> Arc<ConsoleLink> {
        INSTANCE.get_or_init(ConsoleLink::new).clone()
    }

    /// A standalone link, for isolated use and tests.
    pub fn new() -> Arc<ConsoleLink> {
        Arc::new(Self {
            inner: Mutex::new(LinkInner {
                url: "ws://127.0.0.1:8081".to_string(),
                policy: ReconnectPolicy::new(Duration::from_millis(3000), 5),
                state: ConnectionState::Disconnected,
                sink: None,
                generation: 0,
                in_flight: None,
                message_subs: Vec::new(),
                state_subs: Vec::new(),
                next_sub_id: 1,
            }),
        })
    }

    /// Point the link at a console endpoint.
    ///
    /// Idempotent; the last call wins for future connect/reconnect cycles.
    /// An already-scheduled reconnect keeps the delay it was scheduled
    /// with.
    pub async fn configure(&self, url: &str, base_interval: Duration, max_attempts: u32) {
        let mut inner = self.inner.lock().await;
        inner.url = url.to_string();
        inner.policy.base_interval = base_interval;
        inner.policy.max_attempts = max_attempts;
    }

    pub async fn state(&self) -> ConnectionState {
        self.inner.lock().await.state
    }

    /// Connect to the configured endpoint.
    ///
    /// Single-flight: while an attempt is in flight, every caller awaits
    /// the same completion instead of opening a second connection. Already
    /// connected is an immediate Ok. An explicit call restarts the
    /// reconnect attempt budget.
    pub async fn connect(self: &Arc<Self>) -> GscResult<()> {
        let mut rx = {
            let mut inner = self.inner.lock().await;
            if inner.state == ConnectionState::Connected {
                return Ok(());
            }
            match &inner.in_flight {
                Some(rx) => rx.clone(),
                None => {
                    inner.policy.reset();
                    self.begin_attempt(&mut inner)
                }
            }
        };

        let outcome = match rx
            .wait_for(|o| !matches!(o, AttemptOutcome::Pending))
            .await
        {
            Ok(outcome) => outcome.clone(),
            Err(_) => AttemptOutcome::Failed("connect attempt abandoned".to_string()),
        };
        match outcome {
            AttemptOutcome::Connected => Ok(()),
            AttemptOutcome::Failed(reason) => Err(GscError::ConnectionLost(reason)),
            AttemptOutcome::Pending => Err(GscError::Timeout),
        }
    }

    /// Send one raw command frame. Succeeds only while Connected; the
    /// caller may connect() once and retry, never loop.
    pub async fn send(&self, text: &str) -> GscResult<()> {
        let mut inner = self.inner.lock().await;
        if inner.state != ConnectionState::Connected {
            if inner.policy.exhausted() && inner.policy.max_attempts > 0 {
                return Err(GscError::MaxReconnectAttemptsExceeded(
                    inner.policy.max_attempts,
                ));
            }
            return Err(GscError::ConnectionLost(
                "console link is not connected".to_string(),
            ));
        }
        let sink = inner.sink.as_mut().ok_or_else(|| {
            GscError::ConnectionLost("console link is not connected".to_string())
        })?;
        sink.send(Message::Text(text.to_string()))
            .await
            .map_err(|e| GscError::Transport(format!("send failed: {e}")))
    }

    /// Subscribe to inbound console frames. Frames arrive raw and
    /// unmodified, in subscriber-registration order across subscribers.
    pub async fn subscribe_messages(&self) -> (u64, mpsc::UnboundedReceiver<String>) {
        let mut inner = self.inner.lock().await;
        let id = inner.next_sub_id;
        inner.next_sub_id += 1;
        let (tx, rx) = mpsc::unbounded_channel();
        inner.message_subs.push((id, tx));
        (id, rx)
    }

    pub async fn unsubscribe_messages(&self, id: u64) {
        let mut inner = self.inner.lock().await;
        inner.message_subs.retain(|(sub_id, _)| *sub_id != id);
    }

    /// Subscribe to connection-state changes.
    pub async fn subscribe_state(&self) -> (u64, mpsc::UnboundedReceiver<ConnectionState>) {
        let mut inner = self.inner.lock().await;
        let id = inner.next_sub_id;
        inner.next_sub_id += 1;
        let (tx, rx) = mpsc::unbounded_channel();
        inner.state_subs.push((id, tx));
        (id, rx)
    }

    pub async fn unsubscribe_state(&self, id: u64) {
        let mut inner = self.inner.lock().await;
        inner.state_subs.retain(|(sub_id, _)| *sub_id != id);
    }

    /// Close the connection on purpose. No reconnect follows; subscribers
    /// stay registered.
    pub async fn close(&self) {
        let mut inner = self.inner.lock().await;
        inner.generation += 1;
        inner.in_flight = None;
        if let Some(mut sink) = inner.sink.take() {
            tokio::spawn(async move {
                let _ = sink.close().await;
            });
        }
        if inner.state != ConnectionState::Disconnected {
            inner.state = ConnectionState::Disconnected;
            Self::fanout_state(&mut inner, ConnectionState::Disconnected);
        }
    }

    /// Full teardown: close the connection, drop every subscriber, zero
    /// the counters. The only supported way back to a pristine link.
    pub async fn reset(&self) {
        let mut inner = self.inner.lock().await;
        inner.generation += 1;
        inner.in_flight = None;
        if let Some(mut sink) = inner.sink.take() {
            tokio::spawn(async move {
                let _ = sink.close().await;
            });
        }
        inner.state = ConnectionState::Disconnected;
        inner.policy.reset();
        inner.message_subs.clear();
        inner.state_subs.clear();
    }

    // ── Internal ─────────────────────────────────────────────────────

    /// Start a connect attempt under the inner lock and return its shared
    /// completion. Any stale socket is discarded as part of the generation
    /// bump, so its close never reads as a failure.
    fn begin_attempt(self: &Arc<Self>, inner: &mut LinkInner) -> watch::Receiver<AttemptOutcome> {
        let (tx, rx) = watch::channel(AttemptOutcome::Pending);
        inner.state = ConnectionState::Connecting;
        inner.in_flight = Some(rx.clone());
        inner.generation += 1;
        let generation = inner.generation;
        let url = inner.url.clone();
        let stale = inner.sink.take();

        let link = self.clone();
        tokio::spawn(async move {
            if let Some(mut sink) = stale {
                let _ = sink.close().await;
            }
            link.run_attempt(url, generation, tx).await;
        });
        rx
    }

    async fn run_attempt(
        self: Arc<Self>,
        url: String,
        generation: u64,
        tx: watch::Sender<AttemptOutcome>,
    ) {
        debug!(%url, "dialing console");
        match connect_async(url.as_str()).await {
            Ok((ws, _response)) => {
                let (sink, stream) = ws.split();
                {
                    let mut inner = self.inner.lock().await;
                    if inner.generation != generation {
                        // A close()/reset()/newer attempt superseded us.
                        let _ = tx.send(AttemptOutcome::Failed("superseded".to_string()));
                        return;
                    }
                    inner.sink = Some(sink);
                    inner.state = ConnectionState::Connected;
                    inner.in_flight = None;
                    inner.policy.reset();
                    Self::fanout_state(&mut inner, ConnectionState::Connected);
                    Self::fanout_message(
                        &mut inner,
                        "--- console link established ---".to_string(),
                    );
                }
                info!(%url, "console link connected");

                let link = self.clone();
                tokio::spawn(async move {
                    link.read_loop(stream, generation).await;
                });
                let _ = tx.send(AttemptOutcome::Connected);
            }
            Err(e) => {
                warn!(%url, error = %e, "console dial failed");
                {
                    let mut inner = self.inner.lock().await;
                    if inner.generation == generation {
                        inner.state = ConnectionState::Disconnected;
                        inner.in_flight = None;
                        Self::fanout_state(&mut inner, ConnectionState::Disconnected);
                        self.schedule_reconnect(&mut inner);
                    }
                }
                let _ = tx.send(AttemptOutcome::Failed(e.to_string()));
            }
        }
    }

    /// Drain inbound frames for one socket life.
    async fn read_loop(self: Arc<Self>, mut stream: WsStream, generation: u64) {
        let reason: String = loop {
            match stream.next().await {
                Some(Ok(Message::Text(text))) => {
                    let mut inner = self.inner.lock().await;
                    if inner.generation != generation {
                        return; // a newer life owns the registry now
                    }
                    Self::fanout_message(&mut inner, text);
                }
                Some(Ok(Message::Ping(payload))) => {
                    let mut inner = self.inner.lock().await;
                    if inner.generation != generation {
                        return;
                    }
                    if let Some(sink) = inner.sink.as_mut() {
                        let _ = sink.send(Message::Pong(payload)).await;
                    }
                }
                Some(Ok(Message::Close(_))) => break "server closed the connection".to_string(),
                Some(Ok(_)) => {} // binary frames are not part of the protocol
                Some(Err(e)) => break format!("socket error: {e}"),
                None => break "stream ended".to_string(),
            }
        };

        let mut inner = self.inner.lock().await;
        if inner.generation != generation {
            return;
        }
        warn!(reason = %reason, "console link closed");
        inner.sink = None;
        inner.state = ConnectionState::Disconnected;
        Self::fanout_state(&mut inner, ConnectionState::Disconnected);
        // Not caller-intentional (an intentional close bumps the
        // generation first), so try to get the link back.
        self.schedule_reconnect(&mut inner);
    }

    /// Schedule the next reconnect attempt, if the budget allows. The
    /// delay is fixed at schedule time; a later configure() does not
    /// change it.
    fn schedule_reconnect(self: &Arc<Self>, inner: &mut LinkInner) {
        if inner.policy.exhausted() {
            warn!(
                attempts = inner.policy.max_attempts,
                "reconnect attempts exhausted, staying disconnected"
            );
            Self::fanout_message(
                inner,
                "--- reconnect attempts exhausted ---".to_string(),
            );
            return;
        }
        let delay = inner.policy.delay_for(inner.policy.attempt_count);
        inner.policy.attempt_count += 1;
        let expected_generation = inner.generation;
        info!(
            delay_ms = delay.as_millis() as u64,
            attempt = inner.policy.attempt_count,
            "scheduling reconnect"
        );

        let link = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let mut inner = link.inner.lock().await;
            // A connect()/close()/reset() since the schedule owns the link
            // now; this timer is obsolete.
            if inner.generation != expected_generation
                || inner.state != ConnectionState::Disconnected
            {
                return;
            }
            let _ = link.begin_attempt(&mut inner);
        });
    }

    fn fanout_message(inner: &mut LinkInner, text: String) {
        inner.message_subs.retain(|(id, tx)| {
            if tx.send(text.clone()).is_err() {
                debug!(subscriber = id, "message subscriber dropped");
                false
            } else {
                true
            }
        });
    }

    fn fanout_state(inner: &mut LinkInner, state: ConnectionState) {
        inner.state_subs.retain(|(id, tx)| {
            if tx.send(state).is_err() {
                debug!(subscriber = id, "state subscriber dropped");
                false
            } else {
                true
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::timeout;

    /// A minimal console endpoint: counts accepted connections, optionally
    /// pushes frames on accept, and records every frame it receives.
    async fn spawn_ws_server(
        lines_on_accept: Vec<String>,
        drop_after_accept: bool,
    ) -> (
        SocketAddr,
        Arc<AtomicUsize>,
        mpsc::UnboundedReceiver<String>,
    ) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accepts = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = mpsc::unbounded_channel();

        let accepts_counter = accepts.clone();
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                accepts_counter.fetch_add(1, Ordering::SeqCst);
                let lines = lines_on_accept.clone();
                let tx = tx.clone();
                tokio::spawn(async move {
                    let Ok(mut ws) = tokio_tungstenite::accept_async(stream).await else {
                        return;
                    };
                    if drop_after_accept {
                        return;
                    }
                    for line in lines {
                        let _ = ws.send(Message::Text(line)).await;
                    }
                    while let Some(Ok(msg)) = ws.next().await {
                        if let Message::Text(text) = msg {
                            let _ = tx.send(text);
                        }
                    }
                });
            }
        });
        (addr, accepts, rx)
    }

    #[test]
    fn instance_is_a_singleton() {
        let a = ConsoleLink::instance();
        let b = ConsoleLink::instance();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[tokio::test]
    async fn send_while_disconnected_fails_cleanly() {
        let link = ConsoleLink::new();
        assert!(matches!(
            link.send("help").await,
            Err(GscError::ConnectionLost(_))
        ));
        assert_eq!(link.state().await, ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn concurrent_connects_share_one_connection() {
        let (addr, accepts, _received) = spawn_ws_server(Vec::new(), false).await;
        let link = ConsoleLink::new();
        link.configure(&format!("ws://{addr}"), Duration::from_millis(10), 3)
            .await;

        let (first, second) = tokio::join!(link.connect(), link.connect());
        first.unwrap();
        second.unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(accepts.load(Ordering::SeqCst), 1);
        assert_eq!(link.state().await, ConnectionState::Connected);
    }

    #[tokio::test]
    async fn connect_then_send_reaches_the_server() {
        let (addr, _accepts, mut received) = spawn_ws_server(Vec::new(), false).await;
        let link = ConsoleLink::new();
        link.configure(&format!("ws://{addr}"), Duration::from_millis(10), 3)
            .await;

        assert!(link.send("too early").await.is_err());

        link.connect().await.unwrap();
        link.send("say hello").await.unwrap();

        let frame = timeout(Duration::from_secs(5), received.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(frame, "say hello");
    }

    #[tokio::test]
    async fn inbound_frames_fan_out_to_every_subscriber() {
        let (addr, _accepts, _received) =
            spawn_ws_server(vec!["Line1".to_string(), "Line2".to_string()], false).await;
        let link = ConsoleLink::new();
        link.configure(&format!("ws://{addr}"), Duration::from_millis(10), 3)
            .await;

        let (_id_a, mut sub_a) = link.subscribe_messages().await;
        let (_id_b, mut sub_b) = link.subscribe_messages().await;
        link.connect().await.unwrap();

        for sub in [&mut sub_a, &mut sub_b] {
            let welcome = timeout(Duration::from_secs(5), sub.recv())
                .await
                .unwrap()
                .unwrap();
            assert!(welcome.contains("console link established"));
            assert_eq!(
                timeout(Duration::from_secs(5), sub.recv()).await.unwrap().unwrap(),
                "Line1"
            );
            assert_eq!(
                timeout(Duration::from_secs(5), sub.recv()).await.unwrap().unwrap(),
                "Line2"
            );
        }
    }

    #[tokio::test]
    async fn unsubscribing_does_not_tear_down_the_link() {
        let (addr, _accepts, mut received) = spawn_ws_server(Vec::new(), false).await;
        let link = ConsoleLink::new();
        link.configure(&format!("ws://{addr}"), Duration::from_millis(10), 3)
            .await;
        link.connect().await.unwrap();

        let (id, _sub) = link.subscribe_messages().await;
        link.unsubscribe_messages(id).await;

        assert_eq!(link.state().await, ConnectionState::Connected);
        link.send("still here").await.unwrap();
        let frame = timeout(Duration::from_secs(5), received.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(frame, "still here");
    }

    #[tokio::test]
    async fn reset_clears_subscribers_and_state() {
        let (addr, _accepts, _received) = spawn_ws_server(Vec::new(), false).await;
        let link = ConsoleLink::new();
        link.configure(&format!("ws://{addr}"), Duration::from_millis(10), 3)
            .await;
        link.connect().await.unwrap();

        let (_id, mut messages) = link.subscribe_messages().await;
        link.reset().await;

        assert_eq!(link.state().await, ConnectionState::Disconnected);
        // The registry was cleared, so the sender side is gone.
        assert!(messages.recv().await.is_none());
    }

    #[tokio::test]
    async fn dropped_connection_triggers_reconnect() {
        let (addr, accepts, _received) = spawn_ws_server(Vec::new(), true).await;
        let link = ConsoleLink::new();
        link.configure(&format!("ws://{addr}"), Duration::from_millis(10), 3)
            .await;

        // The server drops us right after the handshake; the link should
        // dial again on its own.
        link.connect().await.unwrap();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while accepts.load(Ordering::SeqCst) < 2 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(accepts.load(Ordering::SeqCst) >= 2);
    }

    #[tokio::test]
    async fn state_subscribers_see_the_transitions() {
        let (addr, _accepts, _received) = spawn_ws_server(Vec::new(), false).await;
        let link = ConsoleLink::new();
        link.configure(&format!("ws://{addr}"), Duration::from_millis(10), 3)
            .await;

        let (_id, mut states) = link.subscribe_state().await;
        link.connect().await.unwrap();
        assert_eq!(
            timeout(Duration::from_secs(5), states.recv()).await.unwrap(),
            Some(ConnectionState::Connected)
        );

        link.close().await;
        assert_eq!(
            timeout(Duration::from_secs(5), states.recv()).await.unwrap(),
            Some(ConnectionState::Disconnected)
        );
    }
}
