use crate::actions::{self, ActionTracker};
use crate::control_plane::{fetch_snapshot, ControlPlane};
use crate::Config;
use axum::{
    extract::{ws::Message, ws::WebSocket, ws::WebSocketUpgrade, ConnectInfo, State},
    http::StatusCode,
    response::{Html, IntoResponse},
    routing::get,
    Router,
};
use fleet_core::protocol::{decode_command, encode_event, ServerEvent};
use futures_util::{SinkExt, StreamExt};
use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};
use tokio::sync::{mpsc, mpsc::error::TrySendError, oneshot, Mutex};
use tracing::{debug, info, warn};

const INDEX_HTML: &str = include_str!("../assets/index.html");

/// Process-wide state shared by the socket handlers, the monitor and the
/// command chains.
pub struct HubState<P: ControlPlane> {
    pub config: Config,
    pub plane: P,
    pub broadcaster: Broadcaster,
    pub tracker: ActionTracker,
}

impl<P: ControlPlane> HubState<P> {
    pub fn new(config: Config, plane: P) -> Self {
        Self {
            config,
            plane,
            broadcaster: Broadcaster::new(),
            tracker: ActionTracker::new(),
        }
    }
}

/// Fan-out to every connected viewer. No history, no per-viewer filtering.
pub struct Broadcaster {
    conn_counter: AtomicU64,
    subscribers: Mutex<HashMap<String, mpsc::Sender<Message>>>,
}

impl Broadcaster {
    pub fn new() -> Self {
        Self {
            conn_counter: AtomicU64::new(0),
            subscribers: Mutex::new(HashMap::new()),
        }
    }

    pub fn next_conn_id(&self) -> String {
        let id = self.conn_counter.fetch_add(1, Ordering::SeqCst) + 1;
        format!("conn-{id}")
    }

    pub async fn subscribe(&self, conn_id: &str, sender: mpsc::Sender<Message>) {
        self.subscribers
            .lock()
            .await
            .insert(conn_id.to_string(), sender);
    }

    pub async fn unsubscribe(&self, conn_id: &str) -> bool {
        self.subscribers.lock().await.remove(conn_id).is_some()
    }

    pub async fn subscriber_count(&self) -> usize {
        self.subscribers.lock().await.len()
    }

    /// Queues `event` for every subscriber and returns how many accepted it.
    /// The lock is held for the whole pass so concurrent publishers cannot
    /// interleave; a subscriber whose queue is full or gone is dropped.
    pub async fn publish(&self, event: &ServerEvent) -> usize {
        let text = match encode_event(event) {
            Ok(value) => value,
            Err(err) => {
                warn!(event = "encode_error", kind = event.kind(), error = %err);
                return 0;
            }
        };
        let mut subscribers = self.subscribers.lock().await;
        subscribers.retain(|conn_id, sender| {
            match sender.try_send(Message::Text(text.clone())) {
                Ok(()) => true,
                Err(TrySendError::Full(_)) => {
                    warn!(event = "slow_consumer", conn_id = %conn_id, kind = event.kind());
                    false
                }
                Err(TrySendError::Closed(_)) => {
                    debug!(event = "subscriber_gone", conn_id = %conn_id);
                    false
                }
            }
        });
        subscribers.len()
    }
}

impl Default for Broadcaster {
    fn default() -> Self {
        Self::new()
    }
}

pub fn router<P: ControlPlane>(state: Arc<HubState<P>>) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/ws", get(ws_handler::<P>))
        .route("/health", get(|| async { "ok" }))
        .with_state(state)
}

async fn index() -> Html<&'static str> {
    Html(INDEX_HTML)
}

async fn ws_handler<P: ControlPlane>(
    ws: WebSocketUpgrade,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(state): State<Arc<HubState<P>>>,
) -> impl IntoResponse {
    if !addr.ip().is_loopback() && !state.config.allow_remote {
        return StatusCode::FORBIDDEN.into_response();
    }
    ws.on_upgrade(move |socket| async move {
        handle_socket(state, socket, addr).await;
    })
}

async fn handle_socket<P: ControlPlane>(state: Arc<HubState<P>>, socket: WebSocket, remote: SocketAddr) {
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (tx, mut rx) = mpsc::channel::<Message>(state.config.queue_capacity);
    let (snapshot_tx, snapshot_rx) = oneshot::channel::<Option<Message>>();
    let write_timeout = state.config.write_timeout;
    let mut write_task = tokio::spawn(async move {
        // Broadcasts queue up in `rx` until the connect snapshot is out.
        if let Ok(Some(snapshot)) = snapshot_rx.await {
            if tokio::time::timeout(write_timeout, ws_sender.send(snapshot))
                .await
                .is_err()
            {
                return;
            }
        }
        while let Some(msg) = rx.recv().await {
            let send = ws_sender.send(msg);
            if tokio::time::timeout(write_timeout, send).await.is_err() {
                return;
            }
        }
        let _ = ws_sender.send(Message::Close(None)).await;
    });

    let conn_id = state.broadcaster.next_conn_id();
    info!(event = "client_connected", conn_id = %conn_id, remote = %remote);

    // Subscribed before the fetch so nothing published meanwhile is lost.
    // The broadcaster owns the only sender; evicting this viewer ends the
    // writer task.
    state.broadcaster.subscribe(&conn_id, tx).await;

    let snapshot = match fetch_snapshot(&state.plane).await {
        Ok(members) => {
            let count = members.len();
            match encode_event(&ServerEvent::List(members)) {
                Ok(text) => {
                    info!(event = "snapshot_sent", conn_id = %conn_id, count = count);
                    Some(Message::Text(text))
                }
                Err(err) => {
                    warn!(event = "encode_error", conn_id = %conn_id, error = %err);
                    None
                }
            }
        }
        Err(err) => {
            debug!(event = "snapshot_skipped", conn_id = %conn_id, error = %err);
            None
        }
    };
    let _ = snapshot_tx.send(snapshot);

    let mut writer_done = false;
    loop {
        let next = tokio::select! {
            next = ws_receiver.next() => next,
            _ = &mut write_task => {
                writer_done = true;
                info!(event = "writer_closed", conn_id = %conn_id);
                break;
            }
        };
        let msg = match next {
            Some(Ok(value)) => value,
            Some(Err(err)) => {
                warn!(event = "read_error", conn_id = %conn_id, error = %err);
                break;
            }
            None => break,
        };
        let text = match msg {
            Message::Text(text) => text,
            Message::Binary(bytes) => match String::from_utf8(bytes) {
                Ok(text) => text,
                Err(_) => {
                    warn!(event = "command_invalid", conn_id = %conn_id, error = "binary_not_utf8");
                    continue;
                }
            },
            Message::Close(_) => {
                info!(event = "client_close", conn_id = %conn_id);
                break;
            }
            Message::Ping(_) | Message::Pong(_) => continue,
        };
        if state.config.debug {
            debug!(event = "message_received", conn_id = %conn_id, raw = %text);
        }
        match decode_command(&text) {
            Ok(command) => actions::dispatch(state.clone(), command).await,
            Err(err) => {
                warn!(event = "command_invalid", conn_id = %conn_id, error = %err);
            }
        }
    }

    state.broadcaster.unsubscribe(&conn_id).await;
    if !writer_done {
        let _ = write_task.await;
    }
    info!(event = "client_disconnected", conn_id = %conn_id);
}
