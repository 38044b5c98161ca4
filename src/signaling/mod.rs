//! WebSocket signaling endpoint
//!
//! Accepts viewer connections at `ws://bind:port/`, assigns each a stable
//! `client_<n>` identifier, enforces the client ceiling, and forwards
//! parsed signaling messages to the registered handlers. Outbound sends go
//! through a per-client writer task so they never block the caller.

mod protocol;

pub use protocol::{CameraInfo, ClientMessage, ServerMessage};

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
    routing::get,
    Router,
};
use futures::future::BoxFuture;
use futures::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::AppConfig;
use crate::error::{AppError, Result};

/// Invoked after a client is admitted and has received `camera_list`.
pub type ConnectHandler = Arc<dyn Fn(String, ClientSender) -> BoxFuture<'static, ()> + Send + Sync>;
/// Invoked exactly once when an admitted client closes or errors.
pub type DisconnectHandler = Arc<dyn Fn(String) -> BoxFuture<'static, ()> + Send + Sync>;
/// Invoked for every well-formed client message of a known type.
pub type MessageHandler =
    Arc<dyn Fn(String, ClientMessage) -> BoxFuture<'static, ()> + Send + Sync>;

/// Cloneable handle for sending messages to one client.
///
/// Sends are queued onto the client's writer task and never fail; a message
/// to a client that is already gone is silently dropped.
#[derive(Clone)]
pub struct ClientSender {
    client_id: String,
    tx: mpsc::UnboundedSender<Message>,
}

impl ClientSender {
    pub(crate) fn new(client_id: String, tx: mpsc::UnboundedSender<Message>) -> Self {
        Self { client_id, tx }
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn send(&self, msg: &ServerMessage) {
        match serde_json::to_string(msg) {
            Ok(text) => {
                if self.tx.send(Message::Text(text)).is_err() {
                    debug!(client = %self.client_id, "dropping message for disconnected client");
                }
            }
            Err(e) => error!(client = %self.client_id, error = %e, "cannot encode message"),
        }
    }

    fn close(&self) {
        let _ = self.tx.send(Message::Close(None));
    }
}

struct SignalingShared {
    bind_address: String,
    port: u16,
    max_clients: usize,
    cameras: Vec<CameraInfo>,
    clients: Mutex<HashMap<String, ClientSender>>,
    client_counter: AtomicU64,
    local_addr: Mutex<Option<SocketAddr>>,
    on_connect: RwLock<Option<ConnectHandler>>,
    on_disconnect: RwLock<Option<DisconnectHandler>>,
    on_message: RwLock<Option<MessageHandler>>,
}

struct ServeTask {
    handle: JoinHandle<()>,
    shutdown: oneshot::Sender<()>,
}

/// WebSocket signaling front-end.
pub struct SignalingServer {
    shared: Arc<SignalingShared>,
    serve: tokio::sync::Mutex<Option<ServeTask>>,
}

impl SignalingServer {
    pub fn new(config: &AppConfig) -> Self {
        Self {
            shared: Arc::new(SignalingShared {
                bind_address: config.server.bind_address.clone(),
                port: config.server.port,
                max_clients: config.webrtc.max_clients,
                cameras: config.cameras.iter().map(CameraInfo::from).collect(),
                clients: Mutex::new(HashMap::new()),
                client_counter: AtomicU64::new(0),
                local_addr: Mutex::new(None),
                on_connect: RwLock::new(None),
                on_disconnect: RwLock::new(None),
                on_message: RwLock::new(None),
            }),
            serve: tokio::sync::Mutex::new(None),
        }
    }

    /// Replace the connect handler. Handlers run on the socket task and
    /// must not block.
    pub fn on_client_connect(&self, handler: ConnectHandler) {
        *self.shared.on_connect.write() = Some(handler);
    }

    pub fn on_client_disconnect(&self, handler: DisconnectHandler) {
        *self.shared.on_disconnect.write() = Some(handler);
    }

    pub fn on_client_message(&self, handler: MessageHandler) {
        *self.shared.on_message.write() = Some(handler);
    }

    /// Bind the listener and start serving in a background task.
    pub async fn start(&self) -> Result<()> {
        let mut serve = self.serve.lock().await;
        if serve.is_some() {
            warn!("signaling server already started");
            return Ok(());
        }

        let addr = format!("{}:{}", self.shared.bind_address, self.shared.port);
        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .map_err(|e| AppError::Signaling(format!("cannot bind {addr}: {e}")))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| AppError::Signaling(format!("cannot read local address: {e}")))?;
        *self.shared.local_addr.lock() = Some(local_addr);

        let app = Router::new()
            .route("/", get(ws_handler))
            .with_state(self.shared.clone());

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let handle = tokio::spawn(async move {
            let server = axum::serve(listener, app).with_graceful_shutdown(async move {
                let _ = shutdown_rx.await;
            });
            if let Err(e) = server.await {
                error!(error = %e, "signaling server failed");
            }
        });

        *serve = Some(ServeTask {
            handle,
            shutdown: shutdown_tx,
        });
        info!(%local_addr, "signaling server listening");
        Ok(())
    }

    /// Close every live client and release the listener. Safe to call more
    /// than once and after a failed start.
    pub async fn stop(&self) {
        let mut serve = self.serve.lock().await;
        let Some(task) = serve.take() else {
            return;
        };

        let clients: Vec<ClientSender> = {
            let mut map = self.shared.clients.lock();
            map.drain().map(|(_, sender)| sender).collect()
        };
        for client in &clients {
            client.close();
        }

        let _ = task.shutdown.send(());
        // A client that never answers our Close frame must not wedge
        // shutdown; give connections a moment to drain, then cut them off.
        let mut handle = task.handle;
        if tokio::time::timeout(std::time::Duration::from_secs(1), &mut handle)
            .await
            .is_err()
        {
            handle.abort();
            let _ = handle.await;
        }
        *self.shared.local_addr.lock() = None;
        info!("signaling server stopped");
    }

    /// Address actually bound, useful when the configured port is 0.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.shared.local_addr.lock()
    }

    pub fn client_count(&self) -> usize {
        self.shared.clients.lock().len()
    }

    /// Deliver a message to one client. No-op if the client is not
    /// connected; never fails.
    pub fn send_to_client(&self, client_id: &str, msg: &ServerMessage) {
        let sender = self.shared.clients.lock().get(client_id).cloned();
        if let Some(sender) = sender {
            sender.send(msg);
        }
    }

    /// Send to every connected client.
    pub fn broadcast(&self, msg: &ServerMessage) {
        let senders: Vec<ClientSender> = self.shared.clients.lock().values().cloned().collect();
        for sender in senders {
            sender.send(msg);
        }
    }
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<SignalingShared>>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: Arc<SignalingShared>) {
    let n = state.client_counter.fetch_add(1, Ordering::SeqCst) + 1;
    let client_id = format!("client_{n}");
    let (mut ws_tx, mut ws_rx) = socket.split();

    // Admission is atomic with insertion into the client map. A rejected
    // client gets exactly one error frame and a close; no handler runs.
    let (tx, rx) = mpsc::unbounded_channel::<Message>();
    let sender = ClientSender::new(client_id.clone(), tx);
    {
        let mut clients = state.clients.lock();
        if clients.len() >= state.max_clients {
            drop(clients);
            warn!(client = %client_id, max = state.max_clients, "server full, rejecting");
            let reject = ServerMessage::Error {
                message: format!("Server is full, maximum {} clients", state.max_clients),
            };
            if let Ok(text) = serde_json::to_string(&reject) {
                let _ = ws_tx.send(Message::Text(text)).await;
            }
            let _ = ws_tx.close().await;
            return;
        }
        clients.insert(client_id.clone(), sender.clone());
    }
    info!(client = %client_id, "client connected");

    // Writer task: drains the queue so sends from other threads never block.
    let writer_id = client_id.clone();
    let mut rx = rx;
    let writer = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let closing = matches!(msg, Message::Close(_));
            if ws_tx.send(msg).await.is_err() {
                debug!(client = %writer_id, "socket write failed");
                break;
            }
            if closing {
                break;
            }
        }
        let _ = ws_tx.close().await;
    });

    // Camera list first, then the connect handler; the handler completes
    // before any client frame is processed.
    sender.send(&ServerMessage::CameraList {
        cameras: state.cameras.clone(),
    });
    let connect = state.on_connect.read().clone();
    if let Some(handler) = connect {
        handler(client_id.clone(), sender.clone()).await;
    }

    while let Some(msg) = ws_rx.next().await {
        match msg {
            Ok(Message::Text(text)) => route_text(&state, &client_id, &text).await,
            Ok(Message::Close(_)) => break,
            Ok(_) => {} // ping/pong/binary: nothing to do
            Err(e) => {
                warn!(client = %client_id, error = %e, "socket error");
                break;
            }
        }
    }

    // Removal gates the disconnect handler so it fires exactly once.
    let removed = state.clients.lock().remove(&client_id).is_some();
    if removed {
        info!(client = %client_id, "client disconnected");
        let disconnect = state.on_disconnect.read().clone();
        if let Some(handler) = disconnect {
            handler(client_id.clone()).await;
        }
    }
    writer.abort();
}

async fn route_text(state: &Arc<SignalingShared>, client_id: &str, text: &str) {
    match serde_json::from_str::<ClientMessage>(text) {
        Ok(msg) => {
            debug!(client = %client_id, ?msg, "signaling message");
            let handler = state.on_message.read().clone();
            if let Some(handler) = handler {
                handler(client_id.to_string(), msg).await;
            }
        }
        Err(parse_err) => match serde_json::from_str::<serde_json::Value>(text) {
            Ok(value) => {
                let kind = value
                    .get("type")
                    .and_then(|t| t.as_str())
                    .unwrap_or("<missing>");
                warn!(client = %client_id, message_type = kind, "unhandled signaling message, dropping");
            }
            Err(_) => {
                warn!(client = %client_id, error = %parse_err, "malformed JSON from client, dropping");
            }
        },
    }
}
