//! # Node Module
//!
//! Owns the single connection to the external audio node.
//!
//! The node is reached through two channels:
//!
//! - a persistent WebSocket (`ws://host:port/ws`) used to forward voice
//!   gateway payloads and to receive asynchronous node events
//! - a REST side channel (`http://host:port/api/...`) used by
//!   [`NodeConnection::make_request`]
//!
//! ## Lifecycle
//!
//! ```text
//! DISCONNECTED -> CONNECTING -> CONNECTED -> RECONNECTING -> CONNECTED
//!                                    \-> DISCONNECTED (destroy / retries exhausted)
//! ```
//!
//! Nothing is opened at construction; the orchestrator calls
//! [`NodeConnection::connect`] exactly once from `init`. Dropped sockets are
//! retried with bounded exponential backoff (see [`ReconnectPolicy`]).
//!
//! [`ReconnectPolicy`]: crate::config::ReconnectPolicy

mod frames;

use futures::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use rand::Rng;
use reqwest::Method;
use serde_json::Value;
use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc, Weak,
};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{
        client::IntoClientRequest,
        http::{header::AUTHORIZATION, HeaderValue},
        Message,
    },
    MaybeTlsStream, WebSocketStream,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::config::NodeOptions;
use crate::events::{self, NodeEvent, OrchestratorEvent};
use crate::orchestrator::Shared;
use crate::{OrchestratorError, Result};

pub(crate) use frames::NodeFrame;

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Estado de la conexión con el nodo.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

/// Foto de la conexión, incluida en las notificaciones de conexión.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeInfo {
    pub identifier: String,
    pub host: String,
    pub port: u16,
    pub state: ConnectionState,
}

/// URLs y cliente HTTP derivados de [`NodeOptions`].
///
/// Se construyen antes del orquestador para que los errores de configuración
/// aparezcan al crearlo.
pub(crate) struct Endpoints {
    rest_base: Url,
    socket_url: Url,
    http: reqwest::Client,
}

impl Endpoints {
    pub(crate) fn build(options: &NodeOptions) -> Result<Self> {
        let (http_scheme, ws_scheme) = if options.secure {
            ("https", "wss")
        } else {
            ("http", "ws")
        };

        let rest_base = Url::parse(&format!("{}://{}:{}", http_scheme, options.host, options.port))
            .map_err(|e| OrchestratorError::Configuration(format!("invalid node address: {}", e)))?;
        let socket_url = Url::parse(&format!("{}://{}:{}/ws", ws_scheme, options.host, options.port))
            .map_err(|e| OrchestratorError::Configuration(format!("invalid node address: {}", e)))?;

        let http = reqwest::Client::builder()
            .timeout(options.request_timeout)
            .connect_timeout(options.connect_timeout)
            .build()?;

        Ok(Self {
            rest_base,
            socket_url,
            http,
        })
    }
}

/// Conexión única con el nodo de audio.
pub struct NodeConnection {
    options: NodeOptions,
    endpoints: Endpoints,
    state: RwLock<ConnectionState>,
    token: RwLock<Option<String>>,
    client_id: RwLock<Option<String>>,
    /// Cola que vacía la tarea escritora; `None` mientras no hay socket abierto.
    outbound: Mutex<Option<mpsc::UnboundedSender<String>>>,
    /// Se incrementa con cada socket para ignorar lectores obsoletos.
    generation: AtomicU64,
    reconnecting: AtomicBool,
    shutdown: CancellationToken,
    orchestrator: Weak<Shared>,
}

impl NodeConnection {
    pub(crate) fn new(
        options: NodeOptions,
        endpoints: Endpoints,
        client_id: Option<String>,
        orchestrator: Weak<Shared>,
    ) -> Self {
        Self {
            options,
            endpoints,
            state: RwLock::new(ConnectionState::Disconnected),
            token: RwLock::new(None),
            client_id: RwLock::new(client_id),
            outbound: Mutex::new(None),
            generation: AtomicU64::new(0),
            reconnecting: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
            orchestrator,
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.read()
    }

    pub fn info(&self) -> NodeInfo {
        NodeInfo {
            identifier: self.options.identifier.clone(),
            host: self.options.host.clone(),
            port: self.options.port,
            state: self.state(),
        }
    }

    pub fn identifier(&self) -> &str {
        &self.options.identifier
    }

    pub fn client_id(&self) -> Option<String> {
        self.client_id.read().clone()
    }

    pub(crate) fn set_client_id(&self, client_id: String) {
        *self.client_id.write() = Some(client_id);
    }

    pub(crate) fn set_token(&self, token: String) {
        *self.token.write() = Some(token);
    }

    pub fn has_token(&self) -> bool {
        self.token.read().is_some()
    }

    fn set_state(&self, state: ConnectionState) {
        let previous = std::mem::replace(&mut *self.state.write(), state);
        if previous != state {
            debug!("🔀 Nodo {}: {:?} -> {:?}", self.options.identifier, previous, state);
        }
    }

    fn emit(&self, event: NodeEvent) {
        if let Some(shared) = self.orchestrator.upgrade() {
            shared.emit(OrchestratorEvent::Node(event));
        }
    }

    /// Abre el socket persistente.
    ///
    /// Los fallos se publican como [`NodeEvent::Error`] y pasan al ciclo de
    /// reconexión; nunca se devuelven a quien llama.
    pub async fn connect(self: &Arc<Self>) {
        if self.shutdown.is_cancelled() {
            warn!("Nodo {} destruido, no se reconecta", self.options.identifier);
            return;
        }

        self.set_state(ConnectionState::Connecting);
        info!(
            "🎼 Conectando al nodo {} en {}",
            self.options.identifier, self.endpoints.socket_url
        );

        match self.open_socket().await {
            Ok(socket) => self.attach(socket),
            Err(e) => {
                error!("❌ Error al conectar con el nodo {}: {}", self.options.identifier, e);
                self.set_state(ConnectionState::Disconnected);
                self.emit(NodeEvent::Error {
                    node: self.info(),
                    error: e.to_string(),
                });
                self.schedule_reconnect();
            }
        }
    }

    async fn open_socket(&self) -> Result<Socket> {
        let mut request = self
            .endpoints
            .socket_url
            .as_str()
            .into_client_request()
            .map_err(|e| OrchestratorError::Connection(e.to_string()))?;

        let headers = request.headers_mut();
        headers.insert(AUTHORIZATION, header_value(&self.options.secret)?);
        headers.insert("node-id", header_value(&self.options.identifier)?);
        if let Some(client_id) = self.client_id() {
            headers.insert("client-id", header_value(&client_id)?);
        }

        let (socket, _response) =
            tokio::time::timeout(self.options.connect_timeout, connect_async(request))
                .await
                .map_err(|_| {
                    OrchestratorError::Connection(format!(
                        "timed out after {:?}",
                        self.options.connect_timeout
                    ))
                })?
                .map_err(|e| OrchestratorError::Connection(e.to_string()))?;

        Ok(socket)
    }

    fn attach(self: &Arc<Self>, socket: Socket) {
        if self.shutdown.is_cancelled() {
            return;
        }

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let (mut sink, mut stream) = socket.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();

        *self.outbound.lock() = Some(tx);
        self.set_state(ConnectionState::Connected);
        info!("✅ Nodo {} conectado", self.options.identifier);
        self.emit(NodeEvent::Connected { node: self.info() });

        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        let _ = sink.send(Message::Close(None)).await;
                        break;
                    }
                    next = rx.recv() => match next {
                        Some(text) => {
                            if let Err(e) = sink.send(Message::text(text)).await {
                                warn!("Error escribiendo en el socket del nodo: {}", e);
                                break;
                            }
                        }
                        None => break,
                    }
                }
            }
        });

        let node = Arc::clone(self);
        tokio::spawn(async move {
            let reason = loop {
                tokio::select! {
                    _ = node.shutdown.cancelled() => return,
                    frame = stream.next() => match frame {
                        Some(Ok(Message::Text(text))) => node.handle_text(&text),
                        Some(Ok(Message::Close(close))) => {
                            break close
                                .map(|c| c.reason.to_string())
                                .filter(|r| !r.is_empty())
                                .unwrap_or_else(|| "closed by node".to_string());
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => break e.to_string(),
                        None => break "stream ended".to_string(),
                    }
                }
            };
            node.on_socket_lost(generation, reason);
        });
    }

    fn handle_text(&self, text: &str) {
        match frames::decode(text) {
            Ok(NodeFrame::Ready { token }) => {
                info!("🔑 Nodo {} listo, token recibido", self.options.identifier);
                self.set_token(token);
            }
            Ok(frame) => {
                if let Some(shared) = self.orchestrator.upgrade() {
                    events::route_node_frame(&shared, frame, self.info());
                }
            }
            Err(e) => warn!("Frame descartado del nodo {}: {}", self.options.identifier, e),
        }
    }

    fn on_socket_lost(self: &Arc<Self>, generation: u64, reason: String) {
        if self.generation.load(Ordering::SeqCst) != generation {
            return;
        }
        self.outbound.lock().take();
        if self.shutdown.is_cancelled() {
            return;
        }

        warn!("🔌 Socket del nodo {} perdido: {}", self.options.identifier, reason);
        self.set_state(ConnectionState::Reconnecting);
        self.emit(NodeEvent::Disconnected {
            node: self.info(),
            reason,
        });
        self.schedule_reconnect();
    }

    fn schedule_reconnect(self: &Arc<Self>) {
        if self.shutdown.is_cancelled() {
            return;
        }
        if self.options.reconnect.max_attempts == 0 {
            self.set_state(ConnectionState::Disconnected);
            return;
        }
        // Only one loop at a time.
        if self.reconnecting.swap(true, Ordering::SeqCst) {
            return;
        }

        let node = Arc::clone(self);
        tokio::spawn(async move { node.reconnect_loop().await });
    }

    async fn reconnect_loop(self: Arc<Self>) {
        let policy = self.options.reconnect.clone();

        for attempt in 1..=policy.max_attempts {
            let delay = policy.delay_for(attempt) + jitter();
            info!(
                "🔄 Reintentando nodo {} en {:?} (intento {}/{})",
                self.options.identifier, delay, attempt, policy.max_attempts
            );

            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    self.reconnecting.store(false, Ordering::SeqCst);
                    return;
                }
                _ = tokio::time::sleep(delay) => {}
            }

            self.set_state(ConnectionState::Reconnecting);
            match self.open_socket().await {
                Ok(socket) => {
                    self.reconnecting.store(false, Ordering::SeqCst);
                    self.attach(socket);
                    return;
                }
                Err(e) => {
                    warn!("Intento {} fallido para nodo {}: {}", attempt, self.options.identifier, e);
                    self.emit(NodeEvent::Error {
                        node: self.info(),
                        error: e.to_string(),
                    });
                }
            }
        }

        error!(
            "❌ Nodo {} inalcanzable tras {} intentos",
            self.options.identifier, policy.max_attempts
        );
        self.set_state(ConnectionState::Disconnected);
        self.reconnecting.store(false, Ordering::SeqCst);
        self.emit(NodeEvent::Disconnected {
            node: self.info(),
            reason: format!("gave up after {} attempts", policy.max_attempts),
        });
    }

    /// Encola un frame de texto en el socket persistente.
    pub(crate) fn send_raw(&self, text: String) -> Result<()> {
        match self.outbound.lock().as_ref() {
            Some(tx) => tx
                .send(text)
                .map_err(|_| OrchestratorError::Connection("socket writer has stopped".into())),
            None => Err(OrchestratorError::Connection("socket is not open".into())),
        }
    }

    /// Hace una llamada REST al nodo.
    ///
    /// Un status no exitoso es [`OrchestratorError::Request`]; un cuerpo vacío
    /// devuelve `Value::Null`.
    pub async fn make_request(&self, method: Method, path: &str) -> Result<Value> {
        let token = self.token.read().clone().ok_or(OrchestratorError::NotReady)?;
        let url = self
            .endpoints
            .rest_base
            .join(path)
            .map_err(|e| OrchestratorError::Configuration(format!("invalid request path {}: {}", path, e)))?;

        debug!("🌐 {} {}", method, url);

        let mut request = self.endpoints.http.request(method, url).bearer_auth(token);
        if let Some(client_id) = self.client_id() {
            request = request.header("Client-Id", client_id);
        }

        let response = request.send().await?;
        let status = response.status();

        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            warn!("Nodo respondió {} para {}: {}", status, path, message);
            return Err(OrchestratorError::Request {
                status: status.as_u16(),
                message,
            });
        }

        let body = response.bytes().await?;
        if body.is_empty() {
            return Ok(Value::Null);
        }
        Ok(serde_json::from_slice(&body)?)
    }

    /// Cierra el socket y detiene la reconexión. Idempotente.
    pub fn destroy(&self) {
        if self.shutdown.is_cancelled() {
            return;
        }
        self.shutdown.cancel();
        self.outbound.lock().take();
        self.set_state(ConnectionState::Disconnected);
        info!("👋 Conexión con el nodo {} cerrada", self.options.identifier);
        self.emit(NodeEvent::Disconnected {
            node: self.info(),
            reason: "destroyed".to_string(),
        });
    }

    pub fn is_destroyed(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Reemplaza el escritor del socket por un canal en memoria.
    #[cfg(test)]
    pub(crate) fn attach_test_sink(&self) -> mpsc::UnboundedReceiver<String> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.outbound.lock() = Some(tx);
        self.set_state(ConnectionState::Connected);
        rx
    }
}

fn header_value(value: &str) -> Result<HeaderValue> {
    HeaderValue::from_str(value)
        .map_err(|e| OrchestratorError::Configuration(format!("invalid header value: {}", e)))
}

fn jitter() -> Duration {
    Duration::from_millis(rand::thread_rng().gen_range(0..=250))
}
