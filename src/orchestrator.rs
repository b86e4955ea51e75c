//! # Orchestrator
//!
//! Entry point offered to the hosting application.
//!
//! An [`Orchestrator`] owns exactly one [`NodeConnection`] and one
//! [`SessionRegistry`]. Both are created in [`Orchestrator::new`]; the node
//! socket is only opened by [`Orchestrator::init`], and only once.
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use open_music::{NodeOptions, Orchestrator, OrchestratorConfig, SearchQuery, SessionOptions};
//! # use open_music::GatewaySender;
//! # async fn example(sender: Arc<dyn GatewaySender>) -> anyhow::Result<()> {
//! let config = OrchestratorConfig::new(NodeOptions::new("localhost", 2333, "youshallnotpass"), sender);
//! let orchestrator = Orchestrator::new(config)?;
//! let mut events = orchestrator.subscribe();
//!
//! orchestrator.init("123456789").await;
//!
//! let session = orchestrator.create_session(SessionOptions::new("987654321"))?;
//! session.connect("555").await?;
//!
//! let result = orchestrator
//!     .search(SearchQuery::new("lofi beats"), serenity::all::UserId::new(1))
//!     .await?;
//! println!("{} tracks", result.tracks().len());
//! # drop(events.recv().await);
//! # Ok(())
//! # }
//! ```

use async_trait::async_trait;
use serde_json::Value;
use serenity::model::id::UserId;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::config::NodeOptions;
use crate::events::{self, OrchestratorEvent};
use crate::node::{ConnectionState, Endpoints, NodeConnection};
use crate::search::{self, SearchQuery, SearchResult};
use crate::session::{Session, SessionOptions, SessionRegistry};
use crate::{OrchestratorError, Result};

/// Entrega payloads de voz al shard de la aplicación para una guild.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait GatewaySender: Send + Sync {
    async fn send(&self, guild_id: &str, payload: Value) -> anyhow::Result<()>;
}

/// Configuración del orquestador, fija tras la construcción.
#[derive(Clone)]
pub struct OrchestratorConfig {
    pub node: NodeOptions,
    pub sender: Arc<dyn GatewaySender>,
    /// ID del bot; normalmente se conoce cuando el gateway está listo y llega
    /// por [`Orchestrator::init`].
    pub client_id: Option<String>,
    pub event_capacity: usize,
}

impl OrchestratorConfig {
    pub fn new(node: NodeOptions, sender: Arc<dyn GatewaySender>) -> Self {
        Self {
            node,
            sender,
            client_id: None,
            event_capacity: 256,
        }
    }

    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = Some(client_id.into());
        self
    }

    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }

    fn validate(&self) -> Result<()> {
        self.node.validate()?;
        if self.event_capacity == 0 {
            return Err(OrchestratorError::Configuration(
                "event capacity must be greater than 0".into(),
            ));
        }
        Ok(())
    }
}

impl std::fmt::Debug for OrchestratorConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrchestratorConfig")
            .field("node", &self.node.identifier)
            .field("client_id", &self.client_id)
            .field("event_capacity", &self.event_capacity)
            .finish_non_exhaustive()
    }
}

/// Estado compartido por el orquestador, su conexión al nodo y sus sesiones
/// (estas dos últimas mediante referencias `Weak`).
pub(crate) struct Shared {
    pub(crate) node: Arc<NodeConnection>,
    pub(crate) sessions: SessionRegistry,
    sender: Arc<dyn GatewaySender>,
    events: broadcast::Sender<OrchestratorEvent>,
    initialized: AtomicBool,
}

impl Shared {
    pub(crate) fn emit(&self, event: OrchestratorEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    pub(crate) async fn deliver(&self, guild_id: &str, payload: Value) -> Result<()> {
        self.sender.send(guild_id, payload).await?;
        Ok(())
    }
}

impl std::fmt::Debug for Shared {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Shared")
            .field("node", &self.node.info())
            .field("sessions", &self.sessions.len())
            .finish_non_exhaustive()
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        self.node.destroy();
    }
}

/// Handle del orquestador. Clonarlo es barato.
#[derive(Clone, Debug)]
pub struct Orchestrator {
    shared: Arc<Shared>,
}

impl Orchestrator {
    /// Crea el orquestador y su conexión al nodo, todavía sin conectar.
    ///
    /// Parámetros inválidos del nodo son [`OrchestratorError::Configuration`].
    pub fn new(config: OrchestratorConfig) -> Result<Self> {
        config.validate()?;

        let endpoints = Endpoints::build(&config.node)?;
        let (events, _) = broadcast::channel(config.event_capacity);
        let OrchestratorConfig {
            node,
            sender,
            client_id,
            ..
        } = config;

        let shared = Arc::new_cyclic(|weak| Shared {
            node: Arc::new(NodeConnection::new(node, endpoints, client_id, weak.clone())),
            sessions: SessionRegistry::new(),
            sender,
            events,
            initialized: AtomicBool::new(false),
        });

        info!("🎛️ Orquestador creado para nodo {}", shared.node.identifier());
        Ok(Self { shared })
    }

    pub(crate) fn from_shared(shared: Arc<Shared>) -> Self {
        Self { shared }
    }

    pub(crate) fn shared(&self) -> &Shared {
        &self.shared
    }

    /// Guarda el ID del bot y abre la conexión con el nodo.
    ///
    /// Solo la primera llamada tiene efecto. Los fallos de conexión se publican
    /// por [`subscribe`](Self::subscribe), nunca se devuelven.
    pub async fn init(&self, client_id: impl Into<String>) {
        if self.shared.initialized.swap(true, Ordering::SeqCst) {
            debug!("Orquestador ya inicializado, se ignora");
            return;
        }

        let client_id = client_id.into();
        info!("🚀 Inicializando orquestador para cliente {}", client_id);
        self.shared.node.set_client_id(client_id);
        self.shared.node.connect().await;
    }

    pub fn is_initialized(&self) -> bool {
        self.shared.initialized.load(Ordering::SeqCst)
    }

    pub fn client_id(&self) -> Option<String> {
        self.shared.node.client_id()
    }

    pub async fn search(&self, query: SearchQuery, requester: UserId) -> Result<SearchResult> {
        search::resolve(&self.shared.node, &query, requester).await
    }

    /// Devuelve la sesión de la guild, creándola si no existe.
    pub fn create_session(&self, options: SessionOptions) -> Result<Arc<Session>> {
        let owner = Arc::downgrade(&self.shared);
        self.shared.sessions.get_or_create(options, &owner)
    }

    pub fn get_session(&self, guild_id: &str) -> Option<Arc<Session>> {
        self.shared.sessions.get(guild_id)
    }

    pub fn remove_session(&self, guild_id: &str) -> Option<Arc<Session>> {
        self.shared.sessions.remove(guild_id)
    }

    pub fn sessions(&self) -> &SessionRegistry {
        &self.shared.sessions
    }

    /// Reenvía un evento crudo del gateway (`{"t": ..., "d": ...}`) al nodo.
    ///
    /// Solo se reenvían los updates de voz; devuelve si el evento
    /// se escribió.
    pub fn forward_gateway_event(&self, raw: &Value) -> bool {
        events::forward_gateway_event(&self.shared, raw)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<OrchestratorEvent> {
        self.shared.events.subscribe()
    }

    pub fn node(&self) -> &Arc<NodeConnection> {
        &self.shared.node
    }

    pub fn node_state(&self) -> ConnectionState {
        self.shared.node.state()
    }

    /// Cierra la conexión con el nodo. Idempotente.
    pub fn destroy(&self) {
        self.shared.node.destroy();
    }
}
