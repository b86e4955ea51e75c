//! # Event Router
//!
//! Two independent inbound flows meet here:
//!
//! - **Gateway -> node**: raw Discord gateway events handed over by the
//!   hosting application. Only `VOICE_SERVER_UPDATE` and `VOICE_STATE_UPDATE`
//!   are written to the node socket, verbatim.
//! - **Node -> application**: decoded node frames become typed
//!   [`OrchestratorEvent`]s published on the orchestrator's broadcast channel.

use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::node::{NodeFrame, NodeInfo};
use crate::orchestrator::Shared;
use crate::session::Session;

pub const VOICE_SERVER_UPDATE: &str = "VOICE_SERVER_UPDATE";
pub const VOICE_STATE_UPDATE: &str = "VOICE_STATE_UPDATE";

/// Envoltorio de dispatch del gateway (`op`/`t`/`d`), para cuando la
/// aplicación solo tiene el payload tipado.
#[derive(Debug, Clone, Serialize)]
pub struct GatewayEvent {
    pub op: u8,
    pub t: String,
    pub d: Value,
}

impl GatewayEvent {
    pub fn dispatch(t: impl Into<String>, d: Value) -> Self {
        Self { op: 0, t: t.into(), d }
    }

    pub fn to_value(&self) -> serde_json::Result<Value> {
        serde_json::to_value(self)
    }
}

/// Eventos de sesión emitidos por el nodo.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionEventKind {
    TrackAdd,
    TrackStart,
    TrackEnd,
    TrackError,
    QueueEnd,
}

impl SessionEventKind {
    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "TRACK_ADD" => Some(Self::TrackAdd),
            "TRACK_START" => Some(Self::TrackStart),
            "TRACK_END" => Some(Self::TrackEnd),
            "TRACK_ERROR" => Some(Self::TrackError),
            "QUEUE_END" => Some(Self::QueueEnd),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TrackAdd => "TRACK_ADD",
            Self::TrackStart => "TRACK_START",
            Self::TrackEnd => "TRACK_END",
            Self::TrackError => "TRACK_ERROR",
            Self::QueueEnd => "QUEUE_END",
        }
    }
}

/// Frame del nodo dirigido a la sesión de una guild.
#[derive(Debug, Clone)]
pub struct SessionEvent {
    pub kind: SessionEventKind,
    pub session: Arc<Session>,
    /// El frame completo tal como llegó del nodo.
    pub payload: Value,
}

/// Notificaciones del ciclo de vida de la conexión.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeEvent {
    Connected { node: NodeInfo },
    Disconnected { node: NodeInfo, reason: String },
    Error { node: NodeInfo, error: String },
}

#[derive(Debug, Clone)]
pub enum OrchestratorEvent {
    Node(NodeEvent),
    Session(SessionEvent),
}

/// Escribe un evento de voz reconocido en el socket del nodo.
///
/// Devuelve `true` si el evento se encoló. Otros tipos se ignoran en silencio;
/// un socket cerrado se registra y se publica como [`NodeEvent::Error`].
pub(crate) fn forward_gateway_event(shared: &Shared, raw: &Value) -> bool {
    let tag = match raw.get("t").and_then(Value::as_str) {
        Some(tag) if tag == VOICE_SERVER_UPDATE || tag == VOICE_STATE_UPDATE => tag,
        _ => return false,
    };

    debug!("📡 Reenviando {} al nodo", tag);

    match shared.node.send_raw(raw.to_string()) {
        Ok(()) => true,
        Err(e) => {
            warn!("No se pudo reenviar {} al nodo: {}", tag, e);
            shared.emit(OrchestratorEvent::Node(NodeEvent::Error {
                node: shared.node.info(),
                error: e.to_string(),
            }));
            false
        }
    }
}

/// Publica un frame decodificado del nodo.
pub(crate) fn route_node_frame(shared: &Shared, frame: NodeFrame, node: NodeInfo) {
    match frame {
        NodeFrame::Session {
            kind,
            guild_id,
            payload,
        } => {
            let Some(session) = shared.sessions.get(&guild_id) else {
                warn!(
                    "Evento {} para guild {} sin sesión, descartado",
                    kind.as_str(),
                    guild_id
                );
                return;
            };

            session.apply(kind, &payload);
            shared.emit(OrchestratorEvent::Session(SessionEvent {
                kind,
                session,
                payload,
            }));
        }
        NodeFrame::Error { message } => {
            warn!("⚠️ Nodo {} reportó error: {}", node.identifier, message);
            shared.emit(OrchestratorEvent::Node(NodeEvent::Error {
                node,
                error: message,
            }));
        }
        NodeFrame::Stats => debug!("📊 Estadísticas del nodo {}", node.identifier),
        // Consumed by the node connection itself.
        NodeFrame::Ready { .. } => {}
    }
}
