use thiserror::Error;

/// Errores del orquestador.
///
/// Los fallos del socket (`Connection`, `Protocol`) se reportan como
/// notificaciones [`NodeEvent`](crate::events::NodeEvent) y logs; solo los
/// fallos de una petición se devuelven a quien la hizo.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("node connection failed: {0}")]
    Connection(String),

    #[error("node request failed with status {status}: {message}")]
    Request { status: u16, message: String },

    #[error("malformed frame from node: {0}")]
    Protocol(String),

    #[error("invalid configuration: {0}")]
    Configuration(String),

    #[error("node has not issued an access token yet")]
    NotReady,

    #[error("session outlived its orchestrator")]
    Detached,

    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Delivery(#[from] anyhow::Error),
}

impl OrchestratorError {
    /// Status HTTP de los fallos de petición.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Request { status, .. } => Some(*status),
            Self::Http(e) => e.status().map(|s| s.as_u16()),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;
