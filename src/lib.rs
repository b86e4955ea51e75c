//! # Open Music Orchestrator
//!
//! Session orchestration between many Discord guilds and one external audio
//! node.
//!
//! - [`node`] keeps the persistent socket and REST side channel to the node
//! - [`session`] holds one [`Session`] per guild in a [`SessionRegistry`]
//! - [`search`] resolves queries into a normalized [`SearchResult`]
//! - [`events`] routes voice gateway events to the node and node frames back
//!   to the application as typed [`OrchestratorEvent`]s
//!
//! The [`Orchestrator`] ties them together; [`bot`] is the serenity front end
//! used by the `open-music` binary.

pub mod bot;
pub mod config;
pub mod error;
pub mod events;
pub mod node;
pub mod orchestrator;
pub mod search;
pub mod session;

pub use config::{Config, NodeOptions, ReconnectPolicy};
pub use error::{OrchestratorError, Result};
pub use events::{GatewayEvent, NodeEvent, OrchestratorEvent, SessionEvent, SessionEventKind};
pub use node::{ConnectionState, NodeConnection, NodeInfo};
pub use orchestrator::{GatewaySender, Orchestrator, OrchestratorConfig};
pub use search::{PlaylistInfo, SearchQuery, SearchResult, SearchResultType, Track};
pub use session::{PlaybackSnapshot, Session, SessionOptions, SessionRegistry};

#[cfg(test)]
pub(crate) mod testing {
    use async_trait::async_trait;
    use serde_json::Value;

    use crate::GatewaySender;

    /// Sender para tests que no tocan el gateway.
    pub(crate) struct NullSender;

    #[async_trait]
    impl GatewaySender for NullSender {
        async fn send(&self, _guild_id: &str, _payload: Value) -> anyhow::Result<()> {
            Ok(())
        }
    }
}
