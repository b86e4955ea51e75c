//! # Session Module
//!
//! One [`Session`] per guild, stored in the [`SessionRegistry`].
//!
//! Sessions hold a non-owning reference to their orchestrator; they reach the
//! hosting application's gateway through it when joining or leaving a voice
//! channel. Queue and playback control live on the node; the session only
//! mirrors what the node reports.

mod registry;

pub use registry::SessionRegistry;

use parking_lot::RwLock;
use serde_json::{json, Value};
use std::sync::Weak;
use tracing::{debug, info};

use crate::events::SessionEventKind;
use crate::orchestrator::{Orchestrator, Shared};
use crate::search::Track;
use crate::{OrchestratorError, Result};

/// Opciones para crear una sesión.
#[derive(Debug, Clone, Default)]
pub struct SessionOptions {
    pub guild_id: String,
    pub voice_channel_id: Option<String>,
    pub text_channel_id: Option<String>,
    pub self_deaf: bool,
}

impl SessionOptions {
    pub fn new(guild_id: impl Into<String>) -> Self {
        Self {
            guild_id: guild_id.into(),
            self_deaf: true,
            ..Self::default()
        }
    }

    pub fn with_voice_channel(mut self, channel_id: impl Into<String>) -> Self {
        self.voice_channel_id = Some(channel_id.into());
        self
    }

    pub fn with_text_channel(mut self, channel_id: impl Into<String>) -> Self {
        self.text_channel_id = Some(channel_id.into());
        self
    }
}

/// Lo último que reportó el nodo para esta guild.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PlaybackSnapshot {
    pub playing: bool,
    pub current: Option<Track>,
    pub last_event: Option<SessionEventKind>,
}

#[derive(Debug)]
pub struct Session {
    guild_id: String,
    text_channel_id: Option<String>,
    self_deaf: bool,
    voice_channel_id: RwLock<Option<String>>,
    playback: RwLock<PlaybackSnapshot>,
    orchestrator: Weak<Shared>,
}

impl Session {
    pub(crate) fn new(options: SessionOptions, orchestrator: Weak<Shared>) -> Self {
        Self {
            guild_id: options.guild_id,
            text_channel_id: options.text_channel_id,
            self_deaf: options.self_deaf,
            voice_channel_id: RwLock::new(options.voice_channel_id),
            playback: RwLock::new(PlaybackSnapshot::default()),
            orchestrator,
        }
    }

    pub fn guild_id(&self) -> &str {
        &self.guild_id
    }

    pub fn text_channel_id(&self) -> Option<&str> {
        self.text_channel_id.as_deref()
    }

    pub fn voice_channel_id(&self) -> Option<String> {
        self.voice_channel_id.read().clone()
    }

    pub fn playback(&self) -> PlaybackSnapshot {
        self.playback.read().clone()
    }

    /// El orquestador dueño, si sigue vivo.
    pub fn orchestrator(&self) -> Option<Orchestrator> {
        self.orchestrator.upgrade().map(Orchestrator::from_shared)
    }

    /// Pide al gateway entrar a `channel_id`.
    ///
    /// El nodo recibe los eventos de voz resultantes cuando la aplicación
    /// los reenvía.
    pub async fn connect(&self, channel_id: impl Into<String>) -> Result<()> {
        let channel_id = channel_id.into();
        let payload = voice_state_payload(&self.guild_id, Some(&channel_id), self.self_deaf);

        self.deliver(payload).await?;
        info!("🔊 Sesión {} uniéndose al canal {}", self.guild_id, channel_id);
        *self.voice_channel_id.write() = Some(channel_id);
        Ok(())
    }

    /// Pide al gateway salir del canal de voz actual.
    pub async fn disconnect(&self) -> Result<()> {
        let payload = voice_state_payload(&self.guild_id, None, self.self_deaf);

        self.deliver(payload).await?;
        info!("👋 Sesión {} saliendo del canal de voz", self.guild_id);
        *self.voice_channel_id.write() = None;
        *self.playback.write() = PlaybackSnapshot::default();
        Ok(())
    }

    async fn deliver(&self, payload: Value) -> Result<()> {
        let shared = self.orchestrator.upgrade().ok_or(OrchestratorError::Detached)?;
        shared.deliver(&self.guild_id, payload).await
    }

    /// Refleja un evento del nodo en el estado de reproducción.
    pub(crate) fn apply(&self, kind: SessionEventKind, payload: &Value) {
        let mut playback = self.playback.write();
        playback.last_event = Some(kind);

        match kind {
            SessionEventKind::TrackStart => {
                playback.playing = true;
                playback.current = payload
                    .get("track")
                    .filter(|track| !track.is_null())
                    .cloned()
                    .map(Track::from);
            }
            SessionEventKind::TrackEnd
            | SessionEventKind::TrackError
            | SessionEventKind::QueueEnd => {
                playback.playing = false;
                playback.current = None;
            }
            SessionEventKind::TrackAdd => {}
        }

        debug!("Sesión {}: {} -> playing={}", self.guild_id, kind.as_str(), playback.playing);
    }
}

/// Opcode 4 del gateway (voice state update).
fn voice_state_payload(guild_id: &str, channel_id: Option<&str>, self_deaf: bool) -> Value {
    json!({
        "op": 4,
        "d": {
            "guild_id": guild_id,
            "channel_id": channel_id,
            "self_mute": false,
            "self_deaf": self_deaf,
        }
    })
}
