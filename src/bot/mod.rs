//! # Bot Module
//!
//! Serenity front end for the orchestrator.
//!
//! [`MusicBot`] implements Serenity's [`EventHandler`] and:
//!
//! - registers the `/join`, `/search` and `/leave` slash commands
//! - initializes the [`Orchestrator`] once the bot's user id is known
//! - feeds voice server/state updates to the node
//! - announces node notifications in the session's text channel
//!
//! Gateway delivery of voice state payloads goes through [`SongbirdGateway`].

use anyhow::Result;
use serenity::{
    all::{ChannelId, Context, EventHandler, GuildId, Interaction, Ready, VoiceState},
    async_trait,
    http::Http,
    model::event::VoiceServerUpdateEvent,
};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, error, info, warn};

pub mod commands;
pub mod handlers;
pub mod voice;

pub use voice::SongbirdGateway;

use crate::{
    config::Config,
    events::{GatewayEvent, NodeEvent, OrchestratorEvent, SessionEvent, SessionEventKind},
    orchestrator::Orchestrator,
};

/// Handler de eventos de Discord que maneja el orquestador.
pub struct MusicBot {
    config: Arc<Config>,
    orchestrator: Orchestrator,
    announcer_started: AtomicBool,
}

impl MusicBot {
    pub fn new(config: Config, orchestrator: Orchestrator) -> Self {
        Self {
            config: Arc::new(config),
            orchestrator,
            announcer_started: AtomicBool::new(false),
        }
    }

    pub fn orchestrator(&self) -> &Orchestrator {
        &self.orchestrator
    }

    /// Registra los comandos slash en Discord.
    ///
    /// Por guild (con `GUILD_ID`) se propagan casi al instante; los globales
    /// pueden tardar hasta una hora.
    async fn register_commands(&self, ctx: &Context) -> Result<()> {
        info!("📝 Registrando comandos slash...");

        match self.config.guild_id {
            Some(guild_id) => {
                info!("🏠 Registrando comandos para guild específica: {}", guild_id);
                let guild_id = GuildId::new(guild_id);

                // Verificar que el bot esté en la guild
                if !ctx.cache.guilds().contains(&guild_id) {
                    warn!("⚠️ El bot no está en la guild especificada: {}", guild_id);
                    return Ok(());
                }

                commands::register_guild_commands(ctx, guild_id).await.map_err(|e| {
                    error!("❌ Error registrando comandos de guild: {:?}", e);
                    anyhow::anyhow!("No se pudieron registrar comandos de guild. Verifica que el bot tenga permisos de 'applications.commands' en la guild.")
                })?;
                info!("✅ Comandos de guild registrados para: {}", guild_id);
            }
            None => {
                info!("🌐 Registrando comandos globalmente");
                commands::register_global_commands(ctx).await.map_err(|e| {
                    error!("❌ Error registrando comandos globales: {:?}", e);
                    anyhow::anyhow!("No se pudieron registrar comandos globales. Verifica que el bot tenga permisos de 'applications.commands'.")
                })?;
                info!("✅ Comandos globales registrados");
            }
        }

        Ok(())
    }

    fn forward(&self, t: &str, d: serde_json::Value) {
        let raw = match GatewayEvent::dispatch(t, d).to_value() {
            Ok(raw) => raw,
            Err(e) => {
                warn!("No se pudo serializar {}: {:?}", t, e);
                return;
            }
        };
        if !self.orchestrator.forward_gateway_event(&raw) {
            debug!("Evento {} no enviado al nodo", t);
        }
    }
}

#[async_trait]
impl EventHandler for MusicBot {
    async fn ready(&self, ctx: Context, ready: Ready) {
        info!("🤖 {} está en línea!", ready.user.name);
        info!("📊 Conectado a {} servidores", ready.guilds.len());

        if let Err(e) = self.register_commands(&ctx).await {
            error!("Error al registrar comandos: {:?}", e);
        }

        // READY se repite tras cada reconexión del shard
        if !self.announcer_started.swap(true, Ordering::SeqCst) {
            let receiver = self.orchestrator.subscribe();
            let http = Arc::clone(&ctx.http);
            tokio::spawn(announce_events(receiver, http));
        }

        self.orchestrator.init(ready.user.id.to_string()).await;
    }

    async fn interaction_create(&self, ctx: Context, interaction: Interaction) {
        if let Interaction::Command(command_interaction) = interaction {
            if let Err(e) = handlers::handle_command(&ctx, command_interaction, self).await {
                error!("Error manejando comando: {:?}", e);
            }
        }
    }

    async fn voice_state_update(&self, ctx: Context, old: Option<VoiceState>, new: VoiceState) {
        match serde_json::to_value(&new) {
            Ok(d) => self.forward(crate::events::VOICE_STATE_UPDATE, d),
            Err(e) => warn!("No se pudo serializar VOICE_STATE_UPDATE: {:?}", e),
        }

        // Detectar si el bot fue desconectado
        let current_user_id = ctx.cache.current_user().id;
        if new.user_id == current_user_id && old.is_some() && new.channel_id.is_none() {
            if let Some(guild_id) = new.guild_id {
                info!("🔌 Bot desconectado en guild {}", guild_id);
                self.orchestrator.remove_session(&guild_id.to_string());
            }
        }
    }

    async fn voice_server_update(&self, _ctx: Context, event: VoiceServerUpdateEvent) {
        match serde_json::to_value(&event) {
            Ok(d) => self.forward(crate::events::VOICE_SERVER_UPDATE, d),
            Err(e) => warn!("No se pudo serializar VOICE_SERVER_UPDATE: {:?}", e),
        }
    }
}

/// Registra notificaciones del nodo y anuncia canciones en el canal de texto.
async fn announce_events(mut receiver: tokio::sync::broadcast::Receiver<OrchestratorEvent>, http: Arc<Http>) {
    loop {
        let event = match receiver.recv().await {
            Ok(event) => event,
            Err(RecvError::Lagged(skipped)) => {
                warn!("⚠️ Se perdieron {} notificaciones del orquestador", skipped);
                continue;
            }
            Err(RecvError::Closed) => break,
        };

        match event {
            OrchestratorEvent::Node(NodeEvent::Connected { node }) => {
                info!("🎼 Nodo {} conectado", node.identifier);
            }
            OrchestratorEvent::Node(NodeEvent::Disconnected { node, reason }) => {
                warn!("🔌 Nodo {} desconectado: {}", node.identifier, reason);
            }
            OrchestratorEvent::Node(NodeEvent::Error { node, error }) => {
                error!("❌ Error en nodo {}: {}", node.identifier, error);
            }
            OrchestratorEvent::Session(event) => {
                if let Some(content) = announcement(&event) {
                    let Some(channel_id) = event
                        .session
                        .text_channel_id()
                        .and_then(|id| id.parse::<u64>().ok())
                        .filter(|id| *id != 0)
                    else {
                        continue;
                    };

                    if let Err(e) = ChannelId::new(channel_id).say(&*http, content).await {
                        warn!("No se pudo anunciar en el canal {}: {:?}", channel_id, e);
                    }
                }
            }
        }
    }

    debug!("Canal de notificaciones cerrado");
}

/// Mensaje para anunciar un evento de sesión, si corresponde.
fn announcement(event: &SessionEvent) -> Option<String> {
    match event.kind {
        SessionEventKind::TrackStart => {
            let current = event.session.playback().current?;
            Some(format!(
                "🎵 Reproduciendo: **{}**",
                current.title().unwrap_or("Sin título")
            ))
        }
        SessionEventKind::TrackError => Some("❌ Error al reproducir la canción".to_string()),
        SessionEventKind::QueueEnd => Some("📭 La cola ha terminado".to_string()),
        SessionEventKind::TrackAdd | SessionEventKind::TrackEnd => None,
    }
}
