use anyhow::Result;
use serenity::{
    builder::{CreateInteractionResponse, CreateInteractionResponseMessage, EditInteractionResponse},
    model::{
        application::CommandInteraction,
        id::{ChannelId, GuildId, UserId},
    },
    prelude::Context,
};
use tracing::{info, warn};

use crate::{
    bot::MusicBot,
    orchestrator::Orchestrator,
    search::{SearchQuery, SearchResult, DEFAULT_IDENTIFIER},
    session::SessionOptions,
};

/// Tracks listados en una respuesta de búsqueda.
const MAX_LISTED_TRACKS: usize = 5;

/// Maneja comandos slash
pub async fn handle_command(
    ctx: &Context,
    command: CommandInteraction,
    bot: &MusicBot,
) -> Result<()> {
    let guild_id = command
        .guild_id
        .ok_or_else(|| anyhow::anyhow!("Comando usado fuera de un servidor"))?;

    info!(
        "📝 Comando /{} usado por {} en guild {}",
        command.data.name, command.user.name, guild_id
    );

    match command.data.name.as_str() {
        "join" => handle_join(ctx, &command, bot, guild_id).await?,
        "search" => handle_search(ctx, &command, bot).await?,
        "leave" => handle_leave(ctx, &command, bot, guild_id).await?,
        _ => respond(ctx, &command, "❌ Comando no reconocido").await?,
    }

    Ok(())
}

async fn handle_join(
    ctx: &Context,
    command: &CommandInteraction,
    bot: &MusicBot,
    guild_id: GuildId,
) -> Result<()> {
    let voice_channel_id = match get_user_voice_channel(ctx, guild_id, command.user.id) {
        Ok(channel_id) => channel_id,
        Err(e) => return respond(ctx, command, &format!("❌ {}", e)).await,
    };

    let reply = join_reply(
        bot.orchestrator(),
        guild_id,
        command.channel_id,
        voice_channel_id,
    )
    .await;

    respond(ctx, command, &reply).await
}

/// Crea la sesión y entra al canal de voz; devuelve el texto de respuesta.
async fn join_reply(
    orchestrator: &Orchestrator,
    guild_id: GuildId,
    text_channel_id: ChannelId,
    voice_channel_id: ChannelId,
) -> String {
    let session = orchestrator.create_session(
        SessionOptions::new(guild_id.to_string()).with_text_channel(text_channel_id.to_string()),
    );
    let joined = match session {
        Ok(session) => session.connect(voice_channel_id.to_string()).await,
        Err(e) => Err(e),
    };

    match joined {
        Ok(()) => format!("🔊 Conectado a <#{}>", voice_channel_id),
        Err(e) => {
            warn!("Error al conectar en guild {}: {}", guild_id, e);
            format!("❌ No se pudo conectar al canal de voz: {}", e)
        }
    }
}

async fn handle_search(ctx: &Context, command: &CommandInteraction, bot: &MusicBot) -> Result<()> {
    let query = string_option(command, "query")
        .ok_or_else(|| anyhow::anyhow!("Query no proporcionado"))?;
    let source = string_option(command, "source").unwrap_or(DEFAULT_IDENTIFIER);

    // Defer la respuesta ya que puede tomar tiempo
    command
        .create_response(
            &ctx.http,
            CreateInteractionResponse::Defer(CreateInteractionResponseMessage::new()),
        )
        .await?;

    let content = match bot
        .orchestrator()
        .search(SearchQuery::new(query).with_identifier(source), command.user.id)
        .await
    {
        Ok(result) => format_search_result(&result),
        Err(e) => format!("❌ Error en la búsqueda: {}", e),
    };

    command
        .edit_response(&ctx.http, EditInteractionResponse::new().content(content))
        .await?;

    Ok(())
}

async fn handle_leave(
    ctx: &Context,
    command: &CommandInteraction,
    bot: &MusicBot,
    guild_id: GuildId,
) -> Result<()> {
    let guild_key = guild_id.to_string();
    let Some(session) = bot.orchestrator().get_session(&guild_key) else {
        return respond(ctx, command, "❌ No hay sesión activa en este servidor").await;
    };

    session.disconnect().await?;
    bot.orchestrator().remove_session(&guild_key);

    respond(ctx, command, "👋 Desconectado del canal de voz").await
}

// Funciones auxiliares

async fn respond(ctx: &Context, command: &CommandInteraction, content: &str) -> Result<()> {
    command
        .create_response(
            &ctx.http,
            CreateInteractionResponse::Message(
                CreateInteractionResponseMessage::new().content(content),
            ),
        )
        .await?;
    Ok(())
}

fn string_option<'a>(command: &'a CommandInteraction, name: &str) -> Option<&'a str> {
    command
        .data
        .options
        .iter()
        .find(|opt| opt.name == name)
        .and_then(|opt| opt.value.as_str())
}

fn get_user_voice_channel(ctx: &Context, guild_id: GuildId, user_id: UserId) -> Result<ChannelId> {
    let guild = guild_id
        .to_guild_cached(&ctx.cache)
        .ok_or_else(|| anyhow::anyhow!("Guild no encontrada en caché"))?;

    let channel_id = guild
        .voice_states
        .get(&user_id)
        .and_then(|voice_state| voice_state.channel_id)
        .ok_or_else(|| anyhow::anyhow!("Debes estar en un canal de voz"))?;

    Ok(channel_id)
}

/// Texto de respuesta para un resultado de búsqueda.
pub fn format_search_result(result: &SearchResult) -> String {
    let header = match result {
        SearchResult::NoResult { .. } => return "🔍 No se encontraron resultados".to_string(),
        SearchResult::Search { tracks, .. } => format!("🔍 {} resultados", tracks.len()),
        SearchResult::Playlist { playlist, tracks, .. } => {
            format!("📃 Playlist **{}** ({} canciones)", playlist.title, tracks.len())
        }
    };

    let mut lines = vec![header];
    for (index, track) in result.tracks().iter().take(MAX_LISTED_TRACKS).enumerate() {
        let title = track.title().unwrap_or("Sin título");
        let author = track
            .author()
            .filter(|author| !author.is_empty())
            .map(|author| format!(" - {}", author))
            .unwrap_or_default();
        let entry = match track.url() {
            Some(url) => format!("[{}]({})", title, url),
            None => title.to_string(),
        };
        lines.push(format!("`{}.` {}{}", index + 1, entry, author));
    }

    let remaining = result.tracks().len().saturating_sub(MAX_LISTED_TRACKS);
    if remaining > 0 {
        lines.push(format!("... y {} más", remaining));
    }

    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NodeOptions;
    use crate::orchestrator::{MockGatewaySender, OrchestratorConfig};
    use crate::search::{PlaylistInfo, Track};
    use serde_json::json;
    use std::sync::Arc;

    fn orchestrator_with(sender: MockGatewaySender) -> Orchestrator {
        Orchestrator::new(OrchestratorConfig::new(
            NodeOptions::new("localhost", 2333, "secret"),
            Arc::new(sender),
        ))
        .unwrap()
    }

    #[tokio::test]
    async fn test_join_reply_confirms_channel() {
        let mut sender = MockGatewaySender::new();
        sender.expect_send().times(1).returning(|_, _| Ok(()));
        let orchestrator = orchestrator_with(sender);

        let reply = join_reply(
            &orchestrator,
            GuildId::new(42),
            ChannelId::new(7),
            ChannelId::new(1000),
        )
        .await;

        assert_eq!(reply, "🔊 Conectado a <#1000>");
        let session = orchestrator.get_session("42").unwrap();
        assert_eq!(session.voice_channel_id().as_deref(), Some("1000"));
        assert_eq!(session.text_channel_id(), Some("7"));
    }

    #[tokio::test]
    async fn test_join_reply_reports_delivery_failure() {
        let mut sender = MockGatewaySender::new();
        sender
            .expect_send()
            .returning(|_, _| Err(anyhow::anyhow!("shard offline")));
        let orchestrator = orchestrator_with(sender);

        let reply = join_reply(
            &orchestrator,
            GuildId::new(42),
            ChannelId::new(7),
            ChannelId::new(1000),
        )
        .await;

        assert!(reply.starts_with("❌ No se pudo conectar al canal de voz"));
        assert!(reply.contains("shard offline"));
    }

    fn track(n: usize) -> Track {
        Track::from(json!({
            "url": format!("https://example.com/{}", n),
            "title": format!("Track {}", n),
            "author": "Artist"
        }))
    }

    #[test]
    fn test_format_no_result() {
        let result = SearchResult::NoResult {
            tracks: Vec::new(),
            requester: UserId::new(1),
        };
        assert_eq!(format_search_result(&result), "🔍 No se encontraron resultados");
    }

    #[test]
    fn test_format_truncates_long_lists() {
        let result = SearchResult::Search {
            tracks: (1..=8).map(track).collect(),
            requester: UserId::new(1),
        };

        let text = format_search_result(&result);
        assert!(text.starts_with("🔍 8 resultados"));
        assert!(text.contains("`1.` [Track 1](https://example.com/1) - Artist"));
        assert!(!text.contains("Track 6"));
        assert!(text.ends_with("... y 3 más"));
    }

    #[test]
    fn test_format_playlist_header() {
        let result = SearchResult::Playlist {
            playlist: PlaylistInfo {
                title: "Mix".to_string(),
                ..PlaylistInfo::default()
            },
            tracks: vec![track(1)],
            requester: UserId::new(1),
        };

        let text = format_search_result(&result);
        assert!(text.starts_with("📃 Playlist **Mix** (1 canciones)"));
    }

    #[test]
    fn test_format_tolerates_missing_fields() {
        let result = SearchResult::Search {
            tracks: vec![Track::from(json!({"title": null, "author": null}))],
            requester: UserId::new(1),
        };

        let text = format_search_result(&result);
        assert!(text.ends_with("`1.` Sin título"));
    }
}
