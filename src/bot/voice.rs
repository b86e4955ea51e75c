use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::Value;
use serenity::model::id::{ChannelId, GuildId};
use songbird::Songbird;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::orchestrator::GatewaySender;

/// Entrega payloads de voz al shard de Discord a través de songbird.
///
/// Songbird solo maneja el lado gateway (opcode 4 y los eventos de voz);
/// el audio lo transmite el nodo.
pub struct SongbirdGateway {
    songbird: Arc<Songbird>,
}

impl SongbirdGateway {
    pub fn new(songbird: Arc<Songbird>) -> Self {
        Self { songbird }
    }
}

#[async_trait]
impl GatewaySender for SongbirdGateway {
    async fn send(&self, guild_id: &str, payload: Value) -> Result<()> {
        let guild = GuildId::new(parse_snowflake(guild_id).context("guild id inválido")?);

        match payload["d"]["channel_id"].as_str() {
            Some(channel) => {
                let channel = ChannelId::new(parse_snowflake(channel).context("canal inválido")?);
                let songbird = Arc::clone(&self.songbird);

                // Resolves once both voice events arrived; the node receives
                // them through the event handler meanwhile.
                tokio::spawn(async move {
                    match songbird.join_gateway(guild, channel).await {
                        Ok(_) => debug!("Gateway de voz listo en guild {}", guild),
                        Err(e) => warn!("Error al unirse al canal {} en guild {}: {:?}", channel, guild, e),
                    }
                });
            }
            None => {
                if let Err(e) = self.songbird.remove(guild).await {
                    warn!("Error al salir del canal de voz en guild {}: {:?}", guild, e);
                }
            }
        }

        Ok(())
    }
}

fn parse_snowflake(raw: &str) -> Result<u64> {
    let id: u64 = raw.parse().with_context(|| format!("{:?} no es un snowflake", raw))?;
    if id == 0 {
        anyhow::bail!("snowflake 0 no es válido");
    }
    Ok(id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_snowflake() {
        assert_eq!(parse_snowflake("381880193251409931").unwrap(), 381880193251409931);
        assert!(parse_snowflake("0").is_err());
        assert!(parse_snowflake("abc").is_err());
        assert!(parse_snowflake("").is_err());
    }
}
