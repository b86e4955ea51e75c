use dashmap::DashMap;
use std::sync::{Arc, Weak};
use tracing::info;

use super::{Session, SessionOptions};
use crate::orchestrator::Shared;
use crate::{OrchestratorError, Result};

/// Sesiones activas indexadas por guild.
///
/// La inserción corre bajo el lock del shard del mapa: llamadas concurrentes
/// a `get_or_create` para una guild obtienen la misma sesión.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: DashMap<String, Arc<Session>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Devuelve la sesión de la guild, creándola con `options` si no existe.
    ///
    /// Si ya existe, `options` se ignora.
    pub(crate) fn get_or_create(
        &self,
        options: SessionOptions,
        owner: &Weak<Shared>,
    ) -> Result<Arc<Session>> {
        if options.guild_id.trim().is_empty() {
            return Err(OrchestratorError::Configuration(
                "session options require a guild id".into(),
            ));
        }

        let entry = self
            .sessions
            .entry(options.guild_id.clone())
            .or_insert_with(|| {
                info!("🆕 Sesión creada para guild {}", options.guild_id);
                Arc::new(Session::new(options, owner.clone()))
            });

        Ok(Arc::clone(entry.value()))
    }

    pub fn get(&self, guild_id: &str) -> Option<Arc<Session>> {
        self.sessions.get(guild_id).map(|s| Arc::clone(s.value()))
    }

    pub fn remove(&self, guild_id: &str) -> Option<Arc<Session>> {
        let removed = self.sessions.remove(guild_id).map(|(_, session)| session);
        if removed.is_some() {
            info!("🗑️ Sesión eliminada para guild {}", guild_id);
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn guild_ids(&self) -> Vec<String> {
        self.sessions.iter().map(|entry| entry.key().clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_or_create_is_identity_stable() {
        let registry = SessionRegistry::new();
        let owner = Weak::new();

        let first = registry
            .get_or_create(SessionOptions::new("1").with_voice_channel("a"), &owner)
            .unwrap();
        let second = registry
            .get_or_create(SessionOptions::new("1").with_voice_channel("b"), &owner)
            .unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        // Existing session wins over the second call's options.
        assert_eq!(second.voice_channel_id().as_deref(), Some("a"));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_get_is_explicit() {
        let registry = SessionRegistry::new();
        assert!(registry.get("1").is_none());

        let created = registry.get_or_create(SessionOptions::new("1"), &Weak::new()).unwrap();
        assert!(Arc::ptr_eq(&registry.get("1").unwrap(), &created));
        assert!(registry.get("2").is_none());
    }

    #[test]
    fn test_empty_guild_id_rejected() {
        let registry = SessionRegistry::new();
        assert!(matches!(
            registry.get_or_create(SessionOptions::new("  "), &Weak::new()),
            Err(OrchestratorError::Configuration(_))
        ));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_remove_then_recreate() {
        let registry = SessionRegistry::new();
        let owner = Weak::new();

        let first = registry.get_or_create(SessionOptions::new("1"), &owner).unwrap();
        let removed = registry.remove("1").unwrap();
        assert!(Arc::ptr_eq(&first, &removed));
        assert!(registry.remove("1").is_none());

        let second = registry.get_or_create(SessionOptions::new("1"), &owner).unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_get_or_create_creates_one_session() {
        let registry = Arc::new(SessionRegistry::new());

        let handles: Vec<_> = (0..64)
            .map(|_| {
                let registry = Arc::clone(&registry);
                tokio::spawn(async move {
                    registry
                        .get_or_create(SessionOptions::new("race"), &Weak::new())
                        .unwrap()
                })
            })
            .collect();

        let mut sessions = Vec::new();
        for handle in handles {
            sessions.push(handle.await.unwrap());
        }

        assert_eq!(registry.len(), 1);
        assert!(sessions.iter().all(|s| Arc::ptr_eq(s, &sessions[0])));
        assert_eq!(registry.guild_ids(), vec!["race".to_string()]);
    }
}
