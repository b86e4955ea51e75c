use anyhow::Result;
use std::time::Duration;

/// Identificador del nodo cuando no se configura ninguno.
pub const DEFAULT_NODE_IDENTIFIER: &str = "default-node";

/// Parámetros de conexión al nodo de audio.
#[derive(Debug, Clone)]
pub struct NodeOptions {
    pub host: String,
    pub port: u16,
    /// Secreto compartido enviado en el handshake del socket.
    pub secret: String,
    pub identifier: String,
    /// Usar `https`/`wss` en vez de `http`/`ws`.
    pub secure: bool,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
    pub reconnect: ReconnectPolicy,
}

impl NodeOptions {
    pub fn new(host: impl Into<String>, port: u16, secret: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port,
            secret: secret.into(),
            ..Self::default()
        }
    }

    pub fn with_identifier(mut self, identifier: impl Into<String>) -> Self {
        self.identifier = identifier.into();
        self
    }

    pub fn validate(&self) -> crate::Result<()> {
        use crate::OrchestratorError::Configuration;

        if self.host.trim().is_empty() {
            return Err(Configuration("node host must not be empty".into()));
        }
        if self.port == 0 {
            return Err(Configuration("node port must be greater than 0".into()));
        }
        if self.secret.is_empty() {
            return Err(Configuration("node secret must not be empty".into()));
        }
        if self.identifier.trim().is_empty() {
            return Err(Configuration("node identifier must not be empty".into()));
        }
        if self.connect_timeout.is_zero() || self.request_timeout.is_zero() {
            return Err(Configuration("node timeouts must be greater than 0".into()));
        }
        self.reconnect.validate()
    }
}

impl Default for NodeOptions {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 2333,
            secret: String::new(),
            identifier: DEFAULT_NODE_IDENTIFIER.to_string(),
            secure: false,
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(15),
            reconnect: ReconnectPolicy::default(),
        }
    }
}

/// Backoff exponencial tras un fallo o caída de la conexión.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl ReconnectPolicy {
    /// Espera antes del intento indicado (desde 1), sin jitter.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        self.base_delay
            .saturating_mul(1u32 << shift)
            .min(self.max_delay)
    }

    fn validate(&self) -> crate::Result<()> {
        if self.base_delay > self.max_delay {
            return Err(crate::OrchestratorError::Configuration(format!(
                "reconnect base delay {:?} exceeds max delay {:?}",
                self.base_delay, self.max_delay
            )));
        }
        Ok(())
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
        }
    }
}

/// Configuración del bot cargada desde variables de entorno.
#[derive(Debug, Clone)]
pub struct Config {
    // Discord
    pub discord_token: String,
    pub guild_id: Option<u64>, // Para comandos de desarrollo

    // Nodo
    pub node: NodeOptions,

    // Notificaciones
    pub event_buffer: usize,
}

impl Config {
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let config = Self {
            // Discord
            discord_token: std::env::var("DISCORD_TOKEN")?,
            guild_id: std::env::var("GUILD_ID").ok().and_then(|s| s.parse().ok()),

            // Nodo
            node: NodeOptions {
                host: std::env::var("NODE_HOST").unwrap_or_else(|_| "localhost".to_string()),
                port: std::env::var("NODE_PORT")
                    .unwrap_or_else(|_| "2333".to_string())
                    .parse()?,
                secret: std::env::var("NODE_SECRET")?,
                identifier: std::env::var("NODE_IDENTIFIER")
                    .unwrap_or_else(|_| DEFAULT_NODE_IDENTIFIER.to_string()),
                secure: std::env::var("NODE_SECURE")
                    .unwrap_or_else(|_| "false".to_string())
                    .parse()?,
                connect_timeout: env_duration("NODE_CONNECT_TIMEOUT", "10s")?,
                request_timeout: env_duration("NODE_REQUEST_TIMEOUT", "15s")?,
                reconnect: ReconnectPolicy {
                    max_attempts: std::env::var("NODE_RECONNECT_ATTEMPTS")
                        .unwrap_or_else(|_| "5".to_string())
                        .parse()?,
                    base_delay: env_duration("NODE_RECONNECT_BASE_DELAY", "1s")?,
                    max_delay: env_duration("NODE_RECONNECT_MAX_DELAY", "30s")?,
                },
            },

            event_buffer: std::env::var("EVENT_BUFFER")
                .unwrap_or_else(|_| "256".to_string())
                .parse()?,
        };

        config.validate()?;

        Ok(config)
    }

    /// Validates configuration values for correctness.
    ///
    /// # Validation Rules
    ///
    /// - Discord token must be present
    /// - Node host, port, secret and identifier must be set
    /// - Timeouts must be non-zero and the backoff base must not exceed its cap
    /// - Event buffer must hold at least one notification
    pub fn validate(&self) -> Result<()> {
        if self.discord_token.trim().is_empty() {
            anyhow::bail!("DISCORD_TOKEN must not be empty");
        }

        self.node.validate()?;

        if self.event_buffer == 0 {
            anyhow::bail!("Event buffer must be greater than 0");
        }

        Ok(())
    }

    /// Returns a summary of the current configuration for logging.
    ///
    /// The node secret and Discord token are never included.
    pub fn summary(&self) -> String {
        format!(
            "Config Summary:\n  \
            Discord: commands {}\n  \
            Node: {} at {}://{}:{} (connect {}, request {})\n  \
            Reconnect: {} attempts, {} .. {}\n  \
            Events: buffer {}",
            self.guild_id.map_or("global".to_string(), |id| format!("guild {}", id)),
            self.node.identifier,
            if self.node.secure { "wss" } else { "ws" },
            self.node.host,
            self.node.port,
            humantime::format_duration(self.node.connect_timeout),
            humantime::format_duration(self.node.request_timeout),
            self.node.reconnect.max_attempts,
            humantime::format_duration(self.node.reconnect.base_delay),
            humantime::format_duration(self.node.reconnect.max_delay),
            self.event_buffer
        )
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            // Discord (no defaults - must be provided)
            discord_token: String::new(),
            guild_id: None,

            node: NodeOptions::default(),

            event_buffer: 256,
        }
    }
}

fn env_duration(key: &str, default: &str) -> Result<Duration> {
    let raw = std::env::var(key).unwrap_or_else(|_| default.to_string());
    humantime::parse_duration(raw.trim())
        .map_err(|e| anyhow::anyhow!("{} is not a valid duration ({}): {}", key, raw, e))
}
