use anyhow::Result;

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[derive(Clone)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub engine: EngineConfig,
    pub smtp: SmtpConfig,
    pub whatsapp: WhatsAppConfig,
    pub knowledge: KnowledgeConfig,
}

#[derive(Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Clone)]
pub struct DatabaseConfig {
    pub url: Option<String>,
}

#[derive(Clone)]
pub struct EngineConfig {
    /// Queue partitions; one worker task per partition.
    pub partitions: usize,
    /// Hours of inactivity after which a conversation auto-closes.
    pub inactivity_window_hours: i64,
    /// Redeliveries of a single event before it is dead-lettered.
    pub max_event_attempts: u32,
    /// Delivery attempts per dispatch before dead-lettering.
    pub max_dispatch_attempts: u32,
    /// Base backoff for dispatch retries, doubled per attempt.
    pub dispatch_backoff_ms: u64,
    /// Shared budget for knowledge-search calls across all workers.
    pub search_rate_per_second: u32,
    /// Grace period for in-flight events on shutdown.
    pub shutdown_grace_secs: u64,
}

#[derive(Clone)]
pub struct SmtpConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub from_address: String,
}

#[derive(Clone)]
pub struct WhatsAppConfig {
    pub phone_number_id: String,
    pub access_token: String,
}

#[derive(Clone)]
pub struct KnowledgeConfig {
    /// HTTP search endpoint returning `[{title, content, score}]`.
    pub endpoint: String,
    pub top_k: usize,
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            server: ServerConfig {
                host: env_or("SERVER_HOST", "0.0.0.0"),
                port: env_parse("SERVER_PORT", 8080),
            },
            database: DatabaseConfig {
                url: std::env::var("DATABASE_URL").ok(),
            },
            engine: EngineConfig {
                partitions: env_parse("ENGINE_PARTITIONS", 4),
                inactivity_window_hours: env_parse("CONVERSATION_WINDOW_HOURS", 24),
                max_event_attempts: env_parse("MAX_EVENT_ATTEMPTS", 5),
                max_dispatch_attempts: env_parse("MAX_DISPATCH_ATTEMPTS", 3),
                dispatch_backoff_ms: env_parse("DISPATCH_BACKOFF_MS", 250),
                search_rate_per_second: env_parse("SEARCH_RATE_PER_SECOND", 5),
                shutdown_grace_secs: env_parse("SHUTDOWN_GRACE_SECS", 20),
            },
            smtp: SmtpConfig {
                host: env_or("SMTP_HOST", ""),
                port: env_parse("SMTP_PORT", 587),
                username: env_or("SMTP_USERNAME", ""),
                password: env_or("SMTP_PASSWORD", ""),
                from_address: env_or("SMTP_FROM", "support@localhost"),
            },
            whatsapp: WhatsAppConfig {
                phone_number_id: env_or("WHATSAPP_PHONE_NUMBER_ID", ""),
                access_token: env_or("WHATSAPP_ACCESS_TOKEN", ""),
            },
            knowledge: KnowledgeConfig {
                endpoint: env_or("KNOWLEDGE_SEARCH_URL", "http://localhost:6350/search"),
                top_k: env_parse("KNOWLEDGE_TOP_K", 5),
            },
        })
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            partitions: 4,
            inactivity_window_hours: 24,
            max_event_attempts: 5,
            max_dispatch_attempts: 3,
            dispatch_backoff_ms: 250,
            search_rate_per_second: 5,
            shutdown_grace_secs: 20,
        }
    }
}
