use clap::{Parser, ValueEnum};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

/// Where presence and broadcast state live.
#[derive(ValueEnum, Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// Shared Redis set and pub/sub channel (multi-instance)
    Redis,
    /// In-process state (single instance, no Redis)
    Memory,
}

/// Chat relay server
#[derive(Parser, Serialize, Deserialize, Clone, Debug)]
#[command(name = "chat-relay-server", version, about = "WebSocket chat relay server")]
pub struct Config {
    /// Port to listen on
    #[arg(long, env = "CHAT_PORT", default_value = "8080")]
    pub port: u16,

    /// Bind address
    #[arg(long, env = "CHAT_BIND_ADDRESS", default_value = "0.0.0.0")]
    pub bind_address: String,

    /// Path to TOML config file
    #[arg(long, default_value = "./chat-relay.toml")]
    pub config: String,

    /// Enable structured JSON logging (for Docker/production)
    #[arg(long, env = "CHAT_JSON_LOGS")]
    pub json_logs: bool,

    /// Output a commented TOML config template and exit
    #[arg(long)]
    pub generate_config: bool,

    /// Presence/broadcast backend
    #[arg(long, env = "CHAT_BACKEND", value_enum, default_value_t = Backend::Redis)]
    pub backend: Backend,

    /// Redis URL (use rediss:// for TLS)
    #[arg(long, env = "CHAT_REDIS_URL", default_value = "redis://127.0.0.1:6379")]
    pub redis_url: String,

    /// Redis password, overrides any password in the URL
    #[arg(long, env = "CHAT_REDIS_PASSWORD")]
    pub redis_password: Option<String>,

    /// Pub/sub channel shared by all instances
    #[arg(long, env = "CHAT_CHANNEL", default_value = "chat")]
    pub channel: String,

    /// Redis set holding the active usernames
    #[arg(long, env = "CHAT_USERS_KEY", default_value = "chat-users")]
    pub users_key: String,

    /// Seconds between keep-alive pings on each connection
    #[arg(long, env = "CHAT_PING_INTERVAL_SECS", default_value = "30")]
    pub ping_interval_secs: u64,

    /// Seconds a connection may take to answer a ping before it is dropped
    #[arg(long, env = "CHAT_PONG_TIMEOUT_SECS", default_value = "10")]
    pub pong_timeout_secs: u64,

    /// Seconds to wait for sessions to retire during shutdown
    #[arg(long, env = "CHAT_SHUTDOWN_TIMEOUT_SECS", default_value = "10")]
    pub shutdown_timeout_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 8080,
            bind_address: "0.0.0.0".to_string(),
            config: "./chat-relay.toml".to_string(),
            json_logs: false,
            generate_config: false,
            backend: Backend::Redis,
            redis_url: "redis://127.0.0.1:6379".to_string(),
            redis_password: None,
            channel: "chat".to_string(),
            users_key: "chat-users".to_string(),
            ping_interval_secs: 30,
            pong_timeout_secs: 10,
            shutdown_timeout_secs: 10,
        }
    }
}

impl Config {
    /// Load config with layered precedence:
    /// built-in defaults < TOML file < env vars (CHAT_*) < CLI args
    pub fn load() -> Result<Self, figment::Error> {
        let cli = Config::parse();
        Self::figment(cli).extract()
    }

    fn figment(cli: Config) -> Figment {
        let config_path = cli.config.clone();

        Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Toml::file(&config_path))
            .merge(Env::prefixed("CHAT_"))
            .merge(Serialized::defaults(cli))
    }
}

/// Generate a commented TOML config template
pub fn generate_config_template() -> String {
    r#"# Chat Relay Server Configuration
# Place this file at ./chat-relay.toml or specify with --config <path>
# All settings can be overridden via environment variables (CHAT_PORT, etc.)
# or CLI flags (--port, etc.)

# Server port (default: 8080)
# port = 8080

# Bind address (default: 0.0.0.0, all interfaces)
# bind_address = "0.0.0.0"

# Enable structured JSON logging for Docker/production
# json_logs = false

# Presence/broadcast backend: "redis" (multi-instance) or "memory" (single instance)
# backend = "redis"

# Redis connection; use rediss:// for TLS
# redis_url = "redis://127.0.0.1:6379"
# redis_password = ""

# Pub/sub channel shared by all instances
# channel = "chat"

# Redis set holding the usernames of active sessions
# users_key = "chat-users"

# Keep-alive: ping every N seconds, drop the connection if no pong arrives
# within the timeout
# ping_interval_secs = 30
# pong_timeout_secs = 10

# Seconds to wait for sessions to retire during shutdown
# shutdown_timeout_secs = 10
"#
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.port, 8080);
        assert_eq!(config.backend, Backend::Redis);
        assert_eq!(config.channel, "chat");
        assert_eq!(config.users_key, "chat-users");
        assert_eq!(config.shutdown_timeout_secs, 10);
        assert_eq!(config.ping_interval_secs, 30);
        assert_eq!(config.pong_timeout_secs, 10);
    }

    #[test]
    fn test_cli_overrides_defaults() {
        let cli = Config::parse_from([
            "chat-relay-server",
            "--config",
            "/nonexistent/chat-relay.toml",
            "--backend",
            "memory",
            "--port",
            "9000",
        ]);
        let config: Config = Config::figment(cli).extract().unwrap();
        assert_eq!(config.backend, Backend::Memory);
        assert_eq!(config.port, 9000);
    }

    #[test]
    fn test_template_is_valid_toml_comments() {
        let template = generate_config_template();
        let parsed: Config = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Toml::string(&template))
            .extract()
            .unwrap();
        assert_eq!(parsed.port, 8080);
    }
}
