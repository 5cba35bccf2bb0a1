//! Shared Redis connection setup for the presence store and the broadcast
//! transport.

use redis::aio::ConnectionManager;
use redis::{Client, IntoConnectionInfo};

use crate::config::Config;

/// Build a Redis client from the configured URL, applying the password
/// override when one is set. `rediss://` URLs connect over TLS.
pub fn open_client(config: &Config) -> redis::RedisResult<Client> {
    let mut info = config.redis_url.as_str().into_connection_info()?;
    if let Some(password) = config.redis_password.as_ref().filter(|p| !p.is_empty()) {
        info.redis.password = Some(password.clone());
    }
    Client::open(info)
}

/// Open a managed (auto-reconnecting) connection and verify it with PING.
pub async fn connect_manager(client: &Client) -> redis::RedisResult<ConnectionManager> {
    let mut conn = client.get_connection_manager().await?;
    let _: String = redis::cmd("PING").query_async(&mut conn).await?;
    Ok(conn)
}
