use dotenvy::dotenv;
use std::env;
use std::time::Duration;

/// Client reconnection defaults, handed to clients so server and client agree
/// on backoff behavior without a second source of truth.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    pub base: Duration,
    pub factor: f64,
    pub cap: Duration,
    pub max_attempts: u32,
    /// A connection held at least this long resets the backoff to base.
    pub stable_after: Duration,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(1000),
            factor: 2.0,
            cap: Duration::from_millis(30_000),
            max_attempts: 10,
            stable_after: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    /// Unset means single-instance mode: no cross-instance fanout.
    pub redis_url: Option<String>,
    pub port: u16,
    pub jwt_public_key_pem: String,
    pub typing_ttl: Duration,
    pub presence_grace: Duration,
    pub presence_idle: Duration,
    pub ws_send_queue_capacity: usize,
    pub ws_auth_timeout: Duration,
    pub reconnect: ReconnectConfig,
}

fn env_u64(name: &str, default: u64) -> u64 {
    env::var(name)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

impl Config {
    pub fn from_env() -> Result<Self, crate::error::AppError> {
        dotenv().ok();
        let database_url = env::var("DATABASE_URL")
            .map_err(|_| crate::error::AppError::Config("DATABASE_URL missing".into()))?;
        let redis_url = env::var("REDIS_URL").ok().filter(|s| !s.trim().is_empty());
        let port = env::var("PORT")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(8086);

        let jwt_public_key_pem = match env::var("JWT_PUBLIC_KEY_PEM") {
            Ok(pem) => pem,
            Err(_) => {
                let path = env::var("JWT_PUBLIC_KEY_FILE").map_err(|_| {
                    crate::error::AppError::Config(
                        "JWT_PUBLIC_KEY_PEM or JWT_PUBLIC_KEY_FILE missing".into(),
                    )
                })?;
                std::fs::read_to_string(&path).map_err(|e| {
                    crate::error::AppError::Config(format!("read jwt pubkey file {path}: {e}"))
                })?
            }
        };

        let reconnect = ReconnectConfig {
            base: Duration::from_millis(env_u64("RECONNECT_BASE_MS", 1000)),
            factor: env::var("RECONNECT_FACTOR")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(2.0),
            cap: Duration::from_millis(env_u64("RECONNECT_CAP_MS", 30_000)),
            max_attempts: env_u64("RECONNECT_MAX_ATTEMPTS", 10) as u32,
            stable_after: Duration::from_secs(env_u64("RECONNECT_STABLE_AFTER_SECONDS", 30)),
        };

        Ok(Self {
            database_url,
            redis_url,
            port,
            jwt_public_key_pem,
            typing_ttl: Duration::from_secs(env_u64("TYPING_TTL_SECONDS", 5)),
            presence_grace: Duration::from_secs(env_u64("PRESENCE_GRACE_SECONDS", 30)),
            presence_idle: Duration::from_secs(env_u64("PRESENCE_IDLE_SECONDS", 300)),
            ws_send_queue_capacity: env_u64("WS_SEND_QUEUE_CAPACITY", 256) as usize,
            ws_auth_timeout: Duration::from_secs(env_u64("WS_AUTH_TIMEOUT_SECONDS", 10)),
            reconnect,
        })
    }

    /// Defaults for tests and local experiments; no database is implied.
    pub fn test_defaults() -> Self {
        Self {
            database_url: "postgres://localhost/orbit_messaging_test".into(),
            redis_url: None,
            port: 0,
            jwt_public_key_pem: String::new(),
            typing_ttl: Duration::from_millis(200),
            presence_grace: Duration::from_millis(200),
            presence_idle: Duration::from_secs(300),
            ws_send_queue_capacity: 64,
            ws_auth_timeout: Duration::from_secs(2),
            reconnect: ReconnectConfig::default(),
        }
    }
}
