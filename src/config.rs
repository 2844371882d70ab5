use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

use ipnet::IpNet;

#[derive(Debug, Clone)]
pub struct Config {
    /// Postgres URL. Without one the in-memory store is used.
    pub database_url: Option<String>,
    pub jwt_secret: String,
    pub host: IpAddr,
    pub port: u16,
    pub max_body_size: usize,
    pub trusted_proxies: Vec<IpNet>,
    pub log_level: String,
    pub sandbox: SandboxConfig,
    pub public_rate_limit: u32,
    pub public_rate_window_secs: u64,
}

#[derive(Debug, Clone)]
pub struct SandboxConfig {
    pub exec_timeout: Duration,
    pub settle_window: Duration,
    pub max_heap_mb: usize,
    pub fs_root: PathBuf,
    /// Comma list of origins the `fetch` module may reach; `*` for any.
    pub fetch_origins: String,
}

impl Config {
    pub fn from_env() -> Result<Self, String> {
        let database_url = std::env::var("DATABASE_URL")
            .ok()
            .filter(|url| !url.trim().is_empty());
        let jwt_secret = env_required("JWT_SECRET")?;

        let host: IpAddr = env_or("SCRIPTGATE_HOST", "0.0.0.0")
            .parse()
            .map_err(|e| format!("Invalid SCRIPTGATE_HOST: {e}"))?;

        let port: u16 = env_or("SCRIPTGATE_PORT", "3000")
            .parse()
            .map_err(|e| format!("Invalid SCRIPTGATE_PORT: {e}"))?;

        let max_body_size: usize = env_or("SCRIPTGATE_MAX_BODY_SIZE", "1048576")
            .parse()
            .map_err(|e| format!("Invalid SCRIPTGATE_MAX_BODY_SIZE: {e}"))?;

        let trusted_proxies: Vec<IpNet> = env_or("SCRIPTGATE_TRUSTED_PROXIES", "")
            .split(',')
            .filter(|s| !s.trim().is_empty())
            .map(|s| {
                s.trim()
                    .parse()
                    .map_err(|e| format!("Invalid SCRIPTGATE_TRUSTED_PROXIES entry '{s}': {e}"))
            })
            .collect::<Result<Vec<_>, _>>()?;

        let log_level = env_or("SCRIPTGATE_LOG_LEVEL", "info");

        let exec_timeout_ms: u64 = env_or("SCRIPTGATE_EXEC_TIMEOUT_MS", "5000")
            .parse()
            .map_err(|e| format!("Invalid SCRIPTGATE_EXEC_TIMEOUT_MS: {e}"))?;

        let settle_ms: u64 = env_or("SCRIPTGATE_SETTLE_MS", "2000")
            .parse()
            .map_err(|e| format!("Invalid SCRIPTGATE_SETTLE_MS: {e}"))?;

        let max_heap_mb: usize = env_or("SCRIPTGATE_MAX_HEAP_MB", "64")
            .parse()
            .map_err(|e| format!("Invalid SCRIPTGATE_MAX_HEAP_MB: {e}"))?;

        let public_rate_limit: u32 = env_or("SCRIPTGATE_PUBLIC_RATE_LIMIT", "30")
            .parse()
            .map_err(|e| format!("Invalid SCRIPTGATE_PUBLIC_RATE_LIMIT: {e}"))?;

        Ok(Config {
            database_url,
            jwt_secret,
            host,
            port,
            max_body_size,
            trusted_proxies,
            log_level,
            sandbox: SandboxConfig {
                exec_timeout: Duration::from_millis(exec_timeout_ms),
                settle_window: Duration::from_millis(settle_ms),
                max_heap_mb,
                fs_root: PathBuf::from(env_or("SCRIPTGATE_FS_ROOT", "./sandbox-data")),
                fetch_origins: env_or("SCRIPTGATE_FETCH_ORIGINS", "*"),
            },
            public_rate_limit,
            public_rate_window_secs: 60,
        })
    }
}

fn env_required(key: &str) -> Result<String, String> {
    std::env::var(key).map_err(|_| format!("Missing required environment variable: {key}"))
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}
