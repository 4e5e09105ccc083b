use std::time::Duration;

/// Server configuration loaded from environment variables.
///
/// All fields have sensible defaults suitable for local development.
/// In production, override via environment variables.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Bind address (default: `0.0.0.0`).
    pub host: String,
    /// Bind port (default: `3000`).
    pub port: u16,
    /// Allowed CORS origins, parsed from comma-separated `CORS_ORIGINS` env var.
    pub cors_origins: Vec<String>,
    /// HTTP request timeout in seconds (default: `30`).
    pub request_timeout_secs: u64,
}

impl ServerConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var                | Default                    |
    /// |------------------------|----------------------------|
    /// | `HOST`                 | `0.0.0.0`                  |
    /// | `PORT`                 | `3000`                     |
    /// | `CORS_ORIGINS`         | `http://localhost:5173`    |
    /// | `REQUEST_TIMEOUT_SECS` | `30`                       |
    pub fn from_env() -> Self {
        let host = std::env::var("HOST").unwrap_or_else(|_| "0.0.0.0".into());

        let port: u16 = env_or("PORT", "3000")
            .parse()
            .expect("PORT must be a valid u16");

        let cors_origins = split_origins(&env_or("CORS_ORIGINS", "http://localhost:5173"));

        let request_timeout_secs: u64 = env_or("REQUEST_TIMEOUT_SECS", "30")
            .parse()
            .expect("REQUEST_TIMEOUT_SECS must be a valid u64");

        Self {
            host,
            port,
            cors_origins,
            request_timeout_secs,
        }
    }
}

/// Engine endpoints and per-session limits.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// ComfyUI HTTP base URL.
    pub comfyui_api_url: String,
    /// ComfyUI WebSocket base URL.
    pub comfyui_ws_url: String,
    /// How long a queued job may wait before the engine starts it.
    pub start_timeout: Duration,
    /// Upper bound on the whole streaming phase of one job.
    pub execution_timeout: Duration,
    /// Maximum number of job names held at once.
    pub job_name_capacity: usize,
    /// Age after which an unclaimed job name is dropped.
    pub job_name_ttl: Duration,
}

impl RelayConfig {
    /// Load relay settings from environment variables with defaults.
    ///
    /// | Env Var                           | Default                 |
    /// |-----------------------------------|-------------------------|
    /// | `COMFYUI_API_URL`                 | `http://127.0.0.1:8188` |
    /// | `COMFYUI_WS_URL`                  | `ws://127.0.0.1:8188`   |
    /// | `UPSTREAM_START_TIMEOUT_SECS`     | `120`                   |
    /// | `UPSTREAM_EXECUTION_TIMEOUT_SECS` | `1800`                  |
    /// | `JOB_NAME_CAPACITY`               | `1024`                  |
    /// | `JOB_NAME_TTL_SECS`               | `3600`                  |
    pub fn from_env() -> Self {
        let start_timeout_secs: u64 = env_or("UPSTREAM_START_TIMEOUT_SECS", "120")
            .parse()
            .expect("UPSTREAM_START_TIMEOUT_SECS must be a valid u64");

        let execution_timeout_secs: u64 = env_or("UPSTREAM_EXECUTION_TIMEOUT_SECS", "1800")
            .parse()
            .expect("UPSTREAM_EXECUTION_TIMEOUT_SECS must be a valid u64");

        let job_name_capacity: usize = env_or("JOB_NAME_CAPACITY", "1024")
            .parse()
            .expect("JOB_NAME_CAPACITY must be a valid usize");

        let job_name_ttl_secs: u64 = env_or("JOB_NAME_TTL_SECS", "3600")
            .parse()
            .expect("JOB_NAME_TTL_SECS must be a valid u64");

        Self {
            comfyui_api_url: env_or("COMFYUI_API_URL", "http://127.0.0.1:8188"),
            comfyui_ws_url: env_or("COMFYUI_WS_URL", "ws://127.0.0.1:8188"),
            start_timeout: Duration::from_secs(start_timeout_secs),
            execution_timeout: Duration::from_secs(execution_timeout_secs),
            job_name_capacity,
            job_name_ttl: Duration::from_secs(job_name_ttl_secs),
        }
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn split_origins(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}
