use tracing::{info, warn};

// ---------------------------------------------------------------------------
// Production configuration — loaded from environment variables
// ---------------------------------------------------------------------------

/// Complete gateway configuration loaded at startup.
///
/// Every field can be set via an environment variable prefixed with
/// `ROOMGATE_`. Defaults are suitable for local development against an SFU
/// on the same host.
#[derive(Debug, Clone)]
pub struct Config {
    // ── Network ─────────────────────────────────────────────────────────
    /// Address to bind the HTTP(S) listener to.
    pub bind_addr: String,

    // ── SFU control channel ─────────────────────────────────────────────
    /// WebSocket URL of the SFU's control endpoint.
    pub sfu_url: String,
    /// Upper bound on any single control request, in seconds.
    pub request_timeout_secs: u64,
    /// Interval between keepalive pings on the control session.
    pub keepalive_interval_secs: u64,
    /// Base delay for the reconnect backoff, in milliseconds.
    pub reconnect_base_delay_ms: u64,
    /// Backoff cap, in milliseconds.
    pub reconnect_max_delay_ms: u64,

    // ── TLS ─────────────────────────────────────────────────────────────
    /// Enable native TLS termination inside the binary.
    pub tls_enabled: bool,
    /// Path to PEM-encoded certificate chain.
    pub tls_cert_path: Option<String>,
    /// Path to PEM-encoded private key.
    pub tls_key_path: Option<String>,

    // ── CORS ────────────────────────────────────────────────────────────
    pub allowed_origins: String,

    // ── Logging ─────────────────────────────────────────────────────────
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Automatically loads a `.env` file if present (via `dotenvy`).
    pub fn from_env() -> Self {
        // Best-effort .env loading — ignore errors.
        let _ = dotenvy::dotenv();

        let sfu_url = env_or("ROOMGATE_SFU_URL", "ws://127.0.0.1:8188/");
        if !sfu_url.starts_with("ws://") && !sfu_url.starts_with("wss://") {
            warn!("ROOMGATE_SFU_URL does not look like a WebSocket URL: {sfu_url}");
        }

        let config = Config {
            bind_addr: env_or("ROOMGATE_BIND_ADDR", "0.0.0.0:8088"),
            sfu_url,
            request_timeout_secs: env_u64("ROOMGATE_REQUEST_TIMEOUT_SECS", 10),
            keepalive_interval_secs: env_u64("ROOMGATE_KEEPALIVE_INTERVAL_SECS", 25),
            reconnect_base_delay_ms: env_u64("ROOMGATE_RECONNECT_BASE_DELAY_MS", 1000),
            reconnect_max_delay_ms: env_u64("ROOMGATE_RECONNECT_MAX_DELAY_MS", 30_000),
            tls_enabled: env_bool("ROOMGATE_TLS_ENABLED", false),
            tls_cert_path: std::env::var("ROOMGATE_TLS_CERT_PATH").ok(),
            tls_key_path: std::env::var("ROOMGATE_TLS_KEY_PATH").ok(),
            allowed_origins: env_or("ROOMGATE_ALLOWED_ORIGINS", "*"),
            log_level: env_or("ROOMGATE_LOG_LEVEL", "info"),
        };

        config.log_summary();
        config
    }

    fn log_summary(&self) {
        info!("──── RoomGate Configuration ────");
        info!("  bind_addr          : {}", self.bind_addr);
        info!("  sfu_url            : {}", self.sfu_url);
        info!("  request_timeout    : {}s", self.request_timeout_secs);
        info!("  keepalive_interval : {}s", self.keepalive_interval_secs);
        info!(
            "  reconnect_backoff  : {}ms..{}ms",
            self.reconnect_base_delay_ms, self.reconnect_max_delay_ms
        );
        info!("  tls_enabled        : {}", self.tls_enabled);
        if self.tls_enabled {
            info!(
                "  tls_cert_path      : {}",
                self.tls_cert_path.as_deref().unwrap_or("(not set)")
            );
            info!(
                "  tls_key_path       : {}",
                self.tls_key_path.as_deref().unwrap_or("(not set)")
            );
        }
        info!(
            "  cors_origins       : {}",
            if self.allowed_origins == "*" {
                "* (permissive)"
            } else {
                &self.allowed_origins
            }
        );
        info!("  log_level          : {}", self.log_level);
        info!("────────────────────────────────");
    }
}

// ---------------------------------------------------------------------------
// Environment helpers
// ---------------------------------------------------------------------------

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(v) => matches!(v.to_lowercase().as_str(), "1" | "true" | "yes"),
        Err(_) => default,
    }
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(default)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_helpers_fall_back_to_defaults() {
        // Keys nobody sets.
        assert_eq!(env_or("ROOMGATE_TEST_UNSET_STR", "fallback"), "fallback");
        assert!(env_bool("ROOMGATE_TEST_UNSET_BOOL", true));
        assert!(!env_bool("ROOMGATE_TEST_UNSET_BOOL", false));
        assert_eq!(env_u64("ROOMGATE_TEST_UNSET_U64", 42), 42);
    }

    #[test]
    fn env_bool_accepts_common_truthy_values() {
        std::env::set_var("ROOMGATE_TEST_BOOL_YES", "YES");
        std::env::set_var("ROOMGATE_TEST_BOOL_ONE", "1");
        std::env::set_var("ROOMGATE_TEST_BOOL_OFF", "off");
        assert!(env_bool("ROOMGATE_TEST_BOOL_YES", false));
        assert!(env_bool("ROOMGATE_TEST_BOOL_ONE", false));
        assert!(!env_bool("ROOMGATE_TEST_BOOL_OFF", true));
        std::env::remove_var("ROOMGATE_TEST_BOOL_YES");
        std::env::remove_var("ROOMGATE_TEST_BOOL_ONE");
        std::env::remove_var("ROOMGATE_TEST_BOOL_OFF");
    }

    #[test]
    fn env_u64_ignores_garbage() {
        std::env::set_var("ROOMGATE_TEST_U64_BAD", "not-a-number");
        assert_eq!(env_u64("ROOMGATE_TEST_U64_BAD", 7), 7);
        std::env::remove_var("ROOMGATE_TEST_U64_BAD");
    }
}
