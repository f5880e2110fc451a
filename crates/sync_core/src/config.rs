use std::time::Duration;

/// Every tunable of the engine in one place. Nothing in the state machine,
/// reconciler or outbox reads a literal; tests shrink these to milliseconds
/// and deployments override them through the environment.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub server_url: String,
    pub connect_timeout: Duration,
    pub auth_timeout: Duration,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
    /// Reconnect attempts after a drop before the engine gives up and parks
    /// in `disconnected` until the caller reconnects explicitly.
    pub max_reconnect_attempts: u32,
    pub join_timeout: Duration,
    /// Gap between consecutive join requests within one reconciliation pass.
    pub join_gap: Duration,
    pub reconcile_attempts: u32,
    pub reconcile_retry_delay: Duration,
    pub outbox_ttl: Duration,
    pub outbox_cap: usize,
    pub processed_cap: usize,
    pub event_buffer: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            server_url: "ws://127.0.0.1:8443".into(),
            connect_timeout: Duration::from_secs(8),
            auth_timeout: Duration::from_secs(5),
            backoff_base: Duration::from_millis(1000),
            backoff_cap: Duration::from_secs(12),
            max_reconnect_attempts: 4,
            join_timeout: Duration::from_secs(5),
            join_gap: Duration::from_millis(250),
            reconcile_attempts: 3,
            reconcile_retry_delay: Duration::from_secs(2),
            outbox_ttl: Duration::from_secs(300),
            outbox_cap: 256,
            processed_cap: 800,
            event_buffer: 1024,
        }
    }
}

/// Defaults overlaid with `SYNC_*` environment variables.
pub fn load_config() -> SyncConfig {
    let mut config = SyncConfig::default();

    if let Ok(v) = std::env::var("SYNC_SERVER_URL") {
        config.server_url = v;
    }

    override_ms(&mut config.connect_timeout, "SYNC_CONNECT_TIMEOUT_MS");
    override_ms(&mut config.auth_timeout, "SYNC_AUTH_TIMEOUT_MS");
    override_ms(&mut config.backoff_base, "SYNC_BACKOFF_BASE_MS");
    override_ms(&mut config.backoff_cap, "SYNC_BACKOFF_CAP_MS");
    override_ms(&mut config.join_timeout, "SYNC_JOIN_TIMEOUT_MS");
    override_ms(&mut config.join_gap, "SYNC_JOIN_GAP_MS");
    override_ms(&mut config.reconcile_retry_delay, "SYNC_RECONCILE_RETRY_DELAY_MS");
    override_ms(&mut config.outbox_ttl, "SYNC_OUTBOX_TTL_MS");

    override_parse(&mut config.max_reconnect_attempts, "SYNC_MAX_RECONNECT_ATTEMPTS");
    override_parse(&mut config.reconcile_attempts, "SYNC_RECONCILE_ATTEMPTS");
    override_parse(&mut config.outbox_cap, "SYNC_OUTBOX_CAP");
    override_parse(&mut config.processed_cap, "SYNC_PROCESSED_CAP");

    config
}

fn override_ms(slot: &mut Duration, var: &str) {
    if let Ok(raw) = std::env::var(var) {
        if let Ok(ms) = raw.parse::<u64>() {
            *slot = Duration::from_millis(ms);
        }
    }
}

fn override_parse<T: std::str::FromStr>(slot: &mut T, var: &str) {
    if let Ok(raw) = std::env::var(var) {
        if let Ok(parsed) = raw.parse::<T>() {
            *slot = parsed;
        }
    }
}
