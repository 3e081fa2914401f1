use std::env;

/// Application configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Server host address.
    pub host: String,
    /// Server port.
    pub port: u16,
    /// Path to the SQLite database file.
    pub db_path: String,
    /// Hex-encoded 32-byte ed25519 seed for the block signer.
    /// A random key is generated when unset (dev mode).
    pub signer_seed: Option<String>,
    /// Reject clients speaking sync protocol < 2.
    pub sync_v2_enforce: bool,
    /// Default pull page size.
    pub sync_pull_page_default: i64,
    /// Maximum pull page size.
    pub sync_pull_page_max: i64,
    /// Interval the client runner uses between auto sync cycles (ms).
    pub sync_interval_ms: u64,
    /// Interval clients poll /client/settings (ms).
    pub settings_poll_interval_ms: u64,
    /// Count of drift diffs treated as the base unit in signal thresholds.
    pub drift_threshold: u32,
    /// Autoheal controller knobs.
    pub autoheal: AutohealConfig,
}

/// Autoheal thresholds, cooldowns and budgets.
#[derive(Debug, Clone)]
pub struct AutohealConfig {
    pub enabled: bool,
    /// Minimum gap between any two autoheal actions for a client (ms).
    pub cooldown_ms: i64,
    /// Suppression window for repeat actions on an identical symptom fingerprint (ms).
    pub same_fingerprint_cooldown_ms: i64,
    pub max_actions_per_24h: u32,
    pub max_deep_repair_per_24h: u32,
    pub observe_ratio: f64,
    pub degraded_ratio: f64,
    pub critical_ratio: f64,
    /// Consecutive degraded-or-worse signals before reset_sync_state_and_pull.
    pub reset_consecutive: u32,
    /// Consecutive critical signals before deep_repair.
    pub critical_consecutive: u32,
    /// Consecutive observe-or-worse signals before force_full_pull_v2.
    pub force_pull_consecutive: u32,
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_flag(key: &str, default: bool) -> bool {
    match env::var(key) {
        Ok(v) => v == "1" || v.eq_ignore_ascii_case("true"),
        Err(_) => default,
    }
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Self {
        Self {
            host: env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: env_parse("PORT", 3002),
            db_path: env::var("DB_PATH").unwrap_or_else(|_| "tally.db".to_string()),
            signer_seed: env::var("SIGNER_SEED").ok(),
            sync_v2_enforce: env_flag("SYNC_V2_ENFORCE", false),
            sync_pull_page_default: env_parse("SYNC_PULL_PAGE_DEFAULT", 5000),
            sync_pull_page_max: env_parse("SYNC_PULL_PAGE_MAX", 20000),
            sync_interval_ms: env_parse("SYNC_INTERVAL_MS", 300_000),
            settings_poll_interval_ms: env_parse("SETTINGS_POLL_INTERVAL_MS", 60_000),
            drift_threshold: env_parse("DRIFT_THRESHOLD", 2),
            autoheal: AutohealConfig {
                enabled: env_flag("AUTOHEAL_ENABLED", true),
                cooldown_ms: env_parse("AUTOHEAL_COOLDOWN_MS", 15 * 60 * 1000),
                same_fingerprint_cooldown_ms: env_parse(
                    "AUTOHEAL_SAME_FINGERPRINT_COOLDOWN_MS",
                    6 * 60 * 60 * 1000,
                ),
                max_actions_per_24h: env_parse("AUTOHEAL_MAX_ACTIONS_PER_24H", 3),
                max_deep_repair_per_24h: env_parse("AUTOHEAL_MAX_DEEP_REPAIR_PER_24H", 1),
                observe_ratio: env_parse("AUTOHEAL_OBSERVE_RATIO", 0.08),
                degraded_ratio: env_parse("AUTOHEAL_DEGRADED_RATIO", 0.15),
                critical_ratio: env_parse("AUTOHEAL_CRITICAL_RATIO", 0.35),
                reset_consecutive: env_parse("AUTOHEAL_RESET_CONSECUTIVE", 4),
                critical_consecutive: env_parse("AUTOHEAL_CRITICAL_CONSECUTIVE", 2),
                force_pull_consecutive: env_parse("AUTOHEAL_FORCE_PULL_CONSECUTIVE", 8),
            },
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::from_env()
    }
}
