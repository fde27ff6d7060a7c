use std::env;
use std::str::FromStr;

/// Server settings, loaded from the environment. Every policy knob the race
/// rules leave open lives here rather than in a hard constant.
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub data_dir: String,
    pub log_level: String,
    /// Outbound messages buffered per connection before it is dropped.
    pub send_queue_capacity: usize,
    /// How long finished or abandoned lobbies linger before the sweeper
    /// removes them.
    pub lobby_linger_secs: u64,
    pub race: RaceConfig,
}

#[derive(Debug, Clone)]
pub struct RaceConfig {
    pub countdown_ticks: u32,
    pub finish_timeout_secs: u64,
    /// Finishes implying a faster pace than this are rejected.
    pub wpm_ceiling: u32,
    pub default_max_players: usize,
    pub max_lobby_size: usize,
    /// Minimum gap between progress broadcasts per racer.
    pub progress_interval_ms: u64,
}

fn var_or<T: FromStr>(key: &str, default: T) -> T {
    env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

impl Config {
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();

        Self {
            host: env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: var_or("PORT", 9001),
            data_dir: env::var("DATA_DIR").unwrap_or_else(|_| "./race_data".to_string()),
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            send_queue_capacity: var_or("SEND_QUEUE_CAPACITY", 64),
            lobby_linger_secs: var_or("LOBBY_LINGER_SECS", 300),
            race: RaceConfig::from_env(),
        }
    }
}

impl RaceConfig {
    fn from_env() -> Self {
        Self {
            countdown_ticks: var_or("COUNTDOWN_TICKS", 3),
            finish_timeout_secs: var_or("FINISH_TIMEOUT_SECS", 120),
            wpm_ceiling: var_or("WPM_CEILING", 250),
            default_max_players: var_or("DEFAULT_MAX_PLAYERS", 4),
            max_lobby_size: var_or("MAX_LOBBY_SIZE", 10),
            progress_interval_ms: var_or("PROGRESS_INTERVAL_MS", 500),
        }
    }
}

impl Default for RaceConfig {
    fn default() -> Self {
        Self {
            countdown_ticks: 3,
            finish_timeout_secs: 120,
            wpm_ceiling: 250,
            default_max_players: 4,
            max_lobby_size: 10,
            progress_interval_ms: 500,
        }
    }
}
