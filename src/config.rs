use serde::{Deserialize, Serialize};
use std::env;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub database: DatabaseConfig,
    pub server: ServerConfig,
    pub cache: CacheConfig,
    pub sync: SyncConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    pub capacity: usize,
}

/// Tunables for the replication engine. Deadlines are milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    pub chunk_size: usize,
    pub heartbeat_interval_ms: u64,
    pub node_offline_after_ms: u64,
    pub session_deadline_ms: u64,
    pub chunk_transfer_deadline_ms: u64,
    pub max_parallel_sessions_per_target: usize,
    pub max_parallel_sessions_total: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            chunk_size: 4096,
            heartbeat_interval_ms: 10_000,
            node_offline_after_ms: 30_000, // 3x heartbeat interval
            session_deadline_ms: 300_000,
            chunk_transfer_deadline_ms: 30_000,
            max_parallel_sessions_per_target: 1,
            max_parallel_sessions_total: 16,
        }
    }
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        let defaults = SyncConfig::default();
        Ok(Self {
            database: DatabaseConfig {
                url: env::var("DATABASE_URL")
                    .unwrap_or_else(|_| "sqlite::memory:".to_string()),
            },
            server: ServerConfig {
                host: env::var("SERVER_HOST")
                    .unwrap_or_else(|_| "0.0.0.0".to_string()),
                port: env::var("SERVER_PORT")
                    .unwrap_or_else(|_| "3000".to_string())
                    .parse()
                    .unwrap_or(3000),
            },
            cache: CacheConfig {
                capacity: env::var("CACHE_CAPACITY")
                    .unwrap_or_else(|_| "1000".to_string())
                    .parse()
                    .unwrap_or(1000),
            },
            sync: SyncConfig {
                chunk_size: env_usize("CHUNK_SIZE", defaults.chunk_size),
                heartbeat_interval_ms: env_u64("HEARTBEAT_INTERVAL_MS", defaults.heartbeat_interval_ms),
                node_offline_after_ms: env_u64("NODE_OFFLINE_AFTER_MS", defaults.node_offline_after_ms),
                session_deadline_ms: env_u64("SESSION_DEADLINE_MS", defaults.session_deadline_ms),
                chunk_transfer_deadline_ms: env_u64(
                    "CHUNK_TRANSFER_DEADLINE_MS",
                    defaults.chunk_transfer_deadline_ms,
                ),
                max_parallel_sessions_per_target: env_usize(
                    "MAX_PARALLEL_SESSIONS_PER_TARGET",
                    defaults.max_parallel_sessions_per_target,
                ),
                max_parallel_sessions_total: env_usize(
                    "MAX_PARALLEL_SESSIONS_TOTAL",
                    defaults.max_parallel_sessions_total,
                ),
            },
        })
    }

    pub fn server_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

fn env_u64(key: &str, default: u64) -> u64 {
    env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_usize(key: &str, default: usize) -> usize {
    env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}
