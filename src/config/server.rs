// src/config/server.rs
// Server, database, and logging configuration.

use serde::{Deserialize, Serialize};

use super::helpers::{env_or, env_usize, require_env};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub webhook_secret: String,
}

impl ServerConfig {
    pub fn from_env() -> Self {
        Self {
            host: env_or("WORKER_HOST", "0.0.0.0"),
            port: env_usize("WORKER_PORT", 8080) as u16,
            webhook_secret: require_env("WEBHOOK_SECRET"),
        }
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

impl DatabaseConfig {
    pub fn from_env() -> Self {
        Self {
            url: env_or("DATABASE_URL", "sqlite://worker.db"),
            max_connections: env_usize("SQLITE_MAX_CONNECTIONS", 5) as u32,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub trace_sql: bool,
}

impl LoggingConfig {
    pub fn from_env() -> Self {
        Self {
            level: env_or("LOG_LEVEL", "info"),
            trace_sql: env_or("TRACE_SQL", "false").eq_ignore_ascii_case("true"),
        }
    }
}
