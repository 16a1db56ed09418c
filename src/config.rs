//! Configuration management for Stitch Server

use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{AppError, Result};
use crate::upload::{
    ChunkPolicy, RetentionPolicy, UploadSettings, DEFAULT_MAX_CHUNK_SIZE,
    DEFAULT_MAX_TOTAL_CHUNKS, DEFAULT_SESSION_TTL_SECS, DEFAULT_SWEEP_INTERVAL_SECS,
    MAX_SESSION_TTL_SECS,
};

#[derive(Debug, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub registry: RegistryConfig,
    pub upload: UploadConfig,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Root directory of the local blob store
    pub root: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistryBackend {
    Memory,
    Sqlite,
}

impl FromStr for RegistryBackend {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "memory" => Ok(Self::Memory),
            "sqlite" => Ok(Self::Sqlite),
            other => Err(format!("unknown registry backend: {}", other)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RegistryConfig {
    pub backend: RegistryBackend,
    pub database_url: String,
}

#[derive(Debug, Clone)]
pub struct UploadConfig {
    pub session_ttl_secs: u64,
    pub sweep_interval_secs: u64,
    pub retention: RetentionPolicy,
    pub allow_chunk_overwrite: bool,
    pub max_chunk_size: usize,
    pub max_total_chunks: u32,
}

impl UploadConfig {
    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.session_ttl_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn settings(&self) -> UploadSettings {
        UploadSettings {
            chunk_policy: ChunkPolicy {
                overwrite_on_mismatch: self.allow_chunk_overwrite,
            },
            max_chunk_size: self.max_chunk_size,
            max_total_chunks: self.max_total_chunks,
            retention: self.retention,
            session_ttl: self.session_ttl(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            server: ServerConfig {
                host: "0.0.0.0".to_string(),
                port: 5000,
            },
            storage: StorageConfig {
                root: "./uploads".to_string(),
            },
            registry: RegistryConfig {
                backend: RegistryBackend::Sqlite,
                database_url: "sqlite:./stitch.db".to_string(),
            },
            upload: UploadConfig {
                session_ttl_secs: DEFAULT_SESSION_TTL_SECS,
                sweep_interval_secs: DEFAULT_SWEEP_INTERVAL_SECS,
                retention: RetentionPolicy::MarkExpired,
                allow_chunk_overwrite: false,
                max_chunk_size: DEFAULT_MAX_CHUNK_SIZE,
                max_total_chunks: DEFAULT_MAX_TOTAL_CHUNKS,
            },
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_vars(|key| env::var(key).ok())
    }

    /// Build a config from `lookup`, falling back to defaults for unset keys
    pub fn from_vars<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Config::default();

        let config = Config {
            server: ServerConfig {
                host: lookup("SERVER_HOST").unwrap_or(defaults.server.host),
                port: parse_var(&lookup, "SERVER_PORT", defaults.server.port)?,
            },
            storage: StorageConfig {
                root: lookup("STORAGE_ROOT").unwrap_or(defaults.storage.root),
            },
            registry: RegistryConfig {
                backend: parse_var(&lookup, "REGISTRY_BACKEND", defaults.registry.backend)?,
                database_url: lookup("DATABASE_URL").unwrap_or(defaults.registry.database_url),
            },
            upload: UploadConfig {
                session_ttl_secs: parse_var(&lookup, "SESSION_TTL_SECS", defaults.upload.session_ttl_secs)?,
                sweep_interval_secs: parse_var(
                    &lookup,
                    "SWEEP_INTERVAL_SECS",
                    defaults.upload.sweep_interval_secs,
                )?,
                retention: parse_var(&lookup, "SESSION_RETENTION", defaults.upload.retention)?,
                allow_chunk_overwrite: parse_var(
                    &lookup,
                    "ALLOW_CHUNK_OVERWRITE",
                    defaults.upload.allow_chunk_overwrite,
                )?,
                max_chunk_size: parse_var(&lookup, "MAX_CHUNK_SIZE", defaults.upload.max_chunk_size)?,
                max_total_chunks: parse_var(&lookup, "MAX_TOTAL_CHUNKS", defaults.upload.max_total_chunks)?,
            },
        };

        if config.upload.session_ttl_secs > MAX_SESSION_TTL_SECS {
            return Err(AppError::Config(format!(
                "SESSION_TTL_SECS must not exceed {}",
                MAX_SESSION_TTL_SECS
            )));
        }
        if config.upload.sweep_interval_secs == 0 {
            return Err(AppError::Config("SWEEP_INTERVAL_SECS must be positive".to_string()));
        }
        if config.upload.max_chunk_size == 0 || config.upload.max_total_chunks == 0 {
            return Err(AppError::Config(
                "MAX_CHUNK_SIZE and MAX_TOTAL_CHUNKS must be positive".to_string(),
            ));
        }

        Ok(config)
    }
}

fn parse_var<F, T>(lookup: &F, key: &str, default: T) -> Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        Some(value) if !value.trim().is_empty() => value
            .trim()
            .parse()
            .map_err(|e| AppError::Config(format!("{}={:?}: {}", key, value, e))),
        _ => Ok(default),
    }
}
