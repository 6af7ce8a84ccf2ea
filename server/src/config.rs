//! Process configuration, read once from the environment at startup.

use anyhow::{bail, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageDriver {
    Memory,
    Postgres,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub base_url: String,
    pub port: u16,
    pub storage_driver: StorageDriver,
    pub database_url: Option<String>,
    pub redis_url: Option<String>,
    pub rate_limit_disabled: bool,
    pub jwt_public_key: Option<String>,
    pub jwt_secret: Option<String>,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let storage_driver = match std::env::var("STORAGE_DRIVER").as_deref() {
            Ok("postgres") => StorageDriver::Postgres,
            Ok("memory") | Err(_) => StorageDriver::Memory,
            Ok(other) => bail!("unknown STORAGE_DRIVER '{other}' (expected memory|postgres)"),
        };

        let database_url = std::env::var("DATABASE_URL").ok();
        if storage_driver == StorageDriver::Postgres && database_url.is_none() {
            bail!("STORAGE_DRIVER=postgres requires DATABASE_URL");
        }

        let port = std::env::var("SERVER_PORT")
            .unwrap_or_else(|_| "8080".to_string())
            .parse::<u16>()
            .unwrap_or(8080);

        Ok(Self {
            base_url: std::env::var("BASE_URL")
                .unwrap_or_else(|_| format!("http://localhost:{port}")),
            port,
            storage_driver,
            database_url,
            redis_url: std::env::var("REDIS_URL").ok(),
            rate_limit_disabled: matches!(
                std::env::var("RATE_LIMIT_DISABLED").as_deref(),
                Ok("1") | Ok("true") | Ok("TRUE") | Ok("yes")
            ),
            jwt_public_key: std::env::var("JWT_PUBLIC_KEY").ok(),
            jwt_secret: std::env::var("JWT_SECRET").ok(),
        })
    }
}
