//! Configuration module for sync-service.

use crate::models::Granularity;
use secrecy::Secret;
use service_core::config as core_config;
use service_core::error::AppError;
use std::env;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct SyncServiceConfig {
    pub common: core_config::Config,
    pub service_name: String,
    pub service_version: String,
    pub log_level: String,
    pub otlp_endpoint: Option<String>,
    pub database: DatabaseConfig,
    pub provider: ProviderConfig,
    pub sync: SyncSettings,
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
}

/// Upstream feed provider connection.
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    pub base_url: String,
    pub client_id: String,
    pub secret: Secret<String>,
    /// Records requested per page.
    pub page_size: u32,
    pub timeout: Duration,
}

/// Knobs for the fetch loop, ledger writer and aggregation.
#[derive(Debug, Clone)]
pub struct SyncSettings {
    /// Page ceiling for a single fetch loop.
    pub max_pages: u32,
    /// Restarts allowed when the feed mutates mid-pagination.
    pub max_pagination_restarts: u32,
    /// Source items synced concurrently within one principal-wide sync.
    pub item_concurrency: usize,
    pub default_granularity: Granularity,
    /// Derive a mutation id from the synced cursor ranges when the caller
    /// supplies none.
    pub derive_mutation_ids: bool,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            max_pages: 50,
            max_pagination_restarts: 2,
            item_concurrency: 1,
            default_granularity: Granularity::Monthly,
            derive_mutation_ids: true,
        }
    }
}

fn parsed_or<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

impl SyncServiceConfig {
    pub fn from_env() -> Result<Self, AppError> {
        let common = core_config::Config::load()?;
        let defaults = SyncSettings::default();

        let default_granularity = match env::var("SYNC_DEFAULT_GRANULARITY") {
            Ok(raw) => Granularity::from_str(&raw).map_err(|e| {
                AppError::ConfigError(anyhow::anyhow!("SYNC_DEFAULT_GRANULARITY: {}", e))
            })?,
            Err(_) => defaults.default_granularity,
        };

        Ok(Self {
            common,
            service_name: env::var("SERVICE_NAME").unwrap_or_else(|_| "sync-service".to_string()),
            service_version: env::var("SERVICE_VERSION")
                .unwrap_or_else(|_| env!("CARGO_PKG_VERSION").to_string()),
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            otlp_endpoint: env::var("OTLP_ENDPOINT").ok(),
            database: DatabaseConfig {
                url: env::var("DATABASE_URL").map_err(|_| {
                    AppError::ConfigError(anyhow::anyhow!("DATABASE_URL is required"))
                })?,
                max_connections: parsed_or("DATABASE_MAX_CONNECTIONS", 10),
                min_connections: parsed_or("DATABASE_MIN_CONNECTIONS", 2),
            },
            provider: ProviderConfig {
                base_url: env::var("PROVIDER_BASE_URL")
                    .unwrap_or_else(|_| "https://sandbox.plaid.com".to_string()),
                client_id: env::var("PROVIDER_CLIENT_ID").unwrap_or_default(),
                secret: Secret::new(env::var("PROVIDER_SECRET").unwrap_or_default()),
                page_size: parsed_or("PROVIDER_PAGE_SIZE", 500),
                timeout: Duration::from_secs(parsed_or("PROVIDER_TIMEOUT_SECS", 30)),
            },
            sync: SyncSettings {
                max_pages: parsed_or("SYNC_MAX_PAGES", defaults.max_pages).max(1),
                max_pagination_restarts: parsed_or(
                    "SYNC_MAX_PAGINATION_RESTARTS",
                    defaults.max_pagination_restarts,
                ),
                item_concurrency: parsed_or("SYNC_ITEM_CONCURRENCY", defaults.item_concurrency)
                    .max(1),
                default_granularity,
                derive_mutation_ids: parsed_or(
                    "SYNC_DERIVE_MUTATION_IDS",
                    defaults.derive_mutation_ids,
                ),
            },
        })
    }
}
