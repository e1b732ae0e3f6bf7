//! Process configuration read from the environment.
//!
//! `.env` files in the working directory and its parents are layered in first,
//! then every setting is parsed into a typed field. Required secrets have no
//! default; everything else does.

use std::collections::HashMap;
use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use thiserror::Error;

use crate::bus::RetryConfig;

/// Errors raised while reading configuration.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("missing required env var: {0}")]
    Missing(&'static str),

    #[error("invalid {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Settings shared by every worker group.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerSettings {
    /// Retry budget of new jobs.
    pub max_attempts: u32,
    /// How long a claimed job stays leased before it can be reclaimed.
    pub lease: Duration,
    /// Sleep between polls when the queue is empty.
    pub poll_interval: Duration,
    /// Workers per job kind.
    pub concurrency: usize,
    /// Backoff applied to retried jobs.
    pub retry: RetryConfig,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        WorkerSettings {
            max_attempts: crate::store::DEFAULT_MAX_ATTEMPTS,
            lease: Duration::from_secs(60),
            poll_interval: Duration::from_millis(500),
            concurrency: 2,
            retry: RetryConfig::DEFAULT,
        }
    }
}

/// Payout confirmation settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConfirmSettings {
    /// Delay between `confirm` polls of a submitted transaction.
    pub poll_interval: Duration,
    /// How long a transaction may stay unconfirmed before it is treated as expired.
    pub timeout: Duration,
}

impl Default for ConfirmSettings {
    fn default() -> Self {
        ConfirmSettings {
            poll_interval: Duration::from_secs(5),
            timeout: Duration::from_secs(600),
        }
    }
}

/// Sync worker settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncSettings {
    /// Period of the scheduled sync of every project; `None` disables it.
    pub interval: Option<Duration>,
    /// Upper bound on pages fetched per sync job.
    pub max_pages: u32,
}

impl Default for SyncSettings {
    fn default() -> Self {
        SyncSettings {
            interval: None,
            max_pages: 50,
        }
    }
}

/// Full process configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: SocketAddr,
    pub database_path: PathBuf,
    pub artifact_dir: PathBuf,
    /// Shared webhook secret per event source.
    pub webhook_secrets: HashMap<String, Vec<u8>>,
    /// AES-256 key for delegated credentials at rest.
    pub token_key: [u8; 32],
    /// HMAC key for proof signatures.
    pub proof_signing_key: Vec<u8>,
    pub workers: WorkerSettings,
    pub confirm: ConfirmSettings,
    pub sync: SyncSettings,
    /// Relayer base URL per chain name.
    pub chain_relayers: HashMap<String, String>,
    /// Override of the GitHub REST API base URL (GitHub Enterprise, tests).
    pub github_api_base: Option<String>,
}

impl Config {
    /// Reads configuration from the process environment, after layering any
    /// `.env` files found in the working directory and up to two parents.
    pub fn from_env() -> Result<Self> {
        load_dotenv_layers();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds a configuration from an arbitrary key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let vars = Vars(&lookup);

        let mut webhook_secrets = vars.map("WEBHOOK_SECRETS")?;
        if let Some(secret) = vars.optional("GITHUB_WEBHOOK_SECRET") {
            webhook_secrets.insert("github".to_string(), secret);
        }
        let webhook_secrets: HashMap<String, Vec<u8>> = webhook_secrets
            .into_iter()
            .map(|(source, secret)| (source, secret.into_bytes()))
            .collect();
        if webhook_secrets.is_empty() {
            return Err(ConfigError::Missing("GITHUB_WEBHOOK_SECRET"));
        }

        let token_key = decode_key(&vars.required("TOKEN_ENC_KEY_B64")?)?;
        let proof_signing_key = vars.required("PROOF_SIGNING_KEY")?.into_bytes();

        let defaults = WorkerSettings::default();
        let retry = RetryConfig::new(
            Duration::from_secs(vars.parse("RETRY_INITIAL_SECS", 2u64)?),
            Duration::from_secs(vars.parse("RETRY_MAX_SECS", 300u64)?),
            defaults.retry.backoff_multiplier,
        );
        let workers = WorkerSettings {
            max_attempts: vars.parse("JOB_MAX_ATTEMPTS", defaults.max_attempts)?,
            lease: Duration::from_secs(vars.parse("JOB_LEASE_SECS", defaults.lease.as_secs())?),
            poll_interval: Duration::from_millis(vars.parse("WORKER_POLL_MS", 500u64)?),
            concurrency: vars.parse("WORKER_CONCURRENCY", defaults.concurrency)?,
            retry,
        };
        if workers.max_attempts == 0 {
            return Err(ConfigError::Invalid {
                key: "JOB_MAX_ATTEMPTS",
                reason: "must be at least 1".to_string(),
            });
        }

        let confirm = ConfirmSettings {
            poll_interval: Duration::from_secs(vars.parse("CONFIRM_POLL_SECS", 5u64)?),
            timeout: Duration::from_secs(vars.parse("CONFIRM_TIMEOUT_SECS", 600u64)?),
        };

        let sync = SyncSettings {
            interval: vars
                .optional_parse::<u64>("SYNC_INTERVAL_MINS")?
                .filter(|mins| *mins > 0)
                .map(|mins| Duration::from_secs(mins * 60)),
            max_pages: vars.parse("SYNC_MAX_PAGES", SyncSettings::default().max_pages)?,
        };

        Ok(Config {
            bind_addr: vars.parse("BIND_ADDR", SocketAddr::from(([0, 0, 0, 0], 3000)))?,
            database_path: vars
                .optional("DATABASE_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("bounty-relay.db")),
            artifact_dir: vars
                .optional("ARTIFACT_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("artifacts")),
            webhook_secrets,
            token_key,
            proof_signing_key,
            workers,
            confirm,
            sync,
            chain_relayers: vars.map("CHAIN_RELAYERS")?,
            github_api_base: vars.optional("GITHUB_API_BASE"),
        })
    }
}

struct Vars<'a, F>(&'a F);

impl<F: Fn(&str) -> Option<String>> Vars<'_, F> {
    fn optional(&self, key: &str) -> Option<String> {
        (self.0)(key).filter(|v| !v.trim().is_empty())
    }

    fn required(&self, key: &'static str) -> Result<String> {
        self.optional(key).ok_or(ConfigError::Missing(key))
    }

    fn optional_parse<T>(&self, key: &'static str) -> Result<Option<T>>
    where
        T: std::str::FromStr,
        T::Err: std::fmt::Display,
    {
        self.optional(key)
            .map(|raw| {
                raw.trim().parse::<T>().map_err(|e| ConfigError::Invalid {
                    key,
                    reason: e.to_string(),
                })
            })
            .transpose()
    }

    fn parse<T>(&self, key: &'static str, default: T) -> Result<T>
    where
        T: std::str::FromStr,
        T::Err: std::fmt::Display,
    {
        Ok(self.optional_parse(key)?.unwrap_or(default))
    }

    /// Parses `name=value,name=value`.
    fn map(&self, key: &'static str) -> Result<HashMap<String, String>> {
        let Some(raw) = self.optional(key) else {
            return Ok(HashMap::new());
        };
        raw.split(',')
            .map(str::trim)
            .filter(|pair| !pair.is_empty())
            .map(|pair| {
                let (name, value) = pair.split_once('=').ok_or_else(|| ConfigError::Invalid {
                    key,
                    reason: format!("expected name=value, got {pair:?}"),
                })?;
                Ok((name.trim().to_string(), value.trim().to_string()))
            })
            .collect()
    }
}

fn decode_key(raw: &str) -> Result<[u8; 32]> {
    let bytes = STANDARD
        .decode(raw.trim())
        .map_err(|e| ConfigError::Invalid {
            key: "TOKEN_ENC_KEY_B64",
            reason: e.to_string(),
        })?;
    bytes
        .as_slice()
        .try_into()
        .map_err(|_| ConfigError::Invalid {
            key: "TOKEN_ENC_KEY_B64",
            reason: format!("must decode to 32 bytes, got {}", bytes.len()),
        })
}

fn load_dotenv_layers() {
    for path in ["../../.env", "../.env", ".env"] {
        let _ = dotenvy::from_path(path);
    }
}
