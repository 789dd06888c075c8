//! Configuration management for the edge gateway
//!
//! Precedence: command line > environment (`TRACTUS_*`) > config file >
//! defaults. Command-line overrides are applied by the binary.

pub mod file;

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::api::DEFAULT_MAX_BODY_BYTES;
use crate::protocol::opcua::DEFAULT_ENDPOINT;
use crate::{Error, Result};

/// Default HTTP port
pub const DEFAULT_PORT: u16 = 8000;

/// Default bound on one capability dispatch
pub const DEFAULT_DISPATCH_TIMEOUT_MS: u64 = 5000;

/// Default device connect timeout
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 2000;

/// Edge gateway configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// HTTP API port
    pub port: u16,

    /// Idempotency ledger database file
    pub db_path: PathBuf,

    /// Bearer key for `/v1/*`; unauthenticated when `None`
    pub api_key: Option<String>,

    /// Bound on one capability dispatch, including device I/O
    pub dispatch_timeout: Duration,

    /// Bound on opening a device session
    pub connect_timeout: Duration,

    /// OPC UA endpoint used when a command names none
    pub opcua_endpoint: String,

    /// Serve OPC UA from the in-memory demo address space
    pub simulate_opcua: bool,

    /// Global request rate limit; off when `None`
    pub rate_limit_per_minute: Option<u32>,

    /// Request body size limit
    pub max_body_bytes: usize,
}

impl Config {
    /// Load from the config file and process environment
    ///
    /// # Errors
    ///
    /// Returns error if an environment variable holds an unparseable value
    pub fn load() -> Result<Self> {
        Self::resolve(file::load_config_file(), |name| std::env::var(name).ok())
    }

    /// Merge a parsed config file with environment values from `env`
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for unparseable or out-of-range values
    pub fn resolve(
        fc: file::EdgeConfigFile,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self> {
        let port = parse_env(&env, "TRACTUS_PORT")?
            .or(fc.server.port)
            .unwrap_or(DEFAULT_PORT);

        let db_path = env("TRACTUS_DB_PATH")
            .map(PathBuf::from)
            .or(fc.ledger.path)
            .unwrap_or_else(default_db_path);

        let api_key = env("TRACTUS_API_KEY")
            .or(fc.server.api_key)
            .filter(|k| !k.is_empty());

        let dispatch_timeout_ms = parse_env(&env, "TRACTUS_DISPATCH_TIMEOUT_MS")?
            .or(fc.dispatch.timeout_ms)
            .unwrap_or(DEFAULT_DISPATCH_TIMEOUT_MS);
        if dispatch_timeout_ms == 0 {
            return Err(Error::Config("dispatch timeout must be positive".to_string()));
        }

        let connect_timeout_ms = parse_env(&env, "TRACTUS_CONNECT_TIMEOUT_MS")?
            .or(fc.dispatch.connect_timeout_ms)
            .unwrap_or(DEFAULT_CONNECT_TIMEOUT_MS);

        let opcua_endpoint = env("TRACTUS_OPCUA_ENDPOINT")
            .or(fc.opcua.endpoint)
            .unwrap_or_else(|| DEFAULT_ENDPOINT.to_string());

        let simulate_opcua = parse_env(&env, "TRACTUS_SIMULATE_OPCUA")?
            .or(fc.opcua.simulate)
            .unwrap_or(false);

        let rate_limit_per_minute =
            parse_env(&env, "TRACTUS_RATE_LIMIT_PER_MINUTE")?.or(fc.server.rate_limit_per_minute);

        let max_body_bytes = parse_env(&env, "TRACTUS_MAX_BODY_BYTES")?
            .or(fc.server.max_body_bytes)
            .unwrap_or(DEFAULT_MAX_BODY_BYTES);

        Ok(Self {
            port,
            db_path,
            api_key,
            dispatch_timeout: Duration::from_millis(dispatch_timeout_ms),
            connect_timeout: Duration::from_millis(connect_timeout_ms),
            opcua_endpoint,
            simulate_opcua,
            rate_limit_per_minute,
            max_body_bytes,
        })
    }
}

fn parse_env<T: FromStr>(env: &impl Fn(&str) -> Option<String>, name: &str) -> Result<Option<T>>
where
    T::Err: std::fmt::Display,
{
    env(name)
        .map(|raw| {
            raw.trim()
                .parse()
                .map_err(|e| Error::Config(format!("{name}={raw:?}: {e}")))
        })
        .transpose()
}

/// Default ledger path (`~/.local/share/tractus/edge/idempotency.db` on Linux)
#[must_use]
pub fn default_db_path() -> PathBuf {
    directories::BaseDirs::new().map_or_else(
        || PathBuf::from("idempotency.db"),
        |d| d.data_dir().join("tractus").join("edge").join("idempotency.db"),
    )
}
