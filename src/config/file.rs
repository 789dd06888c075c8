//! TOML configuration file loading
//!
//! Supports `~/.config/tractus/edge/config.toml` as a persistent config
//! source. All fields are optional; the file is a partial overlay on top of
//! defaults.
//!
//! ```toml
//! [server]
//! port = 8000
//! api_key = "..."
//! rate_limit_per_minute = 600
//!
//! [ledger]
//! path = "/var/lib/tractus/idempotency.db"
//!
//! [dispatch]
//! timeout_ms = 5000
//! connect_timeout_ms = 2000
//!
//! [opcua]
//! endpoint = "opc.tcp://plc-7:4840/"
//! simulate = false
//! ```

use std::path::{Path, PathBuf};

use serde::Deserialize;

/// Top-level TOML configuration file schema
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EdgeConfigFile {
    #[serde(default)]
    pub server: ServerFileConfig,

    #[serde(default)]
    pub ledger: LedgerFileConfig,

    #[serde(default)]
    pub dispatch: DispatchFileConfig,

    #[serde(default)]
    pub opcua: OpcUaFileConfig,
}

/// HTTP server settings
#[derive(Debug, Default, Deserialize)]
pub struct ServerFileConfig {
    pub port: Option<u16>,
    /// Bearer key required on `/v1/*`
    pub api_key: Option<String>,
    pub rate_limit_per_minute: Option<u32>,
    pub max_body_bytes: Option<usize>,
}

/// Idempotency ledger settings
#[derive(Debug, Default, Deserialize)]
pub struct LedgerFileConfig {
    /// `SQLite` database file
    pub path: Option<PathBuf>,
}

/// Device dispatch settings
#[derive(Debug, Default, Deserialize)]
pub struct DispatchFileConfig {
    pub timeout_ms: Option<u64>,
    pub connect_timeout_ms: Option<u64>,
}

/// OPC UA settings
#[derive(Debug, Default, Deserialize)]
pub struct OpcUaFileConfig {
    /// Endpoint used when a command does not name one
    pub endpoint: Option<String>,
    /// Answer from the in-memory demo address space
    pub simulate: Option<bool>,
}

/// Load the TOML config file from the standard path
///
/// Returns `EdgeConfigFile::default()` if the file doesn't exist or can't be parsed.
#[must_use]
pub fn load_config_file() -> EdgeConfigFile {
    let Some(path) = config_file_path() else {
        return EdgeConfigFile::default();
    };

    if !path.exists() {
        return EdgeConfigFile::default();
    }

    match read_config_file(&path) {
        Ok(config) => {
            tracing::info!(path = %path.display(), "loaded config file");
            config
        }
        Err(e) => {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "failed to load config file, using defaults"
            );
            EdgeConfigFile::default()
        }
    }
}

/// Read and parse a config file
///
/// # Errors
///
/// Returns error if the file cannot be read or is not valid config TOML
pub fn read_config_file(path: &Path) -> crate::Result<EdgeConfigFile> {
    let content = std::fs::read_to_string(path)?;
    Ok(toml::from_str(&content)?)
}

/// Return the config file path: `~/.config/tractus/edge/config.toml`
#[must_use]
pub fn config_file_path() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|d| {
        d.config_dir()
            .join("tractus")
            .join("edge")
            .join("config.toml")
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_is_default() {
        let fc: EdgeConfigFile = toml::from_str("").unwrap();
        assert!(fc.server.port.is_none());
        assert!(fc.ledger.path.is_none());
    }

    #[test]
    fn parses_sections() {
        let fc: EdgeConfigFile = toml::from_str(
            r#"
            [server]
            port = 9000
            api_key = "k"

            [ledger]
            path = "/tmp/ledger.db"

            [dispatch]
            timeout_ms = 750
            "#,
        )
        .unwrap();

        assert_eq!(fc.server.port, Some(9000));
        assert_eq!(fc.server.api_key.as_deref(), Some("k"));
        assert_eq!(fc.ledger.path, Some(PathBuf::from("/tmp/ledger.db")));
        assert_eq!(fc.dispatch.timeout_ms, Some(750));
        assert!(fc.dispatch.connect_timeout_ms.is_none());
    }

    #[test]
    fn rejects_unknown_section() {
        assert!(toml::from_str::<EdgeConfigFile>("[metrics]\nenabled = true").is_err());
    }

    #[test]
    fn reads_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[opcua]\nendpoint = \"opc.tcp://plc:4840/\"\n").unwrap();

        let fc = read_config_file(&path).unwrap();
        assert_eq!(fc.opcua.endpoint.as_deref(), Some("opc.tcp://plc:4840/"));
    }
}
