//! # Configuration
//!
//! A JSON document mapping server names to their settings:
//!
//! ```json
//! {
//!   "servers": {
//!     "boot": { "listen": "udp/:69", "root": "/srv/tftp", "timeout": "5s", "logs": true },
//!     "lab":  { "listen": "127.0.0.1:6969-6970" }
//!   }
//! }
//! ```
//!
//! `timeout` is either an integer (nanoseconds) or a duration string such as
//! `"300ms"` or `"2h45m"`. Zero or absent means [`DEFAULT_TIMEOUT`].
//!
//! Roots are resolved explicitly: [`AppConfig::with_default_root`] fills in
//! empty roots and anchors relative ones, so nothing downstream consults the
//! process working directory.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Deserializer};
use tracing::info;

use crate::error::{Error, Result};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Top-level configuration: the set of servers keyed by name.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AppConfig {
    #[serde(default)]
    pub servers: BTreeMap<String, ServerConfig>,
}

/// One named server entry.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    /// `[network/]host[:port[-port]]`; UDP on port 69 when parts are omitted.
    #[serde(default)]
    pub listen: String,

    /// Directory files are served from and uploaded to.
    #[serde(default)]
    pub root: PathBuf,

    /// Bound on one network round trip.
    #[serde(default, deserialize_with = "deserialize_duration")]
    pub timeout: Option<Duration>,

    /// Emit one access-log record per transfer.
    #[serde(default)]
    pub logs: bool,
}

impl AppConfig {
    /// Loads configuration from a JSON file.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let path_str = path.display().to_string();

        info!("Loading configuration from: {}", path_str);

        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| Error::config_load(&path_str, e.to_string()))?;

        serde_json::from_str(&content).map_err(|e| Error::config_load(&path_str, e.to_string()))
    }

    /// Parses configuration from a string (useful for testing).
    pub fn from_json(content: &str) -> Result<Self> {
        serde_json::from_str(content).map_err(|e| Error::config_load("<string>", e.to_string()))
    }

    /// Anchor every root at `base`: empty roots become `base`, relative
    /// roots are joined onto it, absolute roots are kept.
    pub fn with_default_root(mut self, base: &Path) -> Self {
        for server in self.servers.values_mut() {
            server.root = if server.root.as_os_str().is_empty() {
                base.to_path_buf()
            } else {
                base.join(&server.root)
            };
        }
        self
    }
}

impl ServerConfig {
    /// The configured timeout, or the default when unset or zero.
    pub fn timeout(&self) -> Duration {
        self.timeout.filter(|t| !t.is_zero()).unwrap_or(DEFAULT_TIMEOUT)
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawDuration {
    Nanos(u64),
    Text(String),
}

fn deserialize_duration<'de, D>(deserializer: D) -> std::result::Result<Option<Duration>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<RawDuration>::deserialize(deserializer)? {
        None => Ok(None),
        Some(RawDuration::Nanos(nanos)) => Ok(Some(Duration::from_nanos(nanos))),
        Some(RawDuration::Text(text)) => humantime::parse_duration(&text)
            .map(Some)
            .map_err(|e| serde::de::Error::custom(format!("invalid duration '{}': {}", text, e))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_entry() {
        let config = AppConfig::from_json(
            r#"{"servers": {"boot": {"listen": "udp/:6969", "root": "/srv/tftp", "timeout": "300ms", "logs": true}}}"#,
        )
        .unwrap();

        let boot = &config.servers["boot"];
        assert_eq!(boot.listen, "udp/:6969");
        assert_eq!(boot.root, PathBuf::from("/srv/tftp"));
        assert_eq!(boot.timeout(), Duration::from_millis(300));
        assert!(boot.logs);
    }

    #[test]
    fn test_defaults() {
        let config = AppConfig::from_json(r#"{"servers": {"plain": {}}}"#).unwrap();
        let plain = &config.servers["plain"];
        assert_eq!(plain.listen, "");
        assert_eq!(plain.root, PathBuf::new());
        assert_eq!(plain.timeout, None);
        assert_eq!(plain.timeout(), DEFAULT_TIMEOUT);
        assert!(!plain.logs);

        assert!(AppConfig::from_json("{}").unwrap().servers.is_empty());
    }

    #[test]
    fn test_timeout_forms() {
        let config = AppConfig::from_json(
            r#"{"servers": {
                "nanos": {"timeout": 1500000000},
                "zero": {"timeout": 0},
                "long": {"timeout": "2h 45m"}
            }}"#,
        )
        .unwrap();

        assert_eq!(config.servers["nanos"].timeout(), Duration::from_millis(1500));
        assert_eq!(config.servers["zero"].timeout(), DEFAULT_TIMEOUT);
        assert_eq!(config.servers["long"].timeout(), Duration::from_secs(2 * 3600 + 45 * 60));
    }

    #[test]
    fn test_invalid_documents() {
        let err = AppConfig::from_json(r#"{"servers": {"x": {"timeout": "soon"}}}"#).unwrap_err();
        assert!(err.is_config_error());
        assert!(err.to_string().contains("soon"));

        assert!(AppConfig::from_json(r#"{"servers": {"x": {"lisen": ":69"}}}"#).is_err());
        assert!(AppConfig::from_json("not json").is_err());
    }

    #[test]
    fn test_with_default_root() {
        let config = AppConfig::from_json(
            r#"{"servers": {"empty": {}, "relative": {"root": "boot"}, "absolute": {"root": "/srv/tftp"}}}"#,
        )
        .unwrap()
        .with_default_root(Path::new("/var/lib/tftpd"));

        assert_eq!(config.servers["empty"].root, PathBuf::from("/var/lib/tftpd"));
        assert_eq!(config.servers["relative"].root, PathBuf::from("/var/lib/tftpd/boot"));
        assert_eq!(config.servers["absolute"].root, PathBuf::from("/srv/tftp"));
    }

    #[tokio::test]
    async fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tftpd.json");
        tokio::fs::write(&path, r#"{"servers": {"a": {"listen": ":6969"}}}"#)
            .await
            .unwrap();

        let config = AppConfig::load(&path).await.unwrap();
        assert_eq!(config.servers["a"].listen, ":6969");

        let missing = AppConfig::load(dir.path().join("missing.json")).await.unwrap_err();
        assert!(matches!(missing, Error::ConfigLoad { .. }));
    }
}
