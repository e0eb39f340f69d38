//! Configuration file handling.

use std::path::{Path, PathBuf};

use anyhow::{Context, bail};
use mailweave_core::{Account, EngineConfig, Filters, validate_accounts};
use serde::{Deserialize, Serialize};

/// Logging options.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LogSettings {
    /// Filter directives, used when `RUST_LOG` is unset.
    #[serde(default)]
    pub level: Option<String>,
    /// Log file; logs go to stderr when absent.
    #[serde(default)]
    pub output: Option<PathBuf>,
}

/// Contents of `config.json`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    /// Logging options.
    #[serde(default)]
    pub log: LogSettings,
    /// Configured accounts.
    pub accounts: Vec<Account>,
    /// Engine tuning.
    #[serde(default)]
    pub engine: EngineConfig,
    /// Viewer commands for body parts, keyed by `type/subtype` or `type/*`.
    #[serde(default)]
    pub filters: Filters,
}

/// Application directory below `base`, or below the working directory
/// when the platform has none.
fn app_dir(base: Option<PathBuf>) -> PathBuf {
    base.unwrap_or_else(|| PathBuf::from(".")).join("mailweave")
}

/// Path of the configuration file: `explicit` if given, otherwise
/// `<config_dir>/mailweave/config.json`.
pub fn config_path(explicit: Option<PathBuf>) -> PathBuf {
    explicit.unwrap_or_else(|| app_dir(dirs::config_dir()).join("config.json"))
}

/// Directory of the store and the message cache.
pub fn data_dir() -> PathBuf {
    app_dir(dirs::data_dir())
}

/// Checks that every filter key is a `type/subtype` pair with a concrete
/// type. Only the subtype may be `*`.
fn validate_filters(filters: &Filters) -> anyhow::Result<()> {
    for mime in filters.keys() {
        let Some((mime_type, mime_subtype)) = mime.split_once('/') else {
            bail!("malformed mime `{mime}`");
        };
        if mime_type.is_empty() || mime_subtype.is_empty() || mime_subtype.contains('/') {
            bail!("malformed mime `{mime}`");
        }
        if mime_type == "*" {
            bail!("mime type should not be `*`, only the subtype ({mime})");
        }
    }
    Ok(())
}

impl Settings {
    /// Reads and validates the settings at `path`.
    ///
    /// An empty `engine.cache_dir` is set to `<data_dir>/cache`.
    pub async fn load(path: &Path, data_dir: &Path) -> anyhow::Result<Self> {
        let contents = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        let mut settings: Self = serde_json::from_str(&contents)
            .with_context(|| format!("parsing {}", path.display()))?;

        if let Err(errors) = validate_accounts(&settings.accounts) {
            let details: Vec<String> = errors
                .iter()
                .map(|e| format!("{}: {}", e.field(), e.message()))
                .collect();
            bail!("invalid accounts in {}: {}", path.display(), details.join("; "));
        }
        validate_filters(&settings.filters)
            .with_context(|| format!("in filters section of {}", path.display()))?;

        if settings.engine.cache_dir.as_os_str().is_empty() {
            settings.engine.cache_dir = data_dir.join("cache");
        }
        Ok(settings)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    const CONFIG: &str = r#"{
        "log": { "level": "mailweave=debug" },
        "accounts": [{
            "name": "work",
            "email": "me@example.com",
            "imap": {
                "host": "imap.example.com",
                "username": "me",
                "password": { "plain": "secret" }
            },
            "smtp": {
                "host": "smtp.example.com",
                "security": "starttls",
                "username": "me",
                "password": { "command": "pass show mail" }
            }
        }],
        "engine": { "request_timeout_secs": 60 },
        "filters": { "text/plain": "cat", "text/*": "w3m -T text/html" }
    }"#;

    #[tokio::test]
    async fn test_load_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        tokio::fs::write(&path, CONFIG).await.unwrap();

        let settings = Settings::load(&path, dir.path()).await.unwrap();
        assert_eq!(settings.log.level.as_deref(), Some("mailweave=debug"));
        assert_eq!(settings.accounts.len(), 1);
        assert_eq!(settings.accounts[0].imap.effective_port(), 993);
        assert_eq!(settings.accounts[0].smtp.effective_port(), 587);
        assert_eq!(settings.engine.inbox_capacity, 32);
        assert_eq!(settings.engine.request_timeout_secs, Some(60));
        assert_eq!(settings.engine.cache_dir, dir.path().join("cache"));
        assert_eq!(settings.filters.len(), 2);
        assert_eq!(settings.filters["text/plain"], "cat");
    }

    #[test]
    fn test_filter_mime_shape() {
        let filters = |mime: &str| Filters::from([(mime.to_string(), "cat".to_string())]);
        assert!(validate_filters(&Filters::new()).is_ok());
        assert!(validate_filters(&filters("text/plain")).is_ok());
        assert!(validate_filters(&filters("text/*")).is_ok());

        for bad in ["text", "text/plain/extra", "/plain", "text/"] {
            let err = validate_filters(&filters(bad)).unwrap_err();
            assert!(err.to_string().contains("malformed"), "{bad}: {err}");
        }
        let err = validate_filters(&filters("*/plain")).unwrap_err();
        assert!(err.to_string().contains("only the subtype"));
    }

    #[tokio::test]
    async fn test_load_rejects_bad_filter() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let config = CONFIG.replace(r#""text/*""#, r#""*/*""#);
        tokio::fs::write(&path, config).await.unwrap();

        let err = Settings::load(&path, dir.path()).await.unwrap_err();
        assert!(format!("{err:#}").contains("filters"));
    }

    #[tokio::test]
    async fn test_load_rejects_invalid_accounts() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        tokio::fs::write(&path, r#"{ "accounts": [] }"#).await.unwrap();

        assert!(Settings::load(&path, dir.path()).await.is_err());
    }

    #[tokio::test]
    async fn test_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = Settings::load(&dir.path().join("nope.json"), dir.path())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("nope.json"));
    }

    #[test]
    fn test_explicit_path_wins() {
        let path = PathBuf::from("/tmp/custom.json");
        assert_eq!(config_path(Some(path.clone())), path);
        assert!(config_path(None).ends_with("mailweave/config.json"));
    }
}
