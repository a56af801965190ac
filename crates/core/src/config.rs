use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::paths::Paths;

/// URL path prefixes (relative to the service origin) whose JSON responses
/// feed the reconstructed state slices.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoutesConfig {
    #[serde(default = "default_session_route")]
    pub session: String,
    #[serde(default = "default_catalog_route")]
    pub catalog: String,
    #[serde(default = "default_account_route")]
    pub account: String,
    #[serde(default = "default_history_route")]
    pub history: String,
}

fn default_session_route() -> String {
    "/api/auth/session".to_string()
}

fn default_catalog_route() -> String {
    "/backend-api/models".to_string()
}

fn default_account_route() -> String {
    "/backend-api/accounts/check".to_string()
}

fn default_history_route() -> String {
    "/backend-api/conversations".to_string()
}

impl Default for RoutesConfig {
    fn default() -> Self {
        Self {
            session: default_session_route(),
            catalog: default_catalog_route(),
            account: default_account_route(),
            history: default_history_route(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceConfig {
    #[serde(default = "default_origin")]
    pub origin: String,
    #[serde(default = "default_login_path")]
    pub login_path: String,
    #[serde(default)]
    pub routes: RoutesConfig,
}

fn default_origin() -> String {
    "https://chat.openai.com".to_string()
}

fn default_login_path() -> String {
    "/auth/login".to_string()
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            origin: default_origin(),
            login_path: default_login_path(),
            routes: RoutesConfig::default(),
        }
    }
}

impl ServiceConfig {
    /// Origin without a trailing slash.
    pub fn origin(&self) -> &str {
        self.origin.trim_end_matches('/')
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}/{}", self.origin(), path.trim_start_matches('/'))
    }

    pub fn login_url(&self) -> String {
        self.url(&self.login_path)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkConfig {
    /// Proxy for outbound requests. Absent falls back to the HTTPS_PROXY /
    /// HTTP_PROXY environment; an empty string forces a direct connection.
    #[serde(default)]
    pub proxy: Option<String>,
    #[serde(default)]
    pub no_proxy: Vec<String>,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// Headers added to every outbound request. They override per-call
    /// headers but never the Cookie header.
    #[serde(default = "default_base_headers")]
    pub base_headers: BTreeMap<String, String>,
}

fn default_connect_timeout_secs() -> u64 {
    30
}

fn default_base_headers() -> BTreeMap<String, String> {
    let mut headers = BTreeMap::new();
    headers.insert(
        "User-Agent".to_string(),
        "Mozilla/5.0 (X11; Linux x86_64; rv:109.0) Gecko/20100101 Firefox/115.0".to_string(),
    );
    headers
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            proxy: None,
            no_proxy: Vec::new(),
            connect_timeout_secs: default_connect_timeout_secs(),
            base_headers: default_base_headers(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BrowserConfig {
    #[serde(default = "default_engine")]
    pub engine: String,
    #[serde(default = "default_headless")]
    pub headless: bool,
    #[serde(default = "default_profile")]
    pub profile: String,
    /// Where the browsing context is persisted after login. When unset the
    /// context is never written to disk.
    #[serde(default)]
    pub context_path: Option<String>,
    /// Upper bound on "Next" clicks while dismissing the post-login dialog.
    #[serde(default = "default_dialog_max_steps")]
    pub dialog_max_steps: u32,
}

fn default_engine() -> String {
    "chrome".to_string()
}

fn default_headless() -> bool {
    true
}

fn default_profile() -> String {
    "default".to_string()
}

fn default_dialog_max_steps() -> u32 {
    10
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self {
            engine: default_engine(),
            headless: default_headless(),
            profile: default_profile(),
            context_path: None,
            dialog_max_steps: default_dialog_max_steps(),
        }
    }
}

impl BrowserConfig {
    /// Resolve `context_path`, expanding a leading `~/`.
    pub fn context_path(&self) -> Option<PathBuf> {
        let raw = self.context_path.as_deref()?.trim();
        if raw.is_empty() {
            return None;
        }
        if let Some(rest) = raw.strip_prefix("~/") {
            if let Some(home) = dirs::home_dir() {
                return Some(home.join(rest));
            }
        }
        Some(PathBuf::from(raw))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(default)]
    pub service: ServiceConfig,
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub browser: BrowserConfig,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load_or_default(paths: &Paths) -> Result<Self> {
        let config_path = paths.config_file();
        if config_path.exists() {
            Self::load(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    /// The origin must be a bare http(s) origin: scheme, host and optional
    /// port, nothing after.
    pub fn validate(&self) -> Result<()> {
        let origin = self.service.origin();
        let parsed = url::Url::parse(origin)
            .map_err(|e| Error::Config(format!("service.origin '{}' is not a URL: {}", origin, e)))?;
        if !matches!(parsed.scheme(), "http" | "https") || parsed.host_str().is_none() {
            return Err(Error::Config(format!(
                "service.origin must be an http(s) URL, got '{}'",
                self.service.origin
            )));
        }
        if parsed.path() != "/" || parsed.query().is_some() || parsed.fragment().is_some() {
            return Err(Error::Config(format!(
                "service.origin must not carry a path, query or fragment, got '{}'",
                self.service.origin
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_fill_missing_sections() {
        let cfg: Config = serde_json::from_str(r#"{"service": {"origin": "http://localhost:8080/"}}"#).unwrap();
        assert_eq!(cfg.service.origin(), "http://localhost:8080");
        assert_eq!(cfg.service.routes.session, "/api/auth/session");
        assert_eq!(cfg.network.connect_timeout_secs, 30);
        assert_eq!(cfg.browser.dialog_max_steps, 10);
        assert!(cfg.browser.context_path().is_none());
    }

    #[test]
    fn test_login_url() {
        let cfg = Config::default();
        assert_eq!(cfg.service.login_url(), "https://chat.openai.com/auth/login");
    }

    #[test]
    fn test_validate_rejects_non_http_origin() {
        let mut cfg = Config::default();
        cfg.service.origin = "ftp://example.com".to_string();
        assert!(matches!(cfg.validate(), Err(Error::Config(_))));

        cfg.service.origin = "https://example.com/app".to_string();
        assert!(matches!(cfg.validate(), Err(Error::Config(_))));

        cfg.service.origin = "https://example.com:8443/".to_string();
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.json");
        let mut cfg = Config::default();
        cfg.browser.headless = false;
        cfg.save(&path).unwrap();
        let loaded = Config::load(&path).unwrap();
        assert!(!loaded.browser.headless);
    }
}
