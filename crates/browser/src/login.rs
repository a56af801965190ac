//! Where the username and password used for re-authentication live.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::sync::Mutex;
use tether_core::{Error, Result};
use tracing::debug;

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoginCredentials {
    pub username: String,
    pub password: String,
}

impl LoginCredentials {
    pub fn new(username: &str, password: &str) -> Self {
        Self {
            username: username.to_string(),
            password: password.to_string(),
        }
    }
}

impl fmt::Debug for LoginCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoginCredentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

#[async_trait]
pub trait LoginStore: Send + Sync {
    async fn save(&self, credentials: &LoginCredentials) -> Result<()>;

    /// Fails with `CredentialMissing` when nothing was ever saved.
    async fn load(&self) -> Result<LoginCredentials>;
}

#[derive(Default)]
pub struct MemoryLoginStore {
    slot: Mutex<Option<LoginCredentials>>,
}

impl MemoryLoginStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LoginStore for MemoryLoginStore {
    async fn save(&self, credentials: &LoginCredentials) -> Result<()> {
        *self.slot.lock().unwrap_or_else(|e| e.into_inner()) = Some(credentials.clone());
        Ok(())
    }

    async fn load(&self) -> Result<LoginCredentials> {
        self.slot
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or_else(|| Error::CredentialMissing("no login saved; log in once first".to_string()))
    }
}

/// JSON file store. On unix the file is created owner-readable only.
pub struct FileLoginStore {
    path: PathBuf,
}

impl FileLoginStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }
}

#[async_trait]
impl LoginStore for FileLoginStore {
    async fn save(&self, credentials: &LoginCredentials) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let content = serde_json::to_string_pretty(credentials)?;
        tokio::fs::write(&self.path, content).await?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(&self.path, std::fs::Permissions::from_mode(0o600)).await?;
        }
        debug!(path = %self.path.display(), "Saved login");
        Ok(())
    }

    async fn load(&self) -> Result<LoginCredentials> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::CredentialMissing(format!(
                    "no login saved at {}",
                    self.path.display()
                )))
            }
            Err(e) => return Err(e.into()),
        };
        Ok(serde_json::from_str(&content)?)
    }
}
