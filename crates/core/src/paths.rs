use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct Paths {
    pub base: PathBuf,
}

impl Paths {
    pub fn new() -> Self {
        let base = dirs::home_dir()
            .map(|h| h.join(".tether"))
            .unwrap_or_else(|| PathBuf::from(".tether"));
        Self { base }
    }

    pub fn with_base(base: PathBuf) -> Self {
        Self { base }
    }

    pub fn config_file(&self) -> PathBuf {
        self.base.join("config.json")
    }

    /// Saved username/password used to re-authenticate when cookies expire.
    pub fn login_file(&self) -> PathBuf {
        self.base.join("login.json")
    }

    /// Default location of the persisted browsing context (cookie dump).
    pub fn context_file(&self) -> PathBuf {
        self.base.join("browser-context.json")
    }

    pub fn profiles_dir(&self) -> PathBuf {
        self.base.join("profiles")
    }

    pub fn profile_dir(&self, name: &str) -> PathBuf {
        let safe_name = name.replace([':', '/', '\\'], "_");
        self.profiles_dir().join(safe_name)
    }

    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.base)?;
        std::fs::create_dir_all(self.profiles_dir())?;
        Ok(())
    }
}

impl Default for Paths {
    fn default() -> Self {
        Self::new()
    }
}
