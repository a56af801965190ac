use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Credentials missing: {0}")]
    CredentialMissing(String),

    #[error("Credential regeneration failed: {0}")]
    Regeneration(String),

    #[error("State slice '{0}' read before it was ever set")]
    UninitializedState(&'static str),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Programming error: {0}")]
    Programming(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Browser error: {0}")]
    Browser(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Timeout: {0}")]
    Timeout(String),
}

pub type Result<T> = std::result::Result<T, Error>;
