pub mod config;
pub mod credential;
pub mod error;
pub mod exchange;
pub mod lifecycle;
pub mod paths;
pub mod types;

pub use config::Config;
pub use credential::{Credential, CredentialSet, NEVER_EXPIRES};
pub use error::{Error, Result};
pub use exchange::{BodyLoader, Exchange};
pub use lifecycle::{Lifecycle, LifecycleEvent};
pub use paths::Paths;
pub use types::{Account, Catalog, HistoryItem, HistoryPage, Identified, Session};
