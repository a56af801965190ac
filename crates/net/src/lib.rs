pub mod client;
pub mod transport;
pub mod vault;

pub use client::build_http_client;
pub use transport::{ChunkHandler, Request, Response, Transport, EVENT_STREAM};
pub use vault::{system_clock, Clock, CredentialRegenerator, CredentialVault};
