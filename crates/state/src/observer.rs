//! Passive traffic observer.
//!
//! Rides on the responses the browser already receives, classifies them by
//! URL and content type, and folds matching JSON bodies into the
//! [`StateStore`]. It never issues requests of its own.

use serde::de::DeserializeOwned;
use std::fmt;
use std::sync::Arc;
use tether_core::config::ServiceConfig;
use tether_core::{Account, Catalog, Error, Exchange, HistoryPage, Result, Session};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::notify::StateEvent;
use crate::store::StateStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SliceTag {
    Session,
    Catalog,
    Account,
    History,
}

impl fmt::Display for SliceTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SliceTag::Session => "session",
            SliceTag::Catalog => "catalog",
            SliceTag::Account => "account",
            SliceTag::History => "history",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteRule {
    pub prefix: String,
    pub slice: SliceTag,
}

impl RouteRule {
    pub fn new(prefix: &str, slice: SliceTag) -> Self {
        Self {
            prefix: prefix.to_string(),
            slice,
        }
    }
}

/// Ordered URL-prefix table. Fixed at construction; first match wins.
#[derive(Debug, Clone)]
pub struct RouteTable {
    origin: String,
    rules: Vec<RouteRule>,
}

impl RouteTable {
    /// `rules` hold full URL prefixes (origin included).
    pub fn new(origin: &str, rules: Vec<RouteRule>) -> Self {
        Self {
            origin: origin.trim_end_matches('/').to_string(),
            rules,
        }
    }

    pub fn from_config(service: &ServiceConfig) -> Self {
        let routes = &service.routes;
        Self::new(
            service.origin(),
            vec![
                RouteRule::new(&service.url(&routes.session), SliceTag::Session),
                RouteRule::new(&service.url(&routes.catalog), SliceTag::Catalog),
                RouteRule::new(&service.url(&routes.account), SliceTag::Account),
                RouteRule::new(&service.url(&routes.history), SliceTag::History),
            ],
        )
    }

    pub fn origin(&self) -> &str {
        &self.origin
    }

    pub fn rules(&self) -> &[RouteRule] {
        &self.rules
    }

    /// The origin must be followed by a path, query, fragment or nothing,
    /// so `https://host.evil` never passes for `https://host`.
    pub fn is_tracked_origin(&self, url: &str) -> bool {
        match url.strip_prefix(self.origin.as_str()) {
            Some(rest) => rest.is_empty() || rest.starts_with(['/', '?', '#']),
            None => false,
        }
    }

    pub fn resolve(&self, url: &str) -> Option<SliceTag> {
        self.rules
            .iter()
            .find(|rule| url.starts_with(rule.prefix.as_str()))
            .map(|rule| rule.slice)
    }
}

/// What happened to one observed exchange.
#[derive(Debug, Clone)]
pub enum Outcome {
    ForeignOrigin,
    NotJson,
    Unrouted,
    /// Matched a history route but every item was already known.
    Unchanged(SliceTag),
    Applied(StateEvent),
}

pub struct TrafficObserver {
    routes: RouteTable,
    store: Arc<StateStore>,
}

impl TrafficObserver {
    pub fn new(routes: RouteTable, store: Arc<StateStore>) -> Self {
        Self { routes, store }
    }

    pub fn store(&self) -> &Arc<StateStore> {
        &self.store
    }

    pub fn routes(&self) -> &RouteTable {
        &self.routes
    }

    /// Classify and dispatch one exchange. Irrelevant traffic is an `Ok`
    /// outcome; only a matched route whose body fails to load or parse is
    /// an error.
    pub async fn observe(&self, exchange: Exchange) -> Result<Outcome> {
        if !self.routes.is_tracked_origin(&exchange.url) {
            return Ok(Outcome::ForeignOrigin);
        }
        if !exchange.is_json() {
            debug!(url = %exchange.url, content_type = ?exchange.content_type(), "Skipping non-JSON response");
            return Ok(Outcome::NotJson);
        }
        let Some(slice) = self.routes.resolve(&exchange.url) else {
            return Ok(Outcome::Unrouted);
        };

        let url = exchange.url;
        let body = exchange.body.await?;
        debug!(url = %url, slice = %slice, bytes = body.len(), "Dispatching observed response");

        let outcome = match slice {
            SliceTag::Session => Outcome::Applied(self.store.set_session(parse::<Session>(&url, &body)?)),
            SliceTag::Catalog => Outcome::Applied(self.store.set_catalog(parse::<Catalog>(&url, &body)?)),
            SliceTag::Account => Outcome::Applied(self.store.set_account(parse::<Account>(&url, &body)?)),
            SliceTag::History => {
                let page = parse::<HistoryPage>(&url, &body)?;
                match self.store.ingest_history(page.items) {
                    Some(event) => Outcome::Applied(event),
                    None => Outcome::Unchanged(SliceTag::History),
                }
            }
        };
        Ok(outcome)
    }

    /// Drain a traffic feed until the sender side closes. Errors on matched
    /// routes are logged and handed to `errors` when provided; they never
    /// stop the loop.
    pub async fn run(
        self,
        mut feed: mpsc::Receiver<Exchange>,
        errors: Option<mpsc::UnboundedSender<Error>>,
    ) {
        info!(origin = %self.routes.origin(), "Traffic observer started");
        while let Some(exchange) = feed.recv().await {
            let url = exchange.url.clone();
            match self.observe(exchange).await {
                Ok(Outcome::Applied(event)) => {
                    debug!(url = %url, event = %event.kind(), "State updated from traffic");
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(url = %url, error = %e, "Failed to ingest observed response");
                    if let Some(tx) = &errors {
                        let _ = tx.send(e);
                    }
                }
            }
        }
        info!("Traffic feed closed, observer stopped");
    }
}

fn parse<T: DeserializeOwned>(url: &str, body: &[u8]) -> Result<T> {
    serde_json::from_slice(body).map_err(|e| Error::Parse(format!("{}: {}", url, e)))
}
