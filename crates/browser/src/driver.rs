//! The UI driver seam: everything the session needs from a live browser.

use async_trait::async_trait;
use futures::FutureExt;
use serde_json::{json, Map, Value};
use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::{Duration, Instant};
use tether_core::config::BrowserConfig;
use tether_core::{BodyLoader, CredentialSet, Error, Exchange, Result};
use tokio::process::Child;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cdp::{CdpClient, CdpEvent};
use crate::launcher::{self, BrowserEngine};
use crate::selectors::Selector;

const RESPONSE_RECEIVED: &str = "Network.responseReceived";
const LOADING_FINISHED: &str = "Network.loadingFinished";
const LOADING_FAILED: &str = "Network.loadingFailed";
const POLL_INTERVAL: Duration = Duration::from_millis(200);
const ACTION_TIMEOUT: Duration = Duration::from_secs(15);
/// Responses awaiting their finish event. Beyond this the oldest is dropped.
const MAX_PENDING: usize = 1024;

#[async_trait]
pub trait UiDriver: Send + Sync {
    async fn navigate(&self, url: &str) -> Result<()>;

    async fn current_url(&self) -> Result<String>;

    /// Replace the element's value with `text`.
    async fn fill(&self, selector: Selector, text: &str) -> Result<()>;

    async fn click(&self, selector: Selector) -> Result<()>;

    /// Immediate check, no waiting.
    async fn exists(&self, selector: Selector) -> Result<bool>;

    /// Wait up to `timeout` for the element to appear.
    async fn wait_for(&self, selector: Selector, timeout: Duration) -> Result<bool>;

    async fn cookies(&self) -> Result<CredentialSet>;

    async fn save_context(&self, path: &Path) -> Result<()>;

    async fn load_context(&self, path: &Path) -> Result<()>;

    /// The feed of completed exchanges. Can be taken once.
    fn traffic(&self) -> Result<mpsc::Receiver<Exchange>>;
}

/// `UiDriver` over the Chrome DevTools Protocol.
pub struct CdpDriver {
    cdp: Arc<CdpClient>,
    child: tokio::sync::Mutex<Option<Child>>,
    traffic: Mutex<Option<mpsc::Receiver<Exchange>>>,
    correlator: JoinHandle<()>,
}

impl CdpDriver {
    pub async fn launch(config: &BrowserConfig, profile_dir: &Path) -> Result<Self> {
        let launched =
            launcher::launch(BrowserEngine::parse(&config.engine), profile_dir, config.headless).await?;
        Self::attach(launched.cdp, Some(launched.child)).await
    }

    /// Drive an already running page target.
    pub async fn connect(ws_url: &str) -> Result<Self> {
        Self::attach(CdpClient::connect(ws_url).await?, None).await
    }

    async fn attach(cdp: CdpClient, child: Option<Child>) -> Result<Self> {
        let cdp = Arc::new(cdp);
        let events = cdp
            .subscribe(&[RESPONSE_RECEIVED, LOADING_FINISHED, LOADING_FAILED])
            .await;
        cdp.enable_domain("Page").await?;
        cdp.enable_domain("Runtime").await?;
        cdp.enable_domain("Network").await?;

        let (feed_tx, feed_rx) = mpsc::channel(256);
        let correlator = tokio::spawn(correlate(Arc::downgrade(&cdp), events, feed_tx));

        Ok(Self {
            cdp,
            child: tokio::sync::Mutex::new(child),
            traffic: Mutex::new(Some(feed_rx)),
            correlator,
        })
    }

    pub async fn close(&self) {
        if let Err(e) = self.cdp.send_command("Browser.close", json!({})).await {
            debug!("CDP Browser.close failed (may already be closed): {}", e);
        }
        if let Some(mut child) = self.child.lock().await.take() {
            let _ = child.kill().await;
        }
    }

    async fn require(&self, selector: Selector) -> Result<()> {
        if self.wait_for(selector, ACTION_TIMEOUT).await? {
            Ok(())
        } else {
            Err(Error::Timeout(format!(
                "element {} did not appear within {}s",
                selector,
                ACTION_TIMEOUT.as_secs()
            )))
        }
    }

    async fn wait_until_loaded(&self) -> Result<()> {
        let deadline = Instant::now() + ACTION_TIMEOUT;
        loop {
            let state = self.cdp.evaluate("document.readyState").await?;
            if state.as_str() == Some("complete") {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(Error::Timeout("page did not finish loading".to_string()));
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }
}

impl Drop for CdpDriver {
    fn drop(&mut self) {
        self.correlator.abort();
    }
}

#[async_trait]
impl UiDriver for CdpDriver {
    async fn navigate(&self, url: &str) -> Result<()> {
        let result = self.cdp.navigate(url).await?;
        if let Some(error) = result.get("errorText").and_then(|v| v.as_str()) {
            return Err(Error::Browser(format!("navigation to {} failed: {}", url, error)));
        }
        self.wait_until_loaded().await?;
        info!(url = %url, "Navigated");
        Ok(())
    }

    async fn current_url(&self) -> Result<String> {
        let href = self.cdp.evaluate("window.location.href").await?;
        href.as_str()
            .map(str::to_string)
            .ok_or_else(|| Error::Browser("page has no location".to_string()))
    }

    async fn fill(&self, selector: Selector, text: &str) -> Result<()> {
        self.require(selector).await?;
        let script = format!(
            "(() => {{ const el = {}; el.focus(); if ('value' in el) {{ el.value = ''; }} return true; }})()",
            selector.lookup_js()
        );
        self.cdp.evaluate(&script).await?;
        self.cdp.insert_text(text).await
    }

    async fn click(&self, selector: Selector) -> Result<()> {
        self.require(selector).await?;
        let script = format!(
            "(() => {{ const el = {}; el.scrollIntoView({{block: 'center'}}); el.click(); return true; }})()",
            selector.lookup_js()
        );
        self.cdp.evaluate(&script).await?;
        debug!(selector = %selector, "Clicked");
        Ok(())
    }

    async fn exists(&self, selector: Selector) -> Result<bool> {
        let found = self
            .cdp
            .evaluate(&format!("({}) !== null", selector.lookup_js()))
            .await?;
        Ok(found.as_bool().unwrap_or(false))
    }

    async fn wait_for(&self, selector: Selector, timeout: Duration) -> Result<bool> {
        let deadline = Instant::now() + timeout;
        loop {
            if self.exists(selector).await? {
                return Ok(true);
            }
            if Instant::now() >= deadline {
                return Ok(false);
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    async fn cookies(&self) -> Result<CredentialSet> {
        CredentialSet::from_cookie_json(&self.cdp.get_cookies().await?)
    }

    async fn save_context(&self, path: &Path) -> Result<()> {
        let cookies = self.cdp.get_cookies().await?;
        let list = cookies.get("cookies").cloned().unwrap_or_else(|| json!([]));
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(path, serde_json::to_string_pretty(&list)?).await?;
        info!(path = %path.display(), count = list.as_array().map(|a| a.len()).unwrap_or(0), "Saved browsing context");
        Ok(())
    }

    async fn load_context(&self, path: &Path) -> Result<()> {
        let content = tokio::fs::read_to_string(path).await?;
        let value: Value = serde_json::from_str(&content)?;
        let list = match &value {
            Value::Array(list) => list.clone(),
            Value::Object(obj) => obj
                .get("cookies")
                .and_then(|v| v.as_array())
                .cloned()
                .ok_or_else(|| Error::Parse(format!("{}: no cookie list", path.display())))?,
            _ => return Err(Error::Parse(format!("{}: no cookie list", path.display()))),
        };
        let params: Vec<Value> = list.iter().filter_map(cookie_param).collect();
        let count = params.len();
        self.cdp.set_cookies(params).await?;
        info!(path = %path.display(), count, "Restored browsing context");
        Ok(())
    }

    fn traffic(&self) -> Result<mpsc::Receiver<Exchange>> {
        self.traffic
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or_else(|| Error::Programming("traffic feed already taken".to_string()))
    }
}

/// Project a stored cookie record onto the fields `Network.setCookies`
/// accepts. Session cookies (negative expiry) carry no `expires`.
fn cookie_param(cookie: &Value) -> Option<Value> {
    const FIELDS: [&str; 7] = ["name", "value", "domain", "path", "secure", "httpOnly", "sameSite"];

    let obj = cookie.as_object()?;
    obj.get("name")?.as_str()?;
    let mut param = Map::new();
    for field in FIELDS {
        if let Some(v) = obj.get(field) {
            param.insert(field.to_string(), v.clone());
        }
    }
    if let Some(expires) = obj.get("expires").and_then(|v| v.as_f64()) {
        if expires >= 0.0 {
            param.insert("expires".to_string(), json!(expires));
        }
    }
    Some(Value::Object(param))
}

struct PendingResponse {
    url: String,
    headers: Vec<(String, String)>,
}

impl PendingResponse {
    fn from_params(params: &Value) -> Option<Self> {
        let response = params.get("response")?;
        let url = response.get("url")?.as_str()?.to_string();
        let mut headers: Vec<(String, String)> = response
            .get("headers")
            .and_then(|h| h.as_object())
            .map(|h| {
                h.iter()
                    .filter_map(|(k, v)| v.as_str().map(|v| (k.clone(), v.to_string())))
                    .collect()
            })
            .unwrap_or_default();
        let has_content_type = headers
            .iter()
            .any(|(k, _)| k.eq_ignore_ascii_case("content-type"));
        if !has_content_type {
            if let Some(mime) = response.get("mimeType").and_then(|v| v.as_str()) {
                headers.push(("content-type".to_string(), mime.to_string()));
            }
        }
        Some(Self { url, headers })
    }

    fn into_exchange(self, request_id: String, cdp: Weak<CdpClient>) -> Exchange {
        let body: BodyLoader = async move {
            let cdp = cdp
                .upgrade()
                .ok_or_else(|| Error::Browser("browser connection closed".to_string()))?;
            cdp.get_response_body(&request_id).await
        }
        .boxed();
        Exchange::new(&self.url, self.headers, body)
    }
}

/// Pairs `responseReceived` with `loadingFinished` per request id.
///
/// Entries are kept in arrival order. Past `capacity` the oldest is
/// dropped, so ids whose finish event never comes cannot pile up.
struct Correlator {
    pending: HashMap<String, PendingResponse>,
    order: VecDeque<String>,
    capacity: usize,
}

impl Correlator {
    fn new(capacity: usize) -> Self {
        Self {
            pending: HashMap::new(),
            order: VecDeque::new(),
            capacity,
        }
    }

    /// The request id and response of a load that just finished, if its
    /// response was seen.
    fn on_event(&mut self, event: &CdpEvent) -> Option<(String, PendingResponse)> {
        let request_id = event.params.get("requestId")?.as_str()?;
        match event.method.as_str() {
            RESPONSE_RECEIVED => {
                let response = PendingResponse::from_params(&event.params)?;
                if self.pending.insert(request_id.to_string(), response).is_none() {
                    self.order.push_back(request_id.to_string());
                }
                while self.pending.len() > self.capacity {
                    let Some(oldest) = self.order.pop_front() else { break };
                    if let Some(dropped) = self.pending.remove(&oldest) {
                        debug!(request_id = %oldest, url = %dropped.url, "Dropping response that never finished loading");
                    }
                }
                None
            }
            LOADING_FINISHED => self
                .take(request_id)
                .map(|response| (request_id.to_string(), response)),
            LOADING_FAILED => {
                if self.take(request_id).is_some() {
                    warn!(request_id, "Response failed to load");
                }
                None
            }
            _ => None,
        }
    }

    fn take(&mut self, request_id: &str) -> Option<PendingResponse> {
        let response = self.pending.remove(request_id)?;
        if let Some(pos) = self.order.iter().position(|id| id == request_id) {
            self.order.remove(pos);
        }
        Some(response)
    }
}

/// Emit one exchange per completed response.
async fn correlate(
    cdp: Weak<CdpClient>,
    mut events: mpsc::UnboundedReceiver<CdpEvent>,
    feed: mpsc::Sender<Exchange>,
) {
    let mut correlator = Correlator::new(MAX_PENDING);
    while let Some(event) = events.recv().await {
        let Some((request_id, response)) = correlator.on_event(&event) else {
            continue;
        };
        let exchange = response.into_exchange(request_id, cdp.clone());
        if feed.send(exchange).await.is_err() {
            debug!("Traffic receiver dropped, stopping correlation");
            break;
        }
    }
}
