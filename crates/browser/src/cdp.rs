//! Chrome DevTools Protocol client over WebSocket.
//!
//! One writer task owns the socket sink; one reader task routes command
//! responses back to their callers by id and fans events out to
//! subscribers in arrival order.

use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tether_core::{Error, Result};
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, error, warn};

const COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

/// A protocol event, e.g. `Network.responseReceived`.
#[derive(Debug, Clone)]
pub struct CdpEvent {
    pub method: String,
    pub params: Value,
}

struct Listener {
    methods: Vec<String>,
    tx: mpsc::UnboundedSender<CdpEvent>,
}

pub struct CdpClient {
    ws_tx: mpsc::Sender<String>,
    pending: Arc<Mutex<HashMap<u64, oneshot::Sender<Value>>>>,
    next_id: AtomicU64,
    listeners: Arc<Mutex<Vec<Listener>>>,
    reader_handle: tokio::task::JoinHandle<()>,
    writer_handle: tokio::task::JoinHandle<()>,
}

impl CdpClient {
    pub async fn connect(ws_url: &str) -> Result<Self> {
        use futures::{SinkExt, StreamExt};
        use tokio_tungstenite::connect_async;
        use tokio_tungstenite::tungstenite::Message;

        let (ws_stream, _) = connect_async(ws_url)
            .await
            .map_err(|e| Error::Browser(format!("failed to connect to CDP endpoint {}: {}", ws_url, e)))?;

        let (mut ws_sink, mut ws_read) = ws_stream.split();
        let (ws_tx, mut ws_rx) = mpsc::channel::<String>(256);

        let pending: Arc<Mutex<HashMap<u64, oneshot::Sender<Value>>>> =
            Arc::new(Mutex::new(HashMap::new()));
        let pending_clone = pending.clone();

        let listeners: Arc<Mutex<Vec<Listener>>> = Arc::new(Mutex::new(Vec::new()));
        let listeners_clone = listeners.clone();

        let writer_handle = tokio::spawn(async move {
            while let Some(msg) = ws_rx.recv().await {
                if let Err(e) = ws_sink.send(Message::Text(msg)).await {
                    error!("CDP WebSocket write error: {}", e);
                    break;
                }
            }
        });

        let reader_handle = tokio::spawn(async move {
            while let Some(msg_result) = ws_read.next().await {
                match msg_result {
                    Ok(Message::Text(text)) => {
                        let Ok(val) = serde_json::from_str::<Value>(&text) else {
                            continue;
                        };
                        if let Some(id) = val.get("id").and_then(|v| v.as_u64()) {
                            if let Some(tx) = pending_clone.lock().await.remove(&id) {
                                let _ = tx.send(val);
                            }
                        } else if let Some(method) = val.get("method").and_then(|v| v.as_str()) {
                            let params = val.get("params").cloned().unwrap_or(Value::Null);
                            let mut listeners = listeners_clone.lock().await;
                            listeners.retain(|l| !l.tx.is_closed());
                            for listener in listeners.iter() {
                                if !listener.methods.iter().any(|m| m == method) {
                                    continue;
                                }
                                let event = CdpEvent {
                                    method: method.to_string(),
                                    params: params.clone(),
                                };
                                let _ = listener.tx.send(event);
                            }
                        }
                    }
                    Ok(Message::Close(_)) => {
                        debug!("CDP WebSocket closed by server");
                        break;
                    }
                    Err(e) => {
                        warn!("CDP WebSocket read error: {}", e);
                        break;
                    }
                    _ => {}
                }
            }
        });

        Ok(Self {
            ws_tx,
            pending,
            next_id: AtomicU64::new(1),
            listeners,
            reader_handle,
            writer_handle,
        })
    }

    /// Send a command and wait for its `result`.
    pub async fn send_command(&self, method: &str, params: Value) -> Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let msg = json!({
            "id": id,
            "method": method,
            "params": params,
        });

        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        self.ws_tx
            .send(msg.to_string())
            .await
            .map_err(|e| Error::Browser(format!("failed to send CDP command {}: {}", method, e)))?;

        match tokio::time::timeout(COMMAND_TIMEOUT, rx).await {
            Ok(Ok(response)) => match response.get("error") {
                Some(error) => Err(Error::Browser(format!("CDP error on {}: {}", method, error))),
                None => Ok(response.get("result").cloned().unwrap_or(Value::Null)),
            },
            Ok(Err(_)) => Err(Error::Browser("CDP response channel closed".to_string())),
            Err(_) => {
                self.pending.lock().await.remove(&id);
                Err(Error::Timeout(format!(
                    "CDP command '{}' timed out after {}s",
                    method,
                    COMMAND_TIMEOUT.as_secs()
                )))
            }
        }
    }

    /// Subscribe to a group of events on one ordered channel. Events from
    /// the same connection keep their wire order. The channel is unbounded
    /// so a slow subscriber never costs an event.
    pub async fn subscribe(&self, methods: &[&str]) -> mpsc::UnboundedReceiver<CdpEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.listeners.lock().await.push(Listener {
            methods: methods.iter().map(|m| m.to_string()).collect(),
            tx,
        });
        rx
    }

    pub async fn enable_domain(&self, domain: &str) -> Result<()> {
        self.send_command(&format!("{}.enable", domain), json!({})).await?;
        Ok(())
    }

    pub async fn navigate(&self, url: &str) -> Result<Value> {
        self.send_command("Page.navigate", json!({"url": url})).await
    }

    /// Evaluate an expression and return its value. A thrown exception is
    /// a `Browser` error.
    pub async fn evaluate(&self, expression: &str) -> Result<Value> {
        let result = self
            .send_command(
                "Runtime.evaluate",
                json!({
                    "expression": expression,
                    "returnByValue": true,
                    "awaitPromise": true,
                }),
            )
            .await?;
        if let Some(details) = result.get("exceptionDetails") {
            let text = details
                .pointer("/exception/description")
                .or_else(|| details.get("text"))
                .and_then(|v| v.as_str())
                .unwrap_or("unknown exception");
            return Err(Error::Browser(format!("script failed: {}", text)));
        }
        Ok(result.pointer("/result/value").cloned().unwrap_or(Value::Null))
    }

    /// Insert text at the focused element, bypassing key events.
    pub async fn insert_text(&self, text: &str) -> Result<()> {
        self.send_command("Input.insertText", json!({"text": text})).await?;
        Ok(())
    }

    /// Cookies visible to the current page, in `Network.getCookies` shape.
    pub async fn get_cookies(&self) -> Result<Value> {
        self.send_command("Network.getCookies", json!({})).await
    }

    pub async fn set_cookies(&self, cookies: Vec<Value>) -> Result<()> {
        self.send_command("Network.setCookies", json!({"cookies": cookies}))
            .await?;
        Ok(())
    }

    /// Body of a finished response, decoded from base64 when the browser
    /// reports it that way.
    pub async fn get_response_body(&self, request_id: &str) -> Result<Vec<u8>> {
        let result = self
            .send_command("Network.getResponseBody", json!({"requestId": request_id}))
            .await?;
        decode_body(&result)
    }
}

impl Drop for CdpClient {
    fn drop(&mut self) {
        self.reader_handle.abort();
        self.writer_handle.abort();
    }
}

fn decode_body(result: &Value) -> Result<Vec<u8>> {
    use base64::Engine;

    let body = result.get("body").and_then(|v| v.as_str()).unwrap_or("");
    if result
        .get("base64Encoded")
        .and_then(|v| v.as_bool())
        .unwrap_or(false)
    {
        base64::engine::general_purpose::STANDARD
            .decode(body)
            .map_err(|e| Error::Browser(format!("invalid base64 response body: {}", e)))
    } else {
        Ok(body.as_bytes().to_vec())
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_command_round_trip_and_error() {
        let endpoint = testing::spawn(|method, _| match method {
            "Runtime.evaluate" => json!({"result": {"type": "string", "value": "https://x.test/"}}),
            _ => json!({}),
        })
        .await;
        let cdp = CdpClient::connect(&endpoint.ws_url).await.unwrap();

        let value = cdp.evaluate("window.location.href").await.unwrap();
        assert_eq!(value, json!("https://x.test/"));
        cdp.enable_domain("Network").await.unwrap();
    }

    #[tokio::test]
    async fn test_script_exception_is_browser_error() {
        let endpoint = testing::spawn(|_, _| {
            json!({"exceptionDetails": {"text": "Uncaught", "exception": {"description": "ReferenceError: nope"}}})
        })
        .await;
        let cdp = CdpClient::connect(&endpoint.ws_url).await.unwrap();

        let err = cdp.evaluate("nope").await.unwrap_err();
        assert!(matches!(err, Error::Browser(msg) if msg.contains("ReferenceError")));
    }

    #[tokio::test]
    async fn test_events_keep_wire_order_across_methods() {
        let endpoint = testing::spawn(|_, _| json!({})).await;
        let cdp = CdpClient::connect(&endpoint.ws_url).await.unwrap();
        let mut rx = cdp.subscribe(&["A.one", "A.two"]).await;

        endpoint.events.send(json!({"method": "A.two", "params": {"n": 1}})).unwrap();
        endpoint.events.send(json!({"method": "B.other", "params": {}})).unwrap();
        endpoint.events.send(json!({"method": "A.one", "params": {"n": 2}})).unwrap();

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert_eq!((first.method.as_str(), first.params["n"].as_i64()), ("A.two", Some(1)));
        assert_eq!((second.method.as_str(), second.params["n"].as_i64()), ("A.one", Some(2)));
    }

    #[tokio::test]
    async fn test_unread_subscriber_loses_no_events() {
        let endpoint = testing::spawn(|_, _| json!({})).await;
        let cdp = CdpClient::connect(&endpoint.ws_url).await.unwrap();
        let mut rx = cdp.subscribe(&["Network.loadingFinished"]).await;

        for n in 0..3000 {
            endpoint
                .events
                .send(json!({"method": "Network.loadingFinished", "params": {"n": n}}))
                .unwrap();
        }
        // Let the whole burst pile up before reading anything.
        tokio::time::sleep(Duration::from_millis(300)).await;

        for n in 0..3000 {
            let event = rx.recv().await.unwrap();
            assert_eq!(event.params["n"].as_i64(), Some(n));
        }
    }

    #[test]
    fn test_decode_body() {
        let plain = json!({"body": "{\"a\":1}", "base64Encoded": false});
        assert_eq!(decode_body(&plain).unwrap(), b"{\"a\":1}".to_vec());

        let encoded = json!({"body": "eyJhIjoxfQ==", "base64Encoded": true});
        assert_eq!(decode_body(&encoded).unwrap(), b"{\"a\":1}".to_vec());

        let broken = json!({"body": "***", "base64Encoded": true});
        assert!(matches!(decode_body(&broken), Err(Error::Browser(_))));
    }
}
