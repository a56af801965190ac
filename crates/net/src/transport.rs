//! Outbound transport authenticated by the credential vault.
//!
//! Two response modes, selected by the effective `Accept` header:
//! buffered JSON, or a raw event stream whose chunks are handed to the
//! caller verbatim and in arrival order.

use bytes::Bytes;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT, COOKIE};
use reqwest::{Client, Method};
use serde_json::Value;
use std::collections::BTreeMap;
use tether_core::config::NetworkConfig;
use tether_core::{Error, Result};
use tracing::{debug, warn};

use crate::client::build_http_client;
use crate::vault::CredentialVault;

pub const EVENT_STREAM: &str = "text/event-stream";

/// Receives raw response chunks of a streamed request.
pub trait ChunkHandler: Send {
    fn on_chunk(&mut self, chunk: Bytes);
}

impl<F: FnMut(Bytes) + Send> ChunkHandler for F {
    fn on_chunk(&mut self, chunk: Bytes) {
        self(chunk)
    }
}

#[derive(Debug, Clone)]
pub struct Request {
    pub method: Method,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<Value>,
}

impl Request {
    pub fn new(method: Method, url: &str) -> Self {
        Self {
            method,
            url: url.to_string(),
            headers: Vec::new(),
            body: None,
        }
    }

    pub fn get(url: &str) -> Self {
        Self::new(Method::GET, url)
    }

    pub fn post(url: &str) -> Self {
        Self::new(Method::POST, url)
    }

    pub fn header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    pub fn json(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn event_stream(self) -> Self {
        self.header(ACCEPT.as_str(), EVENT_STREAM)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    Json(Value),
    /// The stream closed gracefully; all chunks went to the handler.
    StreamEnded,
}

pub struct Transport {
    client: Client,
    vault: CredentialVault,
    base_headers: HeaderMap,
}

impl Transport {
    pub fn new(client: Client, vault: CredentialVault, base_headers: HeaderMap) -> Self {
        Self {
            client,
            vault,
            base_headers,
        }
    }

    pub fn from_config(network: &NetworkConfig, origin: &str, vault: CredentialVault) -> Result<Self> {
        let client = build_http_client(network, origin)?;
        let base_headers = header_map(&network.base_headers)?;
        Ok(Self::new(client, vault, base_headers))
    }

    pub fn vault(&self) -> &CredentialVault {
        &self.vault
    }

    /// Send `request`. Precedence of headers, lowest first: per-call,
    /// client-wide base headers, then the vault's `Cookie`, which nothing
    /// can override.
    ///
    /// A request whose effective `Accept` is `text/event-stream` needs a
    /// `handler`; without one it fails before any I/O, the vault included.
    pub async fn send(
        &self,
        request: Request,
        handler: Option<&mut dyn ChunkHandler>,
    ) -> Result<Response> {
        let mut headers = self.layer_headers(&request.headers)?;
        let streaming = is_event_stream(&headers);
        if streaming && handler.is_none() {
            return Err(Error::Programming(format!(
                "{} {} accepts {} but no stream handler was given",
                request.method, request.url, EVENT_STREAM
            )));
        }
        if !streaming && handler.is_some() {
            warn!(url = %request.url, "Stream handler given for a buffered request, ignoring it");
        }

        let cookie = self.vault.header_value().await?;
        let cookie = HeaderValue::from_str(&cookie)
            .map_err(|e| Error::Transport(format!("credential not valid in a Cookie header: {}", e)))?;
        headers.insert(COOKIE, cookie);

        let mut builder = self
            .client
            .request(request.method.clone(), &request.url)
            .headers(headers);
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        debug!(method = %request.method, url = %request.url, streaming, "Sending request");
        let response = builder
            .send()
            .await
            .map_err(|e| Error::Transport(format!("{} {}: {}", request.method, request.url, e)))?;
        let status = response.status();
        if !status.is_success() {
            warn!(url = %request.url, status = %status, "Non-success response status");
        }

        match handler {
            Some(handler) if streaming => {
                pump_stream(response, handler, &request.url).await?;
                Ok(Response::StreamEnded)
            }
            _ => {
                let body = response
                    .bytes()
                    .await
                    .map_err(|e| Error::Transport(format!("reading body of {}: {}", request.url, e)))?;
                let value = serde_json::from_slice(&body).map_err(|e| {
                    Error::Parse(format!("failed to parse response body of {}: {}", request.url, e))
                })?;
                Ok(Response::Json(value))
            }
        }
    }

    /// Buffered request resolving to the parsed JSON body.
    pub async fn send_json(&self, request: Request) -> Result<Value> {
        match self.send(request, None).await? {
            Response::Json(value) => Ok(value),
            Response::StreamEnded => Err(Error::Programming(
                "buffered request resolved as a stream".to_string(),
            )),
        }
    }

    /// Streamed request; resolves once the server closes the stream.
    pub async fn send_stream(&self, request: Request, handler: &mut dyn ChunkHandler) -> Result<()> {
        let request = if has_header(&request.headers, ACCEPT.as_str()) {
            request
        } else {
            request.event_stream()
        };
        match self.send(request, Some(handler)).await? {
            Response::StreamEnded => Ok(()),
            Response::Json(_) => Err(Error::Programming(format!(
                "effective Accept header is not {}; check base headers",
                EVENT_STREAM
            ))),
        }
    }

    fn layer_headers(&self, per_call: &[(String, String)]) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        for (name, value) in per_call {
            let (name, value) = parse_header(name, value)?;
            headers.insert(name, value);
        }
        for (name, value) in self.base_headers.iter() {
            headers.insert(name.clone(), value.clone());
        }
        headers.remove(COOKIE);
        Ok(headers)
    }
}

async fn pump_stream(
    mut response: reqwest::Response,
    handler: &mut dyn ChunkHandler,
    url: &str,
) -> Result<()> {
    let mut chunks = 0usize;
    loop {
        match response.chunk().await {
            Ok(Some(chunk)) => {
                chunks += 1;
                handler.on_chunk(chunk);
            }
            Ok(None) => {
                debug!(url = %url, chunks, "Stream closed");
                return Ok(());
            }
            Err(e) => {
                warn!(url = %url, chunks, error = %e, "Stream error");
                return Err(Error::Transport(format!("stream from {} failed: {}", url, e)));
            }
        }
    }
}

fn is_event_stream(headers: &HeaderMap) -> bool {
    headers
        .get(ACCEPT)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim().eq_ignore_ascii_case(EVENT_STREAM))
        .unwrap_or(false)
}

fn has_header(headers: &[(String, String)], name: &str) -> bool {
    headers.iter().any(|(k, _)| k.eq_ignore_ascii_case(name))
}

fn parse_header(name: &str, value: &str) -> Result<(HeaderName, HeaderValue)> {
    let header_name = HeaderName::from_bytes(name.as_bytes())
        .map_err(|e| Error::Programming(format!("invalid header name '{}': {}", name, e)))?;
    let header_value = HeaderValue::from_str(value)
        .map_err(|e| Error::Programming(format!("invalid value for header '{}': {}", name, e)))?;
    Ok((header_name, header_value))
}

pub fn header_map(headers: &BTreeMap<String, String>) -> Result<HeaderMap> {
    let mut map = HeaderMap::new();
    for (name, value) in headers {
        let (name, value) = parse_header(name, value)?;
        map.insert(name, value);
    }
    Ok(map)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vault::{Clock, CredentialRegenerator};
    use async_trait::async_trait;
    use mockito::Matcher;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;
    use tether_core::{Credential, CredentialSet};

    const NOW: i64 = 1_700_000_000;

    struct CountingRegenerator {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl CredentialRegenerator for CountingRegenerator {
        async fn regenerate(&self) -> Result<CredentialSet> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok(CredentialSet::new(vec![Credential::new("sid", "fresh", "", "/", NOW + 3600)]))
        }
    }

    fn transport(expires: i64, base: &[(&str, &str)]) -> (Transport, Arc<CountingRegenerator>) {
        let regen = Arc::new(CountingRegenerator {
            calls: AtomicUsize::new(0),
        });
        let clock: Clock = Arc::new(|| NOW);
        let vault = CredentialVault::with_clock(
            CredentialSet::new(vec![Credential::new("sid", "abc", "", "/", expires)]),
            regen.clone(),
            clock,
        );
        let base: BTreeMap<String, String> =
            base.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        let transport = Transport::new(Client::new(), vault, header_map(&base).unwrap());
        (transport, regen)
    }

    #[tokio::test]
    async fn test_buffered_json_with_layered_headers() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/backend-api/thing")
            .match_header("cookie", "sid=abc")
            .match_header("user-agent", "base-agent")
            .match_header("x-call", "1")
            .match_header("content-type", "application/json")
            .match_body(Matcher::Json(json!({"q": 1})))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"ok": true}"#)
            .create_async()
            .await;

        let (transport, _) = transport(NOW + 3600, &[("User-Agent", "base-agent")]);
        let request = Request::post(&format!("{}/backend-api/thing", server.url()))
            .header("User-Agent", "per-call-agent")
            .header("X-Call", "1")
            .header("Cookie", "sid=forged")
            .json(json!({"q": 1}));
        let value = transport.send_json(request).await.unwrap();

        assert_eq!(value, json!({"ok": true}));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_malformed_body_is_parse_error() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/broken")
            .with_status(200)
            .with_body("<html>not json</html>")
            .create_async()
            .await;

        let (transport, _) = transport(NOW + 3600, &[]);
        let err = transport
            .send_json(Request::get(&format!("{}/broken", server.url())))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Parse(_)));
    }

    #[tokio::test]
    async fn test_connection_failure_is_transport_error() {
        let (transport, _) = transport(NOW + 3600, &[]);
        let err = transport
            .send_json(Request::get("http://127.0.0.1:1/unreachable"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Transport(_)));
    }

    #[tokio::test]
    async fn test_streamed_chunks_reach_handler_in_order() {
        let mut server = mockito::Server::new_async().await;
        let body = "data: {\"n\":1}\n\ndata: {\"n\":2}\n\ndata: [DONE]\n\n";
        let mock = server
            .mock("POST", "/conversation")
            .match_header("accept", EVENT_STREAM)
            .match_header("cookie", "sid=abc")
            .with_status(200)
            .with_header("content-type", EVENT_STREAM)
            .with_body(body)
            .create_async()
            .await;

        let (transport, _) = transport(NOW + 3600, &[]);
        let mut received: Vec<u8> = Vec::new();
        let mut chunks = 0;
        let mut handler = |chunk: Bytes| {
            chunks += 1;
            received.extend_from_slice(&chunk);
        };
        transport
            .send_stream(
                Request::post(&format!("{}/conversation", server.url())).json(json!({"prompt": "hi"})),
                &mut handler,
            )
            .await
            .unwrap();

        assert!(chunks >= 1);
        assert_eq!(String::from_utf8(received).unwrap(), body);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_stream_without_handler_fails_before_io() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/conversation")
            .expect(0)
            .create_async()
            .await;

        // Stale vault: a refresh here would also count as I/O.
        let (transport, regen) = transport(NOW - 1, &[]);
        let request = Request::get(&format!("{}/conversation", server.url())).event_stream();
        let err = transport.send(request, None).await.unwrap_err();

        assert!(matches!(err, Error::Programming(_)));
        assert_eq!(regen.calls.load(Ordering::SeqCst), 0);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_base_accept_header_selects_streaming() {
        let (transport, _) = transport(NOW + 3600, &[("Accept", EVENT_STREAM)]);
        let err = transport
            .send(Request::get("http://127.0.0.1:1/x").header("Accept", "application/json"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Programming(_)));
    }

    #[tokio::test]
    async fn test_concurrent_sends_with_expired_cookie_refresh_once() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/api/auth/session")
            .match_header("cookie", "sid=fresh")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"accessToken": "t"}"#)
            .expect(3)
            .create_async()
            .await;

        let (transport, regen) = transport(NOW - 1, &[]);
        let url = format!("{}/api/auth/session", server.url());
        let (a, b, c) = tokio::join!(
            transport.send_json(Request::get(&url)),
            transport.send_json(Request::get(&url)),
            transport.send_json(Request::get(&url)),
        );

        for result in [a, b, c] {
            assert_eq!(result.unwrap(), json!({"accessToken": "t"}));
        }
        assert_eq!(regen.calls.load(Ordering::SeqCst), 1);
        mock.assert_async().await;
    }
}
