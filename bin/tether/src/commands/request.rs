use anyhow::Context;
use bytes::Bytes;
use std::io::Write;
use tether_core::{Config, Paths};
use tether_net::Request;

use super::Live;

pub async fn run(
    url: String,
    method: String,
    headers: Vec<String>,
    body: Option<String>,
    stream: bool,
) -> anyhow::Result<()> {
    let config = Config::load_or_default(&Paths::new())?;
    let url = if url.starts_with('/') {
        config.service.url(&url)
    } else {
        url
    };
    let method = reqwest::Method::from_bytes(method.to_uppercase().as_bytes())
        .with_context(|| format!("invalid method '{}'", method))?;

    let mut request = Request::new(method, &url);
    for header in &headers {
        let (name, value) = parse_header(header)?;
        request = request.header(name, value);
    }
    if let Some(body) = body {
        let value: serde_json::Value = serde_json::from_str(&body).context("body is not valid JSON")?;
        request = request.json(value);
    }

    let live = Live::open().await?;
    let result = send(&live, request, stream).await;
    live.shutdown().await;
    result
}

async fn send(live: &Live, request: Request, stream: bool) -> anyhow::Result<()> {
    live.ensure_logged_in().await?;
    let transport = live.session.transport()?;

    if stream {
        let mut stdout = std::io::stdout();
        let mut handler = |chunk: Bytes| {
            let _ = stdout.write_all(&chunk);
            let _ = stdout.flush();
        };
        transport.send_stream(request, &mut handler).await?;
    } else {
        let value = transport.send_json(request).await?;
        println!("{}", serde_json::to_string_pretty(&value)?);
    }
    Ok(())
}

fn parse_header(raw: &str) -> anyhow::Result<(&str, &str)> {
    let (name, value) = raw
        .split_once(':')
        .with_context(|| format!("header '{}' is not `Name: value`", raw))?;
    Ok((name.trim(), value.trim()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_header() {
        assert_eq!(parse_header("X-Test: a:b").unwrap(), ("X-Test", "a:b"));
        assert!(parse_header("no-colon").is_err());
    }
}
