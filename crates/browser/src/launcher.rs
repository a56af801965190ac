//! Locate and launch a Chromium-family browser with remote debugging on.

use serde_json::Value;
use std::path::Path;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tether_core::{Error, Result};
use tokio::process::{Child, Command};
use tracing::info;

use crate::cdp::CdpClient;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrowserEngine {
    Chrome,
    Edge,
}

impl BrowserEngine {
    pub fn parse(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "edge" | "msedge" => Self::Edge,
            _ => Self::Chrome,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Chrome => "chrome",
            Self::Edge => "edge",
        }
    }
}

/// A launched browser process and a CDP connection to its first page.
pub struct LaunchedBrowser {
    pub child: Child,
    pub debug_port: u16,
    pub cdp: CdpClient,
}

pub async fn launch(engine: BrowserEngine, user_data_dir: &Path, headless: bool) -> Result<LaunchedBrowser> {
    let browser_path = find_browser_binary(engine)
        .ok_or_else(|| Error::Browser(format!("{} not found. Please install it.", engine.name())))?;

    std::fs::create_dir_all(user_data_dir)?;
    let debug_port = find_free_port().await?;
    let args = build_browser_args(debug_port, user_data_dir, headless);

    info!(
        port = debug_port,
        headless,
        browser = engine.name(),
        "Launching browser"
    );

    let child = Command::new(&browser_path)
        .args(&args)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| Error::Browser(format!("failed to launch {}: {}", engine.name(), e)))?;

    wait_for_cdp_ready(debug_port, 15).await?;
    let page_ws_url = get_page_ws_url(debug_port).await?;
    let cdp = CdpClient::connect(&page_ws_url).await?;

    info!(ws_url = %page_ws_url, "CDP connection established (page target)");

    Ok(LaunchedBrowser {
        child,
        debug_port,
        cdp,
    })
}

fn build_browser_args(debug_port: u16, user_data_dir: &Path, headless: bool) -> Vec<String> {
    let mut args = vec![
        format!("--remote-debugging-port={}", debug_port),
        format!("--user-data-dir={}", user_data_dir.display()),
        "--no-first-run".to_string(),
        "--no-default-browser-check".to_string(),
        "--disable-background-networking".to_string(),
        "--disable-extensions".to_string(),
        "--disable-sync".to_string(),
        "--password-store=basic".to_string(),
    ];
    if headless {
        args.push("--headless=new".to_string());
    }
    args.push("--window-size=1280,720".to_string());
    args.push("about:blank".to_string());
    args
}

pub fn find_browser_binary(engine: BrowserEngine) -> Option<String> {
    let candidates = match engine {
        BrowserEngine::Chrome => {
            if cfg!(target_os = "macos") {
                vec![
                    "/Applications/Google Chrome.app/Contents/MacOS/Google Chrome",
                    "/Applications/Chromium.app/Contents/MacOS/Chromium",
                ]
            } else if cfg!(target_os = "linux") {
                vec![
                    "google-chrome",
                    "google-chrome-stable",
                    "chromium",
                    "chromium-browser",
                    "/usr/bin/google-chrome",
                    "/usr/bin/chromium",
                ]
            } else {
                vec![
                    r"C:\Program Files\Google\Chrome\Application\chrome.exe",
                    r"C:\Program Files (x86)\Google\Chrome\Application\chrome.exe",
                ]
            }
        }
        BrowserEngine::Edge => {
            if cfg!(target_os = "macos") {
                vec!["/Applications/Microsoft Edge.app/Contents/MacOS/Microsoft Edge"]
            } else if cfg!(target_os = "linux") {
                vec!["microsoft-edge", "microsoft-edge-stable", "/usr/bin/microsoft-edge"]
            } else {
                vec![
                    r"C:\Program Files (x86)\Microsoft\Edge\Application\msedge.exe",
                    r"C:\Program Files\Microsoft\Edge\Application\msedge.exe",
                ]
            }
        }
    };

    for candidate in candidates {
        if Path::new(candidate).exists() {
            return Some(candidate.to_string());
        }
        if !candidate.contains('/') && !candidate.contains('\\') && which::which(candidate).is_ok() {
            return Some(candidate.to_string());
        }
    }
    None
}

async fn find_free_port() -> Result<u16> {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let port = listener.local_addr()?.port();
    drop(listener);
    Ok(port)
}

/// Poll `/json/version` until the browser answers.
async fn wait_for_cdp_ready(port: u16, timeout_secs: u64) -> Result<String> {
    let start = Instant::now();
    let timeout = Duration::from_secs(timeout_secs);
    let url = format!("http://127.0.0.1:{}/json/version", port);

    loop {
        if start.elapsed() > timeout {
            return Err(Error::Timeout(format!(
                "browser CDP not ready after {}s on port {}",
                timeout_secs, port
            )));
        }
        if let Ok(resp) = reqwest::get(&url).await {
            if let Ok(body) = resp.json::<Value>().await {
                if let Some(ws_url) = body.get("webSocketDebuggerUrl").and_then(|v| v.as_str()) {
                    return Ok(ws_url.to_string());
                }
            }
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
}

/// WebSocket URL of the first page target listed at `/json/list`.
pub async fn get_page_ws_url(port: u16) -> Result<String> {
    get_page_ws_url_from(&format!("http://127.0.0.1:{}", port)).await
}

async fn get_page_ws_url_from(base: &str) -> Result<String> {
    let url = format!("{}/json/list", base);

    for attempt in 0..10 {
        if attempt > 0 {
            tokio::time::sleep(Duration::from_millis(300)).await;
        }
        let Ok(resp) = reqwest::get(&url).await else {
            continue;
        };
        let Ok(targets) = resp.json::<Vec<Value>>().await else {
            continue;
        };
        let page = targets
            .iter()
            .filter(|t| t.get("type").and_then(|v| v.as_str()) == Some("page"))
            .find_map(|t| t.get("webSocketDebuggerUrl").and_then(|v| v.as_str()));
        if let Some(ws_url) = page {
            return Ok(ws_url.to_string());
        }
    }

    Err(Error::Browser("no page target found after retries".to_string()))
}
