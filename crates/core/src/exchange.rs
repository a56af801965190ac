use futures::future::BoxFuture;
use std::collections::HashMap;
use std::fmt;

use crate::error::Result;

/// Lazily evaluated response body. Nothing is fetched until awaited.
pub type BodyLoader = BoxFuture<'static, Result<Vec<u8>>>;

/// A completed request/response pair observed on the driver's own traffic.
pub struct Exchange {
    pub url: String,
    /// Response headers with lowercased names.
    pub headers: HashMap<String, String>,
    pub body: BodyLoader,
}

impl Exchange {
    pub fn new<I, K, V>(url: &str, headers: I, body: BodyLoader) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<String>,
    {
        let headers = headers
            .into_iter()
            .map(|(k, v)| (k.as_ref().to_ascii_lowercase(), v.into()))
            .collect();
        Self {
            url: url.to_string(),
            headers,
            body,
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(|s| s.as_str())
    }

    pub fn content_type(&self) -> Option<&str> {
        self.header("content-type")
    }

    /// True for `application/json` and any `+json` structured suffix,
    /// ignoring parameters such as `charset`.
    pub fn is_json(&self) -> bool {
        let Some(ct) = self.content_type() else {
            return false;
        };
        let essence = ct.split(';').next().unwrap_or("").trim().to_ascii_lowercase();
        essence == "application/json" || essence.ends_with("+json")
    }
}

impl fmt::Debug for Exchange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Exchange")
            .field("url", &self.url)
            .field("headers", &self.headers)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;

    fn exchange(content_type: &str) -> Exchange {
        Exchange::new(
            "https://example.com/x",
            [("Content-Type", content_type)],
            async { Ok(Vec::new()) }.boxed(),
        )
    }

    #[test]
    fn test_is_json_variants() {
        assert!(exchange("application/json").is_json());
        assert!(exchange("Application/JSON; charset=utf-8").is_json());
        assert!(exchange("application/problem+json").is_json());
        assert!(!exchange("text/html").is_json());
        assert!(!exchange("text/event-stream").is_json());
    }

    #[test]
    fn test_missing_content_type_is_not_json() {
        let ex = Exchange::new(
            "https://example.com/x",
            Vec::<(String, String)>::new(),
            async { Ok(Vec::new()) }.boxed(),
        );
        assert!(!ex.is_json());
    }
}
