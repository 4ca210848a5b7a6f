//! Test configuration discovery
// (c) 2024 Ross Younger

use std::fmt::Display;

use anyhow::{ensure, Context as _, Result};
use http::{Method, Request, Uri};
use http_body_util::BodyExt as _;
use serde::Deserialize;
use tracing::debug;

use crate::transport::{Dialer, Payload};

/// The URLs a responsiveness server directs us to use
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Urls {
    /// Target for both probe kinds; returns a tiny response
    #[serde(default)]
    pub small_https_download_url: String,
    /// Download load; serves a very large payload
    #[serde(default)]
    pub large_https_download_url: String,
    /// Upload load; accepts an unbounded request body
    #[serde(default)]
    pub upload_url: String,
}

/// A validated test configuration, fetched from the discovery endpoint.
/// Immutable once validated; freely shared.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Configuration {
    /// Test target URLs
    #[serde(default)]
    pub urls: Urls,
    /// Where this configuration came from
    #[serde(default)]
    pub source: String,
}

impl Configuration {
    /// Fetches the configuration document from
    /// `https://<host_port>/<path>` and parses it.
    ///
    /// The result has not yet been validated; call [`validate`](Self::validate).
    pub async fn fetch(dialer: &Dialer, host_port: &str, path: &str) -> Result<Self> {
        let url: Uri = format!("https://{host_port}/{path}")
            .parse()
            .with_context(|| format!("invalid configuration endpoint {host_port}/{path}"))?;
        debug!("fetching configuration from {url}");

        let connection = dialer
            .connect(&url)
            .await
            .with_context(|| format!("connecting to configuration endpoint {url}"))?;
        let mut send_request = connection.send_request();
        send_request
            .ready()
            .await
            .context("configuration connection failed")?;
        let request = Request::builder()
            .method(Method::GET)
            .uri(url.clone())
            .body(Payload::Empty)?;
        let response = send_request
            .send_request(request)
            .await
            .with_context(|| format!("fetching configuration from {url}"))?;
        ensure!(
            response.status().is_success(),
            "configuration endpoint {url} returned status {}",
            response.status()
        );
        let body = response
            .into_body()
            .collect()
            .await
            .with_context(|| format!("reading configuration from {url}"))?
            .to_bytes();

        let mut config: Configuration = serde_json::from_slice(&body)
            .with_context(|| format!("parsing configuration from {url}"))?;
        if config.source.is_empty() {
            config.source = url.to_string();
        }
        Ok(config)
    }

    /// Checks that all three URLs are present and absolute
    pub fn validate(&self) -> Result<()> {
        require_absolute("small_https_download_url", &self.urls.small_https_download_url)?;
        require_absolute("large_https_download_url", &self.urls.large_https_download_url)?;
        require_absolute("upload_url", &self.urls.upload_url)?;
        Ok(())
    }
}

fn require_absolute(name: &str, value: &str) -> Result<()> {
    ensure!(!value.is_empty(), "{name} is empty");
    let uri: Uri = value
        .parse()
        .ok()
        .with_context(|| format!("{name} is not a valid URL: {value}"))?;
    ensure!(
        uri.scheme().is_some() && uri.authority().is_some(),
        "{name} is not an absolute URL: {value}"
    );
    Ok(())
}

impl Display for Configuration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Configuration (from {}): small={} large={} upload={}",
            self.source,
            self.urls.small_https_download_url,
            self.urls.large_https_download_url,
            self.urls.upload_url
        )
    }
}

#[cfg(test)]
mod tests {
    use super::Configuration;

    fn config(small: &str, large: &str, upload: &str) -> Configuration {
        let mut c = Configuration::default();
        c.urls.small_https_download_url = small.into();
        c.urls.large_https_download_url = large.into();
        c.urls.upload_url = upload.into();
        c
    }

    #[test]
    fn valid_configuration() {
        let c = config(
            "https://example.com/small",
            "https://example.com/large",
            "https://example.com/upload",
        );
        assert!(c.validate().is_ok());
    }

    #[test]
    fn missing_upload_url_is_invalid() {
        let c = config("https://example.com/small", "https://example.com/large", "");
        let err = c.validate().expect_err("should fail").to_string();
        assert!(err.contains("upload_url"), "unhelpful error: {err}");
    }

    #[test]
    fn relative_url_is_invalid() {
        let c = config(
            "https://example.com/small",
            "/large",
            "https://example.com/upload",
        );
        let err = c.validate().expect_err("should fail").to_string();
        assert!(err.contains("large_https_download_url"), "unhelpful error: {err}");
    }

    #[test]
    fn parses_discovery_document() {
        let json = r#"{
            "urls": {
                "small_https_download_url": "https://h/small",
                "large_https_download_url": "https://h/large",
                "upload_url": "https://h/upload"
            },
            "source": "unit-test"
        }"#;
        let c: Configuration = serde_json::from_str(json).expect("parse");
        assert_eq!(c.source, "unit-test");
        assert_eq!(c.urls.small_https_download_url, "https://h/small");
        assert!(c.validate().is_ok());
    }
}
