//! Shared HTTP plumbing: default headers and the reqwest client.

use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, USER_AGENT};

use flagstream_core::error::{FlagstreamError, Result};

use crate::config::Config;

const TAGS_HEADER: &str = "X-LaunchDarkly-Tags";
const WRAPPER_HEADER: &str = "X-LaunchDarkly-Wrapper";

/// Header set and timeouts shared by every request the SDK makes.
#[derive(Debug, Clone)]
pub(crate) struct HttpProperties {
    headers: HeaderMap,
    proxy_url: Option<String>,
    connect_timeout: std::time::Duration,
    read_timeout: std::time::Duration,
}

impl HttpProperties {
    pub(crate) fn from_config(config: &Config) -> Result<Self> {
        let mut headers = HeaderMap::new();
        let auth = HeaderValue::from_str(&config.sdk_key).map_err(|_| {
            FlagstreamError::InvalidConfig {
                message: "sdk_key cannot be used as an Authorization header".to_string(),
            }
        })?;
        headers.insert(AUTHORIZATION, auth);
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!(
                "FlagstreamServerSdk/{}",
                env!("CARGO_PKG_VERSION")
            ))
            .map_err(|_| FlagstreamError::InvalidConfig {
                message: "invalid user-agent".to_string(),
            })?,
        );
        if let Some(tags) = config.application_info.tag_header() {
            if let Ok(value) = HeaderValue::from_str(&tags) {
                headers.insert(TAGS_HEADER, value);
            }
        }
        if let Some(wrapper) = config.wrapper_info.header() {
            if let Ok(value) = HeaderValue::from_str(&wrapper) {
                headers.insert(WRAPPER_HEADER, value);
            }
        }
        Ok(Self {
            headers,
            proxy_url: config.proxy_url.clone(),
            connect_timeout: config.connect_timeout,
            read_timeout: config.read_timeout,
        })
    }

    pub(crate) fn headers(&self) -> HeaderMap {
        self.headers.clone()
    }

    /// A client for request/response calls (polling, events).
    pub(crate) fn client(&self) -> Result<reqwest::Client> {
        let builder = reqwest::Client::builder()
            .connect_timeout(self.connect_timeout)
            .timeout(self.read_timeout);
        self.finish(builder)
    }

    /// A client for the long-lived event stream: same connect timeout, no
    /// overall request deadline.
    pub(crate) fn streaming_client(&self) -> Result<reqwest::Client> {
        let builder = reqwest::Client::builder().connect_timeout(self.connect_timeout);
        self.finish(builder)
    }

    fn finish(&self, mut builder: reqwest::ClientBuilder) -> Result<reqwest::Client> {
        if let Some(url) = &self.proxy_url {
            let proxy = reqwest::Proxy::all(url).map_err(|e| FlagstreamError::InvalidConfig {
                message: format!("invalid proxy URL: {e}"),
            })?;
            builder = builder.proxy(proxy);
        }
        builder.build().map_err(|e| FlagstreamError::InvalidConfig {
            message: format!("failed to build HTTP client: {e}"),
        })
    }
}

/// Append the optional payload-filter query parameter to a request URL.
pub(crate) fn with_filter(url: String, filter: Option<&str>) -> String {
    match filter {
        Some(name) => {
            let separator = if url.contains('?') { '&' } else { '?' };
            format!("{url}{separator}filter={name}")
        }
        None => url,
    }
}
