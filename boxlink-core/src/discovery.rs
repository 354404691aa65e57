//! API discovery
//!
//! The device publishes its API location at `{host}/api_version`, outside
//! the usual envelope.

use serde::Deserialize;
use tracing::debug;

use crate::error::{Error, Result, ResultExt};

#[derive(Debug, Clone, Deserialize)]
pub struct ApiVersion {
    /// Path prefix of the API, e.g. `/api/`
    pub api_base_url: String,
    /// Dotted version, e.g. `8.2`
    pub api_version: String,
    #[serde(default)]
    pub device_name: Option<String>,
    #[serde(default)]
    pub device_type: Option<String>,
    #[serde(default)]
    pub uid: Option<String>,
    #[serde(default)]
    pub api_domain: Option<String>,
    #[serde(default)]
    pub https_available: bool,
    #[serde(default)]
    pub https_port: Option<u16>,
}

impl ApiVersion {
    pub fn major_version(&self) -> Result<u32> {
        self.api_version
            .split('.')
            .next()
            .and_then(|major| major.parse().ok())
            .ok_or_else(|| Error::InvalidEndpoint(format!("api_version {:?}", self.api_version)))
    }

    /// Versioned API base URL on `host_url`
    pub fn base_url(&self, host_url: &str) -> Result<String> {
        Ok(format!(
            "{}/{}/v{}/",
            host_url.trim_end_matches('/'),
            self.api_base_url.trim_matches('/'),
            self.major_version()?
        ))
    }
}

/// Fetch the API description published by the device at `host_url`
pub async fn discover(client: &reqwest::Client, host_url: &str) -> Result<ApiVersion> {
    let url = format!("{}/api_version", host_url.trim_end_matches('/'));
    debug!(%url, "Discovering API");

    let resp = client.get(&url).send().await.context("discover api")?;
    let status = resp.status();
    if !status.is_success() {
        return Err(Error::ServerStatus(status.as_u16())).context("discover api");
    }

    let bytes = resp.bytes().await.context("discover api")?;
    serde_json::from_slice(&bytes).context("discover api")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn version(api_version: &str) -> ApiVersion {
        serde_json::from_value(serde_json::json!({
            "api_base_url": "/api/",
            "api_version": api_version,
            "device_name": "Freebox Server",
            "https_available": true,
            "https_port": 443
        }))
        .unwrap()
    }

    #[test]
    fn test_base_url() {
        let v = version("8.2");
        assert_eq!(v.major_version().unwrap(), 8);
        assert_eq!(
            v.base_url("http://192.0.2.1/").unwrap(),
            "http://192.0.2.1/api/v8/"
        );
    }

    #[test]
    fn test_malformed_version() {
        let v = version("latest");
        assert!(matches!(v.base_url("http://192.0.2.1"), Err(Error::InvalidEndpoint(_))));
    }
}
