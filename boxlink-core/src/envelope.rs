//! HTTP envelope codec
//!
//! Every device reply is wrapped as `{success, result, error_code, msg}`.
//! [`ApiClient`] issues a verb against the API base URL, optionally with a
//! session header, and unwraps the envelope into a typed result.

use reqwest::{Client, Method};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};

/// Name of the header carrying the session token
pub const SESSION_HEADER: &str = "X-Fbx-App-Auth";

/// Generic reply envelope
#[derive(Debug, Deserialize)]
pub struct ApiEnvelope<T> {
    pub success: bool,
    pub result: Option<T>,
    #[serde(default)]
    pub error_code: Option<String>,
    #[serde(default)]
    pub msg: Option<String>,
}

impl<T> ApiEnvelope<T> {
    /// Check the success flag, keeping the server's code and message verbatim
    pub fn into_result(self) -> Result<Option<T>> {
        if self.success {
            Ok(self.result)
        } else {
            Err(Error::Api {
                error_code: self.error_code.unwrap_or_default(),
                msg: self.msg.unwrap_or_default(),
            })
        }
    }
}

/// Session token ready to be attached to a request
#[derive(Clone)]
pub struct SessionHeader {
    token: String,
}

impl SessionHeader {
    pub(crate) fn new(token: String) -> Self {
        Self { token }
    }

    pub fn name(&self) -> &'static str {
        SESSION_HEADER
    }

    pub fn value(&self) -> &str {
        &self.token
    }
}

impl std::fmt::Debug for SessionHeader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHeader").field("name", &SESSION_HEADER).finish()
    }
}

/// Device HTTP client bound to one API base URL
#[derive(Debug, Clone)]
pub struct ApiClient {
    client: Client,
    base_url: String,
}

impl ApiClient {
    pub fn new(base_url: &str, client: Client) -> Self {
        Self {
            client,
            base_url: normalize_base_url(base_url),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Absolute URL for a path relative to the API base
    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path.trim_start_matches('/'))
    }

    /// Issue a call and return the decoded `result`, which must be present
    pub async fn call<B, T>(
        &self,
        method: Method,
        path: &str,
        body: Option<&B>,
        session: Option<&SessionHeader>,
    ) -> Result<T>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        self.call_optional(method, path, body, session)
            .await?
            .ok_or(Error::MissingResult)
    }

    /// Issue a call whose `result` may be absent
    pub async fn call_optional<B, T>(
        &self,
        method: Method,
        path: &str,
        body: Option<&B>,
        session: Option<&SessionHeader>,
    ) -> Result<Option<T>>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let url = self.url(path);
        debug!(%method, %url, "device request");

        let mut req = self.client.request(method, &url);
        if let Some(header) = session {
            req = req.header(header.name(), header.value());
        }
        if let Some(body) = body {
            req = req.json(body);
        }

        let resp = req.send().await?;
        let status = resp.status();
        if status.is_server_error() {
            return Err(Error::ServerStatus(status.as_u16()));
        }

        let bytes = resp.bytes().await?;
        decode_envelope(&bytes)
    }
}

/// Decode an envelope body and unwrap its result
pub fn decode_envelope<T: DeserializeOwned>(bytes: &[u8]) -> Result<Option<T>> {
    // Check the flag before typing the result so a failed call never
    // turns into a decode error
    let envelope: ApiEnvelope<serde_json::Value> = serde_json::from_slice(bytes)?;
    match envelope.into_result()? {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(value) => Ok(Some(serde_json::from_value(value)?)),
    }
}

fn normalize_base_url(base_url: &str) -> String {
    format!("{}/", base_url.trim_end_matches('/'))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Challenge {
        challenge: String,
    }

    #[test]
    fn test_url_normalization() {
        let api = ApiClient::new("http://localhost:8080/api/v8", Client::new());
        assert_eq!(api.base_url(), "http://localhost:8080/api/v8/");
        assert_eq!(api.url("login/"), "http://localhost:8080/api/v8/login/");
        assert_eq!(api.url("/login/session/"), "http://localhost:8080/api/v8/login/session/");
    }

    #[test]
    fn test_decode_success_envelope() {
        let body = br#"{"success":true,"result":{"challenge":"abc"}}"#;
        let result: Option<Challenge> = decode_envelope(body).unwrap();
        assert_eq!(
            result,
            Some(Challenge {
                challenge: "abc".to_string()
            })
        );
    }

    #[test]
    fn test_decode_failure_keeps_server_fields() {
        let body = br#"{"success":false,"error_code":"invalid_token","msg":"unknown app token"}"#;
        let err = decode_envelope::<Challenge>(body).unwrap_err();
        match err {
            Error::Api { error_code, msg } => {
                assert_eq!(error_code, "invalid_token");
                assert_eq!(msg, "unknown app token");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_decode_success_without_result() {
        let result: Option<Challenge> = decode_envelope(br#"{"success":true}"#).unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn test_decode_malformed_body() {
        let err = decode_envelope::<Challenge>(b"<html>").unwrap_err();
        assert!(matches!(err, Error::Decode(_)));
    }
}
