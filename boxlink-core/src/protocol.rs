//! Wire types for the device API
//!
//! HTTP bodies for pairing and login, and the JSON messages exchanged over
//! the realtime socket. Socket replies all share [`SocketEnvelope`]; the
//! `action` tag says what kind of message it is and `request_id` ties it
//! back to the request that caused it.

use std::collections::BTreeMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Pairing request body
#[derive(Debug, Clone, Serialize)]
pub struct AuthorizeRequest<'a> {
    pub app_id: &'a str,
    pub app_name: &'a str,
    pub app_version: &'a str,
    pub device_name: &'a str,
}

/// Pairing request reply
#[derive(Debug, Clone, Deserialize)]
pub struct AuthorizeGrant {
    pub app_token: String,
    pub track_id: i64,
}

/// State of a pending pairing as reported by the device
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(from = "String")]
pub enum AuthorizationStatus {
    Pending,
    Granted,
    Denied,
    Unknown(String),
}

impl From<String> for AuthorizationStatus {
    fn from(status: String) -> Self {
        match status.as_str() {
            "pending" => Self::Pending,
            "granted" => Self::Granted,
            "denied" => Self::Denied,
            _ => Self::Unknown(status),
        }
    }
}

impl std::fmt::Display for AuthorizationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => f.write_str("pending"),
            Self::Granted => f.write_str("granted"),
            Self::Denied => f.write_str("denied"),
            Self::Unknown(status) => f.write_str(status),
        }
    }
}

/// Pairing poll reply
#[derive(Debug, Clone, Deserialize)]
pub struct AuthorizationHandshake {
    pub status: AuthorizationStatus,
    #[serde(default)]
    pub challenge: Option<String>,
}

/// Login challenge
#[derive(Debug, Clone, Deserialize)]
pub struct LoginChallenge {
    pub challenge: String,
    #[serde(default)]
    pub password_salt: String,
    #[serde(default)]
    pub password_set: bool,
    #[serde(default)]
    pub logged_in: bool,
}

/// Session request body
#[derive(Debug, Clone, Serialize)]
pub struct SessionRequest<'a> {
    pub app_id: &'a str,
    pub password: &'a str,
}

/// Permissions granted to the app
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Permissions(pub BTreeMap<String, bool>);

impl Permissions {
    pub fn has(&self, name: &str) -> bool {
        self.0.get(name).copied().unwrap_or(false)
    }
}

/// Session request reply
#[derive(Debug, Clone, Deserialize)]
pub struct SessionGrant {
    pub session_token: String,
    #[serde(default)]
    pub challenge: Option<String>,
    #[serde(default)]
    pub permissions: Permissions,
}

/// Socket message kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Register,
    Notification,
    UploadStart,
    UploadData,
    UploadFinalize,
    UploadCancel,
}

impl Action {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Register => "register",
            Self::Notification => "notification",
            Self::UploadStart => "upload_start",
            Self::UploadData => "upload_data",
            Self::UploadFinalize => "upload_finalize",
            Self::UploadCancel => "upload_cancel",
        }
    }
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What to do when the upload target already exists
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ForcePolicy {
    Overwrite,
    Resume,
}

/// Messages sent from client to device over the socket
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum SocketRequest {
    Register {
        request_id: i64,
        events: Vec<String>,
    },

    UploadStart {
        request_id: i64,
        size: u64,
        #[serde(with = "base64_str")]
        dirname: String,
        filename: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        force: Option<ForcePolicy>,
    },

    UploadFinalize { request_id: i64 },

    UploadCancel { request_id: i64 },
}

impl SocketRequest {
    pub fn action(&self) -> Action {
        match self {
            Self::Register { .. } => Action::Register,
            Self::UploadStart { .. } => Action::UploadStart,
            Self::UploadFinalize { .. } => Action::UploadFinalize,
            Self::UploadCancel { .. } => Action::UploadCancel,
        }
    }

    pub fn request_id(&self) -> i64 {
        match self {
            Self::Register { request_id, .. }
            | Self::UploadStart { request_id, .. }
            | Self::UploadFinalize { request_id }
            | Self::UploadCancel { request_id } => *request_id,
        }
    }
}

/// Any message received from the device over the socket
#[derive(Debug, Clone, Deserialize)]
pub struct SocketEnvelope {
    #[serde(default)]
    pub request_id: Option<i64>,
    pub action: String,
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub result: Option<serde_json::Value>,
    #[serde(default)]
    pub error_code: Option<String>,
    #[serde(default)]
    pub msg: Option<String>,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub event: Option<String>,
}

impl SocketEnvelope {
    /// Fail with the server's code and message when `success` is false
    pub fn check(self) -> Result<Self> {
        if self.success {
            Ok(self)
        } else {
            Err(Error::Api {
                error_code: self.error_code.unwrap_or_default(),
                msg: self.msg.unwrap_or_default(),
            })
        }
    }

    /// Decode the result payload into `T`; an absent payload decodes as JSON null
    pub fn decode_result<T: DeserializeOwned>(&self) -> Result<T> {
        let value = self.result.clone().unwrap_or(serde_json::Value::Null);
        Ok(serde_json::from_value(value)?)
    }
}

/// `upload_data` acknowledgement payload
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct UploadProgressReply {
    pub total_len: u64,
    #[serde(default)]
    pub complete: bool,
    #[serde(default)]
    pub cancelled: bool,
}

/// A named event published by one device subsystem
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EventDescription {
    pub source: String,
    pub name: String,
}

impl EventDescription {
    pub fn new(source: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            name: name.into(),
        }
    }

    /// `"{source}_{name}"` as the register action expects it
    pub fn wire_name(&self) -> String {
        format!("{}_{}", self.source, self.name)
    }
}

/// Helper module for base64 encoding of strings in JSON
mod base64_str {
    use serde::Serializer;

    pub fn serialize<S>(value: &str, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        use base64::Engine;
        serializer.serialize_str(&base64::engine::general_purpose::STANDARD.encode(value))
    }
}
