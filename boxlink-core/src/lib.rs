//! boxlink-core: Authenticated session layer for a home gateway API
//!
//! This crate provides:
//! - Pairing and HMAC challenge login with automatic session renewal
//! - A realtime WebSocket channel with request/reply correlation
//! - Event subscriptions delivered through a bounded queue
//! - Chunked file uploads with short-write detection

pub mod client;
pub mod config;
pub mod credentials;
pub mod discovery;
pub mod envelope;
pub mod error;
pub mod events;
pub mod protocol;
pub mod realtime;
pub mod session;
pub mod upload;

pub use client::Client;
pub use config::{ClientConfig, TimingConfig};
pub use credentials::{Credentials, Session};
pub use discovery::{ApiVersion, discover};
pub use envelope::{ApiClient, SESSION_HEADER, SessionHeader};
pub use error::{Error, Result, ResultExt};
pub use events::{EventStream, Notification};
pub use protocol::{Action, EventDescription, ForcePolicy, Permissions};
pub use realtime::{Channel, Correlation};
pub use session::{AppDescription, SessionManager};
pub use upload::{UploadProgress, UploadRequest, UploadWriter};

/// Default API base URL on the local network
pub const DEFAULT_BASE_URL: &str = "http://mafreebox.freebox.fr/api/v8/";
