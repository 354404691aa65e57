//! Device client handle
//!
//! Owns the credential state for one device. Every session-scoped call
//! starts with an explicit [`Client::ensure_session`] step that returns the
//! header to attach, logging in again when the session is absent or
//! expired.

use reqwest::Method;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::io::AsyncRead;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::config::ClientConfig;
use crate::credentials::Credentials;
use crate::envelope::{ApiClient, SessionHeader};
use crate::error::{Error, Result, ResultExt};
use crate::events::{self, EventStream};
use crate::protocol::{EventDescription, Permissions};
use crate::realtime::{self, Channel};
use crate::session::{AppDescription, SessionManager};
use crate::upload::{UploadRequest, UploadWriter};

pub struct Client {
    config: ClientConfig,
    sessions: SessionManager,
}

impl Client {
    pub fn new(config: ClientConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()?;
        let api = ApiClient::new(&config.base_url, http);
        let credentials = Credentials::new(config.app_id.clone(), config.private_token.clone());
        let sessions = SessionManager::new(api, credentials, config.timing.clone());

        Ok(Self { config, sessions })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn api(&self) -> &ApiClient {
        self.sessions.api()
    }

    pub async fn credentials(&self) -> Credentials {
        self.sessions.credentials().await
    }

    /// Pair with the device; returns the private token to keep
    pub async fn authorize(
        &self,
        app: &AppDescription,
        cancel: &CancellationToken,
    ) -> Result<String> {
        self.sessions.authorize(app, cancel).await
    }

    pub async fn login(&self) -> Result<Permissions> {
        self.sessions.login().await
    }

    pub async fn logout(&self) -> Result<()> {
        self.sessions.logout().await
    }

    pub async fn ensure_session(&self) -> Result<SessionHeader> {
        self.sessions.ensure_session().await
    }

    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let session = self.ensure_session().await?;
        self.api()
            .call::<(), T>(Method::GET, path, None, Some(&session))
            .await
    }

    pub async fn post<B, T>(&self, path: &str, body: &B) -> Result<T>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let session = self.ensure_session().await?;
        self.api()
            .call(Method::POST, path, Some(body), Some(&session))
            .await
    }

    pub async fn put<B, T>(&self, path: &str, body: &B) -> Result<T>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let session = self.ensure_session().await?;
        self.api()
            .call(Method::PUT, path, Some(body), Some(&session))
            .await
    }

    /// DELETE; the result is optional since most deletions return none
    pub async fn delete<T: DeserializeOwned>(&self, path: &str) -> Result<Option<T>> {
        let session = self.ensure_session().await?;
        self.api()
            .call_optional::<(), T>(Method::DELETE, path, None, Some(&session))
            .await
    }

    /// Dial the socket at `path` with a valid session header
    ///
    /// `cancel` interrupts both the login and the dial.
    pub async fn open_channel(&self, path: &str, cancel: &CancellationToken) -> Result<Channel> {
        let session = self
            .sessions
            .ensure_session_or_cancel(cancel)
            .await
            .context("open channel")?;
        let url = realtime::websocket_url(self.api().base_url(), path)?;
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Error::Cancelled),
            channel = Channel::connect(&url, &session) => channel,
        }
    }

    /// Subscribe to `events`; cancel `cancel` to end the subscription
    pub async fn listen_events(
        &self,
        events: &[EventDescription],
        cancel: CancellationToken,
    ) -> Result<EventStream> {
        let channel = self.open_channel(realtime::EVENT_PATH, &cancel).await?;
        events::subscribe(channel, events, cancel).await
    }

    /// Start an upload and return its writer
    pub async fn start_upload(
        &self,
        request: &UploadRequest,
        cancel: CancellationToken,
    ) -> Result<UploadWriter> {
        // Fail on credentials before dialing
        self.sessions
            .ensure_session_or_cancel(&cancel)
            .await
            .context("start upload")?;
        let channel = self.open_channel(realtime::UPLOAD_PATH, &cancel).await?;
        UploadWriter::start(channel, request, cancel).await
    }

    /// Upload everything `reader` yields, always closing the writer
    ///
    /// A write failure wins over a close failure; the latter is logged.
    pub async fn upload_from<R>(
        &self,
        request: &UploadRequest,
        reader: &mut R,
        chunk_size: usize,
        cancel: CancellationToken,
    ) -> Result<u64>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let writer = self.start_upload(request, cancel).await?;
        let copied = writer.copy_from(reader, chunk_size).await;
        let closed = writer.close().await;

        match (copied, closed) {
            (Ok(total), Ok(())) => Ok(total),
            (Ok(_), Err(e)) => Err(e),
            (Err(e), Ok(())) => Err(e),
            (Err(e), Err(close_err)) => {
                warn!(error = %close_err, "Upload close failed after write error");
                Err(e)
            }
        }
    }
}
