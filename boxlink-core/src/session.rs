//! Device pairing and session login
//!
//! Pairing exchanges an app id for a long-lived private token once a human
//! approves the request on the device. Login turns that private token into
//! a short-lived session with a challenge-response:
//! `password = hex(HMAC-SHA1(key = private token, message = challenge))`.
//!
//! Credential state sits behind one async mutex. The decision to re-login
//! and the write of the new session happen under the same guard, so two
//! callers never both log in for the same expiry.

use chrono::Utc;
use hmac::{Hmac, Mac};
use reqwest::Method;
use sha1::Sha1;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::TimingConfig;
use crate::credentials::{Credentials, Session};
use crate::envelope::{ApiClient, SessionHeader};
use crate::error::{Error, Result, ResultExt};
use crate::protocol::{
    AuthorizationHandshake, AuthorizationStatus, AuthorizeGrant, AuthorizeRequest, LoginChallenge,
    Permissions, SessionGrant, SessionRequest,
};

/// App metadata shown on the device while pairing
#[derive(Debug, Clone)]
pub struct AppDescription {
    pub app_name: String,
    pub app_version: String,
    pub device_name: String,
}

pub struct SessionManager {
    api: ApiClient,
    timing: TimingConfig,
    credentials: Mutex<Credentials>,
}

impl SessionManager {
    pub fn new(api: ApiClient, credentials: Credentials, timing: TimingConfig) -> Self {
        Self {
            api,
            timing,
            credentials: Mutex::new(credentials),
        }
    }

    pub fn api(&self) -> &ApiClient {
        &self.api
    }

    /// Snapshot of the current credential state
    pub async fn credentials(&self) -> Credentials {
        self.credentials.lock().await.clone()
    }

    /// Request pairing and poll until the device grants or refuses it
    ///
    /// Returns the private token to store for later logins. The whole poll
    /// loop runs under the configured hard deadline. `cancel` interrupts the
    /// pairing request as well as the poll.
    pub async fn authorize(
        &self,
        app: &AppDescription,
        cancel: &CancellationToken,
    ) -> Result<String> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Error::Cancelled),
            result = self.request_authorization(app) => result,
        }
    }

    async fn request_authorization(&self, app: &AppDescription) -> Result<String> {
        let app_id = self.credentials.lock().await.app_id()?.to_string();

        let request = AuthorizeRequest {
            app_id: &app_id,
            app_name: &app.app_name,
            app_version: &app.app_version,
            device_name: &app.device_name,
        };
        let grant: AuthorizeGrant = self
            .api
            .call(Method::POST, "login/authorize/", Some(&request), None)
            .await
            .context("request authorization")?;

        info!(track_id = grant.track_id, "Authorization requested, waiting for approval on the device");

        let timeout = self.timing.authorize_timeout();
        match tokio::time::timeout(timeout, self.poll_authorization(grant.track_id)).await {
            Err(_) => Err(Error::AuthorizationTimeout(timeout)),
            Ok(result) => {
                result?;
                info!(track_id = grant.track_id, "Authorization granted");
                Ok(grant.app_token)
            }
        }
    }

    async fn poll_authorization(&self, track_id: i64) -> Result<()> {
        let path = format!("login/authorize/{}", track_id);
        let retry_delay = self.timing.authorize_retry_delay();

        loop {
            let handshake: AuthorizationHandshake = self
                .api
                .call::<(), _>(Method::GET, &path, None, None)
                .await
                .context("poll authorization status")?;

            match handshake.status {
                AuthorizationStatus::Pending => {
                    debug!(track_id, ?retry_delay, "Authorization pending");
                    tokio::time::sleep(retry_delay).await;
                }
                AuthorizationStatus::Granted => return Ok(()),
                other => return Err(Error::UnexpectedAuthorizationStatus(other.to_string())),
            }
        }
    }

    /// Open a new session and return the permissions it carries
    ///
    /// Bounded by the HTTP client's request timeout only.
    pub async fn login(&self) -> Result<Permissions> {
        let mut credentials = self.credentials.lock().await;
        let (permissions, _) = self.login_locked(&mut credentials).await?;
        Ok(permissions)
    }

    /// Return a header for a valid session, logging in first if needed
    pub async fn ensure_session(&self) -> Result<SessionHeader> {
        let mut credentials = self.credentials.lock().await;

        if let Some(session) = credentials.valid_session(Utc::now()) {
            return Ok(SessionHeader::new(session.token.clone()));
        }

        debug!("No valid session, logging in");
        let (_, header) = self
            .login_locked(&mut credentials)
            .await
            .context("renew session")?;
        Ok(header)
    }

    /// [`ensure_session`](Self::ensure_session) that gives up when `cancel` fires
    ///
    /// A login interrupted this way leaves the stored session untouched.
    pub async fn ensure_session_or_cancel(&self, cancel: &CancellationToken) -> Result<SessionHeader> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Error::Cancelled),
            header = self.ensure_session() => header,
        }
    }

    /// Close the current session on the device and forget it
    pub async fn logout(&self) -> Result<()> {
        let mut credentials = self.credentials.lock().await;
        let Some(session) = credentials.valid_session(Utc::now()).cloned() else {
            credentials.replace_session(None);
            return Ok(());
        };

        let header = SessionHeader::new(session.token);
        let result = self
            .api
            .call_optional::<(), serde_json::Value>(Method::POST, "login/logout/", None, Some(&header))
            .await
            .context("logout");

        credentials.replace_session(None);
        info!("Session closed");
        result.map(|_| ())
    }

    async fn login_locked(
        &self,
        credentials: &mut Credentials,
    ) -> Result<(Permissions, SessionHeader)> {
        let app_id = credentials.app_id()?.to_string();
        let private_token = credentials.private_token()?.to_string();

        let challenge: LoginChallenge = self
            .api
            .call::<(), _>(Method::GET, "login/", None, None)
            .await
            .context("fetch login challenge")?;

        let password = derive_password(&private_token, &challenge.challenge)?;

        let request = SessionRequest {
            app_id: &app_id,
            password: &password,
        };
        let grant: SessionGrant = self
            .api
            .call(Method::POST, "login/session/", Some(&request), None)
            .await
            .context("open session")?;

        let header = SessionHeader::new(grant.session_token.clone());
        let session = Session::new(grant.session_token, Utc::now(), self.timing.session_ttl());
        info!(expires_at = %session.expires_at, "Logged in");
        credentials.replace_session(Some(session));

        Ok((grant.permissions, header))
    }
}

/// Hex-encoded HMAC-SHA1 of the challenge keyed by the private token
pub fn derive_password(private_token: &str, challenge: &str) -> Result<String> {
    let mut mac = Hmac::<Sha1>::new_from_slice(private_token.as_bytes())?;
    mac.update(challenge.as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}
