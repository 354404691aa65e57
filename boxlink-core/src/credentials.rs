//! Credential state held by one client
//!
//! The session is only meaningful alongside the app id and private token
//! that produced it. It is replaced as a whole, never edited in place.

use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::error::{Error, Result};

/// A time-bounded session obtained from a challenge-response login
#[derive(Clone, PartialEq, Eq)]
pub struct Session {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

impl Session {
    pub fn new(token: String, issued_at: DateTime<Utc>, ttl: Duration) -> Self {
        let ttl = chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX);
        Self {
            token,
            expires_at: issued_at.checked_add_signed(ttl).unwrap_or(DateTime::<Utc>::MAX_UTC),
        }
    }

    /// Valid strictly before `expires_at`
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
    }
}

// Keep the token out of logs
impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("token", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

#[derive(Clone, Default)]
pub struct Credentials {
    app_id: Option<String>,
    private_token: Option<String>,
    session: Option<Session>,
}

impl Credentials {
    pub fn new(app_id: Option<String>, private_token: Option<String>) -> Self {
        Self {
            app_id,
            private_token,
            session: None,
        }
    }

    pub fn app_id(&self) -> Result<&str> {
        self.app_id.as_deref().ok_or(Error::AppIdNotSet)
    }

    pub fn private_token(&self) -> Result<&str> {
        self.private_token.as_deref().ok_or(Error::PrivateTokenNotSet)
    }

    /// The stored session, if one exists and has not expired at `now`
    pub fn valid_session(&self, now: DateTime<Utc>) -> Option<&Session> {
        self.session.as_ref().filter(|s| s.is_valid_at(now))
    }

    pub(crate) fn replace_session(&mut self, session: Option<Session>) {
        self.session = session;
    }

    pub fn has_session(&self) -> bool {
        self.session.is_some()
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("app_id", &self.app_id)
            .field("private_token", &self.private_token.as_ref().map(|_| "<redacted>"))
            .field("session", &self.session)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_validity_window() {
        let issued = Utc::now();
        let session = Session::new("tok".to_string(), issued, Duration::from_secs(60));

        assert!(session.is_valid_at(issued));
        assert!(session.is_valid_at(issued + chrono::Duration::seconds(59)));
        assert!(!session.is_valid_at(issued + chrono::Duration::seconds(60)));
        assert!(!session.is_valid_at(issued + chrono::Duration::seconds(61)));
    }

    #[test]
    fn test_expired_session_is_hidden() {
        let issued = Utc::now();
        let mut creds = Credentials::new(Some("app".to_string()), Some("secret".to_string()));
        creds.replace_session(Some(Session::new(
            "tok".to_string(),
            issued,
            Duration::from_secs(1),
        )));

        assert!(creds.valid_session(issued).is_some());
        assert!(creds.valid_session(issued + chrono::Duration::seconds(1)).is_none());
        assert!(creds.has_session());
    }

    #[test]
    fn test_missing_identity() {
        let creds = Credentials::default();
        assert!(matches!(creds.app_id(), Err(Error::AppIdNotSet)));
        assert!(matches!(creds.private_token(), Err(Error::PrivateTokenNotSet)));
    }

    #[test]
    fn test_debug_redacts_secrets() {
        let creds = Credentials::new(Some("app".to_string()), Some("secret".to_string()));
        let out = format!("{:?}", creds);
        assert!(!out.contains("secret"));
        assert!(out.contains("app"));
    }
}
