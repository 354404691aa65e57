//! Shared mock device state
//!
//! A [`Script`] fixes how the device answers; [`Observations`] records what
//! clients did so tests can assert on it afterwards.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use rand::Rng;
use rand::distributions::Alphanumeric;
use serde_json::Value;
use tokio::sync::RwLock;

pub type SharedState = Arc<RwLock<MockState>>;

/// Event pushed to every subscriber right after it registers
#[derive(Debug, Clone)]
pub struct ScriptedEvent {
    pub source: String,
    pub event: String,
    pub result: Value,
}

/// Device behaviour
#[derive(Debug, Clone)]
pub struct Script {
    pub app_token: String,
    pub track_id: i64,
    /// Status returned by each successive authorization poll; the last repeats
    pub authorize_statuses: Vec<String>,
    pub permissions: BTreeMap<String, bool>,
    pub events: Vec<ScriptedEvent>,
    /// Reject `register` with this error code
    pub register_error: Option<String>,
    /// Answer `register` with a bare `{action, success}` reply
    pub register_reply_without_id: bool,
    /// Reject `upload_start` with this error code
    pub upload_start_error: Option<String>,
    /// Drop this many bytes from the first chunk's acknowledgement
    pub short_ack: Option<usize>,
    /// Report the upload cancelled once this many bytes are in
    pub cancel_after: Option<u64>,
}

impl Default for Script {
    fn default() -> Self {
        Self {
            app_token: random_token(64),
            track_id: 42,
            authorize_statuses: vec!["granted".to_string()],
            permissions: BTreeMap::from([
                ("settings".to_string(), true),
                ("explorer".to_string(), true),
                ("parental".to_string(), false),
            ]),
            events: Vec::new(),
            register_error: None,
            register_reply_without_id: false,
            upload_start_error: None,
            short_ack: None,
            cancel_after: None,
        }
    }
}

/// One upload as seen by the device
#[derive(Debug, Clone, Default)]
pub struct UploadRecord {
    pub request_id: i64,
    pub dirname: String,
    pub filename: String,
    pub size: u64,
    pub data: Vec<u8>,
    pub finalized: bool,
    pub cancelled: bool,
}

/// What clients did to the device
#[derive(Debug, Clone, Default)]
pub struct Observations {
    pub authorize_requests: u32,
    pub authorize_polls: u32,
    pub logins: u32,
    pub failed_logins: u32,
    pub logouts: u32,
    pub rejected_sockets: u32,
    /// `action` of every text frame received, in order
    pub socket_actions: Vec<String>,
    /// Event names of every `register`
    pub registrations: Vec<Vec<String>>,
    /// Code of every close frame received from a client
    pub close_codes: Vec<u16>,
    pub uploads: Vec<UploadRecord>,
}

pub struct MockState {
    pub script: Script,
    pub observations: Observations,
    /// Challenge for the next login
    pub challenge: String,
    pub sessions: HashSet<String>,
}

impl MockState {
    pub fn new(script: Script) -> Self {
        Self {
            script,
            observations: Observations::default(),
            challenge: random_token(32),
            sessions: HashSet::new(),
        }
    }

    /// Status for the next authorization poll
    pub fn next_authorize_status(&mut self) -> String {
        let index = self.observations.authorize_polls as usize;
        self.observations.authorize_polls += 1;

        self.script
            .authorize_statuses
            .get(index)
            .or_else(|| self.script.authorize_statuses.last())
            .cloned()
            .unwrap_or_else(|| "granted".to_string())
    }

    /// Open a session and rotate the challenge
    pub fn open_session(&mut self) -> String {
        let token = random_token(32);
        self.sessions.insert(token.clone());
        self.challenge = random_token(32);
        self.observations.logins += 1;
        token
    }

    pub fn is_session(&self, token: &str) -> bool {
        self.sessions.contains(token)
    }

    /// Record of the upload started with `request_id`
    pub fn upload_mut(&mut self, request_id: i64) -> Option<&mut UploadRecord> {
        self.observations
            .uploads
            .iter_mut()
            .rev()
            .find(|u| u.request_id == request_id)
    }
}

pub fn random_token(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_authorize_status_sequence_repeats_last() {
        let mut state = MockState::new(Script {
            authorize_statuses: vec!["pending".to_string(), "granted".to_string()],
            ..Script::default()
        });

        assert_eq!(state.next_authorize_status(), "pending");
        assert_eq!(state.next_authorize_status(), "granted");
        assert_eq!(state.next_authorize_status(), "granted");
        assert_eq!(state.observations.authorize_polls, 3);
    }

    #[test]
    fn test_open_session_rotates_challenge() {
        let mut state = MockState::new(Script::default());
        let challenge = state.challenge.clone();

        let token = state.open_session();
        assert!(state.is_session(&token));
        assert_ne!(state.challenge, challenge);
        assert_eq!(state.observations.logins, 1);
    }
}
