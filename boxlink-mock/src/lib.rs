//! boxlink-mock: Scriptable fake device
//!
//! Serves the discovery, pairing, login, event and upload endpoints on a
//! local port. Tests pick the device behaviour with a [`Script`] and read
//! back what the client did through [`MockDevice::observations`].

pub mod handlers;
pub mod state;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    Router,
    routing::{delete, get, post},
};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;

pub use state::{MockState, Observations, Script, ScriptedEvent, SharedState, UploadRecord};

/// Header carrying the session token
pub const SESSION_HEADER: &str = "X-Fbx-App-Auth";

/// Build the device router over `state`
pub fn router(state: SharedState) -> Router {
    Router::new()
        .route("/api_version", get(handlers::api_version_handler))
        .route("/api/v8/login/authorize/", post(handlers::authorize_handler))
        .route(
            "/api/v8/login/authorize/{track_id}",
            get(handlers::authorize_status_handler),
        )
        .route("/api/v8/login/", get(handlers::login_challenge_handler))
        .route("/api/v8/login/session/", post(handlers::open_session_handler))
        .route("/api/v8/login/logout/", post(handlers::logout_handler))
        .route("/api/v8/system/", get(handlers::system_handler))
        .route("/api/v8/downloads/{id}", delete(handlers::delete_download_handler))
        .route("/api/v8/ws/event", get(handlers::ws_event_handler))
        .route("/api/v8/ws/upload", get(handlers::ws_upload_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// A running mock device
pub struct MockDevice {
    addr: SocketAddr,
    state: SharedState,
    task: JoinHandle<()>,
}

impl MockDevice {
    /// Serve `script` on an ephemeral localhost port
    pub async fn spawn(script: Script) -> anyhow::Result<Self> {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        Self::serve(listener, script).await
    }

    /// Serve `script` on an already bound listener
    pub async fn serve(listener: tokio::net::TcpListener, script: Script) -> anyhow::Result<Self> {
        let addr = listener.local_addr()?;
        let state = Arc::new(RwLock::new(MockState::new(script)));
        let app = router(Arc::clone(&state));

        let task = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                tracing::error!(error = %e, "Mock device stopped");
            }
        });

        tracing::info!("Mock device listening on {}", addr);
        Ok(Self { addr, state, task })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Host URL, the root the discovery document lives under
    pub fn host_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Versioned API base URL
    pub fn base_url(&self) -> String {
        format!("http://{}/api/v8/", self.addr)
    }

    pub async fn app_token(&self) -> String {
        self.state.read().await.script.app_token.clone()
    }

    pub async fn observations(&self) -> Observations {
        self.state.read().await.observations.clone()
    }

    /// Change the script of a running device
    pub async fn update_script(&self, update: impl FnOnce(&mut Script)) {
        update(&mut self.state.write().await.script);
    }

    /// Drop every open session, as the device does when it reboots
    pub async fn expire_sessions(&self) {
        self.state.write().await.sessions.clear();
    }

    pub async fn shutdown(self) {
        self.task.abort();
        let _ = self.task.await;
    }
}
