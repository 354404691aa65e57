//! boxlink-mock: Fake device for manual testing against a real client
//!
//! Listens on `BOXLINK_MOCK_ADDR` (default 127.0.0.1:8880), grants every
//! pairing request and prints the app token to use for logins.

use std::net::SocketAddr;

use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use boxlink_mock::{MockDevice, Script, ScriptedEvent};

const DEFAULT_ADDR: &str = "127.0.0.1:8880";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "boxlink_mock=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let addr: SocketAddr = std::env::var("BOXLINK_MOCK_ADDR")
        .unwrap_or_else(|_| DEFAULT_ADDR.to_string())
        .parse()?;

    let script = Script {
        authorize_statuses: vec!["pending".to_string(), "granted".to_string()],
        events: vec![ScriptedEvent {
            source: "lan_host".to_string(),
            event: "l3addr_reachable".to_string(),
            result: serde_json::json!({ "id": "ether-00:11:22:33:44:55", "reachable": true }),
        }],
        ..Script::default()
    };

    let listener = tokio::net::TcpListener::bind(addr).await?;
    let device = MockDevice::serve(listener, script).await?;
    tracing::info!("App token: {}", device.app_token().await);
    tracing::info!("API base URL: {}", device.base_url());

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down");
    device.shutdown().await;

    Ok(())
}
