//! Pairing, login and session renewal against the mock device

use std::time::Duration;

use boxlink_core::{AppDescription, Client, ClientConfig, Error, TimingConfig, discover};
use boxlink_mock::{MockDevice, Script};
use tokio_util::sync::CancellationToken;

fn fast_timing() -> TimingConfig {
    TimingConfig {
        authorize_retry_delay_ms: 10,
        authorize_timeout_ms: 2_000,
        ..TimingConfig::default()
    }
}

fn app() -> AppDescription {
    AppDescription {
        app_name: "boxlink tests".to_string(),
        app_version: "0.1.0".to_string(),
        device_name: "ci".to_string(),
    }
}

async fn paired_client(device: &MockDevice, timing: TimingConfig) -> Client {
    let config = ClientConfig::new(device.base_url())
        .with_app_id("fr.boxlink.tests")
        .with_private_token(device.app_token().await)
        .with_timing(timing);
    Client::new(config).unwrap()
}

#[tokio::test]
async fn test_pairing_polls_until_granted() {
    let device = MockDevice::spawn(Script {
        authorize_statuses: vec!["pending".into(), "pending".into(), "granted".into()],
        ..Script::default()
    })
    .await
    .unwrap();

    let config = ClientConfig::new(device.base_url())
        .with_app_id("fr.boxlink.tests")
        .with_timing(fast_timing());
    let client = Client::new(config).unwrap();

    let token = client.authorize(&app(), &CancellationToken::new()).await.unwrap();
    assert_eq!(token, device.app_token().await);

    let seen = device.observations().await;
    assert_eq!(seen.authorize_requests, 1);
    assert_eq!(seen.authorize_polls, 3);
}

#[tokio::test]
async fn test_pairing_times_out_while_pending() {
    let device = MockDevice::spawn(Script {
        authorize_statuses: vec!["pending".into()],
        ..Script::default()
    })
    .await
    .unwrap();

    let config = ClientConfig::new(device.base_url())
        .with_app_id("fr.boxlink.tests")
        .with_timing(TimingConfig {
            authorize_timeout_ms: 100,
            ..fast_timing()
        });
    let client = Client::new(config).unwrap();

    let err = client
        .authorize(&app(), &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::AuthorizationTimeout(_)));
    assert!(err.is_timeout());
    assert!(device.observations().await.authorize_polls >= 2);
}

#[tokio::test]
async fn test_pairing_reports_refusal() {
    let device = MockDevice::spawn(Script {
        authorize_statuses: vec!["pending".into(), "denied".into()],
        ..Script::default()
    })
    .await
    .unwrap();

    let config = ClientConfig::new(device.base_url())
        .with_app_id("fr.boxlink.tests")
        .with_timing(fast_timing());
    let client = Client::new(config).unwrap();

    let err = client
        .authorize(&app(), &CancellationToken::new())
        .await
        .unwrap_err();
    match err.root() {
        Error::UnexpectedAuthorizationStatus(status) => assert_eq!(status, "denied"),
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn test_pairing_cancelled() {
    let device = MockDevice::spawn(Script {
        authorize_statuses: vec!["pending".into()],
        ..Script::default()
    })
    .await
    .unwrap();

    let config = ClientConfig::new(device.base_url())
        .with_app_id("fr.boxlink.tests")
        .with_timing(fast_timing());
    let client = Client::new(config).unwrap();

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });

    let err = client.authorize(&app(), &cancel).await.unwrap_err();
    assert!(err.is_cancelled());
}

#[tokio::test]
async fn test_login_returns_permissions() {
    let device = MockDevice::spawn(Script::default()).await.unwrap();
    let client = paired_client(&device, TimingConfig::default()).await;

    let permissions = client.login().await.unwrap();
    assert!(permissions.has("settings"));
    assert!(!permissions.has("parental"));
    assert!(!permissions.has("unknown"));
    assert!(client.credentials().await.has_session());
}

#[tokio::test]
async fn test_login_with_wrong_token_fails() {
    let device = MockDevice::spawn(Script::default()).await.unwrap();
    let config = ClientConfig::new(device.base_url())
        .with_app_id("fr.boxlink.tests")
        .with_private_token("not-the-token");
    let client = Client::new(config).unwrap();

    let err = client.login().await.unwrap_err();
    match err.root() {
        Error::Api { error_code, .. } => assert_eq!(error_code, "invalid_token"),
        other => panic!("unexpected error: {other}"),
    }
    assert!(err.to_string().starts_with("open session"));
    assert!(!client.credentials().await.has_session());
    assert_eq!(device.observations().await.failed_logins, 1);
}

#[tokio::test]
async fn test_session_renewed_after_expiry() {
    let device = MockDevice::spawn(Script::default()).await.unwrap();
    let client = paired_client(
        &device,
        TimingConfig {
            session_ttl_ms: 200,
            ..TimingConfig::default()
        },
    )
    .await;

    let _: serde_json::Value = client.get("system/").await.unwrap();
    let _: serde_json::Value = client.get("system/").await.unwrap();
    assert_eq!(device.observations().await.logins, 1);

    tokio::time::sleep(Duration::from_millis(300)).await;

    let system: serde_json::Value = client.get("system/").await.unwrap();
    assert_eq!(system["firmware_version"], "4.8.0");
    assert_eq!(device.observations().await.logins, 2);
}

#[tokio::test]
async fn test_concurrent_callers_share_one_login() {
    let device = MockDevice::spawn(Script::default()).await.unwrap();
    let client = paired_client(&device, TimingConfig::default()).await;

    let calls = (0..5).map(|_| client.ensure_session());
    let headers = futures::future::join_all(calls).await;

    let first = headers[0].as_ref().unwrap().value().to_string();
    for header in &headers {
        assert_eq!(header.as_ref().unwrap().value(), first);
    }
    assert_eq!(device.observations().await.logins, 1);
}

#[tokio::test]
async fn test_logout_forgets_session() {
    let device = MockDevice::spawn(Script::default()).await.unwrap();
    let client = paired_client(&device, TimingConfig::default()).await;

    client.login().await.unwrap();
    client.logout().await.unwrap();
    assert!(!client.credentials().await.has_session());
    assert_eq!(device.observations().await.logouts, 1);

    // Without a session there is nothing to close
    client.logout().await.unwrap();
    assert_eq!(device.observations().await.logouts, 1);
}

#[tokio::test]
async fn test_delete_reports_not_found() {
    let device = MockDevice::spawn(Script::default()).await.unwrap();
    let client = paired_client(&device, TimingConfig::default()).await;

    let deleted: Option<serde_json::Value> = client.delete("downloads/1").await.unwrap();
    assert!(deleted.is_none());

    let err = client
        .delete::<serde_json::Value>("downloads/2")
        .await
        .unwrap_err();
    assert!(err.is_not_found());
}

#[tokio::test]
async fn test_discovery_points_at_api() {
    let device = MockDevice::spawn(Script::default()).await.unwrap();

    let version = discover(&reqwest::Client::new(), &device.host_url())
        .await
        .unwrap();
    assert_eq!(version.device_name.as_deref(), Some("boxlink-mock"));
    assert_eq!(version.base_url(&device.host_url()).unwrap(), device.base_url());
}
