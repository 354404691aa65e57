//! Event subscriptions against the mock device

use std::time::Duration;

use boxlink_core::{Client, ClientConfig, Error, EventDescription};
use boxlink_mock::{MockDevice, Script, ScriptedEvent};
use serde::Deserialize;
use serde_json::json;
use tokio_util::sync::CancellationToken;

const NORMAL_CLOSURE: u16 = 1000;

async fn client_for(device: &MockDevice) -> Client {
    let config = ClientConfig::new(device.base_url())
        .with_app_id("fr.boxlink.tests")
        .with_private_token(device.app_token().await);
    Client::new(config).unwrap()
}

fn host_events() -> Vec<ScriptedEvent> {
    vec![
        ScriptedEvent {
            source: "lan_host".into(),
            event: "l3addr_reachable".into(),
            result: json!({"id": "ether-00:11:22:33:44:55", "reachable": true}),
        },
        ScriptedEvent {
            source: "lan_host".into(),
            event: "l3addr_unreachable".into(),
            result: json!({"id": "ether-00:11:22:33:44:55", "reachable": false}),
        },
    ]
}

#[derive(Debug, Deserialize)]
struct LanHost {
    id: String,
    reachable: bool,
}

#[tokio::test]
async fn test_notifications_arrive_in_order() {
    let device = MockDevice::spawn(Script {
        events: host_events(),
        ..Script::default()
    })
    .await
    .unwrap();
    let client = client_for(&device).await;

    let events = [
        EventDescription::new("lan_host", "l3addr_reachable"),
        EventDescription::new("lan_host", "l3addr_unreachable"),
    ];
    let cancel = CancellationToken::new();
    let mut stream = client.listen_events(&events, cancel.clone()).await.unwrap();

    let first = stream.next().await.unwrap().unwrap();
    assert!(first.is(&events[0]));
    let host: LanHost = first.decode().unwrap();
    assert_eq!(host.id, "ether-00:11:22:33:44:55");
    assert!(host.reachable);

    let second = stream.next().await.unwrap().unwrap();
    assert!(second.is(&events[1]));
    assert!(!second.decode::<LanHost>().unwrap().reachable);

    let seen = device.observations().await;
    assert_eq!(
        seen.registrations,
        vec![vec![
            "lan_host_l3addr_reachable".to_string(),
            "lan_host_l3addr_unreachable".to_string(),
        ]]
    );

    cancel.cancel();
    stream.finished().await;
}

#[tokio::test]
async fn test_cancel_closes_cleanly() {
    let device = MockDevice::spawn(Script::default()).await.unwrap();
    let client = client_for(&device).await;

    let cancel = CancellationToken::new();
    let mut stream = client
        .listen_events(&[EventDescription::new("vm", "state_changed")], cancel.clone())
        .await
        .unwrap();

    cancel.cancel();

    // Cancellation is a normal end: the queue closes without an error
    while let Some(item) = stream.next().await {
        assert!(item.is_ok(), "unexpected error: {:?}", item.err());
    }
    stream.finished().await;

    let seen = device.observations().await;
    assert_eq!(seen.socket_actions, vec!["register".to_string()]);
    assert_eq!(seen.close_codes, vec![NORMAL_CLOSURE]);
}

#[tokio::test]
async fn test_rejected_registration_closes_channel() {
    let device = MockDevice::spawn(Script {
        register_error: Some("invalid_event".into()),
        ..Script::default()
    })
    .await
    .unwrap();
    let client = client_for(&device).await;

    let err = client
        .listen_events(&[EventDescription::new("nope", "nothing")], CancellationToken::new())
        .await
        .err()
        .unwrap();

    match err.root() {
        Error::Api { error_code, .. } => assert_eq!(error_code, "invalid_event"),
        other => panic!("unexpected error: {other}"),
    }
    assert!(err.to_string().starts_with("register events"));
    assert_eq!(device.observations().await.close_codes, vec![NORMAL_CLOSURE]);
}

#[tokio::test]
async fn test_socket_rejects_stale_session() {
    let device = MockDevice::spawn(Script::default()).await.unwrap();
    let client = client_for(&device).await;

    client.login().await.unwrap();
    device.expire_sessions().await;

    let err = client
        .listen_events(&[EventDescription::new("vm", "state_changed")], CancellationToken::new())
        .await
        .err()
        .unwrap();

    assert!(matches!(err.root(), Error::WebSocket(_)));
    assert!(err.to_string().starts_with("dial websocket"));
    assert_eq!(device.observations().await.rejected_sockets, 1);
}

#[tokio::test]
async fn test_register_reply_without_request_id() {
    let device = MockDevice::spawn(Script {
        register_reply_without_id: true,
        events: host_events(),
        ..Script::default()
    })
    .await
    .unwrap();
    let client = client_for(&device).await;

    let cancel = CancellationToken::new();
    let subscribed = tokio::time::timeout(
        Duration::from_secs(2),
        client.listen_events(&[EventDescription::new("lan_host", "l3addr_reachable")], cancel.clone()),
    )
    .await
    .expect("register reply without request_id was never matched");
    let mut stream = subscribed.unwrap();

    let first = stream.next().await.unwrap().unwrap();
    assert_eq!(first.event, "l3addr_reachable");

    cancel.cancel();
    stream.finished().await;
}

#[tokio::test]
async fn test_dropped_stream_closes_socket() {
    let device = MockDevice::spawn(Script::default()).await.unwrap();
    let client = client_for(&device).await;

    let stream = client
        .listen_events(&[EventDescription::new("vm", "state_changed")], CancellationToken::new())
        .await
        .unwrap();
    drop(stream);

    let closed = tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            let codes = device.observations().await.close_codes;
            if !codes.is_empty() {
                return codes;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("dropping the stream left the socket open");
    assert_eq!(closed, vec![NORMAL_CLOSURE]);
}
