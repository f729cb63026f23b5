use super::common::*;
use crate::ami::codec::Fields;
use crate::ami::{AmiClient, AmiError, CallStatus, ConnectionState, OriginateOptions};
use crate::event::PbxEvent;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;

#[tokio::test]
async fn test_connect_login_and_subscribe() {
    let server = MockAmiServer::start().await;
    let client = connected_client(&server).await;

    assert!(client.is_connected());
    let login = server.actions_named("Login");
    assert_eq!(login.len(), 1);
    assert_eq!(login[0].get("Username"), Some(TEST_USERNAME));
    assert_eq!(login[0].get("Secret"), Some(TEST_SECRET));
    assert!(login[0].get("ActionID").is_some());

    let events = server.actions_named("Events");
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].get("EventMask"), Some("call,system"));

    let status = client.get_status();
    assert!(status.connected);
    assert_eq!(status.server_version.as_deref(), Some(TEST_GREETING));
    assert_eq!(status.port, server.port);
    assert_eq!(status.pending_actions, 0);
}

#[tokio::test]
async fn test_login_rejected() {
    let server = MockAmiServer::start().await;
    let mut config = test_config(server.port);
    config.secret = "wrong".to_string();
    let client = AmiClient::builder().with_config(config).build();

    let result = client.initialize().await;
    assert_eq!(
        result,
        Err(AmiError::Authentication {
            message: "Authentication failed".to_string()
        })
    );
    assert_eq!(client.state(), ConnectionState::Disconnected);
    assert!(server.actions_named("Events").is_empty());
}

#[tokio::test]
async fn test_missing_greeting_fails_connect() {
    let server = MockAmiServer::start_with(false, Arc::new(default_responder)).await;
    let client = AmiClient::builder()
        .with_config(test_config(server.port))
        .build();

    match client.initialize().await {
        Err(AmiError::Connection { message }) => assert!(message.contains("greeting")),
        other => panic!("unexpected result: {:?}", other),
    }
    assert_eq!(client.state(), ConnectionState::Disconnected);
    assert!(server.actions_named("Login").is_empty());
}

#[tokio::test]
async fn test_connection_refused_emits_error() {
    let port = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    };
    let client = AmiClient::builder().with_config(test_config(port)).build();
    let mut rx = client.subscribe();

    assert!(matches!(
        client.initialize().await,
        Err(AmiError::Connection { .. })
    ));
    assert!(matches!(
        recv_event(&mut rx, "connection_error", Duration::from_secs(1)).await,
        Some(PbxEvent::ConnectionError { .. })
    ));
    assert_eq!(client.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_reconnects_once_after_remote_close() {
    let server = MockAmiServer::start().await;
    let client = connected_client(&server).await;
    let mut rx = client.subscribe();

    server.kick();
    assert_eq!(
        recv_event(&mut rx, "disconnected", Duration::from_secs(1)).await,
        Some(PbxEvent::Disconnected)
    );
    assert!(!client.is_connected());

    // the retry waits out the reconnect interval
    assert_eq!(server.connection_count(), 1);
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(server.connection_count(), 1);

    assert!(wait_until(|| client.is_connected(), Duration::from_secs(3)).await);
    assert_eq!(server.connection_count(), 2);

    // no second loop was started behind the first one
    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert_eq!(server.connection_count(), 2);
    assert_eq!(server.actions_named("Login").len(), 2);
    assert_eq!(client.get_status().reconnects, 1);
}

fn silent_on(name: &'static str) -> Responder {
    Arc::new(move |action: &Fields| match action.get("Action") {
        Some(action_name) if action_name == name => None,
        _ => default_responder(action),
    })
}

#[tokio::test]
async fn test_close_during_subscription_fails_connect() {
    let server = MockAmiServer::start_with(true, silent_on("Events")).await;
    let client = AmiClient::builder()
        .with_config(test_config(server.port))
        .build();

    let connecting = tokio::spawn({
        let client = client.clone();
        async move { client.initialize().await }
    });
    assert!(wait_until(|| !server.actions_named("Events").is_empty(), Duration::from_secs(1)).await);
    server.kick();

    match connecting.await.unwrap() {
        Err(AmiError::Connection { message }) => assert!(message.contains("subscription")),
        other => panic!("unexpected result: {:?}", other),
    }
    assert_eq!(client.state(), ConnectionState::Disconnected);
    assert_eq!(
        client
            .originate("100", "200", OriginateOptions::default())
            .await,
        Err(AmiError::NotConnected)
    );
}

#[tokio::test]
async fn test_reconnect_retries_after_close_during_subscription() {
    let subscriptions = Arc::new(AtomicUsize::new(0));
    let responder: Responder = {
        let subscriptions = subscriptions.clone();
        Arc::new(move |action: &Fields| match action.get("Action") {
            // leave the first reconnect's subscription unanswered
            Some("Events") if subscriptions.fetch_add(1, Ordering::SeqCst) == 1 => None,
            _ => default_responder(action),
        })
    };
    let server = MockAmiServer::start_with(true, responder).await;
    let client = connected_client(&server).await;

    server.kick();
    assert!(wait_until(|| server.actions_named("Events").len() == 2, Duration::from_secs(3)).await);
    assert!(!client.is_connected());
    server.kick();

    assert!(wait_until(|| client.is_connected(), Duration::from_secs(4)).await);
    assert_eq!(server.connection_count(), 3);
    assert_eq!(client.get_status().reconnects, 2);
    assert!(client
        .originate("100", "200", OriginateOptions::default())
        .await
        .is_ok());
}

#[tokio::test]
async fn test_pending_action_times_out_after_socket_close() {
    let server = MockAmiServer::start_with(true, silent_on("Hangup")).await;
    let client = connected_client(&server).await;
    let call_id = "1700000000.7";
    server.push_event(&as_pairs(&trunk_channel(call_id)));
    assert!(wait_until(|| client.get_call(call_id).is_some(), Duration::from_secs(1)).await);

    let hanging_up = tokio::spawn({
        let client = client.clone();
        async move { client.hang_up(call_id).await }
    });
    assert!(wait_until(|| !server.actions_named("Hangup").is_empty(), Duration::from_secs(1)).await);
    server.kick();

    // the close does not fail the action early
    assert_eq!(
        hanging_up.await.unwrap(),
        Err(AmiError::ActionTimeout {
            action: "Hangup".to_string(),
            timeout: Duration::from_secs(1),
        })
    );
    assert_eq!(client.get_status().pending_actions, 0);
}

#[tokio::test]
async fn test_manual_disconnect_does_not_reconnect() {
    let server = MockAmiServer::start().await;
    let client = connected_client(&server).await;
    let mut rx = client.subscribe();

    client.disconnect().await;
    assert_eq!(
        recv_event(&mut rx, "disconnected", Duration::from_secs(1)).await,
        Some(PbxEvent::Disconnected)
    );
    assert_eq!(client.state(), ConnectionState::Disconnected);

    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert_eq!(server.connection_count(), 1);
    assert!(!client.is_connected());
    assert!(wait_until(|| !server.actions_named("Logoff").is_empty(), Duration::from_secs(1)).await);
}

#[tokio::test]
async fn test_events_drive_call_table() {
    let server = MockAmiServer::start().await;
    let client = connected_client(&server).await;
    let mut rx = client.subscribe();

    let call_id = "1700000000.1";
    server.push_event(&as_pairs(&trunk_channel(call_id)));
    match recv_event(&mut rx, "incoming_call", Duration::from_secs(1)).await {
        Some(PbxEvent::IncomingCall {
            call_id: id,
            caller_number,
            caller_name,
            destination,
            ..
        }) => {
            assert_eq!(id, call_id);
            assert_eq!(caller_number, "5551234");
            assert_eq!(caller_name, "Alice");
            assert_eq!(destination, "100");
        }
        other => panic!("unexpected event: {:?}", other),
    }
    assert_eq!(client.get_active_calls().len(), 1);

    server.push_event(&[
        ("Event", "Newstate"),
        ("Uniqueid", call_id),
        ("ChannelStateDesc", "Up"),
    ]);
    assert!(recv_event(&mut rx, "call_answered", Duration::from_secs(1))
        .await
        .is_some());

    server.push_event(&[
        ("Event", "Hangup"),
        ("Uniqueid", call_id),
        ("Cause", "16"),
        ("Cause-txt", "Normal Clearing"),
    ]);
    match recv_event(&mut rx, "call_ended", Duration::from_secs(1)).await {
        Some(PbxEvent::CallEnded { cause, .. }) => {
            assert_eq!(cause.as_deref(), Some("Normal Clearing"))
        }
        other => panic!("unexpected event: {:?}", other),
    }

    // still visible during the grace period, then purged
    let ended = client.get_call(call_id).unwrap();
    assert_eq!(ended.status, CallStatus::Ended);
    assert!(wait_until(|| client.get_active_calls().is_empty(), Duration::from_secs(3)).await);
}

#[tokio::test]
async fn test_unrelated_blocks_are_ignored() {
    let server = MockAmiServer::start().await;
    let client = connected_client(&server).await;

    server.push_event(&[("Event", "FullyBooted"), ("Status", "Fully Booted")]);
    server.push_event(&[("Privilege", "system,all"), ("Uptime", "123")]);
    server.push_event(&[("Response", "Success"), ("ActionID", "stale-1")]);
    server.push_event(&as_pairs(&trunk_channel("1700000000.9")));

    assert!(wait_until(|| client.get_call("1700000000.9").is_some(), Duration::from_secs(1)).await);
    assert!(client.is_connected());
    assert_eq!(client.get_status().pending_actions, 0);
}
