// tests/integration/connection_test.rs

//! Tests for the per-endpoint connection state machine: handshake,
//! concurrent connects, timeouts, reconnection, and disposal.

use super::test_helpers::{
    MockConnector, MockEndpoint, silent_handler, test_config, test_endpoint, wait_for,
};
use futures::future::join_all;
use keysync::config::Config;
use keysync::core::connection::{Connection, ConnectionEvent, ConnectionEventKind, ConnectionState};
use keysync::core::transport::Connector;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

fn mock_connection(
    connector: &Arc<MockConnector>,
    name: &str,
    config: Config,
) -> (Arc<Connection>, Arc<MockEndpoint>) {
    let endpoint = test_endpoint(name);
    let mock = connector.endpoint(&endpoint);
    let connection = Connection::new(
        endpoint,
        "bootstrap-key".to_string(),
        None,
        connector.clone() as Arc<dyn Connector>,
        Arc::new(config),
    );
    (connection, mock)
}

#[tokio::test]
async fn test_connect_runs_handshake_and_adopts_session_key() {
    let connector = MockConnector::new();
    let (connection, mock) = mock_connection(&connector, "a", test_config());
    mock.set_session_key("server-key-1");

    assert!(connection.connect().await);
    assert_eq!(connection.state(), ConnectionState::Connected);
    assert_eq!(mock.init_count.load(Ordering::Relaxed), 1);
    assert_eq!(connection.session_key(), "server-key-1");
}

#[tokio::test]
async fn test_concurrent_connects_share_one_handshake() {
    let connector = MockConnector::new();
    let (connection, mock) = mock_connection(&connector, "a", test_config());

    let attempts = (0..4).map(|_| {
        let connection = Arc::clone(&connection);
        async move { connection.connect().await }
    });
    let outcomes = join_all(attempts).await;

    assert!(outcomes.into_iter().all(|connected| connected));
    assert_eq!(mock.init_count.load(Ordering::Relaxed), 1);
    assert_eq!(connection.state(), ConnectionState::Connected);
}

#[tokio::test]
async fn test_connect_is_noop_when_already_connected() {
    let connector = MockConnector::new();
    let (connection, mock) = mock_connection(&connector, "a", test_config());

    assert!(connection.connect().await);
    assert!(connection.connect().await);
    assert_eq!(mock.init_count.load(Ordering::Relaxed), 1);
}

#[tokio::test]
async fn test_handshake_rejection_settles_disconnected() {
    let connector = MockConnector::new();
    let (connection, mock) = mock_connection(&connector, "a", test_config());
    mock.set_reject_handshake(true);

    assert!(!connection.connect().await);
    assert_eq!(connection.state(), ConnectionState::Disconnected);
    assert_eq!(mock.init_count.load(Ordering::Relaxed), 1);
}

#[tokio::test]
async fn test_refused_transport_settles_disconnected() {
    let connector = MockConnector::new();
    let (connection, mock) = mock_connection(&connector, "a", test_config());
    mock.set_accept(false);

    assert!(!connection.connect().await);
    assert_eq!(connection.state(), ConnectionState::Disconnected);
    assert_eq!(mock.init_count.load(Ordering::Relaxed), 0);
}

#[tokio::test]
async fn test_state_transitions_emit_events_in_order() {
    let connector = MockConnector::new();
    let (connection, _mock) = mock_connection(&connector, "a", test_config());

    let states: Arc<Mutex<Vec<ConnectionState>>> = Arc::new(Mutex::new(Vec::new()));
    let seen = Arc::clone(&states);
    connection
        .bus()
        .on(ConnectionEventKind::StateChanged, move |event| {
            if let ConnectionEvent::StateChanged(state) = event {
                seen.lock().push(state);
            }
        });

    assert!(connection.connect().await);
    wait_for("both transitions observed", || states.lock().len() >= 2).await;

    let observed = states.lock().clone();
    assert_eq!(
        observed,
        vec![ConnectionState::Connecting, ConnectionState::Connected]
    );
}

#[tokio::test]
async fn test_request_timeout_resolves_to_absence() {
    let connector = MockConnector::new();
    let (connection, mock) = mock_connection(&connector, "a", test_config());
    assert!(connection.connect().await);
    mock.set_handler(silent_handler());

    let started = Instant::now();
    let result = connection.send_command("get", vec!["k".into()]).await;

    assert_eq!(result, None);
    assert!(started.elapsed() >= Duration::from_millis(300));
    // The connection itself is unaffected.
    assert_eq!(connection.state(), ConnectionState::Connected);
}

#[tokio::test]
async fn test_command_without_transport_waits_out_the_ack_window() {
    let connector = MockConnector::new();
    let (connection, _mock) = mock_connection(&connector, "a", test_config());

    let started = Instant::now();
    let result = connection.send_command("get", vec!["k".into()]).await;

    assert_eq!(result, None);
    assert!(started.elapsed() >= Duration::from_millis(300));
}

#[tokio::test]
async fn test_reconnects_after_transport_drop() {
    let connector = MockConnector::new();
    let (connection, mock) = mock_connection(&connector, "a", test_config());
    assert!(connection.connect().await);

    mock.drop_links();

    wait_for("second handshake", || {
        mock.init_count.load(Ordering::Relaxed) == 2
    })
    .await;
    wait_for("connection re-established", || connection.is_connected()).await;
}

#[tokio::test]
async fn test_transport_drop_without_policy_goes_disconnected() {
    let connector = MockConnector::new();
    let config = Config {
        reconnect_on_disconnect: false,
        ..test_config()
    };
    let (connection, mock) = mock_connection(&connector, "a", config);
    assert!(connection.connect().await);

    mock.drop_links();

    wait_for("plain disconnect", || {
        connection.state() == ConnectionState::Disconnected
    })
    .await;
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(mock.init_count.load(Ordering::Relaxed), 1);
}

#[tokio::test]
async fn test_dispose_is_idempotent() {
    let connector = MockConnector::new();
    let (connection, _mock) = mock_connection(&connector, "a", test_config());
    assert!(connection.connect().await);

    connection.dispose();
    connection.dispose();

    assert_eq!(connection.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_commands_resolve_against_the_builtin_store() {
    let connector = MockConnector::new();
    let (connection, _mock) = mock_connection(&connector, "a", test_config());
    assert!(connection.connect().await);

    let set_ack = connection
        .send_command("set", vec!["color".into(), "teal".into()])
        .await
        .expect("set acknowledged");
    assert_eq!(set_ack.get("ok").and_then(|v| v.as_bool()), Some(true));

    let get_ack = connection
        .send_command("get", vec!["color".into()])
        .await
        .expect("get acknowledged");
    assert_eq!(get_ack.get("value").and_then(|v| v.as_str()), Some("teal"));
}
