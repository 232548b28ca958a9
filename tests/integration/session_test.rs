// tests/integration/session_test.rs

//! Tests for the session group: aggregate connectivity and the dispatch
//! arbitration policies.

use super::test_helpers::{
    MockConnector, canned_handler, init_tracing, mock_group, mock_group_with_config, test_config,
    test_endpoint, wait_for,
};
use keysync::config::Config;
use keysync::core::commands::string_result;
use keysync::core::session::SessionEventKind;
use serde_json::json;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

#[tokio::test]
async fn test_group_emits_connected_once_for_first_member() {
    init_tracing();
    let connector = MockConnector::new();
    let group = mock_group(&connector, &["a", "b"]);

    let connected_events = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&connected_events);
    group.bus().on(SessionEventKind::Connected, move |_| {
        counter.fetch_add(1, Ordering::Relaxed);
    });

    wait_for("group connected", || group.is_connected()).await;
    let mock_a = connector.endpoint(&test_endpoint("a"));
    let mock_b = connector.endpoint(&test_endpoint("b"));
    wait_for("both members connected", || {
        mock_a.init_count.load(Ordering::Relaxed) == 1
            && mock_b.init_count.load(Ordering::Relaxed) == 1
    })
    .await;

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(connected_events.load(Ordering::Relaxed), 1);
}

#[tokio::test]
async fn test_group_disconnects_only_when_no_member_remains() {
    let connector = MockConnector::new();
    let config = Config {
        reconnect_on_disconnect: false,
        ..test_config()
    };
    let group = mock_group_with_config(&connector, &["a", "b"], config);

    let disconnected_events = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&disconnected_events);
    group.bus().on(SessionEventKind::Disconnected, move |_| {
        counter.fetch_add(1, Ordering::Relaxed);
    });

    wait_for("group connected", || group.is_connected()).await;
    let mock_a = connector.endpoint(&test_endpoint("a"));
    let mock_b = connector.endpoint(&test_endpoint("b"));
    wait_for("both links up", || {
        mock_a.link_count() == 1 && mock_b.link_count() == 1
    })
    .await;

    mock_a.drop_links();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(group.is_connected());
    assert_eq!(disconnected_events.load(Ordering::Relaxed), 0);

    mock_b.drop_links();
    wait_for("group fully down", || !group.is_connected()).await;
    wait_for("disconnected emitted", || {
        disconnected_events.load(Ordering::Relaxed) == 1
    })
    .await;
}

#[tokio::test]
async fn test_dispatch_returns_first_settled_result() {
    let connector = MockConnector::new();
    let group = mock_group(&connector, &["fast", "slow"]);
    wait_for("group connected", || group.is_connected()).await;

    connector
        .endpoint(&test_endpoint("fast"))
        .set_handler(canned_handler(
            Duration::from_millis(5),
            json!({"value": "fast-answer"}),
        ));
    connector
        .endpoint(&test_endpoint("slow"))
        .set_handler(canned_handler(
            Duration::from_millis(150),
            json!({"value": "slow-answer"}),
        ));

    let result = group
        .dispatch_map("get", vec!["k".into()], string_result)
        .await;
    assert_eq!(result.as_deref(), Some("fast-answer"));
}

#[tokio::test]
async fn test_nil_tolerant_dispatch_waits_for_a_value() {
    // Member A answers "no value" after 50ms, member B answers "v1" after
    // 200ms: the fast absent answer must not win.
    let connector = MockConnector::new();
    let group = mock_group(&connector, &["a", "b"]);
    wait_for("group connected", || group.is_connected()).await;

    connector
        .endpoint(&test_endpoint("a"))
        .set_handler(canned_handler(
            Duration::from_millis(50),
            json!({"value": null}),
        ));
    connector
        .endpoint(&test_endpoint("b"))
        .set_handler(canned_handler(
            Duration::from_millis(200),
            json!({"value": "v1"}),
        ));

    let result = group
        .dispatch_first_value_map("get", vec!["k".into()], string_result)
        .await;
    assert_eq!(result.as_deref(), Some("v1"));
}

#[tokio::test]
async fn test_nil_tolerant_dispatch_exhausts_to_none() {
    let connector = MockConnector::new();
    let group = mock_group(&connector, &["a", "b"]);
    wait_for("group connected", || group.is_connected()).await;

    for name in ["a", "b"] {
        connector
            .endpoint(&test_endpoint(name))
            .set_handler(canned_handler(
                Duration::from_millis(20),
                json!({"value": null}),
            ));
    }

    let result = group
        .dispatch_first_value_map("get", vec!["k".into()], string_result)
        .await;
    assert_eq!(result, None);
}

#[tokio::test]
async fn test_single_responsive_member_wins_regardless_of_order() {
    let connector = MockConnector::new();
    let group = mock_group(&connector, &["a", "b", "c"]);
    wait_for("group connected", || group.is_connected()).await;

    for name in ["a", "b"] {
        connector
            .endpoint(&test_endpoint(name))
            .set_handler(canned_handler(
                Duration::from_millis(10),
                json!({"value": null}),
            ));
    }
    connector
        .endpoint(&test_endpoint("c"))
        .set_handler(canned_handler(
            Duration::from_millis(120),
            json!({"value": "only-answer"}),
        ));

    let result = group
        .dispatch_first_value_map("get", vec!["k".into()], string_result)
        .await;
    assert_eq!(result.as_deref(), Some("only-answer"));
}

#[tokio::test]
async fn test_dead_member_cannot_short_circuit_the_race() {
    // One endpoint refuses transports entirely; its member never connects.
    // The live endpoint's value must still win well before the dead member's
    // ack window closes.
    let connector = MockConnector::new();
    connector.endpoint(&test_endpoint("dead")).set_accept(false);
    let group = mock_group(&connector, &["dead", "live"]);
    wait_for("group connected", || group.is_connected()).await;

    connector
        .endpoint(&test_endpoint("live"))
        .set_handler(canned_handler(
            Duration::from_millis(30),
            json!({"value": "from-live"}),
        ));

    let started = Instant::now();
    let result = group
        .dispatch_first_value_map("get", vec!["k".into()], string_result)
        .await;
    assert_eq!(result.as_deref(), Some("from-live"));
    assert!(started.elapsed() < Duration::from_millis(300));
}

#[tokio::test]
async fn test_watch_registration_roundtrip() {
    let connector = MockConnector::new();
    let group = mock_group(&connector, &["a"]);
    wait_for("group connected", || group.is_connected()).await;
    let mock = connector.endpoint(&test_endpoint("a"));

    let watch_id = group.watch("alpha").await.expect("watch registered");
    assert_eq!(mock.watch_count.load(Ordering::Relaxed), 1);

    assert!(group.stop_watching(&watch_id).await);
    assert_eq!(mock.unwatch_count.load(Ordering::Relaxed), 1);
}

#[tokio::test]
async fn test_dispose_tears_members_down() {
    let connector = MockConnector::new();
    let group = mock_group(&connector, &["a", "b"]);
    wait_for("group connected", || group.is_connected()).await;

    group.dispose();

    assert!(!group.is_connected());
    // Disposal is idempotent.
    group.dispose();
    assert!(!group.is_connected());
}
