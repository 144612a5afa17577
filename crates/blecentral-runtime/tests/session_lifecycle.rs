//! Integration tests for the session lifecycle
//!
//! Drives sessions against the simulated adapter through connect, discovery,
//! disconnect and reconnect, including failure paths and unsolicited link loss.

use std::sync::Arc;

use blecentral_harness::{heart_rate_monitor, SimulatedAdapter};
use blecentral_runtime::{
    uuid_from_u16, BleError, CharacteristicSelector, ConnectionState, Session, SessionConfig,
    SessionNotice,
};
use tokio::time::{timeout, Duration};

const HRM: &str = "AA:BB:CC:DD:EE:01";

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn setup(config: SessionConfig) -> (Arc<SimulatedAdapter>, Session) {
    init_tracing();
    let hrm = heart_rate_monitor(HRM);
    let sighting = hrm.sighting();
    let adapter = Arc::new(SimulatedAdapter::ideal().with_peripheral(hrm));
    let session = Session::new(adapter.clone(), sighting, config).expect("valid config");
    (adapter, session)
}

#[tokio::test]
async fn test_connect_discovers_and_becomes_ready() {
    let (adapter, session) = setup(SessionConfig::testing());
    assert_eq!(session.state(), ConnectionState::Disconnected);

    session.connect().await.expect("connect");
    assert_eq!(session.state(), ConnectionState::Ready);

    let tree = session.discover().await.unwrap();
    assert_eq!(tree.services().len(), 2);
    assert_eq!(tree.characteristic_count(), 3);
    assert!(tree.service(uuid_from_u16(0x180d)).is_some());
    assert_eq!(adapter.connection_count(), 1);

    let value = session.read(uuid_from_u16(0x2a38)).await.unwrap();
    assert_eq!(value, vec![0x01]);
}

#[tokio::test]
async fn test_discover_is_idempotent() {
    let (adapter, session) = setup(SessionConfig::testing());
    session.connect().await.unwrap();

    let first = session.discover().await.unwrap();
    let second = session.discover().await.unwrap();
    let third = session.discover().await.unwrap();

    assert!(Arc::ptr_eq(&first, &second));
    assert!(Arc::ptr_eq(&second, &third));
    assert_eq!(adapter.discovery_count(), 1);
}

#[tokio::test]
async fn test_connect_failure_returns_to_disconnected() {
    let (adapter, session) = setup(SessionConfig::testing());
    adapter.fail_connect("page timeout");

    let err = session.connect().await.unwrap_err();
    assert!(matches!(err, BleError::Connect { .. }), "got {:?}", err);
    assert_eq!(session.state(), ConnectionState::Disconnected);

    let states: Vec<_> = session
        .audit_trail()
        .await
        .unwrap()
        .into_iter()
        .map(|entry| entry.to_state)
        .collect();
    assert_eq!(
        states,
        vec![
            ConnectionState::Connecting,
            ConnectionState::Error,
            ConnectionState::Disconnected
        ]
    );

    // A failed attempt leaves the session reusable
    adapter.clear_faults();
    session.connect().await.expect("second attempt connects");
    assert_eq!(session.state(), ConnectionState::Ready);
}

#[tokio::test]
async fn test_connect_timeout() {
    let config = SessionConfig::testing().with_connect_timeout(Duration::from_millis(50));
    let (adapter, session) = setup(config);
    adapter.hang_connect();

    let err = session.connect().await.unwrap_err();
    assert!(err.is_timeout(), "got {:?}", err);
    assert_eq!(session.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_discovery_failure_disconnects_link() {
    let (adapter, session) = setup(SessionConfig::testing());
    adapter.fail_discovery("database out of sync");

    let err = session.connect().await.unwrap_err();
    assert!(matches!(err, BleError::Discovery { .. }), "got {:?}", err);
    assert_eq!(session.state(), ConnectionState::Disconnected);
    assert_eq!(adapter.connection_count(), 0);
}

#[tokio::test]
async fn test_discovery_timeout() {
    let config = SessionConfig::testing().with_discovery_timeout(Duration::from_millis(50));
    let (adapter, session) = setup(config);
    adapter.hang_discovery();

    let err = session.connect().await.unwrap_err();
    assert!(err.is_timeout(), "got {:?}", err);
    assert_eq!(session.state(), ConnectionState::Disconnected);
    assert_eq!(adapter.connection_count(), 0);
}

#[tokio::test]
async fn test_reentrant_connect_and_commands_before_ready() {
    let (adapter, session) = setup(SessionConfig::testing());
    adapter.hang_discovery();

    let connecting = {
        let session = session.clone();
        tokio::spawn(async move { session.connect().await })
    };
    timeout(
        Duration::from_secs(1),
        session.wait_for_state(ConnectionState::ServiceDiscovery),
    )
    .await
    .expect("reached discovery")
    .unwrap();

    let err = session.connect().await.unwrap_err();
    assert!(matches!(
        err,
        BleError::AlreadyConnecting {
            state: ConnectionState::ServiceDiscovery
        }
    ));

    let err = session.read(uuid_from_u16(0x2a38)).await.unwrap_err();
    assert!(matches!(err, BleError::NotReady { .. }), "got {:?}", err);

    // Disconnect cancels the attempt
    session.disconnect().await.unwrap();
    let result = connecting.await.unwrap();
    assert!(matches!(result, Err(BleError::Disconnected { .. })));
    assert_eq!(session.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_commands_rejected_while_disconnected() {
    let (_adapter, session) = setup(SessionConfig::testing());

    let err = session.read(uuid_from_u16(0x2a38)).await.unwrap_err();
    assert!(err.is_disconnected(), "got {:?}", err);
    assert!(session.discover().await.unwrap_err().is_disconnected());
}

#[tokio::test]
async fn test_disconnect_is_idempotent() {
    let (adapter, session) = setup(SessionConfig::testing());
    session.disconnect().await.unwrap();

    session.connect().await.unwrap();
    session.disconnect().await.unwrap();
    session.disconnect().await.unwrap();
    assert_eq!(session.state(), ConnectionState::Disconnected);
    assert_eq!(adapter.connection_count(), 0);
}

#[tokio::test]
async fn test_close_releases_only_its_own_handle() {
    let (adapter, session) = setup(SessionConfig::testing());
    session.connect().await.unwrap();

    let clone = session.clone();
    clone.close().await.unwrap();
    assert_eq!(session.state(), ConnectionState::Disconnected);
    assert_eq!(adapter.connection_count(), 0);

    // The remaining handle still drives the same session task
    session.connect().await.unwrap();
    assert_eq!(session.read(uuid_from_u16(0x2a38)).await.unwrap(), vec![0x01]);

    let mut state = session.state_watch();
    session.close().await.unwrap();
    timeout(Duration::from_secs(1), async {
        while state.changed().await.is_ok() {}
    })
    .await
    .expect("session task stopped after the last handle closed");
    assert_eq!(adapter.connection_count(), 0);
}

#[tokio::test]
async fn test_reconnect_rebuilds_tree_and_invalidates_refs() {
    let (_adapter, session) = setup(SessionConfig::testing());
    session.connect().await.unwrap();

    let old_tree = session.discover().await.unwrap();
    let old_ref = old_tree
        .characteristics()
        .find(|c| c.uuid == uuid_from_u16(0x2a38))
        .map(|c| c.reference())
        .unwrap();
    assert_eq!(session.read(old_ref).await.unwrap(), vec![0x01]);

    session.disconnect().await.unwrap();
    session.connect().await.unwrap();

    let new_tree = session.discover().await.unwrap();
    assert!(!Arc::ptr_eq(&old_tree, &new_tree));
    assert!(new_tree.generation() > old_tree.generation());

    let err = session.read(old_ref).await.unwrap_err();
    assert!(
        matches!(err, BleError::CharacteristicNotFound { .. }),
        "got {:?}",
        err
    );

    // Selecting by UUID resolves against the new tree
    assert_eq!(session.read(uuid_from_u16(0x2a38)).await.unwrap(), vec![0x01]);

    let qualified = CharacteristicSelector::qualified(
        uuid_from_u16(0x180f),
        uuid_from_u16(0x2a19),
        0,
    );
    assert_eq!(session.read(qualified).await.unwrap(), vec![0x64]);
}

#[tokio::test]
async fn test_unsolicited_disconnect() {
    let (adapter, session) = setup(SessionConfig::testing());
    let mut notices = session.notices();
    session.connect().await.unwrap();

    assert!(adapter.inject_disconnect(&HRM.into(), "supervision timeout"));
    timeout(
        Duration::from_secs(1),
        session.wait_for_state(ConnectionState::Disconnected),
    )
    .await
    .expect("session settled")
    .unwrap();

    let reason = timeout(Duration::from_secs(1), async {
        loop {
            if let Ok(SessionNotice::Disconnected { reason }) = notices.recv().await {
                return reason;
            }
        }
    })
    .await
    .expect("disconnect notice");
    assert_eq!(reason, "supervision timeout");

    // The session starts a new generation on reconnect
    session.connect().await.unwrap();
    assert_eq!(session.read(uuid_from_u16(0x2a38)).await.unwrap(), vec![0x01]);
}

#[tokio::test]
async fn test_state_changes_are_broadcast() {
    let (_adapter, session) = setup(SessionConfig::testing());
    let mut notices = session.notices();
    session.connect().await.unwrap();

    let mut seen = Vec::new();
    while let Ok(notice) = notices.try_recv() {
        if let SessionNotice::StateChanged { to, .. } = notice {
            seen.push(to);
        }
    }
    assert_eq!(
        seen,
        vec![
            ConnectionState::Connecting,
            ConnectionState::ServiceDiscovery,
            ConnectionState::Ready
        ]
    );

    let snapshot = session.snapshot().await.unwrap();
    assert_eq!(snapshot.state, ConnectionState::Ready);
    assert_eq!(snapshot.generation, 1);
    assert!(snapshot.tree.is_some());
    assert_eq!(snapshot.queued_commands, 0);
}

#[tokio::test]
async fn test_invalid_config_is_rejected() {
    let adapter = Arc::new(SimulatedAdapter::ideal());
    let sighting = heart_rate_monitor(HRM).sighting();
    let config = SessionConfig::testing().with_connect_timeout(Duration::ZERO);

    let err = Session::new(adapter, sighting, config).unwrap_err();
    assert!(matches!(err, BleError::Configuration { .. }));
}
