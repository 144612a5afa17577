//! Integration tests for GATT command serialization
//!
//! Verifies FIFO dispatch with a single operation in flight, failure of queued
//! commands on disconnect, per-command deadlines and late acknowledgements.

use std::sync::Arc;

use blecentral_harness::{
    echo_peripheral, heart_rate_monitor, AdapterCall, SimulatedAdapter, CCCD_UUID,
    ECHO_CHARACTERISTIC_UUID,
};
use blecentral_runtime::{
    uuid_from_u16, BleError, CharacteristicSelector, ConnectionState, DescriptorSelector,
    Session, SessionConfig, SessionNotice, WriteMode,
};
use futures::future::join_all;
use tokio::time::{sleep, timeout, Duration};

const ECHO: &str = "11:22:33:44:55:66";
const HRM: &str = "AA:BB:CC:DD:EE:01";

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

async fn connected_echo(config: SessionConfig) -> (Arc<SimulatedAdapter>, Session) {
    init_tracing();
    let echo = echo_peripheral(ECHO).with_mtu(185);
    let sighting = echo.sighting();
    let adapter = Arc::new(SimulatedAdapter::ideal().with_peripheral(echo));
    let session = Session::new(adapter.clone(), sighting, config).unwrap();
    session.connect().await.expect("connect");
    (adapter, session)
}

async fn wait_for_ops_in_flight(adapter: &SimulatedAdapter, count: usize) {
    timeout(Duration::from_secs(1), async {
        while adapter.ops_in_flight() != count {
            sleep(Duration::from_millis(1)).await;
        }
    })
    .await
    .expect("operations reached the backend");
}

#[tokio::test]
async fn test_echo_round_trip() {
    let (_adapter, session) = connected_echo(SessionConfig::testing()).await;

    session
        .write(ECHO_CHARACTERISTIC_UUID, b"hello", WriteMode::WithResponse)
        .await
        .unwrap();
    assert_eq!(session.read(ECHO_CHARACTERISTIC_UUID).await.unwrap(), b"hello");

    session
        .write(ECHO_CHARACTERISTIC_UUID, b"again", WriteMode::WithoutResponse)
        .await
        .unwrap();
    assert_eq!(session.read(ECHO_CHARACTERISTIC_UUID).await.unwrap(), b"again");
    assert_eq!(
        session.cached_value(ECHO_CHARACTERISTIC_UUID).await.unwrap(),
        Some(b"again".to_vec())
    );
}

#[tokio::test]
async fn test_commands_dispatch_in_submission_order_one_at_a_time() {
    let (adapter, session) = connected_echo(SessionConfig::testing()).await;
    adapter.clear_calls();
    adapter.hold_acks();

    let pending = {
        let session = session.clone();
        tokio::spawn(async move {
            let session = &session;
            let writes = (0u8..8).map(|i| async move {
                session
                    .write(ECHO_CHARACTERISTIC_UUID, &[i], WriteMode::WithResponse)
                    .await
            });
            join_all(writes).await
        })
    };

    wait_for_ops_in_flight(&adapter, 1).await;
    sleep(Duration::from_millis(20)).await;
    assert_eq!(adapter.ops_in_flight(), 1);
    assert_eq!(session.snapshot().await.unwrap().queued_commands, 8);

    adapter.open_gate();
    let results = timeout(Duration::from_secs(5), pending)
        .await
        .expect("writes completed")
        .unwrap();
    assert!(results.iter().all(Result::is_ok));

    let order: Vec<u8> = adapter
        .gatt_calls()
        .into_iter()
        .filter_map(|call| match call {
            AdapterCall::Write { value, .. } => value.first().copied(),
            _ => None,
        })
        .collect();
    assert_eq!(order, (0u8..8).collect::<Vec<_>>());
    assert_eq!(adapter.max_concurrent_ops(), 1);
}

#[tokio::test]
async fn test_disconnect_fails_every_queued_command() {
    let (adapter, session) = connected_echo(SessionConfig::testing()).await;
    adapter.hold_acks();

    let pending = {
        let session = session.clone();
        tokio::spawn(async move {
            let reads = (0..5).map(|_| session.read(ECHO_CHARACTERISTIC_UUID));
            join_all(reads).await
        })
    };
    wait_for_ops_in_flight(&adapter, 1).await;
    assert_eq!(session.snapshot().await.unwrap().queued_commands, 5);

    session.disconnect().await.unwrap();
    let results = timeout(Duration::from_secs(1), pending)
        .await
        .expect("every command resolved")
        .unwrap();

    assert_eq!(results.len(), 5);
    for result in results {
        assert!(
            matches!(result, Err(BleError::Disconnected { .. })),
            "got {:?}",
            result
        );
    }
    adapter.open_gate();
    assert_eq!(session.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_link_loss_fails_every_queued_command() {
    let (adapter, session) = connected_echo(SessionConfig::testing()).await;
    adapter.hold_acks();

    let pending = {
        let session = session.clone();
        tokio::spawn(async move {
            let session = &session;
            let writes = (0u8..3).map(|i| async move {
                session
                    .write(ECHO_CHARACTERISTIC_UUID, &[i], WriteMode::WithResponse)
                    .await
            });
            join_all(writes).await
        })
    };
    wait_for_ops_in_flight(&adapter, 1).await;

    adapter.inject_disconnect(&ECHO.into(), "connection terminated by peer");
    let results = timeout(Duration::from_secs(1), pending)
        .await
        .expect("every command resolved")
        .unwrap();
    assert!(results.iter().all(|r| matches!(r, Err(BleError::Disconnected { .. }))));

    // The in-flight ack arriving after teardown changes nothing
    adapter.open_gate();
    sleep(Duration::from_millis(20)).await;
    assert_eq!(session.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_timeout_does_not_block_the_queue() {
    let hrm = heart_rate_monitor(HRM);
    let location = hrm.handle_of(uuid_from_u16(0x2a38)).unwrap();
    let sighting = hrm.sighting();
    let adapter = Arc::new(SimulatedAdapter::ideal().with_peripheral(hrm));
    adapter.hang_operation(location);

    let config = SessionConfig::testing().with_command_timeout(Some(Duration::from_millis(50)));
    let session = Session::new(adapter.clone(), sighting, config).unwrap();
    session.connect().await.unwrap();

    let (stuck, next) = tokio::join!(
        session.read(uuid_from_u16(0x2a38)),
        session.read(uuid_from_u16(0x2a19)),
    );
    let err = stuck.unwrap_err();
    assert!(matches!(err, BleError::Timeout { .. }), "got {:?}", err);
    assert_eq!(next.unwrap(), vec![0x64]);
    assert_eq!(session.state(), ConnectionState::Ready);
}

#[tokio::test]
async fn test_late_ack_after_timeout_is_ignored() {
    let (adapter, session) = connected_echo(SessionConfig::testing()).await;
    session
        .write(ECHO_CHARACTERISTIC_UUID, b"v1", WriteMode::WithResponse)
        .await
        .unwrap();
    adapter.hold_acks();

    let err = session
        .read_with_timeout(ECHO_CHARACTERISTIC_UUID, Some(Duration::from_millis(20)))
        .await
        .unwrap_err();
    assert!(err.is_timeout());

    // Release the abandoned read; its completion must not resolve anything else
    adapter.open_gate();
    sleep(Duration::from_millis(20)).await;

    assert_eq!(session.read(ECHO_CHARACTERISTIC_UUID).await.unwrap(), b"v1");
    assert_eq!(session.state(), ConnectionState::Ready);
}

#[tokio::test]
async fn test_operation_errors_reach_the_caller() {
    let hrm = heart_rate_monitor(HRM);
    let location = hrm.handle_of(uuid_from_u16(0x2a38)).unwrap();
    let sighting = hrm.sighting();
    let adapter = Arc::new(SimulatedAdapter::ideal().with_peripheral(hrm));
    let session = Session::new(adapter.clone(), sighting, SessionConfig::testing()).unwrap();
    session.connect().await.unwrap();

    adapter.fail_operation(location, "insufficient authentication");
    let err = session.read(uuid_from_u16(0x2a38)).await.unwrap_err();
    assert!(matches!(err, BleError::Operation { .. }), "got {:?}", err);
    assert!(err.to_string().contains("insufficient authentication"));

    // Read-only characteristic rejects writes
    let err = session
        .write(uuid_from_u16(0x2a19), &[0x01], WriteMode::WithResponse)
        .await
        .unwrap_err();
    assert!(matches!(err, BleError::Operation { .. }));

    // Unknown characteristic never reaches the backend
    let err = session.read(uuid_from_u16(0x2a00)).await.unwrap_err();
    assert!(matches!(err, BleError::CharacteristicNotFound { .. }));

    // Failures do not disturb the session
    assert_eq!(session.read(uuid_from_u16(0x2a19)).await.unwrap(), vec![0x64]);
    assert_eq!(session.state(), ConnectionState::Ready);
}

#[tokio::test]
async fn test_descriptor_read_and_write() {
    init_tracing();
    let hrm = heart_rate_monitor(HRM);
    let sighting = hrm.sighting();
    let adapter = Arc::new(SimulatedAdapter::ideal().with_peripheral(hrm));
    let session = Session::new(adapter.clone(), sighting, SessionConfig::testing()).unwrap();
    session.connect().await.unwrap();

    let cccd = DescriptorSelector::Under {
        characteristic: CharacteristicSelector::from(uuid_from_u16(0x2a37)),
        descriptor: CCCD_UUID,
    };
    assert_eq!(session.read_descriptor(cccd.clone()).await.unwrap(), vec![0, 0]);

    session.write_descriptor(cccd.clone(), &[0x01, 0x00]).await.unwrap();
    assert_eq!(session.read_descriptor(cccd).await.unwrap(), vec![0x01, 0x00]);

    let tree = session.discover().await.unwrap();
    let reference = tree
        .characteristics()
        .find(|c| c.uuid == uuid_from_u16(0x2a37))
        .and_then(|c| c.descriptor(CCCD_UUID))
        .map(|d| d.reference())
        .unwrap();
    assert_eq!(session.read_descriptor(reference).await.unwrap(), vec![0x01, 0x00]);

    let missing = DescriptorSelector::Under {
        characteristic: CharacteristicSelector::from(uuid_from_u16(0x2a38)),
        descriptor: CCCD_UUID,
    };
    let err = session.read_descriptor(missing).await.unwrap_err();
    assert!(matches!(err, BleError::DescriptorNotFound { .. }));
}

#[tokio::test]
async fn test_mtu_tracking() {
    let (adapter, session) = connected_echo(SessionConfig::testing()).await;
    let mut notices = session.notices();

    assert_eq!(session.mtu().await.unwrap(), 185);
    assert_eq!(session.max_write_without_response_size().await.unwrap(), 182);

    assert!(adapter.change_mtu(&ECHO.into(), 247));
    let mtu = timeout(Duration::from_secs(1), async {
        loop {
            if let Ok(SessionNotice::MtuChanged { mtu }) = notices.recv().await {
                return mtu;
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(mtu, 247);
    assert_eq!(session.max_write_without_response_size().await.unwrap(), 244);

    // Back to the ATT default once the link is gone
    session.disconnect().await.unwrap();
    assert_eq!(session.mtu().await.unwrap(), 23);
}
