//! Integration tests for the scanner
//!
//! Scans run on paused tokio time so multi-second windows finish instantly.

use std::sync::Arc;

use blecentral_harness::{heart_rate_monitor, AdapterCall, SimulatedAdapter, SimulatedPeripheral};
use blecentral_runtime::{
    uuid_from_u16, Central, ClientConfig, PeripheralHandle, PeripheralId, ScanFilter, Scanner,
};
use futures::StreamExt;
use tokio::time::{timeout, Duration};

fn battery_tag(id: &str) -> SimulatedPeripheral {
    SimulatedPeripheral::new(id)
        .named("Tag")
        .advertising(&[0x180f])
        .with_rssi(-80)
}

fn ids(handles: &[PeripheralHandle]) -> Vec<PeripheralId> {
    handles.iter().map(|h| h.id.clone()).collect()
}

fn scripted_adapter() -> Arc<SimulatedAdapter> {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let adapter = SimulatedAdapter::ideal();
    let first = heart_rate_monitor("AA:AA:AA:AA:AA:01");
    let second = heart_rate_monitor("AA:AA:AA:AA:AA:02").with_rssi(-90);
    let tag = battery_tag("BB:BB:BB:BB:BB:01");

    adapter.script_peripheral(Duration::from_millis(100), &first);
    adapter.script_peripheral(Duration::from_millis(100), &tag);
    adapter.script_peripheral(Duration::from_millis(100), &first);
    adapter.script_peripheral(Duration::from_millis(700), &second);
    adapter.script_peripheral(Duration::from_millis(500), &first);
    // Outside a five second window
    adapter.script_peripheral(Duration::from_secs(6), &heart_rate_monitor("AA:AA:AA:AA:AA:03"));
    Arc::new(adapter)
}

#[tokio::test(start_paused = true)]
async fn test_service_filtered_scan_yields_each_peripheral_once() {
    let adapter = scripted_adapter();
    let scanner = Scanner::new(adapter.clone());

    let filter = ScanFilter::services(&["180D"])
        .unwrap()
        .with_timeout(Duration::from_secs(5));
    let found: Vec<_> = scanner.start_scan(filter).await.unwrap().collect().await;

    assert_eq!(
        ids(&found),
        vec![
            PeripheralId::new("AA:AA:AA:AA:AA:01"),
            PeripheralId::new("AA:AA:AA:AA:AA:02")
        ]
    );
    assert!(found
        .iter()
        .all(|h| h.advertisement.service_uuids.contains(&uuid_from_u16(0x180d))));

    // The timeout stopped the radio
    assert!(!scanner.is_scanning().await);
    assert!(!adapter.is_scanning());
    assert_eq!(adapter.calls().last(), Some(&AdapterCall::StopScan));
}

#[tokio::test(start_paused = true)]
async fn test_duplicates_are_reported_when_requested() {
    let adapter = scripted_adapter();
    let scanner = Scanner::new(adapter);

    let filter = ScanFilter::services(&["180D"])
        .unwrap()
        .with_timeout(Duration::from_secs(5))
        .with_duplicates(true);
    let found: Vec<_> = scanner.start_scan(filter).await.unwrap().collect().await;

    assert_eq!(found.len(), 4);
    // The snapshot still lists each peripheral once
    assert_eq!(scanner.discovered_devices().await.len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_rssi_and_name_filters() {
    let adapter = scripted_adapter();
    let scanner = Scanner::new(adapter);

    let filter = ScanFilter::new()
        .with_min_rssi(-70)
        .with_timeout(Duration::from_secs(5));
    let found = scanner.discover(filter).await.unwrap();
    assert_eq!(ids(&found), vec![PeripheralId::new("AA:AA:AA:AA:AA:01")]);

    let filter = ScanFilter::new()
        .with_name_prefix("Ta")
        .with_timeout(Duration::from_secs(5));
    let found = scanner.discover(filter).await.unwrap();
    assert_eq!(ids(&found), vec![PeripheralId::new("BB:BB:BB:BB:BB:01")]);
}

#[tokio::test(start_paused = true)]
async fn test_discover_defaults_to_five_second_window() {
    let adapter = scripted_adapter();
    let scanner = Scanner::new(adapter);

    let found = scanner.discover(ScanFilter::new()).await.unwrap();
    assert_eq!(
        ids(&found),
        vec![
            PeripheralId::new("AA:AA:AA:AA:AA:01"),
            PeripheralId::new("BB:BB:BB:BB:BB:01"),
            PeripheralId::new("AA:AA:AA:AA:AA:02")
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_removed_devices_leave_the_snapshot() {
    let adapter = SimulatedAdapter::ideal();
    let hrm = heart_rate_monitor("AA:AA:AA:AA:AA:01");
    let tag = battery_tag("BB:BB:BB:BB:BB:01");
    adapter.script_peripheral(Duration::from_millis(10), &hrm);
    adapter.script_peripheral(Duration::from_millis(10), &tag);
    adapter.script_removal(Duration::from_millis(10), hrm.id.clone());
    let scanner = Scanner::new(Arc::new(adapter));

    let found = scanner
        .discover(ScanFilter::new().with_timeout(Duration::from_secs(1)))
        .await
        .unwrap();
    assert_eq!(ids(&found), vec![tag.id.clone()]);
}

#[tokio::test]
async fn test_stop_scan_is_idempotent_and_scans_restart() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let adapter = Arc::new(SimulatedAdapter::ideal());
    let hrm = heart_rate_monitor("AA:AA:AA:AA:AA:01");
    adapter.script_peripheral(Duration::from_millis(1), &hrm);
    let scanner = Scanner::new(adapter.clone());

    scanner.stop_scan().await.unwrap();
    assert!(!adapter.calls().contains(&AdapterCall::StopScan));

    let mut stream = scanner.start_scan(ScanFilter::new()).await.unwrap();
    let first = timeout(Duration::from_secs(1), stream.next()).await.unwrap();
    assert_eq!(first.map(|h| h.id), Some(hrm.id.clone()));
    assert!(scanner.is_scanning().await);

    scanner.stop_scan().await.unwrap();
    scanner.stop_scan().await.unwrap();
    assert_eq!(timeout(Duration::from_secs(1), stream.next()).await.unwrap(), None);
    assert!(!adapter.is_scanning());

    // A new scan starts a fresh sequence
    let mut stream = scanner.start_scan(ScanFilter::new()).await.unwrap();
    let again = timeout(Duration::from_secs(1), stream.next()).await.unwrap();
    assert_eq!(again.map(|h| h.id), Some(hrm.id));
    scanner.stop_scan().await.unwrap();
}

#[tokio::test]
async fn test_scan_failure_is_reported() {
    let adapter = Arc::new(SimulatedAdapter::ideal());
    adapter.fail_scan("adapter powered off");
    let scanner = Scanner::new(adapter);

    let err = scanner.start_scan(ScanFilter::new()).await.err().unwrap();
    assert!(matches!(err, blecentral_runtime::BleError::Scan { .. }));
    assert!(!scanner.is_scanning().await);
}

#[tokio::test(start_paused = true)]
async fn test_find_device_by_address() {
    let adapter = scripted_adapter();
    let central = Central::new(adapter.clone(), ClientConfig::default()).unwrap();

    let found = central
        .scanner()
        .find_device_by_address("aa:aa:aa:aa:aa:02", Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(found.map(|h| h.id), Some(PeripheralId::new("AA:AA:AA:AA:AA:02")));
    assert!(!adapter.is_scanning());

    let missing = central
        .scanner()
        .find_device_by_address("CC:CC:CC:CC:CC:CC", Duration::from_secs(2))
        .await
        .unwrap();
    assert!(missing.is_none());
}

#[tokio::test(start_paused = true)]
async fn test_central_connects_to_scanned_peripheral() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let hrm = heart_rate_monitor("AA:AA:AA:AA:AA:01");
    let adapter = SimulatedAdapter::ideal().with_peripheral(hrm.clone());
    adapter.script_peripheral(Duration::from_millis(50), &hrm);
    let central = Central::new(Arc::new(adapter), ClientConfig::default()).unwrap();

    let mut stream = central
        .scan(ScanFilter::services(&["180d"]).unwrap())
        .await
        .unwrap();
    let handle = stream.next().await.unwrap();
    central.stop_scan().await.unwrap();

    let session = central.session(handle).unwrap();
    session.connect().await.unwrap();
    assert_eq!(session.read(uuid_from_u16(0x2a38)).await.unwrap(), vec![0x01]);
    session.close().await.unwrap();
}
