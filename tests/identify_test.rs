//! Device identity query.

mod common;

use common::Harness;
use std::time::Duration;
use volt_daq::store::DeviceInfo;
use volt_daq::{ConnectionState, DaqError, SamplingMode};

const TIMEOUT: Duration = Duration::from_secs(1);

#[tokio::test]
async fn identify_resolves_known_device() {
    let mut harness = Harness::new();
    let mut instrument = harness.open(SamplingMode::Periodic).await;

    let responder = tokio::spawn(async move {
        let query = instrument.receive(4).await;
        // Data already in flight is skipped
        instrument.send(b"0.5,0.6\nID=VOL").await;
        instrument.send(b"T0\r\n").await;
        (query, instrument)
    });

    let device = harness.manager.identify(TIMEOUT).await.unwrap();
    let (query, _instrument) = responder.await.unwrap();

    assert_eq!(query, ">ID\n");
    assert_eq!(
        device,
        DeviceInfo {
            id: Some("VOLT0".to_string()),
            name: "USB Voltmeter".to_string(),
        }
    );
    assert_eq!(harness.store.device(), device);
    // Identity lines never reach history
    assert_eq!(harness.store.history_len(), 0);
}

#[tokio::test]
async fn unknown_id_is_reported_as_unknown_device() {
    let mut harness = Harness::new();
    let mut instrument = harness.open(SamplingMode::Periodic).await;

    let responder = tokio::spawn(async move {
        instrument.receive(4).await;
        instrument.send(b"ID=AMP3\n").await;
        instrument
    });

    let device = harness.manager.identify(TIMEOUT).await.unwrap();
    let _instrument = responder.await.unwrap();

    assert_eq!(device.id.as_deref(), Some("AMP3"));
    assert_eq!(device.name, "Unknown Device");
}

#[tokio::test]
async fn data_after_id_reply_reaches_history() {
    let mut harness = Harness::new();
    let mut instrument = harness.open(SamplingMode::Manual).await;

    let responder = tokio::spawn(async move {
        instrument.receive(4).await;
        instrument.send(b"ID=VOLT0\r\n1.5\r\n2").await;
        instrument
    });
    harness.manager.identify(TIMEOUT).await.unwrap();
    let mut instrument = responder.await.unwrap();
    assert_eq!(harness.store.history_len(), 0);

    harness.manager.start_acquisition().await.unwrap();
    instrument.send(b"5\n").await;
    harness.wait_for_records(2).await;

    let fields: Vec<_> = harness
        .store
        .history()
        .into_iter()
        .map(|record| record.fields)
        .collect();
    assert_eq!(fields, vec![vec![Some(1.5)], vec![Some(25.0)]]);
}

#[tokio::test(start_paused = true)]
async fn timeout_releases_read_side_for_acquisition() {
    let mut harness = Harness::new();
    let mut instrument = harness.open(SamplingMode::Manual).await;

    let err = harness.manager.identify(TIMEOUT).await.unwrap_err();

    assert!(matches!(
        err,
        DaqError::ResponseTimeout {
            timeout_ms: 1000,
            ..
        }
    ));
    assert_eq!(instrument.receive(4).await, ">ID\n");
    assert_eq!(harness.manager.state().await, ConnectionState::Open);
    assert_eq!(harness.store.device().name, "None");

    harness.manager.start_acquisition().await.unwrap();
    instrument.send(b"3\n").await;
    harness.wait_for_records(1).await;
    assert_eq!(harness.store.history()[0].fields, vec![Some(3.0)]);
}

#[tokio::test]
async fn identify_during_acquisition_is_busy() {
    let mut harness = Harness::new();
    let _instrument = harness.open(SamplingMode::Periodic).await;
    harness.manager.start_acquisition().await.unwrap();

    let err = harness.manager.identify(TIMEOUT).await.unwrap_err();

    assert!(matches!(err, DaqError::ReadBusy));
    assert!(harness.manager.is_acquiring().await);
}

#[tokio::test]
async fn identify_requires_open_session() {
    let harness = Harness::new();
    let err = harness.manager.identify(TIMEOUT).await.unwrap_err();
    assert!(matches!(err, DaqError::NotConnected));
}

#[tokio::test]
async fn hangup_during_identify_loses_session() {
    let mut harness = Harness::new();
    let mut instrument = harness.open(SamplingMode::Periodic).await;

    let responder = tokio::spawn(async move {
        instrument.receive(4).await;
        drop(instrument);
    });

    let err = harness.manager.identify(TIMEOUT).await.unwrap_err();
    responder.await.unwrap();

    assert!(matches!(err, DaqError::StreamLost(_)));
    assert_eq!(harness.manager.state().await, ConnectionState::Lost);
    assert!(harness.store.status().error.is_some());
}

#[tokio::test]
async fn close_forgets_device() {
    let mut harness = Harness::new();
    let mut instrument = harness.open(SamplingMode::Periodic).await;

    let responder = tokio::spawn(async move {
        instrument.receive(4).await;
        instrument.send(b"ID=VOLT0\n").await;
        instrument
    });
    harness.manager.identify(TIMEOUT).await.unwrap();
    let _instrument = responder.await.unwrap();
    assert_eq!(harness.store.device().name, "USB Voltmeter");

    harness.manager.close().await;

    assert_eq!(harness.store.device(), DeviceInfo::default());
}
