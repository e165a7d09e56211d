//! Mock instrument harness shared by the integration tests.
//!
//! Every `open()` creates a fresh in-memory duplex pipe. The manager gets one
//! end as its serial port; the other end (the "instrument") is handed to the
//! test through a channel so it can stream lines and read commands.

#![allow(dead_code)]

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::Notify;
use volt_daq::serial::{DynSerial, SerialOptions, StreamOpener};
use volt_daq::{
    AcquisitionSettings, AppResult, ConnectOptions, ConnectionManager, ConnectionState, DaqError,
    SamplingMode, Store,
};

/// Opens duplex pipes and passes the instrument end to the test.
pub struct DuplexOpener {
    instruments: UnboundedSender<DuplexStream>,
}

#[async_trait]
impl StreamOpener for DuplexOpener {
    async fn open(&self, _options: &SerialOptions) -> AppResult<DynSerial> {
        let (instrument, port) = tokio::io::duplex(1024);
        self.instruments
            .send(instrument)
            .map_err(|_| DaqError::Connection("test harness dropped".to_string()))?;
        Ok(Box::new(port))
    }
}

/// Like [`DuplexOpener`], but each open waits until the gate is opened.
pub struct GatedOpener {
    pub gate: Arc<Notify>,
    inner: DuplexOpener,
}

#[async_trait]
impl StreamOpener for GatedOpener {
    async fn open(&self, options: &SerialOptions) -> AppResult<DynSerial> {
        self.gate.notified().await;
        self.inner.open(options).await
    }
}

/// Always fails, like a port that does not exist.
pub struct FailingOpener;

#[async_trait]
impl StreamOpener for FailingOpener {
    async fn open(&self, options: &SerialOptions) -> AppResult<DynSerial> {
        Err(DaqError::Connection(format!(
            "{}: No such file or directory",
            options.port
        )))
    }
}

/// Manager wired to a [`DuplexOpener`].
pub struct Harness {
    pub manager: ConnectionManager,
    pub store: Store,
    instruments: UnboundedReceiver<DuplexStream>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_settings(AcquisitionSettings::default())
    }

    pub fn with_settings(settings: AcquisitionSettings) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self::build(Arc::new(DuplexOpener { instruments: tx }), settings, rx)
    }

    /// Harness whose opens block until the returned gate is notified.
    pub fn gated() -> (Self, Arc<Notify>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let gate = Arc::new(Notify::new());
        let opener = GatedOpener {
            gate: Arc::clone(&gate),
            inner: DuplexOpener { instruments: tx },
        };
        let harness = Self::build(Arc::new(opener), AcquisitionSettings::default(), rx);
        (harness, gate)
    }

    fn build(
        opener: Arc<dyn StreamOpener>,
        settings: AcquisitionSettings,
        instruments: UnboundedReceiver<DuplexStream>,
    ) -> Self {
        let store = Store::new();
        let manager = ConnectionManager::new(opener, settings, store.clone());
        Self {
            manager,
            store,
            instruments,
        }
    }

    /// Instrument end of the most recent successful open.
    pub async fn next_instrument(&mut self) -> Instrument {
        let stream = self
            .instruments
            .recv()
            .await
            .expect("opener should hand over the instrument end");
        Instrument { stream }
    }

    /// Open a session and return the instrument end of its stream.
    pub async fn open(&mut self, mode: SamplingMode) -> Instrument {
        self.manager
            .open(&options(mode))
            .await
            .expect("open should succeed");
        self.next_instrument().await
    }

    /// Poll until `history_len() >= n`.
    pub async fn wait_for_records(&self, n: usize) {
        let store = self.store.clone();
        wait_until(&format!("{n} records"), move || store.history_len() >= n).await;
    }

    /// Poll until the manager reaches `state`.
    pub async fn wait_for_state(&self, state: ConnectionState) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while self.manager.state().await != state {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for state {state}"));
    }
}

/// Test side of the pipe.
pub struct Instrument {
    pub stream: DuplexStream,
}

impl Instrument {
    /// Write raw bytes as one chunk.
    pub async fn send(&mut self, bytes: &[u8]) {
        self.stream.write_all(bytes).await.expect("instrument write");
        self.stream.flush().await.expect("instrument flush");
    }

    /// Read exactly `len` bytes written by the manager.
    pub async fn receive(&mut self, len: usize) -> String {
        let mut buf = vec![0u8; len];
        tokio::time::timeout(Duration::from_secs(5), self.stream.read_exact(&mut buf))
            .await
            .expect("timed out waiting for a command")
            .expect("instrument read");
        String::from_utf8(buf).expect("commands are ASCII")
    }
}

pub fn options(mode: SamplingMode) -> ConnectOptions {
    ConnectOptions {
        serial: SerialOptions {
            port: "/dev/ttyMOCK0".to_string(),
            baud_rate: 115_200,
            buffer_size: 64,
        },
        sampling_mode: mode,
    }
}

pub async fn wait_until<F: Fn() -> bool>(what: &str, condition: F) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {what}"));
}
