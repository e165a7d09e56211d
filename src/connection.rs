//! Connection lifecycle and the ingestion task.
//!
//! [`ConnectionManager`] owns the instrument stream for one session at a
//! time. Opening splits the stream into independently locked read and write
//! halves:
//!
//! - the read half is held by exactly one reader (the ingestion task, or a
//!   bounded identity query), so there is never more than one read
//!   outstanding;
//! - the write half is locked only for the duration of a single command write.
//!
//! ```text
//! Closed --open()--> Open --close()----------> Closed
//!                     |
//!                     +--EOF / I/O error / notify_disconnected()--> Lost
//! ```
//!
//! `Lost` tears down exactly like `close()` and additionally publishes the
//! reason through the [`Store`]. Leaving `Closed` or `Lost` always takes a new
//! `open()`.

use crate::clock::{SamplingClock, SamplingMode};
use crate::command::{Codebook, DeviceCommand};
use crate::error::{AppResult, DaqError};
use crate::framing::{ChunkDecoder, FramingConfig, LineFramer};
use crate::record::RecordParser;
use crate::serial::{DynSerial, SerialOptions, StreamOpener};
use crate::store::{ConnectionStatus, DeviceInfo, Store};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, info_span, warn, Instrument};

/// Prefix of the device's identity reply.
const ID_PREFIX: &str = "ID=";

/// Name used for ids missing from the device directory.
pub const UNKNOWN_DEVICE: &str = "Unknown Device";

// =============================================================================
// Settings
// =============================================================================

/// Lifecycle state of the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// No stream
    #[default]
    Closed,
    /// Session active
    Open,
    /// Stream failed or device went away; needs a fresh `open`
    Lost,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Closed => write!(f, "closed"),
            ConnectionState::Open => write!(f, "open"),
            ConnectionState::Lost => write!(f, "lost"),
        }
    }
}

/// Per-session parameters passed to [`ConnectionManager::open`].
#[derive(Debug, Clone, Default)]
pub struct ConnectOptions {
    /// Port, baud rate and buffer size
    pub serial: SerialOptions,
    /// Record labelling for the whole session
    pub sampling_mode: SamplingMode,
}

/// Maps device ids to display names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceDirectory(BTreeMap<String, String>);

impl Default for DeviceDirectory {
    fn default() -> Self {
        let mut names = BTreeMap::new();
        names.insert("VOLT0".to_string(), "USB Voltmeter".to_string());
        Self(names)
    }
}

impl From<BTreeMap<String, String>> for DeviceDirectory {
    fn from(names: BTreeMap<String, String>) -> Self {
        Self(names)
    }
}

impl DeviceDirectory {
    /// Display name for `id`.
    pub fn name_of(&self, id: &str) -> &str {
        self.0.get(id).map_or(UNKNOWN_DEVICE, String::as_str)
    }
}

/// Long-lived settings shared by every session of a manager.
#[derive(Debug, Clone)]
pub struct AcquisitionSettings {
    /// Line framing and field separator
    pub framing: FramingConfig,
    /// Command tables for the attached firmware
    pub codebook: Codebook,
    /// Known device ids
    pub devices: DeviceDirectory,
}

impl Default for AcquisitionSettings {
    fn default() -> Self {
        Self {
            framing: FramingConfig::default(),
            codebook: Codebook::usb_voltmeter(),
            devices: DeviceDirectory::default(),
        }
    }
}

// =============================================================================
// Internal state
// =============================================================================

type SharedReader = Arc<Mutex<ReadHalf<DynSerial>>>;
type SharedWriter = Arc<Mutex<WriteHalf<DynSerial>>>;

struct Link {
    reader: SharedReader,
    writer: SharedWriter,
    buffer_size: usize,
}

struct Acquisition {
    session: u64,
    stop_tx: watch::Sender<bool>,
    handle: JoinHandle<SamplingClock>,
}

impl Acquisition {
    /// Signal the task and wait for it to exit.
    async fn stop(self) -> Option<SamplingClock> {
        let _ = self.stop_tx.send(true);
        match self.handle.await {
            Ok(clock) => Some(clock),
            Err(e) => {
                error!(error = %e, "Ingestion task failed");
                None
            }
        }
    }
}

#[derive(Default)]
struct Inner {
    state: ConnectionState,
    session: u64,
    mode: SamplingMode,
    link: Option<Link>,
    clock: Option<SamplingClock>,
    acquisition: Option<Acquisition>,
    // Bytes that followed the identity reply, replayed by the next run
    backlog: Vec<u8>,
}

impl Inner {
    /// Move to `Lost` if `session` is still the open one.
    ///
    /// Returns the acquisition (already signalled) so an outside caller can
    /// wait for it; the ingestion task itself just drops it.
    fn lose(&mut self, session: u64, reason: &str, store: &Store) -> Option<Acquisition> {
        if self.session != session || self.state != ConnectionState::Open {
            return None;
        }

        error!(session, reason, "Connection lost");
        self.state = ConnectionState::Lost;
        self.link = None;
        self.clock = None;
        self.backlog.clear();
        let acquisition = self.acquisition.take();
        if let Some(acquisition) = &acquisition {
            let _ = acquisition.stop_tx.send(true);
        }

        store.set_status(ConnectionStatus {
            connected: false,
            error: Some(reason.to_string()),
        });
        store.notify(reason);
        acquisition
    }
}

// =============================================================================
// ConnectionManager
// =============================================================================

/// Owns the stream, the ingestion task and the session lifecycle.
#[derive(Clone)]
pub struct ConnectionManager {
    opener: Arc<dyn StreamOpener>,
    settings: Arc<AcquisitionSettings>,
    store: Store,
    inner: Arc<Mutex<Inner>>,
}

impl fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("settings", &self.settings)
            .field("store", &self.store)
            .finish_non_exhaustive()
    }
}

impl ConnectionManager {
    /// Create a closed manager publishing into `store`.
    pub fn new(opener: Arc<dyn StreamOpener>, settings: AcquisitionSettings, store: Store) -> Self {
        Self {
            opener,
            settings: Arc::new(settings),
            store,
            inner: Arc::new(Mutex::new(Inner::default())),
        }
    }

    /// Store the manager publishes into.
    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Codebook used by [`configure`](Self::configure).
    pub fn codebook(&self) -> &Codebook {
        &self.settings.codebook
    }

    /// Current lifecycle state.
    pub async fn state(&self) -> ConnectionState {
        self.inner.lock().await.state
    }

    /// Sampling mode of the current (or last) session.
    pub async fn sampling_mode(&self) -> SamplingMode {
        self.inner.lock().await.mode
    }

    /// Whether the ingestion task is running.
    pub async fn is_acquiring(&self) -> bool {
        self.inner.lock().await.acquisition.is_some()
    }

    /// Open the stream and start a new session.
    ///
    /// History is cleared only once the stream is actually open. The manager
    /// is not locked while the port opens, so status queries and `close()`
    /// stay responsive.
    pub async fn open(&self, options: &ConnectOptions) -> AppResult<()> {
        if self.inner.lock().await.state == ConnectionState::Open {
            return Err(DaqError::AlreadyOpen);
        }

        let stream = match self.opener.open(&options.serial).await {
            Ok(stream) => stream,
            Err(e) => {
                error!(port = %options.serial.port, error = %e, "Error during serial connection");
                self.store.set_status(ConnectionStatus {
                    connected: false,
                    error: Some(e.to_string()),
                });
                return Err(e);
            }
        };

        let mut inner = self.inner.lock().await;
        if inner.state == ConnectionState::Open {
            // A concurrent open won; dropping the stream closes this port again
            warn!(port = %options.serial.port, "Session opened while port was opening");
            return Err(DaqError::AlreadyOpen);
        }

        let (reader, writer) = tokio::io::split(stream);
        inner.session += 1;
        inner.state = ConnectionState::Open;
        inner.mode = options.sampling_mode;
        inner.backlog.clear();
        inner.clock = Some(SamplingClock::start(options.sampling_mode));
        inner.link = Some(Link {
            reader: Arc::new(Mutex::new(reader)),
            writer: Arc::new(Mutex::new(writer)),
            buffer_size: options.serial.buffer_size.max(1),
        });
        let session = inner.session;
        drop(inner);

        info!(
            session,
            port = %options.serial.port,
            baud_rate = options.serial.baud_rate,
            mode = ?options.sampling_mode,
            "Serial port opened successfully"
        );
        self.store.start_session();
        self.store.set_status(ConnectionStatus {
            connected: true,
            error: None,
        });
        Ok(())
    }

    /// Stop acquisition and close the stream. Safe to call in any state.
    pub async fn close(&self) {
        let acquisition = self.inner.lock().await.acquisition.take();
        if let Some(acquisition) = acquisition {
            acquisition.stop().await;
        }

        let mut inner = self.inner.lock().await;
        let previous = inner.state;
        inner.state = ConnectionState::Closed;
        inner.link = None;
        inner.clock = None;
        inner.backlog.clear();
        drop(inner);

        if previous != ConnectionState::Closed {
            info!(from = %previous, "Connection closed");
        }
        self.store.set_device(DeviceInfo::default());
        self.store.set_status(ConnectionStatus::default());
    }

    /// Report an externally observed disconnect (e.g. USB unplug).
    ///
    /// No-op unless a session is open.
    pub async fn notify_disconnected(&self, reason: &str) {
        let acquisition = {
            let mut inner = self.inner.lock().await;
            let session = inner.session;
            inner.lose(session, reason, &self.store)
        };
        if let Some(acquisition) = acquisition {
            acquisition.stop().await;
        }
    }

    /// Start the ingestion task. Does nothing if it is already running.
    pub async fn start_acquisition(&self) -> AppResult<()> {
        let mut inner = self.inner.lock().await;
        if inner.state != ConnectionState::Open {
            return Err(DaqError::NotConnected);
        }
        if inner.acquisition.is_some() {
            debug!("Acquisition already running");
            return Ok(());
        }

        let (reader, buffer_size) = match &inner.link {
            Some(link) => (Arc::clone(&link.reader), link.buffer_size),
            None => return Err(DaqError::NotConnected),
        };
        let mode = inner.mode;
        let clock = inner
            .clock
            .take()
            .unwrap_or_else(|| SamplingClock::start(mode));
        let session = inner.session;
        let backlog = std::mem::take(&mut inner.backlog);
        let (stop_tx, stop_rx) = watch::channel(false);

        let task = Ingestion {
            session,
            backlog,
            reader,
            buffer_size,
            framing: self.settings.framing.clone(),
            store: self.store.clone(),
            inner: Arc::clone(&self.inner),
        };
        let handle = tokio::spawn(
            task.run(clock, stop_rx)
                .instrument(info_span!("ingest", session)),
        );

        inner.acquisition = Some(Acquisition {
            session,
            stop_tx,
            handle,
        });
        info!(session, ?mode, "Acquisition started");
        Ok(())
    }

    /// Stop the ingestion task and wait for it to exit.
    ///
    /// Once this returns no further records are appended for the session.
    /// Any partial line buffered at that point is discarded.
    pub async fn stop_acquisition(&self) {
        let acquisition = self.inner.lock().await.acquisition.take();
        let Some(acquisition) = acquisition else {
            return;
        };

        let session = acquisition.session;
        let clock = acquisition.stop().await;

        let mut inner = self.inner.lock().await;
        if inner.session == session && inner.state == ConnectionState::Open {
            inner.clock = clock;
        }
        info!(session, "Acquisition stopped");
    }

    /// Write a framed command.
    ///
    /// The write half is held only for this write. A write failure loses the
    /// session.
    pub async fn send_command(&self, command: &DeviceCommand) -> AppResult<()> {
        let (writer, session) = {
            let inner = self.inner.lock().await;
            match (&inner.link, inner.state) {
                (Some(link), ConnectionState::Open) => (Arc::clone(&link.writer), inner.session),
                _ => {
                    drop(inner);
                    error!(%command, "Port not open");
                    self.store.set_status(ConnectionStatus {
                        connected: false,
                        error: Some(DaqError::NotConnected.to_string()),
                    });
                    return Err(DaqError::NotConnected);
                }
            }
        };

        let result = {
            let mut writer = writer.lock().await;
            match writer.write_all(command.as_bytes()).await {
                Ok(()) => writer.flush().await,
                Err(e) => Err(e),
            }
        };

        match result {
            Ok(()) => {
                debug!(%command, "Sent command");
                Ok(())
            }
            Err(e) => {
                let reason = format!("Failed to send command: {e}");
                let acquisition = self.inner.lock().await.lose(session, &reason, &self.store);
                if let Some(acquisition) = acquisition {
                    acquisition.stop().await;
                }
                Err(DaqError::StreamLost(reason))
            }
        }
    }

    /// Encode a configuration command with the codebook and send it.
    ///
    /// An unknown label fails only this call; the session is untouched.
    pub async fn configure(&self, period_label: &str, range_label: &str) -> AppResult<()> {
        let command = self
            .settings
            .codebook
            .encode(period_label, range_label)
            .inspect_err(|e| warn!(error = %e, "Error in sending serial command"))?;
        self.send_command(&command).await
    }

    /// Ask the device for its identity and publish it.
    ///
    /// Lines before the `ID=` reply are skipped; data after it in the same
    /// read is kept and delivered by the next acquisition run. On timeout the
    /// read side is released again and the session stays usable, but data
    /// read during the wait is dropped.
    pub async fn identify(&self, timeout: Duration) -> AppResult<DeviceInfo> {
        let (reader, buffer_size, session) = {
            let inner = self.inner.lock().await;
            if inner.acquisition.is_some() {
                return Err(DaqError::ReadBusy);
            }
            match (&inner.link, inner.state) {
                (Some(link), ConnectionState::Open) => {
                    (Arc::clone(&link.reader), link.buffer_size, inner.session)
                }
                _ => return Err(DaqError::NotConnected),
            }
        };

        let mut guard = reader.try_lock().map_err(|_| DaqError::ReadBusy)?;
        self.send_command(&self.settings.codebook.identify_query())
            .await?;

        let outcome = tokio::time::timeout(
            timeout,
            read_id_reply(&mut *guard, buffer_size, &self.settings.framing),
        )
        .await;
        // Release the read side whatever happened
        drop(guard);

        match outcome {
            Err(_) => {
                warn!(timeout_ms = timeout.as_millis() as u64, "Timeout waiting for device ID");
                Err(DaqError::ResponseTimeout {
                    waiting_for: "device ID".to_string(),
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
            Ok(Err(e)) => {
                if let DaqError::StreamLost(reason) = &e {
                    let acquisition = self.inner.lock().await.lose(session, reason, &self.store);
                    drop(acquisition);
                }
                Err(e)
            }
            Ok(Ok((id, backlog))) => {
                if !backlog.is_empty() {
                    let mut inner = self.inner.lock().await;
                    if inner.session == session && inner.acquisition.is_none() {
                        inner.backlog = backlog;
                    } else {
                        debug!(bytes = backlog.len(), "Dropping data that followed the ID reply");
                    }
                }
                let device = DeviceInfo {
                    name: self.settings.devices.name_of(&id).to_string(),
                    id: Some(id),
                };
                info!(id = ?device.id, name = %device.name, "Device identified");
                self.store.set_device(device.clone());
                Ok(device)
            }
        }
    }
}

/// Read until a line starting with `ID=` arrives.
///
/// Returns the id and whatever was read after the reply line, re-encoded so
/// that a fresh decoder and framer pick up exactly where this one stopped.
async fn read_id_reply<R>(
    reader: &mut R,
    buffer_size: usize,
    framing: &FramingConfig,
) -> AppResult<(String, Vec<u8>)>
where
    R: AsyncRead + Unpin,
{
    let mut decoder = ChunkDecoder::new();
    let mut framer = LineFramer::new(framing);
    let mut buf = vec![0u8; buffer_size];

    loop {
        let n = reader
            .read(&mut buf)
            .await
            .map_err(|e| DaqError::StreamLost(e.to_string()))?;
        if n == 0 {
            return Err(DaqError::StreamLost(
                "Serial port closed while waiting for ID".to_string(),
            ));
        }

        let mut lines = framer.feed(&decoder.decode(&buf[..n])).into_iter();
        while let Some(line) = lines.next() {
            let Some(id) = line.trim().strip_prefix(ID_PREFIX) else {
                debug!(%line, "Skipping line while waiting for ID");
                continue;
            };

            let mut rest = String::new();
            for later in lines.by_ref() {
                rest.push_str(&later);
                rest.push(framing.terminator);
            }
            rest.push_str(&framer.take_buffered());
            let mut backlog = rest.into_bytes();
            backlog.extend(decoder.take_pending());

            return Ok((id.trim().to_string(), backlog));
        }
    }
}

// =============================================================================
// Ingestion task
// =============================================================================

enum Exit {
    Stopped,
    Lost(String),
}

struct Ingestion {
    session: u64,
    backlog: Vec<u8>,
    reader: SharedReader,
    buffer_size: usize,
    framing: FramingConfig,
    store: Store,
    inner: Arc<Mutex<Inner>>,
}

impl Ingestion {
    /// Read, frame, parse and publish until stopped or the stream ends.
    ///
    /// Returns the clock so a later run in the same session keeps labelling
    /// where this one left off.
    async fn run(self, mut clock: SamplingClock, mut stop: watch::Receiver<bool>) -> SamplingClock {
        let parser = RecordParser::new(self.framing.separator);
        let mut decoder = ChunkDecoder::new();
        let mut framer = LineFramer::new(&self.framing);
        let mut buf = vec![0u8; self.buffer_size];

        if !self.backlog.is_empty() {
            debug!(bytes = self.backlog.len(), "Replaying data read with the ID reply");
            for line in framer.feed(&decoder.decode(&self.backlog)) {
                let record = parser.record(clock.next_label(), &line);
                self.store.publish(record);
            }
        }

        let mut reader = self.reader.lock().await;
        let exit = 'read: loop {
            if *stop.borrow() {
                break 'read Exit::Stopped;
            }

            let read = tokio::select! {
                biased;
                _ = stop.changed() => break 'read Exit::Stopped,
                read = reader.read(&mut buf) => read,
            };

            let n = match read {
                Ok(0) => break 'read Exit::Lost("Device was disconnected".to_string()),
                Ok(n) => n,
                Err(e) => break 'read Exit::Lost(format!("Lost connection to device: {e}")),
            };

            for line in framer.feed(&decoder.decode(&buf[..n])) {
                if *stop.borrow() {
                    break 'read Exit::Stopped;
                }
                let record = parser.record(clock.next_label(), &line);
                self.store.publish(record);
            }
        };
        drop(reader);

        let dropped = framer.discard();
        if dropped > 0 {
            debug!(bytes = dropped, "Discarded unterminated line");
        }

        match exit {
            Exit::Stopped => debug!(records = clock.emitted(), "Ingestion stopped"),
            Exit::Lost(reason) => {
                let acquisition = self.inner.lock().await.lose(self.session, &reason, &self.store);
                // That handle is this task
                drop(acquisition);
            }
        }

        clock
    }
}
