//! # volt_daq
//!
//! Acquisition core for line-oriented serial measurement instruments such as
//! the USB voltmeter. The instrument streams ASCII lines of comma-separated
//! readings; this crate turns that stream into labelled records, keeps the
//! latest record and the session history available to consumers, exports the
//! history as CSV, and encodes configuration commands back to the device.
//!
//! ## Crate Structure
//!
//! - **`command`**: The `Codebook` that maps sampling-period and range labels
//!   to the device's single-character command codes.
//! - **`framing`**: Incremental UTF-8 decoding and `LineFramer`, which
//!   reassembles lines split across reads.
//! - **`record`**: `RecordParser` and the `Record` type (one optional number per
//!   field).
//! - **`clock`**: `SamplingClock`, labelling records with elapsed time or an index.
//! - **`connection`**: `ConnectionManager`, owning the stream lifecycle, the
//!   ingestion task, command writes and the identity query.
//! - **`store`**: The observable `Store` holding latest record, history,
//!   connection status and device identity.
//! - **`export`**: CSV export of session history.
//! - **`serial`**: Stream abstraction and the `tokio-serial` opener.
//! - **`config`**: Figment-based configuration loading and validation.
//! - **`error`**: The crate-wide `DaqError`.
//! - **`tracing_setup`**: Subscriber initialization for the CLI.
//!
//! ## Data flow
//!
//! ```text
//! serial read -> ChunkDecoder -> LineFramer -> RecordParser + SamplingClock -> Store
//!                                                                              |
//!                                                         export_csv <---------+
//! Codebook::encode -> ConnectionManager::send_command -> serial write
//! ```

pub mod clock;
pub mod command;
pub mod config;
pub mod connection;
pub mod error;
pub mod export;
pub mod framing;
pub mod record;
pub mod serial;
pub mod store;
pub mod tracing_setup;

pub use clock::{RecordLabel, SamplingClock, SamplingMode};
pub use command::{Codebook, DeviceCommand};
pub use connection::{AcquisitionSettings, ConnectOptions, ConnectionManager, ConnectionState};
pub use error::{AppResult, DaqError};
pub use record::{Record, RecordParser};
pub use store::{ConnectionStatus, DeviceInfo, Store, StoreEvent};
