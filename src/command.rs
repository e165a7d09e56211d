//! Configuration command encoding.
//!
//! The instrument is configured with a short ASCII command built from two
//! single-character codes: one for the sampling period and one for the input
//! range. Which labels exist, which codes they map to, and how the command is
//! framed all depend on the firmware variant, so none of it is hard-coded
//! here. A [`Codebook`] carries the tables and framing bytes and is validated
//! once at construction; encoding against it can then only fail for labels
//! that are genuinely absent.
//!
//! # Example
//!
//! ```
//! use volt_daq::command::Codebook;
//!
//! let codebook = Codebook::usb_voltmeter();
//! let cmd = codebook.encode("10ms", "Auto").unwrap();
//! assert_eq!(cmd.as_str(), ">D0\n");
//! assert!(codebook.encode("bogus", "Auto").is_err());
//! ```

use crate::clock::SamplingMode;
use crate::error::{AppResult, DaqError};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use humantime_serde::re::humantime;
use std::time::Duration;

// =============================================================================
// Configuration form
// =============================================================================

/// One label → code mapping as it appears in configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeEntry {
    /// Human-readable label shown to the user (e.g. `"10ms"`)
    pub label: String,
    /// Single ASCII character sent to the device
    pub code: char,
}

impl CodeEntry {
    fn new(label: &str, code: char) -> Self {
        Self {
            label: label.to_string(),
            code,
        }
    }
}

/// Unvalidated codebook as loaded from TOML.
///
/// Convert with [`Codebook::try_from`] before use.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CodebookConfig {
    /// Leading marker of every command
    pub start: String,
    /// Terminator of every command
    pub terminator: String,
    /// Query that asks the device to report its identity
    pub identify: String,
    /// Period label that selects manual (device-triggered) sampling
    pub manual_label: Option<String>,
    /// Sampling-period table, in display order
    pub periods: Vec<CodeEntry>,
    /// Input-range table, in display order
    pub ranges: Vec<CodeEntry>,
}

impl Default for CodebookConfig {
    fn default() -> Self {
        Self {
            start: ">".to_string(),
            terminator: "\n".to_string(),
            identify: ">ID\n".to_string(),
            manual_label: Some("Manual".to_string()),
            periods: vec![
                CodeEntry::new("Manual", '.'),
                CodeEntry::new("1ms", 'A'),
                CodeEntry::new("2ms", 'B'),
                CodeEntry::new("5ms", 'C'),
                CodeEntry::new("10ms", 'D'),
                CodeEntry::new("25ms", 'E'),
                CodeEntry::new("50ms", 'F'),
                CodeEntry::new("100ms", 'G'),
                CodeEntry::new("200ms", 'H'),
                CodeEntry::new("500ms", 'I'),
                CodeEntry::new("1s", 'J'),
                CodeEntry::new("2s", 'K'),
                CodeEntry::new("5s", 'L'),
                CodeEntry::new("10s", 'M'),
                CodeEntry::new("15s", 'N'),
                CodeEntry::new("30s", 'O'),
                CodeEntry::new("1min", 'P'),
            ],
            ranges: vec![
                CodeEntry::new("Auto", '0'),
                CodeEntry::new("-2 to +2V", '1'),
                CodeEntry::new("-20 to +20V", '2'),
                CodeEntry::new("-200 to +200V", '3'),
            ],
        }
    }
}

// =============================================================================
// Validated codebook
// =============================================================================

/// Which of the two tables a lookup went to. Used in error messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodeKind {
    /// Sampling period table
    Period,
    /// Input range table
    Range,
}

impl fmt::Display for CodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CodeKind::Period => write!(f, "sampling period"),
            CodeKind::Range => write!(f, "voltage range"),
        }
    }
}

/// An ordered, duplicate-free label → code table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodeTable {
    kind: CodeKind,
    entries: Vec<CodeEntry>,
}

impl CodeTable {
    fn build(kind: CodeKind, entries: Vec<CodeEntry>, framing: &str) -> AppResult<Self> {
        if entries.is_empty() {
            return Err(DaqError::InvalidConfiguration(format!(
                "{kind} table is empty"
            )));
        }

        let mut labels = HashSet::new();
        let mut codes = HashSet::new();
        for entry in &entries {
            if entry.label.trim().is_empty() {
                return Err(DaqError::InvalidConfiguration(format!(
                    "{kind} table contains an empty label"
                )));
            }
            if !entry.code.is_ascii_graphic() {
                return Err(DaqError::InvalidConfiguration(format!(
                    "{kind} code for '{}' must be a printable ASCII character, got {:?}",
                    entry.label, entry.code
                )));
            }
            if framing.contains(entry.code) {
                return Err(DaqError::InvalidConfiguration(format!(
                    "{kind} code {:?} for '{}' collides with the command framing",
                    entry.code, entry.label
                )));
            }
            if !labels.insert(entry.label.as_str()) {
                return Err(DaqError::InvalidConfiguration(format!(
                    "duplicate {kind} label '{}'",
                    entry.label
                )));
            }
            if !codes.insert(entry.code) {
                return Err(DaqError::InvalidConfiguration(format!(
                    "duplicate {kind} code {:?}",
                    entry.code
                )));
            }
        }

        Ok(Self { kind, entries })
    }

    /// Look up the code for `label`.
    pub fn code(&self, label: &str) -> AppResult<char> {
        self.entries
            .iter()
            .find(|entry| entry.label == label)
            .map(|entry| entry.code)
            .ok_or_else(|| {
                DaqError::InvalidConfiguration(format!("Invalid {}: {label}", self.kind))
            })
    }

    /// Labels in display order.
    pub fn labels(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|entry| entry.label.as_str())
    }

    /// Whether `label` is present.
    pub fn contains(&self, label: &str) -> bool {
        self.entries.iter().any(|entry| entry.label == label)
    }
}

/// Validated command codebook for one firmware variant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Codebook {
    start: String,
    terminator: String,
    identify: String,
    manual_label: Option<String>,
    periods: CodeTable,
    ranges: CodeTable,
}

impl TryFrom<CodebookConfig> for Codebook {
    type Error = DaqError;

    fn try_from(config: CodebookConfig) -> AppResult<Self> {
        if config.terminator.is_empty() {
            return Err(DaqError::InvalidConfiguration(
                "command terminator must not be empty".to_string(),
            ));
        }
        if !config.start.is_ascii() || !config.terminator.is_ascii() || !config.identify.is_ascii()
        {
            return Err(DaqError::InvalidConfiguration(
                "command framing must be ASCII".to_string(),
            ));
        }

        let framing = format!("{}{}", config.start, config.terminator);
        let periods = CodeTable::build(CodeKind::Period, config.periods, &framing)?;
        let ranges = CodeTable::build(CodeKind::Range, config.ranges, &framing)?;

        if let Some(manual) = &config.manual_label {
            if !periods.contains(manual) {
                return Err(DaqError::InvalidConfiguration(format!(
                    "manual label '{manual}' is not in the sampling period table"
                )));
            }
        }

        Ok(Self {
            start: config.start,
            terminator: config.terminator,
            identify: config.identify,
            manual_label: config.manual_label,
            periods,
            ranges,
        })
    }
}

impl Default for Codebook {
    fn default() -> Self {
        Self::usb_voltmeter()
    }
}

impl Codebook {
    /// Codebook of the USB voltmeter firmware (`>` + period + range + LF).
    pub fn usb_voltmeter() -> Self {
        let config = CodebookConfig::default();
        Self {
            periods: CodeTable {
                kind: CodeKind::Period,
                entries: config.periods,
            },
            ranges: CodeTable {
                kind: CodeKind::Range,
                entries: config.ranges,
            },
            start: config.start,
            terminator: config.terminator,
            identify: config.identify,
            manual_label: config.manual_label,
        }
    }

    /// Encode a configuration command.
    ///
    /// Fails with [`DaqError::InvalidConfiguration`] when either label is
    /// missing from its table.
    pub fn encode(&self, period_label: &str, range_label: &str) -> AppResult<DeviceCommand> {
        let sampling = self.periods.code(period_label)?;
        let range = self.ranges.code(range_label)?;

        let mut command = String::with_capacity(self.start.len() + 2 + self.terminator.len());
        command.push_str(&self.start);
        command.push(sampling);
        command.push(range);
        command.push_str(&self.terminator);

        Ok(DeviceCommand(command))
    }

    /// The identity query for this firmware.
    pub fn identify_query(&self) -> DeviceCommand {
        DeviceCommand(self.identify.clone())
    }

    /// Sampling mode implied by a period label.
    pub fn sampling_mode(&self, period_label: &str) -> AppResult<SamplingMode> {
        if !self.periods.contains(period_label) {
            return Err(DaqError::InvalidConfiguration(format!(
                "Invalid {}: {period_label}",
                CodeKind::Period
            )));
        }
        if self.manual_label.as_deref() == Some(period_label) {
            Ok(SamplingMode::Manual)
        } else {
            Ok(SamplingMode::Periodic)
        }
    }

    /// Sampling-period table.
    pub fn periods(&self) -> &CodeTable {
        &self.periods
    }

    /// Input-range table.
    pub fn ranges(&self) -> &CodeTable {
        &self.ranges
    }
}

// =============================================================================
// DeviceCommand
// =============================================================================

/// A framed ASCII command ready to be written to the stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceCommand(String);

impl DeviceCommand {
    /// Wrap an already framed command.
    pub fn raw(command: impl Into<String>) -> Self {
        Self(command.into())
    }

    /// Command text including framing.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Command bytes including framing.
    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl fmt::Display for DeviceCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.escape_debug())
    }
}

// =============================================================================
// Period labels
// =============================================================================

/// Parse a period label such as `"10ms"`, `"2s"` or `"1min"`.
///
/// Returns `None` for labels without a numeric period (e.g. `"Manual"`).
pub fn parse_period(label: &str) -> Option<Duration> {
    humantime::parse_duration(label.trim()).ok()
}
