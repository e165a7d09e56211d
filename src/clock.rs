//! Record labelling.
//!
//! Every record carries a leading label. In periodic mode the instrument
//! streams on its own timer and the label is the elapsed time since the
//! session started; in manual mode each record is an on-demand sample and the
//! label is its index.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;

/// How records are labelled for the lifetime of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SamplingMode {
    /// Elapsed seconds since session start
    #[default]
    Periodic,
    /// Zero-based record index
    Manual,
}

impl SamplingMode {
    /// Heading of the label column in exports.
    pub fn column_title(self) -> &'static str {
        match self {
            SamplingMode::Periodic => "Time (s)",
            SamplingMode::Manual => "Index",
        }
    }
}

/// Leading label of a record.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum RecordLabel {
    /// Time since session start
    Elapsed(Duration),
    /// Position within the session
    Index(u64),
}

impl fmt::Display for RecordLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordLabel::Elapsed(elapsed) => write!(f, "{:.3}", elapsed.as_secs_f64()),
            RecordLabel::Index(index) => write!(f, "{index}"),
        }
    }
}

/// Produces one label per emitted record.
#[derive(Debug, Clone)]
pub struct SamplingClock {
    mode: SamplingMode,
    started: Instant,
    next_index: u64,
}

impl SamplingClock {
    /// Start a clock now.
    pub fn start(mode: SamplingMode) -> Self {
        Self {
            mode,
            started: Instant::now(),
            next_index: 0,
        }
    }

    /// Mode fixed at construction.
    pub fn mode(&self) -> SamplingMode {
        self.mode
    }

    /// Label for the next record.
    pub fn next_label(&mut self) -> RecordLabel {
        let label = match self.mode {
            SamplingMode::Periodic => RecordLabel::Elapsed(self.started.elapsed()),
            SamplingMode::Manual => RecordLabel::Index(self.next_index),
        };
        self.next_index += 1;
        label
    }

    /// Number of labels handed out so far.
    pub fn emitted(&self) -> u64 {
        self.next_index
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn periodic_labels_track_elapsed_time() {
        let mut clock = SamplingClock::start(SamplingMode::Periodic);

        let first = clock.next_label();
        tokio::time::advance(Duration::from_millis(1500)).await;
        let second = clock.next_label();
        tokio::time::advance(Duration::from_micros(12_345)).await;
        let third = clock.next_label();

        assert_eq!(first.to_string(), "0.000");
        assert_eq!(second.to_string(), "1.500");
        assert_eq!(third.to_string(), "1.512");
        assert_eq!(clock.emitted(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn periodic_labels_never_decrease() {
        let mut clock = SamplingClock::start(SamplingMode::Periodic);
        let mut previous = Duration::ZERO;

        for step in [0u64, 3, 0, 10, 1, 0, 250] {
            tokio::time::advance(Duration::from_millis(step)).await;
            match clock.next_label() {
                RecordLabel::Elapsed(elapsed) => {
                    assert!(elapsed >= previous);
                    previous = elapsed;
                }
                other => panic!("unexpected label {other:?}"),
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn manual_labels_count_records_not_time() {
        let mut clock = SamplingClock::start(SamplingMode::Manual);

        assert_eq!(clock.next_label(), RecordLabel::Index(0));
        tokio::time::advance(Duration::from_secs(30)).await;
        assert_eq!(clock.next_label(), RecordLabel::Index(1));
        assert_eq!(clock.next_label().to_string(), "2");
        assert_eq!(clock.mode(), SamplingMode::Manual);
    }

    #[test]
    fn column_titles() {
        assert_eq!(SamplingMode::Periodic.column_title(), "Time (s)");
        assert_eq!(SamplingMode::Manual.column_title(), "Index");
    }
}
