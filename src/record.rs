//! Record parsing.

use crate::clock::RecordLabel;
use serde::{Deserialize, Serialize};
use std::fmt;

/// One labelled line of instrument data.
///
/// `fields` holds one entry per separator-delimited field of the source line;
/// a field that did not parse as a number is `None`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    /// Timestamp or index
    pub label: RecordLabel,
    /// Parsed field values
    pub fields: Vec<Option<f64>>,
}

impl Record {
    /// Number of data fields (the label is not counted).
    pub fn width(&self) -> usize {
        self.fields.len()
    }
}

impl fmt::Display for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.label)?;
        for field in &self.fields {
            match field {
                Some(value) => write!(f, ", {value}")?,
                None => write!(f, ", null")?,
            }
        }
        Ok(())
    }
}

/// Splits lines into independently parsed numeric fields.
#[derive(Debug, Clone, Copy)]
pub struct RecordParser {
    separator: char,
}

impl Default for RecordParser {
    fn default() -> Self {
        Self::new(',')
    }
}

impl RecordParser {
    /// Parser splitting on `separator`.
    pub fn new(separator: char) -> Self {
        Self { separator }
    }

    /// Parse every field of `line`.
    ///
    /// Fields are trimmed before parsing. Anything that is not a finite
    /// number becomes `None`; the rest of the line is unaffected.
    pub fn parse(&self, line: &str) -> Vec<Option<f64>> {
        line.split(self.separator).map(parse_field).collect()
    }

    /// Parse `line` and attach `label`.
    pub fn record(&self, label: RecordLabel, line: &str) -> Record {
        Record {
            label,
            fields: self.parse(line),
        }
    }
}

fn parse_field(field: &str) -> Option<f64> {
    field
        .trim()
        .parse::<f64>()
        .ok()
        .filter(|value| value.is_finite())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn bad_field_becomes_none() {
        let parser = RecordParser::default();
        assert_eq!(parser.parse("1.5,abc,3"), vec![Some(1.5), None, Some(3.0)]);
    }

    #[test]
    fn empty_line_is_one_null_field() {
        assert_eq!(RecordParser::default().parse(""), vec![None]);
    }

    #[test]
    fn whitespace_and_exponents() {
        let parser = RecordParser::default();
        assert_eq!(
            parser.parse(" -0.5 , 5E-9,+2 ,\t7"),
            vec![Some(-0.5), Some(5e-9), Some(2.0), Some(7.0)]
        );
    }

    #[test]
    fn non_finite_values_are_rejected() {
        let parser = RecordParser::default();
        assert_eq!(parser.parse("NaN,inf,-infinity,1"), vec![None, None, None, Some(1.0)]);
    }

    #[test]
    fn empty_fields_between_separators() {
        let parser = RecordParser::default();
        assert_eq!(parser.parse("1,,2,"), vec![Some(1.0), None, Some(2.0), None]);
    }

    #[test]
    fn custom_separator() {
        let parser = RecordParser::new(';');
        assert_eq!(parser.parse("1;2,5;x"), vec![Some(1.0), None, None]);
    }

    #[test]
    fn field_count_follows_the_line() {
        let parser = RecordParser::default();
        let short = parser.record(RecordLabel::Index(0), "1");
        let long = parser.record(RecordLabel::Index(1), "1,2,3,4");
        assert_eq!(short.width(), 1);
        assert_eq!(long.width(), 4);
    }

    #[test]
    fn display_matches_live_line_format() {
        let record = RecordParser::default().record(
            RecordLabel::Elapsed(Duration::from_millis(1250)),
            "0.5,x,12",
        );
        assert_eq!(record.to_string(), "1.250, 0.5, null, 12");
    }

    #[test]
    fn json_keeps_nulls_and_tagged_label() {
        let record = Record {
            label: RecordLabel::Index(3),
            fields: vec![Some(0.5), None],
        };
        assert_eq!(
            serde_json::to_string(&record).unwrap(),
            r#"{"label":{"kind":"index","value":3},"fields":[0.5,null]}"#
        );
    }
}
