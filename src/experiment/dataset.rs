//! In-memory result table of a scan.
//!
//! Columns are appended in acquisition order and never modified afterwards. Writing
//! the table anywhere is left to the caller; it derives `Serialize` so the CLI can
//! dump it as JSON.

use crate::hardware::capabilities::Waveform;
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

/// Tag of the vibrometer column.
pub const RESPONSE_TAG: &str = "response";

/// One acquired trace at one grid position.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SampleColumn {
    /// Machine X of the point
    pub x: f64,
    /// Machine Y of the point
    pub y: f64,
    /// Ordinal of the sample at this point, starting at 1
    pub sample_ordinal: u32,
    /// Channel role, `response` for the vibrometer
    pub channel_tag: String,
    /// Oscilloscope channel the trace came from
    pub channel: u8,
    /// Trace as returned by the instrument
    pub waveform: Waveform,
}

impl SampleColumn {
    /// Column name used by the dataset writers: `X{x}_Y{y}_S{n}`.
    pub fn key(&self) -> String {
        format!("X{}_Y{}_S{}", self.x, self.y, self.sample_ordinal)
    }
}

/// Result of one complete scan.
#[derive(Debug, Clone, Serialize)]
pub struct SampleTable {
    /// Unique id of the run
    pub run_id: Uuid,
    /// When the scan started
    pub started_at: DateTime<Utc>,
    columns: Vec<SampleColumn>,
}

impl Default for SampleTable {
    fn default() -> Self {
        Self::new()
    }
}

impl SampleTable {
    /// Empty table stamped with a fresh run id and the current time.
    pub fn new() -> Self {
        Self {
            run_id: Uuid::new_v4(),
            started_at: Utc::now(),
            columns: Vec::new(),
        }
    }

    /// Append one column.
    pub fn push(&mut self, column: SampleColumn) {
        self.columns.push(column);
    }

    /// All columns in acquisition order.
    pub fn columns(&self) -> &[SampleColumn] {
        &self.columns
    }

    /// Columns carrying `tag`.
    pub fn with_tag<'a>(&'a self, tag: &'a str) -> impl Iterator<Item = &'a SampleColumn> + 'a {
        self.columns.iter().filter(move |c| c.channel_tag == tag)
    }

    /// Number of columns.
    pub fn len(&self) -> usize {
        self.columns.len()
    }

    /// Whether no column has been recorded.
    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn column(x: f64, y: f64, n: u32, tag: &str) -> SampleColumn {
        SampleColumn {
            x,
            y,
            sample_ordinal: n,
            channel_tag: tag.to_string(),
            channel: 2,
            waveform: Waveform::default(),
        }
    }

    #[test]
    fn key_formats_position_and_ordinal() {
        assert_eq!(column(1.5, 0.0, 2, RESPONSE_TAG).key(), "X1.5_Y0_S2");
    }

    #[test]
    fn columns_keep_insertion_order() {
        let mut table = SampleTable::new();
        table.push(column(0.0, 0.0, 1, RESPONSE_TAG));
        table.push(column(0.0, 0.0, 1, "sweep"));
        table.push(column(0.0, 0.0, 2, RESPONSE_TAG));

        assert_eq!(table.len(), 3);
        let ordinals: Vec<u32> = table.with_tag(RESPONSE_TAG).map(|c| c.sample_ordinal).collect();
        assert_eq!(ordinals, vec![1, 2]);
    }

    #[test]
    fn table_serializes_with_run_id() {
        let table = SampleTable::new();
        let json = serde_json::to_value(&table).unwrap();
        assert_eq!(json["run_id"], serde_json::json!(table.run_id.to_string()));
        assert!(json["columns"].as_array().unwrap().is_empty());
    }
}
