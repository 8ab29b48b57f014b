use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};
use crate::models::{FeatureVector, WindowFeatureRow, FEATURE_COLUMNS};

/// Chronologically ordered window rows.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FeatureTable {
    rows: Vec<WindowFeatureRow>,
}

impl FeatureTable {
    pub fn new(rows: Vec<WindowFeatureRow>) -> Self {
        Self { rows }
    }

    pub fn rows(&self) -> &[WindowFeatureRow] {
        &self.rows
    }

    pub fn into_rows(self) -> Vec<WindowFeatureRow> {
        self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn matrix(&self) -> Vec<FeatureVector> {
        self.rows.iter().map(WindowFeatureRow::to_vector).collect()
    }

    pub fn column(&self, name: &str) -> Option<Vec<f64>> {
        let idx = FEATURE_COLUMNS.iter().position(|c| *c == name)?;
        Some(self.rows.iter().map(|r| r.to_vector()[idx]).collect())
    }

    pub fn total_packets(&self) -> u64 {
        self.rows.iter().map(|r| r.total_packets).sum()
    }

    pub fn total_bytes(&self) -> u64 {
        self.rows.iter().map(|r| r.total_bytes).sum()
    }

    /// Load a table from loosely typed JSON records, e.g. a table exported by
    /// another tool. Every record must carry all ten feature columns as finite
    /// numbers; nothing is defaulted except `window_start`, which falls back to
    /// the row index.
    pub fn from_json_records(json: &str) -> Result<Self> {
        let value: Value =
            serde_json::from_str(json).map_err(|e| Error::MalformedTable(e.to_string()))?;
        let records = value
            .as_array()
            .ok_or_else(|| Error::MalformedTable("top-level value is not an array".into()))?;

        let mut rows = Vec::with_capacity(records.len());
        for (row, record) in records.iter().enumerate() {
            let obj = record
                .as_object()
                .ok_or_else(|| Error::MalformedTable(format!("row {} is not an object", row)))?;

            let missing: Vec<String> = FEATURE_COLUMNS
                .iter()
                .filter(|c| !obj.contains_key(**c))
                .map(|c| c.to_string())
                .collect();
            if !missing.is_empty() {
                return Err(Error::SchemaMismatch { row, missing });
            }

            let mut values = [0.0f64; FEATURE_COLUMNS.len()];
            for (i, column) in FEATURE_COLUMNS.iter().enumerate() {
                values[i] = finite_number(obj.get(*column), row, column)?;
            }

            let window_start = match obj.get("window_start") {
                Some(v) => finite_number(Some(v), row, "window_start")?,
                None => row as f64,
            };

            rows.push(WindowFeatureRow {
                window_start,
                total_packets: as_count(values[0], row, FEATURE_COLUMNS[0])?,
                total_bytes: as_count(values[1], row, FEATURE_COLUMNS[1])?,
                unique_src_ips: as_count(values[2], row, FEATURE_COLUMNS[2])?,
                unique_dst_ips: as_count(values[3], row, FEATURE_COLUMNS[3])?,
                unique_src_ports: as_count(values[4], row, FEATURE_COLUMNS[4])?,
                unique_dst_ports: as_count(values[5], row, FEATURE_COLUMNS[5])?,
                tcp_count: as_count(values[6], row, FEATURE_COLUMNS[6])?,
                udp_count: as_count(values[7], row, FEATURE_COLUMNS[7])?,
                other_count: as_count(values[8], row, FEATURE_COLUMNS[8])?,
                avg_packet_size: values[9],
            });
        }

        Ok(Self { rows })
    }
}

impl From<Vec<WindowFeatureRow>> for FeatureTable {
    fn from(rows: Vec<WindowFeatureRow>) -> Self {
        Self::new(rows)
    }
}

fn finite_number(value: Option<&Value>, row: usize, column: &str) -> Result<f64> {
    match value.and_then(Value::as_f64) {
        Some(n) if n.is_finite() => Ok(n),
        _ => Err(Error::InvalidColumn {
            row,
            column: column.to_string(),
            value: value.map(|v| v.to_string()).unwrap_or_default(),
        }),
    }
}

fn as_count(value: f64, row: usize, column: &str) -> Result<u64> {
    // u64::MAX as f64 rounds up to 2^64, which no u64 can hold
    if value < 0.0 || value.fract() != 0.0 || value >= u64::MAX as f64 {
        return Err(Error::InvalidColumn {
            row,
            column: column.to_string(),
            value: value.to_string(),
        });
    }
    Ok(value as u64)
}
