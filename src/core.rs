//! Core data types shared by adapters, workers and the stager.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Operating state of an instrument running a zero/span overlay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperationState {
    /// Ordinary ambient sampling
    Idle,
    /// Zero-air check in progress
    ZeroCheck,
    /// Span check in progress
    SpanCheck,
}

impl fmt::Display for OperationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OperationState::Idle => "Idle",
            OperationState::ZeroCheck => "ZeroCheck",
            OperationState::SpanCheck => "SpanCheck",
        };
        f.write_str(name)
    }
}

/// Value of one decoded field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FieldValue {
    /// Floating point reading
    Number(f64),
    /// Integer register or counter
    Integer(i64),
    /// Anything that is not numeric (flags, dates)
    Text(String),
}

impl FieldValue {
    /// Interpret a response token: integers, then floats, else text.
    pub fn parse(token: &str) -> Self {
        if let Ok(i) = token.parse::<i64>() {
            FieldValue::Integer(i)
        } else if let Ok(f) = token.parse::<f64>() {
            FieldValue::Number(f)
        } else {
            FieldValue::Text(token.to_string())
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Number(v) => write!(f, "{v}"),
            FieldValue::Integer(v) => write!(f, "{v}"),
            FieldValue::Text(s) => f.write_str(s),
        }
    }
}

/// Named field of a record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Field {
    /// Column name from the instrument header
    pub name: String,
    /// Decoded value
    pub value: FieldValue,
}

/// One decoded observation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    /// Acquisition time (the sampling tick that produced it)
    pub timestamp: DateTime<Utc>,
    /// Fields in header order
    pub fields: Vec<Field>,
    /// Source line or frame, kept for audit and replay
    pub raw: String,
    /// Active operation state when the instrument runs a zero/span overlay
    pub tag: Option<OperationState>,
}

impl Record {
    /// Build a record from header names and matching values.
    pub fn new(
        timestamp: DateTime<Utc>,
        names: &[String],
        values: Vec<FieldValue>,
        raw: impl Into<String>,
    ) -> Self {
        let fields = names
            .iter()
            .cloned()
            .zip(values)
            .map(|(name, value)| Field { name, value })
            .collect();
        Self {
            timestamp,
            fields,
            raw: raw.into(),
            tag: None,
        }
    }

    /// Attach the active operation state.
    pub fn with_tag(mut self, tag: OperationState) -> Self {
        self.tag = Some(tag);
        self
    }

    /// Look up a field by name.
    pub fn field(&self, name: &str) -> Option<&FieldValue> {
        self.fields.iter().find(|f| f.name == name).map(|f| &f.value)
    }
}

/// A file found by a passive-filesystem scan.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HarvestedFile {
    /// Absolute source path
    pub path: PathBuf,
    /// Size in bytes when harvested
    pub size: u64,
    /// Modification time when harvested
    pub modified: DateTime<Utc>,
}

impl HarvestedFile {
    /// Identity used by the seen-set.
    pub fn key(&self) -> HarvestKey {
        HarvestKey {
            path: self.path.clone(),
            size: self.size,
            modified: self.modified.timestamp_millis(),
        }
    }
}

/// Seen-set key: path, size and mtime.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HarvestKey {
    /// Source path
    pub path: PathBuf,
    /// Size in bytes
    pub size: u64,
    /// Modification time in Unix milliseconds
    pub modified: i64,
}

/// What one poll produced after decoding.
#[derive(Debug, Default)]
pub struct Decoded {
    /// Records for the buffer
    pub records: Vec<Record>,
    /// Files for the harvest queue
    pub files: Vec<HarvestedFile>,
}

impl Decoded {
    /// Decoded output consisting of records only.
    pub fn records(records: Vec<Record>) -> Self {
        Self {
            records,
            files: Vec::new(),
        }
    }

    /// Decoded output consisting of harvested files only.
    pub fn files(files: Vec<HarvestedFile>) -> Self {
        Self {
            records: Vec::new(),
            files,
        }
    }

    /// Nothing was produced.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty() && self.files.is_empty()
    }
}
