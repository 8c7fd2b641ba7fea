//! Streams and Rows
//!
//! A stream is a named producer of value tuples. Every stream owns one file
//! per iteration (plus one in the live directory) whose first line is the
//! header and whose remaining lines are rows.
//!
//! ## Row Layout
//!
//! ```text
//! <system time>[;<sensor time>];<v1>;<v2>;...\n
//! ```
//!
//! Times are seconds since session start with a fixed number of decimals.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt::{self, Write as _};

/// Stream identifier, unique within a session
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StreamId(String);

impl StreamId {
    pub fn new(id: impl Into<String>) -> Self {
        StreamId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for StreamId {
    fn from(s: &str) -> Self {
        StreamId(s.to_string())
    }
}

impl From<String> for StreamId {
    fn from(s: String) -> Self {
        StreamId(s)
    }
}

/// Description of one data stream
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamSpec {
    pub id: StreamId,
    /// Column names, written as the header row
    pub fields: Vec<String>,
    /// File stem; made unique per session
    pub storage_name: String,
    /// File extension without the dot
    pub extension: String,
}

impl StreamSpec {
    pub fn new(id: impl Into<StreamId>, fields: &[&str]) -> Self {
        let id = id.into();
        StreamSpec {
            storage_name: id.as_str().to_string(),
            id,
            fields: fields.iter().map(|f| f.to_string()).collect(),
            extension: "csv".to_string(),
        }
    }

    pub fn with_storage_name(mut self, name: impl Into<String>) -> Self {
        self.storage_name = name.into();
        self
    }

    pub fn with_extension(mut self, extension: impl Into<String>) -> Self {
        self.extension = extension.into();
        self
    }

    pub fn file_name(&self) -> String {
        format!("{}.{}", self.storage_name, self.extension)
    }

    /// Header line, newline terminated
    pub fn header(&self, delimiter: char) -> String {
        let mut line = String::new();
        for (i, field) in self.fields.iter().enumerate() {
            if i > 0 {
                line.push(delimiter);
            }
            line.push_str(field);
        }
        line.push('\n');
        line
    }
}

/// A single field value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FieldValue {
    Float(f64),
    Int(i64),
    Bool(bool),
    Text(String),
}

impl FieldValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            FieldValue::Float(v) => Some(*v),
            FieldValue::Int(v) => Some(*v as f64),
            _ => None,
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Float(v) => write!(f, "{}", v),
            FieldValue::Int(v) => write!(f, "{}", v),
            FieldValue::Bool(v) => write!(f, "{}", v),
            FieldValue::Text(v) => f.write_str(v),
        }
    }
}

impl From<f64> for FieldValue {
    fn from(v: f64) -> Self {
        FieldValue::Float(v)
    }
}

impl From<f32> for FieldValue {
    fn from(v: f32) -> Self {
        FieldValue::Float(v as f64)
    }
}

impl From<i64> for FieldValue {
    fn from(v: i64) -> Self {
        FieldValue::Int(v)
    }
}

impl From<i32> for FieldValue {
    fn from(v: i32) -> Self {
        FieldValue::Int(v as i64)
    }
}

impl From<bool> for FieldValue {
    fn from(v: bool) -> Self {
        FieldValue::Bool(v)
    }
}

impl From<&str> for FieldValue {
    fn from(v: &str) -> Self {
        FieldValue::Text(v.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(v: String) -> Self {
        FieldValue::Text(v)
    }
}

/// One immutable sample of a stream
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    /// Seconds since session start, recorder clock
    pub elapsed_system: f64,
    /// Seconds since session start, sensor clock
    pub elapsed_sensor: Option<f64>,
    pub values: Vec<FieldValue>,
}

impl Row {
    pub fn new(elapsed_system: f64, elapsed_sensor: Option<f64>, values: Vec<FieldValue>) -> Self {
        Row {
            elapsed_system,
            elapsed_sensor,
            values,
        }
    }

    /// Append the encoded row, newline included, to `buf`
    pub fn encode_into(&self, buf: &mut String, delimiter: char, precision: usize) {
        // Writing into a String cannot fail.
        let _ = write!(buf, "{:.*}", precision, self.elapsed_system);
        if let Some(sensor) = self.elapsed_sensor {
            buf.push(delimiter);
            let _ = write!(buf, "{:.*}", precision, sensor);
        }
        for value in &self.values {
            buf.push(delimiter);
            let _ = write!(buf, "{}", value);
        }
        buf.push('\n');
    }

    pub fn encode(&self, delimiter: char, precision: usize) -> String {
        let mut buf = String::with_capacity(32 + self.values.len() * 12);
        self.encode_into(&mut buf, delimiter, precision);
        buf
    }
}

/// Hands out storage names that are unique within one session.
///
/// A taken name gets the first free numeric suffix. Names ending in `#`
/// denote one of several instances and always get a suffix.
#[derive(Debug, Default)]
pub struct FileNameAllocator {
    taken: HashSet<String>,
}

impl FileNameAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allocate(&mut self, base: &str) -> String {
        let needs_suffix = base.ends_with('#') || self.taken.contains(base);
        let name = if needs_suffix {
            let mut counter: u32 = 1;
            loop {
                let candidate = format!("{}{}", base, counter);
                if !self.taken.contains(&candidate) {
                    break candidate;
                }
                counter += 1;
            }
        } else {
            base.to_string()
        };
        self.taken.insert(name.clone());
        name
    }
}
