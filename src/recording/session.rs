//! Session Identity and Manifest
//!
//! A session is one recording run: a unique id, the ordered stream set and
//! the start time. Its working tree lives at `<root>/<session id>/`:
//!
//! ```text
//! <root>/<session id>/
//!   live/<stream file>        whole-session mirror
//!   1/<stream file>           iteration 1
//!   2/<stream file>           iteration 2
//!   ...
//! ```
//!
//! On finalize a `session.json` manifest is written next to the live files
//! and exported with them.

use crate::recording::row::{FileNameAllocator, StreamId, StreamSpec};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Name of the live mirror directory inside a session directory
pub const LIVE_DIR: &str = "live";
/// Manifest file name
pub const MANIFEST_FILE: &str = "session.json";

/// Unique session identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId(String);

impl SessionId {
    pub fn generate() -> Self {
        SessionId(Uuid::new_v4().simple().to_string())
    }

    pub fn from_string(id: impl Into<String>) -> Self {
        SessionId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One recording run
#[derive(Debug, Clone)]
pub struct Session {
    id: SessionId,
    streams: Vec<StreamSpec>,
    started_at: DateTime<Utc>,
    dir: PathBuf,
}

impl Session {
    /// Create a session below `root`. Storage names are made unique.
    pub fn new(root: &Path, streams: Vec<StreamSpec>) -> Self {
        Self::with_id(root, SessionId::generate(), streams)
    }

    pub fn with_id(root: &Path, id: SessionId, streams: Vec<StreamSpec>) -> Self {
        let mut names = FileNameAllocator::new();
        let streams = streams
            .into_iter()
            .map(|spec| {
                let unique = names.allocate(&spec.storage_name);
                spec.with_storage_name(unique)
            })
            .collect();

        Session {
            dir: root.join(id.as_str()),
            id,
            streams,
            started_at: Utc::now(),
        }
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn streams(&self) -> &[StreamSpec] {
        &self.streams
    }

    pub fn stream(&self, id: &StreamId) -> Option<&StreamSpec> {
        self.streams.iter().find(|s| &s.id == id)
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// `<root>/<session id>`
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn live_dir(&self) -> PathBuf {
        self.dir.join(LIVE_DIR)
    }

    pub fn iteration_dir(&self, index: u64) -> PathBuf {
        self.dir.join(index.to_string())
    }
}

/// Stream entry of the manifest
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestStream {
    pub id: String,
    pub file: String,
    pub fields: Vec<String>,
}

/// Descriptive record exported with the live files
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionManifest {
    pub session_id: String,
    pub title: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// Recording time, pauses excluded
    pub recorded_ms: u64,
    /// Number of iterations opened
    pub iterations: u64,
    /// Uncompressed size of the live files
    pub data_size_bytes: u64,
    pub streams: Vec<ManifestStream>,
}

impl SessionManifest {
    pub fn new(
        session: &Session,
        title: &str,
        recorded_ms: u64,
        iterations: u64,
        data_size_bytes: u64,
    ) -> Self {
        SessionManifest {
            session_id: session.id().to_string(),
            title: title.to_string(),
            started_at: session.started_at(),
            finished_at: Utc::now(),
            recorded_ms,
            iterations,
            data_size_bytes,
            streams: session
                .streams()
                .iter()
                .map(|s| ManifestStream {
                    id: s.id.to_string(),
                    file: s.file_name(),
                    fields: s.fields.clone(),
                })
                .collect(),
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Write `session.json` into `dir`
    pub fn write_to(&self, dir: &Path) -> std::io::Result<PathBuf> {
        let json = self
            .to_json()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        let path = dir.join(MANIFEST_FILE);
        std::fs::write(&path, json)?;
        Ok(path)
    }
}

/// Replace every run of non-word characters with `_`
pub fn sanitize_title(title: &str) -> String {
    let mut out = String::with_capacity(title.len());
    let mut in_run = false;
    for c in title.chars() {
        if c.is_alphanumeric() || c == '_' {
            out.push(c);
            in_run = false;
        } else if !in_run {
            out.push('_');
            in_run = true;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_layout() {
        let session = Session::with_id(
            Path::new("/data"),
            SessionId::from_string("abc"),
            vec![StreamSpec::new("acc", &["x"])],
        );
        assert_eq!(session.dir(), Path::new("/data/abc"));
        assert_eq!(session.live_dir(), PathBuf::from("/data/abc/live"));
        assert_eq!(session.iteration_dir(3), PathBuf::from("/data/abc/3"));
    }

    #[test]
    fn test_duplicate_storage_names_resolved() {
        let session = Session::new(
            Path::new("/data"),
            vec![
                StreamSpec::new("gps-a", &["lat"]).with_storage_name("gps"),
                StreamSpec::new("gps-b", &["lat"]).with_storage_name("gps"),
            ],
        );
        let names: Vec<_> = session.streams().iter().map(|s| s.file_name()).collect();
        assert_eq!(names, vec!["gps.csv", "gps1.csv"]);
    }

    #[test]
    fn test_generated_ids_unique() {
        assert_ne!(SessionId::generate(), SessionId::generate());
    }

    #[test]
    fn test_manifest_json_roundtrip() {
        let session = Session::new(Path::new("/x"), vec![StreamSpec::new("baro", &["p"])]);
        let manifest = SessionManifest::new(&session, "Morning flight", 12_000, 3, 4096);
        let parsed = SessionManifest::from_json(&manifest.to_json().unwrap()).unwrap();
        assert_eq!(parsed, manifest);
        assert_eq!(parsed.streams[0].file, "baro.csv");
    }

    #[test]
    fn test_sanitize_title() {
        assert_eq!(sanitize_title("Morning flight #2"), "Morning_flight_2");
        assert_eq!(sanitize_title("a/b\\c"), "a_b_c");
        assert_eq!(sanitize_title("plain"), "plain");
    }
}
