//! Bundle File Format
//!
//! A bundle packs every file of one directory into a single immutable
//! artifact. The body is optionally zstd-compressed and protected by CRC32
//! at three levels: header, per-entry data, and whole body.
//!
//! ## File Layout
//!
//! ```text
//! ┌──────────────────────────────────┐
//! │ Header (fixed size)              │
//! │ - magic: "FRBN"                  │
//! │ - version: u8                    │
//! │ - flags: u8                      │
//! │ - entry_count: u32               │
//! │ - iteration: u64                 │
//! │ - created_at_ms: u64             │
//! │ - header_checksum: u32           │
//! ├──────────────────────────────────┤
//! │ Body (zstd stream when flagged)  │
//! │ - name_len: u16                  │
//! │ - name: utf8                     │
//! │ - data_len: u64                  │
//! │ - data_checksum: u32             │
//! │ - data                           │
//! ├──────────────────────────────────┤
//! │ Footer (fixed size)              │
//! │ - body_checksum: u32             │
//! │ - sizes: u64 x 2                 │
//! │ - footer_magic: "NBRF"           │
//! └──────────────────────────────────┘
//! ```
//!
//! Bundles are written to `<name>.part` and renamed into place, so a
//! crash never leaves a truncated file under the final name.

use std::fs::File;
use std::io::{BufWriter, Seek, Write};
use std::path::{Path, PathBuf};

/// Bundle file magic number
pub const BUNDLE_MAGIC: [u8; 4] = *b"FRBN";
/// Reversed magic for footer validation
pub const FOOTER_MAGIC: [u8; 4] = *b"NBRF";
/// Current bundle format version
pub const BUNDLE_VERSION: u8 = 1;

const HEADER_SIZE: usize = 32;
const FOOTER_SIZE: usize = 24;
const FLAG_ZSTD: u8 = 0b0000_0001;

/// Compression options for bundle bodies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Compression {
    #[default]
    None,
    Zstd { level: i32 },
}

impl Compression {
    fn flags(&self) -> u8 {
        match self {
            Compression::None => 0,
            Compression::Zstd { .. } => FLAG_ZSTD,
        }
    }
}

/// Bundle error types
#[derive(Debug)]
pub enum BundleError {
    InvalidMagic,
    UnsupportedVersion(u8),
    ChecksumMismatch {
        what: &'static str,
        expected: u32,
        actual: u32,
    },
    /// File shorter than its header and footer claim
    Truncated,
    /// Entry name does not fit the format
    InvalidName(String),
    Io(std::io::Error),
}

impl std::fmt::Display for BundleError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BundleError::InvalidMagic => write!(f, "Invalid bundle magic number"),
            BundleError::UnsupportedVersion(v) => write!(f, "Unsupported bundle version: {}", v),
            BundleError::ChecksumMismatch {
                what,
                expected,
                actual,
            } => write!(
                f,
                "{} checksum mismatch: expected {}, got {}",
                what, expected, actual
            ),
            BundleError::Truncated => write!(f, "Bundle is truncated"),
            BundleError::InvalidName(name) => write!(f, "Invalid bundle entry name: {}", name),
            BundleError::Io(e) => write!(f, "I/O error: {}", e),
        }
    }
}

impl std::error::Error for BundleError {}

impl From<std::io::Error> for BundleError {
    fn from(e: std::io::Error) -> Self {
        BundleError::Io(e)
    }
}

/// Bundle header (serialized at start of file)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BundleHeader {
    pub magic: [u8; 4],
    pub version: u8,
    /// Bit 0: zstd body
    pub flags: u8,
    pub entry_count: u32,
    /// Source iteration index, 0 for session exports
    pub iteration: u64,
    pub created_at_ms: u64,
    pub header_checksum: u32,
}

impl BundleHeader {
    fn new(entry_count: u32, iteration: u64, created_at_ms: u64, compression: Compression) -> Self {
        let mut header = BundleHeader {
            magic: BUNDLE_MAGIC,
            version: BUNDLE_VERSION,
            flags: compression.flags(),
            entry_count,
            iteration,
            created_at_ms,
            header_checksum: 0,
        };
        header.header_checksum = header.compute_checksum();
        header
    }

    fn compute_checksum(&self) -> u32 {
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&self.magic);
        hasher.update(&[self.version, self.flags]);
        hasher.update(&self.entry_count.to_le_bytes());
        hasher.update(&self.iteration.to_le_bytes());
        hasher.update(&self.created_at_ms.to_le_bytes());
        hasher.finalize()
    }

    fn validate(&self) -> Result<(), BundleError> {
        if self.magic != BUNDLE_MAGIC {
            return Err(BundleError::InvalidMagic);
        }
        if self.version != BUNDLE_VERSION {
            return Err(BundleError::UnsupportedVersion(self.version));
        }
        let expected = self.compute_checksum();
        if self.header_checksum != expected {
            return Err(BundleError::ChecksumMismatch {
                what: "header",
                expected,
                actual: self.header_checksum,
            });
        }
        Ok(())
    }

    pub fn is_compressed(&self) -> bool {
        self.flags & FLAG_ZSTD != 0
    }

    fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..4].copy_from_slice(&self.magic);
        buf[4] = self.version;
        buf[5] = self.flags;
        buf[6..10].copy_from_slice(&self.entry_count.to_le_bytes());
        buf[10..18].copy_from_slice(&self.iteration.to_le_bytes());
        buf[18..26].copy_from_slice(&self.created_at_ms.to_le_bytes());
        buf[26..30].copy_from_slice(&self.header_checksum.to_le_bytes());
        buf
    }

    fn from_bytes(data: &[u8]) -> Result<Self, BundleError> {
        if data.len() < HEADER_SIZE {
            return Err(BundleError::Truncated);
        }
        Ok(BundleHeader {
            magic: [data[0], data[1], data[2], data[3]],
            version: data[4],
            flags: data[5],
            entry_count: read_u32(&data[6..10]),
            iteration: read_u64(&data[10..18]),
            created_at_ms: read_u64(&data[18..26]),
            header_checksum: read_u32(&data[26..30]),
        })
    }
}

/// Bundle footer (serialized at end of file)
#[derive(Debug, Clone, PartialEq, Eq)]
struct BundleFooter {
    body_checksum: u32,
    uncompressed_size: u64,
    stored_size: u64,
    footer_magic: [u8; 4],
}

impl BundleFooter {
    fn to_bytes(&self) -> [u8; FOOTER_SIZE] {
        let mut buf = [0u8; FOOTER_SIZE];
        buf[0..4].copy_from_slice(&self.body_checksum.to_le_bytes());
        buf[4..12].copy_from_slice(&self.uncompressed_size.to_le_bytes());
        buf[12..20].copy_from_slice(&self.stored_size.to_le_bytes());
        buf[20..24].copy_from_slice(&self.footer_magic);
        buf
    }

    fn from_bytes(data: &[u8]) -> Result<Self, BundleError> {
        if data.len() < FOOTER_SIZE {
            return Err(BundleError::Truncated);
        }
        let footer = BundleFooter {
            body_checksum: read_u32(&data[0..4]),
            uncompressed_size: read_u64(&data[4..12]),
            stored_size: read_u64(&data[12..20]),
            footer_magic: [data[20], data[21], data[22], data[23]],
        };
        if footer.footer_magic != FOOTER_MAGIC {
            return Err(BundleError::InvalidMagic);
        }
        Ok(footer)
    }
}

// Callers check lengths before slicing, so the conversions cannot fail.
fn read_u16(data: &[u8]) -> u16 {
    let mut b = [0u8; 2];
    b.copy_from_slice(&data[..2]);
    u16::from_le_bytes(b)
}

fn read_u32(data: &[u8]) -> u32 {
    let mut b = [0u8; 4];
    b.copy_from_slice(&data[..4]);
    u32::from_le_bytes(b)
}

fn read_u64(data: &[u8]) -> u64 {
    let mut b = [0u8; 8];
    b.copy_from_slice(&data[..8]);
    u64::from_le_bytes(b)
}

/// One file to pack
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BundleSource {
    /// Name stored in the bundle
    pub name: String,
    pub path: PathBuf,
}

impl BundleSource {
    /// Source named after the file's own name
    pub fn from_path(path: PathBuf) -> Option<Self> {
        let name = path.file_name()?.to_str()?.to_string();
        Some(BundleSource { name, path })
    }
}

/// Progress report while packing
#[derive(Debug, Clone, PartialEq)]
pub struct PackProgress {
    pub file: String,
    /// Entries done / total, in 0.0..=1.0
    pub fraction: f64,
}

/// Result of a finished bundle
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackedBundle {
    pub path: PathBuf,
    /// Bundle size on disk
    pub size_bytes: u64,
    pub uncompressed_bytes: u64,
    pub entries: u32,
}

/// Pack `sources` into `dest`.
///
/// Writes `<dest>.part` first and renames on success. `progress` is called
/// after every entry.
pub fn pack(
    dest: &Path,
    sources: &[BundleSource],
    iteration: u64,
    created_at_ms: u64,
    compression: Compression,
    mut progress: impl FnMut(PackProgress),
) -> Result<PackedBundle, BundleError> {
    for source in sources {
        if source.name.is_empty() || source.name.len() > u16::MAX as usize {
            return Err(BundleError::InvalidName(source.name.clone()));
        }
    }
    let entry_count = u32::try_from(sources.len())
        .map_err(|_| BundleError::InvalidName("too many entries".to_string()))?;

    let part = part_path(dest);
    let result = write_bundle(
        &part,
        sources,
        BundleHeader::new(entry_count, iteration, created_at_ms, compression),
        compression,
        &mut progress,
    );

    match result {
        Ok((size_bytes, uncompressed_bytes)) => {
            std::fs::rename(&part, dest)?;
            Ok(PackedBundle {
                path: dest.to_path_buf(),
                size_bytes,
                uncompressed_bytes,
                entries: entry_count,
            })
        }
        Err(e) => {
            let _ = std::fs::remove_file(&part);
            Err(e)
        }
    }
}

fn part_path(dest: &Path) -> PathBuf {
    let mut name = dest.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".part");
    dest.with_file_name(name)
}

fn write_bundle(
    path: &Path,
    sources: &[BundleSource],
    header: BundleHeader,
    compression: Compression,
    progress: &mut dyn FnMut(PackProgress),
) -> Result<(u64, u64), BundleError> {
    let mut out = BufWriter::new(File::create(path)?);
    out.write_all(&header.to_bytes())?;

    let mut body = BodyState {
        hasher: crc32fast::Hasher::new(),
        uncompressed: 0,
    };

    let mut out = match compression {
        Compression::None => {
            write_entries(&mut out, sources, &mut body, progress)?;
            out
        }
        Compression::Zstd { level } => {
            let mut encoder = zstd::stream::Encoder::new(out, level)?;
            write_entries(&mut encoder, sources, &mut body, progress)?;
            encoder.finish()?
        }
    };

    let body_end = out.stream_position()?;
    let footer = BundleFooter {
        body_checksum: body.hasher.finalize(),
        uncompressed_size: body.uncompressed,
        stored_size: body_end - HEADER_SIZE as u64,
        footer_magic: FOOTER_MAGIC,
    };
    out.write_all(&footer.to_bytes())?;

    let file = out.into_inner().map_err(|e| e.into_error())?;
    file.sync_all()?;

    Ok((body_end + FOOTER_SIZE as u64, footer.uncompressed_size))
}

struct BodyState {
    hasher: crc32fast::Hasher,
    uncompressed: u64,
}

impl BodyState {
    fn emit<W: Write>(&mut self, out: &mut W, bytes: &[u8]) -> std::io::Result<()> {
        self.hasher.update(bytes);
        self.uncompressed += bytes.len() as u64;
        out.write_all(bytes)
    }
}

fn write_entries<W: Write>(
    out: &mut W,
    sources: &[BundleSource],
    body: &mut BodyState,
    progress: &mut dyn FnMut(PackProgress),
) -> Result<(), BundleError> {
    let total = sources.len().max(1) as f64;
    for (i, source) in sources.iter().enumerate() {
        let data = std::fs::read(&source.path)?;
        let name = source.name.as_bytes();

        body.emit(out, &(name.len() as u16).to_le_bytes())?;
        body.emit(out, name)?;
        body.emit(out, &(data.len() as u64).to_le_bytes())?;
        body.emit(out, &crc32fast::hash(&data).to_le_bytes())?;
        body.emit(out, &data)?;

        progress(PackProgress {
            file: source.name.clone(),
            fraction: (i + 1) as f64 / total,
        });
    }
    Ok(())
}

/// A decoded bundle entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BundleEntry {
    pub name: String,
    pub data: Vec<u8>,
}

/// Read and fully verify a bundle
pub fn unpack(path: &Path) -> Result<(BundleHeader, Vec<BundleEntry>), BundleError> {
    let raw = std::fs::read(path)?;
    unpack_bytes(&raw)
}

/// Decode and verify a bundle held in memory, e.g. a copy read back from a sink
pub fn unpack_bytes(raw: &[u8]) -> Result<(BundleHeader, Vec<BundleEntry>), BundleError> {
    if raw.len() < HEADER_SIZE + FOOTER_SIZE {
        return Err(BundleError::Truncated);
    }

    let header = BundleHeader::from_bytes(&raw[..HEADER_SIZE])?;
    header.validate()?;
    let footer = BundleFooter::from_bytes(&raw[raw.len() - FOOTER_SIZE..])?;

    let stored = &raw[HEADER_SIZE..raw.len() - FOOTER_SIZE];
    if stored.len() as u64 != footer.stored_size {
        return Err(BundleError::Truncated);
    }

    let body = if header.is_compressed() {
        zstd::stream::decode_all(stored)?
    } else {
        stored.to_vec()
    };

    let actual = crc32fast::hash(&body);
    if actual != footer.body_checksum {
        return Err(BundleError::ChecksumMismatch {
            what: "body",
            expected: footer.body_checksum,
            actual,
        });
    }

    let entries = parse_entries(&body, header.entry_count)?;
    Ok((header, entries))
}

fn parse_entries(body: &[u8], count: u32) -> Result<Vec<BundleEntry>, BundleError> {
    let mut entries = Vec::with_capacity(count as usize);
    let mut pos = 0usize;

    for _ in 0..count {
        let name_len = read_u16(take(body, &mut pos, 2)?) as usize;
        let name = String::from_utf8(take(body, &mut pos, name_len)?.to_vec())
            .map_err(|e| BundleError::InvalidName(e.to_string()))?;
        let data_len = usize::try_from(read_u64(take(body, &mut pos, 8)?))
            .map_err(|_| BundleError::Truncated)?;
        let expected = read_u32(take(body, &mut pos, 4)?);
        let data = take(body, &mut pos, data_len)?.to_vec();

        let actual = crc32fast::hash(&data);
        if actual != expected {
            return Err(BundleError::ChecksumMismatch {
                what: "entry",
                expected,
                actual,
            });
        }
        entries.push(BundleEntry { name, data });
    }

    if pos != body.len() {
        return Err(BundleError::Truncated);
    }
    Ok(entries)
}

fn take<'a>(body: &'a [u8], pos: &mut usize, len: usize) -> Result<&'a [u8], BundleError> {
    let end = pos.checked_add(len).ok_or(BundleError::Truncated)?;
    let slice = body.get(*pos..end).ok_or(BundleError::Truncated)?;
    *pos = end;
    Ok(slice)
}

/// `dir/<stem>.<ext>`, or `dir/<stem>-2.<ext>`, `-3`... if taken
pub fn unique_bundle_path(dir: &Path, stem: &str, extension: &str) -> PathBuf {
    let first = dir.join(format!("{}.{}", stem, extension));
    if !first.exists() {
        return first;
    }
    let mut n: u32 = 2;
    loop {
        let candidate = dir.join(format!("{}-{}.{}", stem, n, extension));
        if !candidate.exists() {
            return candidate;
        }
        n += 1;
    }
}

/// Recursive byte size of a directory tree; missing paths count as zero
pub fn dir_size(path: &Path) -> u64 {
    let Ok(meta) = std::fs::symlink_metadata(path) else {
        return 0;
    };
    if meta.is_file() {
        return meta.len();
    }
    if !meta.is_dir() {
        return 0;
    }
    std::fs::read_dir(path)
        .map(|entries| {
            entries
                .filter_map(|e| e.ok())
                .map(|e| dir_size(&e.path()))
                .sum()
        })
        .unwrap_or(0)
}
