//! Sealed bundle file format.
//!
//! A bundle holds the artifacts of several neighbouring commits in one gzip
//! stream so that the compressor can exploit their similarity.
//!
//! Layout:
//!
//! ```text
//! b"BIMB" | u32 format version | u32 header len | header JSON
//! gzip( { u32 entry len | entry JSON | file bytes }* | u32 0 )
//! ```
//!
//! Entries are written commit by commit in header order, so extracting one
//! commit only decompresses the stream up to the end of its slice.

use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;

use crate::domain::CommitId;

use super::digest::ArtifactDigest;
use super::tree::{collect_files, file_mode, is_contained, set_mode};
use super::{Result, StoreError};

/// Magic bytes identifying a bundle file.
const BUNDLE_MAGIC: [u8; 4] = *b"BIMB";

/// Current bundle format version.
const BUNDLE_FORMAT_VERSION: u32 = 1;

/// Upper bound for a single JSON header, guards against garbage lengths.
const MAX_HEADER_LEN: u32 = 16 * 1024 * 1024;

/// File extension for bundles.
pub const BUNDLE_EXT: &str = "bundle";

/// Uncompressed header describing a bundle's contents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BundleHeader {
    pub bundle_id: String,
    /// Commits in slice order.
    pub commits: Vec<CommitId>,
    /// Digest of each commit's artifact tree, parallel to `commits`.
    pub digests: Vec<ArtifactDigest>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
struct EntryHeader {
    /// Slice index into `BundleHeader::commits`.
    slice: usize,
    path: String,
    mode: u32,
    size: u64,
}

/// One commit's artifact tree to be packed.
#[derive(Debug, Clone)]
pub struct BundleSource {
    pub commit: CommitId,
    pub dir: PathBuf,
    pub digest: ArtifactDigest,
}

fn corrupt(path: &Path, reason: impl Into<String>) -> StoreError {
    StoreError::Corrupt {
        path: path.to_path_buf(),
        reason: reason.into(),
    }
}

fn write_framed<W: Write>(out: &mut W, bytes: &[u8]) -> io::Result<()> {
    out.write_all(&(bytes.len() as u32).to_le_bytes())?;
    out.write_all(bytes)
}

fn read_u32<R: Read>(input: &mut R) -> io::Result<u32> {
    let mut buf = [0u8; 4];
    input.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

/// Write a bundle atomically to `path` and return its size in bytes.
///
/// The payload is written to a temp file in the destination directory and
/// renamed into place, so a crash never leaves a half-written bundle at
/// `path`.
pub fn write_bundle(
    path: &Path,
    bundle_id: &str,
    sources: &[BundleSource],
    level: u32,
) -> Result<u64> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(dir).map_err(|e| StoreError::io(dir, e))?;

    let header = BundleHeader {
        bundle_id: bundle_id.to_string(),
        commits: sources.iter().map(|s| s.commit.clone()).collect(),
        digests: sources.iter().map(|s| s.digest).collect(),
        created_at: Utc::now(),
    };
    let header_bytes = serde_json::to_vec(&header)?;

    let tmp = NamedTempFile::new_in(dir).map_err(|e| StoreError::io(dir, e))?;
    {
        let mut out = BufWriter::new(tmp.as_file());
        let io_err = |e| StoreError::io(path, e);
        out.write_all(&BUNDLE_MAGIC).map_err(io_err)?;
        out.write_all(&BUNDLE_FORMAT_VERSION.to_le_bytes())
            .map_err(io_err)?;
        write_framed(&mut out, &header_bytes).map_err(io_err)?;

        let mut encoder = GzEncoder::new(out, Compression::new(level.min(9)));
        for (slice, source) in sources.iter().enumerate() {
            for rel in collect_files(&source.dir)? {
                let full = source.dir.join(&rel);
                let size = fs::metadata(&full)
                    .map_err(|e| StoreError::io(&full, e))?
                    .len();
                let entry = EntryHeader {
                    slice,
                    path: rel.to_string_lossy().replace('\\', "/"),
                    mode: file_mode(&full)?,
                    size,
                };
                write_framed(&mut encoder, &serde_json::to_vec(&entry)?).map_err(io_err)?;
                let mut file = File::open(&full).map_err(|e| StoreError::io(&full, e))?;
                let copied = io::copy(&mut file, &mut encoder).map_err(io_err)?;
                if copied != size {
                    return Err(StoreError::io(
                        &full,
                        io::Error::new(io::ErrorKind::UnexpectedEof, "file changed while bundling"),
                    ));
                }
            }
        }
        encoder.write_all(&0u32.to_le_bytes()).map_err(io_err)?;
        let mut out = encoder.finish().map_err(io_err)?;
        out.flush().map_err(io_err)?;
    }
    tmp.as_file()
        .sync_all()
        .map_err(|e| StoreError::io(path, e))?;
    let file = tmp.persist(path).map_err(|e| StoreError::io(path, e.error))?;
    let size = file
        .metadata()
        .map_err(|e| StoreError::io(path, e))?
        .len();
    Ok(size)
}

fn open_header(path: &Path) -> Result<(BundleHeader, BufReader<File>)> {
    let file = File::open(path).map_err(|e| StoreError::io(path, e))?;
    let mut reader = BufReader::new(file);

    let mut magic = [0u8; 4];
    reader
        .read_exact(&mut magic)
        .map_err(|e| StoreError::io(path, e))?;
    if magic != BUNDLE_MAGIC {
        return Err(corrupt(path, "missing bundle magic bytes"));
    }
    let version = read_u32(&mut reader).map_err(|e| StoreError::io(path, e))?;
    if version != BUNDLE_FORMAT_VERSION {
        return Err(corrupt(
            path,
            format!("unsupported bundle format version {version}"),
        ));
    }
    let len = read_u32(&mut reader).map_err(|e| StoreError::io(path, e))?;
    if len > MAX_HEADER_LEN {
        return Err(corrupt(path, format!("header length {len} out of range")));
    }
    let mut header_bytes = vec![0u8; len as usize];
    reader
        .read_exact(&mut header_bytes)
        .map_err(|e| StoreError::io(path, e))?;
    let header: BundleHeader = serde_json::from_slice(&header_bytes)
        .map_err(|e| corrupt(path, format!("bad header: {e}")))?;
    if header.commits.len() != header.digests.len() {
        return Err(corrupt(path, "commit and digest counts differ"));
    }
    Ok((header, reader))
}

/// Read only the uncompressed header of a bundle.
pub fn read_header(path: &Path) -> Result<BundleHeader> {
    open_header(path).map(|(header, _)| header)
}

/// Decompress slice `slice` of the bundle at `path` into `dest`.
///
/// `dest` must be an empty or missing directory. Stops reading as soon as
/// the slice has been fully written. Returns the digest recorded for the
/// slice so the caller can verify the extracted tree.
pub fn extract_slice(path: &Path, slice: usize, dest: &Path) -> Result<ArtifactDigest> {
    let (header, reader) = open_header(path)?;
    let expected = *header
        .digests
        .get(slice)
        .ok_or_else(|| corrupt(path, format!("slice {slice} not in bundle")))?;

    fs::create_dir_all(dest).map_err(|e| StoreError::io(dest, e))?;
    let mut decoder = GzDecoder::new(reader);
    let io_err = |e| StoreError::io(path, e);

    loop {
        let len = read_u32(&mut decoder).map_err(io_err)?;
        if len == 0 {
            break;
        }
        if len > MAX_HEADER_LEN {
            return Err(corrupt(path, format!("entry header length {len} out of range")));
        }
        let mut entry_bytes = vec![0u8; len as usize];
        decoder.read_exact(&mut entry_bytes).map_err(io_err)?;
        let entry: EntryHeader = serde_json::from_slice(&entry_bytes)
            .map_err(|e| corrupt(path, format!("bad entry header: {e}")))?;

        if entry.slice > slice {
            break;
        }
        let mut body = (&mut decoder).take(entry.size);
        if entry.slice < slice {
            let skipped = io::copy(&mut body, &mut io::sink()).map_err(io_err)?;
            if skipped != entry.size {
                return Err(corrupt(path, "truncated entry"));
            }
            continue;
        }

        let rel = PathBuf::from(&entry.path);
        if !is_contained(&rel) {
            return Err(corrupt(path, format!("entry path escapes bundle: {}", entry.path)));
        }
        let target = dest.join(&rel);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).map_err(|e| StoreError::io(parent, e))?;
        }
        let mut out = File::create(&target).map_err(|e| StoreError::io(&target, e))?;
        let written = io::copy(&mut body, &mut out).map_err(io_err)?;
        if written != entry.size {
            return Err(corrupt(path, format!("truncated entry {}", entry.path)));
        }
        drop(out);
        set_mode(&target, entry.mode)?;
    }

    Ok(expected)
}
