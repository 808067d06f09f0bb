//! Versioned, gzip-compressed archive of final-evaluation predictions.
//!
//! The file starts with a version header followed by the bincode payload, all
//! inside a gzip stream. Files written by an incompatible version are rejected
//! on load.

use std::fmt;
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;

use bincode::Options;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use ndarray::Array2;
use serde::{Deserialize, Serialize};

/// Current archive schema version.
pub const ARCHIVE_VERSION: u32 = 1;

#[derive(Debug)]
pub enum ArchiveError {
    Io(std::io::Error),
    Serialization(bincode::Error),
    VersionMismatch { expected: u32, found: u32 },
}

impl fmt::Display for ArchiveError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArchiveError::Io(err) => write!(f, "I/O error while accessing archive: {err}"),
            ArchiveError::Serialization(err) => {
                write!(f, "Failed to (de)serialize archive payload: {err}")
            }
            ArchiveError::VersionMismatch { expected, found } => write!(
                f,
                "Archive version mismatch: expected {expected}, found {found}",
            ),
        }
    }
}

impl std::error::Error for ArchiveError {}

impl From<std::io::Error> for ArchiveError {
    fn from(err: std::io::Error) -> Self {
        ArchiveError::Io(err)
    }
}

impl From<bincode::Error> for ArchiveError {
    fn from(err: bincode::Error) -> Self {
        ArchiveError::Serialization(err)
    }
}

/// Observed and predicted outcomes of one evaluation batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionPair {
    pub y: Array2<f32>,
    pub ypred: Array2<f32>,
}

#[derive(Serialize, Deserialize)]
struct ArchiveHeader {
    version: u32,
}

fn codec() -> impl Options {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .allow_trailing_bytes()
        .with_little_endian()
}

/// Writes `pairs` to `path`, creating the parent directory if needed.
pub fn write_predictions<P: AsRef<Path>>(
    path: P,
    pairs: &[PredictionPair],
) -> Result<(), ArchiveError> {
    if let Some(parent) = path.as_ref().parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let file = File::create(path)?;
    let mut encoder = GzEncoder::new(BufWriter::new(file), Compression::default());
    codec().serialize_into(
        &mut encoder,
        &ArchiveHeader {
            version: ARCHIVE_VERSION,
        },
    )?;
    codec().serialize_into(&mut encoder, pairs)?;
    let mut writer = encoder.finish()?;
    writer.flush()?;
    Ok(())
}

pub fn read_predictions<P: AsRef<Path>>(path: P) -> Result<Vec<PredictionPair>, ArchiveError> {
    let file = File::open(path)?;
    let mut decoder = GzDecoder::new(BufReader::new(file));
    let header: ArchiveHeader = codec().deserialize_from(&mut decoder)?;
    if header.version != ARCHIVE_VERSION {
        return Err(ArchiveError::VersionMismatch {
            expected: ARCHIVE_VERSION,
            found: header.version,
        });
    }
    Ok(codec().deserialize_from(&mut decoder)?)
}
