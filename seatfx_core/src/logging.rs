//! Scalar sinks for training curves.
//!
//! The trainer reports named scalars (`Train RMSE`, `Out PEHE`, ...) through a
//! [`ScalarSink`]. [`JsonlScalarSink`] appends one JSON object per line so runs
//! can be plotted afterwards; [`MemorySink`] keeps them in memory.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Destination for scalar training metrics.
pub trait ScalarSink {
    fn add_scalar(&mut self, tag: &str, value: f64, step: usize) -> io::Result<()>;
}

fn append_json_line<P: AsRef<Path>, T: Serialize>(path: P, value: &T) -> io::Result<()> {
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    serde_json::to_writer(&mut file, value)
        .map_err(|err| io::Error::new(io::ErrorKind::Other, err))?;
    file.write_all(b"\n")
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScalarEntry {
    pub tag: String,
    pub value: f64,
    pub step: usize,
    pub timestamp_ms: u128,
}

/// Appends scalars to a JSON-lines file.
#[derive(Debug, Clone)]
pub struct JsonlScalarSink {
    path: PathBuf,
}

impl JsonlScalarSink {
    /// Creates the parent directory of `path`; the file is created on first write.
    pub fn create<P: Into<PathBuf>>(path: P) -> io::Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ScalarSink for JsonlScalarSink {
    fn add_scalar(&mut self, tag: &str, value: f64, step: usize) -> io::Result<()> {
        let entry = ScalarEntry {
            tag: tag.to_string(),
            value,
            step,
            timestamp_ms: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_millis(),
        };
        append_json_line(&self.path, &entry)
    }
}

/// Keeps every scalar in memory.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    pub entries: Vec<(String, f64, usize)>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Values logged under `tag`, in order.
    pub fn values(&self, tag: &str) -> Vec<f64> {
        self.entries
            .iter()
            .filter(|(t, _, _)| t == tag)
            .map(|(_, v, _)| *v)
            .collect()
    }
}

impl ScalarSink for MemorySink {
    fn add_scalar(&mut self, tag: &str, value: f64, step: usize) -> io::Result<()> {
        self.entries.push((tag.to_string(), value, step));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn jsonl_sink_appends_lines() {
        let dir = std::env::temp_dir().join(format!("seatfx_scalars_{}", Uuid::new_v4()));
        let mut sink = JsonlScalarSink::create(dir.join("scalars.jsonl")).unwrap();
        sink.add_scalar("Train RMSE", 0.5, 0).unwrap();
        sink.add_scalar("Valid RMSE", 0.75, 0).unwrap();

        let contents = fs::read_to_string(sink.path()).unwrap();
        let entries: Vec<ScalarEntry> = contents
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].tag, "Train RMSE");
        assert_eq!(entries[1].value, 0.75);

        fs::remove_dir_all(dir).ok();
    }

    #[test]
    fn memory_sink_filters_by_tag() {
        let mut sink = MemorySink::new();
        sink.add_scalar("a", 1.0, 0).unwrap();
        sink.add_scalar("b", 2.0, 0).unwrap();
        sink.add_scalar("a", 3.0, 1).unwrap();
        assert_eq!(sink.values("a"), vec![1.0, 3.0]);
    }
}
