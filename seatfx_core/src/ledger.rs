//! Result ledger: one JSON document of run records plus a CSV view of it.
//!
//! The JSON file `{ "len": n, "data": [...] }` is authoritative. The CSV is
//! regenerated on every save, ordered by validation RMSE, and only checked
//! for drift.

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::config::ExperimentConfig;
use crate::error::{EffectError, EffectResult};
use crate::trainer::TrainingReport;

/// A ledger record: hyperparameters, run identity and rounded metrics.
pub type Record = Map<String, Value>;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LedgerFile {
    pub len: usize,
    pub data: Vec<Record>,
}

/// An earlier run with the same hyperparameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DuplicateOf {
    pub run_id: String,
    pub index: usize,
}

/// Rounds a metric to three decimals for the ledger.
pub fn round3(value: f64) -> f64 {
    (value * 1000.0).round() / 1000.0
}

/// Builds the ledger record of a finished run.
pub fn result_record(config: &ExperimentConfig, run_id: &Uuid, report: &TrainingReport) -> Record {
    let mut record = Record::new();
    record.insert("run_id".into(), Value::from(run_id.to_string()));
    record.insert("method".into(), Value::from(config.model.name()));
    record.extend(config.hyperparameters());

    let within = &report.evaluation.within;
    let without = &report.evaluation.without;
    let metrics = [
        ("train_rmse", report.train_rmse),
        ("valid_rmse", report.valid_rmse),
        ("within_rmse", within.rmse),
        ("within_pehe", within.pehe),
        ("within_ate", within.ate),
        ("within_ks", within.ks),
        ("within_vio", within.violation),
        ("without_rmse", without.rmse),
        ("without_pehe", without.pehe),
        ("without_ate", without.ate),
        ("without_ks", without.ks),
        ("without_vio", without.violation),
    ];
    for (key, value) in metrics {
        record.insert(key.into(), Value::from(round3(value)));
    }
    record
}

fn read_strict(path: &Path) -> EffectResult<LedgerFile> {
    let contents = fs::read_to_string(path)?;
    serde_json::from_str(&contents).map_err(|err| EffectError::LedgerCorrupt {
        path: path.to_path_buf(),
        details: err.to_string(),
    })
}

fn ensure_parent(path: &Path) -> EffectResult<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    Ok(())
}

fn write_json(path: &Path, file: &LedgerFile) -> EffectResult<()> {
    ensure_parent(path)?;
    let mut writer = BufWriter::new(File::create(path)?);
    serde_json::to_writer_pretty(&mut writer, file)?;
    writer.write_all(b"\n")?;
    writer.flush()?;
    Ok(())
}

fn csv_cell(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    }
}

/// Run records of one model family.
#[derive(Debug, Clone)]
pub struct Ledger {
    json_path: PathBuf,
    csv_path: PathBuf,
    file: LedgerFile,
}

impl Ledger {
    /// Opens the ledger, creating an empty JSON document when none exists.
    ///
    /// A JSON document that does not parse is reported as
    /// [`EffectError::LedgerCorrupt`]; see [`Ledger::repair`].
    pub fn open<P: Into<PathBuf>, Q: Into<PathBuf>>(json_path: P, csv_path: Q) -> EffectResult<Self> {
        let json_path = json_path.into();
        let csv_path = csv_path.into();
        let file = if json_path.exists() {
            read_strict(&json_path)?
        } else {
            let empty = LedgerFile::default();
            write_json(&json_path, &empty)?;
            empty
        };
        Ok(Self {
            json_path,
            csv_path,
            file,
        })
    }

    /// Keeps the first complete JSON document of a damaged ledger and rewrites it.
    ///
    /// Returns the number of records kept.
    pub fn repair<P: AsRef<Path>>(path: P) -> EffectResult<usize> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)?;
        let mut stream = serde_json::Deserializer::from_str(&contents).into_iter::<LedgerFile>();
        let mut file = match stream.next() {
            Some(Ok(file)) => file,
            Some(Err(err)) => {
                return Err(EffectError::LedgerCorrupt {
                    path: path.to_path_buf(),
                    details: format!("no complete document to recover: {}", err),
                })
            }
            None => {
                return Err(EffectError::LedgerCorrupt {
                    path: path.to_path_buf(),
                    details: "empty file".into(),
                })
            }
        };
        file.len = file.data.len();
        write_json(path, &file)?;
        tracing::warn!(
            path = %path.display(),
            records = file.len,
            "ledger repaired from its first complete document"
        );
        Ok(file.len)
    }

    pub fn records(&self) -> &[Record] {
        &self.file.data
    }

    pub fn len(&self) -> usize {
        self.file.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.file.data.is_empty()
    }

    /// First record whose every non-volatile hyperparameter equals `config`'s.
    pub fn find_duplicate(&self, config: &ExperimentConfig) -> Option<DuplicateOf> {
        let wanted = config.hyperparameters();
        self.file
            .data
            .iter()
            .position(|record| {
                wanted
                    .iter()
                    .all(|(key, value)| record.get(key) == Some(value))
            })
            .map(|index| DuplicateOf {
                run_id: self.file.data[index]
                    .get("run_id")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                index,
            })
    }

    fn csv_rows(&self) -> Option<usize> {
        let mut reader = csv::Reader::from_path(&self.csv_path).ok()?;
        let mut rows = 0;
        for record in reader.records() {
            if record.is_err() {
                return None;
            }
            rows += 1;
        }
        Some(rows)
    }

    /// Appends `record` and writes the JSON document; returns its position in `data`.
    ///
    /// The JSON document is re-read first so that records appended by an
    /// earlier process are kept. The CSV is left to [`Ledger::save`].
    pub fn append(&mut self, record: Record) -> EffectResult<usize> {
        if self.json_path.exists() {
            self.file = read_strict(&self.json_path)?;
        }
        if self.csv_path.exists() {
            match self.csv_rows() {
                Some(rows) if rows == self.file.data.len() => {}
                Some(rows) => tracing::warn!(
                    csv = %self.csv_path.display(),
                    csv_rows = rows,
                    json_rows = self.file.data.len(),
                    "ledger CSV drifted from JSON; it will be regenerated"
                ),
                None => tracing::warn!(
                    csv = %self.csv_path.display(),
                    "ledger CSV is unreadable; it will be regenerated"
                ),
            }
        }
        self.file.data.push(record);
        self.file.len = self.file.data.len();
        write_json(&self.json_path, &self.file)?;
        Ok(self.file.len - 1)
    }

    /// Column names in first-seen order across records.
    fn columns(&self) -> Vec<String> {
        let mut columns: Vec<String> = Vec::new();
        for record in &self.file.data {
            for key in record.keys() {
                if !columns.iter().any(|c| c == key) {
                    columns.push(key.clone());
                }
            }
        }
        columns
    }

    /// Record positions ordered by ascending `valid_rmse`; ties keep ledger order.
    fn ranking(&self) -> Vec<usize> {
        let mut order: Vec<usize> = (0..self.file.data.len()).collect();
        let key = |index: usize| {
            self.file.data[index]
                .get("valid_rmse")
                .and_then(Value::as_f64)
                .unwrap_or(f64::INFINITY)
        };
        order.sort_by(|&a, &b| key(a).total_cmp(&key(b)));
        order
    }

    /// Rewrites the JSON document and the ranked CSV.
    pub fn save(&self) -> EffectResult<()> {
        write_json(&self.json_path, &self.file)?;

        ensure_parent(&self.csv_path)?;
        let columns = self.columns();
        let mut writer = csv::Writer::from_path(&self.csv_path)?;
        let mut header = vec![String::new()];
        header.extend(columns.iter().cloned());
        writer.write_record(&header)?;
        for index in self.ranking() {
            let record = &self.file.data[index];
            let mut row = vec![index.to_string()];
            row.extend(columns.iter().map(|c| csv_cell(record.get(c))));
            writer.write_record(&row)?;
        }
        writer.flush()?;
        Ok(())
    }
}
