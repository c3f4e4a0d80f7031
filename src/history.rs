//! Append-only record of deployment runs, one CSV row per run.
use std::fs::{self, OpenOptions};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::DeployError;

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct HistoryRecord {
    pub recorded_at: i64,
    pub target: String,
    pub before: String,
    pub after: String,
    pub plan: String,
    pub files: Option<usize>,
    pub snapshot: String,
    pub outcome: String,
    pub detail: String,
}

pub fn append(path: &Path, record: &HistoryRecord) -> Result<(), DeployError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| DeployError::io(format!("creating {}", parent.display()), e))?;
    }
    //Header only goes in once, at the top of a new file
    let is_new = fs::metadata(path).map(|m| m.len() == 0).unwrap_or(true);
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| DeployError::io(format!("opening {}", path.display()), e))?;

    let mut writer = csv::WriterBuilder::new()
        .has_headers(is_new)
        .from_writer(file);
    writer.serialize(record)?;
    writer
        .flush()
        .map_err(|e| DeployError::io(format!("writing {}", path.display()), e))?;
    Ok(())
}

pub fn read_all(path: &Path) -> Result<Vec<HistoryRecord>, DeployError> {
    let mut reader = csv::Reader::from_path(path)?;
    let mut records = Vec::new();
    for row in reader.deserialize() {
        records.push(row?);
    }
    Ok(records)
}
