use std::fs::{self, create_dir_all, rename, File};
use std::io::{BufWriter, Write};
use std::path::Path;

use log::{error, info};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{Result, SeekError};

/// Reads a headerless CSV of floats into rows. Every row must have the same width.
pub fn read_csv_matrix(path: &Path) -> Result<Vec<Vec<f32>>> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .trim(csv::Trim::All)
        .from_path(path)?;

    let mut rows = Vec::new();
    for (i, record) in reader.records().enumerate() {
        let record = record?;
        let row: std::result::Result<Vec<f32>, _> = record.iter().map(|s| s.parse::<f32>()).collect();
        match row {
            Ok(vec) => rows.push(vec),
            Err(e) => {
                error!("Failed to parse line {} of '{}' to floats: {}", i + 1, path.display(), e);
                return Err(SeekError::InvalidArgument(format!(
                    "line {} of {} is not a row of floats",
                    i + 1,
                    path.display()
                )));
            }
        }
    }

    if rows.is_empty() {
        return Err(SeekError::InvalidArgument(format!("CSV '{}' is empty", path.display())));
    }
    info!("Loaded {} rows from '{}'", rows.len(), path.display());
    Ok(rows)
}

pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let file = File::open(path).map_err(|e| SeekError::io(path, e))?;
    Ok(serde_json::from_reader(std::io::BufReader::new(file))?)
}

/// Serializes to a `.tmp` sibling and renames it into place.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        create_dir_all(parent).map_err(|e| SeekError::io(parent, e))?;
    }
    let tmp_path = path.with_extension("json.tmp");
    {
        let file = File::create(&tmp_path).map_err(|e| SeekError::io(&tmp_path, e))?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer_pretty(&mut writer, value)?;
        writer.flush().map_err(|e| SeekError::io(&tmp_path, e))?;
    }
    rename(&tmp_path, path).map_err(|e| SeekError::io(path, e))?;
    Ok(())
}

pub fn remove_if_exists(path: &Path) -> Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(SeekError::io(path, e)),
    }
}
