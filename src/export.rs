//! Writing collected records to disk.

use serde::Serialize;
use serde_json::{Map, Value};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::data::PullRequestRecord;
use crate::Result;

pub fn json_path(dir: &Path, org: &str) -> PathBuf {
    dir.join(format!("{}-pulls.json", org))
}

pub fn csv_path(dir: &Path, org: &str) -> PathBuf {
    dir.join(format!("{}-pulls.csv", org))
}

/// Write `{org}-pulls.json` and `{org}-pulls.csv` into `dir`, creating it if
/// needed and replacing any previous files.
pub fn write_all(dir: &Path, org: &str, records: &[PullRequestRecord]) -> Result<()> {
    fs::create_dir_all(dir)?;
    fs::write(json_path(dir, org), to_json(records)?)?;
    let file = fs::File::create(csv_path(dir, org))?;
    write_csv(file, records, &PullRequestRecord::FIELDS)
}

pub fn to_json<T: Serialize>(rows: &[T]) -> Result<String> {
    serde_json::to_string_pretty(rows).map_err(Into::into)
}

/// Flatten `rows` to CSV. The header is the union of the rows' keys in the
/// order they are first seen, or `fallback_header` if there are no rows.
/// Nulls become empty fields and rows with only empty fields are dropped.
pub fn write_csv<T: Serialize, W: Write>(out: W, rows: &[T], fallback_header: &[&str]) -> Result<()> {
    let objects = rows
        .iter()
        .map(|row| -> Result<Map<String, Value>> {
            match serde_json::to_value(row)? {
                Value::Object(map) => Ok(map),
                other => {
                    let mut map = Map::new();
                    map.insert("value".to_owned(), other);
                    Ok(map)
                }
            }
        })
        .collect::<Result<Vec<_>>>()?;

    let mut header: Vec<&str> = vec![];
    for object in &objects {
        for key in object.keys() {
            if !header.contains(&&**key) {
                header.push(key);
            }
        }
    }
    if objects.is_empty() {
        header = fallback_header.to_vec();
    }

    let mut writer = csv::WriterBuilder::new().has_headers(false).from_writer(out);
    writer.write_record(&header)?;
    for object in &objects {
        let cells: Vec<String> = header.iter().map(|key| cell(object.get(*key))).collect();
        if cells.iter().all(String::is_empty) {
            continue;
        }
        writer.write_record(&cells)?;
    }
    writer.flush()?;
    Ok(())
}

fn cell(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    }
}
