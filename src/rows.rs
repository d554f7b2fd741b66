use std::collections::HashMap;
use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

use csv::{ErrorKind, ReaderBuilder};
use tracing::{info, warn};

use crate::errors::{AppError, AppResult};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RowRecord {
    fields: HashMap<String, String>,
}

impl RowRecord {
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<String>,
    {
        let fields = pairs
            .into_iter()
            .map(|(key, value)| (normalize_header(key.as_ref()), value.into()))
            .collect();
        Self { fields }
    }

    /// Trimmed value of `column`, or `None` when the column is absent or blank.
    pub fn get(&self, column: &str) -> Option<&str> {
        self.fields
            .get(&normalize_header(column))
            .map(|value| value.trim())
            .filter(|value| !value.is_empty())
    }

    pub fn first_of(&self, columns: &[&str]) -> Option<&str> {
        columns.iter().find_map(|column| self.get(column))
    }
}

pub fn read_rows(path: &Path) -> AppResult<Vec<RowRecord>> {
    let file = File::open(path).map_err(|err| match err.kind() {
        io::ErrorKind::NotFound => AppError::MissingInput(path.to_path_buf()),
        _ => AppError::Io(err),
    })?;
    info!(path = %path.display(), "reading CSV rows");
    let rows = parse_rows(file)?;
    info!(rows = rows.len(), "loaded CSV rows");
    Ok(rows)
}

pub fn parse_rows<R: Read>(reader: R) -> AppResult<Vec<RowRecord>> {
    let mut reader = ReaderBuilder::new().flexible(true).from_reader(reader);
    let headers: Vec<String> = reader
        .headers()?
        .iter()
        .map(|header| normalize_header(header.trim_start_matches('\u{feff}')))
        .collect();

    let mut rows = Vec::new();
    for (index, record) in reader.records().enumerate() {
        let record = match record {
            Ok(record) => record,
            Err(err) if matches!(err.kind(), ErrorKind::Utf8 { .. }) => {
                warn!(row = index + 1, ?err, "skipping row with invalid UTF-8");
                continue;
            }
            Err(err) => return Err(err.into()),
        };
        let fields = headers
            .iter()
            .zip(record.iter())
            .map(|(header, value)| (header.clone(), value.to_string()))
            .collect();
        rows.push(RowRecord { fields });
    }
    Ok(rows)
}

fn normalize_header(value: &str) -> String {
    value.trim().to_ascii_lowercase()
}
