//! File payload parsing shared by the filesystem and object-store connectors
//!
//! Every format is turned into flat JSON records: nested objects become
//! `parent__child` columns, arrays are kept as JSON text.

use crate::connectors::Record;
use crate::error::{LumosError, Result};
use csv::ReaderBuilder;
use polars::prelude::*;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::io::Cursor;
use std::path::Path;
use std::str::FromStr;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileFormat {
    Csv,
    Tsv,
    Json,
    Jsonl,
    Parquet,
}

impl FileFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileFormat::Csv => "csv",
            FileFormat::Tsv => "tsv",
            FileFormat::Json => "json",
            FileFormat::Jsonl => "jsonl",
            FileFormat::Parquet => "parquet",
        }
    }

    /// Detect the format from a file name's extension
    pub fn from_path(path: &str) -> Option<Self> {
        let ext = Path::new(path).extension()?.to_str()?.to_lowercase();
        match ext.as_str() {
            "csv" | "txt" => Some(FileFormat::Csv),
            "tsv" => Some(FileFormat::Tsv),
            "json" => Some(FileFormat::Json),
            "jsonl" | "ndjson" => Some(FileFormat::Jsonl),
            "parquet" | "pq" => Some(FileFormat::Parquet),
            _ => None,
        }
    }
}

impl FromStr for FileFormat {
    type Err = LumosError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "csv" => Ok(FileFormat::Csv),
            "tsv" => Ok(FileFormat::Tsv),
            "json" => Ok(FileFormat::Json),
            "jsonl" | "ndjson" => Ok(FileFormat::Jsonl),
            "parquet" => Ok(FileFormat::Parquet),
            other => Err(LumosError::Configuration(format!(
                "Unsupported file format '{}'. Supported formats: csv, tsv, json, jsonl, parquet",
                other
            ))),
        }
    }
}

/// File stem used as the default table name of a unit
pub fn file_stem(path: &str) -> String {
    Path::new(path)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("data")
        .to_string()
}

/// Parse a whole file payload into records
pub fn parse_records(format: FileFormat, bytes: &[u8]) -> Result<Vec<Record>> {
    match format {
        FileFormat::Csv => parse_delimited(bytes, b','),
        FileFormat::Tsv => parse_delimited(bytes, b'\t'),
        FileFormat::Json => parse_json(bytes),
        FileFormat::Jsonl => parse_json_lines(bytes),
        FileFormat::Parquet => parse_parquet(bytes),
    }
}

fn coerce_cell(s: &str) -> Value {
    let trimmed = s.trim();
    if trimmed.is_empty() {
        return Value::Null;
    }

    if trimmed.eq_ignore_ascii_case("true") {
        return Value::Bool(true);
    }
    if trimmed.eq_ignore_ascii_case("false") {
        return Value::Bool(false);
    }

    // Zero-padded codes ("00501") stay text
    let digits = trimmed.trim_start_matches(['-', '+']);
    let zero_padded = digits.len() > 1
        && digits.starts_with('0')
        && digits.as_bytes()[1].is_ascii_digit();
    let numeric_chars = trimmed
        .chars()
        .all(|c| c.is_ascii_digit() || matches!(c, '.' | '-' | '+' | 'e' | 'E'));

    if numeric_chars && !zero_padded {
        if let Ok(i) = trimmed.parse::<i64>() {
            return Value::Number(i.into());
        }
        if let Ok(f) = trimmed.parse::<f64>() {
            if let Some(n) = serde_json::Number::from_f64(f) {
                return Value::Number(n);
            }
        }
    }

    Value::String(trimmed.to_string())
}

fn parse_delimited(bytes: &[u8], delimiter: u8) -> Result<Vec<Record>> {
    let mut rdr = ReaderBuilder::new()
        .has_headers(true)
        .delimiter(delimiter)
        .from_reader(bytes);

    let raw_headers = rdr.headers()?.clone();
    if raw_headers.iter().all(|h| h.trim().is_empty()) {
        return Err(LumosError::Extraction("CSV payload has no header row".to_string()));
    }
    let headers = unique_column_keys(raw_headers.iter());

    let mut out = Vec::new();
    for result in rdr.records() {
        let record = result?;
        let mut obj = Map::new();

        for (idx, header) in headers.iter().enumerate() {
            let cell = record.get(idx).unwrap_or("");
            obj.insert(header.clone(), coerce_cell(cell));
        }

        out.push(obj);
    }

    Ok(out)
}

/// SQL-safe column key: lowercased, every non-alphanumeric replaced by `_`,
/// `col_` in front of a leading digit. A blank header becomes `col_{position}`
/// (1-based).
pub fn column_key(raw: &str, position: usize) -> String {
    let key: String = raw
        .trim()
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { '_' })
        .collect();
    if key.is_empty() {
        format!("col_{}", position)
    } else if key.starts_with(|c: char| c.is_ascii_digit()) {
        format!("col_{}", key)
    } else {
        key
    }
}

/// Column keys for a header row; a repeated key gets `_2`, `_3`, ...
fn unique_column_keys<'a>(headers: impl Iterator<Item = &'a str>) -> Vec<String> {
    let mut seen = HashSet::new();
    headers
        .enumerate()
        .map(|(idx, header)| {
            let base = column_key(header, idx + 1);
            let mut key = base.clone();
            let mut n = 2;
            while !seen.insert(key.clone()) {
                key = format!("{}_{}", base, n);
                n += 1;
            }
            key
        })
        .collect()
}

fn parse_json(bytes: &[u8]) -> Result<Vec<Record>> {
    let value: Value = serde_json::from_slice(bytes)?;
    match value {
        Value::Array(items) => items
            .into_iter()
            .enumerate()
            .map(|(idx, item)| into_record(item, idx))
            .collect(),
        Value::Object(_) => Ok(vec![into_record(value, 0)?]),
        other => Err(LumosError::Extraction(format!(
            "JSON payload must be an object or an array of objects, found {}",
            json_kind(&other)
        ))),
    }
}

fn parse_json_lines(bytes: &[u8]) -> Result<Vec<Record>> {
    let text = std::str::from_utf8(bytes)
        .map_err(|e| LumosError::Extraction(format!("JSON lines payload is not UTF-8: {}", e)))?;

    text.lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(idx, line)| {
            let value: Value = serde_json::from_str(line).map_err(|e| {
                LumosError::Extraction(format!("Invalid JSON on line {}: {}", idx + 1, e))
            })?;
            into_record(value, idx)
        })
        .collect()
}

fn parse_parquet(bytes: &[u8]) -> Result<Vec<Record>> {
    let mut df = ParquetReader::new(Cursor::new(bytes.to_vec())).finish()?;

    let mut buffer: Vec<u8> = Vec::new();
    JsonWriter::new(&mut buffer)
        .with_json_format(JsonFormat::JsonLines)
        .finish(&mut df)?;

    parse_json_lines(&buffer)
}

fn into_record(value: Value, position: usize) -> Result<Record> {
    match value {
        Value::Object(obj) => {
            let mut flat = Map::new();
            flatten_into("", obj, &mut flat);
            Ok(flat)
        }
        other => Err(LumosError::Extraction(format!(
            "Record {} is a JSON {}, expected an object",
            position,
            json_kind(&other)
        ))),
    }
}

/// Flatten nested objects into `parent__child` keys
pub fn flatten_into(prefix: &str, obj: Map<String, Value>, out: &mut Record) {
    for (key, val) in obj {
        let name = if prefix.is_empty() {
            key
        } else {
            format!("{}__{}", prefix, key)
        };
        match val {
            Value::Object(inner) => flatten_into(&name, inner, out),
            Value::Array(items) => {
                out.insert(name, Value::String(Value::Array(items).to_string()));
            }
            scalar => {
                out.insert(name, scalar);
            }
        }
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
