//! Parameter source expansion.

use camino::{Utf8Path, Utf8PathBuf};
use drover_config::JobSpec;
use serde_json::{Map, Value};
use std::fs;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ExpandError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: Utf8PathBuf,
        source: std::io::Error,
    },
    #[error("malformed parameter file {path}: {message}")]
    Malformed { path: Utf8PathBuf, message: String },
    #[error("generator {path}: key '{key}' is an empty list, Cartesian product is empty")]
    EmptyGenerator { path: Utf8PathBuf, key: String },
}

impl ExpandError {
    fn malformed(path: &Utf8Path, message: impl Into<String>) -> Self {
        Self::Malformed {
            path: path.to_path_buf(),
            message: message.into(),
        }
    }
}

/// Expand every parameter source of a job, concatenated in declared
/// order. Deterministic: identical inputs yield identical sequences.
pub fn expand_job(job: &JobSpec) -> Result<Vec<Value>, ExpandError> {
    let mut records = Vec::new();
    for file in &job.param_files {
        records.extend(expand_file(file)?);
    }
    Ok(records)
}

/// Expand a single parameter source. Shape is chosen by extension and
/// document structure:
///
/// - `.csv`: one record per row, column names as parameter names, empty
///   cells become null;
/// - a YAML/JSON sequence: a record list, emitted in file order;
/// - a YAML/JSON mapping whose values are lists: a Cartesian generator,
///   expanded in lexicographic key order with the last key innermost.
pub fn expand_file(path: &Utf8Path) -> Result<Vec<Value>, ExpandError> {
    if path.extension() == Some("csv") {
        return expand_csv(path);
    }

    let content = fs::read_to_string(path).map_err(|source| ExpandError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let doc: Value = serde_yaml::from_str(&content)
        .map_err(|e| ExpandError::malformed(path, e.to_string()))?;

    match doc {
        Value::Array(records) => {
            for record in &records {
                if !record.is_object() {
                    return Err(ExpandError::malformed(
                        path,
                        "record lists must contain mappings",
                    ));
                }
            }
            Ok(records)
        }
        Value::Object(generator) => expand_generator(path, generator),
        _ => Err(ExpandError::malformed(
            path,
            "expected a list of records or a generator mapping",
        )),
    }
}

/// Cartesian product over a generator mapping.
///
/// Keys are sorted alphabetically; the last key is the innermost loop.
/// A single-element list whose element is itself a list is one choice
/// carrying a literal list value, so `[[a, b]]` yields one record with
/// the value `[a, b]`, never two records.
fn expand_generator(path: &Utf8Path, generator: Map<String, Value>) -> Result<Vec<Value>, ExpandError> {
    let mut keys: Vec<&String> = generator.keys().collect();
    keys.sort();

    let mut records: Vec<Map<String, Value>> = vec![Map::new()];
    for key in keys {
        let choices = match &generator[key.as_str()] {
            Value::Array(choices) => choices,
            _ => {
                return Err(ExpandError::malformed(
                    path,
                    format!("generator key '{key}' must map to a list"),
                ));
            }
        };
        if choices.is_empty() {
            return Err(ExpandError::EmptyGenerator {
                path: path.to_path_buf(),
                key: key.clone(),
            });
        }

        let mut next = Vec::with_capacity(records.len() * choices.len());
        for record in &records {
            for choice in choices {
                let mut expanded = record.clone();
                expanded.insert(key.clone(), choice.clone());
                next.push(expanded);
            }
        }
        records = next;
    }

    Ok(records.into_iter().map(Value::Object).collect())
}

/// Tabular source: one record per row, named columns, nulls for empty
/// cells.
fn expand_csv(path: &Utf8Path) -> Result<Vec<Value>, ExpandError> {
    let mut reader = csv::Reader::from_path(path)
        .map_err(|e| ExpandError::malformed(path, e.to_string()))?;
    let headers = reader
        .headers()
        .map_err(|e| ExpandError::malformed(path, e.to_string()))?
        .clone();

    let mut records = Vec::new();
    for row in reader.records() {
        let row = row.map_err(|e| ExpandError::malformed(path, e.to_string()))?;
        let mut record = Map::new();
        for (column, cell) in headers.iter().zip(row.iter()) {
            let value = if cell.is_empty() {
                Value::Null
            } else {
                Value::String(cell.to_string())
            };
            record.insert(column.to_string(), value);
        }
        records.push(Value::Object(record));
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write_named(content: &str, suffix: &str) -> (NamedTempFile, Utf8PathBuf) {
        let mut file = tempfile::Builder::new().suffix(suffix).tempfile().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        let path = Utf8PathBuf::from_path_buf(file.path().to_path_buf()).unwrap();
        (file, path)
    }

    #[test]
    fn test_record_list_preserves_file_order() {
        let (_file, path) = write_named("- {x: 1}\n- {x: 2}\n", ".yml");
        let records = expand_file(&path).unwrap();
        assert_eq!(records, vec![json!({"x": 1}), json!({"x": 2})]);
    }

    #[test]
    fn test_cartesian_order_last_key_innermost() {
        let (_file, path) = write_named("param_2: [c, d]\nparam_1: [a, b]\n", ".yml");
        let records = expand_file(&path).unwrap();
        assert_eq!(
            records,
            vec![
                json!({"param_1": "a", "param_2": "c"}),
                json!({"param_1": "a", "param_2": "d"}),
                json!({"param_1": "b", "param_2": "c"}),
                json!({"param_1": "b", "param_2": "d"}),
            ]
        );
    }

    #[test]
    fn test_cartesian_count() {
        let (_file, path) = write_named("a: [1, 2, 3]\nb: [x, y]\nc: [true]\n", ".yml");
        let records = expand_file(&path).unwrap();
        assert_eq!(records.len(), 6);
    }

    #[test]
    fn test_wrapped_list_is_literal_value() {
        let (_file, path) = write_named("layers: [[conv, pool]]\n", ".yml");
        let records = expand_file(&path).unwrap();
        assert_eq!(records, vec![json!({"layers": ["conv", "pool"]})]);
    }

    #[test]
    fn test_empty_generator_value_is_an_error() {
        let (_file, path) = write_named("a: [1]\nb: []\n", ".yml");
        let err = expand_file(&path).unwrap_err();
        assert!(matches!(err, ExpandError::EmptyGenerator { key, .. } if key == "b"));
    }

    #[test]
    fn test_scalar_generator_value_is_malformed() {
        let (_file, path) = write_named("a: 1\n", ".yml");
        assert!(matches!(
            expand_file(&path).unwrap_err(),
            ExpandError::Malformed { .. }
        ));
    }

    #[test]
    fn test_csv_rows_with_null_cells() {
        let (_file, path) = write_named("city,population\nbonn,330000\nmainz,\n", ".csv");
        let records = expand_file(&path).unwrap();
        assert_eq!(
            records,
            vec![
                json!({"city": "bonn", "population": "330000"}),
                json!({"city": "mainz", "population": null}),
            ]
        );
    }

    #[test]
    fn test_expansion_is_deterministic() {
        let (_file, path) = write_named("b: [1, 2]\na: [x, y, z]\n", ".yml");
        assert_eq!(expand_file(&path).unwrap(), expand_file(&path).unwrap());
    }
}
