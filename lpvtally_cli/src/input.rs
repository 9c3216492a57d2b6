use crate::{expand, CliError};
use content_inspector::{inspect, ContentType};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs;
use std::path::Path;

/// Read a JSON or CBOR file, telling the two apart by content
pub fn read_input<T: DeserializeOwned>(filename: &str) -> Result<T, CliError> {
    let filename = expand(filename);
    let bytes = fs::read(&filename).map_err(|e| CliError::IO(format!("{}: {}", filename, e)))?;

    match inspect(&bytes) {
        ContentType::BINARY => serde_cbor::from_slice(&bytes)
            .map_err(|e| CliError::Format(format!("{}: {}", filename, e))),
        ContentType::UTF_8 => serde_json::from_slice(&bytes)
            .map_err(|e| CliError::Format(format!("{}: {}", filename, e))),
        other => Err(CliError::Format(format!(
            "{}: unsupported encoding {:?}",
            filename, other
        ))),
    }
}

/// Pretty-print `value` as JSON to `filename`, or to stdout when there isn't one
pub fn write_output<T: Serialize>(value: &T, filename: Option<&str>) -> Result<(), CliError> {
    let json =
        serde_json::to_string_pretty(value).map_err(|e| CliError::Format(e.to_string()))?;
    match filename {
        Some(filename) => {
            let filename = expand(filename);
            fs::write(&filename, json).map_err(|e| CliError::IO(format!("{}: {}", filename, e)))
        }
        None => {
            println!("{}", json);
            Ok(())
        }
    }
}

/// Write `value` as JSON into `dir/name`
pub fn write_fixture<T: Serialize>(dir: &Path, name: &str, value: &T) -> Result<(), CliError> {
    let path = dir.join(name);
    write_output(value, Some(&path.to_string_lossy()))
}
