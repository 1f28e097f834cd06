use std::fs;
use std::path::PathBuf;

use serde::Serialize;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::context::Scanarium;
use crate::error::{ErrorKind, Result, ScanariumError};

/// One entry of `dynamic/command-log.json`.
#[derive(Debug, Serialize)]
struct LogRecord {
    is_ok: bool,
    command: Option<String>,
    parameters: Vec<Option<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error_message: Option<String>,
    uuid: String,
    /// Artifact timestamp, present on successful scans.
    #[serde(skip_serializing_if = "Option::is_none")]
    timestamp: Option<String>,
}

/// Funnel for scan attempts: every attempt appends exactly one structured
/// record and yields the response envelope handed back to the client.
pub struct CommandLogger {
    log_file: PathBuf,
}

impl CommandLogger {
    pub fn new(scanarium: &Scanarium) -> Result<Self> {
        Ok(CommandLogger {
            log_file: scanarium.dynamic_dir_abs()?.join("command-log.json"),
        })
    }

    /// Append a record for one attempt and build the response envelope.
    /// A success envelope carries the payload; a failure envelope carries
    /// `{code, message, uuid}` and never the private parameters.
    pub fn log(
        &self,
        payload: Option<Value>,
        error: Option<&ScanariumError>,
        command: Option<&str>,
        parameters: Vec<Option<String>>,
    ) -> Result<Value> {
        let record = match error {
            None => LogRecord {
                is_ok: true,
                command: command.map(str::to_string),
                parameters,
                error_code: None,
                error_message: None,
                uuid: Uuid::new_v4().to_string(),
                timestamp: payload
                    .as_ref()
                    .and_then(|p| p.get("flavor"))
                    .and_then(Value::as_str)
                    .map(str::to_string),
            },
            Some(error) => LogRecord {
                is_ok: false,
                command: command.map(str::to_string),
                parameters,
                error_code: Some(error.code().to_string()),
                error_message: Some(error.message.clone()),
                uuid: error.uuid.to_string(),
                timestamp: None,
            },
        };

        self.append(&record)?;

        Ok(match error {
            None => json!({
                "is_ok": true,
                "uuid": record.uuid,
                "payload": payload.unwrap_or_else(|| json!({})),
            }),
            Some(error) => json!({
                "is_ok": false,
                "code": error.code(),
                "message": error.message,
                "uuid": record.uuid,
            }),
        })
    }

    fn append(&self, record: &LogRecord) -> Result<()> {
        let mut entries: Vec<Value> = match fs::read_to_string(&self.log_file) {
            Ok(raw) => serde_json::from_str(&raw).unwrap_or_default(),
            Err(_) => Vec::new(),
        };
        entries.push(serde_json::to_value(record).map_err(|error| {
            ScanariumError::with_parameters(
                ErrorKind::Value,
                "Failed to serialize command log record: {error}",
                &[("error", &error.to_string())],
            )
        })?);
        if let Some(parent) = self.log_file.parent() {
            let _ = fs::create_dir_all(parent);
        }
        fs::write(
            &self.log_file,
            serde_json::to_string_pretty(&entries).unwrap_or_else(|_| "[]".to_string()),
        )
        .map_err(|error| {
            ScanariumError::with_parameters(
                ErrorKind::Value,
                "Failed to write command log \"{file_name}\": {error}",
                &[
                    ("file_name", &self.log_file.display().to_string()),
                    ("error", &error.to_string()),
                ],
            )
        })
    }
}
