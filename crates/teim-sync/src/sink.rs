//! Append-only diagnostic log of rows that could not be processed. Feature
//! flagged: disabled unless a path is configured. Sink failures only warn;
//! diagnostics never break an import.

use std::fs::OpenOptions;

use tracing::warn;

use teim_core::{ImportPhase, Row};

use crate::ImportConfig;

pub struct BadRowSink {
    writer: Option<csv::Writer<std::fs::File>>,
}

impl BadRowSink {
    pub fn open(config: &ImportConfig) -> Self {
        let Some(path) = &config.bad_rows_path else {
            return Self { writer: None };
        };

        let needs_header = std::fs::metadata(path).map(|m| m.len() == 0).unwrap_or(true);
        let file = match OpenOptions::new().create(true).append(true).open(path) {
            Ok(file) => file,
            Err(err) => {
                warn!(path = %path.display(), error = %err, "bad-row sink unavailable");
                return Self { writer: None };
            }
        };
        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(file);
        if needs_header {
            if let Err(err) = writer.write_record(["row", "phase", "reason", "raw_json"]) {
                warn!(error = %err, "bad-row sink header write failed");
            }
        }
        Self {
            writer: Some(writer),
        }
    }

    pub fn record(&mut self, row: &Row, phase: ImportPhase, reason: &str) {
        let Some(writer) = self.writer.as_mut() else {
            return;
        };
        let raw_json = serde_json::to_string(&row.fields).unwrap_or_default();
        let result = writer
            .write_record([
                row.index.to_string().as_str(),
                phase.as_str(),
                reason,
                raw_json.as_str(),
            ])
            .and_then(|()| writer.flush().map_err(Into::into));
        if let Err(err) = result {
            warn!(row = row.index, error = %err, "bad-row sink write failed");
        }
    }
}
