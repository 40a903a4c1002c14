use std::path::PathBuf;

use thiserror::Error;

/// Setup-time errors: bad destinations, undetectable formats, malformed
/// rows. These are fatal and never enter the retry loop.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unsupported export format `{0}`")]
    UnsupportedExportFormat(String),

    #[error("cannot detect input format for {0:?}; set the format explicitly")]
    UndetectableFormat(PathBuf),

    #[error("{0:?} export requires a file path")]
    MissingExportPath(crate::config::ExportFormat),

    #[error("webhook export requires a webhook configuration")]
    MissingWebhookConfig,

    #[error("row {row}: missing required field `{field}`")]
    MissingField { row: usize, field: String },

    #[error("{path:?}: {detail}")]
    InvalidInput { path: PathBuf, detail: String },
}
