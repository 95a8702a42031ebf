use std::path::PathBuf;

use thiserror::Error;

use crate::order::DownloadMetaMap;

pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by the M2M client.
#[derive(Debug, Error)]
pub enum Error {
    /// The service answered with a non-success status or a populated `errorCode`.
    #[error("{}", service_display(*status, code, message))]
    Service {
        status: u16,
        code: String,
        message: String,
    },

    /// Every attempt failed at the connection level.
    #[error("maximum retries exceeded after {attempts} attempt(s) for {url}: {last}")]
    MaxRetriesExceeded {
        url: String,
        attempts: usize,
        last: String,
    },

    /// A transport failure that is not worth retrying.
    #[error("request to {url} failed: {message}")]
    Transport { url: String, message: String },

    /// The service returned neither data nor an error code.
    #[error("no output from service for {endpoint}")]
    EmptyResponse { endpoint: String },

    #[error("unexpected response from {endpoint}: {reason}")]
    Decode { endpoint: String, reason: String },

    /// An attribute name is absent from the dataset filter catalog.
    #[error("attribute `{field}` is not a filter of this dataset")]
    UnknownField { field: String },

    /// The dataset is not among those `dataset-search` lists for the user.
    #[error("dataset `{dataset}` not available; choose one of {}", available.join(", "))]
    UnknownDataset {
        dataset: String,
        available: Vec<String>,
    },

    /// Criteria that cannot be expressed on the wire.
    #[error("invalid search criteria: {reason}")]
    InvalidCriteria { reason: String },

    #[error("invalid geometry in {}: {reason}", path.display())]
    Geometry { path: PathBuf, reason: String },

    /// Zero or missing content length, or a size mismatch after download.
    #[error("{}: {reason}", path.display())]
    Integrity { path: PathBuf, reason: String },

    /// One or more download jobs exhausted their retries.
    ///
    /// `meta` holds the metadata map as it stood once every job settled.
    #[error("{} download(s) failed", failures.len())]
    DownloadsFailed {
        failures: Vec<DownloadFailure>,
        meta: Box<DownloadMetaMap>,
    },

    #[error("operation cancelled")]
    Cancelled,

    #[error("order still incomplete after {rounds} poll round(s)")]
    PollLimit { rounds: usize },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Config(#[from] anyhow::Error),
}

/// A download job that could not be completed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadFailure {
    pub download_id: String,
    pub url: String,
    pub path: PathBuf,
    pub attempts: usize,
    pub reason: String,
}

impl std::fmt::Display for DownloadFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} ({}) after {} attempt(s): {}",
            self.path.display(),
            self.url,
            self.attempts,
            self.reason
        )
    }
}

#[derive(Debug, serde::Deserialize)]
pub(crate) struct ErrorEnvelope {
    #[serde(default, rename = "errorCode")]
    pub(crate) error_code: Option<String>,
    #[serde(default, rename = "errorMessage")]
    pub(crate) error_message: Option<String>,
}

fn service_display(status: u16, code: &str, message: &str) -> String {
    if code.is_empty() {
        format!("{} - {}", status, message)
    } else {
        format!("{} - {} - {}", status, code, message)
    }
}

pub(crate) fn service_error(status: u16, body: &str) -> Error {
    match serde_json::from_str::<ErrorEnvelope>(body) {
        Ok(env) if env.error_code.is_some() || env.error_message.is_some() => Error::Service {
            status,
            code: env.error_code.unwrap_or_default(),
            message: env.error_message.unwrap_or_default(),
        },
        // Gateways in front of M2M answer with HTML or plain text.
        _ => Error::Service {
            status,
            code: String::new(),
            message: body.trim().to_string(),
        },
    }
}
