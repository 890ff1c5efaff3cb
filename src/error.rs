use std::{
    fmt,
    path::PathBuf,
};

use crate::stager::UploadOutcome;

// every stage fails fast with one of these; nothing past the failing stage runs
#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    #[error("invalid `{field}`: {reason}")]
    Validation {
        field: String,
        reason: String,
    },

    #[error("unknown {kind}: `{key}`, available: {known:?}")]
    NotFound {
        kind: &'static str,
        key: String,
        known: Vec<String>,
    },

    #[error("{kind} `{key}` is already registered")]
    DuplicateKey {
        kind: &'static str,
        key: String,
    },

    #[error("plugin `{plugin}` option `{key}`: {reason}")]
    PluginOption {
        plugin: String,
        key: String,
        reason: String,
    },

    #[error("plugin `{plugin}` failed: {source:#}")]
    PluginExecution {
        plugin: String,
        source: anyhow::Error,
    },

    #[error("template `{name}`: {reason}")]
    Template {
        name: String,
        reason: String,
    },

    #[error(transparent)]
    Staging(StagingFailure),

    #[error("`{backend}` rejected the job{}: {diagnostic}", status_suffix(.status))]
    Submission {
        backend: String,
        status: Option<u16>,
        diagnostic: String,
    },

    #[error("i/o error on `{}`: {source}", .path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    // broken invariant between stages, never a user mistake
    #[error("internal error: {0}")]
    Internal(String),
}

fn status_suffix(status: &Option<u16>) -> String {
    match status {
        Some(code) => format!(" (HTTP {code})"),
        None => String::new(),
    }
}

impl LaunchError {
    pub fn validation(field: impl Into<String>, reason: impl Into<String>) -> Self {
        LaunchError::Validation {
            field: field.into(),
            reason: reason.into(),
        }
    }

    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        LaunchError::Io {
            path: path.into(),
            source,
        }
    }
}

// aggregate of a staging run where at least one entry exhausted its retries
#[derive(Debug)]
pub struct StagingFailure {
    // (local path, last error) for every permanently failed entry
    pub failed: Vec<(String, String)>,

    // outcome of every entry, in manifest order
    pub outcomes: Vec<UploadOutcome>,
}

impl fmt::Display for StagingFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "staging failed for {} of {} file(s):",
            self.failed.len(),
            self.outcomes.len()
        )?;
        for (path, err) in &self.failed {
            write!(f, "\n  `{path}`: {err}")?;
        }
        Ok(())
    }
}

impl std::error::Error for StagingFailure {}

pub type Result<T> = std::result::Result<T, LaunchError>;
