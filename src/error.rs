use std::{ffi::CStr, io, path::PathBuf};

use thiserror::Error;

/// A symbol the tracker needs could not be found in the running process.
#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("symbol {0:?} not found")]
    Missing(&'static CStr),
}

/// Failure to emit the shutdown report.
#[derive(Debug, Error)]
pub enum ReportError {
    #[error("failed to write leak report: {0}")]
    Io(#[from] io::Error),
    #[error("failed to write report dump to {}: {source}", path.display())]
    Dump { path: PathBuf, source: io::Error },
    #[error("failed to convert leak report to YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
}
