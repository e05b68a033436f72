//! Error types for project loading and evaluation.
//!
//! Condition parse/evaluation failures are deliberately *not* represented
//! here: they live in [`crate::condition::ConditionError`] and are coerced to
//! a false condition at the call site, never propagated out of an
//! evaluation.  Only structural problems (unreadable or malformed project
//! XML) surface as [`EvalError`].

use std::path::PathBuf;

use thiserror::Error;

/// Error raised while loading or evaluating a project file.
#[derive(Debug, Error)]
pub enum EvalError {
    /// The file could not be read.
    #[error("{path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The file is not well-formed XML.
    #[error("{path}: XML error: {message}")]
    Xml { path: PathBuf, message: String },

    /// The XML is well-formed but not a valid MSBuild project.
    #[error("{path}: invalid project file: {message}")]
    InvalidProjectFile { path: PathBuf, message: String },
}

impl EvalError {
    pub(crate) fn invalid(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::InvalidProjectFile { path: path.into(), message: message.into() }
    }
}
