//! Error taxonomy shared by all components.
// SPDX-License-Identifier: Apache-2.0 OR MIT

use camino::Utf8PathBuf;
use thiserror::Error;

/// The coarse category of an [`Error`], for programmatic matching.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum ErrorKind {
    NotFound,
    Conflict,
    InvalidOperation,
    AmbiguousTarget,
    Compile,
    NotApplicable,
    Resolution,
    Transport,
    InvariantViolation,
    Malformed,
    Io,
}

/// An error from one of the image composition components.
#[derive(Debug, Error)]
#[allow(missing_docs)]
pub enum Error {
    #[error("{what} '{name}' not found")]
    NotFound { what: &'static str, name: String },
    #[error("{0}")]
    Conflict(String),
    #[error("{0}")]
    InvalidOperation(String),
    #[error("{message}{}", candidate_list(.candidates))]
    AmbiguousTarget {
        message: String,
        candidates: Vec<String>,
    },
    #[error("cannot compile '{path}': {detail}")]
    Compile { path: Utf8PathBuf, detail: String },
    #[error("overlay '{overlay}' is not applicable to device tree '{device_tree}': {detail}")]
    NotApplicable {
        overlay: String,
        device_tree: String,
        detail: String,
    },
    #[error("{0}")]
    Resolution(String),
    #[error("{0}")]
    Transport(String),
    #[error("internal error: {0}; please report this bug")]
    InvariantViolation(String),
    #[error("malformed {what}: {detail}")]
    Malformed { what: &'static str, detail: String },
    #[error("I/O error on {path}: {err}")]
    PathIo {
        path: Utf8PathBuf,
        err: std::io::Error,
    },
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

fn candidate_list(candidates: &[String]) -> String {
    if candidates.is_empty() {
        return String::new();
    }
    let mut r = String::from(
        "\nPlease use --device-tree to pass one of the device trees below or use --force to bypass checking:",
    );
    for c in candidates {
        r.push_str("\n- ");
        r.push_str(c);
    }
    r
}

impl Error {
    /// The category of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::NotFound { .. } => ErrorKind::NotFound,
            Error::Conflict(_) => ErrorKind::Conflict,
            Error::InvalidOperation(_) => ErrorKind::InvalidOperation,
            Error::AmbiguousTarget { .. } => ErrorKind::AmbiguousTarget,
            Error::Compile { .. } => ErrorKind::Compile,
            Error::NotApplicable { .. } => ErrorKind::NotApplicable,
            Error::Resolution(_) => ErrorKind::Resolution,
            Error::Transport(_) => ErrorKind::Transport,
            Error::InvariantViolation(_) => ErrorKind::InvariantViolation,
            Error::Malformed { .. } => ErrorKind::Malformed,
            Error::PathIo { .. } | Error::Io(_) => ErrorKind::Io,
        }
    }

    pub(crate) fn not_found(what: &'static str, name: impl Into<String>) -> Self {
        Error::NotFound {
            what,
            name: name.into(),
        }
    }

    pub(crate) fn io_at(path: impl Into<Utf8PathBuf>) -> impl FnOnce(std::io::Error) -> Self {
        let path = path.into();
        move |err| Error::PathIo { path, err }
    }
}

/// The type of Result.
pub type Result<T> = std::result::Result<T, Error>;
