//! Load, decode and commit errors, and where they get reported
//!
//! Failures are per photo. A worker that hits one hands a [`LoadFailure`] to the
//! configured [`ErrorReporter`] and moves on to the next item. Losing a race
//! against `dispose` is not a failure and is never reported.

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MappedFileError {
    #[error("failed to open {path}")]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to memory-map {path}")]
    Map {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("mapped file has already been disposed")]
    Disposed,
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error(transparent)]
    Mapped(#[from] MappedFileError),
    #[error("failed to decode {path}")]
    Decode {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
    #[error("failed to encode {path} as {format}")]
    Encode {
        path: PathBuf,
        format: &'static str,
        #[source]
        source: image::ImageError,
    },
    #[error("metadata error")]
    Codec(#[from] exif_codec::CodecError),
    #[error("{operation} failed for {path}")]
    Io {
        operation: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("photo has no open file mapping")]
    MappingClosed,
    #[error("photo was disposed")]
    Disposed,
    #[error("dispatcher stopped before the update ran")]
    DispatcherClosed,
}

impl LoadError {
    pub(crate) fn io(operation: &'static str, path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            operation,
            path: path.into(),
            source,
        }
    }

    /// True when the work was abandoned because the photo was disposed while
    /// it was in flight.
    pub fn is_disposed_race(&self) -> bool {
        matches!(self, Self::Disposed | Self::Mapped(MappedFileError::Disposed))
    }
}

/// What a worker was doing when it failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    LoadMetadata,
    LoadFullImage,
    Commit,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::LoadMetadata => write!(f, "load metadata"),
            Operation::LoadFullImage => write!(f, "load full image"),
            Operation::Commit => write!(f, "commit"),
        }
    }
}

/// A failure with enough context for a person to act on.
#[derive(Debug, Clone, Copy)]
pub struct LoadFailure<'a> {
    pub path: &'a Path,
    pub operation: Operation,
    pub error: &'a LoadError,
}

impl LoadFailure<'_> {
    /// The error and all of its sources joined with `": "`.
    pub fn cause_chain(&self) -> String {
        let mut text = self.error.to_string();
        let mut source = std::error::Error::source(self.error);
        while let Some(cause) = source {
            text.push_str(": ");
            text.push_str(&cause.to_string());
            source = cause.source();
        }
        text
    }
}

impl fmt::Display for LoadFailure<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}: {}", self.operation, self.path.display(), self.cause_chain())
    }
}

/// Receives per-photo failures.
pub trait ErrorReporter: Send + Sync {
    fn report(&self, failure: &LoadFailure<'_>);
}

/// Logs failures at error level.
#[derive(Debug, Default)]
pub struct LogReporter;

impl ErrorReporter for LogReporter {
    fn report(&self, failure: &LoadFailure<'_>) {
        tracing::error!(
            path = %failure.path.display(),
            operation = %failure.operation,
            cause = %failure.cause_chain(),
            "Photo operation failed"
        );
    }
}
