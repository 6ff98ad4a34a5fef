use std::{io, path::PathBuf};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FormatError {
    #[error("line {line}: unterminated string")]
    UnterminatedString { line: usize },
    #[error("line {line}: key {key:?} has no value")]
    MissingValue { key: String, line: usize },
    #[error("line {line}: unexpected brace")]
    UnexpectedBrace { line: usize },
    #[error("line {line}: unbalanced braces, block never closed")]
    UnbalancedBraces { line: usize },
    #[error("document has no root key")]
    MissingRoot,
    #[error("line {line}: unexpected data after root block")]
    TrailingData { line: usize },
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request to {url} failed: {message}")]
    Transport { url: String, message: String },
    #[error("{url} answered HTTP {status}")]
    Status { url: String, status: u16 },
    #[error("could not read response from {url}: {source}")]
    Body {
        url: String,
        #[source]
        source: io::Error,
    },
}

#[derive(Debug, Error)]
pub enum SgubError {
    #[error("cannot list {}: {source}", path.display())]
    DirectoryUnreadable {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("cannot read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("malformed manifest {}: {source}", path.display())]
    Format {
        path: PathBuf,
        #[source]
        source: FormatError,
    },
    #[error("backup of {} failed: {source}", path.display())]
    Backup {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("fetch cancelled")]
    Cancelled,
    #[error("writing {} failed: {source}", path.display())]
    PatchWrite {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("no backup found for {}", path.display())]
    RevertUnavailable { path: PathBuf },
    #[error("revert of {} failed: {source}", path.display())]
    Revert {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("{} has no app id", path.display())]
    MissingAppId { path: PathBuf },
    #[error("{} is already being processed", path.display())]
    Busy { path: PathBuf },
}
