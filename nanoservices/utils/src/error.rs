use std::fmt;

use reqwest::Error as ReqwestError;
use rusqlite::Error as SqliteError;
use serde_json::Error as JsonError;
use serde_yaml::Error as YamlError;
use thiserror::Error;
use url::ParseError;

/// Coarse classification of an [`Error`], used to decide whether a failure is
/// retried at the transport boundary, surfaced verbatim, or recorded on a
/// processor's runtime status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Transport,
    Domain,
    Sink,
    Precondition,
    Internal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::Transport => write!(f, "transport"),
            ErrorKind::Domain => write!(f, "domain"),
            ErrorKind::Sink => write!(f, "sink"),
            ErrorKind::Precondition => write!(f, "precondition"),
            ErrorKind::Internal => write!(f, "internal"),
        }
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("Transport Error: {0}")]
    Transport(String),

    #[error("Http Error: {0}")]
    Http(#[from] ReqwestError),

    /// A collaborator answered with a structured failure body.
    #[error("{message}")]
    Domain { message: String },

    #[error("Sink Error: {0}")]
    Sink(String),

    #[error("Precondition Failed: {0}")]
    Precondition(String),

    #[error("Processor Not Found: {0}")]
    NotFound(String),

    #[error("invalid lifecycle transition {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("processor {processor} fenced: owned at epoch {expected}, current epoch {actual}")]
    Fenced {
        processor: String,
        expected: u64,
        actual: u64,
    },

    #[error("Coordination Error: {0}")]
    Coordination(String),

    #[error("Config Error: {0}")]
    Config(String),

    #[error("Store Error: {0}")]
    Store(#[from] SqliteError),

    #[error("Json Error: {0}")]
    Json(#[from] JsonError),

    #[error("Yaml Error: {0}")]
    Yaml(#[from] YamlError),

    #[error("Io Error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Url Error: {0}")]
    UrlParseError(#[from] ParseError),
}

impl Error {
    pub fn sink(message: impl fmt::Display) -> Self {
        Error::Sink(message.to_string())
    }

    pub fn precondition(message: impl fmt::Display) -> Self {
        Error::Precondition(message.to_string())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Transport(_) | Error::Http(_) | Error::Coordination(_) => ErrorKind::Transport,
            Error::Domain { .. } => ErrorKind::Domain,
            Error::Sink(_) => ErrorKind::Sink,
            Error::Precondition(_) | Error::NotFound(_) => ErrorKind::Precondition,
            _ => ErrorKind::Internal,
        }
    }

    /// Only transport failures are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Transport
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_follow_variants() {
        assert_eq!(Error::Transport("reset".into()).kind(), ErrorKind::Transport);
        assert_eq!(Error::Domain { message: "nope".into() }.kind(), ErrorKind::Domain);
        assert_eq!(Error::sink("ddl failed").kind(), ErrorKind::Sink);
        assert_eq!(Error::NotFound("p1".into()).kind(), ErrorKind::Precondition);
        assert_eq!(Error::Config("bad".into()).kind(), ErrorKind::Internal);
    }

    #[test]
    fn domain_error_surfaces_remote_message_verbatim() {
        let err = Error::Domain { message: "processor p1 already exists".into() };
        assert_eq!(err.to_string(), "processor p1 already exists");
        assert!(!err.is_retryable());
    }

    #[test]
    fn coordination_loss_is_retryable() {
        assert!(Error::Coordination("session expired".into()).is_retryable());
        assert!(!Error::sink("boom").is_retryable());
    }
}
