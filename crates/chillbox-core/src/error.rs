use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

pub type ChillboxResult<T> = Result<T, ChillboxError>;

/// One failing entry inside an aggregate error (a path entry, a remote file,
/// or a secret payload).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryFailure {
    pub id: String,
    pub message: String,
}

impl EntryFailure {
    pub fn new(id: impl Into<String>, message: impl fmt::Display) -> Self {
        Self {
            id: id.into(),
            message: message.to_string(),
        }
    }
}

/// Render a failure list as indented `- id: message` lines.
fn list_failures(failures: &[EntryFailure]) -> String {
    failures
        .iter()
        .map(|f| format!("\n  - {}: {}", f.id, f.message))
        .collect()
}

#[derive(Debug, Error)]
pub enum ChillboxError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("missing file: {0}")]
    MissingFile(String),

    #[error("missing dependency: {0}")]
    Dependency(String),

    #[error("gpg error: {0}")]
    Gpg(String),

    #[error("failed to unlock private key: {0}")]
    KeyUnlock(String),

    #[error("encryption failed: {0}")]
    Encryption(String),

    #[error("decryption failed: {0}")]
    Decryption(String),

    #[error("the secret '{id}' exists, but it expired on {expires}; delete or rotate it before running again")]
    ExpiredSecret { id: String, expires: chrono::NaiveDate },

    #[error("archive directory error: {message}{}", list_failures(.failures))]
    ArchiveDirectory {
        message: String,
        failures: Vec<EntryFailure>,
    },

    #[error("invalid state file {}: {message}", .path.display())]
    InvalidStateFile { path: PathBuf, message: String },

    #[error("server user-data error: {0}")]
    ServerUserData(String),

    #[error("can't show path: {0}")]
    ShowFile(String),

    #[error("remote command failed: {0}")]
    Remote(String),

    #[error("distribution to server '{server}' failed for {} entries:{}", .failures.len(), list_failures(.failures))]
    Distribution {
        server: String,
        failures: Vec<EntryFailure>,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ChillboxError {
    /// Archive directory error without per-entry failures.
    pub fn archive(message: impl Into<String>) -> Self {
        ChillboxError::ArchiveDirectory {
            message: message.into(),
            failures: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn archive_error_lists_every_entry() {
        let err = ChillboxError::ArchiveDirectory {
            message: "failed to process all paths".into(),
            failures: vec![
                EntryFailure::new("site-conf", "template not found"),
                EntryFailure::new("static", "src does not exist"),
            ],
        };
        let text = err.to_string();
        assert!(text.contains("- site-conf: template not found"));
        assert!(text.contains("- static: src does not exist"));
    }

    #[test]
    fn expired_secret_names_the_secret() {
        let err = ChillboxError::ExpiredSecret {
            id: "db-pass".into(),
            expires: chrono::NaiveDate::from_ymd_opt(2020, 1, 1).unwrap(),
        };
        let text = err.to_string();
        assert!(text.contains("db-pass"));
        assert!(text.contains("2020-01-01"));
    }
}
