//! Error types shared by backup, restore and the transfer tracker.

use crate::restore::RestorationPhaseType;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BackupError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Cassandra interaction error: {0}")]
    Cassandra(String),

    #[error("Manifest not found: {0}")]
    ManifestNotFound(String),

    #[error("Not in manifest: {0}")]
    NotInManifest(String),

    #[error("Transfer failed for {count} object(s): {keys}")]
    Transfer { count: usize, keys: String },

    #[error("Cluster health check failed: {0}")]
    ClusterHealth(String),

    #[error("Data verification failed: {0}")]
    Verification(String),

    #[error("Lock error: {0}")]
    Lock(String),

    #[error("Restoration strategy error: {0}")]
    Strategy(String),

    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    #[error("{phase} phase failed: {source}")]
    Phase {
        phase: RestorationPhaseType,
        #[source]
        source: Box<BackupError>,
    },
}

impl BackupError {
    /// Wrap an error with the phase it surfaced in. Already wrapped errors are kept as is.
    pub fn in_phase(self, phase: RestorationPhaseType) -> Self {
        match self {
            e @ BackupError::Phase { .. } => e,
            other => BackupError::Phase {
                phase,
                source: Box::new(other),
            },
        }
    }

    /// The phase this error was raised in, if any.
    pub fn phase(&self) -> Option<RestorationPhaseType> {
        match self {
            BackupError::Phase { phase, .. } => Some(*phase),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, BackupError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_wrapping_keeps_innermost_phase() {
        let err = BackupError::Cassandra("truncate timed out".into())
            .in_phase(RestorationPhaseType::Truncate)
            .in_phase(RestorationPhaseType::Import);

        assert_eq!(err.phase(), Some(RestorationPhaseType::Truncate));
        assert!(err.to_string().starts_with("TRUNCATE phase failed"));
    }

    #[test]
    fn test_plain_error_has_no_phase() {
        let err = BackupError::Validation("bad entities".into());
        assert!(err.phase().is_none());
    }
}
