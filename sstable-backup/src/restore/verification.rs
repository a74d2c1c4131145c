//! Checks staged files against the hashes recorded in the manifest.

use crate::hashing::hash_file;
use crate::manifest::ManifestEntry;
use crate::{BackupError, Result};
use std::path::PathBuf;
use tracing::{info, warn};

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct VerificationReport {
    pub verified: usize,
    pub missing: Vec<PathBuf>,
    pub mismatched: Vec<PathBuf>,
}

impl VerificationReport {
    pub fn is_ok(&self) -> bool {
        self.missing.is_empty() && self.mismatched.is_empty()
    }

    pub fn into_result(self) -> Result<()> {
        if self.is_ok() {
            return Ok(());
        }
        let list = |paths: &[PathBuf]| {
            paths
                .iter()
                .map(|p| p.display().to_string())
                .collect::<Vec<_>>()
                .join(", ")
        };
        let mut problems = Vec::new();
        if !self.missing.is_empty() {
            problems.push(format!("missing files: {}", list(&self.missing)));
        }
        if !self.mismatched.is_empty() {
            problems.push(format!("hash mismatch: {}", list(&self.mismatched)));
        }
        Err(BackupError::Verification(problems.join("; ")))
    }
}

/// Verifies the local files of enriched manifest entries.
pub struct DataVerification {
    entries: Vec<ManifestEntry>,
}

impl DataVerification {
    pub fn new(entries: Vec<ManifestEntry>) -> Self {
        Self { entries }
    }

    /// Hash every local file; entries without a recorded hash only need to exist with the right size.
    pub fn verify_blocking(&self) -> Result<VerificationReport> {
        let mut report = VerificationReport::default();
        for entry in &self.entries {
            let local = entry.local_path()?;
            let Ok(metadata) = std::fs::metadata(local) else {
                report.missing.push(local.to_path_buf());
                continue;
            };
            let matches = match &entry.hash {
                Some(expected) => hash_file(local)?.eq_ignore_ascii_case(expected),
                None => metadata.len() == entry.size,
            };
            if matches {
                report.verified += 1;
            } else {
                warn!(file = %local.display(), object_key = %entry.object_key, "Staged file does not match manifest");
                report.mismatched.push(local.to_path_buf());
            }
        }
        Ok(report)
    }

    /// Fail unless every staged file matches the manifest.
    pub async fn verify(self) -> Result<()> {
        let report = tokio::task::spawn_blocking(move || self.verify_blocking())
            .await
            .map_err(|e| BackupError::Io(std::io::Error::other(e)))??;
        info!(
            verified = report.verified,
            missing = report.missing.len(),
            mismatched = report.mismatched.len(),
            "Verified staged files"
        );
        report.into_result()
    }
}
