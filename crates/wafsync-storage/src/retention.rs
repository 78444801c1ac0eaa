//! Retention cleanup for run reports and catalog dumps.
//!
//! Never touches the catalog database or the record store artifact.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use tracing::{info, warn};

use crate::StoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Dir,
}

/// Keep the newest `keep` entries of `kind` whose name matches prefix/suffix.
#[derive(Debug, Clone)]
pub struct RetentionRule {
    pub prefix: String,
    pub suffix: String,
    pub kind: EntryKind,
    pub keep: usize,
}

impl RetentionRule {
    pub fn files(prefix: &str, suffix: &str, keep: usize) -> Self {
        Self {
            prefix: prefix.to_string(),
            suffix: suffix.to_string(),
            kind: EntryKind::File,
            keep,
        }
    }

    pub fn dirs(keep: usize) -> Self {
        Self {
            prefix: String::new(),
            suffix: String::new(),
            kind: EntryKind::Dir,
            keep,
        }
    }

    fn matches(&self, name: &str, kind: EntryKind) -> bool {
        kind == self.kind
            && !name.starts_with('.')
            && name.starts_with(&self.prefix)
            && name.ends_with(&self.suffix)
    }
}

#[derive(Debug, Clone, Default)]
pub struct RetentionPolicy {
    pub rules: Vec<RetentionRule>,
    pub max_age: Option<Duration>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetentionReport {
    pub kept: usize,
    pub deleted: Vec<PathBuf>,
    pub failed: Vec<PathBuf>,
}

struct Candidate {
    path: PathBuf,
    kind: EntryKind,
    modified: SystemTime,
}

/// Apply `policy` to the direct children of `dir`. A missing directory is a no-op.
pub fn apply_retention(
    dir: &Path,
    policy: &RetentionPolicy,
    now: SystemTime,
) -> Result<RetentionReport, StoreError> {
    let mut report = RetentionReport::default();
    let read = match std::fs::read_dir(dir) {
        Ok(read) => read,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(report),
        Err(err) => return Err(StoreError::io(dir, err)),
    };

    let mut entries = Vec::new();
    for entry in read {
        let entry = entry.map_err(|e| StoreError::io(dir, e))?;
        let meta = entry.metadata().map_err(|e| StoreError::io(entry.path(), e))?;
        entries.push(Candidate {
            path: entry.path(),
            kind: if meta.is_dir() { EntryKind::Dir } else { EntryKind::File },
            modified: meta.modified().unwrap_or(SystemTime::UNIX_EPOCH),
        });
    }

    for rule in &policy.rules {
        let mut matching: Vec<&Candidate> = entries
            .iter()
            .filter(|c| {
                c.path
                    .file_name()
                    .map(|n| rule.matches(&n.to_string_lossy(), c.kind))
                    .unwrap_or(false)
            })
            .collect();
        matching.sort_by(|a, b| b.modified.cmp(&a.modified));

        for (index, candidate) in matching.into_iter().enumerate() {
            let too_old = policy.max_age.is_some_and(|max| {
                now.duration_since(candidate.modified)
                    .map(|age| age > max)
                    .unwrap_or(false)
            });
            if index < rule.keep && !too_old {
                report.kept += 1;
                continue;
            }
            let removed = match candidate.kind {
                EntryKind::Dir => std::fs::remove_dir_all(&candidate.path),
                EntryKind::File => std::fs::remove_file(&candidate.path),
            };
            match removed {
                Ok(()) => {
                    info!(path = %candidate.path.display(), "retention: deleted");
                    report.deleted.push(candidate.path.clone());
                }
                Err(err) => {
                    warn!(path = %candidate.path.display(), error = %err, "retention: delete failed");
                    report.failed.push(candidate.path.clone());
                }
            }
        }
    }
    Ok(report)
}
