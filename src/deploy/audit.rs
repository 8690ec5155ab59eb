use std::{
    io::{self, BufRead},
    path::{Path, PathBuf},
    sync::Arc,
};

use thiserror::Error;
use tokio::{fs::OpenOptions, io::AsyncWriteExt, sync::Mutex};
use tracing::{debug, warn};

use crate::deploy::DeploymentRecord;

#[derive(Debug, Error)]
pub enum AuditError {
    #[error("couldn't serialize deployment record: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("couldn't write to audit log {}: {source}", path.display())]
    Io { path: PathBuf, source: io::Error },
}

/// Append-only file of deployment records, one JSON object per line.
///
/// Clones share the same file and the same write lock.
#[derive(Debug, Clone)]
pub struct AuditLog {
    path: PathBuf,
    write_lock: Arc<Mutex<()>>,
}

impl AuditLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends `record` followed by a newline in a single write, so concurrent deployments
    /// never interleave partial lines.
    pub async fn append(&self, record: &DeploymentRecord) -> Result<(), AuditError> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');

        let io_err = |source| AuditError::Io {
            path: self.path.clone(),
            source,
        };

        let _guard = self.write_lock.lock().await;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(io_err)?;
        file.write_all(&line).await.map_err(io_err)?;
        file.flush().await.map_err(io_err)?;

        debug!("deployment of {} logged: {}", record.repository, record.status);
        Ok(())
    }

    /// Reads back the last `limit` records, newest first. Lines that don't parse are skipped.
    pub async fn recent(&self, limit: usize) -> io::Result<Vec<DeploymentRecord>> {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || read_records(&path))
            .await
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?
            .map(|records| records.into_iter().rev().take(limit).collect())
    }
}

fn read_records(path: &Path) -> io::Result<Vec<DeploymentRecord>> {
    let file = match std::fs::File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };

    let mut records = Vec::new();
    for line in io::BufReader::new(file).lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }

        match serde_json::from_str::<DeploymentRecord>(&line) {
            Ok(record) => records.push(record),
            Err(e) => warn!("skipping malformed audit line in {}: {}", path.display(), e),
        }
    }

    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deploy::DeployStatus;
    use tempfile::TempDir;

    fn record(branch: &str, status: DeployStatus) -> DeploymentRecord {
        DeploymentRecord::now("acme/site", branch, status, "test")
    }

    #[tokio::test]
    async fn append_writes_one_json_line_per_record() {
        let tmp = TempDir::new().unwrap();
        let log = AuditLog::new(tmp.path().join("deployments.log"));

        log.append(&record("main", DeployStatus::Success)).await.unwrap();
        log.append(&record("main", DeployStatus::Failed)).await.unwrap();

        let content = std::fs::read_to_string(log.path()).unwrap();
        let lines: Vec<_> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(content.ends_with('\n'));

        let first: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["repository"], "acme/site");
        assert_eq!(first["branch"], "main");
        assert_eq!(first["status"], "success");
        assert_eq!(first["message"], "test");
        assert!(first["timestamp"].as_str().unwrap().contains('T'));
    }

    #[tokio::test]
    async fn recent_returns_newest_first_and_skips_garbage() {
        let tmp = TempDir::new().unwrap();
        let log = AuditLog::new(tmp.path().join("deployments.log"));

        log.append(&record("one", DeployStatus::Success)).await.unwrap();
        std::fs::OpenOptions::new()
            .append(true)
            .open(log.path())
            .and_then(|mut f| std::io::Write::write_all(&mut f, b"garbage\n\n"))
            .unwrap();
        log.append(&record("two", DeployStatus::Error)).await.unwrap();
        log.append(&record("three", DeployStatus::Failed)).await.unwrap();

        let recent = log.recent(2).await.unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].branch, "three");
        assert_eq!(recent[1].branch, "two");
    }

    #[tokio::test]
    async fn recent_on_missing_file_is_empty() {
        let tmp = TempDir::new().unwrap();
        let log = AuditLog::new(tmp.path().join("nothing-yet.log"));
        assert!(log.recent(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn concurrent_appends_do_not_interleave() {
        let tmp = TempDir::new().unwrap();
        let log = AuditLog::new(tmp.path().join("deployments.log"));

        let handles: Vec<_> = (0..20)
            .map(|i| {
                let log = log.clone();
                tokio::spawn(async move {
                    log.append(&record(&format!("branch-{}", i), DeployStatus::Success))
                        .await
                })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let content = std::fs::read_to_string(log.path()).unwrap();
        assert_eq!(content.lines().count(), 20);
        for line in content.lines() {
            serde_json::from_str::<DeploymentRecord>(line).unwrap();
        }
    }

    #[tokio::test]
    async fn unwritable_target_is_reported() {
        let tmp = TempDir::new().unwrap();
        // a directory can't be opened for appending
        let log = AuditLog::new(tmp.path());

        let err = log
            .append(&record("main", DeployStatus::Success))
            .await
            .unwrap_err();
        assert!(matches!(err, AuditError::Io { .. }));
    }
}
