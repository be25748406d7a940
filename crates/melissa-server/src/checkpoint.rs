//! Aggregator checkpoints
//!
//! A checkpoint is the serialized [`SimulationTable`] plus the id of the
//! scheduler job that first ran the server. Restarted server jobs get fresh
//! job ids, so the file is always addressed by the *first* job id:
//!
//! ```text
//! <checkpoint_dir>/melissa-server-<first_job_id>.json
//! ```
//!
//! Writes go to a temporary sibling file that is renamed into place, so a
//! crash mid-write leaves the previous checkpoint intact.

use crate::error::{Result, ServerError};
use crate::table::{SimulationTable, TableSnapshot};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CheckpointFile {
    first_job_id: String,
    written_at: DateTime<Utc>,
    table: TableSnapshot,
}

/// Checkpoint location for one study
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    dir: PathBuf,
    first_job_id: String,
}

impl CheckpointStore {
    pub fn new(dir: impl Into<PathBuf>, first_job_id: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            first_job_id: first_job_id.into(),
        }
    }

    pub fn path(&self) -> PathBuf {
        self.dir
            .join(format!("melissa-server-{}.json", self.first_job_id))
    }

    pub fn first_job_id(&self) -> &str {
        &self.first_job_id
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Write `table` atomically
    pub async fn save(&self, table: &SimulationTable) -> Result<PathBuf> {
        tokio::fs::create_dir_all(&self.dir).await?;

        let file = CheckpointFile {
            first_job_id: self.first_job_id.clone(),
            written_at: Utc::now(),
            table: table.snapshot(),
        };
        let bytes = serde_json::to_vec(&file)?;

        let path = self.path();
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &bytes).await?;
        tokio::fs::rename(&tmp, &path).await?;

        debug!(
            path = %path.display(),
            simulations = table.len(),
            bytes = bytes.len(),
            "Checkpoint written"
        );
        Ok(path)
    }

    /// Load the checkpoint, `None` if none was written yet
    pub async fn load(&self) -> Result<Option<SimulationTable>> {
        let path = self.path();
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let file: CheckpointFile = serde_json::from_slice(&bytes)?;
        if file.first_job_id != self.first_job_id {
            return Err(ServerError::checkpoint(format!(
                "{} belongs to job {}, expected {}",
                path.display(),
                file.first_job_id,
                self.first_job_id
            )));
        }

        info!(
            path = %path.display(),
            written_at = %file.written_at,
            simulations = file.table.simulations.len(),
            "Restoring checkpoint"
        );
        Ok(Some(SimulationTable::from_snapshot(file.table)))
    }
}

/// Whether a checkpoint is due
pub fn should_checkpoint(last: Option<DateTime<Utc>>, now: DateTime<Utc>, interval: Duration) -> bool {
    let Some(last) = last else {
        return true;
    };
    match chrono::Duration::from_std(interval) {
        Ok(interval) => now - last >= interval,
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use melissa_core::{DataMessage, SimulationId};

    fn sample_table() -> SimulationTable {
        let now = Utc::now();
        let mut table = SimulationTable::new(vec!["u".into()], 3, 4);
        table.ingest(&DataMessage::new(SimulationId(0), "u", 0, vec![1.0]), now);
        table.ingest(&DataMessage::new(SimulationId(1), "u", 2, vec![1.0]), now);
        table.drop_simulation(SimulationId(3));
        table
    }

    #[tokio::test]
    async fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path(), "1001");
        let table = sample_table();

        let path = tokio_test::assert_ok!(store.save(&table).await);
        assert!(path.ends_with("melissa-server-1001.json"));
        assert!(!path.with_extension("json.tmp").exists());

        let restored = store.load().await.unwrap().unwrap();
        assert_eq!(restored, table);
    }

    #[tokio::test]
    async fn test_load_missing_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path(), "42");
        assert!(store.load().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_load_rejects_foreign_file() {
        let dir = tempfile::tempdir().unwrap();
        let ours = CheckpointStore::new(dir.path(), "7");
        ours.save(&sample_table()).await.unwrap();
        tokio::fs::rename(ours.path(), dir.path().join("melissa-server-8.json"))
            .await
            .unwrap();

        let theirs = CheckpointStore::new(dir.path(), "8");
        assert!(matches!(theirs.load().await, Err(ServerError::Checkpoint(_))));
    }

    #[test]
    fn test_should_checkpoint() {
        let now = Utc::now();
        let interval = Duration::from_secs(300);
        assert!(should_checkpoint(None, now, interval));
        assert!(!should_checkpoint(Some(now - chrono::Duration::seconds(10)), now, interval));
        assert!(should_checkpoint(Some(now - chrono::Duration::seconds(300)), now, interval));
    }
}
