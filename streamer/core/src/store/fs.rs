//! Filesystem Result Store
//!
//! Reads simulation output laid out under a data directory:
//!
//! ```text
//! <data_dir>/
//! └── 1234/
//!     ├── status.json          {"run_status": "running", "results_complete": false, "streaming_enabled": true}
//!     └── grid/
//!         ├── 0.jsonl          one grid record per line
//!         ├── 1.jsonl
//!         └── ...
//! ```
//!
//! A missing simulation directory is `NotFound`. A missing hour file is an
//! empty batch (the hour had no data). Any I/O or parse failure is
//! `Unavailable`; the store never retries.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::Deserialize;

use super::{GridBatch, ResultStore, RunStatus, SimulationId, SimulationStatus, StatusField, StoreError};
use crate::messages::GridRecord;

/// On-disk status document
#[derive(Debug, Deserialize)]
struct StatusDocument {
    run_status: RunStatus,
    #[serde(default)]
    results_complete: bool,
    #[serde(default = "default_streaming_enabled")]
    streaming_enabled: bool,
}

fn default_streaming_enabled() -> bool {
    true
}

/// Result store backed by a directory tree
#[derive(Clone, Debug)]
pub struct FsResultStore {
    root: PathBuf,
}

impl FsResultStore {
    /// Create a store rooted at `root`
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Data directory
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn simulation_dir(&self, id: SimulationId) -> PathBuf {
        self.root.join(id.to_string())
    }

    fn hour_path(&self, id: SimulationId, hour: u64) -> PathBuf {
        self.simulation_dir(id)
            .join("grid")
            .join(format!("{hour}.jsonl"))
    }
}

fn unavailable(path: &Path, err: impl std::fmt::Display) -> StoreError {
    StoreError::Unavailable(format!("{}: {err}", path.display()))
}

fn parse_records(path: &Path, content: &str) -> Result<Vec<GridRecord>, StoreError> {
    content
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(idx, line)| {
            serde_json::from_str::<serde_json::Value>(line)
                .map(GridRecord::new)
                .map_err(|e| unavailable(path, format!("line {}: {e}", idx + 1)))
        })
        .collect()
}

#[async_trait]
impl ResultStore for FsResultStore {
    fn name(&self) -> &str {
        "filesystem"
    }

    async fn fetch_status(
        &self,
        id: SimulationId,
        fields: &[StatusField],
    ) -> Result<SimulationStatus, StoreError> {
        let path = self.simulation_dir(id).join("status.json");
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Err(StoreError::NotFound(id)),
            Err(e) => return Err(unavailable(&path, e)),
        };

        let doc: StatusDocument =
            serde_json::from_str(&content).map_err(|e| unavailable(&path, e))?;

        tracing::trace!(simulation_id = %id, ?fields, "Read status document");

        Ok(SimulationStatus {
            id,
            run_status: doc.run_status,
            results_complete: doc.results_complete,
            streaming_enabled: doc.streaming_enabled,
        })
    }

    async fn fetch_batch(&self, id: SimulationId, hour: u64) -> Result<GridBatch, StoreError> {
        let path = self.hour_path(id, hour);
        match tokio::fs::read_to_string(&path).await {
            Ok(content) => Ok(GridBatch::new(hour, parse_records(&path, &content)?)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(GridBatch::empty(hour)),
            Err(e) => Err(unavailable(&path, e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::STATUS_FIELDS;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use tempfile::TempDir;

    fn write_simulation(dir: &TempDir, id: u64, status: &str) -> PathBuf {
        let sim_dir = dir.path().join(id.to_string());
        std::fs::create_dir_all(sim_dir.join("grid")).unwrap();
        std::fs::write(sim_dir.join("status.json"), status).unwrap();
        sim_dir
    }

    #[tokio::test]
    async fn test_reads_status_document() {
        let dir = TempDir::new().unwrap();
        write_simulation(
            &dir,
            1234,
            r#"{"run_status": "failed", "results_complete": true, "streaming_enabled": false}"#,
        );
        let store = FsResultStore::new(dir.path());

        let status = store
            .fetch_status(SimulationId::new(1234), &STATUS_FIELDS)
            .await
            .unwrap();
        assert_eq!(status.run_status, RunStatus::Failed);
        assert!(status.results_complete);
        assert!(!status.streaming_enabled);
    }

    #[test]
    fn test_layout_is_under_root() {
        let dir = TempDir::new().unwrap();
        let store = FsResultStore::new(dir.path());

        assert_eq!(store.root(), dir.path());
        assert_eq!(
            store.hour_path(SimulationId::new(42), 3),
            store.root().join("42").join("grid").join("3.jsonl")
        );
    }

    #[tokio::test]
    async fn test_unknown_simulation_is_not_found() {
        let dir = TempDir::new().unwrap();
        let store = FsResultStore::new(dir.path());
        let err = store
            .fetch_status(SimulationId::new(9), &STATUS_FIELDS)
            .await
            .unwrap_err();
        assert_eq!(err, StoreError::NotFound(SimulationId::new(9)));
    }

    #[tokio::test]
    async fn test_corrupt_status_is_unavailable() {
        let dir = TempDir::new().unwrap();
        write_simulation(&dir, 5, "{not json");
        let store = FsResultStore::new(dir.path());
        let err = store
            .fetch_status(SimulationId::new(5), &STATUS_FIELDS)
            .await
            .unwrap_err();
        assert!(err.is_unavailable());
    }

    #[tokio::test]
    async fn test_reads_hour_records_in_order() {
        let dir = TempDir::new().unwrap();
        let sim_dir = write_simulation(&dir, 1, r#"{"run_status": "running"}"#);
        std::fs::write(
            sim_dir.join("grid").join("0.jsonl"),
            "{\"hour\":0,\"cell\":1}\n\n{\"hour\":0,\"cell\":2}\n",
        )
        .unwrap();
        let store = FsResultStore::new(dir.path());

        let batch = store.fetch_batch(SimulationId::new(1), 0).await.unwrap();
        assert_eq!(batch.hour(), 0);
        assert_eq!(
            batch.records().to_vec(),
            vec![
                GridRecord::new(json!({"hour": 0, "cell": 1})),
                GridRecord::new(json!({"hour": 0, "cell": 2})),
            ]
        );
        assert!(!batch.holds_resource());
    }

    #[tokio::test]
    async fn test_missing_hour_is_empty() {
        let dir = TempDir::new().unwrap();
        write_simulation(&dir, 1, r#"{"run_status": "running"}"#);
        let store = FsResultStore::new(dir.path());

        let batch = store.fetch_batch(SimulationId::new(1), 17).await.unwrap();
        assert!(batch.is_empty());
        assert_eq!(batch.hour(), 17);
    }

    #[tokio::test]
    async fn test_malformed_record_is_unavailable() {
        let dir = TempDir::new().unwrap();
        let sim_dir = write_simulation(&dir, 1, r#"{"run_status": "running"}"#);
        std::fs::write(sim_dir.join("grid").join("2.jsonl"), "{\"ok\":1}\nnope\n").unwrap();
        let store = FsResultStore::new(dir.path());

        let err = store.fetch_batch(SimulationId::new(1), 2).await.unwrap_err();
        match err {
            StoreError::Unavailable(msg) => assert!(msg.contains("line 2"), "{msg}"),
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
