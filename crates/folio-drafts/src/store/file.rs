//! JSON-file backends. One `{project}.drafts.json` and one
//! `{project}.published.json` per project under a shared directory.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::Mutex;

use super::{DraftStore, PublishedStore};
use crate::error::StoreError;
use crate::model::{ChangeRecord, DraftChanges, ProjectId, PublishedSnapshot};

pub struct FileDraftStore {
    dir: PathBuf,
    // read-modify-write of a project file must not interleave
    write_lock: Mutex<()>,
}

impl FileDraftStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            write_lock: Mutex::new(()),
        }
    }

    fn path(&self, project: &ProjectId) -> PathBuf {
        self.dir.join(format!("{}.drafts.json", project.file_stem()))
    }

    /// Current records of a project in file order.
    pub async fn records(&self, project: &ProjectId) -> Result<Vec<ChangeRecord>, StoreError> {
        Ok(read_json(&self.path(project)).await?.unwrap_or_default())
    }
}

impl DraftStore for FileDraftStore {
    async fn get_all_changes(&self, project: &ProjectId) -> Result<DraftChanges, StoreError> {
        let records = self.records(project).await?;
        Ok(DraftChanges::from_records(&records))
    }

    async fn list_changes(&self, project: &ProjectId) -> Result<Vec<ChangeRecord>, StoreError> {
        self.records(project).await
    }

    async fn save_change(&self, record: &ChangeRecord) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        let path = self.path(&record.project_id);
        let mut records: Vec<ChangeRecord> = read_json(&path).await?.unwrap_or_default();
        match records
            .iter_mut()
            .find(|r| r.kind() == record.kind() && r.key == record.key)
        {
            Some(existing) => *existing = record.clone(),
            None => records.push(record.clone()),
        }
        write_json(&path, &records).await
    }

    async fn remove_changes(
        &self,
        project: &ProjectId,
        records: &[ChangeRecord],
    ) -> Result<usize, StoreError> {
        let _guard = self.write_lock.lock().await;
        let path = self.path(project);
        let Some(stored) = read_json::<Vec<ChangeRecord>>(&path).await? else {
            return Ok(0);
        };
        let before = stored.len();
        let kept: Vec<ChangeRecord> = stored
            .into_iter()
            .filter(|r| !records.contains(r))
            .collect();
        let removed = before - kept.len();
        if removed > 0 {
            write_json(&path, &kept).await?;
        }
        Ok(removed)
    }

    async fn clear_changes(&self, project: &ProjectId) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        let path = self.path(project);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(source) => Err(StoreError::Io { path, source }),
        }
    }
}

pub struct FilePublishedStore {
    dir: PathBuf,
}

impl FilePublishedStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path(&self, project: &ProjectId) -> PathBuf {
        self.dir
            .join(format!("{}.published.json", project.file_stem()))
    }
}

impl PublishedStore for FilePublishedStore {
    async fn load_published(
        &self,
        project: &ProjectId,
    ) -> Result<Option<PublishedSnapshot>, StoreError> {
        read_json(&self.path(project)).await
    }

    async fn store_published(
        &self,
        project: &ProjectId,
        snapshot: &PublishedSnapshot,
    ) -> Result<(), StoreError> {
        write_json(&self.path(project), snapshot).await
    }
}

async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, StoreError> {
    let raw = match tokio::fs::read(path).await {
        Ok(raw) => raw,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(StoreError::Io {
                path: path.to_path_buf(),
                source,
            });
        }
    };
    Ok(Some(serde_json::from_slice(&raw)?))
}

/// Write through a sibling temp file so readers never see a torn file.
async fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), StoreError> {
    let io_err = |source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await.map_err(io_err)?;
    }
    let body = serde_json::to_vec_pretty(value)?;
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, body).await.map_err(io_err)?;
    tokio::fs::rename(&tmp, path).await.map_err(io_err)?;
    Ok(())
}
