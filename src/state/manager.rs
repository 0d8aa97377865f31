use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tokio::fs;

use super::types::SessionRecord;

/// Persists session records as `<dir>/<name>.json`
pub struct SessionStore {
    dir: PathBuf,
}

impl SessionStore {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn record_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{}.json", name))
    }

    /// Initialize the sessions directory
    pub async fn init(&self) -> Result<()> {
        fs::create_dir_all(&self.dir)
            .await
            .context("creating sessions directory")?;
        Ok(())
    }

    /// Save a record, replacing any previous one with the same name
    pub async fn save(&self, record: &SessionRecord) -> Result<PathBuf> {
        self.init().await?;
        let path = self.record_path(&record.name);
        let json = serde_json::to_string_pretty(record)?;
        fs::write(&path, json)
            .await
            .with_context(|| format!("writing session record {}", path.display()))?;
        Ok(path)
    }

    pub async fn load(&self, name: &str) -> Result<SessionRecord> {
        let path = self.record_path(name);
        let json = fs::read_to_string(&path)
            .await
            .with_context(|| format!("reading session record {}", path.display()))?;
        serde_json::from_str(&json).context("parsing session record")
    }

    /// Remove a record; a missing record is not an error
    pub async fn remove(&self, name: &str) -> Result<()> {
        let path = self.record_path(name);
        if path.exists() {
            fs::remove_file(&path)
                .await
                .context("deleting session record")?;
        }
        Ok(())
    }

    /// All readable records, sorted by name
    pub async fn list(&self) -> Result<Vec<SessionRecord>> {
        let mut records = Vec::new();

        if !self.dir.exists() {
            return Ok(records);
        }

        let mut entries = fs::read_dir(&self.dir)
            .await
            .context("reading sessions directory")?;

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|s| s.to_str()) == Some("json") {
                if let Ok(json) = fs::read_to_string(&path).await {
                    if let Ok(record) = serde_json::from_str::<SessionRecord>(&json) {
                        records.push(record);
                    }
                }
            }
        }

        records.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(records)
    }
}

// SessionStore tests live in tests/test_session_record.rs
