//! Active Trade Record store
//!
//! At most one record per asset, persisted as JSON lines keyed by
//! asset + open timestamp. The file is rewritten through a temp file and a
//! rename after every mutation so a crash never leaves a half-written set.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::error::Result;
use crate::types::ActiveTradeRecord;

pub struct ActiveTradeStore {
    path: PathBuf,
    records: BTreeMap<String, ActiveTradeRecord>,
}

impl ActiveTradeStore {
    /// Load the record set, starting empty when the file does not exist yet
    pub async fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let mut records = BTreeMap::new();

        match tokio::fs::read_to_string(&path).await {
            Ok(text) => {
                for line in text.lines().filter(|l| !l.trim().is_empty()) {
                    match serde_json::from_str::<ActiveTradeRecord>(line) {
                        Ok(record) => {
                            records.insert(record.asset.clone(), record);
                        }
                        Err(e) => warn!("Dropping unreadable active trade line: {}", e),
                    }
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        debug!("Loaded {} active trade records from {:?}", records.len(), path);
        Ok(Self { path, records })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get(&self, asset: &str) -> Option<&ActiveTradeRecord> {
        self.records.get(asset)
    }

    pub fn contains(&self, asset: &str) -> bool {
        self.records.contains_key(asset)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn assets(&self) -> impl Iterator<Item = &str> {
        self.records.keys().map(String::as_str)
    }

    pub fn snapshot(&self) -> Vec<ActiveTradeRecord> {
        self.records.values().cloned().collect()
    }

    /// Insert or replace the record for its asset
    ///
    /// The in-memory set only changes once the new file is in place.
    pub async fn upsert(&mut self, record: ActiveTradeRecord) -> Result<()> {
        let mut next = self.records.clone();
        next.insert(record.asset.clone(), record);
        self.commit(next).await
    }

    pub async fn remove(&mut self, asset: &str) -> Result<Option<ActiveTradeRecord>> {
        let mut next = self.records.clone();
        let removed = next.remove(asset);
        if removed.is_some() {
            self.commit(next).await?;
        }
        Ok(removed)
    }

    async fn commit(&mut self, next: BTreeMap<String, ActiveTradeRecord>) -> Result<()> {
        persist(&self.path, &next).await?;
        self.records = next;
        Ok(())
    }
}

async fn persist(path: &Path, records: &BTreeMap<String, ActiveTradeRecord>) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await?;
        }
    }

    let mut text = String::new();
    for record in records.values() {
        text.push_str(&serde_json::to_string(record)?);
        text.push('\n');
    }

    let tmp = path.with_extension("jsonl.tmp");
    tokio::fs::write(&tmp, text).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}
