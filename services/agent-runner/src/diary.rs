//! Diary Log - append-only JSON lines audit trail
//!
//! Every line is one [`DiaryEntry`]: a timestamp, the cycle number and a
//! flattened, `event`-tagged payload. Lines are only ever appended; readers
//! re-open the file, so the sequence can be restarted at any time.

use std::fs::File;
use std::io::{BufRead, BufReader, Lines};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{error, warn};

use crate::decision::DecisionSource;
use crate::error::{AgentError, Phase, Result};
use crate::types::{SetupGrade, Side, TradeAction};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiaryEntry {
    pub timestamp: DateTime<Utc>,
    pub cycle: u64,
    #[serde(flatten)]
    pub event: DiaryEvent,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum DiaryEvent {
    /// Decision made this cycle with its pre/post gate values
    Gate {
        asset: String,
        action_before: TradeAction,
        action_after: TradeAction,
        setup_grade: Option<SetupGrade>,
        requested_notional: Decimal,
        approved_notional: Decimal,
        required_margin: Decimal,
        remaining_capital: Decimal,
        allocation_fraction: f64,
        reason: Option<String>,
    },
    Execution {
        asset: String,
        action: TradeAction,
        side: Side,
        size: Decimal,
        reduce_only: bool,
        order_ids: Vec<String>,
        filled_size: Decimal,
        avg_price: Option<Decimal>,
    },
    ReconcilePurge {
        asset: String,
        side: Side,
        size: Decimal,
        opened_at: DateTime<Utc>,
    },
    ReconcileAdopt {
        asset: String,
        side: Side,
        size: Decimal,
        entry_price: Decimal,
        from_order: bool,
    },
    ReconcileCorrect {
        asset: String,
        local_side: Side,
        local_size: Decimal,
        exchange_side: Side,
        exchange_size: Decimal,
    },
    Error {
        phase: Phase,
        asset: Option<String>,
        message: String,
    },
    CycleSummary {
        assets: Vec<String>,
        decisions: usize,
        orders_placed: usize,
        errors: usize,
        reconcile_actions: usize,
        decision_source: Option<DecisionSource>,
        aborted: Option<String>,
    },
}

impl DiaryEvent {
    pub fn from_error(err: &AgentError) -> Self {
        DiaryEvent::Error {
            phase: err.phase(),
            asset: err.asset().map(str::to_string),
            message: err.to_string(),
        }
    }

    /// Wire name of the event kind
    pub fn kind(&self) -> &'static str {
        match self {
            DiaryEvent::Gate { .. } => "gate",
            DiaryEvent::Execution { .. } => "execution",
            DiaryEvent::ReconcilePurge { .. } => "reconcile-purge",
            DiaryEvent::ReconcileAdopt { .. } => "reconcile-adopt",
            DiaryEvent::ReconcileCorrect { .. } => "reconcile-correct",
            DiaryEvent::Error { .. } => "error",
            DiaryEvent::CycleSummary { .. } => "cycle-summary",
        }
    }
}

/// Append-only diary file
pub struct Diary {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl Diary {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn append(&self, cycle: u64, event: DiaryEvent) -> Result<()> {
        let entry = DiaryEntry {
            timestamp: Utc::now(),
            cycle,
            event,
        };
        let mut line = serde_json::to_string(&entry)?;
        line.push('\n');

        let _guard = self.write_lock.lock().await;
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }

    /// Append, logging instead of propagating a write failure
    pub async fn record(&self, cycle: u64, event: DiaryEvent) {
        let kind = event.kind();
        if let Err(e) = self.append(cycle, event).await {
            error!("Failed to write {} diary entry: {}", kind, e);
        }
    }

    pub async fn record_error(&self, cycle: u64, err: &AgentError) {
        self.record(cycle, DiaryEvent::from_error(err)).await;
    }

    /// Last `limit` entries, oldest first, as raw JSON objects
    pub async fn tail(&self, limit: usize) -> Result<Vec<serde_json::Value>> {
        let text = match tokio::fs::read_to_string(&self.path).await {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let lines: Vec<&str> = text.lines().filter(|l| !l.trim().is_empty()).collect();
        let start = lines.len().saturating_sub(limit);
        let mut entries = Vec::with_capacity(lines.len() - start);
        for line in &lines[start..] {
            match serde_json::from_str(line) {
                Ok(value) => entries.push(value),
                Err(e) => warn!("Skipping unreadable diary line: {}", e),
            }
        }
        Ok(entries)
    }

    /// Whole diary as JSONL text
    pub async fn read_raw(&self) -> Result<String> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(text) => Ok(text),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(String::new()),
            Err(e) => Err(e.into()),
        }
    }

    /// Lazy iterator over every entry from the start of the file
    ///
    /// Each call re-opens the file, so iteration can be restarted at will.
    pub fn entries(&self) -> Result<DiaryEntries> {
        let lines = match File::open(&self.path) {
            Ok(file) => Some(BufReader::new(file).lines()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(e.into()),
        };
        Ok(DiaryEntries { lines })
    }
}

pub struct DiaryEntries {
    lines: Option<Lines<BufReader<File>>>,
}

impl Iterator for DiaryEntries {
    type Item = Result<DiaryEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        let lines = self.lines.as_mut()?;
        loop {
            match lines.next()? {
                Ok(line) if line.trim().is_empty() => continue,
                Ok(line) => return Some(serde_json::from_str(&line).map_err(AgentError::from)),
                Err(e) => return Some(Err(e.into())),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn purge(asset: &str) -> DiaryEvent {
        DiaryEvent::ReconcilePurge {
            asset: asset.to_string(),
            side: Side::Long,
            size: Decimal::new(5, 1),
            opened_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_append_and_tail() {
        let dir = TempDir::new().unwrap();
        let diary = Diary::new(dir.path().join("nested").join("diary.jsonl"));

        for (cycle, asset) in ["BTC", "ETH", "SOL"].iter().enumerate() {
            diary.append(cycle as u64, purge(asset)).await.unwrap();
        }

        let tail = diary.tail(2).await.unwrap();
        assert_eq!(tail.len(), 2);
        assert_eq!(tail[0]["asset"], "ETH");
        assert_eq!(tail[1]["asset"], "SOL");
        assert_eq!(tail[1]["event"], "reconcile-purge");
        assert_eq!(tail[1]["cycle"], 2);
    }

    #[tokio::test]
    async fn test_missing_file_reads_empty() {
        let dir = TempDir::new().unwrap();
        let diary = Diary::new(dir.path().join("diary.jsonl"));

        assert!(diary.tail(10).await.unwrap().is_empty());
        assert_eq!(diary.read_raw().await.unwrap(), "");
        assert_eq!(diary.entries().unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_entries_are_restartable() {
        let dir = TempDir::new().unwrap();
        let diary = Diary::new(dir.path().join("diary.jsonl"));
        diary
            .append(1, DiaryEvent::from_error(&AgentError::execution("ETH", "rejected")))
            .await
            .unwrap();
        diary.append(1, purge("ETH")).await.unwrap();

        let first: Vec<DiaryEntry> = diary.entries().unwrap().map(|e| e.unwrap()).collect();
        let second: Vec<DiaryEntry> = diary.entries().unwrap().map(|e| e.unwrap()).collect();
        assert_eq!(first, second);
        assert_eq!(first.len(), 2);

        match &first[0].event {
            DiaryEvent::Error { phase, asset, message } => {
                assert_eq!(*phase, Phase::Execution);
                assert_eq!(asset.as_deref(), Some("ETH"));
                assert!(message.contains("rejected"));
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert_eq!(first[1].event.kind(), "reconcile-purge");
    }

    #[tokio::test]
    async fn test_tail_skips_corrupt_lines() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("diary.jsonl");
        let diary = Diary::new(&path);
        diary.append(0, purge("BTC")).await.unwrap();
        let mut text = std::fs::read_to_string(&path).unwrap();
        text.push_str("{not json\n\n");
        std::fs::write(&path, text).unwrap();

        let tail = diary.tail(10).await.unwrap();
        assert_eq!(tail.len(), 1);
    }
}
