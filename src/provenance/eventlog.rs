//! Run journal: an append-only JSONL record of every pipeline run of a recipe.
//!
//! Each recipe cache directory holds one `events.jsonl`. A run appends
//! records that share a run id and carry a per-run sequence number:
//!
//! ```text
//! {"ts":"…","run_id":"…","seq":0,"event":"run_started",…}
//! {"ts":"…","run_id":"…","seq":1,"event":"step_started",…}
//! ```
//!
//! Readers group records by run id; a run without a terminal event was
//! interrupted.

use crate::core::types::RunEvent;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

pub const JOURNAL_FILE: &str = "events.jsonl";

/// A journal line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JournalRecord {
    pub ts: DateTime<Utc>,
    pub run_id: String,
    pub seq: u64,
    #[serde(flatten)]
    pub event: RunEvent,
}

/// Journal location inside a recipe cache directory.
pub fn journal_path(recipe_cache: &Path) -> PathBuf {
    recipe_cache.join(JOURNAL_FILE)
}

/// Writer for one run's records.
#[derive(Debug)]
pub struct RunJournal {
    path: PathBuf,
    run_id: String,
    seq: u64,
}

impl RunJournal {
    /// Start a journal for a new run. Nothing is written until the first record.
    pub fn begin(recipe_cache: &Path) -> Self {
        Self {
            path: journal_path(recipe_cache),
            run_id: uuid::Uuid::new_v4().to_string(),
            seq: 0,
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one event.
    pub fn record(&mut self, event: RunEvent) -> Result<(), String> {
        let record = JournalRecord {
            ts: Utc::now(),
            run_id: self.run_id.clone(),
            seq: self.seq,
            event,
        };
        let json =
            serde_json::to_string(&record).map_err(|e| format!("serialize error: {}", e))?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| format!("cannot open {}: {}", self.path.display(), e))?;
        writeln!(file, "{}", json)
            .map_err(|e| format!("cannot write {}: {}", self.path.display(), e))?;
        self.seq += 1;
        Ok(())
    }
}

/// Read every record of a journal. Unparseable lines are skipped.
pub fn read_journal(path: &Path) -> Result<Vec<JournalRecord>, String> {
    let file = match std::fs::File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(format!("cannot open {}: {}", path.display(), e)),
    };
    let mut records = Vec::new();
    for (n, line) in BufReader::new(file).lines().enumerate() {
        let line = line.map_err(|e| format!("cannot read {}: {}", path.display(), e))?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str(&line) {
            Ok(record) => records.push(record),
            Err(e) => tracing::warn!("{}:{}: skipping record: {}", path.display(), n + 1, e),
        }
    }
    Ok(records)
}

/// Outcome of the most recent run in a journal.
#[derive(Debug, Clone, PartialEq)]
pub struct LastRun {
    pub run_id: String,
    pub started: DateTime<Utc>,
    /// Terminal event, or `None` if the run never finished.
    pub outcome: Option<RunEvent>,
}

/// Summarize the last run recorded in `records`.
pub fn last_run(records: &[JournalRecord]) -> Option<LastRun> {
    let last_id = &records.last()?.run_id;
    let mut runs = records.iter().filter(|r| &r.run_id == last_id);
    let first = runs.next()?;
    let outcome = records
        .iter()
        .filter(|r| &r.run_id == last_id && r.event.is_terminal())
        .map(|r| r.event.clone())
        .next_back();
    Some(LastRun {
        run_id: last_id.clone(),
        started: first.ts,
        outcome,
    })
}
