// src/store/persist.rs
//! Snapshot + journal persistence.
//!
//! Every commit appends one fsynced JSON line to the journal before it is
//! applied in memory. Every `COMPACT_EVERY` entries the full state is written
//! as a snapshot (temp file + rename) and the journal is truncated. Opening
//! the store loads the snapshot and replays the journal past the snapshot's
//! sequence number; a torn last line from a crash mid-append is dropped.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::{StoreBatch, StoreState};
use crate::error::StoreError;

pub const SNAPSHOT_FILE: &str = "store.json";
pub const JOURNAL_FILE: &str = "store.journal.jsonl";
/// Journal entries between snapshot rewrites.
pub const COMPACT_EVERY: usize = 64;

pub fn snapshot_path(data_dir: &Path) -> PathBuf {
    data_dir.join(SNAPSHOT_FILE)
}

pub fn journal_path(data_dir: &Path) -> PathBuf {
    data_dir.join(JOURNAL_FILE)
}

/// Create the data dir. Failure here means the persistence layer is unreachable.
pub fn ensure_dir(data_dir: &Path) -> Result<(), StoreError> {
    fs::create_dir_all(data_dir).map_err(|e| {
        StoreError::Unreachable(format!("cannot create data dir {}: {e}", data_dir.display()))
    })
}

pub(crate) fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Option<T> {
    let s = fs::read_to_string(path).ok()?;
    serde_json::from_str(&s).ok()
}

/// Write via a temp file + rename so readers never see a torn file.
pub(crate) fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> io::Result<()> {
    let json = serde_json::to_vec(value).map_err(io::Error::other)?;
    let tmp = path.with_extension("json.tmp");
    let mut f = fs::File::create(&tmp)?;
    f.write_all(&json)?;
    f.sync_all()?;
    fs::rename(tmp, path)?;
    Ok(())
}

fn io_err(path: &Path) -> impl Fn(io::Error) -> StoreError + '_ {
    move |source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// One durable state change.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub(crate) enum JournalOp {
    Batch { batch: StoreBatch, at: DateTime<Utc> },
    Archive { cutoff: DateTime<Utc> },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct JournalEntry {
    pub seq: u64,
    pub op: JournalOp,
}

/// A missing snapshot is an empty store.
fn load_snapshot(path: &Path) -> Result<StoreState, StoreError> {
    let bytes = match fs::read(path) {
        Ok(b) => b,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(StoreState::default()),
        Err(source) => {
            return Err(StoreError::Io {
                path: path.to_path_buf(),
                source,
            })
        }
    };
    Ok(serde_json::from_slice(&bytes)?)
}

/// Apply journal entries newer than the snapshot. Returns how many were applied.
fn replay(path: &Path, state: &mut StoreState) -> Result<usize, StoreError> {
    let bytes = match fs::read(path) {
        Ok(b) => b,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
        Err(source) => {
            return Err(StoreError::Io {
                path: path.to_path_buf(),
                source,
            })
        }
    };
    let lines: Vec<&[u8]> = bytes
        .split(|b| *b == b'\n')
        .filter(|l| !l.iter().all(u8::is_ascii_whitespace))
        .collect();
    let mut applied = 0;
    for (i, line) in lines.iter().enumerate() {
        let entry: JournalEntry = match serde_json::from_slice(line) {
            Ok(e) => e,
            Err(e) if i + 1 == lines.len() => {
                warn!(target: "store", error = %e, path = %path.display(), "dropping torn journal tail");
                break;
            }
            Err(e) => return Err(e.into()),
        };
        if entry.seq <= state.seq {
            continue;
        }
        state.apply_entry(entry);
        applied += 1;
    }
    Ok(applied)
}

pub(crate) fn save(path: &Path, state: &StoreState) -> Result<(), StoreError> {
    write_json_atomic(path, state).map_err(io_err(path))
}

/// Write-ahead journal for one data dir.
#[derive(Debug)]
pub(crate) struct Journal {
    snapshot: PathBuf,
    log: PathBuf,
    pending: usize,
    pub(super) compact_every: usize,
}

impl Journal {
    /// Load snapshot + journal under `data_dir`. Anything replayed is folded
    /// into a fresh snapshot so the journal starts empty.
    pub(crate) fn open(data_dir: &Path) -> Result<(Self, StoreState), StoreError> {
        ensure_dir(data_dir)?;
        let mut journal = Self {
            snapshot: snapshot_path(data_dir),
            log: journal_path(data_dir),
            pending: 0,
            compact_every: COMPACT_EVERY,
        };
        let mut state = load_snapshot(&journal.snapshot)?;
        let replayed = replay(&journal.log, &mut state)?;
        state.rebuild_indexes();
        let log_len = fs::metadata(&journal.log).map(|m| m.len()).unwrap_or(0);
        if replayed > 0 || log_len > 0 {
            journal.compact(&state)?;
        }
        info!(
            target: "store",
            path = %journal.snapshot.display(),
            replayed,
            hot = state.hot.len(),
            cold = state.cold.len(),
            "store loaded"
        );
        Ok((journal, state))
    }

    /// Append and fsync one entry. A failed append leaves the file as it was.
    pub(crate) fn append(&mut self, entry: &JournalEntry) -> Result<(), StoreError> {
        let mut line = serde_json::to_vec(entry)?;
        line.push(b'\n');
        let err = io_err(&self.log);
        let mut f = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log)
            .map_err(&err)?;
        let before = f.metadata().map_err(&err)?.len();
        if let Err(e) = f.write_all(&line).and_then(|_| f.sync_data()) {
            if let Err(trunc) = f.set_len(before) {
                warn!(target: "store", error = %trunc, "could not roll back partial journal append");
            }
            return Err(err(e));
        }
        self.pending += 1;
        debug!(target: "store", seq = entry.seq, pending = self.pending, "journal append");
        Ok(())
    }

    pub(crate) fn due(&self) -> bool {
        self.pending >= self.compact_every
    }

    /// Rewrite the snapshot from `state`, then empty the journal. The snapshot
    /// carries the last applied sequence number, so a crash between the two
    /// steps replays nothing twice.
    pub(crate) fn compact(&mut self, state: &StoreState) -> Result<(), StoreError> {
        save(&self.snapshot, state)?;
        fs::File::create(&self.log).map_err(io_err(&self.log))?;
        debug!(target: "store", seq = state.seq, folded = self.pending, "journal compacted");
        self.pending = 0;
        Ok(())
    }
}
