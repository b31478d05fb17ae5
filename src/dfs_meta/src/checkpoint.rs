// fsimage/editlog的恢复与轮转
// 启动: 加载fsimage -> 重放editlog -> 立即dump新的fsimage并轮转 -> 打开新的editlog -> ready

use log::{debug, error, info, warn};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::append_log::{replay_file, write_records, AppendLog};
use crate::fs_tree::{EditRecord, FileSystemTree};
use crate::{lock_or_err, DfsError, DfsResult};

const SNAPSHOT_NAME: &str = "fsimage";
const NEW_SNAPSHOT_NAME: &str = "fsimage.new";
const BACKUP_SNAPSHOT_NAME: &str = "fsimage.old";
const JOURNAL_NAME: &str = "editlog";

/// File names of the persisted namespace under one data directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetaLayout {
    data_path: PathBuf,
}

impl MetaLayout {
    pub fn new(data_path: impl Into<PathBuf>) -> Self {
        Self {
            data_path: data_path.into(),
        }
    }

    pub fn data_path(&self) -> &Path {
        &self.data_path
    }

    pub fn snapshot_path(&self) -> PathBuf {
        self.data_path.join(SNAPSHOT_NAME)
    }

    pub fn new_snapshot_path(&self) -> PathBuf {
        self.data_path.join(NEW_SNAPSHOT_NAME)
    }

    pub fn backup_path(&self) -> PathBuf {
        self.data_path.join(BACKUP_SNAPSHOT_NAME)
    }

    pub fn journal_path(&self) -> PathBuf {
        self.data_path.join(JOURNAL_NAME)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryStats {
    pub snapshot_records: usize,
    pub journal_records: usize,
    /// Records that failed to decode or to apply.
    pub skipped_records: usize,
    /// Records in the snapshot written at the end of recovery.
    pub dumped_records: usize,
    /// The primary snapshot was missing and the backup was loaded instead.
    pub used_backup: bool,
}

fn remove_if_exists(path: &Path) -> DfsResult<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Write `records` as the new snapshot and rotate it into place, dropping the folded journal.
pub fn write_snapshot(layout: &MetaLayout, records: &[EditRecord]) -> DfsResult<usize> {
    let count = write_records(layout.new_snapshot_path(), records.iter())?;

    let snapshot = layout.snapshot_path();
    let backup = layout.backup_path();
    // the backup may be the only intact image until a primary replaces it
    if snapshot.exists() {
        remove_if_exists(&backup)?;
        fs::rename(&snapshot, &backup)?;
    }
    fs::rename(layout.new_snapshot_path(), &snapshot)?;
    remove_if_exists(&layout.journal_path())?;
    info!(
        "checkpoint: rotated snapshot with {} records into {}",
        count,
        snapshot.display()
    );
    Ok(count)
}

/// Apply every record of one log, a chunk at a time, yielding to the scheduler between chunks.
/// Returns (applied, skipped).
async fn apply_log(
    tree: &Mutex<FileSystemTree>,
    path: &Path,
    yield_every: usize,
) -> DfsResult<(usize, usize)> {
    let mut records = replay_file::<EditRecord>(path)?;
    let chunk = yield_every.max(1);
    let mut applied = 0usize;
    let mut skipped = 0usize;
    loop {
        let mut done = false;
        {
            let mut guard = lock_or_err(tree, "fs tree")?;
            for _ in 0..chunk {
                match records.next() {
                    None => {
                        done = true;
                        break;
                    }
                    Some(Ok(record)) => match guard.replay_record(record) {
                        Ok(()) => applied += 1,
                        Err(e) => {
                            warn!("recovery: skip record from {}: {}", path.display(), e);
                            skipped += 1;
                        }
                    },
                    Some(Err(DfsError::DecodeError(msg))) => {
                        warn!("recovery: skip undecodable {}: {}", path.display(), msg);
                        skipped += 1;
                    }
                    Some(Err(e)) => return Err(e),
                }
            }
        }
        if done {
            break;
        }
        tokio::task::yield_now().await;
    }
    debug!(
        "recovery: {} applied {}, skipped {}",
        path.display(),
        applied,
        skipped
    );
    Ok((applied, skipped))
}

/// Boot sequence: load snapshot, replay journal, fold both into a fresh snapshot, open an
/// empty journal and mark the tree ready. Requests see `ServiceNotReady` until this returns.
pub async fn recover(
    tree: &Mutex<FileSystemTree>,
    layout: &MetaLayout,
    yield_every: usize,
) -> DfsResult<RecoveryStats> {
    fs::create_dir_all(layout.data_path())?;
    lock_or_err(tree, "fs tree")?.begin_recovery();
    info!("recovery: start from {}", layout.data_path().display());

    let mut stats = RecoveryStats::default();
    let snapshot = if layout.snapshot_path().exists() {
        Some(layout.snapshot_path())
    } else if layout.backup_path().exists() {
        warn!(
            "recovery: {} missing, load backup {}",
            layout.snapshot_path().display(),
            layout.backup_path().display()
        );
        stats.used_backup = true;
        Some(layout.backup_path())
    } else {
        None
    };
    if let Some(path) = snapshot {
        let (applied, skipped) = apply_log(tree, &path, yield_every).await?;
        stats.snapshot_records = applied;
        stats.skipped_records += skipped;
    }

    let (applied, skipped) = apply_log(tree, &layout.journal_path(), yield_every).await?;
    stats.journal_records = applied;
    stats.skipped_records += skipped;

    let mut guard = lock_or_err(tree, "fs tree")?;
    let records = guard.snapshot_records();
    stats.dumped_records = write_snapshot(layout, &records)?;
    let journal = AppendLog::open(layout.journal_path())?;
    guard.mark_ready(Some(journal));
    info!(
        "recovery: done, snapshot {} + journal {} records, {} skipped, {} files",
        stats.snapshot_records,
        stats.journal_records,
        stats.skipped_records,
        guard.file_count()
    );
    Ok(stats)
}

/// Fold the live journal into a new snapshot while the service keeps running.
pub fn checkpoint(tree: &Mutex<FileSystemTree>, layout: &MetaLayout) -> DfsResult<usize> {
    let mut guard = lock_or_err(tree, "fs tree")?;
    if !guard.is_ready() {
        return Err(DfsError::ServiceNotReady("checkpoint before recovery".to_string()));
    }
    let records = guard.snapshot_records();
    let old_journal = guard.replace_journal(None);
    let count = match write_snapshot(layout, &records) {
        Ok(count) => count,
        Err(e) => {
            error!("checkpoint: write snapshot failed: {}", e);
            guard.replace_journal(old_journal);
            return Err(DfsError::PersistenceFailure(e.to_string()));
        }
    };
    drop(old_journal);
    match AppendLog::open(layout.journal_path()) {
        Ok(journal) => {
            guard.replace_journal(Some(journal));
            Ok(count)
        }
        Err(e) => {
            // without a journal nothing may be mutated
            error!("checkpoint: open fresh journal failed: {}", e);
            guard.begin_recovery();
            Err(DfsError::PersistenceFailure(e.to_string()))
        }
    }
}
