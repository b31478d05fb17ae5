// dfs_meta是name节点的元数据引擎：命名空间树、journal/fsimage、数据节点成员管理、块放置与副本修复
// 由dfs_daemon装配启动，也可以在测试中独立构造每个子系统

pub mod append_log;
pub mod block_store;
pub mod checkpoint;
pub mod config;
pub mod fs_tree;
pub mod membership;
pub mod name_service;
pub mod node_store;
pub mod path_lock;
pub mod placement;
pub mod task_queue;

#[cfg(test)]
mod test_nodes;

pub use append_log::{AppendLog, IndexedLog, LogRecords};
pub use block_store::{block_checksum, file_checksum, BlockStore, LocalBlockStore};
pub use checkpoint::{checkpoint, recover, MetaLayout, RecoveryStats};
pub use config::NameConfig;
pub use fs_tree::{
    Block, DirEntry, EditRecord, EntryKind, FileMeta, FileSystemTree, ListResult, NamespaceNode,
    PathInfo, TreeState,
};
pub use membership::{
    ClusterInfo, ClusterNode, HeartbeatReply, Membership, NodeAddr, NodeDirectory, NodeInfo,
    NodeMessage, NodeReply, NodeSession, RegisterReply, ReplyStatus, SessionState, Status,
};
pub use name_service::{BlockPlan, CommitRequest, FileBlockInfo, NameService, PlanRequest};
pub use node_store::{NodeRecord, NodeRecordStore, SqliteNodeStore};
pub use path_lock::{spawn_lock_sweeper, PathLocks};
pub use placement::{plan_blocks, repair_block, BlockRepair};
pub use task_queue::{Task, TaskCommand, TaskQueue};

use std::sync::{Mutex, MutexGuard};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DfsError {
    #[error("invalid path: {0}")]
    InvalidPath(String),
    #[error("invalid name: {0}")]
    InvalidName(String),
    #[error("a file exists on the directory path: {0}")]
    ConflictingFileExists(String),
    #[error("same name exists: {0}")]
    SameNameExists(String),
    #[error("file not exists: {0}")]
    FileNotExists(String),
    #[error("target path must be directory: {0}")]
    TargetMustBeDirectory(String),
    #[error("target path not exists: {0}")]
    TargetNotExists(String),
    #[error("source path not exists: {0}")]
    SourceNotExists(String),
    #[error("service not ready yet: {0}")]
    ServiceNotReady(String),
    #[error("set path lock failed: {0}")]
    LockAcquisitionFailed(String),
    #[error("no usable data node: {0}")]
    NoUsableNode(String),
    #[error("all data nodes offline: {0}")]
    AllNodesOffline(String),
    #[error("node registration failed: {0}")]
    RegistrationFailed(String),
    #[error("checksum mismatch: {0}")]
    ChecksumMismatch(String),
    #[error("persistence failure: {0}")]
    PersistenceFailure(String),

    #[error("I/O error: {0}")]
    IoError(String),
    #[error("db error: {0}")]
    DbError(String),
    #[error("decode error: {0}")]
    DecodeError(String),
    #[error("invalid param: {0}")]
    InvalidParam(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl DfsError {
    /// Stable error name reported to the client-facing handler layer.
    pub fn error_name(&self) -> &'static str {
        match self {
            DfsError::InvalidPath(_) | DfsError::InvalidName(_) | DfsError::InvalidParam(_) => {
                "InvalidParameters"
            }
            DfsError::ConflictingFileExists(_) => "SameNameFileExists",
            DfsError::SameNameExists(_) => "SameNameExists",
            DfsError::FileNotExists(_) => "FileNotExists",
            DfsError::TargetMustBeDirectory(_) => "TargetPathMustDirectory",
            DfsError::TargetNotExists(_) => "TargetPathNotExists",
            DfsError::SourceNotExists(_) => "SourcePathNotExists",
            DfsError::ServiceNotReady(_) => "ServiceNotReadyYet",
            DfsError::LockAcquisitionFailed(_) => "SetFileLockFailed",
            DfsError::NoUsableNode(_) => "NoUsableDataNode",
            DfsError::AllNodesOffline(_) => "AllDataNodeOffline",
            DfsError::RegistrationFailed(_) => "RegistrationFailed",
            DfsError::ChecksumMismatch(_) => "ChecksumMismatch",
            DfsError::PersistenceFailure(_)
            | DfsError::IoError(_)
            | DfsError::DbError(_)
            | DfsError::DecodeError(_)
            | DfsError::Internal(_) => "ServerException",
        }
    }
}

pub type DfsResult<T> = std::result::Result<T, DfsError>;

impl From<std::io::Error> for DfsError {
    fn from(err: std::io::Error) -> Self {
        DfsError::IoError(err.to_string())
    }
}

pub(crate) fn map_db_err(err: rusqlite::Error) -> DfsError {
    DfsError::DbError(err.to_string())
}

pub(crate) fn lock_or_err<'a, T>(mutex: &'a Mutex<T>, what: &str) -> DfsResult<MutexGuard<'a, T>> {
    mutex
        .lock()
        .map_err(|e| DfsError::Internal(format!("{} lock poisoned: {}", what, e)))
}

/// For state that must outlive a panicked holder: liveness bookkeeping and task queues are
/// plain maps that stay consistent between statements, so the poison is logged and cleared.
pub(crate) fn lock_or_recover<'a, T>(mutex: &'a Mutex<T>, what: &str) -> MutexGuard<'a, T> {
    mutex.lock().unwrap_or_else(|poisoned| {
        log::warn!("{} lock poisoned, continue with current state", what);
        mutex.clear_poison();
        poisoned.into_inner()
    })
}

pub fn unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Random 128-bit token rendered as 32 lowercase hex chars; used for file ids and node ids.
pub fn new_token() -> String {
    use rand::RngCore;
    let mut buf = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut buf);
    buf.iter().map(|b| format!("{:02x}", b)).collect()
}
