use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;

use crate::checkpoint::{self, MetaLayout, RecoveryStats};
use crate::config::NameConfig;
use crate::fs_tree::{Block, FileMeta, FileSystemTree, ListResult, PathInfo};
use crate::membership::{ClusterInfo, Membership, NodeAddr, NodeDirectory};
use crate::node_store::NodeRecordStore;
use crate::path_lock::{spawn_lock_sweeper, PathLocks};
use crate::placement::plan_blocks;
use crate::task_queue::TaskQueue;
use crate::{lock_or_err, new_token, DfsError, DfsResult};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanRequest {
    pub path: String,
    pub size: u64,
    #[serde(default)]
    pub replica: Option<u32>,
    /// Seconds to hold the path; falls back to the configured default.
    #[serde(default)]
    pub lock_ttl: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockPlan {
    pub file_id: String,
    pub block_size: u64,
    pub replica: u32,
    pub blocks: Vec<Block>,
    pub data_nodes: BTreeMap<u64, NodeAddr>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitRequest {
    pub path: String,
    pub id: String,
    pub size: u64,
    pub replica: u32,
    #[serde(default)]
    pub block_size: u64,
    pub blocks: Vec<Block>,
    #[serde(default)]
    pub checksum: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileBlockInfo {
    pub info: FileMeta,
    pub data_nodes: BTreeMap<u64, NodeAddr>,
}

/// Client-facing operations of the name node, over one tree, one membership and one lock table.
pub struct NameService {
    config: NameConfig,
    layout: MetaLayout,
    tasks: Arc<TaskQueue>,
    membership: Arc<Membership>,
    tree: Arc<Mutex<FileSystemTree>>,
    locks: Arc<Mutex<PathLocks>>,
}

impl NameService {
    pub fn new(config: NameConfig, store: Arc<dyn NodeRecordStore>) -> DfsResult<Self> {
        let tasks = Arc::new(TaskQueue::new());
        let membership = Membership::new(store, tasks.clone())?;
        let nodes: Arc<dyn NodeDirectory> = membership.clone();
        let tree = FileSystemTree::new(tasks.clone(), nodes)
            .with_exclude_full_nodes(config.exclude_full_nodes);
        Ok(Self {
            layout: MetaLayout::new(config.data_path.clone()),
            config,
            tasks,
            membership,
            tree: Arc::new(Mutex::new(tree)),
            locks: Arc::new(Mutex::new(PathLocks::new())),
        })
    }

    pub fn config(&self) -> &NameConfig {
        &self.config
    }

    pub fn layout(&self) -> &MetaLayout {
        &self.layout
    }

    pub fn membership(&self) -> Arc<Membership> {
        self.membership.clone()
    }

    pub fn tasks(&self) -> Arc<TaskQueue> {
        self.tasks.clone()
    }

    pub async fn recover(&self) -> DfsResult<RecoveryStats> {
        checkpoint::recover(&self.tree, &self.layout, self.config.recovery_yield_every).await
    }

    pub fn checkpoint(&self) -> DfsResult<usize> {
        checkpoint::checkpoint(&self.tree, &self.layout)
    }

    pub fn spawn_lock_sweeper(&self) -> JoinHandle<()> {
        spawn_lock_sweeper(self.locks.clone(), self.config.lock_sweep_interval())
    }

    pub fn is_ready(&self) -> bool {
        self.tree().map(|t| t.is_ready()).unwrap_or(false)
    }

    fn tree(&self) -> DfsResult<MutexGuard<'_, FileSystemTree>> {
        lock_or_err(&self.tree, "fs tree")
    }

    fn ready_tree(&self) -> DfsResult<MutexGuard<'_, FileSystemTree>> {
        let tree = self.tree()?;
        if !tree.is_ready() {
            return Err(DfsError::ServiceNotReady(format!("namespace is {:?}", tree.state())));
        }
        Ok(tree)
    }

    fn ensure_ready(&self) -> DfsResult<()> {
        self.ready_tree().map(|_| ())
    }

    fn locks(&self) -> DfsResult<MutexGuard<'_, PathLocks>> {
        lock_or_err(&self.locks, "path locks")
    }

    fn lock_ttl(&self, secs: Option<u64>) -> Duration {
        secs.map(Duration::from_secs)
            .unwrap_or_else(|| self.config.default_lock_ttl())
    }

    /// Reserve `path` and choose holders for every block of a new file.
    pub fn plan_file_blocks(&self, req: &PlanRequest) -> DfsResult<BlockPlan> {
        if !req.path.starts_with('/') || req.path.ends_with('/') {
            return Err(DfsError::InvalidPath(req.path.clone()));
        }
        {
            let tree = self.ready_tree()?;
            if tree.exists(&req.path) {
                return Err(DfsError::SameNameExists(req.path.clone()));
            }
        }

        if self.membership.live_node_ids().is_empty() {
            return Err(DfsError::AllNodesOffline(req.path.clone()));
        }
        let usable = self
            .membership
            .usable_node_ids(self.config.exclude_full_nodes);
        if usable.is_empty() {
            return Err(DfsError::NoUsableNode(req.path.clone()));
        }
        let replica = req.replica.unwrap_or(self.config.default_replica).max(1);
        let blocks = plan_blocks(
            req.size,
            self.config.block_size,
            replica,
            &usable,
            &mut rand::thread_rng(),
        )?;

        let ttl = self.lock_ttl(req.lock_ttl);
        self.locks()?.set_lock(&req.path, ttl)?;

        let plan = BlockPlan {
            file_id: new_token(),
            block_size: self.config.block_size,
            replica: replica.min(usable.len() as u32),
            blocks,
            data_nodes: self.membership.live_nodes(),
        };
        debug!(
            "name service: plan {} as {} with {} blocks",
            req.path,
            plan.file_id,
            plan.blocks.len()
        );
        Ok(plan)
    }

    /// Insert the uploaded file and release its path lock.
    pub fn commit_file(&self, req: CommitRequest) -> DfsResult<FileMeta> {
        let total = req
            .blocks
            .iter()
            .try_fold(0u64, |acc, b| acc.checked_add(b.size))
            .ok_or_else(|| DfsError::InvalidParam("block sizes overflow".to_string()))?;
        if total != req.size {
            return Err(DfsError::InvalidParam(format!(
                "blocks cover {} bytes, file size is {}",
                total, req.size
            )));
        }
        let block_size = if req.block_size == 0 {
            self.config.block_size
        } else {
            req.block_size
        };
        let meta = FileMeta {
            id: req.id,
            size: req.size,
            replica: req.replica,
            current_replica: 0,
            block_size,
            blocks: req.blocks,
            checksum: req.checksum,
            ctime: 0,
            mtime: 0,
        };
        let meta = self.ready_tree()?.create(&req.path, meta)?;
        self.locks()?.unset_lock(&req.path);
        info!("name service: commit {} as {}", req.path, meta.id);
        Ok(meta)
    }

    pub fn delete_file(&self, path: &str) -> DfsResult<usize> {
        let mut tree = self.ready_tree()?;
        if tree.is_dir(path) {
            return Err(DfsError::InvalidParam(format!("{} is a directory", path)));
        }
        tree.delete(path)
    }

    pub fn delete_dir(&self, path: &str) -> DfsResult<usize> {
        let mut tree = self.ready_tree()?;
        if tree.is_file(path) {
            return Err(DfsError::TargetMustBeDirectory(path.to_string()));
        }
        let removed = tree.delete(path)?;
        info!("name service: delete dir {} with {} files", path, removed);
        Ok(removed)
    }

    pub fn move_path(&self, source: &str, target: &str) -> DfsResult<()> {
        self.ready_tree()?.move_to(source, target)
    }

    pub fn rename_path(&self, path: &str, new_name: &str) -> DfsResult<()> {
        self.ready_tree()?.rename(path, new_name)
    }

    pub fn make_dirs(&self, path: &str) -> DfsResult<()> {
        self.ready_tree()?.makedirs(path)
    }

    pub fn list_dir(
        &self,
        path: &str,
        offset: i64,
        limit: i64,
        include_files: bool,
        include_dirs: bool,
    ) -> DfsResult<ListResult> {
        self.ready_tree()?
            .list_dir(path, offset, limit, include_files, include_dirs)
    }

    pub fn path_info(&self, path: &str) -> DfsResult<PathInfo> {
        self.ready_tree()?.path_info(path)
    }

    pub fn file_block_info(&self, path: &str) -> DfsResult<FileBlockInfo> {
        let info = self.ready_tree()?.get_file_info(path)?;
        Ok(FileBlockInfo {
            info,
            data_nodes: self.membership.live_nodes(),
        })
    }

    /// Acknowledged once the new layout is journaled; nodes converge through their task queues.
    pub fn update_replica(&self, path: &str, replica: u32) -> DfsResult<FileMeta> {
        self.ready_tree()?.update_replica(path, replica)
    }

    pub fn update_lock(&self, path: &str, ttl: Option<u64>) -> DfsResult<()> {
        self.ensure_ready()?;
        let ttl = self.lock_ttl(ttl);
        self.locks()?.update_lock(path, ttl)
    }

    pub fn release_lock(&self, path: &str) -> DfsResult<bool> {
        self.ensure_ready()?;
        Ok(self.locks()?.unset_lock(path))
    }

    pub fn cluster_info(&self) -> DfsResult<ClusterInfo> {
        self.ensure_ready()?;
        self.membership.cluster_info()
    }
}
