use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use crate::append_log::AppendLog;
use crate::membership::NodeDirectory;
use crate::placement::repair_block;
use crate::task_queue::{Task, TaskQueue};
use crate::{unix_timestamp, DfsError, DfsResult};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub index: u32,
    pub size: u64,
    /// Numeric ids of the nodes storing this block.
    pub holders: Vec<u64>,
    #[serde(default)]
    pub checksum: String,
}

/// Metadata of one file, keyed by its generated id so rename/move never touch it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMeta {
    pub id: String,
    pub size: u64,
    pub replica: u32,
    #[serde(default)]
    pub current_replica: u32,
    #[serde(default)]
    pub block_size: u64,
    pub blocks: Vec<Block>,
    #[serde(default)]
    pub checksum: String,
    #[serde(default)]
    pub ctime: u64,
    #[serde(default)]
    pub mtime: u64,
}

impl FileMeta {
    /// Smallest holder count over all blocks; an empty file trivially has its desired replica.
    pub fn min_holders(&self) -> u32 {
        self.blocks
            .iter()
            .map(|b| b.holders.len() as u32)
            .min()
            .unwrap_or(self.replica)
    }

    fn normalize(&mut self) {
        self.replica = self.replica.max(1);
        self.current_replica = self.min_holders().min(self.replica);
        if self.ctime == 0 {
            self.ctime = unix_timestamp();
        }
        if self.mtime == 0 {
            self.mtime = self.ctime;
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum NamespaceNode {
    Directory(BTreeMap<String, NamespaceNode>),
    File(String),
}

/// One journal/snapshot line.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum EditRecord {
    Create {
        path: String,
        info: FileMeta,
    },
    #[serde(alias = "makedir")]
    Makedirs {
        path: String,
    },
    Delete {
        path: String,
    },
    Rename {
        path: String,
        new_name: String,
    },
    Move {
        source: String,
        target: String,
    },
    Update {
        path: String,
        info: FileMeta,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TreeState {
    Booting,
    Recovering,
    Ready,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    File,
    Directory,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirEntry {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: EntryKind,
    pub size: u64,
    pub id: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListResult {
    /// Matching entries before offset/limit are applied.
    pub total: usize,
    pub entries: Vec<DirEntry>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathInfo {
    #[serde(rename = "type")]
    pub kind: EntryKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub info: Option<FileMeta>,
}

fn split_path(path: &str) -> DfsResult<Vec<&str>> {
    if !path.starts_with('/') {
        return Err(DfsError::InvalidPath(format!(
            "must be absolute path: {}",
            path
        )));
    }
    Ok(path.split('/').filter(|s| !s.is_empty()).collect())
}

/// Split into parent segments and leaf name; the root has no leaf.
fn split_leaf(path: &str) -> DfsResult<(Vec<&str>, &str)> {
    let mut segs = split_path(path)?;
    let leaf = segs
        .pop()
        .ok_or_else(|| DfsError::InvalidPath(format!("root has no name: {}", path)))?;
    Ok((segs, leaf))
}

fn join_path(parent: &str, name: &str) -> String {
    if parent.ends_with('/') {
        format!("{}{}", parent, name)
    } else {
        format!("{}/{}", parent, name)
    }
}

fn is_valid_name(name: &str) -> bool {
    !name.is_empty() && !name.contains('/')
}

fn collect_file_ids(node: &NamespaceNode, out: &mut Vec<String>) {
    match node {
        NamespaceNode::File(id) => out.push(id.clone()),
        NamespaceNode::Directory(children) => {
            for child in children.values() {
                collect_file_ids(child, out);
            }
        }
    }
}

/// Walk `segs` from `root`, creating missing directories.
fn make_dirs_in<'a>(
    root: &'a mut NamespaceNode,
    segs: &[&str],
    path: &str,
) -> DfsResult<&'a mut BTreeMap<String, NamespaceNode>> {
    let mut cur = root;
    for seg in segs {
        let children = match cur {
            NamespaceNode::Directory(children) => children,
            NamespaceNode::File(_) => {
                return Err(DfsError::ConflictingFileExists(path.to_string()));
            }
        };
        cur = children
            .entry(seg.to_string())
            .or_insert_with(|| NamespaceNode::Directory(BTreeMap::new()));
    }
    match cur {
        NamespaceNode::Directory(children) => Ok(children),
        NamespaceNode::File(_) => Err(DfsError::ConflictingFileExists(path.to_string())),
    }
}

/// The authoritative namespace: directory tree plus file metadata by id.
///
/// Every successful mutation is appended to the journal before memory is touched, so a
/// failed append leaves the tree unchanged.
pub struct FileSystemTree {
    root: NamespaceNode,
    files: HashMap<String, FileMeta>,
    journal: Option<AppendLog>,
    state: TreeState,
    tasks: Arc<TaskQueue>,
    nodes: Arc<dyn NodeDirectory>,
    exclude_full_nodes: bool,
}

impl FileSystemTree {
    pub fn new(tasks: Arc<TaskQueue>, nodes: Arc<dyn NodeDirectory>) -> Self {
        Self {
            root: NamespaceNode::Directory(BTreeMap::new()),
            files: HashMap::new(),
            journal: None,
            state: TreeState::Booting,
            tasks,
            nodes,
            exclude_full_nodes: true,
        }
    }

    pub fn with_exclude_full_nodes(mut self, exclude: bool) -> Self {
        self.exclude_full_nodes = exclude;
        self
    }

    pub fn state(&self) -> TreeState {
        self.state
    }

    pub fn is_ready(&self) -> bool {
        self.state == TreeState::Ready
    }

    pub(crate) fn begin_recovery(&mut self) {
        self.state = TreeState::Recovering;
    }

    /// Install the journal for subsequent mutations and accept requests.
    pub fn mark_ready(&mut self, journal: Option<AppendLog>) {
        self.journal = journal;
        self.state = TreeState::Ready;
    }

    /// Swap the journal, e.g. after a checkpoint rotated the old one away.
    pub(crate) fn replace_journal(&mut self, journal: Option<AppendLog>) -> Option<AppendLog> {
        std::mem::replace(&mut self.journal, journal)
    }

    fn ensure_ready(&self) -> DfsResult<()> {
        if self.state != TreeState::Ready {
            return Err(DfsError::ServiceNotReady(format!(
                "namespace is {:?}",
                self.state
            )));
        }
        Ok(())
    }

    fn journal(&mut self, record: &EditRecord) -> DfsResult<()> {
        let Some(journal) = self.journal.as_mut() else {
            return Ok(());
        };
        journal.append(record).map_err(|e| {
            error!("fs tree: journal append failed: {}", e);
            DfsError::PersistenceFailure(e.to_string())
        })
    }

    fn lookup(&self, segs: &[&str]) -> Option<&NamespaceNode> {
        let mut cur = &self.root;
        for seg in segs {
            cur = match cur {
                NamespaceNode::Directory(children) => children.get(*seg)?,
                NamespaceNode::File(_) => return None,
            };
        }
        Some(cur)
    }

    fn dir_mut(&mut self, segs: &[&str]) -> Option<&mut BTreeMap<String, NamespaceNode>> {
        let mut cur = &mut self.root;
        for seg in segs {
            cur = match cur {
                NamespaceNode::Directory(children) => children.get_mut(*seg)?,
                NamespaceNode::File(_) => return None,
            };
        }
        match cur {
            NamespaceNode::Directory(children) => Some(children),
            NamespaceNode::File(_) => None,
        }
    }

    fn dir_children(&self, segs: &[&str]) -> Option<&BTreeMap<String, NamespaceNode>> {
        match self.lookup(segs)? {
            NamespaceNode::Directory(children) => Some(children),
            NamespaceNode::File(_) => None,
        }
    }

    /// Fails if any existing segment of `segs` is a file.
    fn check_dir_chain(&self, segs: &[&str], path: &str) -> DfsResult<()> {
        let mut cur = &self.root;
        for seg in segs {
            let NamespaceNode::Directory(children) = cur else {
                return Err(DfsError::ConflictingFileExists(path.to_string()));
            };
            match children.get(*seg) {
                Some(next) => cur = next,
                None => return Ok(()),
            }
        }
        match cur {
            NamespaceNode::Directory(_) => Ok(()),
            NamespaceNode::File(_) => Err(DfsError::ConflictingFileExists(path.to_string())),
        }
    }

    // ========== makedirs ==========

    pub fn makedirs(&mut self, path: &str) -> DfsResult<()> {
        self.ensure_ready()?;
        self.validate_makedirs(path)?;
        self.journal(&EditRecord::Makedirs {
            path: path.to_string(),
        })?;
        self.apply_makedirs(path)
    }

    fn validate_makedirs(&self, path: &str) -> DfsResult<()> {
        let segs = split_path(path)?;
        self.check_dir_chain(&segs, path)
    }

    fn apply_makedirs(&mut self, path: &str) -> DfsResult<()> {
        let segs = split_path(path)?;
        make_dirs_in(&mut self.root, &segs, path).map(|_| ())
    }

    // ========== create ==========

    /// Insert a file, creating its parent chain. Derived fields of `meta` are filled in.
    pub fn create(&mut self, path: &str, meta: FileMeta) -> DfsResult<FileMeta> {
        self.ensure_ready()?;
        let meta = self.validate_create(path, meta)?;
        self.journal(&EditRecord::Create {
            path: path.to_string(),
            info: meta.clone(),
        })?;
        self.apply_create(path, meta.clone())?;
        Ok(meta)
    }

    fn validate_create(&self, path: &str, mut meta: FileMeta) -> DfsResult<FileMeta> {
        if path.ends_with('/') {
            return Err(DfsError::InvalidPath(format!("empty file name: {}", path)));
        }
        let (parent, leaf) = split_leaf(path)?;
        self.check_dir_chain(&parent, path)?;
        if let Some(children) = self.dir_children(&parent) {
            if children.contains_key(leaf) {
                return Err(DfsError::SameNameExists(path.to_string()));
            }
        }
        if meta.id.is_empty() {
            return Err(DfsError::InvalidParam("file id is empty".to_string()));
        }
        if self.files.contains_key(&meta.id) {
            return Err(DfsError::InvalidParam(format!(
                "file id already in use: {}",
                meta.id
            )));
        }
        meta.normalize();
        Ok(meta)
    }

    fn apply_create(&mut self, path: &str, meta: FileMeta) -> DfsResult<()> {
        let (parent, leaf) = split_leaf(path)?;
        let children = make_dirs_in(&mut self.root, &parent, path)?;
        children.insert(leaf.to_string(), NamespaceNode::File(meta.id.clone()));
        self.files.insert(meta.id.clone(), meta);
        Ok(())
    }

    // ========== delete ==========

    /// Remove a file or a whole subtree. Every removed file is queued for deletion on
    /// every known node. Returns the number of files removed.
    pub fn delete(&mut self, path: &str) -> DfsResult<usize> {
        self.ensure_ready()?;
        self.validate_delete(path)?;
        self.journal(&EditRecord::Delete {
            path: path.to_string(),
        })?;
        self.apply_delete(path, true)
    }

    fn validate_delete(&self, path: &str) -> DfsResult<()> {
        let (parent, leaf) = split_leaf(path)?;
        match self.dir_children(&parent) {
            Some(children) if children.contains_key(leaf) => Ok(()),
            _ => Err(DfsError::FileNotExists(path.to_string())),
        }
    }

    fn apply_delete(&mut self, path: &str, emit_tasks: bool) -> DfsResult<usize> {
        let (parent, leaf) = split_leaf(path)?;
        let node = self
            .dir_mut(&parent)
            .and_then(|children| children.remove(leaf))
            .ok_or_else(|| DfsError::FileNotExists(path.to_string()))?;

        let mut file_ids = Vec::new();
        collect_file_ids(&node, &mut file_ids);
        let known = if emit_tasks {
            self.nodes.known_node_ids()
        } else {
            Vec::new()
        };
        for file_id in &file_ids {
            self.files.remove(file_id);
            if emit_tasks {
                self.tasks.push_to_all(&known, &Task::delete_file(file_id.as_str()));
            }
            debug!("fs tree: delete file {} under {}", file_id, path);
        }
        Ok(file_ids.len())
    }

    // ========== rename ==========

    pub fn rename(&mut self, path: &str, new_name: &str) -> DfsResult<()> {
        self.ensure_ready()?;
        self.validate_rename(path, new_name)?;
        self.journal(&EditRecord::Rename {
            path: path.to_string(),
            new_name: new_name.to_string(),
        })?;
        self.apply_rename(path, new_name)
    }

    fn validate_rename(&self, path: &str, new_name: &str) -> DfsResult<()> {
        if !is_valid_name(new_name) {
            return Err(DfsError::InvalidName(new_name.to_string()));
        }
        let (parent, leaf) = split_leaf(path)?;
        let children = self
            .dir_children(&parent)
            .filter(|children| children.contains_key(leaf))
            .ok_or_else(|| DfsError::FileNotExists(path.to_string()))?;
        if children.contains_key(new_name) {
            return Err(DfsError::SameNameExists(new_name.to_string()));
        }
        Ok(())
    }

    fn apply_rename(&mut self, path: &str, new_name: &str) -> DfsResult<()> {
        let (parent, leaf) = split_leaf(path)?;
        let children = self
            .dir_mut(&parent)
            .ok_or_else(|| DfsError::FileNotExists(path.to_string()))?;
        let node = children
            .remove(leaf)
            .ok_or_else(|| DfsError::FileNotExists(path.to_string()))?;
        children.insert(new_name.to_string(), node);
        Ok(())
    }

    // ========== move ==========

    /// Move `source` under the existing directory `target`, keeping its name.
    pub fn move_to(&mut self, source: &str, target: &str) -> DfsResult<()> {
        self.ensure_ready()?;
        self.validate_move(source, target)?;
        self.journal(&EditRecord::Move {
            source: source.to_string(),
            target: target.to_string(),
        })?;
        self.apply_move(source, target)
    }

    fn validate_move(&self, source: &str, target: &str) -> DfsResult<()> {
        let (src_parent, name) = split_leaf(source)?;
        let exists = self
            .dir_children(&src_parent)
            .map(|children| children.contains_key(name))
            .unwrap_or(false);
        if !exists {
            return Err(DfsError::SourceNotExists(source.to_string()));
        }

        let target_segs = split_path(target)?;
        let target_children = match self.lookup(&target_segs) {
            None => return Err(DfsError::TargetNotExists(target.to_string())),
            Some(NamespaceNode::File(_)) => {
                return Err(DfsError::TargetMustBeDirectory(target.to_string()))
            }
            Some(NamespaceNode::Directory(children)) => children,
        };
        if target_children.contains_key(name) {
            return Err(DfsError::SameNameExists(name.to_string()));
        }

        let mut source_segs = src_parent.clone();
        source_segs.push(name);
        if target_segs.starts_with(&source_segs) {
            return Err(DfsError::InvalidPath(format!(
                "cannot move {} into itself: {}",
                source, target
            )));
        }
        Ok(())
    }

    fn apply_move(&mut self, source: &str, target: &str) -> DfsResult<()> {
        let (src_parent, name) = split_leaf(source)?;
        let target_segs = split_path(target)?;
        let node = self
            .dir_mut(&src_parent)
            .and_then(|children| children.remove(name))
            .ok_or_else(|| DfsError::SourceNotExists(source.to_string()))?;
        match self.dir_mut(&target_segs) {
            Some(children) => {
                children.insert(name.to_string(), node);
                Ok(())
            }
            None => {
                // put it back so a bad target never loses the subtree
                if let Some(children) = self.dir_mut(&src_parent) {
                    children.insert(name.to_string(), node);
                }
                Err(DfsError::TargetNotExists(target.to_string()))
            }
        }
    }

    // ========== replica update ==========

    /// Grow or shrink every block of a file towards `new_replica`, queueing replicate tasks
    /// for growth and per-block delete tasks for shrink. Convergence is eventual.
    pub fn update_replica(&mut self, path: &str, new_replica: u32) -> DfsResult<FileMeta> {
        self.ensure_ready()?;
        if new_replica == 0 {
            return Err(DfsError::InvalidParam("replica must be positive".to_string()));
        }
        let segs = split_path(path)?;
        let file_id = match self.lookup(&segs) {
            Some(NamespaceNode::File(id)) => id.clone(),
            _ => return Err(DfsError::FileNotExists(path.to_string())),
        };
        let mut meta = self
            .files
            .get(&file_id)
            .cloned()
            .ok_or_else(|| DfsError::FileNotExists(path.to_string()))?;

        let live_ids = self.nodes.live_node_ids();
        if live_ids.is_empty() {
            return Err(DfsError::AllNodesOffline(path.to_string()));
        }
        if new_replica as usize > live_ids.len() {
            return Err(DfsError::NoUsableNode(format!(
                "replica {} needs more than {} online nodes",
                new_replica,
                live_ids.len()
            )));
        }
        let live: HashSet<u64> = live_ids.into_iter().collect();
        let usable = self.nodes.usable_node_ids(self.exclude_full_nodes);

        let mut rng = rand::thread_rng();
        let mut pending: Vec<(u64, Task)> = Vec::new();
        for block in meta.blocks.iter_mut() {
            let repair = repair_block(
                &block.holders,
                &live,
                &usable,
                new_replica as usize,
                &mut rng,
            );
            if repair.shortfall > 0 {
                warn!(
                    "fs tree: block {} of {} short of {} holders for replica {}",
                    block.index, path, repair.shortfall, new_replica
                );
            }
            if let Some(source) = repair.source {
                pending.push((
                    source,
                    Task::replicate_block(meta.id.as_str(), block.index, repair.targets.clone()),
                ));
            }
            for removed in &repair.removed {
                pending.push((*removed, Task::delete_block(meta.id.as_str(), block.index)));
            }
            block.holders = repair.holders;
        }
        meta.replica = new_replica;
        meta.current_replica = meta.min_holders().min(new_replica);
        meta.mtime = unix_timestamp();

        self.journal(&EditRecord::Update {
            path: path.to_string(),
            info: meta.clone(),
        })?;
        self.files.insert(file_id, meta.clone());
        for (node, task) in pending {
            self.tasks.push(node, task);
        }
        info!(
            "fs tree: update replica of {} to {}, current {}",
            path, new_replica, meta.current_replica
        );
        Ok(meta)
    }

    fn apply_update(&mut self, path: &str, info: FileMeta) -> DfsResult<()> {
        let segs = split_path(path)?;
        let file_id = match self.lookup(&segs) {
            Some(NamespaceNode::File(id)) => id.clone(),
            _ => return Err(DfsError::FileNotExists(path.to_string())),
        };
        // the path may since have been taken by another file
        if info.id != file_id {
            return Err(DfsError::FileNotExists(format!(
                "{} is {}, not {}",
                path, file_id, info.id
            )));
        }
        self.files.insert(file_id, info);
        Ok(())
    }

    // ========== replay ==========

    /// Apply one journal or snapshot record without journaling it and without queueing tasks.
    pub fn replay_record(&mut self, record: EditRecord) -> DfsResult<()> {
        match record {
            EditRecord::Create { path, info } => {
                let info = self.validate_create(&path, info)?;
                self.apply_create(&path, info)
            }
            EditRecord::Makedirs { path } => {
                self.validate_makedirs(&path)?;
                self.apply_makedirs(&path)
            }
            EditRecord::Delete { path } => {
                self.validate_delete(&path)?;
                self.apply_delete(&path, false).map(|_| ())
            }
            EditRecord::Rename { path, new_name } => {
                self.validate_rename(&path, &new_name)?;
                self.apply_rename(&path, &new_name)
            }
            EditRecord::Move { source, target } => {
                self.validate_move(&source, &target)?;
                self.apply_move(&source, &target)
            }
            EditRecord::Update { path, info } => self.apply_update(&path, info),
        }
    }

    // ========== reads ==========

    pub fn exists(&self, path: &str) -> bool {
        split_path(path)
            .map(|segs| self.lookup(&segs).is_some())
            .unwrap_or(false)
    }

    pub fn is_dir(&self, path: &str) -> bool {
        split_path(path)
            .map(|segs| matches!(self.lookup(&segs), Some(NamespaceNode::Directory(_))))
            .unwrap_or(false)
    }

    pub fn is_file(&self, path: &str) -> bool {
        split_path(path)
            .map(|segs| matches!(self.lookup(&segs), Some(NamespaceNode::File(_))))
            .unwrap_or(false)
    }

    pub fn get_file_info(&self, path: &str) -> DfsResult<FileMeta> {
        let segs = split_path(path)?;
        match self.lookup(&segs) {
            Some(NamespaceNode::File(id)) => self
                .files
                .get(id)
                .cloned()
                .ok_or_else(|| DfsError::Internal(format!("metadata missing for {}", id))),
            _ => Err(DfsError::FileNotExists(path.to_string())),
        }
    }

    pub fn path_info(&self, path: &str) -> DfsResult<PathInfo> {
        let segs = split_path(path)?;
        match self.lookup(&segs) {
            Some(NamespaceNode::Directory(_)) => Ok(PathInfo {
                kind: EntryKind::Directory,
                info: None,
            }),
            Some(NamespaceNode::File(_)) => Ok(PathInfo {
                kind: EntryKind::File,
                info: Some(self.get_file_info(path)?),
            }),
            None => Err(DfsError::FileNotExists(path.to_string())),
        }
    }

    /// Directories then files, each sorted by name. Negative offset/limit clamp to 0 and a
    /// zero limit means no limit.
    pub fn list_dir(
        &self,
        path: &str,
        offset: i64,
        limit: i64,
        include_files: bool,
        include_dirs: bool,
    ) -> DfsResult<ListResult> {
        let segs = split_path(path)?;
        let children = match self.lookup(&segs) {
            Some(NamespaceNode::Directory(children)) => children,
            Some(NamespaceNode::File(_)) => {
                return Err(DfsError::TargetMustBeDirectory(path.to_string()))
            }
            None => return Err(DfsError::FileNotExists(path.to_string())),
        };

        let mut dirs = Vec::new();
        let mut files = Vec::new();
        for (name, child) in children {
            match child {
                NamespaceNode::Directory(_) if include_dirs => dirs.push(DirEntry {
                    name: name.clone(),
                    kind: EntryKind::Directory,
                    size: 0,
                    id: String::new(),
                }),
                NamespaceNode::File(id) if include_files => files.push(DirEntry {
                    name: name.clone(),
                    kind: EntryKind::File,
                    size: self.files.get(id).map(|m| m.size).unwrap_or(0),
                    id: id.clone(),
                }),
                _ => {}
            }
        }
        dirs.extend(files);

        let total = dirs.len();
        let offset = offset.max(0) as usize;
        let limit = match limit.max(0) as usize {
            0 => usize::MAX,
            n => n,
        };
        let entries = dirs.into_iter().skip(offset).take(limit).collect();
        Ok(ListResult { total, entries })
    }

    pub fn file_count(&self) -> usize {
        self.files.len()
    }

    /// Depth-first dump: one `create` per file, one `makedirs` per empty directory.
    pub fn snapshot_records(&self) -> Vec<EditRecord> {
        let mut out = Vec::new();
        if let NamespaceNode::Directory(children) = &self.root {
            for (name, child) in children {
                self.dump_node(join_path("/", name), child, &mut out);
            }
        }
        out
    }

    fn dump_node(&self, path: String, node: &NamespaceNode, out: &mut Vec<EditRecord>) {
        match node {
            NamespaceNode::File(id) => match self.files.get(id) {
                Some(meta) => out.push(EditRecord::Create {
                    path,
                    info: meta.clone(),
                }),
                None => warn!("fs tree: dump skips {} without metadata ({})", path, id),
            },
            NamespaceNode::Directory(children) if children.is_empty() => {
                out.push(EditRecord::Makedirs { path })
            }
            NamespaceNode::Directory(children) => {
                for (name, child) in children {
                    self.dump_node(join_path(&path, name), child, out);
                }
            }
        }
    }

    /// Every file keyed by its current path.
    pub fn files_by_path(&self) -> BTreeMap<String, FileMeta> {
        self.snapshot_records()
            .into_iter()
            .filter_map(|record| match record {
                EditRecord::Create { path, info } => Some((path, info)),
                _ => None,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::append_log::replay_file;
    use crate::task_queue::TaskCommand;
    use crate::test_nodes::StaticNodes;
    use tempfile::TempDir;

    fn meta(id: &str, size: u64, holders: &[&[u64]]) -> FileMeta {
        FileMeta {
            id: id.to_string(),
            size,
            replica: holders.first().map(|h| h.len() as u32).unwrap_or(1),
            current_replica: 0,
            block_size: 100,
            blocks: holders
                .iter()
                .enumerate()
                .map(|(i, h)| Block {
                    index: i as u32,
                    size: 100,
                    holders: h.to_vec(),
                    checksum: format!("b{}", i),
                })
                .collect(),
            checksum: "whole".to_string(),
            ctime: 0,
            mtime: 0,
        }
    }

    fn ready_tree(nodes: Arc<StaticNodes>) -> (FileSystemTree, Arc<TaskQueue>) {
        let tasks = Arc::new(TaskQueue::new());
        let mut tree = FileSystemTree::new(tasks.clone(), nodes);
        tree.mark_ready(None);
        (tree, tasks)
    }

    fn journaled_tree(tmp: &TempDir) -> FileSystemTree {
        let mut tree = FileSystemTree::new(Arc::new(TaskQueue::new()), StaticNodes::new(&[1]));
        let journal = AppendLog::open(tmp.path().join("editlog")).unwrap();
        tree.mark_ready(Some(journal));
        tree
    }

    fn journal_records(tmp: &TempDir) -> Vec<EditRecord> {
        replay_file(tmp.path().join("editlog"))
            .unwrap()
            .collect::<DfsResult<_>>()
            .unwrap()
    }

    #[test]
    fn test_not_ready_rejects_mutations() {
        let mut tree = FileSystemTree::new(Arc::new(TaskQueue::new()), StaticNodes::new(&[1]));
        assert!(matches!(
            tree.makedirs("/a"),
            Err(DfsError::ServiceNotReady(_))
        ));
        tree.begin_recovery();
        assert!(matches!(
            tree.create("/a/f", meta("f", 1, &[&[1]])),
            Err(DfsError::ServiceNotReady(_))
        ));
        // replay is allowed while recovering
        tree.replay_record(EditRecord::Makedirs {
            path: "/a".to_string(),
        })
        .unwrap();
        assert!(tree.is_dir("/a"));
    }

    #[test]
    fn test_makedirs_creates_chain_with_one_journal_entry() {
        let tmp = TempDir::new().unwrap();
        let mut tree = journaled_tree(&tmp);
        tree.makedirs("/a/b/c").unwrap();

        assert!(tree.is_dir("/a"));
        assert!(tree.is_dir("/a/b"));
        assert!(tree.is_dir("/a/b/c"));
        assert_eq!(tree.list_dir("/a", 0, 0, true, true).unwrap().total, 1);
        assert_eq!(tree.list_dir("/a/b/c", 0, 0, true, true).unwrap().total, 0);
        assert_eq!(
            journal_records(&tmp),
            vec![EditRecord::Makedirs {
                path: "/a/b/c".to_string()
            }]
        );
    }

    #[test]
    fn test_makedirs_through_file_fails() {
        let (mut tree, _) = ready_tree(StaticNodes::new(&[1]));
        tree.create("/a/f", meta("f", 10, &[&[1]])).unwrap();
        assert!(matches!(
            tree.makedirs("/a/f/g"),
            Err(DfsError::ConflictingFileExists(_))
        ));
        assert!(matches!(
            tree.create("/a/f/g", meta("g", 10, &[&[1]])),
            Err(DfsError::ConflictingFileExists(_))
        ));
        assert!(matches!(
            tree.makedirs("relative/path"),
            Err(DfsError::InvalidPath(_))
        ));
    }

    #[test]
    fn test_create_makes_parent_and_rejects_duplicate() {
        let (mut tree, _) = ready_tree(StaticNodes::new(&[1, 2]));
        let created = tree.create("/a/f.txt", meta("f1", 150, &[&[1, 2], &[2, 1]])).unwrap();
        assert!(tree.is_dir("/a"));
        assert!(tree.is_file("/a/f.txt"));
        assert_eq!(created.current_replica, 2);
        assert!(created.ctime > 0);
        assert_eq!(tree.get_file_info("/a/f.txt").unwrap(), created);

        assert!(matches!(
            tree.create("/a/f.txt", meta("f2", 1, &[&[1]])),
            Err(DfsError::SameNameExists(_))
        ));
        assert!(matches!(
            tree.create("/a/", meta("f3", 1, &[&[1]])),
            Err(DfsError::InvalidPath(_))
        ));
        assert!(matches!(
            tree.create("/", meta("f4", 1, &[&[1]])),
            Err(DfsError::InvalidPath(_))
        ));
    }

    #[test]
    fn test_current_replica_is_weakest_block() {
        let (mut tree, _) = ready_tree(StaticNodes::new(&[1, 2, 3]));
        let created = tree
            .create("/f", meta("f", 200, &[&[1, 2, 3], &[2]]))
            .unwrap();
        assert_eq!(created.replica, 3);
        assert_eq!(created.current_replica, 1);
    }

    #[test]
    fn test_delete_file_fans_out_to_known_nodes() {
        let nodes = StaticNodes::new(&[1, 2]);
        nodes.set_known(&[1, 2, 3]);
        let (mut tree, tasks) = ready_tree(nodes);
        tree.create("/a/f", meta("f", 10, &[&[1]])).unwrap();

        assert_eq!(tree.delete("/a/f").unwrap(), 1);
        assert!(!tree.exists("/a/f"));
        assert_eq!(tree.file_count(), 0);
        for node in [1, 2, 3] {
            assert_eq!(tasks.snapshot(node), vec![Task::delete_file("f")]);
        }
        assert!(matches!(tree.delete("/a/f"), Err(DfsError::FileNotExists(_))));
        assert!(matches!(tree.delete("/"), Err(DfsError::InvalidPath(_))));
    }

    #[test]
    fn test_delete_directory_enqueues_every_descendant() {
        let nodes = StaticNodes::new(&[1]);
        nodes.set_known(&[1, 2]);
        let (mut tree, tasks) = ready_tree(nodes);
        tree.create("/d/x", meta("x", 1, &[&[1]])).unwrap();
        tree.create("/d/sub/y", meta("y", 1, &[&[1]])).unwrap();
        tree.create("/d/sub/deeper/z", meta("z", 1, &[&[1]])).unwrap();
        tree.create("/keep", meta("k", 1, &[&[1]])).unwrap();
        tree.makedirs("/d/empty").unwrap();

        assert_eq!(tree.delete("/d").unwrap(), 3);
        assert!(!tree.exists("/d"));
        assert!(tree.is_file("/keep"));
        for node in [1, 2] {
            let mut ids: Vec<String> = tasks
                .snapshot(node)
                .into_iter()
                .map(|t| {
                    assert_eq!(t.command, TaskCommand::Delete);
                    t.file_id
                })
                .collect();
            ids.sort();
            assert_eq!(ids, vec!["x", "y", "z"]);
        }
    }

    #[test]
    fn test_rename() {
        let (mut tree, _) = ready_tree(StaticNodes::new(&[1]));
        tree.create("/a/f", meta("f", 1, &[&[1]])).unwrap();
        tree.create("/a/g", meta("g", 1, &[&[1]])).unwrap();

        tree.rename("/a/f", "h").unwrap();
        assert!(!tree.exists("/a/f"));
        assert_eq!(tree.get_file_info("/a/h").unwrap().id, "f");

        assert!(matches!(tree.rename("/a/h", "x/y"), Err(DfsError::InvalidName(_))));
        assert!(matches!(tree.rename("/a/h", ""), Err(DfsError::InvalidName(_))));
        assert!(matches!(tree.rename("/a/h", "g"), Err(DfsError::SameNameExists(_))));
        assert!(matches!(tree.rename("/a/zz", "q"), Err(DfsError::FileNotExists(_))));

        tree.rename("/a", "b").unwrap();
        assert!(tree.is_file("/b/h"));
    }

    #[test]
    fn test_move() {
        let (mut tree, _) = ready_tree(StaticNodes::new(&[1]));
        tree.create("/src/f", meta("f", 1, &[&[1]])).unwrap();
        tree.create("/dst/f2", meta("f2", 1, &[&[1]])).unwrap();
        tree.makedirs("/dst/sub").unwrap();

        tree.move_to("/src/f", "/dst").unwrap();
        assert!(tree.is_file("/dst/f"));
        assert!(!tree.exists("/src/f"));

        tree.move_to("/dst/sub", "/").unwrap();
        assert!(tree.is_dir("/sub"));

        assert!(matches!(tree.move_to("/nope", "/dst"), Err(DfsError::SourceNotExists(_))));
        assert!(matches!(tree.move_to("/dst/f", "/nope"), Err(DfsError::TargetNotExists(_))));
        assert!(matches!(
            tree.move_to("/dst/f", "/dst/f2"),
            Err(DfsError::TargetMustBeDirectory(_))
        ));
        tree.create("/src/f", meta("f3", 1, &[&[1]])).unwrap();
        assert!(matches!(tree.move_to("/src/f", "/dst"), Err(DfsError::SameNameExists(_))));
        assert!(matches!(tree.move_to("/dst", "/dst/sub2"), Err(DfsError::TargetNotExists(_))));
        tree.makedirs("/dst/inner").unwrap();
        assert!(matches!(tree.move_to("/dst", "/dst/inner"), Err(DfsError::InvalidPath(_))));
        assert!(tree.is_dir("/dst/inner"));
    }

    #[test]
    fn test_list_dir_ordering_filters_and_paging() {
        let (mut tree, _) = ready_tree(StaticNodes::new(&[1]));
        tree.create("/d/b.txt", meta("b", 5, &[&[1]])).unwrap();
        tree.create("/d/a.txt", meta("a", 7, &[&[1]])).unwrap();
        tree.makedirs("/d/zdir").unwrap();
        tree.makedirs("/d/cdir").unwrap();

        let all = tree.list_dir("/d", 0, 0, true, true).unwrap();
        let names: Vec<&str> = all.entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["cdir", "zdir", "a.txt", "b.txt"]);
        assert_eq!(all.total, 4);
        assert_eq!(all.entries[2].size, 7);
        assert_eq!(all.entries[2].id, "a");

        let page = tree.list_dir("/d", 1, 2, true, true).unwrap();
        assert_eq!(page.total, 4);
        let names: Vec<&str> = page.entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["zdir", "a.txt"]);

        let clamped = tree.list_dir("/d", -5, -1, true, true).unwrap();
        assert_eq!(clamped.entries.len(), 4);

        let files_only = tree.list_dir("/d", 0, 0, true, false).unwrap();
        assert_eq!(files_only.total, 2);
        assert!(files_only.entries.iter().all(|e| e.kind == EntryKind::File));

        let dirs_only = tree.list_dir("/d", 0, 0, false, true).unwrap();
        assert_eq!(dirs_only.total, 2);

        assert!(matches!(
            tree.list_dir("/d/a.txt", 0, 0, true, true),
            Err(DfsError::TargetMustBeDirectory(_))
        ));
        assert!(matches!(
            tree.list_dir("/none", 0, 0, true, true),
            Err(DfsError::FileNotExists(_))
        ));
    }

    #[test]
    fn test_update_replica_grow() {
        let (mut tree, tasks) = ready_tree(StaticNodes::new(&[1, 2, 3]));
        tree.create("/f", meta("f", 200, &[&[1], &[2]])).unwrap();

        let updated = tree.update_replica("/f", 3).unwrap();
        assert_eq!(updated.replica, 3);
        assert_eq!(updated.current_replica, 3);
        for block in &updated.blocks {
            let mut holders = block.holders.clone();
            holders.sort();
            assert_eq!(holders, vec![1, 2, 3]);
        }

        // block 0 is only on node 1 and block 1 only on node 2: each gets one replicate task
        let t1 = tasks.snapshot(1);
        let t2 = tasks.snapshot(2);
        assert_eq!(t1.len(), 1);
        assert_eq!(t2.len(), 1);
        assert_eq!(t1[0].command, TaskCommand::Replicate);
        assert_eq!(t1[0].block, Some(0));
        assert_eq!(t1[0].ids.len(), 2);
        assert_eq!(t2[0].block, Some(1));
        assert_eq!(t2[0].ids.len(), 2);
        assert!(tasks.snapshot(3).is_empty());
        assert_eq!(tree.get_file_info("/f").unwrap(), updated);
    }

    #[test]
    fn test_update_replica_shrink() {
        let (mut tree, tasks) = ready_tree(StaticNodes::new(&[1, 2, 3]));
        tree.create("/f", meta("f", 100, &[&[1, 2, 3]])).unwrap();

        let updated = tree.update_replica("/f", 1).unwrap();
        assert_eq!(updated.current_replica, 1);
        assert_eq!(updated.blocks[0].holders.len(), 1);
        let deletes: Vec<Task> = [1, 2, 3].iter().flat_map(|n| tasks.snapshot(*n)).collect();
        assert_eq!(deletes.len(), 2);
        for task in deletes {
            assert_eq!(task, Task::delete_block("f", 0));
        }
    }

    #[test]
    fn test_update_replica_guards() {
        let nodes = StaticNodes::new(&[1, 2]);
        let (mut tree, _) = ready_tree(nodes.clone());
        tree.create("/f", meta("f", 100, &[&[1]])).unwrap();
        tree.makedirs("/d").unwrap();

        assert!(matches!(tree.update_replica("/f", 3), Err(DfsError::NoUsableNode(_))));
        assert!(matches!(tree.update_replica("/f", 0), Err(DfsError::InvalidParam(_))));
        assert!(matches!(tree.update_replica("/d", 1), Err(DfsError::FileNotExists(_))));
        nodes.set_live(&[]);
        assert!(matches!(tree.update_replica("/f", 1), Err(DfsError::AllNodesOffline(_))));
    }

    #[test]
    fn test_update_replica_skips_full_nodes() {
        let nodes = StaticNodes::new(&[1, 2, 3]);
        nodes.set_full(&[3]);
        let (mut tree, tasks) = ready_tree(nodes);
        tree.create("/f", meta("f", 100, &[&[1]])).unwrap();

        let updated = tree.update_replica("/f", 3).unwrap();
        assert_eq!(updated.blocks[0].holders, vec![1, 2]);
        assert_eq!(updated.current_replica, 2);
        assert_eq!(tasks.snapshot(1)[0].ids, vec![2]);
    }

    #[test]
    fn test_every_mutation_is_journaled() {
        let tmp = TempDir::new().unwrap();
        let mut tree = journaled_tree(&tmp);
        tree.create("/a/f", meta("f", 10, &[&[1]])).unwrap();
        tree.rename("/a/f", "g").unwrap();
        tree.makedirs("/b").unwrap();
        tree.move_to("/a/g", "/b").unwrap();
        tree.update_replica("/b/g", 1).unwrap();
        tree.delete("/b").unwrap();
        // failed calls leave no trace
        assert!(tree.delete("/b").is_err());

        let ops: Vec<&'static str> = journal_records(&tmp)
            .iter()
            .map(|r| match r {
                EditRecord::Create { .. } => "create",
                EditRecord::Makedirs { .. } => "makedirs",
                EditRecord::Delete { .. } => "delete",
                EditRecord::Rename { .. } => "rename",
                EditRecord::Move { .. } => "move",
                EditRecord::Update { .. } => "update",
            })
            .collect();
        assert_eq!(
            ops,
            vec!["create", "rename", "makedirs", "move", "update", "delete"]
        );
    }

    #[test]
    fn test_failed_journal_append_leaves_tree_unchanged() {
        let tmp = TempDir::new().unwrap();
        let (mut tree, tasks) = ready_tree(StaticNodes::new(&[1, 2]));
        tree.create("/keep/f", meta("f", 10, &[&[1]])).unwrap();
        let journal = AppendLog::open_read_only(tmp.path().join("editlog")).unwrap();
        tree.replace_journal(Some(journal));

        assert!(matches!(
            tree.create("/a/g", meta("g", 10, &[&[1]])),
            Err(DfsError::PersistenceFailure(_))
        ));
        assert!(!tree.exists("/a/g"));
        assert!(!tree.exists("/a"));
        assert!(matches!(
            tree.makedirs("/x/y"),
            Err(DfsError::PersistenceFailure(_))
        ));
        assert!(!tree.exists("/x"));
        assert!(matches!(
            tree.rename("/keep/f", "h"),
            Err(DfsError::PersistenceFailure(_))
        ));
        assert!(matches!(
            tree.update_replica("/keep/f", 2),
            Err(DfsError::PersistenceFailure(_))
        ));
        assert_eq!(tree.get_file_info("/keep/f").unwrap().replica, 1);
        assert!(matches!(
            tree.delete("/keep"),
            Err(DfsError::PersistenceFailure(_))
        ));
        assert!(tree.is_file("/keep/f"));
        assert_eq!(tree.file_count(), 1);
        assert_eq!(tasks.total_pending(), 0);
        assert!(journal_records(&tmp).is_empty());
    }

    #[test]
    fn test_replay_reproduces_state_without_tasks() {
        let tmp = TempDir::new().unwrap();
        let mut tree = journaled_tree(&tmp);
        tree.create("/a/f", meta("f", 10, &[&[1]])).unwrap();
        tree.create("/a/g", meta("g", 10, &[&[1]])).unwrap();
        tree.rename("/a/f", "f2").unwrap();
        tree.makedirs("/b/c").unwrap();
        tree.move_to("/a/f2", "/b").unwrap();
        tree.delete("/a/g").unwrap();

        let tasks = Arc::new(TaskQueue::new());
        let mut replayed = FileSystemTree::new(tasks.clone(), StaticNodes::new(&[1]));
        replayed.begin_recovery();
        for record in journal_records(&tmp) {
            replayed.replay_record(record).unwrap();
        }
        assert_eq!(replayed.files_by_path(), tree.files_by_path());
        assert_eq!(replayed.snapshot_records(), tree.snapshot_records());
        assert_eq!(tasks.total_pending(), 0);
    }

    #[test]
    fn test_legacy_makedir_record() {
        let record: EditRecord = serde_json::from_str(r#"{"op":"makedir","path":"/x"}"#).unwrap();
        assert_eq!(
            record,
            EditRecord::Makedirs {
                path: "/x".to_string()
            }
        );
    }

    #[test]
    fn test_snapshot_records_shape() {
        let (mut tree, _) = ready_tree(StaticNodes::new(&[1]));
        tree.create("/a/f", meta("f", 1, &[&[1]])).unwrap();
        tree.makedirs("/a/empty").unwrap();
        tree.makedirs("/z").unwrap();

        let records = tree.snapshot_records();
        assert_eq!(records.len(), 3);
        assert_eq!(
            records[0],
            EditRecord::Makedirs {
                path: "/a/empty".to_string()
            }
        );
        assert!(matches!(&records[1], EditRecord::Create { path, .. } if path == "/a/f"));
        assert_eq!(
            records[2],
            EditRecord::Makedirs {
                path: "/z".to_string()
            }
        );
    }
}
