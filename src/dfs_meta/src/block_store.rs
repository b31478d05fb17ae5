use async_trait::async_trait;
use log::{debug, warn};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;

use crate::{DfsError, DfsResult};

/// Block api served by a data node.
#[async_trait]
pub trait BlockStore: Send + Sync {
    /// Persist one block and return its content checksum. `holders_remaining` are the nodes
    /// the block should be pushed on to after the local write.
    async fn store(
        &self,
        file_id: &str,
        block_index: u32,
        holders_remaining: &[u64],
        data: &[u8],
    ) -> DfsResult<String>;

    async fn fetch(&self, file_id: &str, block_index: u32) -> DfsResult<Vec<u8>>;

    /// Read `length` bytes at `offset` after verifying the block against `expected_checksum`.
    async fn range_fetch(
        &self,
        file_id: &str,
        block_index: u32,
        offset: u64,
        length: u64,
        expected_checksum: &str,
    ) -> DfsResult<Vec<u8>>;
}

/// Hex sha256 of one block.
pub fn block_checksum(data: &[u8]) -> String {
    format!("{:x}", Sha256::digest(data))
}

/// Whole-file checksum: hash over the concatenated block checksums in block order.
pub fn file_checksum<S: AsRef<str>>(block_checksums: &[S]) -> String {
    let mut hasher = Sha256::new();
    for checksum in block_checksums {
        hasher.update(checksum.as_ref().as_bytes());
    }
    format!("{:x}", hasher.finalize())
}

/// Blocks on local disk under `<root>/files/<id[0..2]>/<id[2..4]>/<id>_<index>.blk`.
pub struct LocalBlockStore {
    root: PathBuf,
}

impl LocalBlockStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn block_path(&self, file_id: &str, block_index: u32) -> DfsResult<PathBuf> {
        if file_id.len() < 4
            || !file_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(DfsError::InvalidParam(format!("bad file id: {}", file_id)));
        }
        Ok(self
            .root
            .join("files")
            .join(&file_id[0..2])
            .join(&file_id[2..4])
            .join(format!("{}_{}.blk", file_id, block_index)))
    }

    async fn read_block(&self, file_id: &str, block_index: u32) -> DfsResult<Vec<u8>> {
        let path = self.block_path(file_id, block_index)?;
        match fs::read(&path).await {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(DfsError::FileNotExists(
                format!("block {}_{}", file_id, block_index),
            )),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl BlockStore for LocalBlockStore {
    async fn store(
        &self,
        file_id: &str,
        block_index: u32,
        holders_remaining: &[u64],
        data: &[u8],
    ) -> DfsResult<String> {
        let path = self.block_path(file_id, block_index)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        // write beside the target then rename so readers never see a partial block
        let tmp_path = path.with_extension("blk.tmp");
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp_path)
            .await?;
        file.write_all(data).await?;
        file.sync_all().await?;
        drop(file);
        fs::rename(&tmp_path, &path).await?;

        let checksum = block_checksum(data);
        debug!(
            "block store: stored {}_{} ({} bytes), forward to {:?}",
            file_id,
            block_index,
            data.len(),
            holders_remaining
        );
        Ok(checksum)
    }

    async fn fetch(&self, file_id: &str, block_index: u32) -> DfsResult<Vec<u8>> {
        self.read_block(file_id, block_index).await
    }

    async fn range_fetch(
        &self,
        file_id: &str,
        block_index: u32,
        offset: u64,
        length: u64,
        expected_checksum: &str,
    ) -> DfsResult<Vec<u8>> {
        let data = self.read_block(file_id, block_index).await?;
        let actual = block_checksum(&data);
        if actual != expected_checksum {
            warn!(
                "block store: checksum mismatch on {}_{}: expect {}, got {}",
                file_id, block_index, expected_checksum, actual
            );
            return Err(DfsError::ChecksumMismatch(format!(
                "block {}_{}",
                file_id, block_index
            )));
        }
        let start = (offset as usize).min(data.len());
        let end = start.saturating_add(length as usize).min(data.len());
        Ok(data[start..end].to_vec())
    }
}
