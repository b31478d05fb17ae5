use rand::seq::SliceRandom;
use rand::Rng;
use std::collections::HashSet;

use crate::fs_tree::Block;
use crate::{DfsError, DfsResult};

/// Split `file_size` into fixed-size blocks and pick `min(replica, nodes)` distinct holders
/// for each block, uniformly at random from `nodes`.
pub fn plan_blocks<R: Rng + ?Sized>(
    file_size: u64,
    block_size: u64,
    replica: u32,
    nodes: &[u64],
    rng: &mut R,
) -> DfsResult<Vec<Block>> {
    if block_size == 0 {
        return Err(DfsError::InvalidParam("block size must be positive".to_string()));
    }
    if nodes.is_empty() {
        return Err(DfsError::NoUsableNode("no node available for placement".to_string()));
    }
    let replica = (replica.max(1) as usize).min(nodes.len());

    let mut blocks = Vec::new();
    let mut remaining = file_size;
    let mut index = 0u32;
    while remaining > 0 {
        let size = remaining.min(block_size);
        let holders = nodes.choose_multiple(rng, replica).copied().collect();
        blocks.push(Block {
            index,
            size,
            holders,
            checksum: String::new(),
        });
        remaining -= size;
        index += 1;
    }
    Ok(blocks)
}

/// Outcome of resizing one block's holder set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlockRepair {
    /// Holder list after the change.
    pub holders: Vec<u64>,
    /// Existing holder asked to push the block to `targets`.
    pub source: Option<u64>,
    pub targets: Vec<u64>,
    /// Holders dropped from the block; each gets a block delete.
    pub removed: Vec<u64>,
    /// Holders wanted but not found.
    pub shortfall: usize,
}

/// Grow or shrink `holders` towards `new_replica` using only live nodes.
///
/// Dead holders are dropped from the result. A block without any live holder has no
/// source to replicate from, so it is returned unchanged with the whole request as shortfall.
pub fn repair_block<R: Rng + ?Sized>(
    holders: &[u64],
    live: &HashSet<u64>,
    usable: &[u64],
    new_replica: usize,
    rng: &mut R,
) -> BlockRepair {
    let old_holders: Vec<u64> = holders.iter().copied().filter(|id| live.contains(id)).collect();
    if old_holders.is_empty() {
        return BlockRepair {
            holders: holders.to_vec(),
            shortfall: new_replica,
            ..BlockRepair::default()
        };
    }

    let delta = new_replica as i64 - old_holders.len() as i64;
    let mut repair = BlockRepair {
        holders: old_holders.clone(),
        ..BlockRepair::default()
    };

    if delta > 0 {
        let wanted = delta as usize;
        let candidates: Vec<u64> = usable
            .iter()
            .copied()
            .filter(|id| !holders.contains(id))
            .collect();
        let targets: Vec<u64> = candidates.choose_multiple(rng, wanted).copied().collect();
        repair.shortfall = wanted - targets.len();
        if !targets.is_empty() {
            repair.source = old_holders.choose(rng).copied();
            repair.holders.extend(targets.iter().copied());
            repair.targets = targets;
        }
    } else if delta < 0 {
        let removed: Vec<u64> = old_holders
            .choose_multiple(rng, (-delta) as usize)
            .copied()
            .collect();
        repair.holders.retain(|id| !removed.contains(id));
        repair.removed = removed;
    }
    repair
}
