use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use crate::membership::NodeDirectory;

/// Fixed node directory for tests that do not run the membership protocol.
#[derive(Default)]
pub(crate) struct StaticNodes {
    live: Mutex<Vec<u64>>,
    full: Mutex<HashSet<u64>>,
    known: Mutex<Vec<u64>>,
}

impl StaticNodes {
    pub(crate) fn new(live: &[u64]) -> Arc<Self> {
        Arc::new(Self {
            live: Mutex::new(live.to_vec()),
            full: Mutex::new(HashSet::new()),
            known: Mutex::new(live.to_vec()),
        })
    }

    pub(crate) fn set_live(&self, live: &[u64]) {
        *self.live.lock().unwrap() = live.to_vec();
    }

    pub(crate) fn set_full(&self, full: &[u64]) {
        *self.full.lock().unwrap() = full.iter().copied().collect();
    }

    pub(crate) fn set_known(&self, known: &[u64]) {
        *self.known.lock().unwrap() = known.to_vec();
    }
}

impl NodeDirectory for StaticNodes {
    fn live_node_ids(&self) -> Vec<u64> {
        self.live.lock().unwrap().clone()
    }

    fn usable_node_ids(&self, exclude_full: bool) -> Vec<u64> {
        let full = self.full.lock().unwrap();
        self.live
            .lock()
            .unwrap()
            .iter()
            .copied()
            .filter(|id| !exclude_full || !full.contains(id))
            .collect()
    }

    fn known_node_ids(&self) -> Vec<u64> {
        self.known.lock().unwrap().clone()
    }
}
