//! The set of watched script addresses and their sync cursors.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::thread;

use crossbeam_channel::Sender;
use scrydb_consensus::Hash256;
use scrydb_log::{log_info, log_warn};
use scrydb_script::{ScriptAddr, SCRIPT_ADDR_LEN};
use scrydb_storage::{Column, KeyValueStore, StoreError, WriteBatch};

use crate::records::StoredScriptHistory;
use crate::scanner::ScanError;

/// The filter's view into the supervisor. Handed in by handle so the
/// filter can trigger scans without owning the machinery.
pub trait FilterHooks: Send + Sync {
    fn is_running(&self) -> bool;
    /// Scans `[start, end]` against the current filter contents and
    /// returns the top scanned block hash.
    fn apply_block_range(&self, start: u32, end: u32) -> Result<Hash256, ScanError>;
    fn current_top_height(&self) -> u32;
    /// Drops the aggregated history of the given addresses.
    fn wipe_ssh(&self, addrs: &[ScriptAddr]) -> Result<(), StoreError>;
}

/// Watched addresses with the height each one is synced to. Persisted one
/// `SSH` row per address; append-mostly at runtime.
pub struct ScrAddrFilter {
    addrs: RwLock<HashMap<ScriptAddr, u32>>,
}

impl Default for ScrAddrFilter {
    fn default() -> Self {
        Self::new()
    }
}

impl ScrAddrFilter {
    pub fn new() -> Self {
        Self {
            addrs: RwLock::new(HashMap::new()),
        }
    }

    /// Loads the persistent set from the `SSH` sub-db.
    pub fn load<S: KeyValueStore>(&self, store: &S) -> Result<usize, StoreError> {
        let mut map = self.addrs.write().expect("scraddr lock");
        map.clear();
        let rows = store.scan_prefix(Column::Ssh, &[])?;
        for (key, value) in rows {
            if key.len() != SCRIPT_ADDR_LEN {
                continue; // the info record
            }
            let Ok(summary) = StoredScriptHistory::decode(&value) else {
                log_warn!("undecodable ssh row, dropping it from the filter");
                continue;
            };
            let mut addr = [0u8; SCRIPT_ADDR_LEN];
            addr.copy_from_slice(&key);
            map.insert(addr, summary.sync_height);
        }
        Ok(map.len())
    }

    pub fn contains(&self, addr: &ScriptAddr) -> bool {
        self.addrs.read().expect("scraddr lock").contains_key(addr)
    }

    pub fn len(&self) -> usize {
        self.addrs.read().expect("scraddr lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn addresses(&self) -> Vec<ScriptAddr> {
        self.addrs
            .read()
            .expect("scraddr lock")
            .keys()
            .copied()
            .collect()
    }

    pub fn sync_height(&self, addr: &ScriptAddr) -> Option<u32> {
        self.addrs.read().expect("scraddr lock").get(addr).copied()
    }

    pub fn min_sync_height(&self) -> Option<u32> {
        self.addrs
            .read()
            .expect("scraddr lock")
            .values()
            .min()
            .copied()
    }

    /// Marks every watched address as synced to `height`.
    pub fn set_all_synced(&self, height: u32) {
        let mut map = self.addrs.write().expect("scraddr lock");
        for sync in map.values_mut() {
            *sync = height;
        }
    }

    /// Resets every sync cursor, as after a history wipe.
    pub fn reset_sync_heights(&self) {
        self.set_all_synced(0);
    }

    /// Writes an `SSH` row for every in-memory address that has none,
    /// carrying its sync cursor and empty aggregates.
    pub fn reapply<S: KeyValueStore + ?Sized>(&self, store: &S) -> Result<(), StoreError> {
        let map = self.addrs.read().expect("scraddr lock");
        let mut batch = WriteBatch::new();
        for (addr, sync) in map.iter() {
            if store.get(Column::Ssh, addr)?.is_some() {
                continue;
            }
            let summary = StoredScriptHistory {
                sync_height: *sync,
                ..Default::default()
            };
            batch.put(Column::Ssh, *addr, summary.encode());
        }
        store.write_batch(&batch)
    }

    /// Registers a batch of addresses.
    ///
    /// New addresses need no history and sync to the current top at once.
    /// Historical ones trigger a bounded side scan of
    /// `[min(sync-heights), top]`; `done` fires after that scan commits.
    /// Re-registering a known address as historical wipes its aggregates
    /// first so the side scan rebuilds them.
    pub fn register_batch(
        self: &Arc<Self>,
        store: Arc<dyn KeyValueStore>,
        hooks: Arc<dyn FilterHooks>,
        batch: Vec<ScriptAddr>,
        is_new: bool,
        done: Sender<bool>,
    ) -> Result<(), StoreError> {
        if !hooks.is_running() {
            // offline registration: picked up by the next init scan
            {
                let mut map = self.addrs.write().expect("scraddr lock");
                for addr in &batch {
                    map.entry(*addr).or_insert(0);
                }
            }
            self.reapply(store.as_ref())?;
            let _ = done.send(false);
            return Ok(());
        }

        let top = hooks.current_top_height();

        if is_new {
            {
                let mut map = self.addrs.write().expect("scraddr lock");
                for addr in &batch {
                    map.entry(*addr).or_insert(top);
                }
            }
            self.reapply(store.as_ref())?;
            let _ = done.send(true);
            return Ok(());
        }

        let known: Vec<ScriptAddr> = {
            let map = self.addrs.read().expect("scraddr lock");
            batch
                .iter()
                .filter(|addr| map.contains_key(*addr))
                .copied()
                .collect()
        };
        if !known.is_empty() {
            hooks.wipe_ssh(&known)?;
            let mut map = self.addrs.write().expect("scraddr lock");
            for addr in &known {
                map.insert(*addr, 0);
            }
        }
        {
            let mut map = self.addrs.write().expect("scraddr lock");
            for addr in &batch {
                map.entry(*addr).or_insert(0);
            }
        }
        self.reapply(store.as_ref())?;

        let scan_from = {
            let map = self.addrs.read().expect("scraddr lock");
            batch
                .iter()
                .filter_map(|addr| map.get(addr))
                .min()
                .copied()
                .unwrap_or(0)
        };

        let filter = Arc::clone(self);
        let batch_addrs = batch;
        thread::Builder::new()
            .name("scraddr-side-scan".to_string())
            .spawn(move || {
                log_info!(
                    "side scan for {} registered addresses from height {}",
                    batch_addrs.len(),
                    scan_from
                );
                match hooks.apply_block_range(scan_from, hooks.current_top_height()) {
                    Ok(_) => {
                        let top = hooks.current_top_height();
                        let mut map = filter.addrs.write().expect("scraddr lock");
                        for addr in &batch_addrs {
                            map.insert(*addr, top);
                        }
                        drop(map);
                        let _ = done.send(true);
                    }
                    Err(err) => {
                        log_warn!("side scan failed: {err}");
                        let _ = done.send(false);
                    }
                }
            })
            .expect("spawn side scan thread");

        Ok(())
    }
}
