use std::collections::BTreeMap;
use std::sync::RwLock;

use crate::{Column, KeyValueStore, PrefixVisitor, StoreError, WriteBatch, WriteOp};

type MemoryStoreMap = BTreeMap<(Column, Vec<u8>), Vec<u8>>;

/// BTreeMap-backed store for tests and the `--db-integrity` style tooling.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<MemoryStoreMap>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Full ordered dump of one column, for byte-level comparisons in tests.
    pub fn dump_column(&self, column: Column) -> Vec<(Vec<u8>, Vec<u8>)> {
        let guard = self.inner.read().expect("memory store lock");
        guard
            .iter()
            .filter(|((entry_column, _), _)| *entry_column == column)
            .map(|((_, key), value)| (key.clone(), value.clone()))
            .collect()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, column: Column, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        let guard = self.inner.read().expect("memory store lock");
        Ok(guard.get(&(column, key.to_vec())).cloned())
    }

    fn put(&self, column: Column, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        let mut guard = self.inner.write().expect("memory store lock");
        guard.insert((column, key.to_vec()), value.to_vec());
        Ok(())
    }

    fn delete(&self, column: Column, key: &[u8]) -> Result<(), StoreError> {
        let mut guard = self.inner.write().expect("memory store lock");
        guard.remove(&(column, key.to_vec()));
        Ok(())
    }

    fn scan_prefix(
        &self,
        column: Column,
        prefix: &[u8],
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StoreError> {
        let guard = self.inner.read().expect("memory store lock");
        let mut results = Vec::new();
        for ((entry_column, key), value) in guard.iter() {
            if *entry_column == column && key.starts_with(prefix) {
                results.push((key.clone(), value.clone()));
            }
        }
        Ok(results)
    }

    fn for_each_prefix<'a>(
        &self,
        column: Column,
        prefix: &[u8],
        visitor: &mut PrefixVisitor<'a>,
    ) -> Result<(), StoreError> {
        let guard = self.inner.read().expect("memory store lock");
        for ((entry_column, key), value) in guard.iter() {
            if *entry_column == column && key.starts_with(prefix) {
                visitor(key, value)?;
            }
        }
        Ok(())
    }

    fn write_batch(&self, batch: &WriteBatch) -> Result<(), StoreError> {
        let mut guard = self.inner.write().expect("memory store lock");
        for op in batch.iter() {
            match op {
                WriteOp::Put { column, key, value } => {
                    guard.insert(
                        (*column, key.as_slice().to_vec()),
                        value.as_slice().to_vec(),
                    );
                }
                WriteOp::Delete { column, key } => {
                    guard.remove(&(*column, key.as_slice().to_vec()));
                }
            }
        }
        Ok(())
    }

    fn clear_column(&self, column: Column) -> Result<(), StoreError> {
        let mut guard = self.inner.write().expect("memory store lock");
        guard.retain(|(entry_column, _), _| *entry_column != column);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scan_prefix_is_ordered() {
        let store = MemoryStore::new();
        store.put(Column::Stxo, &[2, 1], b"b").expect("put");
        store.put(Column::Stxo, &[1, 9], b"a").expect("put");
        store.put(Column::Stxo, &[2, 2], b"c").expect("put");
        store.put(Column::Ssh, &[2, 0], b"other").expect("put");

        let all = store.scan_prefix(Column::Stxo, &[]).expect("scan");
        assert_eq!(all.len(), 3);
        assert!(all.windows(2).all(|pair| pair[0].0 < pair[1].0));

        let two = store.scan_prefix(Column::Stxo, &[2]).expect("scan");
        assert_eq!(two.len(), 2);
    }

    #[test]
    fn batch_applies_all_ops() {
        let store = MemoryStore::new();
        store.put(Column::Ssh, b"gone", b"x").expect("put");

        let mut batch = WriteBatch::new();
        batch.put(Column::Ssh, b"kept".as_slice(), b"y".as_slice());
        batch.delete(Column::Ssh, b"gone".as_slice());
        store.write_batch(&batch).expect("commit");

        assert!(store.get(Column::Ssh, b"gone").expect("get").is_none());
        assert_eq!(store.get(Column::Ssh, b"kept").expect("get"), Some(b"y".to_vec()));
    }

    #[test]
    fn clear_column_leaves_others() {
        let store = MemoryStore::new();
        store.put(Column::Ssh, b"a", b"1").expect("put");
        store.put(Column::History, b"a", b"2").expect("put");
        store.clear_column(Column::Ssh).expect("clear");
        assert!(store.get(Column::Ssh, b"a").expect("get").is_none());
        assert!(store.get(Column::History, b"a").expect("get").is_some());
    }
}
