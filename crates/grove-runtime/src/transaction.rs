//! Staged writes committed as one atomic batch
//!
//! Every mutation of the forest is first staged in a [`StoreTransaction`].
//! Reads made while the transaction is open go through [`Staged`], which sees
//! the staged writes on top of the committed store. A dry run simply drops
//! the transaction; a real run hands it to [`StoreTransaction::commit`], which
//! turns it into a single backend batch so a crash cannot leave half a block
//! applied.
//!
//! Lists use the append-only layout `base/length` + `base/{i}`; list lengths
//! pending in the transaction are honoured, so several pushes to the same
//! list inside one block get consecutive slots.

use crate::error::{GroveError, GroveResult};
use crate::key_utils::{list_item_key, list_length_key};
use crate::traits::{BatchLike, KeyValueStoreLike};
use log::debug;
use std::collections::BTreeMap;

#[derive(Debug, Default, Clone)]
pub struct StoreTransaction {
    /// `None` marks a staged delete
    writes: BTreeMap<Vec<u8>, Option<Vec<u8>>>,
}

impl StoreTransaction {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put<K: AsRef<[u8]>, V: AsRef<[u8]>>(&mut self, key: K, value: V) {
        self.writes
            .insert(key.as_ref().to_vec(), Some(value.as_ref().to_vec()));
    }

    pub fn delete<K: AsRef<[u8]>>(&mut self, key: K) {
        self.writes.insert(key.as_ref().to_vec(), None);
    }

    pub fn batch_put<I>(&mut self, entries: I)
    where
        I: IntoIterator<Item = (Vec<u8>, Vec<u8>)>,
    {
        for (key, value) in entries {
            self.writes.insert(key, Some(value));
        }
    }

    /// The staged state of `key`: `Some(None)` is a pending delete
    pub fn staged(&self, key: &[u8]) -> Option<&Option<Vec<u8>>> {
        self.writes.get(key)
    }

    pub fn len(&self) -> usize {
        self.writes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.writes.is_empty()
    }

    /// Folds `other` in; its writes win over ours on conflicting keys
    pub fn merge(&mut self, other: StoreTransaction) {
        self.writes.extend(other.writes);
    }

    /// Appends `value` to the list at `base`, returning its slot
    pub fn push_to_list<T: KeyValueStoreLike>(
        &mut self,
        store: &T,
        base: &[u8],
        value: &[u8],
    ) -> GroveResult<u64> {
        let length = Staged::with(store, self).list_len(base)?;
        self.put(list_item_key(base, length), value);
        self.put(list_length_key(base), (length + 1).to_string());
        Ok(length)
    }

    pub fn batch_push<T, I>(&mut self, store: &T, entries: I) -> GroveResult<()>
    where
        T: KeyValueStoreLike,
        I: IntoIterator<Item = (Vec<u8>, Vec<u8>)>,
    {
        for (base, value) in entries {
            self.push_to_list(store, &base, &value)?;
        }
        Ok(())
    }

    /// Stages deletion of every slot of the list at `base`
    pub fn clear_list<T: KeyValueStoreLike>(&mut self, store: &T, base: &[u8]) -> GroveResult<()> {
        let length = Staged::with(store, self).list_len(base)?;
        for i in 0..length {
            self.delete(list_item_key(base, i));
        }
        self.delete(list_length_key(base));
        Ok(())
    }

    /// Writes every staged operation in one backend batch
    pub fn commit<T: KeyValueStoreLike>(self, store: &mut T) -> GroveResult<()> {
        if self.writes.is_empty() {
            return Ok(());
        }
        let count = self.writes.len();
        let mut batch = store.create_batch();
        for (key, value) in self.writes {
            match value {
                Some(value) => batch.put(key, value),
                None => batch.delete(key),
            }
        }
        store.write(batch).map_err(GroveError::storage)?;
        debug!("Committed transaction with {} operations", count);
        Ok(())
    }
}

/// Read view over a store, optionally layered under a pending transaction
pub struct Staged<'a, T: KeyValueStoreLike> {
    store: &'a T,
    tx: Option<&'a StoreTransaction>,
}

impl<'a, T: KeyValueStoreLike> Staged<'a, T> {
    pub fn direct(store: &'a T) -> Self {
        Self { store, tx: None }
    }

    pub fn with(store: &'a T, tx: &'a StoreTransaction) -> Self {
        Self {
            store,
            tx: Some(tx),
        }
    }

    pub fn get(&self, key: &[u8]) -> GroveResult<Option<Vec<u8>>> {
        if let Some(staged) = self.tx.and_then(|tx| tx.staged(key)) {
            return Ok(staged.clone());
        }
        self.store.get(key).map_err(GroveError::storage)
    }

    pub fn list_len(&self, base: &[u8]) -> GroveResult<u64> {
        match self.get(&list_length_key(base))? {
            Some(bytes) => String::from_utf8_lossy(&bytes)
                .parse::<u64>()
                .map_err(|e| GroveError::Serialization(format!("bad list length: {}", e))),
            None => Ok(0),
        }
    }

    pub fn get_list(&self, base: &[u8]) -> GroveResult<Vec<Vec<u8>>> {
        let length = self.list_len(base)?;
        let mut items = Vec::with_capacity(length as usize);
        for i in 0..length {
            let item = self.get(&list_item_key(base, i))?.ok_or_else(|| {
                GroveError::Storage(format!(
                    "list {} is missing slot {}",
                    String::from_utf8_lossy(base),
                    i
                ))
            })?;
            items.push(item);
        }
        Ok(items)
    }
}

/// Reads the committed list at `base`
pub fn get_list<T: KeyValueStoreLike>(store: &T, base: &[u8]) -> GroveResult<Vec<Vec<u8>>> {
    Staged::direct(store).get_list(base)
}
