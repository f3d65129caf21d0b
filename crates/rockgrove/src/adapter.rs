//! RocksDB implementation of KeyValueStoreLike

use anyhow::Result;
use grove_runtime::{BatchLike, KeyValueStoreLike};
use log::{debug, info};
use rocksdb::{Options, WriteBatch, DB};
use std::sync::Arc;

/// Store over a shared RocksDB handle. An optional namespace is prepended to
/// every key so several forests can live in one database.
#[derive(Clone)]
pub struct RocksDBStoreAdapter {
    pub db: Arc<DB>,
    namespace: Option<Vec<u8>>,
}

#[inline]
fn namespaced(namespace: &Option<Vec<u8>>, key: &[u8]) -> Vec<u8> {
    match namespace {
        Some(prefix) => {
            let mut result = Vec::with_capacity(prefix.len() + key.len());
            result.extend_from_slice(prefix);
            result.extend_from_slice(key);
            result
        }
        None => key.to_vec(),
    }
}

impl RocksDBStoreAdapter {
    /// Create a new adapter from an existing DB handle
    pub fn from_db(db: Arc<DB>) -> Self {
        Self {
            db,
            namespace: None,
        }
    }

    /// Same database, keys confined under `namespace`
    pub fn with_namespace(&self, namespace: &str) -> Self {
        Self {
            db: self.db.clone(),
            namespace: Some(format!("{}://", namespace).into_bytes()),
        }
    }

    pub fn open(path: &str, opts: Options) -> Result<Self> {
        let db = DB::open(&opts, path)?;
        info!("Opened RocksDB at {}", path);
        Ok(Self::from_db(Arc::new(db)))
    }

    /// Options tuned for many small point reads and large atomic batches
    pub fn get_optimized_options() -> Options {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.set_write_buffer_size(256 * 1024 * 1024);
        opts.set_max_write_buffer_number(4);
        opts.increase_parallelism(num_cpus::get() as i32);
        opts
    }

    pub fn open_optimized(path: &str) -> Result<Self> {
        Self::open(path, Self::get_optimized_options())
    }

    fn key(&self, key: &[u8]) -> Vec<u8> {
        namespaced(&self.namespace, key)
    }
}

/// Write batch that prefixes keys with the namespace of the adapter that
/// created it
pub struct RocksDBBatch {
    pub batch: WriteBatch,
    namespace: Option<Vec<u8>>,
}

impl BatchLike for RocksDBBatch {
    fn default() -> Self {
        Self {
            batch: WriteBatch::default(),
            namespace: None,
        }
    }

    fn put<K: AsRef<[u8]>, V: AsRef<[u8]>>(&mut self, k: K, v: V) {
        self.batch.put(namespaced(&self.namespace, k.as_ref()), v);
    }

    fn delete<K: AsRef<[u8]>>(&mut self, k: K) {
        self.batch.delete(namespaced(&self.namespace, k.as_ref()));
    }
}

impl KeyValueStoreLike for RocksDBStoreAdapter {
    type Batch = RocksDBBatch;
    type Error = rocksdb::Error;

    fn write(&mut self, batch: RocksDBBatch) -> Result<(), Self::Error> {
        let count = batch.batch.len();
        self.db.write(batch.batch)?;
        debug!("rocksdb applied batch of {} operations", count);
        Ok(())
    }

    fn get<K: AsRef<[u8]>>(&self, key: K) -> Result<Option<Vec<u8>>, Self::Error> {
        self.db.get(self.key(key.as_ref()))
    }

    fn put<K: AsRef<[u8]>, V: AsRef<[u8]>>(&mut self, key: K, value: V) -> Result<(), Self::Error> {
        self.db.put(self.key(key.as_ref()), value.as_ref())
    }

    fn delete<K: AsRef<[u8]>>(&mut self, key: K) -> Result<(), Self::Error> {
        self.db.delete(self.key(key.as_ref()))
    }

    fn scan_prefix<K: AsRef<[u8]>>(
        &self,
        prefix: K,
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>, Self::Error> {
        let mut results = Vec::new();
        let prefix_bytes = self.key(prefix.as_ref());
        let strip = self.namespace.as_ref().map(|ns| ns.len()).unwrap_or(0);

        let mut iter = self.db.raw_iterator();
        iter.seek(&prefix_bytes);

        while iter.valid() {
            if let Some(key) = iter.key() {
                if !key.starts_with(&prefix_bytes) {
                    break;
                }
                if let Some(value) = iter.value() {
                    results.push((key[strip..].to_vec(), value.to_vec()));
                }
            }
            iter.next();
        }
        iter.status()?;

        Ok(results)
    }

    fn create_batch(&self) -> Self::Batch {
        RocksDBBatch {
            batch: WriteBatch::default(),
            namespace: self.namespace.clone(),
        }
    }
}
