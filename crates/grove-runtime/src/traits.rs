//! Core traits for generic key-value storage backends

/// Trait for batch operations on key-value stores
pub trait BatchLike {
    fn put<K: AsRef<[u8]>, V: AsRef<[u8]>>(&mut self, key: K, value: V);
    fn delete<K: AsRef<[u8]>>(&mut self, key: K);
    fn default() -> Self;
}

/// Generic trait for key-value storage backends
///
/// The forest only needs point reads, prefix scans and atomic batches. A
/// batch passed to [`KeyValueStoreLike::write`] must become visible to
/// readers all at once; every tree mutation relies on that to keep proof
/// reads consistent with the committed root.
pub trait KeyValueStoreLike {
    type Error: std::fmt::Debug + Send + Sync + std::error::Error + 'static;
    type Batch: BatchLike;

    /// Write a batch of operations to the store atomically
    fn write(&mut self, batch: Self::Batch) -> Result<(), Self::Error>;

    /// Get a value by key
    fn get<K: AsRef<[u8]>>(&self, key: K) -> Result<Option<Vec<u8>>, Self::Error>;

    /// Put a single key-value pair
    fn put<K, V>(&mut self, key: K, value: V) -> Result<(), Self::Error>
    where
        K: AsRef<[u8]>,
        V: AsRef<[u8]>;

    /// Delete a key
    fn delete<K: AsRef<[u8]>>(&mut self, key: K) -> Result<(), Self::Error>;

    /// Scan keys with a given prefix, returning key-value pairs sorted by key
    fn scan_prefix<K: AsRef<[u8]>>(&self, prefix: K) -> Result<Vec<(Vec<u8>, Vec<u8>)>, Self::Error>;

    /// Create a new batch for atomic operations
    fn create_batch(&self) -> Self::Batch;

    /// Check if the store is open/connected
    fn is_open(&self) -> bool {
        true
    }
}
