//! Per-mount persistent handle database over the on-disk trie, with
//! handle generation for back-ends that cannot mint their own.

use std::path::Path;
use std::sync::Arc;

use byteorder::{BigEndian, ByteOrder};
use md5::{Digest, Md5};
use tokio::sync::Mutex;
use tokio::task;

use crate::bytetree::{ByteTree, TreeError};
use crate::error::{Error, Result};

/// Retries for lost compare-and-swap races.
const PUT_RETRIES: u32 = 10;

/// Width of a generated handle: the first eight digest bytes.
const GENERATED_LEN: usize = 8;

/// Handle → path map backed by a [`ByteTree`] directory.
///
/// Mutations serialize on an in-process mutex in addition to the trie's
/// on-disk lock, so the retry loop observes one consistent view. Lookups
/// are lock-free.
pub struct HandleDb {
    tree: Arc<ByteTree>,
    write_serial: Mutex<()>,
}

impl HandleDb {
    /// Opens (creating if needed) the database stored in `dir`.
    pub fn open(dir: &Path) -> Result<Self> {
        let tree = ByteTree::open(dir).map_err(Error::from)?;
        Ok(HandleDb { tree: Arc::new(tree), write_serial: Mutex::new(()) })
    }

    /// Stores `path` under `handle`, retrying lost races.
    pub async fn put(&self, handle: &[u8], path: &str) -> Result<()> {
        let _serial = self.write_serial.lock().await;
        self.put_serialized(handle, path).await
    }

    /// Resolves a handle to its stored path.
    pub async fn get(&self, handle: &[u8]) -> Result<String> {
        let tree = Arc::clone(&self.tree);
        let handle = handle.to_vec();
        task::spawn_blocking(move || tree.get(&handle))
            .await
            .map_err(Error::io)?
            .map_err(Into::into)
    }

    /// Derives a stable handle for `path`: the first eight bytes of
    /// MD5(path), probed forward with a big-endian +1 counter until an
    /// unused or already-matching slot is found.
    pub async fn generate(&self, path: &str) -> Result<Vec<u8>> {
        let _serial = self.write_serial.lock().await;

        let digest = Md5::digest(path.as_bytes());
        let mut handle = digest[..GENERATED_LEN].to_vec();
        loop {
            match self.get(&handle).await {
                Err(Error::NotFound) => {
                    self.put_serialized(&handle, path).await?;
                    return Ok(handle);
                }
                Ok(stored) if stored == path => return Ok(handle),
                Ok(_) => {
                    let counter = BigEndian::read_u64(&handle);
                    BigEndian::write_u64(&mut handle, counter.wrapping_add(1));
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn put_serialized(&self, handle: &[u8], path: &str) -> Result<()> {
        for _ in 0..PUT_RETRIES {
            let tree = Arc::clone(&self.tree);
            let handle = handle.to_vec();
            let path = path.to_owned();
            match task::spawn_blocking(move || tree.put(&handle, &path)).await.map_err(Error::io)? {
                Ok(()) => return Ok(()),
                Err(TreeError::HasValue) => continue,
                Err(err) => return Err(err.into()),
            }
        }
        Err(Error::io("handle database busy: too many compare-and-swap races"))
    }
}
