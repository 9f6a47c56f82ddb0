//! Persistent byte-keyed radix trie mapping binary handles to path
//! strings.
//!
//! Two append-only files live in the tree's directory:
//!
//! * `inodes.db`: 257-slot nodes of little-endian i64. Slots 0..=255
//!   branch on the next key byte; slot 256 marks a key ending exactly at
//!   this node. A slot holds 0 (empty), a positive child-node offset, or
//!   a negative encoded record offset (`-v` means record `v - 1`).
//! * `files.db`: a log of `[u32 be handle_len][u32 be path_len][handle]
//!   [path]` records.
//!
//! Mutations are single 8-byte in-place slot writes guarded by the
//! advisory lock; reads are lock-free because unpublished nodes are
//! pre-zeroed and every compare-and-swap re-reads under the lock. Both
//! files are opened with synchronous-write semantics so a committed slot
//! is on media before the write returns.

mod lock;

use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use byteorder::{BigEndian, ByteOrder, LittleEndian};
use thiserror::Error;

use crate::error::Error;

/// Branch slots plus the terminal slot.
const SLOTS: u64 = 257;
const SLOT_SIZE: u64 = 8;
const NODE_SIZE: u64 = SLOTS * SLOT_SIZE;
const TERMINAL_SLOT: u64 = 256;

/// Upper bound applied to record header lengths while decoding; a longer
/// field means the log is corrupt.
const MAX_FIELD_LEN: u32 = 1 << 20;

/// Errors local to the trie. `HasValue` and `LockHeld` are retryable;
/// the handle database converts the rest into the public taxonomy.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TreeError {
    #[error("no value stored for this key")]
    NotFound,
    #[error("slot holds another value")]
    HasValue,
    #[error("advisory lock held by another process")]
    LockHeld,
    #[error("i/o error: {0}")]
    Io(String),
}

impl From<io::Error> for TreeError {
    fn from(err: io::Error) -> Self {
        TreeError::Io(err.to_string())
    }
}

impl From<TreeError> for Error {
    fn from(err: TreeError) -> Self {
        match err {
            TreeError::NotFound => Error::NotFound,
            other => Error::Io(other.to_string()),
        }
    }
}

pub type TreeResult<T> = Result<T, TreeError>;

/// One stored mapping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub handle: Vec<u8>,
    pub path: String,
}

/// The on-disk trie. Safe to share between threads and processes; all
/// methods take `&self` and mutations serialize on the advisory lock.
pub struct ByteTree {
    inodes: File,
    files: File,
    inodes_path: PathBuf,
}

impl ByteTree {
    /// Opens (creating if needed) the trie stored in `dir`.
    pub fn open(dir: &Path) -> TreeResult<Self> {
        std::fs::create_dir_all(dir)?;
        let inodes_path = dir.join("inodes.db");
        let inodes = open_sync(&inodes_path)?;
        let files = open_sync(&dir.join("files.db"))?;

        // seed the root node; concurrent seeding writes identical zeros
        if inodes.metadata()?.len() < NODE_SIZE {
            inodes.write_all_at(&[0u8; NODE_SIZE as usize], 0)?;
        }

        Ok(ByteTree { inodes, files, inodes_path })
    }

    /// Stores `path` under `handle`, replacing any previous mapping.
    ///
    /// Returns [`TreeError::HasValue`] when a concurrent writer won a
    /// compare-and-swap race; callers retry.
    pub fn put(&self, handle: &[u8], path: &str) -> TreeResult<()> {
        let mut node = 0u64;
        let mut i = 0;
        while i < handle.len() {
            let slot = node + handle[i] as u64 * SLOT_SIZE;
            let ptr = self.read_slot(slot)?;
            if ptr > 0 {
                node = ptr as u64;
                i += 1;
            } else if ptr == 0 {
                let record = self.append_record(handle, path)?;
                return self.write_cas(slot, 0, encode_record(record));
            } else {
                let stored = self.read_record(decode_record(ptr))?;
                if stored.handle == handle {
                    if stored.path == path {
                        return Ok(());
                    }
                    let record = self.append_record(handle, path)?;
                    return self.write_cas(slot, ptr, encode_record(record));
                }
                // the stored key shares our prefix: push its record one
                // level down and descend into the fresh node
                let new_node = self.new_node_offset()?;
                let next = if stored.handle.len() == i + 1 {
                    TERMINAL_SLOT * SLOT_SIZE
                } else {
                    stored.handle[i + 1] as u64 * SLOT_SIZE
                };
                self.write_cas(new_node + next, 0, ptr)?;
                self.write_cas(slot, ptr, new_node as i64)?;
                node = new_node;
                i += 1;
            }
        }

        let slot = node + TERMINAL_SLOT * SLOT_SIZE;
        let ptr = self.read_slot(slot)?;
        if ptr < 0 && self.read_record(decode_record(ptr))?.path == path {
            return Ok(());
        }
        let record = self.append_record(handle, path)?;
        self.write_cas(slot, ptr, encode_record(record))
    }

    /// Looks up the path stored under `handle`.
    ///
    /// A negative slot only promises that *some* key reaches this node;
    /// the stored handle is compared in full before answering.
    pub fn get(&self, handle: &[u8]) -> TreeResult<String> {
        let mut node = 0u64;
        for &byte in handle {
            let slot = node + byte as u64 * SLOT_SIZE;
            let ptr = self.read_slot(slot)?;
            if ptr > 0 {
                node = ptr as u64;
            } else if ptr == 0 {
                return Err(TreeError::NotFound);
            } else {
                let stored = self.read_record(decode_record(ptr))?;
                if stored.handle == handle {
                    return Ok(stored.path);
                }
                return Err(TreeError::NotFound);
            }
        }

        let ptr = self.read_slot(node + TERMINAL_SLOT * SLOT_SIZE)?;
        if ptr < 0 {
            let stored = self.read_record(decode_record(ptr))?;
            if stored.handle == handle {
                return Ok(stored.path);
            }
        }
        Err(TreeError::NotFound)
    }

    fn read_slot(&self, offset: u64) -> TreeResult<i64> {
        let mut buf = [0u8; SLOT_SIZE as usize];
        self.inodes.read_exact_at(&mut buf, offset)?;
        Ok(LittleEndian::read_i64(&buf))
    }

    /// Re-reads the slot under the lock and commits `new` only when the
    /// slot still holds `old`.
    fn write_cas(&self, offset: u64, old: i64, new: i64) -> TreeResult<()> {
        let _lock = lock::acquire(&self.inodes_path)?;
        let mut buf = [0u8; SLOT_SIZE as usize];
        self.inodes.read_exact_at(&mut buf, offset)?;
        if LittleEndian::read_i64(&buf) != old {
            return Err(TreeError::HasValue);
        }
        LittleEndian::write_i64(&mut buf, new);
        self.inodes.write_all_at(&buf, offset)?;
        Ok(())
    }

    /// Appends a zero-filled node at the next aligned offset and returns
    /// that offset. The zeros hit media before the node is ever linked,
    /// so lock-free readers only ever see empty or committed slots.
    fn new_node_offset(&self) -> TreeResult<u64> {
        let _lock = lock::acquire(&self.inodes_path)?;
        let len = self.inodes.metadata()?.len();
        let offset = len.div_ceil(NODE_SIZE) * NODE_SIZE;
        self.inodes.write_all_at(&[0u8; NODE_SIZE as usize], offset)?;
        Ok(offset)
    }

    fn append_record(&self, handle: &[u8], path: &str) -> TreeResult<u64> {
        let _lock = lock::acquire(&self.inodes_path)?;
        let offset = self.files.metadata()?.len();
        let mut buf = Vec::with_capacity(8 + handle.len() + path.len());
        let mut header = [0u8; 8];
        BigEndian::write_u32(&mut header[..4], handle.len() as u32);
        BigEndian::write_u32(&mut header[4..], path.len() as u32);
        buf.extend_from_slice(&header);
        buf.extend_from_slice(handle);
        buf.extend_from_slice(path.as_bytes());
        self.files.write_all_at(&buf, offset)?;
        Ok(offset)
    }

    fn read_record(&self, offset: u64) -> TreeResult<Entry> {
        let mut header = [0u8; 8];
        self.files.read_exact_at(&mut header, offset)?;
        let handle_len = BigEndian::read_u32(&header[..4]);
        let path_len = BigEndian::read_u32(&header[4..]);
        if handle_len > MAX_FIELD_LEN || path_len > MAX_FIELD_LEN {
            return Err(TreeError::Io(format!("corrupt record at offset {offset}")));
        }

        let mut handle = vec![0u8; handle_len as usize];
        self.files.read_exact_at(&mut handle, offset + 8)?;
        let mut path = vec![0u8; path_len as usize];
        self.files.read_exact_at(&mut path, offset + 8 + handle_len as u64)?;
        let path = String::from_utf8(path)
            .map_err(|_| TreeError::Io(format!("non-utf8 path in record at offset {offset}")))?;
        Ok(Entry { handle, path })
    }
}

fn encode_record(offset: u64) -> i64 {
    -(offset as i64 + 1)
}

fn decode_record(ptr: i64) -> u64 {
    (-ptr - 1) as u64
}

/// Opens read-write with O_SYNC so slot writes are durable when they
/// return.
fn open_sync(path: &Path) -> TreeResult<File> {
    let mut options = OpenOptions::new();
    options.read(true).write(true).create(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.custom_flags(libc::O_SYNC);
    }
    Ok(options.open(path)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_tree() -> (tempfile::TempDir, ByteTree) {
        let dir = tempfile::tempdir().unwrap();
        let tree = ByteTree::open(dir.path()).unwrap();
        (dir, tree)
    }

    #[test]
    fn prefix_keys_resolve_independently() {
        let (_dir, tree) = open_tree();
        tree.put(b"test", "/p1").unwrap();
        tree.put(b"te", "/p2").unwrap();

        assert_eq!(tree.get(b"test").unwrap(), "/p1");
        assert_eq!(tree.get(b"te").unwrap(), "/p2");
        assert_eq!(tree.get(b"testing"), Err(TreeError::NotFound));
        assert_eq!(tree.get(b"t"), Err(TreeError::NotFound));
    }

    #[test]
    fn no_phantom_hits_for_neighbors() {
        let (_dir, tree) = open_tree();
        tree.put(b"abc", "/abc").unwrap();

        assert_eq!(tree.get(b"ab"), Err(TreeError::NotFound));
        assert_eq!(tree.get(b"abcd"), Err(TreeError::NotFound));
        assert_eq!(tree.get(b"abd"), Err(TreeError::NotFound));
        assert_eq!(tree.get(b""), Err(TreeError::NotFound));
    }

    #[test]
    fn reput_is_idempotent_and_update_replaces() {
        let (_dir, tree) = open_tree();
        tree.put(b"key", "/one").unwrap();
        tree.put(b"key", "/one").unwrap();
        assert_eq!(tree.get(b"key").unwrap(), "/one");

        tree.put(b"key", "/two").unwrap();
        assert_eq!(tree.get(b"key").unwrap(), "/two");
    }

    #[test]
    fn empty_and_large_handles_round_trip() {
        let (_dir, tree) = open_tree();
        tree.put(b"", "/empty").unwrap();
        assert_eq!(tree.get(b"").unwrap(), "/empty");

        let large = vec![0xa5u8; 4096];
        tree.put(&large, "/large").unwrap();
        assert_eq!(tree.get(&large).unwrap(), "/large");
        assert_eq!(tree.get(&large[..4095]), Err(TreeError::NotFound));
    }

    #[test]
    fn handles_with_every_byte_value() {
        let (_dir, tree) = open_tree();
        let all: Vec<u8> = (0u8..=255).collect();
        tree.put(&all, "/all").unwrap();
        tree.put(&all[..128], "/half").unwrap();
        assert_eq!(tree.get(&all).unwrap(), "/all");
        assert_eq!(tree.get(&all[..128]).unwrap(), "/half");
    }

    #[test]
    fn survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let tree = ByteTree::open(dir.path()).unwrap();
            tree.put(b"stable", "/path").unwrap();
        }
        let tree = ByteTree::open(dir.path()).unwrap();
        assert_eq!(tree.get(b"stable").unwrap(), "/path");
    }
}
