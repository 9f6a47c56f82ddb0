//! Core file system interface and its capability refinements.
//!
//! Back-ends implement [`Fs`] and opt into narrower interfaces (symlinks,
//! hard links, handles, random-access files, batch attributes) by
//! overriding the matching capability probe to return `Some(self)`. The
//! composing layers never downcast; they ask the probe and fall back to
//! [`Error::NotSupported`] when it answers `None`.

pub mod util;

use std::time::SystemTime;

use async_trait::async_trait;

use crate::attr::{Attributes, FileInfo, OpenFlags};
use crate::error::{Error, Result};
use crate::walk::Walk;

/// Reserved handle naming the virtual root `/`.
pub const ROOT_HANDLE: [u8; 1] = [0x00];

/// Reserved handle meaning "the back-end cannot produce a stable handle".
pub const UNSUPPORTED_HANDLE: [u8; 1] = [0xFE];

/// Opaque byte token referencing a filesystem entry.
///
/// Handles are values: they carry no lifetime tied to the issuing process
/// and must never be dereferenced without a lookup first.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Handle(pub Vec<u8>);

impl Handle {
    /// The handle of the virtual root.
    pub fn root() -> Self {
        Handle(ROOT_HANDLE.to_vec())
    }

    /// The sentinel for back-ends without stable handles.
    pub fn unsupported() -> Self {
        Handle(UNSUPPORTED_HANDLE.to_vec())
    }

    pub fn is_root(&self) -> bool {
        self.0 == ROOT_HANDLE
    }

    pub fn is_unsupported(&self) -> bool {
        self.0 == UNSUPPORTED_HANDLE
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

/// Positioned reads over a random-access source.
#[async_trait]
pub trait ReadAt: Send + Sync {
    /// Reads up to `buf.len()` bytes at `offset`. Returns the number of
    /// bytes read; `Ok(0)` signals end of input.
    async fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize>;
}

/// Positioned writes over a random-access sink.
#[async_trait]
pub trait WriteAt: Send + Sync {
    /// Writes `data` at `offset`, returning how many bytes were accepted.
    async fn write_at(&self, data: &[u8], offset: u64) -> Result<usize>;
}

/// An open read handle. Position is caller-managed.
#[async_trait]
pub trait FileRead: ReadAt {
    /// Releases back-end resources. Reading after close is undefined.
    async fn close(&self) -> Result<()>;
}

/// An open write handle. Position is caller-managed.
#[async_trait]
pub trait FileWrite: WriteAt {
    /// Flushes buffered state and releases back-end resources.
    async fn close(&self) -> Result<()>;
}

impl std::fmt::Debug for dyn FileWrite {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("dyn FileWrite").finish_non_exhaustive()
    }
}

/// A full random-access handle returned by [`OpenFileFs::open_file`].
#[async_trait]
pub trait File: ReadAt + WriteAt {
    async fn truncate(&self, size: u64) -> Result<()>;
    async fn close(&self) -> Result<()>;
}

/// One page of directory entries.
#[derive(Debug, Clone)]
pub struct ListPage {
    pub entries: Vec<FileInfo>,
    /// True when a subsequent call past these entries would return none.
    pub eof: bool,
}

/// Paginated directory iterator. Callers invoke [`Lister::list_at`] in a
/// loop, advancing the offset by the number of returned entries, until
/// the page reports EOF.
#[async_trait]
pub trait Lister: Send {
    async fn list_at(&mut self, offset: u64, max: usize) -> Result<ListPage>;

    /// Releases back-end resources held by the iterator.
    async fn close(&mut self) -> Result<()>;
}

/// Canonical in-memory [`Lister`] over a pre-collected entry list.
#[derive(Debug, Default)]
pub struct FileInfoLister {
    entries: Vec<FileInfo>,
}

impl FileInfoLister {
    pub fn new(entries: Vec<FileInfo>) -> Self {
        FileInfoLister { entries }
    }
}

#[async_trait]
impl Lister for FileInfoLister {
    async fn list_at(&mut self, offset: u64, max: usize) -> Result<ListPage> {
        let offset = offset.min(self.entries.len() as u64) as usize;
        let n = max.min(self.entries.len() - offset);
        let entries = self.entries[offset..offset + n].to_vec();
        let eof = offset + n >= self.entries.len();
        Ok(ListPage { entries, eof })
    }

    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Callback invoked by the walker for every visited entry.
pub type WalkVisitor<'a> =
    dyn FnMut(&str, Option<&FileInfo>, Option<Error>) -> Result<Walk> + Send + 'a;

/// The uniform interface over every storage back-end.
///
/// All paths are clean, absolute and relative to the back-end's own root.
/// Every operation may suspend arbitrarily long; back-ends doing network
/// I/O must honor cancellation (future drop) at their first safe point.
#[async_trait]
pub trait Fs: Send + Sync {
    /// Fetches entry attributes, following symlinks.
    async fn stat(&self, path: &str) -> Result<FileInfo>;

    /// Opens a paginated iterator over a directory.
    async fn list(&self, path: &str) -> Result<Box<dyn Lister>>;

    /// Opens a file for positioned reads.
    async fn file_read(&self, path: &str) -> Result<Box<dyn FileRead>>;

    /// Opens a file for positioned writes according to `flags`.
    async fn file_write(&self, path: &str, flags: OpenFlags) -> Result<Box<dyn FileWrite>>;

    async fn mkdir(&self, path: &str, mode: u32) -> Result<()>;

    /// Removes a file. Unlink semantics: directories must fail with
    /// [`Error::IsDir`] even when the back-end's native call would accept
    /// them.
    async fn remove(&self, path: &str) -> Result<()>;

    /// Removes an empty directory.
    async fn rmdir(&self, path: &str) -> Result<()>;

    /// Renames an entry. Target existence is an error ([`Error::Exists`]).
    async fn rename(&self, old: &str, new: &str) -> Result<()>;

    async fn chmod(&self, path: &str, mode: u32) -> Result<()>;

    async fn chown(&self, path: &str, uid: u32, gid: u32) -> Result<()>;

    async fn chtimes(
        &self,
        path: &str,
        atime: Option<SystemTime>,
        mtime: Option<SystemTime>,
    ) -> Result<()>;

    async fn truncate(&self, path: &str, size: u64) -> Result<()>;

    async fn set_extended_attr(&self, path: &str, name: &str, value: &[u8]) -> Result<()>;

    async fn unset_extended_attr(&self, path: &str, name: &str) -> Result<()>;

    /// Releases back-end resources (connections, open databases).
    async fn close(&self) -> Result<()>;

    /// Capability probe for symlink operations.
    fn symlinks(&self) -> Option<&dyn SymlinkFs> {
        None
    }

    /// Capability probe for hard links.
    fn links(&self) -> Option<&dyn LinkFs> {
        None
    }

    /// Capability probe for back-ends that can produce stable handles.
    fn handles(&self) -> Option<&dyn HandleFs> {
        None
    }

    /// Capability probe for back-ends that can also resolve handles.
    fn handle_resolver(&self) -> Option<&dyn HandleResolveFs> {
        None
    }

    /// Capability probe for seekable read/write handles.
    fn open_files(&self) -> Option<&dyn OpenFileFs> {
        None
    }

    /// Capability probe for an accelerated recursive walk.
    fn walker(&self) -> Option<&dyn WalkFs> {
        None
    }

    /// Capability probe for batch extended-attribute updates.
    fn bulk_attrs(&self) -> Option<&dyn SetExtendedAttrsFs> {
        None
    }
}

/// Symlink-aware back-ends.
#[async_trait]
pub trait SymlinkFs: Fs {
    /// Like `stat`, but does not follow a final symlink.
    async fn lstat(&self, path: &str) -> Result<FileInfo>;

    /// Reads the target stored in a symlink.
    async fn readlink(&self, path: &str) -> Result<String>;

    /// Creates a symlink at `link` pointing at `target`.
    async fn symlink(&self, target: &str, link: &str) -> Result<()>;
}

/// Hard-link-aware back-ends.
#[async_trait]
pub trait LinkFs: Fs {
    /// Creates a hard link at `link` referencing `target`.
    async fn link(&self, target: &str, link: &str) -> Result<()>;
}

/// Back-ends that can mint a stable handle for a path but cannot resolve
/// one back; resolution then goes through the persistent handle database.
#[async_trait]
pub trait HandleFs: Fs {
    async fn handle(&self, path: &str) -> Result<Handle>;
}

/// Back-ends with native two-way handle support.
#[async_trait]
pub trait HandleResolveFs: HandleFs {
    async fn path(&self, handle: &Handle) -> Result<String>;
}

/// Back-ends providing seekable random-access file handles.
#[async_trait]
pub trait OpenFileFs: Fs {
    async fn open_file(&self, path: &str, flags: OpenFlags, mode: u32) -> Result<Box<dyn File>>;
}

/// Back-ends with an accelerated recursive traversal.
#[async_trait]
pub trait WalkFs: Fs {
    async fn walk(&self, root: &str, visit: &mut WalkVisitor<'_>) -> Result<()>;
}

/// Back-ends with a batch extended-attribute operation. Without this
/// capability, the composing layer falls back to fetch-current, diff and
/// apply through the single-attribute operations.
#[async_trait]
pub trait SetExtendedAttrsFs: Fs {
    async fn set_extended_attrs(&self, path: &str, attrs: &Attributes) -> Result<()>;
}

/// Drains a lister into a single vector, closing it afterwards.
pub async fn collect_entries(lister: &mut dyn Lister, page: usize) -> Result<Vec<FileInfo>> {
    let mut entries = Vec::new();
    loop {
        let batch = lister.list_at(entries.len() as u64, page).await?;
        let eof = batch.eof;
        let empty = batch.entries.is_empty();
        entries.extend(batch.entries);
        if eof || empty {
            break;
        }
    }
    lister.close().await?;
    Ok(entries)
}
