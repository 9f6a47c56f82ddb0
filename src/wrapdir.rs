//! Synthesizes a root whose children are pinned entry points, each
//! aliasing `/` of one parent back-end. Useful when a back-end has one
//! namespace but the protocol requires several named roots.

use std::sync::Arc;
use std::time::SystemTime;

use async_trait::async_trait;

use crate::attr::{FileInfo, OpenFlags};
use crate::error::{Error, Result};
use crate::fs::{
    File, FileInfoLister, FileRead, FileWrite, Fs, LinkFs, Lister, OpenFileFs, SymlinkFs,
};
use crate::path;

/// Mode bits of the synthesized root and entry points.
const PINNED_DIR_MODE: u32 = 0o555;

enum Target {
    /// The synthesized, read-only root.
    Root,
    /// A path inside the parent, `/` for the pinned entry itself.
    Forward(String),
}

/// A parent back-end re-exposed under a fixed set of entry names.
pub struct Wrapdir {
    parent: Arc<dyn Fs>,
    dirs: Vec<String>,
}

impl Wrapdir {
    /// Pins `dirs` (single path elements) as the children of `/`.
    pub fn new(parent: Arc<dyn Fs>, dirs: &[&str]) -> Result<Self> {
        let mut names = Vec::with_capacity(dirs.len());
        for dir in dirs {
            if dir.is_empty() || dir.contains(path::SEPARATOR) {
                return Err(Error::Invalid(format!("{dir:?} is not a single path element")));
            }
            names.push((*dir).to_owned());
        }
        names.sort();
        names.dedup();
        Ok(Wrapdir { parent, dirs: names })
    }

    fn translate(&self, target: &str) -> Result<Target> {
        let target = path::clean(target);
        if target == "/" {
            return Ok(Target::Root);
        }
        let rest = &target[1..];
        let (head, tail) = match rest.find(path::SEPARATOR) {
            Some(idx) => (&rest[..idx], &rest[idx..]),
            None => (rest, ""),
        };
        if !self.dirs.iter().any(|d| d == head) {
            return Err(Error::NotFound);
        }
        if tail.is_empty() {
            Ok(Target::Forward("/".to_owned()))
        } else {
            Ok(Target::Forward(path::clean(tail)))
        }
    }

    fn forward(&self, target: &str) -> Result<String> {
        match self.translate(target)? {
            Target::Root => Err(Error::Permission),
            Target::Forward(inner) => Ok(inner),
        }
    }

    /// Forward, but the pinned entries themselves are immutable too.
    fn forward_mutable(&self, target: &str) -> Result<String> {
        match self.translate(target)? {
            Target::Root => Err(Error::Permission),
            Target::Forward(inner) if inner == "/" => Err(Error::Permission),
            Target::Forward(inner) => Ok(inner),
        }
    }

    async fn entry_info(&self, name: &str) -> FileInfo {
        match self.parent.stat("/").await {
            Ok(mut info) => {
                info.name = name.to_owned();
                info
            }
            Err(_) => FileInfo::directory(name, PINNED_DIR_MODE),
        }
    }
}

#[async_trait]
impl Fs for Wrapdir {
    async fn stat(&self, target: &str) -> Result<FileInfo> {
        match self.translate(target)? {
            Target::Root => Ok(FileInfo::directory("/", PINNED_DIR_MODE)),
            Target::Forward(inner) => {
                let mut info = self.parent.stat(&inner).await?;
                if inner == "/" {
                    info.name = path::base(target);
                }
                Ok(info)
            }
        }
    }

    async fn list(&self, target: &str) -> Result<Box<dyn Lister>> {
        match self.translate(target)? {
            Target::Root => {
                let mut entries = Vec::with_capacity(self.dirs.len());
                for name in &self.dirs {
                    entries.push(self.entry_info(name).await);
                }
                Ok(Box::new(FileInfoLister::new(entries)))
            }
            Target::Forward(inner) => self.parent.list(&inner).await,
        }
    }

    async fn file_read(&self, target: &str) -> Result<Box<dyn FileRead>> {
        let inner = self.forward(target)?;
        self.parent.file_read(&inner).await
    }

    async fn file_write(&self, target: &str, flags: OpenFlags) -> Result<Box<dyn FileWrite>> {
        let inner = self.forward_mutable(target)?;
        self.parent.file_write(&inner, flags).await
    }

    async fn mkdir(&self, target: &str, mode: u32) -> Result<()> {
        let inner = self.forward_mutable(target)?;
        self.parent.mkdir(&inner, mode).await
    }

    async fn remove(&self, target: &str) -> Result<()> {
        let inner = self.forward_mutable(target)?;
        self.parent.remove(&inner).await
    }

    async fn rmdir(&self, target: &str) -> Result<()> {
        let inner = self.forward_mutable(target)?;
        self.parent.rmdir(&inner).await
    }

    async fn rename(&self, old: &str, new: &str) -> Result<()> {
        let old_inner = self.forward_mutable(old)?;
        let new_inner = self.forward_mutable(new)?;
        self.parent.rename(&old_inner, &new_inner).await
    }

    async fn chmod(&self, target: &str, mode: u32) -> Result<()> {
        let inner = self.forward_mutable(target)?;
        self.parent.chmod(&inner, mode).await
    }

    async fn chown(&self, target: &str, uid: u32, gid: u32) -> Result<()> {
        let inner = self.forward_mutable(target)?;
        self.parent.chown(&inner, uid, gid).await
    }

    async fn chtimes(
        &self,
        target: &str,
        atime: Option<SystemTime>,
        mtime: Option<SystemTime>,
    ) -> Result<()> {
        let inner = self.forward_mutable(target)?;
        self.parent.chtimes(&inner, atime, mtime).await
    }

    async fn truncate(&self, target: &str, size: u64) -> Result<()> {
        let inner = self.forward_mutable(target)?;
        self.parent.truncate(&inner, size).await
    }

    async fn set_extended_attr(&self, target: &str, name: &str, value: &[u8]) -> Result<()> {
        let inner = self.forward_mutable(target)?;
        self.parent.set_extended_attr(&inner, name, value).await
    }

    async fn unset_extended_attr(&self, target: &str, name: &str) -> Result<()> {
        let inner = self.forward_mutable(target)?;
        self.parent.unset_extended_attr(&inner, name).await
    }

    async fn close(&self) -> Result<()> {
        self.parent.close().await
    }

    fn symlinks(&self) -> Option<&dyn SymlinkFs> {
        self.parent.symlinks().map(|_| self as &dyn SymlinkFs)
    }

    fn links(&self) -> Option<&dyn LinkFs> {
        self.parent.links().map(|_| self as &dyn LinkFs)
    }

    fn open_files(&self) -> Option<&dyn OpenFileFs> {
        self.parent.open_files().map(|_| self as &dyn OpenFileFs)
    }
}

#[async_trait]
impl SymlinkFs for Wrapdir {
    async fn lstat(&self, target: &str) -> Result<FileInfo> {
        match self.translate(target)? {
            Target::Root => Ok(FileInfo::directory("/", PINNED_DIR_MODE)),
            Target::Forward(inner) => {
                let sym = self.parent.symlinks().ok_or(Error::NotSupported)?;
                let mut info = sym.lstat(&inner).await?;
                if inner == "/" {
                    info.name = path::base(target);
                }
                Ok(info)
            }
        }
    }

    async fn readlink(&self, target: &str) -> Result<String> {
        let inner = self.forward(target)?;
        let sym = self.parent.symlinks().ok_or(Error::NotSupported)?;
        sym.readlink(&inner).await
    }

    async fn symlink(&self, link_target: &str, link: &str) -> Result<()> {
        let link_inner = self.forward_mutable(link)?;
        let target_inner = if path::is_abs(link_target) {
            self.forward(link_target)?
        } else {
            link_target.to_owned()
        };
        let sym = self.parent.symlinks().ok_or(Error::NotSupported)?;
        sym.symlink(&target_inner, &link_inner).await
    }
}

#[async_trait]
impl LinkFs for Wrapdir {
    async fn link(&self, link_target: &str, link: &str) -> Result<()> {
        let target_inner = self.forward(link_target)?;
        let link_inner = self.forward_mutable(link)?;
        let links = self.parent.links().ok_or(Error::NotSupported)?;
        links.link(&target_inner, &link_inner).await
    }
}

#[async_trait]
impl OpenFileFs for Wrapdir {
    async fn open_file(&self, target: &str, flags: OpenFlags, mode: u32) -> Result<Box<dyn File>> {
        let inner = self.forward_mutable(target)?;
        let open_files = self.parent.open_files().ok_or(Error::NotSupported)?;
        open_files.open_file(&inner, flags, mode).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::util;
    use crate::memory::MemoryFs;

    async fn fixture() -> Wrapdir {
        let parent = Arc::new(MemoryFs::new());
        util::write_file(parent.as_ref(), "/shared.txt", b"common").await.unwrap();
        Wrapdir::new(parent, &["home", "projects"]).unwrap()
    }

    #[tokio::test]
    async fn root_lists_exactly_the_pinned_names() {
        let wrap = fixture().await;
        let mut lister = wrap.list("/").await.unwrap();
        let page = lister.list_at(0, 10).await.unwrap();
        let names: Vec<&str> = page.entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["home", "projects"]);
        assert!(page.eof);
    }

    #[tokio::test]
    async fn entries_alias_the_parent_root() {
        let wrap = fixture().await;
        assert_eq!(util::read_file(&wrap, "/home/shared.txt").await.unwrap(), b"common");
        assert_eq!(util::read_file(&wrap, "/projects/shared.txt").await.unwrap(), b"common");

        util::write_file(&wrap, "/home/new.txt", b"via home").await.unwrap();
        assert_eq!(util::read_file(&wrap, "/projects/new.txt").await.unwrap(), b"via home");
    }

    #[tokio::test]
    async fn the_synthesized_root_is_read_only() {
        let wrap = fixture().await;
        assert_eq!(wrap.mkdir("/stray", 0o755).await.unwrap_err(), Error::NotFound);
        assert_eq!(wrap.remove("/home").await.unwrap_err(), Error::Permission);
        assert_eq!(
            wrap.file_write("/", OpenFlags::write_truncate()).await.unwrap_err(),
            Error::Permission
        );
    }

    #[tokio::test]
    async fn unknown_entries_are_absent() {
        let wrap = fixture().await;
        assert_eq!(wrap.stat("/other").await.unwrap_err(), Error::NotFound);
        assert_eq!(wrap.stat("/other/deep").await.unwrap_err(), Error::NotFound);
    }
}
