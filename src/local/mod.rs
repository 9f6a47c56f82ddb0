//! Native back-end over a directory of the host file system.
//!
//! Metadata operations go through `tokio::fs`; positioned file I/O uses
//! the host's pread/pwrite through `spawn_blocking`, so no seek state is
//! shared between concurrent callers. Extended attributes are not
//! supported here: OS xattr syscalls are outside this crate.

use std::io;
use std::os::unix::fs::{FileExt, MetadataExt, PermissionsExt};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use tokio::task;

use crate::attr::{Attributes, FileInfo, FileType, OpenFlags, Permissions};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::fs::{
    File, FileInfoLister, FileRead, FileWrite, Fs, Handle, HandleFs, LinkFs, Lister, OpenFileFs,
    ReadAt, SymlinkFs, WriteAt,
};
use crate::path;

/// Host-directory back-end.
pub struct LocalFs {
    root: PathBuf,
    use_server_inodes: bool,
    allow_chown: bool,
}

impl LocalFs {
    /// Exposes `root` as the back-end's `/`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        LocalFs { root: root.into(), use_server_inodes: false, allow_chown: false }
    }

    /// Applies the native back-end keys of `config`.
    pub fn with_config(root: impl Into<PathBuf>, config: &Config) -> Self {
        LocalFs {
            root: root.into(),
            use_server_inodes: config.use_server_inodes,
            allow_chown: config.allow_server_chown,
        }
    }

    fn host_path(&self, target: &str) -> PathBuf {
        let clean = path::clean(target);
        let rel = clean.trim_start_matches(path::SEPARATOR);
        if rel.is_empty() {
            self.root.clone()
        } else {
            self.root.join(rel)
        }
    }

    fn info_from_metadata(&self, target: &str, meta: &std::fs::Metadata) -> FileInfo {
        let file_type = if meta.file_type().is_symlink() {
            FileType::Symlink
        } else if meta.is_dir() {
            FileType::Directory
        } else {
            FileType::Regular
        };
        let mode = meta.mode() & 0o7777;
        let name = match path::clean(target).as_str() {
            "/" => "/".to_owned(),
            cleaned => path::base(cleaned),
        };
        FileInfo {
            name,
            size: if file_type == FileType::Directory { 0 } else { meta.len() },
            file_type,
            mode,
            mtime: meta.modified().unwrap_or(UNIX_EPOCH),
            uid: meta.uid(),
            gid: meta.gid(),
            num_links: meta.nlink() as u32,
            extended: Attributes::new(),
            permissions: Permissions {
                read: mode & 0o444 != 0,
                write: mode & 0o222 != 0,
                delete: mode & 0o222 != 0,
                own: meta.uid() == process_uid(),
                get_extended: false,
                set_extended: false,
            },
        }
    }

    async fn open_host_file(
        &self,
        target: &str,
        flags: OpenFlags,
        mode: u32,
    ) -> Result<LocalFile> {
        let host = self.host_path(target);
        let writable = flags.contains(OpenFlags::WRITE);
        let file = task::spawn_blocking(move || -> io::Result<std::fs::File> {
            let mut options = std::fs::OpenOptions::new();
            options
                .read(flags.contains(OpenFlags::READ) || !writable)
                .write(writable)
                .append(flags.contains(OpenFlags::APPEND))
                .truncate(flags.contains(OpenFlags::TRUNC));
            if flags.contains(OpenFlags::CREATE) {
                use std::os::unix::fs::OpenOptionsExt;
                options.create(true).mode(mode);
                if flags.contains(OpenFlags::EXCL) {
                    options.create_new(true);
                }
            }
            options.open(&host)
        })
        .await
        .map_err(Error::io)??;

        if !writable && file.metadata().map(|m| m.is_dir()).unwrap_or(false) {
            return Err(Error::IsDir);
        }
        Ok(LocalFile { file: Arc::new(file), sync_on_close: writable })
    }
}

#[async_trait]
impl Fs for LocalFs {
    async fn stat(&self, target: &str) -> Result<FileInfo> {
        let meta = tokio::fs::metadata(self.host_path(target)).await?;
        Ok(self.info_from_metadata(target, &meta))
    }

    async fn list(&self, target: &str) -> Result<Box<dyn Lister>> {
        let host = self.host_path(target);
        let meta = tokio::fs::metadata(&host).await?;
        if !meta.is_dir() {
            return Err(Error::NotDir);
        }

        let mut entries = Vec::new();
        let mut dir = tokio::fs::read_dir(&host).await?;
        while let Some(entry) = dir.next_entry().await? {
            let name = match entry.file_name().into_string() {
                Ok(name) => name,
                // skip names the virtual namespace cannot express
                Err(_) => continue,
            };
            let meta = entry.metadata().await?;
            entries.push(self.info_from_metadata(&name, &meta));
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(Box::new(FileInfoLister::new(entries)))
    }

    async fn file_read(&self, target: &str) -> Result<Box<dyn FileRead>> {
        Ok(Box::new(self.open_host_file(target, OpenFlags::read_only(), 0o644).await?))
    }

    async fn file_write(&self, target: &str, flags: OpenFlags) -> Result<Box<dyn FileWrite>> {
        let flags = flags | OpenFlags::WRITE;
        Ok(Box::new(self.open_host_file(target, flags, 0o644).await?))
    }

    async fn mkdir(&self, target: &str, mode: u32) -> Result<()> {
        let mut builder = tokio::fs::DirBuilder::new();
        builder.mode(mode);
        builder.create(self.host_path(target)).await?;
        Ok(())
    }

    async fn remove(&self, target: &str) -> Result<()> {
        // unlink semantics: refuse directories before the host call
        let meta = tokio::fs::symlink_metadata(self.host_path(target)).await?;
        if meta.is_dir() {
            return Err(Error::IsDir);
        }
        tokio::fs::remove_file(self.host_path(target)).await?;
        Ok(())
    }

    async fn rmdir(&self, target: &str) -> Result<()> {
        let meta = tokio::fs::symlink_metadata(self.host_path(target)).await?;
        if !meta.is_dir() {
            return Err(Error::NotDir);
        }
        tokio::fs::remove_dir(self.host_path(target)).await?;
        Ok(())
    }

    async fn rename(&self, old: &str, new: &str) -> Result<()> {
        if tokio::fs::symlink_metadata(self.host_path(new)).await.is_ok() {
            return Err(Error::Exists);
        }
        tokio::fs::rename(self.host_path(old), self.host_path(new)).await?;
        Ok(())
    }

    async fn chmod(&self, target: &str, mode: u32) -> Result<()> {
        tokio::fs::set_permissions(
            self.host_path(target),
            std::fs::Permissions::from_mode(mode),
        )
        .await?;
        Ok(())
    }

    async fn chown(&self, target: &str, uid: u32, gid: u32) -> Result<()> {
        if !self.allow_chown {
            return Err(Error::Permission);
        }
        let host = self.host_path(target);
        task::spawn_blocking(move || std::os::unix::fs::chown(host, Some(uid), Some(gid)))
            .await
            .map_err(Error::io)??;
        Ok(())
    }

    async fn chtimes(
        &self,
        target: &str,
        atime: Option<SystemTime>,
        mtime: Option<SystemTime>,
    ) -> Result<()> {
        let host = self.host_path(target);
        task::spawn_blocking(move || -> io::Result<()> {
            let meta = std::fs::metadata(&host)?;
            let atime = atime
                .map(filetime::FileTime::from_system_time)
                .unwrap_or_else(|| filetime::FileTime::from_last_access_time(&meta));
            let mtime = mtime
                .map(filetime::FileTime::from_system_time)
                .unwrap_or_else(|| filetime::FileTime::from_last_modification_time(&meta));
            filetime::set_file_times(&host, atime, mtime)
        })
        .await
        .map_err(Error::io)??;
        Ok(())
    }

    async fn truncate(&self, target: &str, size: u64) -> Result<()> {
        let file = tokio::fs::OpenOptions::new().write(true).open(self.host_path(target)).await?;
        file.set_len(size).await?;
        Ok(())
    }

    async fn set_extended_attr(&self, _target: &str, _name: &str, _value: &[u8]) -> Result<()> {
        Err(Error::NotSupported)
    }

    async fn unset_extended_attr(&self, _target: &str, _name: &str) -> Result<()> {
        Err(Error::NotSupported)
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }

    fn symlinks(&self) -> Option<&dyn SymlinkFs> {
        Some(self)
    }

    fn links(&self) -> Option<&dyn LinkFs> {
        Some(self)
    }

    fn handles(&self) -> Option<&dyn HandleFs> {
        if self.use_server_inodes {
            Some(self)
        } else {
            None
        }
    }

    fn open_files(&self) -> Option<&dyn OpenFileFs> {
        Some(self)
    }
}

#[async_trait]
impl SymlinkFs for LocalFs {
    async fn lstat(&self, target: &str) -> Result<FileInfo> {
        let meta = tokio::fs::symlink_metadata(self.host_path(target)).await?;
        Ok(self.info_from_metadata(target, &meta))
    }

    async fn readlink(&self, target: &str) -> Result<String> {
        let stored = tokio::fs::read_link(self.host_path(target)).await?;
        stored
            .into_os_string()
            .into_string()
            .map_err(|_| Error::Invalid("symlink target is not utf-8".into()))
    }

    async fn symlink(&self, link_target: &str, link: &str) -> Result<()> {
        tokio::fs::symlink(link_target, self.host_path(link)).await?;
        Ok(())
    }
}

#[async_trait]
impl LinkFs for LocalFs {
    async fn link(&self, link_target: &str, link: &str) -> Result<()> {
        tokio::fs::hard_link(self.host_path(link_target), self.host_path(link)).await?;
        Ok(())
    }
}

#[async_trait]
impl HandleFs for LocalFs {
    async fn handle(&self, target: &str) -> Result<Handle> {
        let meta = tokio::fs::metadata(self.host_path(target)).await?;
        Ok(Handle(meta.ino().to_be_bytes().to_vec()))
    }
}

#[async_trait]
impl OpenFileFs for LocalFs {
    async fn open_file(&self, target: &str, flags: OpenFlags, mode: u32) -> Result<Box<dyn File>> {
        Ok(Box::new(self.open_host_file(target, flags, mode).await?))
    }
}

/// Open host file; positioned I/O, no shared cursor.
struct LocalFile {
    file: Arc<std::fs::File>,
    sync_on_close: bool,
}

#[async_trait]
impl ReadAt for LocalFile {
    async fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        let file = Arc::clone(&self.file);
        let len = buf.len();
        let data = task::spawn_blocking(move || -> io::Result<Vec<u8>> {
            let mut tmp = vec![0u8; len];
            let n = file.read_at(&mut tmp, offset)?;
            tmp.truncate(n);
            Ok(tmp)
        })
        .await
        .map_err(Error::io)??;
        buf[..data.len()].copy_from_slice(&data);
        Ok(data.len())
    }
}

#[async_trait]
impl WriteAt for LocalFile {
    async fn write_at(&self, data: &[u8], offset: u64) -> Result<usize> {
        let file = Arc::clone(&self.file);
        let owned = data.to_vec();
        let n = task::spawn_blocking(move || file.write_at(&owned, offset))
            .await
            .map_err(Error::io)??;
        Ok(n)
    }
}

#[async_trait]
impl FileRead for LocalFile {
    async fn close(&self) -> Result<()> {
        self.sync_close().await
    }
}

#[async_trait]
impl FileWrite for LocalFile {
    async fn close(&self) -> Result<()> {
        self.sync_close().await
    }
}

#[async_trait]
impl File for LocalFile {
    async fn truncate(&self, size: u64) -> Result<()> {
        let file = Arc::clone(&self.file);
        task::spawn_blocking(move || file.set_len(size)).await.map_err(Error::io)??;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.sync_close().await
    }
}

impl LocalFile {
    async fn sync_close(&self) -> Result<()> {
        if !self.sync_on_close {
            return Ok(());
        }
        let file = Arc::clone(&self.file);
        task::spawn_blocking(move || file.sync_all()).await.map_err(Error::io)??;
        Ok(())
    }
}

fn process_uid() -> u32 {
    // geteuid cannot fail
    unsafe { libc::geteuid() }
}
