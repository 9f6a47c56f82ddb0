//! The mount-tree root: composes back-ends into one namespace, follows
//! symlinks across mount boundaries, prefixes handles with the owning
//! mount's index byte and overlays synthetic directories for mountpoints
//! without a physical parent.

mod lister;

use std::sync::{Arc, RwLock};
use std::time::SystemTime;

use async_trait::async_trait;
use tracing::debug;

use crate::attr::{Attributes, FileInfo, OpenFlags};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::fs::{
    File, FileRead, FileWrite, Fs, Handle, HandleFs, HandleResolveFs, LinkFs, Lister, OpenFileFs,
    SetExtendedAttrsFs, SymlinkFs, WalkFs, WalkVisitor, ROOT_HANDLE, UNSUPPORTED_HANDLE,
};
use crate::handledb::HandleDb;
use crate::path;
use crate::walk;

use lister::VirtualLister;

/// Symlink hops tolerated while resolving one path.
const SYMLINK_BUDGET: u32 = 16;

/// Mode bits of synthesized directories.
const SYNTHETIC_DIR_MODE: u32 = 0o555;

fn too_many_symlinks() -> Error {
    Error::Invalid("too many levels of symbolic links".into())
}

/// One mounted back-end.
pub struct Mount {
    index: u8,
    mountpoint: String,
    fs: Arc<dyn Fs>,
    handle_db: Option<HandleDb>,
}

impl Mount {
    pub fn index(&self) -> u8 {
        self.index
    }

    pub fn mountpoint(&self) -> &str {
        &self.mountpoint
    }
}

type Resolved = (Arc<Mount>, String);

/// The composition root. Itself an [`Fs`] with every capability, so it
/// nests under the adapters and the walker like any back-end.
pub struct Root {
    /// Sorted descending by mountpoint so the deepest prefix wins.
    mounts: RwLock<Vec<Arc<Mount>>>,
    config: Config,
}

impl Default for Root {
    fn default() -> Self {
        Root::new(Config::default())
    }
}

impl Root {
    pub fn new(config: Config) -> Self {
        Root { mounts: RwLock::new(Vec::new()), config }
    }

    /// Attaches `fs` at `mountpoint` under the stable 1-byte `index`.
    ///
    /// An existing mount at the exact path is replaced. Otherwise the
    /// path must not resolve yet and its parent must be a directory. A
    /// persistent handle database is attached when storage is configured
    /// and the back-end cannot resolve handles natively.
    pub async fn mount(&self, mountpoint: &str, fs: Arc<dyn Fs>, index: u8) -> Result<()> {
        let mountpoint = path::clean(mountpoint);
        if !path::is_abs(&mountpoint) {
            return Err(Error::Invalid(format!("mountpoint {mountpoint:?} is not absolute")));
        }
        if index == ROOT_HANDLE[0] || index == UNSUPPORTED_HANDLE[0] {
            return Err(Error::Invalid(format!("mount index {index:#04x} is reserved")));
        }
        if self.table().iter().any(|m| m.index == index && m.mountpoint != mountpoint) {
            return Err(Error::Invalid(format!("mount index {index:#04x} already in use")));
        }

        let replacing = self.exact_mount(&mountpoint).is_some();
        if !replacing && mountpoint != "/" {
            match self.stat(&mountpoint).await {
                Ok(_) => return Err(Error::Exists),
                Err(Error::NotFound) => {}
                Err(err) => return Err(err),
            }
            let (parent, _) = path::split(&mountpoint);
            let parent_info = self.stat(&parent).await?;
            if !parent_info.is_dir() {
                return Err(Error::NotDir);
            }
        }

        let handle_db = if fs.handle_resolver().is_some() {
            None
        } else {
            match self.config.handle_db_root() {
                Some(storage) => Some(HandleDb::open(&storage.join(format!("{index:02x}")))?),
                None => None,
            }
        };

        let mount = Arc::new(Mount { index, mountpoint: mountpoint.clone(), fs, handle_db });
        let mut mounts = match self.mounts.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        mounts.retain(|m| m.mountpoint != mountpoint);
        mounts.push(mount);
        mounts.sort_by(|a, b| b.mountpoint.cmp(&a.mountpoint));
        debug!(%mountpoint, index, "mounted back-end");
        Ok(())
    }

    /// Snapshot of the mount table; lookups never hold the lock.
    fn table(&self) -> Vec<Arc<Mount>> {
        match self.mounts.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn exact_mount(&self, target: &str) -> Option<Arc<Mount>> {
        self.table().iter().find(|m| m.mountpoint == target).cloned()
    }

    /// Mounts whose mountpoint is a direct child of `dir`.
    fn child_mounts(&self, dir: &str) -> Vec<Arc<Mount>> {
        self.table()
            .iter()
            .filter(|m| m.mountpoint != "/" && path::split(&m.mountpoint).0 == dir)
            .cloned()
            .collect()
    }

    /// Whether any mountpoint lies strictly below `dir`.
    fn has_mount_below(&self, dir: &str) -> bool {
        let prefix = if dir == "/" { String::from("/") } else { format!("{dir}/") };
        self.table().iter().any(|m| m.mountpoint != dir && m.mountpoint.starts_with(&prefix))
    }

    fn synthetic_dir(&self, target: &str) -> FileInfo {
        let name = if target == "/" { "/".to_owned() } else { path::base(target) };
        FileInfo::directory(name, SYNTHETIC_DIR_MODE)
    }

    /// Resolves a path whose final component must not be followed:
    /// the directory part follows symlinks, the file part is appended.
    async fn resolve_path(&self, target: &str) -> Result<Resolved> {
        let target = path::clean(target);
        if let Some(mount) = self.exact_mount(&target) {
            return Ok((mount, "/".to_owned()));
        }
        if target == "/" {
            return Err(Error::NotFound);
        }
        let (dir, file) = path::split(&target);
        let (mount, dir_inner) = self.follow_symlinks(&dir, true, SYMLINK_BUDGET).await?;
        Ok((mount, path::join(&[&dir_inner, &file])))
    }

    /// Resolves a path end-to-end. Absolute symlink targets restart in
    /// the composed namespace, which is what carries resolution across
    /// mount boundaries; relative targets restart from the link's
    /// directory.
    fn follow_symlinks<'a>(
        &'a self,
        target: &'a str,
        accept_dangling: bool,
        budget: u32,
    ) -> BoxedResolve<'a> {
        Box::pin(async move {
            if budget == 0 {
                return Err(too_many_symlinks());
            }
            let target = path::clean(target);
            if let Some(mount) = self.exact_mount(&target) {
                return Ok((mount, "/".to_owned()));
            }
            if target == "/" {
                return Err(Error::NotFound);
            }

            let (dir, file) = path::split(&target);
            let (mount, dir_inner) = self.follow_symlinks(&dir, true, budget).await?;
            let inner = path::join(&[&dir_inner, &file]);

            let sym = match mount.fs.symlinks() {
                Some(sym) => sym,
                None => return Ok((mount, inner)),
            };
            match sym.lstat(&inner).await {
                Err(Error::NotFound) if accept_dangling => Ok((mount, inner)),
                Err(err) => Err(err),
                Ok(info) if !info.is_symlink() => Ok((mount, inner)),
                Ok(_) => {
                    let link_target = sym.readlink(&inner).await?;
                    let restart = if path::is_abs(&link_target) {
                        path::clean(&link_target)
                    } else {
                        path::join(&[&dir, &link_target])
                    };
                    self.follow_symlinks(&restart, accept_dangling, budget - 1).await
                }
            }
        })
    }

    fn open_file_allowed(&self, target: &str) -> bool {
        match &self.config.open_file_allowed_paths {
            None => true,
            Some(prefixes) => prefixes.iter().any(|prefix| {
                let prefix = path::clean(prefix);
                target == prefix || target.starts_with(&format!("{prefix}/"))
            }),
        }
    }

    fn prefixed_handle(&self, mount: &Mount, handle: Handle) -> Handle {
        let mut bytes = Vec::with_capacity(handle.0.len() + 1);
        bytes.push(mount.index);
        bytes.extend_from_slice(&handle.0);
        Handle(bytes)
    }
}

type BoxedResolve<'a> =
    std::pin::Pin<Box<dyn std::future::Future<Output = Result<Resolved>> + Send + 'a>>;

#[async_trait]
impl Fs for Root {
    async fn stat(&self, target: &str) -> Result<FileInfo> {
        let target = path::clean(target);
        match self.follow_symlinks(&target, false, SYMLINK_BUDGET).await {
            Ok((mount, inner)) => match mount.fs.stat(&inner).await {
                Ok(mut info) => {
                    info.name =
                        if target == "/" { "/".to_owned() } else { path::base(&target) };
                    Ok(info)
                }
                Err(Error::NotFound) if self.has_mount_below(&target) => {
                    Ok(self.synthetic_dir(&target))
                }
                Err(err) => Err(err),
            },
            Err(Error::NotFound) if target == "/" || self.has_mount_below(&target) => {
                Ok(self.synthetic_dir(&target))
            }
            Err(err) => Err(err),
        }
    }

    async fn list(&self, target: &str) -> Result<Box<dyn Lister>> {
        let target = path::clean(target);

        let mut virtuals = Vec::new();
        for mount in self.child_mounts(&target) {
            let mut info = match mount.fs.stat("/").await {
                Ok(info) => info,
                Err(err) => {
                    debug!(mountpoint = %mount.mountpoint, %err, "mount root stat failed, synthesizing");
                    self.synthetic_dir(&mount.mountpoint)
                }
            };
            info.name = path::base(&mount.mountpoint);
            virtuals.push(info);
        }
        virtuals.sort_by(|a, b| a.name.cmp(&b.name));

        let inner = match self.follow_symlinks(&target, false, SYMLINK_BUDGET).await {
            Ok((mount, inner_path)) => match mount.fs.list(&inner_path).await {
                Ok(lister) => Some(lister),
                Err(Error::NotFound) if !virtuals.is_empty() => None,
                Err(err) => return Err(err),
            },
            Err(Error::NotFound) if target == "/" || !virtuals.is_empty() => None,
            Err(err) => return Err(err),
        };

        if inner.is_none() && virtuals.is_empty() && target != "/" {
            return Err(Error::NotFound);
        }
        Ok(Box::new(VirtualLister::new(virtuals, inner)))
    }

    async fn file_read(&self, target: &str) -> Result<Box<dyn FileRead>> {
        let (mount, inner) = self.follow_symlinks(target, false, SYMLINK_BUDGET).await?;
        mount.fs.file_read(&inner).await
    }

    async fn file_write(&self, target: &str, flags: OpenFlags) -> Result<Box<dyn FileWrite>> {
        let (mount, inner) = self.follow_symlinks(target, true, SYMLINK_BUDGET).await?;
        mount.fs.file_write(&inner, flags).await
    }

    async fn mkdir(&self, target: &str, mode: u32) -> Result<()> {
        let (mount, inner) = self.resolve_path(target).await?;
        if inner == "/" {
            return Err(Error::Exists);
        }
        mount.fs.mkdir(&inner, mode).await
    }

    async fn remove(&self, target: &str) -> Result<()> {
        let (mount, inner) = self.resolve_path(target).await?;
        if inner == "/" {
            // never unlink a mountpoint
            return Err(Error::Permission);
        }
        mount.fs.remove(&inner).await
    }

    async fn rmdir(&self, target: &str) -> Result<()> {
        let (mount, inner) = self.resolve_path(target).await?;
        if inner == "/" {
            return Err(Error::Permission);
        }
        mount.fs.rmdir(&inner).await
    }

    async fn rename(&self, old: &str, new: &str) -> Result<()> {
        let (old_mount, old_inner) = self.resolve_path(old).await?;
        let (new_mount, new_inner) = self.resolve_path(new).await?;
        if !Arc::ptr_eq(&old_mount, &new_mount) {
            return Err(Error::NotSupported);
        }
        old_mount.fs.rename(&old_inner, &new_inner).await
    }

    async fn chmod(&self, target: &str, mode: u32) -> Result<()> {
        let (mount, inner) = self.follow_symlinks(target, false, SYMLINK_BUDGET).await?;
        mount.fs.chmod(&inner, mode).await
    }

    async fn chown(&self, target: &str, uid: u32, gid: u32) -> Result<()> {
        let (mount, inner) = self.follow_symlinks(target, false, SYMLINK_BUDGET).await?;
        mount.fs.chown(&inner, uid, gid).await
    }

    async fn chtimes(
        &self,
        target: &str,
        atime: Option<SystemTime>,
        mtime: Option<SystemTime>,
    ) -> Result<()> {
        let (mount, inner) = self.follow_symlinks(target, false, SYMLINK_BUDGET).await?;
        mount.fs.chtimes(&inner, atime, mtime).await
    }

    async fn truncate(&self, target: &str, size: u64) -> Result<()> {
        let (mount, inner) = self.follow_symlinks(target, false, SYMLINK_BUDGET).await?;
        mount.fs.truncate(&inner, size).await
    }

    async fn set_extended_attr(&self, target: &str, name: &str, value: &[u8]) -> Result<()> {
        let (mount, inner) = self.follow_symlinks(target, false, SYMLINK_BUDGET).await?;
        mount.fs.set_extended_attr(&inner, name, value).await
    }

    async fn unset_extended_attr(&self, target: &str, name: &str) -> Result<()> {
        let (mount, inner) = self.follow_symlinks(target, false, SYMLINK_BUDGET).await?;
        mount.fs.unset_extended_attr(&inner, name).await
    }

    async fn close(&self) -> Result<()> {
        let mut errors = Vec::new();
        for mount in self.table() {
            if let Err(err) = mount.fs.close().await {
                errors.push(err);
            }
        }
        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(Error::Multi(errors)),
        }
    }

    fn symlinks(&self) -> Option<&dyn SymlinkFs> {
        Some(self)
    }

    fn links(&self) -> Option<&dyn LinkFs> {
        Some(self)
    }

    fn handles(&self) -> Option<&dyn HandleFs> {
        Some(self)
    }

    fn handle_resolver(&self) -> Option<&dyn HandleResolveFs> {
        Some(self)
    }

    fn open_files(&self) -> Option<&dyn OpenFileFs> {
        Some(self)
    }

    fn walker(&self) -> Option<&dyn WalkFs> {
        Some(self)
    }

    fn bulk_attrs(&self) -> Option<&dyn SetExtendedAttrsFs> {
        Some(self)
    }
}

#[async_trait]
impl SymlinkFs for Root {
    async fn lstat(&self, target: &str) -> Result<FileInfo> {
        let target = path::clean(target);
        match self.resolve_path(&target).await {
            Ok((mount, inner)) => {
                let looked_up = match mount.fs.symlinks() {
                    Some(sym) => sym.lstat(&inner).await,
                    None => mount.fs.stat(&inner).await,
                };
                match looked_up {
                    Ok(mut info) => {
                        info.name =
                            if target == "/" { "/".to_owned() } else { path::base(&target) };
                        Ok(info)
                    }
                    Err(Error::NotFound) if self.has_mount_below(&target) => {
                        Ok(self.synthetic_dir(&target))
                    }
                    Err(err) => Err(err),
                }
            }
            Err(Error::NotFound) if target == "/" || self.has_mount_below(&target) => {
                Ok(self.synthetic_dir(&target))
            }
            Err(err) => Err(err),
        }
    }

    async fn readlink(&self, target: &str) -> Result<String> {
        let (mount, inner) = self.resolve_path(target).await?;
        match mount.fs.symlinks() {
            Some(sym) => sym.readlink(&inner).await,
            None => Err(Error::NotSupported),
        }
    }

    async fn symlink(&self, link_target: &str, link: &str) -> Result<()> {
        let (link_mount, link_inner) = self.resolve_path(link).await?;
        if path::is_abs(link_target) {
            // absolute targets must stay within the same mount
            let (target_mount, _) = self.resolve_path(link_target).await?;
            if !Arc::ptr_eq(&target_mount, &link_mount) {
                return Err(Error::NotSupported);
            }
        }
        match link_mount.fs.symlinks() {
            Some(sym) => sym.symlink(link_target, &link_inner).await,
            None => Err(Error::NotSupported),
        }
    }
}

#[async_trait]
impl LinkFs for Root {
    async fn link(&self, link_target: &str, link: &str) -> Result<()> {
        let (target_mount, target_inner) = self.resolve_path(link_target).await?;
        let (link_mount, link_inner) = self.resolve_path(link).await?;
        if !Arc::ptr_eq(&target_mount, &link_mount) {
            return Err(Error::NotSupported);
        }
        match link_mount.fs.links() {
            Some(links) => links.link(&target_inner, &link_inner).await,
            None => Err(Error::NotSupported),
        }
    }
}

#[async_trait]
impl HandleFs for Root {
    async fn handle(&self, target: &str) -> Result<Handle> {
        let target = path::clean(target);
        if target == "/" {
            return Ok(Handle::root());
        }
        let (mount, inner) = self.follow_symlinks(&target, false, SYMLINK_BUDGET).await?;

        if let Some(resolver) = mount.fs.handle_resolver() {
            let handle = resolver.handle(&inner).await?;
            return Ok(self.prefixed_handle(&mount, handle));
        }
        if let Some(handles) = mount.fs.handles() {
            if let Some(db) = &mount.handle_db {
                let handle = handles.handle(&inner).await?;
                db.put(handle.as_bytes(), &inner).await?;
                return Ok(self.prefixed_handle(&mount, handle));
            }
        }
        if let Some(db) = &mount.handle_db {
            let generated = db.generate(&inner).await?;
            return Ok(self.prefixed_handle(&mount, Handle(generated)));
        }
        Ok(Handle::unsupported())
    }
}

#[async_trait]
impl HandleResolveFs for Root {
    async fn path(&self, handle: &Handle) -> Result<String> {
        if handle.0.is_empty() || handle.is_unsupported() {
            return Err(Error::NotSupported);
        }
        if handle.is_root() {
            return Ok("/".to_owned());
        }

        let index = handle.0[0];
        let rest = &handle.0[1..];
        let mount = self
            .table()
            .iter()
            .find(|m| m.index == index)
            .cloned()
            .ok_or(Error::NotFound)?;

        let inner = if let Some(resolver) = mount.fs.handle_resolver() {
            resolver.path(&Handle(rest.to_vec())).await?
        } else if let Some(db) = &mount.handle_db {
            db.get(rest).await?
        } else {
            return Err(Error::NotSupported);
        };

        if inner == "/" {
            Ok(mount.mountpoint.clone())
        } else {
            Ok(path::join(&[&mount.mountpoint, inner.trim_start_matches(path::SEPARATOR)]))
        }
    }
}

#[async_trait]
impl OpenFileFs for Root {
    async fn open_file(&self, target: &str, flags: OpenFlags, mode: u32) -> Result<Box<dyn File>> {
        let target = path::clean(target);
        if !self.open_file_allowed(&target) {
            return Err(Error::Permission);
        }
        let accept_dangling = flags.contains(OpenFlags::CREATE);
        let (mount, inner) =
            self.follow_symlinks(&target, accept_dangling, SYMLINK_BUDGET).await?;
        match mount.fs.open_files() {
            Some(open_files) => open_files.open_file(&inner, flags, mode).await,
            None => Err(Error::NotSupported),
        }
    }
}

#[async_trait]
impl WalkFs for Root {
    async fn walk(&self, root: &str, visit: &mut WalkVisitor<'_>) -> Result<()> {
        walk::walk(self, root, visit).await
    }
}

#[async_trait]
impl SetExtendedAttrsFs for Root {
    async fn set_extended_attrs(&self, target: &str, attrs: &Attributes) -> Result<()> {
        let (mount, inner) = self.follow_symlinks(target, false, SYMLINK_BUDGET).await?;
        if let Some(bulk) = mount.fs.bulk_attrs() {
            return bulk.set_extended_attrs(&inner, attrs).await;
        }

        // fetch-current, diff, apply
        let current = mount.fs.stat(&inner).await?.extended;
        for (name, value) in attrs.iter() {
            if current.get(name) != Some(value) {
                mount.fs.set_extended_attr(&inner, name, value).await?;
            }
        }
        for name in current.names() {
            if attrs.get(name).is_none() {
                mount.fs.unset_extended_attr(&inner, name).await?;
            }
        }
        Ok(())
    }
}

impl Root {
    /// The active configuration, for embedders and back-ends honoring
    /// hints such as `list_with_xattrs`.
    pub fn config(&self) -> &Config {
        &self.config
    }
}
