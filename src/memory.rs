//! In-memory back-end with the full capability surface: symlinks, hard
//! links, extended attributes and random-access files. Useful on its own
//! as a scratch namespace and as the reference back-end in tests.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::SystemTime;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::attr::{Attributes, FileInfo, FileType, OpenFlags, Permissions};
use crate::error::{Error, Result};
use crate::fs::{
    File, FileInfoLister, FileRead, FileWrite, Fs, LinkFs, Lister, OpenFileFs, ReadAt,
    SetExtendedAttrsFs, SymlinkFs, WriteAt,
};
use crate::path;

/// Symlink hops tolerated while resolving inside the back-end.
const SYMLINK_BUDGET: u32 = 16;

type Content = Arc<RwLock<Vec<u8>>>;

#[derive(Clone)]
enum Kind {
    Directory,
    File(Content),
    Symlink(String),
}

#[derive(Clone)]
struct Node {
    kind: Kind,
    mode: u32,
    uid: u32,
    gid: u32,
    mtime: SystemTime,
    xattrs: Attributes,
}

impl Node {
    fn directory(mode: u32) -> Self {
        Node {
            kind: Kind::Directory,
            mode,
            uid: 0,
            gid: 0,
            mtime: SystemTime::now(),
            xattrs: Attributes::new(),
        }
    }

    /// A fresh empty file; the returned handle shares its content.
    fn file(mode: u32) -> (Self, Content) {
        let content: Content = Arc::new(RwLock::new(Vec::new()));
        let node = Node {
            kind: Kind::File(Arc::clone(&content)),
            mode,
            uid: 0,
            gid: 0,
            mtime: SystemTime::now(),
            xattrs: Attributes::new(),
        };
        (node, content)
    }

    fn symlink(target: String) -> Self {
        Node {
            kind: Kind::Symlink(target),
            mode: 0o777,
            uid: 0,
            gid: 0,
            mtime: SystemTime::now(),
            xattrs: Attributes::new(),
        }
    }

    fn is_dir(&self) -> bool {
        matches!(self.kind, Kind::Directory)
    }
}

struct State {
    nodes: BTreeMap<String, Node>,
}

impl State {
    fn node(&self, path: &str) -> Result<&Node> {
        self.nodes.get(path).ok_or(Error::NotFound)
    }

    fn node_mut(&mut self, path: &str) -> Result<&mut Node> {
        self.nodes.get_mut(path).ok_or(Error::NotFound)
    }

    fn require_parent_dir(&self, target: &str) -> Result<()> {
        let (parent, _) = path::split(target);
        match self.nodes.get(&parent) {
            Some(node) if node.is_dir() => Ok(()),
            Some(_) => Err(Error::NotDir),
            None => Err(Error::NotFound),
        }
    }

    fn children<'a>(&'a self, dir: &str) -> impl Iterator<Item = (&'a String, &'a Node)> + 'a {
        let prefix = if dir == "/" { String::from("/") } else { format!("{dir}/") };
        let scope = prefix.clone();
        self.nodes
            .range(prefix.clone()..)
            .take_while(move |(k, _)| k.starts_with(&prefix))
            .filter(move |(k, _)| {
                let rest = &k[scope.len()..];
                !rest.is_empty() && !rest.contains(path::SEPARATOR)
            })
    }

    /// Follows final-component symlinks; ancestors are taken literally,
    /// since composed namespaces resolve them a level above.
    fn resolve(&self, target: &str, follow_final: bool) -> Result<String> {
        let mut current = path::clean(target);
        if !follow_final {
            return Ok(current);
        }
        for _ in 0..SYMLINK_BUDGET {
            match self.nodes.get(&current) {
                Some(Node { kind: Kind::Symlink(link_target), .. }) => {
                    current = if path::is_abs(link_target) {
                        path::clean(link_target)
                    } else {
                        let (dir, _) = path::split(&current);
                        path::join(&[&dir, link_target])
                    };
                }
                _ => return Ok(current),
            }
        }
        Err(Error::Invalid("too many levels of symbolic links".into()))
    }

    /// Hard links share content; the link count is how many names do.
    fn link_count(&self, content: &Content) -> u32 {
        self.nodes
            .values()
            .filter(|n| matches!(&n.kind, Kind::File(c) if Arc::ptr_eq(c, content)))
            .count() as u32
    }
}

/// The in-memory file system. Cheap to create, fully owned by the
/// process, nothing persists.
pub struct MemoryFs {
    state: RwLock<State>,
}

impl Default for MemoryFs {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryFs {
    pub fn new() -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert("/".to_owned(), Node::directory(0o755));
        MemoryFs { state: RwLock::new(State { nodes }) }
    }

    async fn info(&self, state: &State, node_path: &str, node: &Node) -> FileInfo {
        let (file_type, size, num_links) = match &node.kind {
            Kind::Directory => (FileType::Directory, 0, 1),
            Kind::File(content) => {
                (FileType::Regular, content.read().await.len() as u64, state.link_count(content))
            }
            Kind::Symlink(target) => (FileType::Symlink, target.len() as u64, 1),
        };
        let name = if node_path == "/" { "/".to_owned() } else { path::base(node_path) };
        FileInfo {
            name,
            size,
            file_type,
            mode: node.mode,
            mtime: node.mtime,
            uid: node.uid,
            gid: node.gid,
            num_links,
            extended: node.xattrs.clone(),
            permissions: Permissions {
                read: node.mode & 0o444 != 0,
                write: node.mode & 0o222 != 0,
                delete: true,
                own: true,
                get_extended: true,
                set_extended: true,
            },
        }
    }

    async fn stat_inner(&self, target: &str, follow: bool) -> Result<FileInfo> {
        let state = self.state.read().await;
        let resolved = state.resolve(target, follow)?;
        let node = state.node(&resolved)?;
        Ok(self.info(&state, &resolved, node).await)
    }
}

#[async_trait]
impl Fs for MemoryFs {
    async fn stat(&self, target: &str) -> Result<FileInfo> {
        self.stat_inner(target, true).await
    }

    async fn list(&self, target: &str) -> Result<Box<dyn Lister>> {
        let state = self.state.read().await;
        let resolved = state.resolve(target, true)?;
        let node = state.node(&resolved)?;
        if !node.is_dir() {
            return Err(Error::NotDir);
        }
        let mut entries = Vec::new();
        for (child_path, child) in state.children(&resolved) {
            entries.push(self.info(&state, child_path, child).await);
        }
        Ok(Box::new(FileInfoLister::new(entries)))
    }

    async fn file_read(&self, target: &str) -> Result<Box<dyn FileRead>> {
        let state = self.state.read().await;
        let resolved = state.resolve(target, true)?;
        match &state.node(&resolved)?.kind {
            Kind::File(content) => Ok(Box::new(MemoryFile {
                content: Arc::clone(content),
                readable: true,
                writable: false,
                append: false,
            })),
            Kind::Directory => Err(Error::IsDir),
            Kind::Symlink(_) => Err(Error::NotFound),
        }
    }

    async fn file_write(&self, target: &str, flags: OpenFlags) -> Result<Box<dyn FileWrite>> {
        let mut state = self.state.write().await;
        let resolved = state.resolve(target, true)?;

        let existing = match state.nodes.get(&resolved) {
            Some(node) => match &node.kind {
                Kind::Directory => return Err(Error::IsDir),
                Kind::Symlink(_) => return Err(Error::NotFound),
                Kind::File(content) => Some(Arc::clone(content)),
            },
            None => None,
        };
        let content = match existing {
            Some(content) => {
                if flags.contains(OpenFlags::CREATE | OpenFlags::EXCL) {
                    return Err(Error::Exists);
                }
                if flags.contains(OpenFlags::TRUNC) {
                    content.write().await.clear();
                }
                content
            }
            None => {
                if !flags.contains(OpenFlags::CREATE) {
                    return Err(Error::NotFound);
                }
                state.require_parent_dir(&resolved)?;
                let (node, content) = Node::file(0o644);
                state.nodes.insert(resolved.clone(), node);
                content
            }
        };

        if let Ok(node) = state.node_mut(&resolved) {
            node.mtime = SystemTime::now();
        }
        Ok(Box::new(MemoryFile {
            content,
            readable: false,
            writable: true,
            append: flags.contains(OpenFlags::APPEND),
        }))
    }

    async fn mkdir(&self, target: &str, mode: u32) -> Result<()> {
        let mut state = self.state.write().await;
        let target = path::clean(target);
        if state.nodes.contains_key(&target) {
            return Err(Error::Exists);
        }
        state.require_parent_dir(&target)?;
        state.nodes.insert(target, Node::directory(mode));
        Ok(())
    }

    async fn remove(&self, target: &str) -> Result<()> {
        let mut state = self.state.write().await;
        let target = path::clean(target);
        let node = state.node(&target)?;
        if node.is_dir() {
            return Err(Error::IsDir);
        }
        state.nodes.remove(&target);
        Ok(())
    }

    async fn rmdir(&self, target: &str) -> Result<()> {
        let mut state = self.state.write().await;
        let target = path::clean(target);
        if target == "/" {
            return Err(Error::Invalid("cannot remove the root directory".into()));
        }
        let node = state.node(&target)?;
        if !node.is_dir() {
            return Err(Error::NotDir);
        }
        if state.children(&target).next().is_some() {
            return Err(Error::NotEmpty);
        }
        state.nodes.remove(&target);
        Ok(())
    }

    async fn rename(&self, old: &str, new: &str) -> Result<()> {
        let mut state = self.state.write().await;
        let old = path::clean(old);
        let new = path::clean(new);

        if !state.nodes.contains_key(&old) {
            return Err(Error::NotFound);
        }
        if state.nodes.contains_key(&new) {
            return Err(Error::Exists);
        }
        state.require_parent_dir(&new)?;

        let old_prefix = format!("{old}/");
        let moved: Vec<String> = state
            .nodes
            .keys()
            .filter(|k| **k == old || k.starts_with(&old_prefix))
            .cloned()
            .collect();
        for key in moved {
            let node = state.nodes.remove(&key).expect("key listed above");
            let renamed = format!("{new}{}", &key[old.len()..]);
            state.nodes.insert(renamed, node);
        }
        Ok(())
    }

    async fn chmod(&self, target: &str, mode: u32) -> Result<()> {
        let mut state = self.state.write().await;
        let resolved = state.resolve(target, true)?;
        state.node_mut(&resolved)?.mode = mode;
        Ok(())
    }

    async fn chown(&self, target: &str, uid: u32, gid: u32) -> Result<()> {
        let mut state = self.state.write().await;
        let resolved = state.resolve(target, true)?;
        let node = state.node_mut(&resolved)?;
        node.uid = uid;
        node.gid = gid;
        Ok(())
    }

    async fn chtimes(
        &self,
        target: &str,
        _atime: Option<SystemTime>,
        mtime: Option<SystemTime>,
    ) -> Result<()> {
        let mut state = self.state.write().await;
        let resolved = state.resolve(target, true)?;
        let node = state.node_mut(&resolved)?;
        if let Some(mtime) = mtime {
            node.mtime = mtime;
        }
        Ok(())
    }

    async fn truncate(&self, target: &str, size: u64) -> Result<()> {
        let state = self.state.read().await;
        let resolved = state.resolve(target, true)?;
        match &state.node(&resolved)?.kind {
            Kind::File(content) => {
                content.write().await.resize(size as usize, 0);
                Ok(())
            }
            Kind::Directory => Err(Error::IsDir),
            Kind::Symlink(_) => Err(Error::NotFound),
        }
    }

    async fn set_extended_attr(&self, target: &str, name: &str, value: &[u8]) -> Result<()> {
        let mut state = self.state.write().await;
        let resolved = state.resolve(target, true)?;
        state.node_mut(&resolved)?.xattrs.set(name, value);
        Ok(())
    }

    async fn unset_extended_attr(&self, target: &str, name: &str) -> Result<()> {
        let mut state = self.state.write().await;
        let resolved = state.resolve(target, true)?;
        state.node_mut(&resolved)?.xattrs.delete(name);
        Ok(())
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

    fn open_files(&self) -> Option<&dyn OpenFileFs> {
        Some(self)
    }

    fn bulk_attrs(&self) -> Option<&dyn SetExtendedAttrsFs> {
        Some(self)
    }
}

#[async_trait]
impl SymlinkFs for MemoryFs {
    async fn lstat(&self, target: &str) -> Result<FileInfo> {
        self.stat_inner(target, false).await
    }

    async fn readlink(&self, target: &str) -> Result<String> {
        let state = self.state.read().await;
        match &state.node(&path::clean(target))?.kind {
            Kind::Symlink(link_target) => Ok(link_target.clone()),
            _ => Err(Error::Invalid("not a symlink".into())),
        }
    }

    async fn symlink(&self, link_target: &str, link: &str) -> Result<()> {
        let mut state = self.state.write().await;
        let link = path::clean(link);
        if state.nodes.contains_key(&link) {
            return Err(Error::Exists);
        }
        state.require_parent_dir(&link)?;
        state.nodes.insert(link, Node::symlink(link_target.to_owned()));
        Ok(())
    }
}

#[async_trait]
impl LinkFs for MemoryFs {
    async fn link(&self, link_target: &str, link: &str) -> Result<()> {
        let mut state = self.state.write().await;
        let target = state.resolve(link_target, true)?;
        let link = path::clean(link);
        if state.nodes.contains_key(&link) {
            return Err(Error::Exists);
        }
        state.require_parent_dir(&link)?;

        let node = state.node(&target)?;
        let linked = match &node.kind {
            Kind::File(content) => {
                Node { kind: Kind::File(Arc::clone(content)), ..node.clone() }
            }
            Kind::Directory => return Err(Error::IsDir),
            Kind::Symlink(_) => return Err(Error::Invalid("cannot hard-link a symlink".into())),
        };
        state.nodes.insert(link, linked);
        Ok(())
    }
}

#[async_trait]
impl OpenFileFs for MemoryFs {
    async fn open_file(&self, target: &str, flags: OpenFlags, _mode: u32) -> Result<Box<dyn File>> {
        let readable = flags.contains(OpenFlags::READ) || !flags.contains(OpenFlags::WRITE);
        let writable = flags.contains(OpenFlags::WRITE);
        if writable {
            let handle = self.file_write(target, flags).await?;
            drop(handle);
        }

        let state = self.state.read().await;
        let resolved = state.resolve(target, true)?;
        match &state.node(&resolved)?.kind {
            Kind::File(content) => Ok(Box::new(MemoryFile {
                content: Arc::clone(content),
                readable,
                writable,
                append: flags.contains(OpenFlags::APPEND),
            })),
            Kind::Directory => Err(Error::IsDir),
            Kind::Symlink(_) => Err(Error::NotFound),
        }
    }
}

#[async_trait]
impl SetExtendedAttrsFs for MemoryFs {
    async fn set_extended_attrs(&self, target: &str, attrs: &Attributes) -> Result<()> {
        let mut state = self.state.write().await;
        let resolved = state.resolve(target, true)?;
        let node = state.node_mut(&resolved)?;
        let stale: Vec<String> = node
            .xattrs
            .names()
            .filter(|name| attrs.get(name).is_none())
            .map(str::to_owned)
            .collect();
        for name in stale {
            node.xattrs.delete(&name);
        }
        for (name, value) in attrs.iter() {
            node.xattrs.set(name, value);
        }
        Ok(())
    }
}

/// Open handle onto shared file content.
struct MemoryFile {
    content: Content,
    readable: bool,
    writable: bool,
    append: bool,
}

#[async_trait]
impl ReadAt for MemoryFile {
    async fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        if !self.readable {
            return Err(Error::Permission);
        }
        let content = self.content.read().await;
        let offset = offset as usize;
        if offset >= content.len() {
            return Ok(0);
        }
        let n = buf.len().min(content.len() - offset);
        buf[..n].copy_from_slice(&content[offset..offset + n]);
        Ok(n)
    }
}

#[async_trait]
impl WriteAt for MemoryFile {
    async fn write_at(&self, data: &[u8], offset: u64) -> Result<usize> {
        if !self.writable {
            return Err(Error::Permission);
        }
        let mut content = self.content.write().await;
        if self.append {
            content.extend_from_slice(data);
            return Ok(data.len());
        }
        let offset = offset as usize;
        if content.len() < offset + data.len() {
            content.resize(offset + data.len(), 0);
        }
        content[offset..offset + data.len()].copy_from_slice(data);
        Ok(data.len())
    }
}

#[async_trait]
impl FileRead for MemoryFile {
    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
impl FileWrite for MemoryFile {
    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
impl File for MemoryFile {
    async fn truncate(&self, size: u64) -> Result<()> {
        if !self.writable {
            return Err(Error::Permission);
        }
        self.content.write().await.resize(size as usize, 0);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::util;

    #[tokio::test]
    async fn write_then_read_round_trips() {
        let fs = MemoryFs::new();
        util::write_file(&fs, "/hello.txt", b"hi there").await.unwrap();
        assert_eq!(util::read_file(&fs, "/hello.txt").await.unwrap(), b"hi there");

        let info = fs.stat("/hello.txt").await.unwrap();
        assert_eq!(info.size, 8);
        assert_eq!(info.file_type, FileType::Regular);
        assert_eq!(info.name, "hello.txt");
    }

    #[tokio::test]
    async fn listing_is_sorted_and_scoped() {
        let fs = MemoryFs::new();
        fs.mkdir("/b", 0o755).await.unwrap();
        fs.mkdir("/a", 0o755).await.unwrap();
        fs.mkdir("/a/nested", 0o755).await.unwrap();
        util::write_file(&fs, "/c.txt", b"x").await.unwrap();

        let mut lister = fs.list("/").await.unwrap();
        let page = lister.list_at(0, 16).await.unwrap();
        let names: Vec<&str> = page.entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b", "c.txt"]);
        assert!(page.eof);
    }

    #[tokio::test]
    async fn remove_refuses_directories() {
        let fs = MemoryFs::new();
        fs.mkdir("/d", 0o755).await.unwrap();
        assert_eq!(fs.remove("/d").await.unwrap_err(), Error::IsDir);
        fs.rmdir("/d").await.unwrap();
        assert_eq!(fs.stat("/d").await.unwrap_err(), Error::NotFound);
    }

    #[tokio::test]
    async fn rename_refuses_existing_target_and_moves_subtrees() {
        let fs = MemoryFs::new();
        fs.mkdir("/src", 0o755).await.unwrap();
        util::write_file(&fs, "/src/f", b"1").await.unwrap();
        fs.mkdir("/other", 0o755).await.unwrap();

        assert_eq!(fs.rename("/src", "/other").await.unwrap_err(), Error::Exists);

        fs.rename("/src", "/dst").await.unwrap();
        assert_eq!(util::read_file(&fs, "/dst/f").await.unwrap(), b"1");
        assert_eq!(fs.stat("/src").await.unwrap_err(), Error::NotFound);
    }

    #[tokio::test]
    async fn hard_links_share_content() {
        let fs = MemoryFs::new();
        util::write_file(&fs, "/orig", b"shared").await.unwrap();
        fs.link("/orig", "/alias").await.unwrap();

        assert_eq!(util::read_file(&fs, "/alias").await.unwrap(), b"shared");
        assert_eq!(fs.stat("/orig").await.unwrap().num_links, 2);

        util::write_file(&fs, "/alias", b"updated").await.unwrap();
        assert_eq!(util::read_file(&fs, "/orig").await.unwrap(), b"updated");
    }

    #[tokio::test]
    async fn symlinks_follow_on_stat_but_not_lstat() {
        let fs = MemoryFs::new();
        util::write_file(&fs, "/real", b"data").await.unwrap();
        fs.symlink("/real", "/ptr").await.unwrap();

        assert_eq!(fs.stat("/ptr").await.unwrap().file_type, FileType::Regular);
        assert_eq!(fs.lstat("/ptr").await.unwrap().file_type, FileType::Symlink);
        assert_eq!(fs.readlink("/ptr").await.unwrap(), "/real");
    }

    #[tokio::test]
    async fn excl_create_and_missing_parent() {
        let fs = MemoryFs::new();
        util::write_file(&fs, "/f", b"x").await.unwrap();

        let err = fs
            .file_write("/f", OpenFlags::WRITE | OpenFlags::CREATE | OpenFlags::EXCL)
            .await
            .unwrap_err();
        assert_eq!(err, Error::Exists);

        let err = fs.file_write("/no/parent", OpenFlags::write_truncate()).await.unwrap_err();
        assert_eq!(err, Error::NotFound);
    }

    #[tokio::test]
    async fn bulk_attrs_diff_and_apply() {
        let fs = MemoryFs::new();
        util::write_file(&fs, "/f", b"x").await.unwrap();
        fs.set_extended_attr("/f", "keep", b"1").await.unwrap();
        fs.set_extended_attr("/f", "drop", b"2").await.unwrap();

        let attrs = Attributes::from([("keep", &b"1"[..]), ("new", &b"3"[..])]);
        fs.set_extended_attrs("/f", &attrs).await.unwrap();

        let info = fs.stat("/f").await.unwrap();
        assert_eq!(info.extended.get("keep"), Some(&b"1"[..]));
        assert_eq!(info.extended.get("new"), Some(&b"3"[..]));
        assert_eq!(info.extended.get("drop"), None);
    }
}
