//! File attributes: entry metadata, extended attributes and the advisory
//! permission booleans forwarded from back-ends.

use std::time::SystemTime;

use bitflags::bitflags;

/// File type bits carried separately from the permission bits.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum FileType {
    Regular,
    Directory,
    Symlink,
}

bitflags! {
    /// POSIX-style open flags accepted by `file_write` and `open_file`.
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub struct OpenFlags: u32 {
        const READ   = 0x01;
        const WRITE  = 0x02;
        const CREATE = 0x04;
        const EXCL   = 0x08;
        const TRUNC  = 0x10;
        const APPEND = 0x20;
    }
}

impl OpenFlags {
    /// Flags for a plain read-only open.
    pub fn read_only() -> Self {
        OpenFlags::READ
    }

    /// Flags for create-or-truncate writing, the common upload case.
    pub fn write_truncate() -> Self {
        OpenFlags::WRITE | OpenFlags::CREATE | OpenFlags::TRUNC
    }
}

/// What the calling identity may do with an entry, as reported by the
/// back-end. Indicative only; the authoritative answer is whatever the
/// back-end returns when the operation is actually attempted.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub struct Permissions {
    pub read: bool,
    pub write: bool,
    pub delete: bool,
    pub own: bool,
    pub get_extended: bool,
    pub set_extended: bool,
}

impl Permissions {
    /// Every permission granted.
    pub fn all() -> Self {
        Permissions {
            read: true,
            write: true,
            delete: true,
            own: true,
            get_extended: true,
            set_extended: true,
        }
    }

    /// Read-side permissions only.
    pub fn read_only() -> Self {
        Permissions { read: true, get_extended: true, ..Permissions::default() }
    }
}

/// Ordered mapping from extended attribute names to raw byte values.
///
/// Keys are unique; insertion order is preserved for diagnostics but is
/// not significant to the core.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Attributes {
    entries: Vec<(String, Vec<u8>)>,
}

impl Attributes {
    pub fn new() -> Self {
        Attributes::default()
    }

    /// Looks up the raw value of an attribute.
    pub fn get(&self, name: &str) -> Option<&[u8]> {
        self.entries.iter().find(|(k, _)| k == name).map(|(_, v)| v.as_slice())
    }

    /// Looks up an attribute and decodes it as UTF-8, returning `None`
    /// when the attribute is missing or not valid UTF-8.
    pub fn get_string(&self, name: &str) -> Option<String> {
        self.get(name).and_then(|v| std::str::from_utf8(v).ok()).map(str::to_owned)
    }

    /// Inserts or replaces an attribute.
    pub fn set(&mut self, name: &str, value: &[u8]) {
        match self.entries.iter_mut().find(|(k, _)| k == name) {
            Some((_, v)) => *v = value.to_vec(),
            None => self.entries.push((name.to_owned(), value.to_vec())),
        }
    }

    /// Removes an attribute if present.
    pub fn delete(&mut self, name: &str) {
        self.entries.retain(|(k, _)| k != name);
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[u8])> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(k, _)| k.as_str())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<const N: usize> From<[(&str, &[u8]); N]> for Attributes {
    fn from(pairs: [(&str, &[u8]); N]) -> Self {
        let mut attrs = Attributes::new();
        for (k, v) in pairs {
            attrs.set(k, v);
        }
        attrs
    }
}

/// Semantic attributes of a single filesystem entry.
#[derive(Debug, Clone, PartialEq)]
pub struct FileInfo {
    /// Last path component.
    pub name: String,
    /// Size in bytes; 0 for directories.
    pub size: u64,
    pub file_type: FileType,
    /// POSIX permission bits; the type lives in [`FileInfo::file_type`].
    pub mode: u32,
    pub mtime: SystemTime,
    pub uid: u32,
    pub gid: u32,
    pub num_links: u32,
    pub extended: Attributes,
    pub permissions: Permissions,
}

impl FileInfo {
    /// A directory entry with permissive defaults, used for synthetic
    /// directories and back-end roots.
    pub fn directory(name: impl Into<String>, mode: u32) -> Self {
        FileInfo {
            name: name.into(),
            size: 0,
            file_type: FileType::Directory,
            mode,
            mtime: SystemTime::now(),
            uid: 0,
            gid: 0,
            num_links: 1,
            extended: Attributes::new(),
            permissions: Permissions::read_only(),
        }
    }

    /// A regular-file entry with the given size.
    pub fn regular(name: impl Into<String>, size: u64, mode: u32) -> Self {
        FileInfo {
            name: name.into(),
            size,
            file_type: FileType::Regular,
            mode,
            mtime: SystemTime::now(),
            uid: 0,
            gid: 0,
            num_links: 1,
            extended: Attributes::new(),
            permissions: Permissions::all(),
        }
    }

    pub fn is_dir(&self) -> bool {
        self.file_type == FileType::Directory
    }

    pub fn is_symlink(&self) -> bool {
        self.file_type == FileType::Symlink
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attributes_keep_insertion_order_and_unique_keys() {
        let mut attrs = Attributes::new();
        attrs.set("b", b"1");
        attrs.set("a", b"2");
        attrs.set("b", b"3");

        assert_eq!(attrs.len(), 2);
        assert_eq!(attrs.names().collect::<Vec<_>>(), vec!["b", "a"]);
        assert_eq!(attrs.get("b"), Some(&b"3"[..]));

        attrs.delete("b");
        assert_eq!(attrs.get("b"), None);
        assert_eq!(attrs.len(), 1);
    }

    #[test]
    fn get_string_requires_utf8() {
        let mut attrs = Attributes::new();
        attrs.set("ok", "value".as_bytes());
        attrs.set("raw", &[0xff, 0xfe]);
        assert_eq!(attrs.get_string("ok").as_deref(), Some("value"));
        assert_eq!(attrs.get_string("raw"), None);
    }
}
