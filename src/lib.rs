//! mosaicfs - a pluggable virtual file system.
//!
//! Heterogeneous storage back-ends implement the [`fs::Fs`] trait (plus
//! whichever capability refinements they can honor) and are composed by
//! [`root::Root`] into a single namespace with cross-mount symlink
//! resolution, synthetic directories and a stable opaque-handle service
//! that survives process restarts through the on-disk
//! [`bytetree::ByteTree`] index.

pub mod attr;
pub mod bytetree;
pub mod chunk;
pub mod config;
pub mod error;
pub mod fs;
pub mod handledb;
pub mod ingest;
pub mod local;
pub mod memory;
pub mod path;
pub mod root;
pub mod subdir;
pub mod walk;
pub mod wrapdir;

pub use attr::{Attributes, FileInfo, FileType, OpenFlags, Permissions};
pub use config::Config;
pub use error::{Error, Result};
pub use fs::{Fs, Handle, ListPage, Lister};
pub use root::{Mount, Root};
pub use walk::Walk;
