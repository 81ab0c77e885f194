//! Storage adapter: filesystem-like byte-stream providers
//!
//! Trial directories are written through a small [`Storage`] trait so the
//! tracker core never touches `std::fs` directly. Backends are resolved from a
//! URI scheme through an explicit [`StorageRegistry`], built once at
//! initialization.
//!
//! Write-mode opens carry an auto-commit contract: backends where writes are
//! not durable until explicitly committed (e.g. object stores) return handles
//! whose [`WriteHandle::commit`] performs the publish; with
//! [`AutoCommit::OnClose`] the handle commits itself when closed.

use std::collections::HashMap;
use std::fs;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::debug;

use crate::error::{Error, Result};

/// Commit policy for write-mode opens.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AutoCommit {
    /// Commit automatically when the handle is closed.
    OnClose,
    /// The caller invokes [`WriteHandle::commit`] explicitly after writing.
    Manual,
}

/// A writable byte stream with an explicit commit step.
pub trait WriteHandle: Write {
    /// Make the written bytes durable/visible.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend fails to persist the stream.
    fn commit(self: Box<Self>) -> Result<()>;
}

/// Filesystem-like provider for one storage backend.
pub trait Storage: Send + Sync {
    /// Open a path for reading.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] with `NotFound` when the path does not exist.
    fn open_read(&self, path: &str) -> Result<Box<dyn Read>>;

    /// Open a path for writing, truncating any existing content.
    ///
    /// # Errors
    ///
    /// Returns an error if the path cannot be created.
    fn open_write(&self, path: &str, autocommit: AutoCommit) -> Result<Box<dyn WriteHandle>>;

    /// List entry names (not full paths) directly under a directory.
    ///
    /// Missing directories list as empty.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be enumerated.
    fn list(&self, dir: &str) -> Result<Vec<String>>;

    /// List file paths under a directory recursively, relative to it.
    ///
    /// Missing directories list as empty. Path separators in the returned
    /// names are always `/`.
    ///
    /// # Errors
    ///
    /// Returns an error if the tree cannot be enumerated.
    fn list_all(&self, dir: &str) -> Result<Vec<String>>;

    /// Whether a path exists.
    fn exists(&self, path: &str) -> bool;
}

/// Read a path fully into a string.
///
/// # Errors
///
/// Returns an error if the path cannot be opened or read.
pub fn read_to_string(storage: &dyn Storage, path: &str) -> Result<String> {
    let mut buf = String::new();
    storage.open_read(path)?.read_to_string(&mut buf)?;
    Ok(buf)
}

/// Write bytes to a path and commit.
///
/// # Errors
///
/// Returns an error if the path cannot be written or committed.
pub fn write_all(storage: &dyn Storage, path: &str, bytes: &[u8]) -> Result<()> {
    let mut f = storage.open_write(path, AutoCommit::Manual)?;
    f.write_all(bytes)?;
    f.commit()
}

/// Local-disk backend over `std::fs`, with auto-created parent directories.
#[derive(Debug, Default)]
pub struct LocalStorage;

struct LocalFile {
    file: fs::File,
    path: PathBuf,
}

impl Write for LocalFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.file.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

impl WriteHandle for LocalFile {
    fn commit(mut self: Box<Self>) -> Result<()> {
        debug!(path = %self.path.display(), "commit file");
        self.file.flush()?;
        Ok(())
    }
}

impl Drop for LocalFile {
    fn drop(&mut self) {
        // OnClose contract: local writes are durable once flushed.
        let _ = self.file.flush();
    }
}

impl std::fmt::Debug for dyn Storage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("dyn Storage")
    }
}

impl Storage for LocalStorage {
    fn open_read(&self, path: &str) -> Result<Box<dyn Read>> {
        Ok(Box::new(fs::File::open(path)?))
    }

    fn open_write(&self, path: &str, _autocommit: AutoCommit) -> Result<Box<dyn WriteHandle>> {
        if let Some(parent) = Path::new(path).parent() {
            fs::create_dir_all(parent)?;
        }
        let file = fs::File::create(path)?;
        Ok(Box::new(LocalFile {
            file,
            path: PathBuf::from(path),
        }))
    }

    fn list(&self, dir: &str) -> Result<Vec<String>> {
        let mut names = Vec::new();
        let rd = match fs::read_dir(dir) {
            Ok(rd) => rd,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(names),
            Err(e) => return Err(e.into()),
        };
        for entry in rd {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                names.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        names.sort();
        Ok(names)
    }

    fn list_all(&self, dir: &str) -> Result<Vec<String>> {
        fn walk(root: &Path, dir: &Path, names: &mut Vec<String>) -> io::Result<()> {
            for entry in fs::read_dir(dir)? {
                let entry = entry?;
                if entry.file_type()?.is_dir() {
                    walk(root, &entry.path(), names)?;
                } else if let Ok(rel) = entry.path().strip_prefix(root) {
                    names.push(rel.to_string_lossy().replace('\\', "/"));
                }
            }
            Ok(())
        }

        let root = Path::new(dir);
        let mut names = Vec::new();
        match walk(root, root, &mut names) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        names.sort();
        Ok(names)
    }

    fn exists(&self, path: &str) -> bool {
        Path::new(path).exists()
    }
}

/// Constructor for a storage backend.
pub type StorageFactory = Box<dyn Fn() -> Arc<dyn Storage> + Send + Sync>;

/// Explicit scheme-to-backend registry, resolved once at initialization.
pub struct StorageRegistry {
    factories: HashMap<String, StorageFactory>,
}

impl Default for StorageRegistry {
    fn default() -> Self {
        let mut reg = Self {
            factories: HashMap::new(),
        };
        reg.register("file", || Arc::new(LocalStorage));
        reg
    }
}

impl StorageRegistry {
    /// Create a registry with the built-in `file` backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) a backend constructor for a scheme.
    pub fn register<F>(&mut self, scheme: impl Into<String>, factory: F)
    where
        F: Fn() -> Arc<dyn Storage> + Send + Sync + 'static,
    {
        self.factories.insert(scheme.into(), Box::new(factory));
    }

    /// Resolve a path or URI to a backend plus the backend-local path.
    ///
    /// Paths without a scheme resolve to `file`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownScheme`] when no backend claims the scheme.
    pub fn resolve(&self, uri: &str) -> Result<(Arc<dyn Storage>, String)> {
        let (scheme, rest) = split_scheme(uri);
        let factory = self
            .factories
            .get(scheme)
            .ok_or_else(|| Error::UnknownScheme {
                scheme: scheme.to_string(),
            })?;
        Ok((factory(), rest.to_string()))
    }
}

fn split_scheme(uri: &str) -> (&str, &str) {
    match uri.split_once("://") {
        // Windows drive letters are not schemes.
        Some((scheme, rest)) if scheme.len() > 1 => (scheme, rest),
        _ => ("file", uri),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_scheme() {
        assert_eq!(split_scheme("/tmp/x"), ("file", "/tmp/x"));
        assert_eq!(split_scheme("s3://bucket/x"), ("s3", "bucket/x"));
    }

    #[test]
    fn test_registry_unknown_scheme() {
        let reg = StorageRegistry::new();
        let err = reg.resolve("s3://bucket/x").unwrap_err();
        assert!(matches!(err, Error::UnknownScheme { .. }));
    }

    #[test]
    fn test_local_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let storage = LocalStorage;
        let path = dir.path().join("a/b/data.txt");
        let path = path.to_string_lossy().into_owned();

        write_all(&storage, &path, b"hello").unwrap();
        assert!(storage.exists(&path));
        assert_eq!(read_to_string(&storage, &path).unwrap(), "hello");

        let parent = dir.path().join("a/b");
        let names = storage.list(&parent.to_string_lossy()).unwrap();
        assert_eq!(names, vec!["data.txt"]);
    }

    #[test]
    fn test_list_missing_dir_is_empty() {
        let storage = LocalStorage;
        assert!(storage.list("/definitely/not/here").unwrap().is_empty());
        assert!(storage.list_all("/definitely/not/here").unwrap().is_empty());
    }

    #[test]
    fn test_list_all_recurses_with_relative_paths() {
        let dir = tempfile::tempdir().unwrap();
        let storage = LocalStorage;
        let root = dir.path().to_string_lossy().into_owned();

        write_all(&storage, &format!("{root}/top.txt"), b"a").unwrap();
        write_all(&storage, &format!("{root}/logs/out.txt"), b"b").unwrap();
        write_all(&storage, &format!("{root}/logs/deep/err.txt"), b"c").unwrap();

        assert_eq!(
            storage.list_all(&root).unwrap(),
            vec!["logs/deep/err.txt", "logs/out.txt", "top.txt"]
        );
        // The shallow listing still shows only direct file children.
        assert_eq!(storage.list(&root).unwrap(), vec!["top.txt"]);
    }
}
