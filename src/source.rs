//! Read access to migration and seed files.
//!
//! The runners never touch the filesystem directly; they go through a [`FileSource`],
//! which is the disk by default and an in-memory tree in tests or when scripts are
//! compiled into the binary.

use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};

/// One entry of a listed directory.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct SourceEntry {
    pub name: String,
    pub is_dir: bool,
}

/// A read-only tree of script files.
pub trait FileSource: Send + Sync {
    /// Entries directly under `dir`, in no particular order.
    fn list(&self, dir: &Path) -> io::Result<Vec<SourceEntry>>;

    fn read(&self, path: &Path) -> io::Result<Vec<u8>>;

    fn read_to_string(&self, path: &Path) -> io::Result<String> {
        String::from_utf8(self.read(path)?)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }
}

/// Files on the local filesystem.
#[derive(Debug, Clone, Copy, Default)]
pub struct DiskSource;

impl FileSource for DiskSource {
    fn list(&self, dir: &Path) -> io::Result<Vec<SourceEntry>> {
        std::fs::read_dir(dir)?
            .map(|entry| {
                let entry = entry?;
                Ok(SourceEntry {
                    name: entry.file_name().to_string_lossy().into_owned(),
                    is_dir: entry.file_type()?.is_dir(),
                })
            })
            .collect()
    }

    fn read(&self, path: &Path) -> io::Result<Vec<u8>> {
        std::fs::read(path)
    }
}

/// Files held in memory, keyed by path.
#[derive(Debug, Clone, Default)]
pub struct MemorySource {
    files: BTreeMap<PathBuf, Vec<u8>>,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a file; parent directories exist implicitly.
    pub fn with_file(mut self, path: impl Into<PathBuf>, contents: impl Into<Vec<u8>>) -> Self {
        self.insert(path, contents);
        self
    }

    pub fn insert(&mut self, path: impl Into<PathBuf>, contents: impl Into<Vec<u8>>) {
        self.files.insert(path.into(), contents.into());
    }
}

impl FileSource for MemorySource {
    fn list(&self, dir: &Path) -> io::Result<Vec<SourceEntry>> {
        let mut entries = BTreeMap::new();
        for path in self.files.keys() {
            let Ok(rest) = path.strip_prefix(dir) else {
                continue;
            };
            let mut components = rest.components();
            let Some(first) = components.next() else {
                continue;
            };
            let name = first.as_os_str().to_string_lossy().into_owned();
            let is_dir = components.next().is_some();
            entries
                .entry(name)
                .and_modify(|d: &mut bool| *d |= is_dir)
                .or_insert(is_dir);
        }
        if entries.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("directory '{}' not found", dir.display()),
            ));
        }
        Ok(entries
            .into_iter()
            .map(|(name, is_dir)| SourceEntry { name, is_dir })
            .collect())
    }

    fn read(&self, path: &Path) -> io::Result<Vec<u8>> {
        self.files.get(path).cloned().ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("file '{}' not found", path.display()),
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_source_lists_direct_children() {
        let source = MemorySource::new()
            .with_file("db/seed/main/001_a.sql", "SELECT 1")
            .with_file("db/seed/main/nested/x.sql", "")
            .with_file("db/seed/other/002_b.sql", "");

        let entries = source.list(Path::new("db/seed/main")).unwrap();
        assert_eq!(
            entries,
            vec![
                SourceEntry { name: "001_a.sql".into(), is_dir: false },
                SourceEntry { name: "nested".into(), is_dir: true },
            ]
        );
        assert_eq!(
            source.read_to_string(Path::new("db/seed/main/001_a.sql")).unwrap(),
            "SELECT 1"
        );
    }

    #[test]
    fn test_memory_source_missing_paths() {
        let source = MemorySource::new().with_file("db/seed/main/a.sql", "");
        assert_eq!(
            source.list(Path::new("db/seed/none")).unwrap_err().kind(),
            io::ErrorKind::NotFound
        );
        assert_eq!(
            source.read(Path::new("db/seed/main/b.sql")).unwrap_err().kind(),
            io::ErrorKind::NotFound
        );
    }

    #[test]
    fn test_disk_source() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.sql"), "SELECT 1").unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();

        let mut entries = DiskSource.list(dir.path()).unwrap();
        entries.sort();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0], SourceEntry { name: "a.sql".into(), is_dir: false });
        assert!(entries[1].is_dir);
        assert_eq!(DiskSource.read(&dir.path().join("a.sql")).unwrap(), b"SELECT 1");
    }
}
