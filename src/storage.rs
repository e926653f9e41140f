//! The storage abstraction the engine consumes but does not own: a source
//! of read/write byte buffers and directory enumeration. In production this
//! is backed by the bootloader's own file-protocol shim; the crate only
//! depends on this trait boundary so that tests can substitute a real
//! filesystem tree or an in-memory fixture.

use std::path::{Path, PathBuf};

/// One entry returned while enumerating a directory.
#[derive(Debug, Clone)]
pub struct DirEntry {
    pub name: String,
    pub is_dir: bool,
}

/// Abstraction over a directory tree the cacheless context overlays.
pub trait Storage {
    /// List the immediate children of `path`.
    fn read_dir(&self, path: &Path) -> std::io::Result<Vec<DirEntry>>;

    /// Read the full contents of the file at `path`.
    fn read_file(&self, path: &Path) -> std::io::Result<Vec<u8>>;

    /// Returns true if `path` exists (file or directory).
    fn exists(&self, path: &Path) -> bool;
}

/// The obvious [`Storage`] implementation: the host filesystem.
pub struct RealFs;

impl Storage for RealFs {
    fn read_dir(&self, path: &Path) -> std::io::Result<Vec<DirEntry>> {
        let mut out = Vec::new();
        for entry in std::fs::read_dir(path)? {
            let entry = entry?;
            out.push(DirEntry {
                name: entry.file_name().to_string_lossy().into_owned(),
                is_dir: entry.file_type()?.is_dir(),
            });
        }
        Ok(out)
    }

    fn read_file(&self, path: &Path) -> std::io::Result<Vec<u8>> {
        std::fs::read(path)
    }

    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }
}

/// An in-memory [`Storage`] fixture, used by unit tests that want to avoid
/// touching the real filesystem.
#[derive(Debug, Default)]
pub struct MemFs {
    files: std::collections::HashMap<PathBuf, Vec<u8>>,
    dirs: std::collections::HashSet<PathBuf>,
}

impl MemFs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_dir(&mut self, path: impl Into<PathBuf>) -> &mut Self {
        self.dirs.insert(path.into());
        self
    }

    pub fn add_file(&mut self, path: impl Into<PathBuf>, contents: impl Into<Vec<u8>>) -> &mut Self {
        let path = path.into();
        if let Some(parent) = path.parent() {
            self.dirs.insert(parent.to_path_buf());
        }
        self.files.insert(path, contents.into());
        self
    }
}

impl Storage for MemFs {
    fn read_dir(&self, path: &Path) -> std::io::Result<Vec<DirEntry>> {
        let mut names = std::collections::BTreeSet::new();
        for dir in &self.dirs {
            if dir.parent() == Some(path) {
                names.insert((
                    dir.file_name().unwrap().to_string_lossy().into_owned(),
                    true,
                ));
            }
        }
        for file in self.files.keys() {
            if file.parent() == Some(path) {
                names.insert((
                    file.file_name().unwrap().to_string_lossy().into_owned(),
                    false,
                ));
            }
        }
        if names.is_empty() && !self.dirs.contains(path) {
            return Err(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "no such directory",
            ));
        }
        Ok(names
            .into_iter()
            .map(|(name, is_dir)| DirEntry { name, is_dir })
            .collect())
    }

    fn read_file(&self, path: &Path) -> std::io::Result<Vec<u8>> {
        self.files
            .get(path)
            .cloned()
            .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::NotFound, "no such file"))
    }

    fn exists(&self, path: &Path) -> bool {
        self.files.contains_key(path) || self.dirs.contains(path)
    }
}
