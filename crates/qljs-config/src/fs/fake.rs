//! In-memory filesystem test double
//!
//! A deterministic [`ConfigFilesystem`] over a virtual tree rooted at a
//! sentinel prefix. Lets resolver behavior be tested without OS coupling:
//! canonicalization is purely lexical, directories exist exactly when a
//! file lives under them, and nothing is ever watched.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::canonical::{normalize_lexically, CanonicalPath, CanonicalPathResult};
use crate::error::{CanonicalizeError, FileReadError};

use super::ConfigFilesystem;

#[cfg(windows)]
const FAKE_ROOT: &str = r"C:\fake";
#[cfg(not(windows))]
const FAKE_ROOT: &str = "/fake";

/// In-memory fake filesystem rooted at a sentinel prefix.
#[derive(Debug, Default)]
pub struct FakeFilesystem {
    files: Mutex<HashMap<PathBuf, Vec<u8>>>,
}

impl FakeFilesystem {
    pub fn new() -> Self {
        Self::default()
    }

    /// The sentinel root all fake paths live under.
    pub fn root(&self) -> &'static Path {
        Path::new(FAKE_ROOT)
    }

    /// A path string under the fake root, e.g. `rooted("dir/hello.js")`.
    pub fn rooted(&self, suffix: &str) -> String {
        let mut path = self.root().to_path_buf();
        path.push(suffix);
        path.to_string_lossy().into_owned()
    }

    /// Create (or overwrite) a file. Parent directories exist implicitly.
    pub fn create_file(&self, path: impl AsRef<Path>, content: impl AsRef<[u8]>) {
        let normalized = self.absolute(path.as_ref());
        self.files
            .lock()
            .expect("fake filesystem lock poisoned")
            .insert(normalized, content.as_ref().to_vec());
    }

    /// Remove a file. Missing files are ignored.
    pub fn remove_file(&self, path: impl AsRef<Path>) {
        let normalized = self.absolute(path.as_ref());
        self.files
            .lock()
            .expect("fake filesystem lock poisoned")
            .remove(&normalized);
    }

    fn absolute(&self, path: &Path) -> PathBuf {
        let joined = if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root().join(path)
        };
        normalize_lexically(&joined)
    }

    fn is_directory(&self, path: &Path) -> bool {
        if path == self.root() || self.root().starts_with(path) {
            return true;
        }
        let files = self.files.lock().expect("fake filesystem lock poisoned");
        files.keys().any(|file| file.starts_with(path))
    }

    fn is_file(&self, path: &Path) -> bool {
        let files = self.files.lock().expect("fake filesystem lock poisoned");
        files.contains_key(path)
    }
}

impl ConfigFilesystem for FakeFilesystem {
    fn canonicalize_path(&self, path: &str) -> Result<CanonicalPathResult, CanonicalizeError> {
        let normalized = self.absolute(Path::new(path));
        let mut missing = 0;
        let mut probe = normalized.clone();
        while !self.is_file(&probe) && !self.is_directory(&probe) {
            if !probe.pop() {
                break;
            }
            missing += 1;
        }
        Ok(CanonicalPathResult::new(
            CanonicalPath::new_unchecked(normalized),
            missing,
        ))
    }

    fn enter_directory(&self, _directory: &CanonicalPath) {}

    fn read_file(
        &self,
        directory: &CanonicalPath,
        file_name: &str,
    ) -> Result<Vec<u8>, FileReadError> {
        let path = directory.join_component(file_name);
        let files = self.files.lock().expect("fake filesystem lock poisoned");
        match files.get(path.as_path()) {
            Some(content) => Ok(content.clone()),
            None => Err(FileReadError::NotFound {
                path: path.to_string(),
            }),
        }
    }
}
