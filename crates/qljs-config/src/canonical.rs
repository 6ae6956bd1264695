//! Canonical filesystem paths
//!
//! A [`CanonicalPath`] is an absolute, component-normalized path used as the
//! identity key for loaded configuration files and watched directories.
//! Canonicalization resolves `.`/`..` and symlinks through the longest
//! existing prefix of the input; a trailing suffix of the path is allowed to
//! not exist yet and is reported as *missing components* so callers can fall
//! back to the deepest existing ancestor.

use std::env;
use std::ffi::OsString;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};

use crate::error::CanonicalizeError;

/// An absolute, component-normalized filesystem path.
///
/// Equality and hashing are componentwise (case-sensitive on POSIX,
/// OS-normalized on Windows where `fs::canonicalize` reports the on-disk
/// case). Symlinks are resolved during canonicalization; watches therefore
/// target the resolved directories.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CanonicalPath {
    path: PathBuf,
}

impl CanonicalPath {
    /// Wrap an already-canonical path. Callers must guarantee the invariant.
    pub(crate) fn new_unchecked(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn as_path(&self) -> &Path {
        &self.path
    }

    /// Append one component (e.g. a config file name) to this path.
    pub fn append_component(&mut self, name: &str) {
        self.path.push(name);
    }

    /// This path with one component appended.
    pub fn join_component(&self, name: &str) -> CanonicalPath {
        let mut joined = self.clone();
        joined.append_component(name);
        joined
    }

    /// Replace this path with its parent directory.
    ///
    /// Returns `false` when the path is a filesystem root and has no parent.
    pub fn parent(&mut self) -> bool {
        match self.path.parent() {
            Some(parent) => {
                self.path = parent.to_path_buf();
                true
            }
            None => false,
        }
    }

    /// The final component, if any.
    pub fn file_name(&self) -> Option<&str> {
        self.path.file_name().and_then(|name| name.to_str())
    }

    /// Split into the parent directory and the final component.
    ///
    /// `None` for a filesystem root.
    pub fn split_parent(&self) -> Option<(CanonicalPath, String)> {
        let name = self.path.file_name()?.to_string_lossy().into_owned();
        let parent = self.path.parent()?.to_path_buf();
        Some((CanonicalPath::new_unchecked(parent), name))
    }
}

impl fmt::Display for CanonicalPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.path.display().fmt(f)
    }
}

impl AsRef<Path> for CanonicalPath {
    fn as_ref(&self) -> &Path {
        &self.path
    }
}

/// Outcome of [`canonicalize_path`]: a canonical path whose trailing
/// `missing_components` components do not exist on disk yet.
#[derive(Clone, Debug)]
pub struct CanonicalPathResult {
    path: CanonicalPath,
    missing_components: usize,
}

impl CanonicalPathResult {
    pub(crate) fn new(path: CanonicalPath, missing_components: usize) -> Self {
        Self {
            path,
            missing_components,
        }
    }

    pub fn canonical(&self) -> &CanonicalPath {
        &self.path
    }

    pub fn into_canonical(self) -> CanonicalPath {
        self.path
    }

    /// Whether a suffix of the path does not exist on disk.
    pub fn have_missing_components(&self) -> bool {
        self.missing_components > 0
    }

    /// Truncate the path to its deepest existing ancestor.
    pub fn drop_missing_components(&mut self) {
        for _ in 0..self.missing_components {
            self.path.parent();
        }
        self.missing_components = 0;
    }
}

/// Canonicalize `path` against the process working directory.
///
/// The longest existing prefix is resolved through the OS (following
/// symlinks); the non-existing tail, if any, is normalized lexically and
/// carried as missing components. Fails only when an existing prefix cannot
/// be resolved (e.g. permission denied on an ancestor) or the working
/// directory is unavailable.
pub fn canonicalize_path(path: &str) -> Result<CanonicalPathResult, CanonicalizeError> {
    let requested = Path::new(path);
    let absolute = if requested.is_absolute() {
        requested.to_path_buf()
    } else {
        let cwd = env::current_dir().map_err(|source| CanonicalizeError {
            path: path.to_string(),
            source,
        })?;
        cwd.join(requested)
    };

    let components: Vec<Component<'_>> = absolute.components().collect();
    let rooted_len = components
        .iter()
        .take_while(|c| matches!(c, Component::Prefix(_) | Component::RootDir))
        .count();

    for existing_len in (rooted_len..=components.len()).rev() {
        let prefix: PathBuf = components[..existing_len].iter().copied().collect();
        let base = match fs::canonicalize(&prefix) {
            Ok(base) => base,
            Err(err)
                if err.kind() == io::ErrorKind::NotFound
                    || err.kind() == io::ErrorKind::NotADirectory =>
            {
                continue;
            }
            Err(source) => {
                return Err(CanonicalizeError {
                    path: path.to_string(),
                    source,
                });
            }
        };

        // Append the non-existing tail lexically. `..` components may pop
        // back into the existing (already canonical) prefix.
        let mut resolved = base;
        for component in &components[existing_len..] {
            match component {
                Component::CurDir => {}
                Component::ParentDir => {
                    resolved.pop();
                }
                Component::Normal(name) => resolved.push(name),
                Component::Prefix(_) | Component::RootDir => {}
            }
        }
        let missing = count_missing_components(&resolved);
        return Ok(CanonicalPathResult::new(
            CanonicalPath::new_unchecked(resolved),
            missing,
        ));
    }

    // Unreachable in practice: the root itself always canonicalizes.
    Err(CanonicalizeError {
        path: path.to_string(),
        source: io::Error::new(io::ErrorKind::NotFound, "no existing ancestor"),
    })
}

/// Number of trailing components of `path` that do not exist on disk.
fn count_missing_components(path: &Path) -> usize {
    let mut missing = 0;
    let mut probe = path.to_path_buf();
    while fs::symlink_metadata(&probe).is_err() {
        if !probe.pop() {
            break;
        }
        missing += 1;
    }
    missing
}

/// Normalize a path lexically without touching the filesystem.
///
/// Used by the fake filesystem, whose virtual tree never exists on disk.
pub(crate) fn normalize_lexically(path: &Path) -> PathBuf {
    let mut normalized = PathBuf::new();
    let mut depth = 0usize;
    for component in path.components() {
        match component {
            Component::Prefix(prefix) => normalized.push(prefix.as_os_str()),
            Component::RootDir => normalized.push(Component::RootDir.as_os_str()),
            Component::CurDir => {}
            Component::ParentDir => {
                if depth > 0 {
                    normalized.pop();
                    depth -= 1;
                }
            }
            Component::Normal(name) => {
                normalized.push(name);
                depth += 1;
            }
        }
    }
    if normalized.as_os_str().is_empty() {
        normalized.push(OsString::from(std::path::MAIN_SEPARATOR.to_string()));
    }
    normalized
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn existing_file_has_no_missing_components() {
        let temp_dir = TempDir::new().unwrap();
        let file = temp_dir.path().join("hello.js");
        fs::write(&file, "").unwrap();

        let result = canonicalize_path(file.to_str().unwrap()).unwrap();
        assert!(!result.have_missing_components());
        assert_eq!(result.canonical().file_name(), Some("hello.js"));
    }

    #[test]
    fn missing_file_in_existing_directory_has_one_missing_component() {
        let temp_dir = TempDir::new().unwrap();
        let file = temp_dir.path().join("hello.js");

        let mut result = canonicalize_path(file.to_str().unwrap()).unwrap();
        assert!(result.have_missing_components());
        assert_eq!(result.canonical().file_name(), Some("hello.js"));

        result.drop_missing_components();
        assert_eq!(
            result.canonical().as_path(),
            fs::canonicalize(temp_dir.path()).unwrap()
        );
    }

    #[test]
    fn missing_directory_chain_is_dropped_entirely() {
        let temp_dir = TempDir::new().unwrap();
        let file = temp_dir.path().join("a/b/c/hello.js");

        let mut result = canonicalize_path(file.to_str().unwrap()).unwrap();
        assert!(result.have_missing_components());
        result.drop_missing_components();
        assert_eq!(
            result.canonical().as_path(),
            fs::canonicalize(temp_dir.path()).unwrap()
        );
    }

    #[test]
    fn dot_dot_is_resolved_in_existing_prefix() {
        let temp_dir = TempDir::new().unwrap();
        fs::create_dir_all(temp_dir.path().join("dir/subdir")).unwrap();
        let file = temp_dir.path().join("dir/subdir/../hello.js");

        let mut result = canonicalize_path(file.to_str().unwrap()).unwrap();
        result.drop_missing_components();
        assert_eq!(
            result.canonical().as_path(),
            fs::canonicalize(temp_dir.path().join("dir")).unwrap()
        );
    }

    #[test]
    fn relative_path_resolves_against_working_directory() {
        let result = canonicalize_path(".").unwrap();
        assert!(!result.have_missing_components());
        assert!(result.canonical().as_path().is_absolute());
    }

    #[test]
    fn parent_stops_at_root() {
        let mut root = canonicalize_path("/").unwrap().into_canonical();
        assert!(!root.parent());
    }

    #[test]
    fn split_parent_returns_directory_and_name() {
        let temp_dir = TempDir::new().unwrap();
        let file = temp_dir.path().join("quick-lint-js.config");
        fs::write(&file, "{}").unwrap();

        let canonical = canonicalize_path(file.to_str().unwrap())
            .unwrap()
            .into_canonical();
        let (parent, name) = canonical.split_parent().unwrap();
        assert_eq!(name, "quick-lint-js.config");
        assert_eq!(parent.as_path(), fs::canonicalize(temp_dir.path()).unwrap());
    }
}
