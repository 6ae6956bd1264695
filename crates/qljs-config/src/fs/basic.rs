//! Passive (non-watching) filesystem

use crate::canonical::{canonicalize_path, CanonicalPath, CanonicalPathResult};
use crate::error::{CanonicalizeError, FileReadError};

use super::{read_file_bytes, ConfigFilesystem};

/// A [`ConfigFilesystem`] backed directly by the OS with no change
/// notifications. Suited to one-shot lints; callers that need notifications
/// use a watching backend from [`crate::watch`].
#[derive(Debug, Default)]
pub struct BasicFilesystem;

impl BasicFilesystem {
    /// The process-wide shared instance.
    pub fn instance() -> &'static BasicFilesystem {
        static INSTANCE: BasicFilesystem = BasicFilesystem;
        &INSTANCE
    }
}

impl ConfigFilesystem for BasicFilesystem {
    fn canonicalize_path(&self, path: &str) -> Result<CanonicalPathResult, CanonicalizeError> {
        canonicalize_path(path)
    }

    fn enter_directory(&self, _directory: &CanonicalPath) {}

    fn read_file(
        &self,
        directory: &CanonicalPath,
        file_name: &str,
    ) -> Result<Vec<u8>, FileReadError> {
        read_file_bytes(directory.join_component(file_name).as_path())
    }
}
