//! Filesystem abstraction for configuration resolution
//!
//! [`ConfigFilesystem`] is the narrow capability surface the change detector
//! and loader run against: canonicalize a path, announce interest in a
//! directory, and read a named file inside a previously entered directory.
//! Realizations: [`BasicFilesystem`] (passive), [`FakeFilesystem`]
//! (in-memory test double), and the OS watching backends in [`crate::watch`].

mod basic;
mod fake;

pub use basic::BasicFilesystem;
pub use fake::FakeFilesystem;

use std::fs;
use std::io;
use std::path::Path;

use crate::canonical::{CanonicalPath, CanonicalPathResult};
use crate::error::{CanonicalizeError, FileReadError};

/// Capability interface over the filesystem.
///
/// Watching realizations install watches in `enter_directory` (and, on some
/// platforms, in `read_file`); the detector calls `enter_directory` on every
/// ancestor it visits, even after a config has been found, so that every
/// directory that could shadow the resolution is watched.
pub trait ConfigFilesystem {
    /// Canonicalize a path, tolerating a non-existing tail.
    fn canonicalize_path(&self, path: &str) -> Result<CanonicalPathResult, CanonicalizeError>;

    /// Announce interest in a directory. Idempotent per canonical directory.
    ///
    /// There is no error channel; a backend that cannot install its watch
    /// panics (the detector has no meaningful partial-failure state).
    fn enter_directory(&self, directory: &CanonicalPath);

    /// Read a named file inside a directory most recently given to
    /// [`ConfigFilesystem::enter_directory`].
    fn read_file(
        &self,
        directory: &CanonicalPath,
        file_name: &str,
    ) -> Result<Vec<u8>, FileReadError>;

    /// Read a file by its full canonical path without entering its
    /// directory. Used for explicit `--config-file` paths, which bypass the
    /// ancestor walk and are not watched.
    fn read_file_path(&self, path: &CanonicalPath) -> Result<Vec<u8>, FileReadError> {
        match path.split_parent() {
            Some((directory, file_name)) => self.read_file(&directory, &file_name),
            None => Err(FileReadError::Io {
                path: path.to_string(),
                source: io::Error::new(io::ErrorKind::InvalidInput, "path has no file name"),
            }),
        }
    }
}

/// Read a file's entire contents, classifying not-found.
///
/// A directory where a file was expected reads as a non-not-found error
/// whose text carries the OS reason.
pub(crate) fn read_file_bytes(path: &Path) -> Result<Vec<u8>, FileReadError> {
    fs::read(path).map_err(|err| FileReadError::from_io_error(path.display().to_string(), err))
}

/// Rename `from` over `to`, replacing `to` if it exists.
///
/// POSIX `rename` already replaces atomically. Windows `MoveFileExW` (which
/// backs `fs::rename`) can fail when the target exists; fall back to
/// `ReplaceFileW` in that case.
pub fn rename_file(from: &Path, to: &Path) -> io::Result<()> {
    match fs::rename(from, to) {
        Ok(()) => Ok(()),
        #[cfg(windows)]
        Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
            replace_file_windows(from, to)
        }
        Err(err) => Err(err),
    }
}

#[cfg(windows)]
fn replace_file_windows(from: &Path, to: &Path) -> io::Result<()> {
    use std::os::windows::ffi::OsStrExt;
    use std::ptr;
    use windows_sys::Win32::Storage::FileSystem::ReplaceFileW;

    fn to_wide(path: &Path) -> Vec<u16> {
        path.as_os_str().encode_wide().chain(std::iter::once(0)).collect()
    }

    let replaced = to_wide(to);
    let replacement = to_wide(from);
    let ok = unsafe {
        ReplaceFileW(
            replaced.as_ptr(),
            replacement.as_ptr(),
            ptr::null(),
            0,
            ptr::null_mut(),
            ptr::null_mut(),
        )
    };
    if ok == 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}
