//! BSD/macOS kqueue watching backend
//!
//! The kqueue is owned by the embedder (who waits on it with `kevent`) and
//! shared with the backend, which registers `EVFILT_VNODE` filters for
//! every directory the resolver enters and for every config file it reads.
//! Event payloads are advisory; [`KqueueFilesystem::process_changes`]
//! discards them and re-derives state through
//! [`ConfigChangeDetector::refresh`].

use std::collections::HashMap;
use std::fs::File;
use std::io::{self, Read};
use std::os::fd::AsRawFd;
use std::path::Path;
use std::sync::{Arc, Mutex};

use libc::timespec;
use nix::sys::event::{EventFilter, EventFlag, FilterFlag, KEvent, Kqueue};
use tracing::debug;

use crate::canonical::{canonicalize_path, CanonicalPath, CanonicalPathResult};
use crate::detector::{ConfigChange, ConfigChangeDetector};
use crate::error::{CanonicalizeError, FileReadError};
use crate::fs::ConfigFilesystem;

/// A watching [`ConfigFilesystem`] backed by an embedder-supplied kqueue.
///
/// Requires exclusive use by a single logical owner. The retained `File`
/// handles keep each vnode watch alive; closing a handle removes its
/// kevent.
pub struct KqueueFilesystem {
    kqueue: Arc<Kqueue>,
    watched_directories: Mutex<HashMap<CanonicalPath, File>>,
    watched_files: Mutex<HashMap<CanonicalPath, File>>,
}

impl KqueueFilesystem {
    pub fn new(kqueue: Arc<Kqueue>) -> Self {
        Self {
            kqueue,
            watched_directories: Mutex::new(HashMap::new()),
            watched_files: Mutex::new(HashMap::new()),
        }
    }

    /// Refresh the detector after the embedder's `kevent` wait returned.
    /// The events themselves are only a signal and are not inspected.
    pub fn process_changes(
        &self,
        _events: &[KEvent],
        detector: &mut ConfigChangeDetector,
        out_changes: &mut Vec<ConfigChange>,
    ) {
        detector.refresh(out_changes);
    }

    fn watch_directory(&self, directory: &CanonicalPath) {
        let mut watched = self
            .watched_directories
            .lock()
            .expect("watched directory map lock poisoned");
        if watched.contains_key(directory) {
            return;
        }
        let handle = match open_event_only(directory.as_path()) {
            Ok(handle) => handle,
            // The directory can vanish between the resolver seeing it and
            // the watch being installed; the next refresh re-resolves.
            Err(err) if err.kind() == io::ErrorKind::NotFound => return,
            Err(err) => panic!("fatal: cannot open {directory} for watching: {err}"),
        };
        self.register_vnode(&handle, directory);
        debug!("watching directory {directory}");
        watched.insert(directory.clone(), handle);
    }

    fn register_vnode(&self, handle: &File, path: &CanonicalPath) {
        let change = KEvent::new(
            handle.as_raw_fd() as usize,
            EventFilter::EVFILT_VNODE,
            EventFlag::EV_ADD | EventFlag::EV_ENABLE,
            vnode_filter_flags(),
            0,
            0,
        );
        let timeout = timespec {
            tv_sec: 0,
            tv_nsec: 0,
        };
        let mut no_events: [KEvent; 0] = [];
        if let Err(err) = self.kqueue.kevent(&[change], &mut no_events, Some(timeout)) {
            panic!("fatal: kevent registration failed for {path}: {err}");
        }
    }
}

fn vnode_filter_flags() -> FilterFlag {
    let flags = FilterFlag::NOTE_DELETE
        | FilterFlag::NOTE_WRITE
        | FilterFlag::NOTE_EXTEND
        | FilterFlag::NOTE_ATTRIB
        | FilterFlag::NOTE_LINK
        | FilterFlag::NOTE_RENAME
        | FilterFlag::NOTE_REVOKE;
    #[cfg(any(target_os = "macos", target_os = "ios"))]
    let flags = flags | FilterFlag::NOTE_FUNLOCK;
    flags
}

/// Open a path for watching without inhibiting unmounts (macOS
/// `O_EVTONLY`; plain read elsewhere).
fn open_event_only(path: &Path) -> io::Result<File> {
    #[cfg(any(target_os = "macos", target_os = "ios"))]
    {
        use std::fs::OpenOptions;
        use std::os::unix::fs::OpenOptionsExt;
        OpenOptions::new()
            .read(true)
            .custom_flags(libc::O_EVTONLY)
            .open(path)
    }
    #[cfg(not(any(target_os = "macos", target_os = "ios")))]
    {
        File::open(path)
    }
}

impl ConfigFilesystem for KqueueFilesystem {
    fn canonicalize_path(&self, path: &str) -> Result<CanonicalPathResult, CanonicalizeError> {
        canonicalize_path(path)
    }

    fn enter_directory(&self, directory: &CanonicalPath) {
        self.watch_directory(directory);
    }

    fn read_file(
        &self,
        directory: &CanonicalPath,
        file_name: &str,
    ) -> Result<Vec<u8>, FileReadError> {
        let config_path = directory.join_component(file_name);
        let mut handle = File::open(config_path.as_path())
            .map_err(|err| FileReadError::from_io_error(config_path.to_string(), err))?;

        // Watch the file through the fd the content is read from, so a
        // write racing the read still signals.
        self.register_vnode(&handle, &config_path);

        let mut content = Vec::new();
        handle
            .read_to_end(&mut content)
            .map_err(|err| FileReadError::from_io_error(config_path.to_string(), err))?;

        // Replacing a previous handle closes it, which removes its kevent:
        // one active watch per canonical path.
        self.watched_files
            .lock()
            .expect("watched file map lock poisoned")
            .insert(config_path, handle);
        Ok(content)
    }
}
