//! Linux inotify watching backend
//!
//! One inotify instance per filesystem value. Every directory the resolver
//! enters gets a watch; queued events are drained as an opaque signal and
//! the authoritative state is re-derived by
//! [`ConfigChangeDetector::refresh`]. The inotify fd doubles as the
//! embedder's wait handle (`poll` for `POLLIN`).

use std::io;
use std::os::fd::{AsFd, BorrowedFd};
use std::sync::Mutex;

use nix::errno::Errno;
use nix::sys::inotify::{AddWatchFlags, InitFlags, Inotify, WatchDescriptor};
use tracing::debug;

use crate::canonical::{canonicalize_path, CanonicalPath, CanonicalPathResult};
use crate::detector::{ConfigChange, ConfigChangeDetector};
use crate::error::{CanonicalizeError, FileReadError};
use crate::fs::{read_file_bytes, ConfigFilesystem};

/// Deferred inotify fd closes.
///
/// On Linux 5.4 close() of an inotify fd with recently removed watches can
/// take 10ms+ of RCU synchronization, which dominates test suites that
/// create thousands of detectors. Watches are removed eagerly in drop, but
/// the fd itself is parked here and closed in batches.
static PARKED_INOTIFY_FDS: Mutex<Vec<Inotify>> = Mutex::new(Vec::new());

const PARKED_FD_LIMIT: usize = 10;

/// A watching [`ConfigFilesystem`] backed by inotify.
///
/// Requires exclusive use by a single logical owner.
pub struct InotifyFilesystem {
    inotify: Option<Inotify>,
    watch_descriptors: Mutex<Vec<WatchDescriptor>>,
}

impl InotifyFilesystem {
    pub fn new() -> io::Result<Self> {
        let inotify = Inotify::init(InitFlags::IN_CLOEXEC | InitFlags::IN_NONBLOCK)?;
        Ok(Self {
            inotify: Some(inotify),
            watch_descriptors: Mutex::new(Vec::new()),
        })
    }

    /// The fd to wait on: readable (`POLLIN`) when change notifications are
    /// queued. After it signals, call
    /// [`InotifyFilesystem::process_changes`].
    pub fn notify_poll_fd(&self) -> BorrowedFd<'_> {
        self.inotify().as_fd()
    }

    /// Drain queued notifications and refresh the detector.
    pub fn process_changes(
        &self,
        detector: &mut ConfigChangeDetector,
        out_changes: &mut Vec<ConfigChange>,
    ) {
        self.drain_events();
        detector.refresh(out_changes);
    }

    /// Consume all queued inotify events, discarding their payload. Events
    /// are only a hint that something changed; `refresh` re-derives the
    /// authoritative state.
    fn drain_events(&self) {
        loop {
            match self.inotify().read_events() {
                Ok(events) => {
                    if events.is_empty() {
                        break;
                    }
                }
                Err(Errno::EAGAIN) => break,
                Err(err) => panic!("fatal: reading inotify events failed: {err}"),
            }
        }
    }

    fn watch_directory(&self, directory: &CanonicalPath) {
        let mask = AddWatchFlags::IN_ATTRIB
            | AddWatchFlags::IN_CLOSE_WRITE
            | AddWatchFlags::IN_CREATE
            | AddWatchFlags::IN_DELETE
            | AddWatchFlags::IN_DELETE_SELF
            | AddWatchFlags::IN_MODIFY
            | AddWatchFlags::IN_MOVE_SELF
            | AddWatchFlags::IN_MOVED_FROM
            | AddWatchFlags::IN_MOVED_TO
            | AddWatchFlags::from_bits_retain(libc::IN_EXCL_UNLINK)
            | AddWatchFlags::IN_ONLYDIR;
        let descriptor = match self.inotify().add_watch(directory.as_path(), mask) {
            Ok(descriptor) => descriptor,
            // The directory can vanish between the resolver seeing it and
            // the watch being installed; the next refresh re-resolves.
            Err(Errno::ENOENT) => return,
            Err(err) => panic!("fatal: inotify_add_watch failed for {directory}: {err}"),
        };
        let mut descriptors = self
            .watch_descriptors
            .lock()
            .expect("watch descriptor list lock poisoned");
        // inotify returns the same descriptor for an already-watched inode.
        if !descriptors.contains(&descriptor) {
            debug!("watching directory {directory}");
            descriptors.push(descriptor);
        }
    }

    fn inotify(&self) -> &Inotify {
        self.inotify
            .as_ref()
            .expect("inotify instance taken before drop")
    }
}

impl ConfigFilesystem for InotifyFilesystem {
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
        read_file_bytes(directory.join_component(file_name).as_path())
    }
}

impl Drop for InotifyFilesystem {
    fn drop(&mut self) {
        let Some(inotify) = self.inotify.take() else {
            return;
        };
        let descriptors = std::mem::take(
            &mut *self
                .watch_descriptors
                .lock()
                .expect("watch descriptor list lock poisoned"),
        );
        for descriptor in descriptors {
            // Watches on deleted directories are removed by the kernel
            // already; ignore EINVAL for those.
            let _ = inotify.rm_watch(descriptor);
        }

        let mut parked = PARKED_INOTIFY_FDS
            .lock()
            .expect("parked inotify fd lock poisoned");
        if parked.len() > PARKED_FD_LIMIT {
            parked.clear(); // Closes each fd.
        }
        parked.push(inotify);
    }
}
