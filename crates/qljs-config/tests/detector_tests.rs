//! Integration tests for the change detector driven through the OS
//! watching backends: the embedder waits on the backend's wait handle,
//! then asks it to process changes.
//!
//! These tests assume that there is no quick-lint-js.config file in the
//! system temporary directory or in any of its ancestors.

#![cfg(any(
    target_os = "linux",
    target_os = "macos",
    target_os = "freebsd",
    target_os = "openbsd",
    target_os = "netbsd",
    target_os = "dragonfly",
    windows
))]

use std::fs;
use std::io::{Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::Arc;

use qljs_config::{ConfigChange, Configuration};
use tempfile::TempDir;

#[cfg(target_os = "linux")]
mod harness {
    use super::*;
    use qljs_config::watch::InotifyFilesystem;
    use qljs_config::{ConfigChangeDetector, ConfigFilesystem};

    /// Detector plus backend, driven the way an embedder would: poll the
    /// inotify fd, then process changes.
    pub struct ChangeDetector {
        fs: Arc<InotifyFilesystem>,
        detector: ConfigChangeDetector,
    }

    impl ChangeDetector {
        pub fn new() -> Self {
            let fs = Arc::new(InotifyFilesystem::new().expect("create inotify filesystem"));
            let detector =
                ConfigChangeDetector::new(Arc::clone(&fs) as Arc<dyn ConfigFilesystem>);
            Self { fs, detector }
        }

        pub fn get_config_for_file(&mut self, path: &str) -> Arc<Configuration> {
            self.detector.get_config_for_file(path)
        }

        pub fn poll_and_process_changes(&mut self) -> Vec<ConfigChange> {
            use nix::poll::{poll, PollFd, PollFlags, PollTimeout};

            let notify_fd = self.fs.notify_poll_fd();
            let mut poll_fds = [PollFd::new(notify_fd, PollFlags::POLLIN)];
            let rc = poll(&mut poll_fds, PollTimeout::ZERO).expect("poll");
            let timed_out = rc == 0;

            let mut changes = Vec::new();
            self.fs.process_changes(&mut self.detector, &mut changes);

            if timed_out {
                assert!(
                    changes.is_empty(),
                    "no filesystem notifications happened, but changes were detected"
                );
            }
            // A notification does not imply changes: events can be
            // spurious; refresh re-derives the authoritative state.
            changes
        }
    }
}

#[cfg(any(
    target_os = "macos",
    target_os = "freebsd",
    target_os = "openbsd",
    target_os = "netbsd",
    target_os = "dragonfly"
))]
mod harness {
    use super::*;
    use libc::timespec;
    use nix::sys::event::{EventFilter, EventFlag, FilterFlag, KEvent, Kqueue};
    use qljs_config::watch::KqueueFilesystem;
    use qljs_config::{ConfigChangeDetector, ConfigFilesystem};

    /// Detector plus backend, driven the way an embedder would: drain the
    /// kqueue, then process changes.
    pub struct ChangeDetector {
        kqueue: Arc<Kqueue>,
        fs: Arc<KqueueFilesystem>,
        detector: ConfigChangeDetector,
    }

    impl ChangeDetector {
        pub fn new() -> Self {
            let kqueue = Arc::new(Kqueue::new().expect("create kqueue"));
            let fs = Arc::new(KqueueFilesystem::new(Arc::clone(&kqueue)));
            let detector =
                ConfigChangeDetector::new(Arc::clone(&fs) as Arc<dyn ConfigFilesystem>);
            Self {
                kqueue,
                fs,
                detector,
            }
        }

        pub fn get_config_for_file(&mut self, path: &str) -> Arc<Configuration> {
            self.detector.get_config_for_file(path)
        }

        pub fn poll_and_process_changes(&mut self) -> Vec<ConfigChange> {
            let mut events = vec![
                KEvent::new(
                    0,
                    EventFilter::EVFILT_VNODE,
                    EventFlag::empty(),
                    FilterFlag::empty(),
                    0,
                    0,
                );
                100
            ];
            let timeout = timespec {
                tv_sec: 0,
                tv_nsec: 0,
            };
            let count = self
                .kqueue
                .kevent(&[], &mut events, Some(timeout))
                .expect("kevent");
            let timed_out = count == 0;

            let mut changes = Vec::new();
            self.fs
                .process_changes(&events[..count], &mut self.detector, &mut changes);

            if timed_out {
                assert!(
                    changes.is_empty(),
                    "no filesystem notifications happened, but changes were detected"
                );
            }
            changes
        }
    }
}

#[cfg(windows)]
mod harness {
    use super::*;
    use qljs_config::watch::Win32Filesystem;
    use qljs_config::{ConfigChangeDetector, ConfigFilesystem};
    use windows_sys::Win32::Foundation::{WAIT_OBJECT_0, WAIT_TIMEOUT};
    use windows_sys::Win32::System::Threading::WaitForSingleObject;

    /// Detector plus backend, driven the way an embedder would: wait on
    /// the change event, then process changes.
    pub struct ChangeDetector {
        fs: Arc<Win32Filesystem>,
        detector: ConfigChangeDetector,
    }

    impl ChangeDetector {
        pub fn new() -> Self {
            let fs = Arc::new(Win32Filesystem::new().expect("create win32 filesystem"));
            let detector =
                ConfigChangeDetector::new(Arc::clone(&fs) as Arc<dyn ConfigFilesystem>);
            Self { fs, detector }
        }

        pub fn get_config_for_file(&mut self, path: &str) -> Arc<Configuration> {
            self.detector.get_config_for_file(path)
        }

        pub fn poll_and_process_changes(&mut self) -> Vec<ConfigChange> {
            // The I/O thread signals the event asynchronously after an
            // oplock break; give it a moment.
            let wait = unsafe {
                WaitForSingleObject(
                    self.fs.change_event() as windows_sys::Win32::Foundation::HANDLE,
                    1000,
                )
            };
            let timed_out = wait == WAIT_TIMEOUT;
            assert!(
                timed_out || wait == WAIT_OBJECT_0,
                "unexpected wait result {wait}"
            );

            let mut changes = Vec::new();
            self.fs.process_changes(&mut self.detector, &mut changes);

            if timed_out {
                assert!(
                    changes.is_empty(),
                    "no filesystem notifications happened, but changes were detected"
                );
            }
            changes
        }
    }
}

use harness::ChangeDetector;

fn assert_same_file(actual: impl AsRef<Path>, expected: impl AsRef<Path>) {
    assert_eq!(
        fs::canonicalize(actual.as_ref()).expect("canonicalize actual"),
        fs::canonicalize(expected.as_ref()).expect("canonicalize expected"),
    );
}

fn assert_config_file(config: &Configuration, expected: impl AsRef<Path>) {
    let config_path = config
        .config_file_path()
        .expect("config should come from a file");
    assert_same_file(config_path.as_path(), expected);
}

#[test]
fn finds_config_in_ancestor_directory() {
    let temp_dir = TempDir::new().unwrap();
    fs::create_dir_all(temp_dir.path().join("a/b/c/d/e/f")).unwrap();
    let config_file = temp_dir.path().join("quick-lint-js.config");
    fs::write(&config_file, "{}").unwrap();
    let js_file = temp_dir.path().join("a/b/c/d/e/f/hello.js");
    fs::write(&js_file, "").unwrap();

    let mut detector = ChangeDetector::new();
    let config = detector.get_config_for_file(js_file.to_str().unwrap());
    assert_config_file(&config, &config_file);
}

#[test]
fn file_with_no_config_gets_default_config() {
    let temp_dir = TempDir::new().unwrap();
    let js_file = temp_dir.path().join("hello.js");
    fs::write(&js_file, "").unwrap();

    let mut detector = ChangeDetector::new();
    let config = detector.get_config_for_file(js_file.to_str().unwrap());
    assert!(config.find_global("Array").is_some());
    assert!(config.find_global("console").is_some());
    assert!(config.find_global("variableDoesNotExist").is_none());
    assert!(config.config_file_path().is_none());
}

#[test]
fn creating_config_is_detected() {
    let temp_dir = TempDir::new().unwrap();
    let js_file = temp_dir.path().join("hello.js");
    fs::write(&js_file, "").unwrap();

    let mut detector = ChangeDetector::new();
    detector.get_config_for_file(js_file.to_str().unwrap());

    let config_file = temp_dir.path().join("quick-lint-js.config");
    fs::write(&config_file, "{}").unwrap();

    let changes = detector.poll_and_process_changes();
    assert_eq!(changes.len(), 1);
    assert_same_file(&changes[0].watched_path, &js_file);
    assert_config_file(&changes[0].config, &config_file);
}

#[test]
fn creating_shadowing_config_is_detected() {
    let temp_dir = TempDir::new().unwrap();
    let js_file = temp_dir.path().join("hello.js");
    fs::write(&js_file, "").unwrap();
    fs::write(temp_dir.path().join(".quick-lint-js.config"), "{}").unwrap();

    let mut detector = ChangeDetector::new();
    detector.get_config_for_file(js_file.to_str().unwrap());

    let primary_config_file = temp_dir.path().join("quick-lint-js.config");
    fs::write(&primary_config_file, "{}").unwrap();

    let changes = detector.poll_and_process_changes();
    assert_eq!(changes.len(), 1);
    assert_config_file(&changes[0].config, &primary_config_file);
}

#[test]
fn rewriting_config_partially_is_detected_for_every_watcher() {
    let temp_dir = TempDir::new().unwrap();
    let js_file_one = temp_dir.path().join("one.js");
    fs::write(&js_file_one, "").unwrap();
    let js_file_two = temp_dir.path().join("two.js");
    fs::write(&js_file_two, "").unwrap();
    let config_file = temp_dir.path().join("quick-lint-js.config");
    fs::write(&config_file, r#"{"globals": {"before": true}}"#).unwrap();

    let mut detector = ChangeDetector::new();
    detector.get_config_for_file(js_file_one.to_str().unwrap());
    detector.get_config_for_file(js_file_two.to_str().unwrap());

    {
        let mut file = fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(&config_file)
            .unwrap();
        file.seek(SeekFrom::Start(r#"{"globals": {""#.len() as u64))
            .unwrap();
        file.write_all(b"after_").unwrap();
    }

    let changes = detector.poll_and_process_changes();
    assert_eq!(changes.len(), 2);
    assert_same_file(&changes[0].watched_path, &js_file_one);
    assert_same_file(&changes[1].watched_path, &js_file_two);
    assert!(Arc::ptr_eq(&changes[0].config, &changes[1].config));
}

#[test]
fn rewriting_config_back_to_original_is_not_a_change() {
    let temp_dir = TempDir::new().unwrap();
    let js_file = temp_dir.path().join("hello.js");
    fs::write(&js_file, "").unwrap();
    let config_file = temp_dir.path().join("quick-lint-js.config");
    fs::write(&config_file, r#"{"globals": {"a": true}}"#).unwrap();

    let mut detector = ChangeDetector::new();
    detector.get_config_for_file(js_file.to_str().unwrap());

    fs::write(&config_file, r#"{"globals": {"b": true}}"#).unwrap();
    fs::write(&config_file, r#"{"globals": {"a": true}}"#).unwrap();

    let changes = detector.poll_and_process_changes();
    assert!(changes.is_empty());
}

#[test]
fn deleting_shadowing_config_falls_back_to_dot_variant() {
    let temp_dir = TempDir::new().unwrap();
    let js_file = temp_dir.path().join("hello.js");
    fs::write(&js_file, "").unwrap();
    let primary_config_file = temp_dir.path().join("quick-lint-js.config");
    fs::write(&primary_config_file, "{}").unwrap();
    let secondary_config_file = temp_dir.path().join(".quick-lint-js.config");
    fs::write(&secondary_config_file, "{}").unwrap();

    let mut detector = ChangeDetector::new();
    detector.get_config_for_file(js_file.to_str().unwrap());

    fs::remove_file(&primary_config_file).unwrap();

    let changes = detector.poll_and_process_changes();
    assert_eq!(changes.len(), 1);
    assert_config_file(&changes[0].config, &secondary_config_file);
}

#[test]
fn renaming_directory_unlinks_config() {
    let temp_dir = TempDir::new().unwrap();
    fs::create_dir(temp_dir.path().join("olddir")).unwrap();
    let js_file = temp_dir.path().join("olddir/hello.js");
    fs::write(&js_file, "").unwrap();
    fs::write(temp_dir.path().join("olddir/quick-lint-js.config"), "{}").unwrap();

    let mut detector = ChangeDetector::new();
    detector.get_config_for_file(js_file.to_str().unwrap());

    qljs_config::rename_file(
        &temp_dir.path().join("olddir"),
        &temp_dir.path().join("newdir"),
    )
    .unwrap();

    let changes = detector.poll_and_process_changes();
    assert_eq!(changes.len(), 1);
    assert!(changes[0].watched_path.contains("olddir"));
    assert!(
        changes[0].config.config_file_path().is_none(),
        "config should be removed"
    );
    assert!(Arc::ptr_eq(
        &changes[0].config,
        Configuration::default_config()
    ));
}

#[test]
fn creating_directory_then_config_is_detected_in_one_batch() {
    let temp_dir = TempDir::new().unwrap();
    let js_file = temp_dir.path().join("dir/test.js");

    let mut detector = ChangeDetector::new();
    detector.get_config_for_file(js_file.to_str().unwrap());

    fs::create_dir(temp_dir.path().join("dir")).unwrap();
    let config_file = temp_dir.path().join("dir/quick-lint-js.config");
    fs::write(&config_file, "{}").unwrap();

    let changes = detector.poll_and_process_changes();
    assert_eq!(changes.len(), 1);
    assert!(changes[0].watched_path.contains("test.js"));
    assert_config_file(&changes[0].config, &config_file);
}

#[test]
fn creating_config_shared_by_many_watched_files_reports_each() {
    let temp_dir = TempDir::new().unwrap();
    let mut js_files = Vec::new();
    for i in 0..10 {
        let js_file = temp_dir.path().join(format!("hello{i}.js"));
        fs::write(&js_file, "").unwrap();
        js_files.push(js_file.to_str().unwrap().to_string());
    }

    let mut detector = ChangeDetector::new();
    for js_file in &js_files {
        detector.get_config_for_file(js_file);
    }

    let config_file = temp_dir.path().join("quick-lint-js.config");
    fs::write(&config_file, "{}").unwrap();

    let changes = detector.poll_and_process_changes();
    assert_eq!(changes.len(), js_files.len());
    for (change, js_file) in changes.iter().zip(&js_files) {
        assert_eq!(&change.watched_path, js_file, "changes keep watch order");
        assert_config_file(&change.config, &config_file);
    }
    for pair in changes.windows(2) {
        assert!(Arc::ptr_eq(&pair[0].config, &pair[1].config));
    }
}

#[test]
fn rewriting_identical_bytes_is_not_a_change() {
    let temp_dir = TempDir::new().unwrap();
    let js_file = temp_dir.path().join("hello.js");
    fs::write(&js_file, "").unwrap();
    let config_file = temp_dir.path().join("quick-lint-js.config");
    fs::write(&config_file, "{}").unwrap();

    let mut detector = ChangeDetector::new();
    detector.get_config_for_file(js_file.to_str().unwrap());

    fs::write(&config_file, "{}").unwrap();

    let changes = detector.poll_and_process_changes();
    assert!(changes.is_empty());
}
