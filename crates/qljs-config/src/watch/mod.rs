//! OS-specific watching filesystem backends
//!
//! Each backend implements [`ConfigFilesystem`](crate::fs::ConfigFilesystem)
//! and additionally (i) queues filesystem change notifications from the OS
//! and (ii) exposes a wait handle the embedder blocks or polls on before
//! calling `process_changes`. Event payloads are advisory on every
//! platform: backends discard them and the detector re-derives state by
//! probing the filesystem inside `refresh`.

#[cfg(target_os = "linux")]
pub mod inotify;
#[cfg(any(
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "openbsd",
    target_os = "netbsd",
    target_os = "dragonfly"
))]
pub mod kqueue;
#[cfg(windows)]
pub mod win32;

#[cfg(target_os = "linux")]
pub use inotify::InotifyFilesystem;
#[cfg(any(
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "openbsd",
    target_os = "netbsd",
    target_os = "dragonfly"
))]
pub use kqueue::KqueueFilesystem;
#[cfg(windows)]
pub use win32::Win32Filesystem;
