//! Windows oplock watching backend
//!
//! Implements directory change notifications with a little-known feature
//! called filter oplocks. For each directory the resolver enters, the
//! backend acquires an oplock; when anything changes, the oplock is broken
//! and the backend is notified.
//!
//! Well-known APIs, such as `FindFirstChangeNotificationW` and
//! `ReadDirectoryChangesW`, don't work here because they hold a directory
//! handle that prevents renaming any ancestor directory — exactly one of
//! the events this watcher must observe. Directory handles holding an
//! oplock don't have this problem: the rename blocks until the oplock is
//! released, which happens implicitly when the handle is closed.
//!
//! Broken oplocks signal their directory handle, but
//! `WaitForMultipleObjects` tops out at 64 handles, which is too low here.
//! Instead every directory handle is attached to one I/O completion port
//! pumped by a background thread, and the thread signals a single
//! auto-reset event (`change_event`) when a refresh is necessary.
//!
//! Documentation on oplocks:
//! * <https://docs.microsoft.com/en-us/windows/win32/api/winioctl/ni-winioctl-fsctl_request_oplock>

use std::collections::HashMap;
use std::io;
use std::mem::{offset_of, size_of, zeroed};
use std::os::windows::ffi::OsStrExt;
use std::os::windows::io::{AsRawHandle, FromRawHandle, OwnedHandle, RawHandle};
use std::path::Path;
use std::ptr;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread;

use tracing::{debug, warn};
use windows_sys::Win32::Foundation::{
    GetLastError, ERROR_IO_PENDING, ERROR_NOT_FOUND, ERROR_OPERATION_ABORTED, GENERIC_READ,
    HANDLE, INVALID_HANDLE_VALUE,
};
use windows_sys::Win32::Storage::FileSystem::{
    CreateFileW, GetFileInformationByHandleEx, FileIdInfo, FILE_ATTRIBUTE_NORMAL,
    FILE_FLAG_BACKUP_SEMANTICS, FILE_FLAG_OVERLAPPED, FILE_ID_INFO, FILE_SHARE_DELETE,
    FILE_SHARE_READ, FILE_SHARE_WRITE, OPEN_EXISTING,
};
use windows_sys::Win32::System::Ioctl::{
    FSCTL_REQUEST_OPLOCK, OPLOCK_LEVEL_CACHE_HANDLE, OPLOCK_LEVEL_CACHE_READ,
    REQUEST_OPLOCK_CURRENT_VERSION, REQUEST_OPLOCK_INPUT_BUFFER, REQUEST_OPLOCK_INPUT_FLAG_REQUEST,
    REQUEST_OPLOCK_OUTPUT_BUFFER, REQUEST_OPLOCK_OUTPUT_FLAG_ACK_REQUIRED,
};
use windows_sys::Win32::System::Threading::{CreateEventW, SetEvent, INFINITE};
use windows_sys::Win32::System::IO::{
    CancelIoEx, CreateIoCompletionPort, DeviceIoControl, GetQueuedCompletionStatus,
    PostQueuedCompletionStatus, OVERLAPPED,
};

use crate::canonical::{canonicalize_path, CanonicalPath, CanonicalPathResult};
use crate::detector::{ConfigChange, ConfigChangeDetector};
use crate::error::{CanonicalizeError, FileReadError};
use crate::fs::{read_file_bytes, ConfigFilesystem};

const COMPLETION_KEY_STOP_IO_THREAD: usize = 1;
const COMPLETION_KEY_DIRECTORY: usize = 2;

/// One watched directory. Pending oplock I/O holds pointers into this
/// struct, so it is boxed and never moved or copied after construction.
#[repr(C)]
struct WatchedDirectory {
    oplock_overlapped: OVERLAPPED,
    oplock_response: REQUEST_OPLOCK_OUTPUT_BUFFER,
    directory_handle: OwnedHandle,
    directory_id: FILE_ID_INFO,
}

// OVERLAPPED carries raw pointers; the record itself is only touched under
// the watched-directory mutex.
unsafe impl Send for WatchedDirectory {}

impl WatchedDirectory {
    fn new(directory_handle: OwnedHandle, directory_id: FILE_ID_INFO) -> Self {
        Self {
            oplock_overlapped: unsafe { zeroed() },
            oplock_response: unsafe { zeroed() },
            directory_handle,
            directory_id,
        }
    }

    /// Request cancellation of the pending oplock request. The I/O thread
    /// observes the aborted completion and erases this record.
    fn begin_cancel(&self) {
        let ok = unsafe {
            CancelIoEx(
                self.directory_handle.as_raw_handle() as HANDLE,
                &self.oplock_overlapped,
            )
        };
        if ok == 0 {
            let error = unsafe { GetLastError() };
            // ERROR_NOT_FOUND: the completion already raced us out of the
            // pending state.
            if error != ERROR_NOT_FOUND {
                panic!(
                    "fatal: CancelIoEx failed: {}",
                    io::Error::from_raw_os_error(error as i32)
                );
            }
        }
    }

    /// Recover the record from the `OVERLAPPED*` an I/O completion refers
    /// to.
    fn from_oplock_overlapped(overlapped: *mut OVERLAPPED) -> *const WatchedDirectory {
        (overlapped as usize - offset_of!(WatchedDirectory, oplock_overlapped))
            as *const WatchedDirectory
    }
}

struct WatchState {
    /// All mutation of this map is serialized here, including from the I/O
    /// thread.
    watched_directories: Mutex<HashMap<CanonicalPath, Box<WatchedDirectory>>>,
    /// Signalled after the I/O thread erases a record.
    watched_directory_unwatched: Condvar,
}

/// Raw handles the I/O thread needs; they outlive the thread because the
/// owning filesystem joins it before closing them.
struct IoThreadContext {
    io_completion_port: HANDLE,
    change_event: HANDLE,
    state: Arc<WatchState>,
}

unsafe impl Send for IoThreadContext {}

/// A watching [`ConfigFilesystem`] backed by directory oplocks and an I/O
/// completion port. Internally synchronized.
pub struct Win32Filesystem {
    change_event: OwnedHandle,
    io_completion_port: OwnedHandle,
    io_thread: Option<thread::JoinHandle<()>>,
    state: Arc<WatchState>,
}

impl Win32Filesystem {
    pub fn new() -> io::Result<Self> {
        let change_event = create_auto_reset_event()?;
        let io_completion_port = create_io_completion_port()?;
        let state = Arc::new(WatchState {
            watched_directories: Mutex::new(HashMap::new()),
            watched_directory_unwatched: Condvar::new(),
        });
        let context = IoThreadContext {
            io_completion_port: io_completion_port.as_raw_handle() as HANDLE,
            change_event: change_event.as_raw_handle() as HANDLE,
            state: Arc::clone(&state),
        };
        let io_thread = thread::Builder::new()
            .name("qljs-config-oplock-io".to_string())
            .spawn(move || run_io_thread(context))?;
        Ok(Self {
            change_event,
            io_completion_port,
            io_thread: Some(io_thread),
            state,
        })
    }

    /// The auto-reset event to wait on (`WaitForSingleObject`); signalled
    /// whenever any watched directory's oplock breaks. After it signals,
    /// call [`Win32Filesystem::process_changes`].
    pub fn change_event(&self) -> RawHandle {
        self.change_event.as_raw_handle()
    }

    /// Refresh the detector. Oplock breaks carry no payload, so there is
    /// nothing to drain; `refresh` re-derives all state.
    pub fn process_changes(
        &self,
        detector: &mut ConfigChangeDetector,
        out_changes: &mut Vec<ConfigChange>,
    ) {
        detector.refresh(out_changes);
    }

    fn watch_directory(&self, directory: &CanonicalPath) {
        let directory_handle = match open_directory(directory.as_path()) {
            Ok(handle) => handle,
            // The directory can vanish between the resolver seeing it and
            // the watch being installed; the next refresh re-resolves.
            Err(err) if err.kind() == io::ErrorKind::NotFound => return,
            Err(err) => panic!("fatal: cannot open {directory} for watching: {err}"),
        };
        let directory_id = query_file_id(&directory_handle)
            .unwrap_or_else(|err| panic!("fatal: cannot query file id of {directory}: {err}"));

        let mut watched = self
            .state
            .watched_directories
            .lock()
            .expect("watched directory map lock poisoned");

        let identity_changed = match watched.get(directory) {
            Some(existing) if file_ids_equal(&existing.directory_id, &directory_id) => {
                // Already watching this directory.
                return;
            }
            Some(existing) => {
                debug!("directory identity changed, rewatching {directory}");
                existing.begin_cancel();
                true
            }
            None => false,
        };
        if identity_changed {
            watched = self.wait_until_watch_cancelled(watched, directory);
        }

        let mut record = Box::new(WatchedDirectory::new(directory_handle, directory_id));
        attach_handle_to_iocp(
            record.directory_handle.as_raw_handle() as HANDLE,
            self.io_completion_port.as_raw_handle() as HANDLE,
            COMPLETION_KEY_DIRECTORY,
        );

        let request = REQUEST_OPLOCK_INPUT_BUFFER {
            StructureVersion: REQUEST_OPLOCK_CURRENT_VERSION as u16,
            StructureLength: size_of::<REQUEST_OPLOCK_INPUT_BUFFER>() as u16,
            RequestedOplockLevel: OPLOCK_LEVEL_CACHE_READ | OPLOCK_LEVEL_CACHE_HANDLE,
            Flags: REQUEST_OPLOCK_INPUT_FLAG_REQUEST,
        };
        let ok = unsafe {
            DeviceIoControl(
                record.directory_handle.as_raw_handle() as HANDLE,
                FSCTL_REQUEST_OPLOCK,
                ptr::addr_of!(request).cast(),
                size_of::<REQUEST_OPLOCK_INPUT_BUFFER>() as u32,
                ptr::addr_of_mut!(record.oplock_response).cast(),
                size_of::<REQUEST_OPLOCK_OUTPUT_BUFFER>() as u32,
                ptr::null_mut(),
                &mut record.oplock_overlapped,
            )
        };
        if ok != 0 {
            // Synchronous completion: the oplock broke immediately. The
            // completion packet still reaches the I/O thread, which erases
            // the record; flag the refresh now.
            warn!("oplock request for {directory} completed synchronously");
            signal_event(self.change_event.as_raw_handle() as HANDLE);
        } else {
            let error = unsafe { GetLastError() };
            if error != ERROR_IO_PENDING {
                panic!(
                    "fatal: FSCTL_REQUEST_OPLOCK failed for {directory}: {}",
                    io::Error::from_raw_os_error(error as i32)
                );
            }
            // Pending: the I/O thread handles the eventual break.
        }
        debug!("watching directory {directory}");
        watched.insert(directory.clone(), record);
    }

    fn wait_until_watch_cancelled<'a>(
        &self,
        mut watched: MutexGuard<'a, HashMap<CanonicalPath, Box<WatchedDirectory>>>,
        directory: &CanonicalPath,
    ) -> MutexGuard<'a, HashMap<CanonicalPath, Box<WatchedDirectory>>> {
        while watched.contains_key(directory) {
            watched = self
                .state
                .watched_directory_unwatched
                .wait(watched)
                .expect("watched directory map lock poisoned");
        }
        watched
    }
}

impl ConfigFilesystem for Win32Filesystem {
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

impl Drop for Win32Filesystem {
    fn drop(&mut self) {
        {
            let mut watched = self
                .state
                .watched_directories
                .lock()
                .expect("watched directory map lock poisoned");
            for record in watched.values() {
                record.begin_cancel();
            }
            while !watched.is_empty() {
                watched = self
                    .state
                    .watched_directory_unwatched
                    .wait(watched)
                    .expect("watched directory map lock poisoned");
            }
        }

        let ok = unsafe {
            PostQueuedCompletionStatus(
                self.io_completion_port.as_raw_handle() as HANDLE,
                0,
                COMPLETION_KEY_STOP_IO_THREAD,
                ptr::null(),
            )
        };
        if ok == 0 {
            panic!(
                "fatal: PostQueuedCompletionStatus failed: {}",
                io::Error::last_os_error()
            );
        }
        if let Some(io_thread) = self.io_thread.take() {
            io_thread.join().expect("I/O thread panicked");
        }
    }
}

fn run_io_thread(context: IoThreadContext) {
    loop {
        let mut number_of_bytes_transferred = 0u32;
        let mut completion_key = 0usize;
        let mut overlapped: *mut OVERLAPPED = ptr::null_mut();
        let ok = unsafe {
            GetQueuedCompletionStatus(
                context.io_completion_port,
                &mut number_of_bytes_transferred,
                &mut completion_key,
                &mut overlapped,
                INFINITE,
            )
        };
        let error = if ok != 0 { 0 } else { unsafe { GetLastError() } };
        if ok == 0 && error != ERROR_OPERATION_ABORTED {
            panic!(
                "fatal: GetQueuedCompletionStatus failed: {}",
                io::Error::from_raw_os_error(error as i32)
            );
        }
        match completion_key {
            COMPLETION_KEY_DIRECTORY => {
                handle_directory_event(&context, overlapped, number_of_bytes_transferred, error);
            }
            COMPLETION_KEY_STOP_IO_THREAD => return,
            _ => unreachable!("unknown completion key {completion_key}"),
        }
    }
}

fn handle_directory_event(
    context: &IoThreadContext,
    overlapped: *mut OVERLAPPED,
    number_of_bytes_transferred: u32,
    error: u32,
) {
    let mut watched = context
        .state
        .watched_directories
        .lock()
        .expect("watched directory map lock poisoned");

    let aborted = error == ERROR_OPERATION_ABORTED;
    let record_ptr = WatchedDirectory::from_oplock_overlapped(overlapped);
    let directory = watched
        .iter()
        .find(|(_, record)| {
            let record: &WatchedDirectory = record;
            ptr::eq(record, record_ptr)
        })
        .map(|(directory, _)| directory.clone())
        .expect("completion for an unknown watched directory");

    if !aborted {
        // A directory oplock breaks when the directory or any of its
        // ancestors is renamed (the rename blocks until the oplock is
        // released) or when a file inside it is created, modified, or
        // deleted. Either way the cached resolution is suspect.
        debug!("oplock broke for {directory}");
        debug_assert_eq!(
            number_of_bytes_transferred as usize,
            size_of::<REQUEST_OPLOCK_OUTPUT_BUFFER>()
        );
        let record = &watched[&directory];
        debug_assert!(record.oplock_response.Flags & REQUEST_OPLOCK_OUTPUT_FLAG_ACK_REQUIRED != 0);
    }

    // Erasing the record closes its directory handle, releasing the oplock
    // (and unblocking any rename waiting on it).
    watched.remove(&directory);
    context.state.watched_directory_unwatched.notify_all();

    if !aborted {
        signal_event(context.change_event);
    }
}

fn open_directory(path: &Path) -> io::Result<OwnedHandle> {
    let wide = to_wide(path);
    let handle = unsafe {
        CreateFileW(
            wide.as_ptr(),
            GENERIC_READ,
            FILE_SHARE_DELETE | FILE_SHARE_READ | FILE_SHARE_WRITE,
            ptr::null(),
            OPEN_EXISTING,
            FILE_ATTRIBUTE_NORMAL | FILE_FLAG_BACKUP_SEMANTICS | FILE_FLAG_OVERLAPPED,
            ptr::null_mut(),
        )
    };
    if handle == INVALID_HANDLE_VALUE {
        return Err(io::Error::last_os_error());
    }
    Ok(unsafe { OwnedHandle::from_raw_handle(handle as RawHandle) })
}

fn query_file_id(handle: &OwnedHandle) -> io::Result<FILE_ID_INFO> {
    let mut id: FILE_ID_INFO = unsafe { zeroed() };
    let ok = unsafe {
        GetFileInformationByHandleEx(
            handle.as_raw_handle() as HANDLE,
            FileIdInfo,
            ptr::addr_of_mut!(id).cast(),
            size_of::<FILE_ID_INFO>() as u32,
        )
    };
    if ok == 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(id)
}

/// Structural identity: a directory replaced across a rename keeps its path
/// but changes its `(VolumeSerialNumber, FileId)`.
fn file_ids_equal(a: &FILE_ID_INFO, b: &FILE_ID_INFO) -> bool {
    a.VolumeSerialNumber == b.VolumeSerialNumber && a.FileId.Identifier == b.FileId.Identifier
}

fn create_auto_reset_event() -> io::Result<OwnedHandle> {
    let handle = unsafe { CreateEventW(ptr::null(), 0, 0, ptr::null()) };
    if handle.is_null() {
        return Err(io::Error::last_os_error());
    }
    Ok(unsafe { OwnedHandle::from_raw_handle(handle as RawHandle) })
}

fn create_io_completion_port() -> io::Result<OwnedHandle> {
    let handle =
        unsafe { CreateIoCompletionPort(INVALID_HANDLE_VALUE, ptr::null_mut(), 0, 1) };
    if handle.is_null() {
        return Err(io::Error::last_os_error());
    }
    Ok(unsafe { OwnedHandle::from_raw_handle(handle as RawHandle) })
}

fn attach_handle_to_iocp(handle: HANDLE, iocp: HANDLE, completion_key: usize) {
    let attached = unsafe { CreateIoCompletionPort(handle, iocp, completion_key, 1) };
    if attached != iocp {
        panic!(
            "fatal: cannot attach handle to I/O completion port: {}",
            io::Error::last_os_error()
        );
    }
}

fn signal_event(event: HANDLE) {
    let ok = unsafe { SetEvent(event) };
    if ok == 0 {
        panic!("fatal: SetEvent failed: {}", io::Error::last_os_error());
    }
}

fn to_wide(path: &Path) -> Vec<u16> {
    path.as_os_str()
        .encode_wide()
        .chain(std::iter::once(0))
        .collect()
}
