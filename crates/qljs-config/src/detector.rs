//! Configuration change detection
//!
//! [`ConfigChangeDetector`] owns the set of watched source files, the cache
//! of loaded configurations, and the ancestor-walk resolution algorithm.
//! It is filesystem-agnostic: change notifications arrive out of band
//! (through a watching [`ConfigFilesystem`] backend) and act purely as a
//! signal to call [`ConfigChangeDetector::refresh`], which re-derives all
//! state by probing the filesystem.

use std::sync::Arc;

use tracing::debug;

use crate::cache::ConfigCache;
use crate::canonical::{CanonicalPath, CanonicalPathResult};
use crate::config::Configuration;
use crate::error::FileReadError;
use crate::fs::ConfigFilesystem;

/// Config file names probed in each directory, in shadowing order: the
/// non-dot variant wins over the dot variant in the same directory.
pub const CONFIG_FILE_NAMES: [&str; 2] = ["quick-lint-js.config", ".quick-lint-js.config"];

/// Result of an ancestor walk.
pub(crate) enum FoundConfigFile {
    /// A config file was read from disk.
    Found {
        path: CanonicalPath,
        content: Vec<u8>,
    },
    /// A candidate path was already in the cache (loader fast path).
    AlreadyLoaded { path: CanonicalPath },
    /// No config file anywhere up to the root.
    None,
}

/// The directory an input path's ancestor walk starts from.
///
/// A canonical result with missing components means the requested file (and
/// possibly some ancestors) does not exist yet: start from the deepest
/// existing directory, without stripping a further component. Otherwise the
/// path names an existing file; start from its parent.
pub(crate) fn resolution_start_directory(mut canonical: CanonicalPathResult) -> CanonicalPath {
    let mut should_drop_file_name = true;
    if canonical.have_missing_components() {
        canonical.drop_missing_components();
        should_drop_file_name = false;
    }
    let mut directory = canonical.into_canonical();
    if should_drop_file_name {
        directory.parent();
    }
    directory
}

/// Ascend from `start` toward the filesystem root looking for a config
/// file, probing [`CONFIG_FILE_NAMES`] in shadowing order in each
/// directory.
///
/// Every ancestor is entered, even after a match: closer configs can appear
/// later and shadow the current one, so watching backends must watch the
/// whole chain. When `cache` is given, a candidate path already in the
/// cache short-circuits the read.
pub(crate) fn find_config_file(
    fs: &dyn ConfigFilesystem,
    start: &CanonicalPath,
    cache: Option<&ConfigCache>,
) -> Result<FoundConfigFile, FileReadError> {
    let mut directory = start.clone();
    let mut found = FoundConfigFile::None;
    loop {
        fs.enter_directory(&directory);

        if matches!(found, FoundConfigFile::None) {
            for file_name in CONFIG_FILE_NAMES {
                let config_path = directory.join_component(file_name);
                if let Some(cache) = cache {
                    if cache.get(&config_path).is_some() {
                        found = FoundConfigFile::AlreadyLoaded { path: config_path };
                        break;
                    }
                }
                match fs.read_file(&directory, file_name) {
                    Ok(content) => {
                        found = FoundConfigFile::Found {
                            path: config_path,
                            content,
                        };
                        break;
                    }
                    Err(err) if err.is_not_found() => {}
                    Err(err) => return Err(err),
                }
            }
        }

        if !directory.parent() {
            // Searched the root directory, which has no parent.
            break;
        }
    }
    Ok(found)
}

/// One change event from [`ConfigChangeDetector::refresh`]: the watched
/// file's resolved configuration identity or content changed.
#[derive(Clone, Debug)]
pub struct ConfigChange {
    /// The watched path as originally registered.
    pub watched_path: String,
    /// The new configuration; the default configuration when no config file
    /// applies anymore.
    pub config: Arc<Configuration>,
}

#[derive(Debug)]
struct WatchedFile {
    watched_path: String,
    /// Canonical path of the currently resolved config file; `None` means
    /// the default config applies. Storing the path rather than the loaded
    /// entry breaks the watch/config reference cycle.
    config_file_path: Option<CanonicalPath>,
    /// Cache version last observed for `config_file_path`.
    config_version: u64,
}

impl WatchedFile {
    fn new(watched_path: &str) -> Self {
        Self {
            watched_path: watched_path.to_string(),
            config_file_path: None,
            config_version: 0,
        }
    }
}

/// Outcome of resolving one watched file.
struct Resolution {
    config: Arc<Configuration>,
    did_change: bool,
}

/// Per-file configuration resolver with change tracking.
///
/// Not thread-safe; callers sharing a detector across threads must
/// serialize access externally.
pub struct ConfigChangeDetector {
    fs: Arc<dyn ConfigFilesystem>,
    watches: Vec<WatchedFile>,
    cache: ConfigCache,
}

impl ConfigChangeDetector {
    pub fn new(fs: Arc<dyn ConfigFilesystem>) -> Self {
        Self {
            fs,
            watches: Vec::new(),
            cache: ConfigCache::new(),
        }
    }

    /// Register `path` as watched and resolve its configuration.
    ///
    /// Idempotent by path string: registering the same path twice reuses
    /// the existing watch. Never fails for not-found situations; a missing
    /// file or directory chain resolves against the deepest existing
    /// ancestor.
    ///
    /// # Panics
    ///
    /// Panics when `path` cannot be canonicalized or when a config file
    /// candidate fails to read for a reason other than not-found. Callers
    /// needing these as recoverable errors use
    /// [`ConfigLoader`](crate::loader::ConfigLoader).
    pub fn get_config_for_file(&mut self, path: &str) -> Arc<Configuration> {
        let index = match self
            .watches
            .iter()
            .position(|watch| watch.watched_path == path)
        {
            Some(index) => index,
            None => {
                debug!("watching {path}");
                self.watches.push(WatchedFile::new(path));
                self.watches.len() - 1
            }
        };
        self.resolve_watch(index).config
    }

    /// Re-resolve every watched file, appending one [`ConfigChange`] per
    /// watched file whose resolved config identity or content changed since
    /// the last observation. Changes appear in watch-registration order.
    pub fn refresh(&mut self, out_changes: &mut Vec<ConfigChange>) {
        for index in 0..self.watches.len() {
            let resolution = self.resolve_watch(index);
            if resolution.did_change {
                out_changes.push(ConfigChange {
                    watched_path: self.watches[index].watched_path.clone(),
                    config: resolution.config,
                });
            }
        }
    }

    fn resolve_watch(&mut self, index: usize) -> Resolution {
        let fs = Arc::clone(&self.fs);
        let watched_path = self.watches[index].watched_path.clone();

        let canonical = match fs.canonicalize_path(&watched_path) {
            Ok(canonical) => canonical,
            Err(err) => panic!("cannot canonicalize watched path: {err}"),
        };
        let start = resolution_start_directory(canonical);
        // The detector always reads config bytes afresh (no cache
        // short-circuit): content comparison is what drives change events.
        let found = match find_config_file(&*fs, &start, None) {
            Ok(found) => found,
            Err(err) => panic!("cannot read configuration file: {err}"),
        };

        let watch = &mut self.watches[index];
        match found {
            FoundConfigFile::Found {
                path: config_path,
                content,
            } => {
                let entry = self.cache.load(&config_path, content);
                let did_change = watch.config_file_path.as_ref() != Some(&config_path)
                    || watch.config_version != entry.version;
                watch.config_file_path = Some(config_path);
                watch.config_version = entry.version;
                Resolution {
                    config: Arc::clone(&entry.config),
                    did_change,
                }
            }
            FoundConfigFile::AlreadyLoaded { .. } => {
                unreachable!("detector walks never consult the cache")
            }
            FoundConfigFile::None => {
                let did_change = watch.config_file_path.is_some();
                watch.config_file_path = None;
                watch.config_version = 0;
                Resolution {
                    config: Arc::clone(Configuration::default_config()),
                    did_change,
                }
            }
        }
    }
}
