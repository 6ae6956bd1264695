//! Configuration loading front-end
//!
//! [`ConfigLoader`] resolves configurations for files to lint. It shares
//! the ancestor-walk algorithm and loaded-config cache with the change
//! detector but additionally supports explicit `--config-file` paths,
//! current-working-directory resolution for stdin input, and a recoverable
//! error channel: canonicalization failures and non-not-found read failures
//! come back as [`ConfigLoadError`] values instead of panicking.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::cache::ConfigCache;
use crate::canonical::CanonicalPath;
use crate::config::Configuration;
use crate::detector::{
    find_config_file, resolution_start_directory, ConfigChange, FoundConfigFile,
};
use crate::error::Result;
use crate::fs::ConfigFilesystem;

/// One file to lint, as described by the command line.
#[derive(Clone, Copy, Debug, Default)]
pub struct InputFile<'a> {
    /// Path of the source file; `None` for stdin.
    pub path: Option<&'a str>,
    /// Explicit `--config-file` path, bypassing the ancestor walk.
    pub config_file: Option<&'a str>,
    /// Resolve as though the input were a file in the working directory.
    pub is_stdin: bool,
}

#[derive(Debug)]
struct LoaderWatch {
    input_path: String,
    config_file_path: Option<CanonicalPath>,
    config_version: u64,
}

/// Configuration resolver for files to lint.
///
/// Inputs loaded by source path are tracked; [`ConfigLoader::refresh`]
/// re-resolves them and reports which configurations changed. Explicit
/// config files and stdin are resolved but not tracked.
///
/// Not thread-safe; serialize access externally.
pub struct ConfigLoader {
    fs: Arc<dyn ConfigFilesystem>,
    cache: ConfigCache,
    watches: Vec<LoaderWatch>,
}

impl ConfigLoader {
    pub fn new(fs: Arc<dyn ConfigFilesystem>) -> Self {
        Self {
            fs,
            cache: ConfigCache::new(),
            watches: Vec::new(),
        }
    }

    /// Resolve the configuration for one input file.
    pub fn load_for_file(&mut self, file: &InputFile<'_>) -> Result<Arc<Configuration>> {
        if let Some(config_file) = file.config_file {
            self.load_config_file(config_file)
        } else if let Some(path) = file.path {
            self.find_and_load_config_for_input(path)
        } else {
            self.find_and_load_config_for_current_directory()
        }
    }

    /// Resolve the configuration for a source file path (no explicit
    /// config). The path is tracked for [`ConfigLoader::refresh`].
    pub fn load_for_file_path(&mut self, path: &str) -> Result<Arc<Configuration>> {
        self.find_and_load_config_for_input(path)
    }

    /// Load an explicit config file, sharing the cache by canonical path.
    ///
    /// Two loads of the same explicit path observe the same configuration
    /// object; an explicit `.quick-lint-js.config` never shares with a
    /// discovered `quick-lint-js.config` in the same directory (different
    /// canonical paths).
    pub fn load_config_file(&mut self, config_path: &str) -> Result<Arc<Configuration>> {
        let canonical = self
            .fs
            .canonicalize_path(config_path)?
            .into_canonical();

        if let Some(entry) = self.cache.get(&canonical) {
            return Ok(Arc::clone(&entry.config));
        }
        let content = self.fs.read_file_path(&canonical)?;
        let entry = self.cache.load(&canonical, content);
        Ok(Arc::clone(&entry.config))
    }

    fn find_and_load_config_for_input(&mut self, path: &str) -> Result<Arc<Configuration>> {
        let index = match self
            .watches
            .iter()
            .position(|watch| watch.input_path == path)
        {
            Some(index) => index,
            None => {
                debug!("tracking input {path}");
                self.watches.push(LoaderWatch {
                    input_path: path.to_string(),
                    config_file_path: None,
                    config_version: 0,
                });
                self.watches.len() - 1
            }
        };

        // Memoized: a previous load already resolved this input.
        if let Some(config_path) = &self.watches[index].config_file_path {
            if let Some(entry) = self.cache.get(config_path) {
                return Ok(Arc::clone(&entry.config));
            }
        }

        let fs = Arc::clone(&self.fs);
        let canonical = fs.canonicalize_path(path)?;
        let start = resolution_start_directory(canonical);
        let found = find_config_file(&*fs, &start, Some(&self.cache))?;

        let watch = &mut self.watches[index];
        match found {
            FoundConfigFile::Found { path, content } => {
                let entry = self.cache.load(&path, content);
                watch.config_file_path = Some(path);
                watch.config_version = entry.version;
                Ok(Arc::clone(&entry.config))
            }
            FoundConfigFile::AlreadyLoaded { path } => {
                let entry = self
                    .cache
                    .get(&path)
                    .expect("cache hit reported for a path not in the cache");
                watch.config_file_path = Some(path);
                watch.config_version = entry.version;
                Ok(Arc::clone(&entry.config))
            }
            FoundConfigFile::None => {
                watch.config_file_path = None;
                watch.config_version = 0;
                Ok(Arc::clone(Configuration::default_config()))
            }
        }
    }

    fn find_and_load_config_for_current_directory(&mut self) -> Result<Arc<Configuration>> {
        let fs = Arc::clone(&self.fs);
        let mut canonical = fs.canonicalize_path(".")?;
        if canonical.have_missing_components() {
            canonical.drop_missing_components();
        }
        let start = canonical.into_canonical();
        match find_config_file(&*fs, &start, Some(&self.cache))? {
            FoundConfigFile::Found { path, content } => {
                let entry = self.cache.load(&path, content);
                Ok(Arc::clone(&entry.config))
            }
            FoundConfigFile::AlreadyLoaded { path } => {
                let entry = self
                    .cache
                    .get(&path)
                    .expect("cache hit reported for a path not in the cache");
                Ok(Arc::clone(&entry.config))
            }
            FoundConfigFile::None => Ok(Arc::clone(Configuration::default_config())),
        }
    }

    /// Re-resolve every tracked input path. Returns one [`ConfigChange`]
    /// per input whose resolved config identity or content changed since
    /// the last observation, in tracking order.
    ///
    /// Unrecoverable per-input failures (canonicalization, read errors
    /// other than not-found) are logged and leave that input's previous
    /// state in place.
    pub fn refresh(&mut self) -> Vec<ConfigChange> {
        let fs = Arc::clone(&self.fs);
        let mut changes = Vec::new();

        for index in 0..self.watches.len() {
            let input_path = self.watches[index].input_path.clone();
            let canonical = match fs.canonicalize_path(&input_path) {
                Ok(canonical) => canonical,
                Err(err) => {
                    warn!("refresh skipped {input_path}: {err}");
                    continue;
                }
            };
            let start = resolution_start_directory(canonical);
            // Fresh reads only: content comparison drives change events.
            let found = match find_config_file(&*fs, &start, None) {
                Ok(found) => found,
                Err(err) => {
                    warn!("refresh skipped {input_path}: {err}");
                    continue;
                }
            };

            let watch = &mut self.watches[index];
            match found {
                FoundConfigFile::Found { path, content } => {
                    let entry = self.cache.load(&path, content);
                    let did_change = watch.config_file_path.as_ref() != Some(&path)
                        || watch.config_version != entry.version;
                    watch.config_file_path = Some(path);
                    watch.config_version = entry.version;
                    if did_change {
                        changes.push(ConfigChange {
                            watched_path: input_path,
                            config: Arc::clone(&entry.config),
                        });
                    }
                }
                FoundConfigFile::AlreadyLoaded { .. } => {
                    unreachable!("refresh walks never consult the cache")
                }
                FoundConfigFile::None => {
                    let did_change = watch.config_file_path.is_some();
                    watch.config_file_path = None;
                    watch.config_version = 0;
                    if did_change {
                        changes.push(ConfigChange {
                            watched_path: input_path,
                            config: Arc::clone(Configuration::default_config()),
                        });
                    }
                }
            }
        }
        changes
    }
}
