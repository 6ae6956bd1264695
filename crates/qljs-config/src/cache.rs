//! Loaded configuration cache
//!
//! One [`LoadedConfigFile`] per canonical config-file path. An entry's
//! `Arc<Configuration>` is never replaced: content changes mutate the
//! configuration in place so that identity sharing holds for every watched
//! file resolving to the same config file. Each content change bumps a
//! version counter; watches compare the counter they last observed to
//! decide whether to emit a change event.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use crate::canonical::CanonicalPath;
use crate::config::Configuration;

#[derive(Debug)]
pub(crate) struct LoadedConfigFile {
    pub file_content: Vec<u8>,
    /// Bumped on every content change; starts at 1.
    pub version: u64,
    pub config: Arc<Configuration>,
}

/// Cache of loaded configs keyed by canonical config-file path.
///
/// Entries are never evicted during a session, even when their backing file
/// disappears: a watch that stops resolving to the file simply stops
/// pointing at the entry.
#[derive(Debug, Default)]
pub(crate) struct ConfigCache {
    files: HashMap<CanonicalPath, LoadedConfigFile>,
}

impl ConfigCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, path: &CanonicalPath) -> Option<&LoadedConfigFile> {
        self.files.get(path)
    }

    /// Insert the config file's freshly read bytes.
    ///
    /// Miss: parse a new configuration. Hit with identical bytes: reuse as
    /// is. Hit with different bytes: reset and reload the existing
    /// configuration in place, preserving its identity.
    pub fn load(&mut self, path: &CanonicalPath, content: Vec<u8>) -> &LoadedConfigFile {
        match self.files.entry(path.clone()) {
            Entry::Vacant(vacant) => {
                debug!("loading configuration from {path}");
                let config = Arc::new(Configuration::new());
                config.set_config_file_path(path.clone());
                config.load_from_json(&content);
                vacant.insert(LoadedConfigFile {
                    file_content: content,
                    version: 1,
                    config,
                })
            }
            Entry::Occupied(occupied) => {
                let entry = occupied.into_mut();
                if entry.file_content != content {
                    debug!("reloading configuration from {path}");
                    entry.file_content = content;
                    entry.version += 1;
                    entry.config.reset();
                    entry.config.load_from_json(&entry.file_content);
                }
                entry
            }
        }
    }
}
