//! Linter configuration objects
//!
//! A [`Configuration`] carries the set of declared global variables parsed
//! from a `quick-lint-js.config` JSON file. Configurations are shared by
//! identity: every watched file that resolves to the same config file holds
//! the same `Arc<Configuration>`, and content changes are applied *in place*
//! (via [`Configuration::reset`] + [`Configuration::load_from_json`]) so
//! every holder observes the update. Interior state therefore lives behind
//! an `RwLock`.
//!
//! The JSON format is small:
//!
//! ```json
//! {
//!   "global-groups": ["ecmascript", "browser"],
//!   "globals": {
//!     "myGlobal": true,
//!     "jQuery": { "writable": false },
//!     "console": false
//!   }
//! }
//! ```
//!
//! Parse failures are recorded on the configuration itself and never block
//! cache insertion.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, OnceLock, RwLock};

use serde::Deserialize;
use tracing::{debug, warn};

use crate::canonical::CanonicalPath;

/// How a global variable may be used by linted code.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GlobalDeclaration {
    pub is_writable: bool,
    pub is_shadowable: bool,
}

impl Default for GlobalDeclaration {
    fn default() -> Self {
        Self {
            is_writable: true,
            is_shadowable: true,
        }
    }
}

/// Built-in global groups selectable via `"global-groups"`.
const GLOBAL_GROUPS: &[(&str, &[&str])] = &[
    ("ecmascript", ECMASCRIPT_GLOBALS),
    ("browser", BROWSER_GLOBALS),
    ("node.js", NODE_GLOBALS),
];

const ECMASCRIPT_GLOBALS: &[&str] = &[
    "Array",
    "ArrayBuffer",
    "Atomics",
    "BigInt",
    "BigInt64Array",
    "BigUint64Array",
    "Boolean",
    "DataView",
    "Date",
    "Error",
    "EvalError",
    "Float32Array",
    "Float64Array",
    "Function",
    "Infinity",
    "Int16Array",
    "Int32Array",
    "Int8Array",
    "JSON",
    "Map",
    "Math",
    "NaN",
    "Number",
    "Object",
    "Promise",
    "Proxy",
    "RangeError",
    "ReferenceError",
    "Reflect",
    "RegExp",
    "Set",
    "SharedArrayBuffer",
    "String",
    "Symbol",
    "SyntaxError",
    "TypeError",
    "URIError",
    "Uint16Array",
    "Uint32Array",
    "Uint8Array",
    "Uint8ClampedArray",
    "WeakMap",
    "WeakSet",
    "decodeURI",
    "decodeURIComponent",
    "encodeURI",
    "encodeURIComponent",
    "eval",
    "globalThis",
    "isFinite",
    "isNaN",
    "parseFloat",
    "parseInt",
    "undefined",
];

const BROWSER_GLOBALS: &[&str] = &[
    "CustomEvent",
    "Event",
    "EventTarget",
    "HTMLElement",
    "URL",
    "URLSearchParams",
    "Worker",
    "XMLHttpRequest",
    "alert",
    "atob",
    "btoa",
    "cancelAnimationFrame",
    "clearInterval",
    "clearTimeout",
    "console",
    "document",
    "fetch",
    "localStorage",
    "navigator",
    "requestAnimationFrame",
    "sessionStorage",
    "setInterval",
    "setTimeout",
    "window",
];

const NODE_GLOBALS: &[&str] = &[
    "Buffer",
    "TextDecoder",
    "TextEncoder",
    "__dirname",
    "__filename",
    "clearImmediate",
    "console",
    "exports",
    "global",
    "module",
    "process",
    "require",
    "setImmediate",
];

/// Globals whose built-in declaration is neither writable nor shadowable.
const NON_WRITABLE_GLOBALS: &[&str] = &["Infinity", "NaN", "globalThis", "undefined"];

#[derive(Debug)]
struct ConfigurationData {
    config_file_path: Option<CanonicalPath>,
    /// Explicit declarations from the config file's `"globals"` object.
    declared_globals: HashMap<String, GlobalDeclaration>,
    /// Names disabled with `"name": false`.
    removed_globals: HashSet<String>,
    /// Enabled built-in group names; `None` means all groups.
    enabled_groups: Option<Vec<String>>,
    /// Parse errors from the most recent load.
    errors: Vec<String>,
}

impl ConfigurationData {
    fn new() -> Self {
        Self {
            config_file_path: None,
            declared_globals: HashMap::new(),
            removed_globals: HashSet::new(),
            enabled_groups: None,
            errors: Vec::new(),
        }
    }
}

/// A linter configuration: declared globals plus the config file it came
/// from. See the module docs for the sharing and mutation protocol.
#[derive(Debug)]
pub struct Configuration {
    data: RwLock<ConfigurationData>,
}

impl Configuration {
    /// A configuration with only the built-in global groups declared.
    pub fn new() -> Self {
        Self {
            data: RwLock::new(ConfigurationData::new()),
        }
    }

    /// The process-wide default configuration used when no config file
    /// applies to a watched file. Read-only by convention; never mutate it.
    pub fn default_config() -> &'static Arc<Configuration> {
        static DEFAULT: OnceLock<Arc<Configuration>> = OnceLock::new();
        DEFAULT.get_or_init(|| Arc::new(Configuration::new()))
    }

    /// The canonical path of the config file this configuration was loaded
    /// from, or `None` for the default configuration.
    pub fn config_file_path(&self) -> Option<CanonicalPath> {
        self.read().config_file_path.clone()
    }

    pub fn set_config_file_path(&self, path: CanonicalPath) {
        self.write().config_file_path = Some(path);
    }

    /// Restore built-in globals and clear parse errors.
    ///
    /// The config file path is kept; reloading after a content change goes
    /// `reset()` then `load_from_json()` on the same object.
    pub fn reset(&self) {
        let mut data = self.write();
        data.declared_globals.clear();
        data.removed_globals.clear();
        data.enabled_groups = None;
        data.errors.clear();
    }

    /// Parse a config file's bytes into this configuration.
    ///
    /// Parse failures are recorded on the configuration (see
    /// [`Configuration::errors`]) and leave the built-in globals in effect.
    pub fn load_from_json(&self, json: &[u8]) {
        let parsed: ConfigFileJson = match serde_json::from_slice(json) {
            Ok(parsed) => parsed,
            Err(err) => {
                let path = self
                    .config_file_path()
                    .map(|p| p.to_string())
                    .unwrap_or_else(|| "<config>".to_string());
                warn!("failed to parse {path}: {err}");
                self.write().errors.push(err.to_string());
                return;
            }
        };

        let mut data = self.write();
        match parsed.global_groups {
            None | Some(GlobalGroupsJson::Toggle(true)) => {}
            Some(GlobalGroupsJson::Toggle(false)) => data.enabled_groups = Some(Vec::new()),
            Some(GlobalGroupsJson::Names(names)) => data.enabled_groups = Some(names),
        }
        for (name, value) in parsed.globals {
            match value {
                GlobalValueJson::Declare(true) => {
                    data.declared_globals
                        .insert(name, GlobalDeclaration::default());
                }
                GlobalValueJson::Declare(false) => {
                    data.declared_globals.remove(&name);
                    data.removed_globals.insert(name);
                }
                GlobalValueJson::Detailed {
                    writable,
                    shadowable,
                } => {
                    data.declared_globals.insert(
                        name,
                        GlobalDeclaration {
                            is_writable: writable.unwrap_or(true),
                            is_shadowable: shadowable.unwrap_or(true),
                        },
                    );
                }
            }
        }
        debug!(
            "loaded configuration: {} explicit globals, {} removed",
            data.declared_globals.len(),
            data.removed_globals.len()
        );
    }

    /// Look up a global variable declaration by name.
    pub fn find_global(&self, name: &str) -> Option<GlobalDeclaration> {
        let data = self.read();
        if let Some(declaration) = data.declared_globals.get(name) {
            return Some(*declaration);
        }
        if data.removed_globals.contains(name) {
            return None;
        }
        let group_enabled = |group_name: &str| match &data.enabled_groups {
            None => true,
            Some(enabled) => enabled.iter().any(|g| g == group_name),
        };
        for (group_name, globals) in GLOBAL_GROUPS {
            if group_enabled(group_name) && globals.contains(&name) {
                let non_writable = NON_WRITABLE_GLOBALS.contains(&name);
                return Some(GlobalDeclaration {
                    is_writable: !non_writable,
                    is_shadowable: !non_writable,
                });
            }
        }
        None
    }

    pub fn has_errors(&self) -> bool {
        !self.read().errors.is_empty()
    }

    pub fn errors(&self) -> Vec<String> {
        self.read().errors.clone()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, ConfigurationData> {
        self.data.read().expect("configuration lock poisoned")
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, ConfigurationData> {
        self.data.write().expect("configuration lock poisoned")
    }
}

impl Default for Configuration {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Default, Deserialize)]
struct ConfigFileJson {
    #[serde(default)]
    globals: HashMap<String, GlobalValueJson>,
    #[serde(default, rename = "global-groups")]
    global_groups: Option<GlobalGroupsJson>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum GlobalValueJson {
    Declare(bool),
    Detailed {
        writable: Option<bool>,
        shadowable: Option<bool>,
    },
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum GlobalGroupsJson {
    Toggle(bool),
    Names(Vec<String>),
}
