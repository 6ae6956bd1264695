//! qljs-config
//!
//! Per-file configuration resolution with live filesystem change tracking
//! for `quick-lint-js.config` files.
//!
//! Given source files under observation, this crate finds the nearest
//! ancestor configuration file for each one (`quick-lint-js.config`, then
//! `.quick-lint-js.config`, closer directories shadowing farther ones),
//! loads and caches the parsed configurations with identity sharing across
//! files that resolve to the same config, and reports a minimal set of
//! change events whenever filesystem mutations would alter any watched
//! file's resolved configuration.
//!
//! Three layers compose:
//!
//! * [`fs::ConfigFilesystem`] — a narrow capability surface (canonicalize,
//!   enter a directory, read a file) with passive, fake, and watching
//!   realizations.
//! * [`ConfigChangeDetector`] — filesystem-agnostic resolution, caching,
//!   and change detection.
//! * [`watch`] — OS backends (inotify, kqueue, Win32 oplocks) that turn
//!   filesystem mutations into a wait-handle signal; callers then invoke
//!   `refresh` to re-derive state.
//!
//! [`ConfigLoader`] is a thinner front-end for one-shot lints: it adds
//! explicit `--config-file` paths, stdin/working-directory resolution, and
//! a recoverable error channel.

mod cache;

pub mod canonical;
pub mod config;
pub mod detector;
pub mod error;
pub mod fs;
pub mod loader;
pub mod watch;

pub use canonical::{canonicalize_path, CanonicalPath, CanonicalPathResult};
pub use config::{Configuration, GlobalDeclaration};
pub use detector::{ConfigChange, ConfigChangeDetector, CONFIG_FILE_NAMES};
pub use error::{CanonicalizeError, ConfigLoadError, FileReadError, Result};
pub use fs::{rename_file, BasicFilesystem, ConfigFilesystem, FakeFilesystem};
pub use loader::{ConfigLoader, InputFile};

/// Initialize the tracing subscriber for logging
pub fn init_tracing() {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("qljs_config=info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_file(true)
                .with_line_number(true),
        )
        .init();
}
