//! # hq-settings
//!
//! Layered configuration for the HQ control plane.
//!
//! Settings are loaded from three layers (in priority order):
//! 1. **Compiled defaults** — [`HqSettings::default()`]
//! 2. **User file** — `~/.hq/settings.json` (deep-merged over defaults)
//! 3. **Environment variables** — `PORT`, `API_URL`, `SKIP_AUTH`, `HQ_*`
//!    (highest priority)
//!
//! The global singleton is reloadable: tests and the binary can swap the
//! cached value with [`init_settings`]; all subsequent [`get_settings`]
//! calls return the new snapshot.

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{deep_merge, load_settings, load_settings_from_path, settings_path};
pub use types::*;

use std::sync::{Arc, RwLock};

/// Global settings singleton.
///
/// `RwLock<Option<Arc<…>>>` rather than `OnceLock` so the cached value can
/// be swapped after a reload. Reads are cheap (shared lock + `Arc::clone`).
static SETTINGS: RwLock<Option<Arc<HqSettings>>> = RwLock::new(None);

/// Get the global settings snapshot.
///
/// On first call, loads from `~/.hq/settings.json` with env overrides. On
/// failure, falls back to compiled defaults with a warning.
pub fn get_settings() -> Arc<HqSettings> {
    {
        let guard = SETTINGS.read().expect("settings lock poisoned");
        if let Some(ref s) = *guard {
            return Arc::clone(s);
        }
    }

    let mut guard = SETTINGS.write().expect("settings lock poisoned");
    // Another thread may have initialized between the locks.
    if let Some(ref s) = *guard {
        return Arc::clone(s);
    }

    let settings = Arc::new(match load_settings() {
        Ok(s) => s,
        Err(e) => {
            tracing::warn!(error = %e, "failed to load settings, using defaults");
            HqSettings::default()
        }
    });
    *guard = Some(Arc::clone(&settings));
    settings
}

/// Replace the global settings with a specific value.
///
/// Used by the binary after CLI/env resolution and by tests.
pub fn init_settings(settings: HqSettings) {
    let mut guard = SETTINGS.write().expect("settings lock poisoned");
    *guard = Some(Arc::new(settings));
}
