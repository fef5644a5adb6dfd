//! Settings schema with compiled defaults.
//!
//! Every field has a default so a missing or partial settings file is never
//! an error; the loader deep-merges file values over these and applies env
//! overrides last.

use serde::{Deserialize, Serialize};

/// Root settings document (`~/.hq/settings.json`).
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HqSettings {
    /// HTTP/WebSocket server.
    pub server: ServerSettings,
    /// Object-store mirror.
    pub storage: StorageSettings,
    /// Compute fleet.
    pub fleet: FleetSettings,
    /// Lifecycle timers.
    pub timeouts: TimeoutSettings,
}

/// HTTP/WebSocket server settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    /// Listen port. Env: `PORT`.
    pub port: u16,
    /// Public base URL handed to workers. Env: `API_URL`.
    pub api_url: String,
    /// Disable the auth gate (test environments only). Env: `SKIP_AUTH`.
    pub skip_auth: bool,
    /// Bounded per-connection outbound queue length.
    pub browser_queue_capacity: usize,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            port: 8080,
            api_url: "http://localhost:8080".into(),
            skip_auth: false,
            browser_queue_capacity: 1024,
        }
    }
}

/// Object-store mirror settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StorageSettings {
    /// Bucket name. Env: `HQ_BUCKET`.
    pub bucket: String,
    /// Key prefix to mirror. Env: `HQ_PREFIX`.
    pub prefix: String,
    /// Local mirror root. Env: `HQ_LOCAL_DIR`.
    pub local_dir: String,
    /// Poll interval in milliseconds.
    pub poll_interval_ms: u64,
    /// Concurrent download limit.
    pub concurrency: usize,
    /// What to do when a remote object disappears: `keep`, `trash`, `delete`.
    pub deleted_file_policy: String,
    /// Pagination cap per poll cycle.
    pub max_list_pages: usize,
    /// Mirror remote `lastModified` onto downloaded files.
    pub preserve_timestamps: bool,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            bucket: String::new(),
            prefix: String::new(),
            local_dir: String::new(),
            poll_interval_ms: 30_000,
            concurrency: 5,
            deleted_file_policy: "keep".into(),
            max_list_pages: 20,
            preserve_timestamps: true,
        }
    }
}

/// Compute fleet settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FleetSettings {
    /// Fleet scheduler endpoint. Env: `HQ_FLEET_URL`.
    pub endpoint: String,
    /// Project tag applied to every task.
    pub project: String,
    /// Default skill for spawned workers.
    pub skill: String,
    /// Task CPU units.
    pub cpu: u32,
    /// Task memory in MiB.
    pub memory: u32,
}

impl Default for FleetSettings {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            project: "hq".into(),
            skill: "coding".into(),
            cpu: 1024,
            memory: 2048,
        }
    }
}

/// Lifecycle timers, all in milliseconds.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TimeoutSettings {
    /// Session startup budget before `errored` ("Worker failed to start").
    pub startup_ms: u64,
    /// Idle budget since last worker activity before `stopped`.
    pub idle_ms: u64,
    /// Grace period before terminal session records are garbage-collected.
    pub grace_ttl_ms: u64,
    /// Question answer budget before the waiter is rejected.
    pub answer_ms: u64,
    /// Heartbeat ping interval for registered connections.
    pub heartbeat_ms: u64,
    /// Worker silence budget before the session is considered dead.
    pub keepalive_ms: u64,
}

impl Default for TimeoutSettings {
    fn default() -> Self {
        Self {
            startup_ms: 5 * 60 * 1000,
            idle_ms: 30 * 60 * 1000,
            grace_ttl_ms: 10 * 60 * 1000,
            answer_ms: 5 * 60 * 1000,
            heartbeat_ms: 30 * 1000,
            keepalive_ms: 2 * 60 * 1000,
        }
    }
}
