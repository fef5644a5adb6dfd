//! The process-wide service container.
//!
//! Everything stateful is constructed here, once, at startup. Tests build a
//! fresh container per test instead of resetting globals.

use hq_fleet::ComputeBackend;
use hq_settings::HqSettings;
use hq_store::Store;
use hq_sync::SyncPoller;
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

use crate::auth::{AccessTokenService, ApiKeyService};
use crate::blocker::QuestionBlocker;
use crate::sessions::SessionService;
use crate::ws::registry::{ConnectionRegistry, spawn_heartbeat};

/// Shared handles for every subsystem.
pub struct Services {
    /// Resolved configuration.
    pub settings: Arc<HqSettings>,
    /// Persistence.
    pub store: Arc<Store>,
    /// Connection registry.
    pub registry: Arc<ConnectionRegistry>,
    /// Session access tokens.
    pub tokens: Arc<AccessTokenService>,
    /// API keys and rate limiting.
    pub api_keys: Arc<ApiKeyService>,
    /// Question blocker.
    pub blocker: Arc<QuestionBlocker>,
    /// Session lifecycle.
    pub sessions: Arc<SessionService>,
    /// Compute fleet.
    pub fleet: Arc<dyn ComputeBackend>,
    /// Optional object-store mirror (None when storage is unconfigured).
    pub sync: Option<Arc<SyncPoller>>,
    /// Prometheus render handle.
    pub metrics_handle: PrometheusHandle,
    /// Process start, for uptime reporting.
    pub started_at: Instant,
    /// Root cancellation token.
    pub shutdown: CancellationToken,
}

impl Services {
    /// Wire up every subsystem. Must run inside a Tokio runtime (spawns the
    /// heartbeat and the blocker's answer forwarder).
    pub fn new(
        settings: Arc<HqSettings>,
        store: Arc<Store>,
        fleet: Arc<dyn ComputeBackend>,
        sync: Option<Arc<SyncPoller>>,
    ) -> Arc<Self> {
        let shutdown = CancellationToken::new();
        let registry = Arc::new(ConnectionRegistry::new());
        let tokens = Arc::new(AccessTokenService::new());
        let api_keys = Arc::new(ApiKeyService::new(Arc::clone(&store)));
        let blocker = Arc::new(QuestionBlocker::new(Arc::clone(&store)));
        let sessions = SessionService::new(
            Arc::clone(&store),
            Arc::clone(&registry),
            Arc::clone(&blocker),
            Arc::clone(&tokens),
            Arc::clone(&fleet),
            Arc::clone(&settings),
            shutdown.clone(),
        );
        let _ = spawn_heartbeat(
            Arc::clone(&registry),
            Duration::from_millis(settings.timeouts.heartbeat_ms),
            shutdown.clone(),
        );
        let metrics_handle = crate::metrics::install_recorder();

        Arc::new(Self {
            settings,
            store,
            registry,
            tokens,
            api_keys,
            blocker,
            sessions,
            fleet,
            sync,
            metrics_handle,
            started_at: Instant::now(),
            shutdown,
        })
    }

    /// Begin graceful shutdown: actors drain, the heartbeat stops, and the
    /// poller finishes its in-flight cycle.
    pub fn begin_shutdown(&self) {
        self.shutdown.cancel();
        if let Some(sync) = &self.sync {
            sync.stop_polling();
        }
        for conn in self.registry.all() {
            conn.close(1001, "Server shutting down");
        }
    }
}

/// Axum state: the container behind an `Arc`.
#[derive(Clone)]
pub struct AppState {
    /// The service container.
    pub services: Arc<Services>,
}

impl AppState {
    /// Wrap a container.
    pub fn new(services: Arc<Services>) -> Self {
        Self { services }
    }
}
