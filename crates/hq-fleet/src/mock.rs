//! Scriptable in-process backend for tests.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use crate::backend::{
    ComputeBackend, SpawnRequest, SpawnTracking, TaskState, TaskStatus, validate_resources,
};
use crate::errors::{FleetError, Result};

/// In-memory [`ComputeBackend`] recording every call.
#[derive(Debug, Default)]
pub struct MockComputeBackend {
    spawned: Mutex<Vec<SpawnRequest>>,
    tasks: Mutex<HashMap<String, TaskState>>,
    counter: AtomicU64,
    fail_spawn: AtomicBool,
}

impl MockComputeBackend {
    /// Fresh mock.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent `spawn` calls fail with a transport error.
    pub fn fail_spawns(&self, fail: bool) {
        self.fail_spawn.store(fail, Ordering::SeqCst);
    }

    /// All spawn requests seen so far.
    pub fn spawned(&self) -> Vec<SpawnRequest> {
        self.spawned.lock().clone()
    }

    /// Flip a task's reported state.
    pub fn set_task_state(&self, tracking_id: &str, state: TaskState) {
        let _ = self.tasks.lock().insert(tracking_id.to_string(), state);
    }
}

#[async_trait]
impl ComputeBackend for MockComputeBackend {
    async fn spawn(&self, request: &SpawnRequest) -> Result<SpawnTracking> {
        validate_resources(request.cpu, request.memory)?;
        if self.fail_spawn.load(Ordering::SeqCst) {
            return Err(FleetError::Transport("injected spawn failure".into()));
        }
        let tracking_id = format!("task-{}", self.counter.fetch_add(1, Ordering::SeqCst));
        self.spawned.lock().push(request.clone());
        let _ = self
            .tasks
            .lock()
            .insert(tracking_id.clone(), TaskState::Provisioning);
        Ok(SpawnTracking { tracking_id })
    }

    async fn stop(&self, tracking_id: &str) -> Result<()> {
        let mut tasks = self.tasks.lock();
        match tasks.get_mut(tracking_id) {
            Some(state) => {
                *state = TaskState::Stopped;
                Ok(())
            }
            None => Err(FleetError::TaskNotFound(tracking_id.to_string())),
        }
    }

    async fn describe(&self, tracking_id: &str) -> Result<TaskStatus> {
        self.tasks
            .lock()
            .get(tracking_id)
            .map(|state| TaskStatus {
                tracking_id: tracking_id.to_string(),
                state: *state,
                detail: None,
            })
            .ok_or_else(|| FleetError::TaskNotFound(tracking_id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use serde_json::json;

    fn request() -> SpawnRequest {
        SpawnRequest {
            session_id: "sess_1".into(),
            worker_id: "wrk_1".into(),
            access_token: "tok".into(),
            api_url: "http://localhost".into(),
            skill: "coding".into(),
            parameters: json!({}),
            cpu: 512,
            memory: 1024,
        }
    }

    #[tokio::test]
    async fn spawn_records_and_tracks() {
        let mock = MockComputeBackend::new();
        let tracking = mock.spawn(&request()).await.unwrap();
        assert_eq!(mock.spawned().len(), 1);
        let status = mock.describe(&tracking.tracking_id).await.unwrap();
        assert_eq!(status.state, TaskState::Provisioning);

        mock.stop(&tracking.tracking_id).await.unwrap();
        let status = mock.describe(&tracking.tracking_id).await.unwrap();
        assert_eq!(status.state, TaskState::Stopped);
    }

    #[tokio::test]
    async fn injected_failure_surfaces() {
        let mock = MockComputeBackend::new();
        mock.fail_spawns(true);
        assert_matches!(
            mock.spawn(&request()).await,
            Err(FleetError::Transport(_))
        );
        assert!(mock.spawned().is_empty());
    }

    #[tokio::test]
    async fn unknown_task_operations_fail() {
        let mock = MockComputeBackend::new();
        assert_matches!(mock.stop("nope").await, Err(FleetError::TaskNotFound(_)));
        assert_matches!(
            mock.describe("nope").await,
            Err(FleetError::TaskNotFound(_))
        );
    }
}
