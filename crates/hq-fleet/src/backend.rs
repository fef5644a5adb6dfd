//! The compute-backend seam and task composition helpers.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::{FleetError, Result};

/// Everything needed to launch one worker task.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpawnRequest {
    /// Session the worker belongs to.
    pub session_id: String,
    /// Worker identity inside the fleet.
    pub worker_id: String,
    /// Single-use relay credential.
    pub access_token: String,
    /// Control-plane base URL the worker dials back to.
    pub api_url: String,
    /// Skill the worker should load.
    pub skill: String,
    /// Free-form parameters, serialized as JSON into the environment.
    pub parameters: Value,
    /// CPU units.
    pub cpu: u32,
    /// Memory in MiB.
    pub memory: u32,
}

/// Handle returned by a successful submission.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpawnTracking {
    /// Backend-assigned task identifier.
    pub tracking_id: String,
}

/// Reported state of a fleet task.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// Submitted, container not yet running.
    Provisioning,
    /// Container running.
    Running,
    /// Finished or cancelled.
    Stopped,
    /// Failed to start or crashed.
    Failed,
}

/// Task status from `describe`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskStatus {
    /// The task.
    pub tracking_id: String,
    /// Current state.
    pub state: TaskState,
    /// Backend-provided detail (stop reason, exit code, …).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Launches and manages worker tasks.
#[async_trait]
pub trait ComputeBackend: Send + Sync {
    /// Validate and submit a task; returns the tracking handle.
    async fn spawn(&self, request: &SpawnRequest) -> Result<SpawnTracking>;

    /// Cancel a task.
    async fn stop(&self, tracking_id: &str) -> Result<()>;

    /// Report a task's current state.
    async fn describe(&self, tracking_id: &str) -> Result<TaskStatus>;
}

/// Supported cpu/memory combinations (cpu units → MiB range in 1024 steps).
const VALID_COMBINATIONS: &[(u32, u32, u32)] = &[
    (256, 512, 2048),
    (512, 1024, 4096),
    (1024, 2048, 8192),
    (2048, 4096, 16384),
    (4096, 8192, 30720),
];

/// Check a cpu/memory pair against the enumerated valid combinations.
pub fn validate_resources(cpu: u32, memory: u32) -> Result<()> {
    let valid = VALID_COMBINATIONS
        .iter()
        .any(|&(units, min_mem, max_mem)| {
            cpu == units && memory >= min_mem && memory <= max_mem && memory % 1024 == 0
                || cpu == units && memory == min_mem
        });
    if valid {
        Ok(())
    } else {
        Err(FleetError::InvalidResources { cpu, memory })
    }
}

/// Compose the worker's environment variables.
pub fn task_environment(request: &SpawnRequest) -> Vec<(String, String)> {
    vec![
        ("SESSION_ID".into(), request.session_id.clone()),
        ("API_URL".into(), request.api_url.clone()),
        ("ACCESS_TOKEN".into(), request.access_token.clone()),
        ("WORKER_ID".into(), request.worker_id.clone()),
        ("SKILL".into(), request.skill.clone()),
        ("PARAMETERS".into(), request.parameters.to_string()),
    ]
}

/// Compose the task tags.
pub fn task_tags(request: &SpawnRequest, project: &str) -> Vec<(String, String)> {
    vec![
        ("project".into(), project.to_string()),
        ("tracking-id".into(), request.session_id.clone()),
        ("worker-id".into(), request.worker_id.clone()),
        ("skill".into(), request.skill.clone()),
    ]
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
            api_url: "https://hq.example.com".into(),
            skill: "coding".into(),
            parameters: json!({"branch": "main"}),
            cpu: 1024,
            memory: 2048,
        }
    }

    #[test]
    fn valid_combinations_pass() {
        for (cpu, memory) in [
            (256, 512),
            (256, 1024),
            (256, 2048),
            (512, 1024),
            (512, 4096),
            (1024, 2048),
            (1024, 8192),
            (2048, 16384),
            (4096, 30720),
        ] {
            validate_resources(cpu, memory).unwrap();
        }
    }

    #[test]
    fn invalid_combinations_fail() {
        for (cpu, memory) in [
            (256, 4096),   // too much memory for the tier
            (1024, 1024),  // too little
            (300, 1024),   // unknown cpu tier
            (1024, 3000),  // not a 1024 step
            (4096, 65536), // beyond the tier cap
        ] {
            assert_matches!(
                validate_resources(cpu, memory),
                Err(FleetError::InvalidResources { .. }),
                "{cpu}/{memory} should be rejected"
            );
        }
    }

    #[test]
    fn environment_carries_session_identity() {
        let env = task_environment(&request());
        let lookup: std::collections::HashMap<_, _> = env.into_iter().collect();
        assert_eq!(lookup["SESSION_ID"], "sess_1");
        assert_eq!(lookup["API_URL"], "https://hq.example.com");
        assert_eq!(lookup["ACCESS_TOKEN"], "tok");
        assert_eq!(lookup["WORKER_ID"], "wrk_1");
        assert_eq!(lookup["SKILL"], "coding");
        assert_eq!(lookup["PARAMETERS"], r#"{"branch":"main"}"#);
    }

    #[test]
    fn tags_carry_project_and_identity() {
        let tags = task_tags(&request(), "hq");
        let lookup: std::collections::HashMap<_, _> = tags.into_iter().collect();
        assert_eq!(lookup["project"], "hq");
        assert_eq!(lookup["tracking-id"], "sess_1");
        assert_eq!(lookup["worker-id"], "wrk_1");
        assert_eq!(lookup["skill"], "coding");
    }
}
