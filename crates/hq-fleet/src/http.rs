//! HTTP client for the fleet scheduler.

use async_trait::async_trait;
use hq_core::retry::{RetryConfig, retry_with_backoff};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, instrument};

use crate::backend::{
    ComputeBackend, SpawnRequest, SpawnTracking, TaskStatus, task_environment, task_tags,
    validate_resources,
};
use crate::errors::{FleetError, Result};

/// Fleet backend speaking JSON to the scheduler's task API.
#[derive(Clone, Debug)]
pub struct HttpFleetBackend {
    client: reqwest::Client,
    endpoint: String,
    project: String,
    retry: RetryConfig,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SubmitResponse {
    tracking_id: String,
}

impl HttpFleetBackend {
    /// Build a backend for the given scheduler endpoint.
    pub fn new(endpoint: impl Into<String>, project: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            project: project.into(),
            retry: RetryConfig::default(),
        }
    }

    /// Override the retry policy.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let message = response.text().await.unwrap_or_default();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(FleetError::TaskNotFound(message));
        }
        Err(FleetError::Rejected {
            status: status.as_u16(),
            message,
        })
    }

    fn retryable(err: &FleetError) -> bool {
        match err {
            FleetError::Transport(_) => true,
            // Scheduler overload is worth retrying; other rejections are not.
            FleetError::Rejected { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }
}

#[async_trait]
impl ComputeBackend for HttpFleetBackend {
    #[instrument(skip(self, request), fields(session_id = %request.session_id))]
    async fn spawn(&self, request: &SpawnRequest) -> Result<SpawnTracking> {
        validate_resources(request.cpu, request.memory)?;

        let body = json!({
            "environment": task_environment(request)
                .into_iter()
                .map(|(name, value)| json!({"name": name, "value": value}))
                .collect::<Vec<_>>(),
            "cpu": request.cpu,
            "memory": request.memory,
            "tags": task_tags(request, &self.project)
                .into_iter()
                .map(|(key, value)| json!({"key": key, "value": value}))
                .collect::<Vec<_>>(),
        });
        let url = format!("{}/tasks", self.endpoint);

        let response: SubmitResponse = retry_with_backoff(&self.retry, Self::retryable, || {
            let client = self.client.clone();
            let url = url.clone();
            let body = body.clone();
            async move {
                let response = client
                    .post(&url)
                    .json(&body)
                    .send()
                    .await
                    .map_err(|e| FleetError::Transport(e.to_string()))?;
                Self::check(response)
                    .await?
                    .json::<SubmitResponse>()
                    .await
                    .map_err(|e| FleetError::Transport(e.to_string()))
            }
        })
        .await?;

        debug!(tracking_id = %response.tracking_id, "task submitted");
        Ok(SpawnTracking {
            tracking_id: response.tracking_id,
        })
    }

    #[instrument(skip(self))]
    async fn stop(&self, tracking_id: &str) -> Result<()> {
        let url = format!("{}/tasks/{tracking_id}/stop", self.endpoint);
        let _ = retry_with_backoff(&self.retry, Self::retryable, || {
            let client = self.client.clone();
            let url = url.clone();
            async move {
                let response = client
                    .post(&url)
                    .send()
                    .await
                    .map_err(|e| FleetError::Transport(e.to_string()))?;
                Self::check(response).await
            }
        })
        .await?;
        Ok(())
    }

    async fn describe(&self, tracking_id: &str) -> Result<TaskStatus> {
        let url = format!("{}/tasks/{tracking_id}", self.endpoint);
        retry_with_backoff(&self.retry, Self::retryable, || {
            let client = self.client.clone();
            let url = url.clone();
            async move {
                let response = client
                    .get(&url)
                    .send()
                    .await
                    .map_err(|e| FleetError::Transport(e.to_string()))?;
                Self::check(response)
                    .await?
                    .json::<TaskStatus>()
                    .await
                    .map_err(|e| FleetError::Transport(e.to_string()))
            }
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::TaskState;
    use assert_matches::assert_matches;
    use serde_json::json;
    use std::time::Duration;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn fast_retry() -> RetryConfig {
        RetryConfig {
            max_retries: 2,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
        }
    }

    fn request() -> SpawnRequest {
        SpawnRequest {
            session_id: "sess_1".into(),
            worker_id: "wrk_1".into(),
            access_token: "tok".into(),
            api_url: "https://hq.example.com".into(),
            skill: "coding".into(),
            parameters: json!({}),
            cpu: 1024,
            memory: 2048,
        }
    }

    #[tokio::test]
    async fn spawn_submits_environment_and_tags() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/tasks"))
            .and(body_partial_json(json!({
                "cpu": 1024,
                "memory": 2048,
                "environment": [
                    {"name": "SESSION_ID", "value": "sess_1"},
                    {"name": "API_URL", "value": "https://hq.example.com"},
                    {"name": "ACCESS_TOKEN", "value": "tok"},
                    {"name": "WORKER_ID", "value": "wrk_1"},
                    {"name": "SKILL", "value": "coding"},
                    {"name": "PARAMETERS", "value": "{}"},
                ],
            })))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({
                "trackingId": "task-abc123"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let backend = HttpFleetBackend::new(server.uri(), "hq").with_retry(fast_retry());
        let tracking = backend.spawn(&request()).await.unwrap();
        assert_eq!(tracking.tracking_id, "task-abc123");
    }

    #[tokio::test]
    async fn spawn_rejects_invalid_resources_without_calling_scheduler() {
        let server = MockServer::start().await;
        // No mounted mock: any request would 404 and fail differently.
        let backend = HttpFleetBackend::new(server.uri(), "hq").with_retry(fast_retry());
        let mut bad = request();
        bad.cpu = 300;
        assert_matches!(
            backend.spawn(&bad).await,
            Err(FleetError::InvalidResources { cpu: 300, .. })
        );
        assert!(server.received_requests().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn spawn_retries_server_errors() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/tasks"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(1)
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/tasks"))
            .respond_with(
                ResponseTemplate::new(201).set_body_json(json!({"trackingId": "task-retry"})),
            )
            .expect(1)
            .mount(&server)
            .await;

        let backend = HttpFleetBackend::new(server.uri(), "hq").with_retry(fast_retry());
        let tracking = backend.spawn(&request()).await.unwrap();
        assert_eq!(tracking.tracking_id, "task-retry");
    }

    #[tokio::test]
    async fn spawn_does_not_retry_client_rejection() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/tasks"))
            .respond_with(ResponseTemplate::new(400).set_body_string("bad image"))
            .expect(1)
            .mount(&server)
            .await;

        let backend = HttpFleetBackend::new(server.uri(), "hq").with_retry(fast_retry());
        assert_matches!(
            backend.spawn(&request()).await,
            Err(FleetError::Rejected { status: 400, .. })
        );
    }

    #[tokio::test]
    async fn describe_parses_status() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/tasks/task-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "trackingId": "task-1",
                "state": "running",
            })))
            .mount(&server)
            .await;

        let backend = HttpFleetBackend::new(server.uri(), "hq").with_retry(fast_retry());
        let status = backend.describe("task-1").await.unwrap();
        assert_eq!(status.state, TaskState::Running);
        assert!(status.detail.is_none());
    }

    #[tokio::test]
    async fn stop_propagates_not_found() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/tasks/task-x/stop"))
            .respond_with(ResponseTemplate::new(404).set_body_string("task-x"))
            .mount(&server)
            .await;

        let backend = HttpFleetBackend::new(server.uri(), "hq").with_retry(fast_retry());
        assert_matches!(
            backend.stop("task-x").await,
            Err(FleetError::TaskNotFound(_))
        );
    }
}
