//! HTTP task-service driver
//!
//! Invokes a task's effective URL with its opaque parameters and decodes the
//! service's verdict. Transport failures become `fail_task_run` messages at
//! the dispatch layer; they are never fatal to the executor.

use async_trait::async_trait;
use tracing::{debug, instrument};

use conveyor_core::{DriverError, NextTask, TaskOutcome, TaskServiceDriver};

/// `reqwest`-backed implementation of the task-service contract
#[derive(Clone)]
pub struct HttpTaskDriver {
    client: reqwest::Client,
}

impl HttpTaskDriver {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }

    /// Use a preconfigured client (timeouts, proxies)
    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

impl Default for HttpTaskDriver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TaskServiceDriver for HttpTaskDriver {
    #[instrument(skip(self, task), fields(url = %task.url, task_order = task.task_order))]
    async fn run_task(&self, task: &NextTask) -> Result<TaskOutcome, DriverError> {
        let body = task
            .parameters
            .clone()
            .unwrap_or(serde_json::Value::Null);

        let response = self
            .client
            .post(&task.url)
            .json(&body)
            .send()
            .await
            .map_err(|e| DriverError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(DriverError::Transport(format!(
                "task service returned {status}"
            )));
        }

        let outcome: TaskOutcome = response
            .json()
            .await
            .map_err(|e| DriverError::InvalidResponse(e.to_string()))?;
        debug!(paused = outcome.paused, rules = outcome.rules.len(), "task service responded");
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;
    use wiremock::matchers::{body_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn next_task(url: String) -> NextTask {
        NextTask {
            workflow_run_id: Uuid::now_v7(),
            task_order: 1,
            task_id: Uuid::now_v7(),
            parameters: Some(serde_json::json!({"table": "accounts"})),
            url,
        }
    }

    #[tokio::test]
    async fn test_decodes_service_verdict() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/steps/refresh"))
            .and(body_json(serde_json::json!({"table": "accounts"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "output": "refreshed 41 rows",
                "paused": false,
                "rules": [{"name": "row-count", "failed": false}]
            })))
            .mount(&server)
            .await;

        let driver = HttpTaskDriver::new();
        let outcome = driver
            .run_task(&next_task(format!("{}/steps/refresh", server.uri())))
            .await
            .unwrap();

        assert_eq!(outcome.output.as_deref(), Some("refreshed 41 rows"));
        assert!(!outcome.paused);
        assert_eq!(outcome.rules.len(), 1);
        assert_eq!(outcome.rules[0].name, "row-count");
    }

    #[tokio::test]
    async fn test_missing_fields_default() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({})))
            .mount(&server)
            .await;

        let driver = HttpTaskDriver::new();
        let outcome = driver
            .run_task(&next_task(format!("{}/steps/noop", server.uri())))
            .await
            .unwrap();

        assert_eq!(outcome.output, None);
        assert!(!outcome.paused);
        assert!(outcome.rules.is_empty());
    }

    #[tokio::test]
    async fn test_http_error_is_transport_failure() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let driver = HttpTaskDriver::new();
        let err = driver
            .run_task(&next_task(format!("{}/steps/down", server.uri())))
            .await
            .unwrap_err();

        match err {
            DriverError::Transport(message) => assert!(message.contains("503")),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_garbage_body_is_invalid_response() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_string("not json"))
            .mount(&server)
            .await;

        let driver = HttpTaskDriver::new();
        let err = driver
            .run_task(&next_task(format!("{}/steps/garbled", server.uri())))
            .await
            .unwrap_err();
        assert!(matches!(err, DriverError::InvalidResponse(_)));
    }
}
