//! Wire messages exchanged with executors and functions.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::engine::state::RunStatus;
use crate::store::DataMap;

/// Work request published on the work channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkRequest {
    pub step_instance_id: Uuid,
    pub workflow_instance_id: Uuid,
    pub run_status: RunStatus,
    pub service_url: Option<String>,
    pub function_name: String,
    pub function_type: String,
    pub cpu_request: Option<String>,
    pub memory_request: Option<String>,
    pub input_data: DataMap,
    pub output_data: DataMap,
    /// Attempt number; echoed back on the result.
    pub attempt: i32,
}

/// Step result consumed from the result channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepResult {
    pub step_instance_id: Uuid,
    pub workflow_instance_id: Uuid,
    pub run_status: RunStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    #[serde(rename = "callBackUrl", default, skip_serializing_if = "Option::is_none")]
    pub call_back_url: Option<String>,
    #[serde(default)]
    pub input_data: DataMap,
    #[serde(default)]
    pub output_data: DataMap,
    /// Attempt the result answers. Results without it skip the attempt check.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempt: Option<i32>,
}

impl StepResult {
    /// Result standing in for a dispatch that failed synchronously.
    pub fn canceled(
        workflow_instance_id: Uuid,
        step_instance_id: Uuid,
        attempt: i32,
        reason: String,
    ) -> Self {
        Self {
            step_instance_id,
            workflow_instance_id,
            run_status: RunStatus::Canceled,
            failure_reason: Some(reason),
            call_back_url: None,
            input_data: DataMap::new(),
            output_data: DataMap::new(),
            attempt: Some(attempt),
        }
    }
}

/// Body POSTed to a function's service URL in push mode.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushRequest {
    pub input_data: DataMap,
    pub callback_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
}

/// Body a function POSTs back to its callback URL.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallbackBody {
    pub run_status: RunStatus,
    #[serde(default)]
    pub failure_reason: Option<String>,
    #[serde(default)]
    pub input_data: DataMap,
    #[serde(default)]
    pub output_data: DataMap,
}

/// Outcome of waiting for lazily deployed functions, published on the
/// deployment channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentOutcome {
    pub workflow_instance_id: Uuid,
    pub ready: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_step_result_wire_names() {
        let raw = json!({
            "stepInstanceId": Uuid::nil(),
            "workflowInstanceId": Uuid::nil(),
            "runStatus": "TIMED_OUT",
            "callBackUrl": "http://engine/api/callback",
            "outputData": {"rows": 3}
        });
        let result: StepResult = serde_json::from_value(raw).unwrap();
        assert_eq!(result.run_status, RunStatus::TimedOut);
        assert_eq!(result.output_data["rows"], 3);
        assert!(result.attempt.is_none());
        assert!(result.call_back_url.is_some());
    }

    #[test]
    fn test_work_request_wire_names() {
        let request = WorkRequest {
            step_instance_id: Uuid::nil(),
            workflow_instance_id: Uuid::nil(),
            run_status: RunStatus::Running,
            service_url: Some("http://f:8080".to_string()),
            function_name: "f".to_string(),
            function_type: "python".to_string(),
            cpu_request: None,
            memory_request: Some("128Mi".to_string()),
            input_data: DataMap::new(),
            output_data: DataMap::new(),
            attempt: 2,
        };
        let json = serde_json::to_value(&request).unwrap();
        for key in ["stepInstanceId", "serviceUrl", "functionType", "memoryRequest", "attempt"] {
            assert!(json.get(key).is_some(), "missing {}", key);
        }
    }

    #[test]
    fn test_canceled_result() {
        let result = StepResult::canceled(Uuid::nil(), Uuid::nil(), 1, "gateway down".to_string());
        assert_eq!(result.run_status, RunStatus::Canceled);
        assert_eq!(result.attempt, Some(1));
    }
}
