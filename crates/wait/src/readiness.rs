//! Readiness predicates, one per kind the orchestrator waits on.

use k8s_openapi::api::apps::v1::Deployment;
use kube::core::DynamicObject;
use serde_json::Value as Json;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ReadinessError {
    /// The resource reached a terminal failure state.
    #[error("{0}")]
    Failed(String),
    /// The resource can never become ready as configured.
    #[error("{0}")]
    Invalid(String),
}

/// Found and ready predicates evaluated by the poller's two phases.
pub trait Readiness: Send + Sync {
    /// Whether a listed object exists far enough to start polling its readiness.
    fn found(&self, _obj: &DynamicObject) -> Result<bool, ReadinessError> {
        Ok(true)
    }

    fn ready(&self, obj: &DynamicObject) -> Result<bool, ReadinessError>;
}

/// `(type, status)` of the most recent entry of `status.conditions`.
pub fn last_condition(obj: &DynamicObject) -> Option<(&str, &str)> {
    let last = obj.data.get("status")?.get("conditions")?.as_array()?.last()?;
    let ty = last.get("type").and_then(Json::as_str)?;
    let status = last.get("status").and_then(Json::as_str).unwrap_or("");
    Some((ty, status))
}

/// Ready when the last condition is `condition` with status true.
/// An empty or missing condition list is "not yet".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LastCondition {
    pub condition: &'static str,
    /// Condition type that, when last and true, is a terminal failure.
    pub failure: Option<&'static str>,
}

impl LastCondition {
    /// BMC machine reachable with the supplied credentials.
    pub const CONTACTABLE: LastCondition = LastCondition { condition: "Contactable", failure: None };
    /// BMC power job finished all tasks.
    pub const COMPLETED: LastCondition = LastCondition { condition: "Completed", failure: Some("Failed") };
}

impl Readiness for LastCondition {
    fn ready(&self, obj: &DynamicObject) -> Result<bool, ReadinessError> {
        let Some((ty, status)) = last_condition(obj) else {
            return Ok(false);
        };
        let is_true = status.eq_ignore_ascii_case("true");
        if is_true && self.failure == Some(ty) {
            let msg = obj
                .data
                .pointer("/status/message")
                .and_then(Json::as_str)
                .map(|m| format!("condition {ty}: {m}"))
                .unwrap_or_else(|| format!("condition {ty}"));
            return Err(ReadinessError::Failed(msg));
        }
        Ok(is_true && ty == self.condition)
    }
}

/// All desired replicas ready.
#[derive(Debug, Clone, Copy, Default)]
pub struct DeploymentReady;

fn as_deployment(obj: &DynamicObject) -> Result<Deployment, ReadinessError> {
    serde_json::to_value(obj)
        .and_then(serde_json::from_value::<Deployment>)
        .map_err(|e| ReadinessError::Invalid(format!("decoding Deployment: {e}")))
}

impl Readiness for DeploymentReady {
    /// Found once the controller has created at least one replica.
    fn found(&self, obj: &DynamicObject) -> Result<bool, ReadinessError> {
        let d = as_deployment(obj)?;
        Ok(d.status.and_then(|s| s.replicas).unwrap_or(0) > 0)
    }

    fn ready(&self, obj: &DynamicObject) -> Result<bool, ReadinessError> {
        let d = as_deployment(obj)?;
        let desired = d
            .spec
            .and_then(|s| s.replicas)
            .ok_or_else(|| ReadinessError::Invalid("spec.replicas is not set".into()))?;
        let ready = d.status.and_then(|s| s.ready_replicas).unwrap_or(0);
        Ok(ready == desired)
    }
}

/// Workflow run state, accepting the upstream `STATE_` spelling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkflowState {
    Pending,
    Running,
    Success,
    Failed,
    Timeout,
}

impl WorkflowState {
    pub fn parse(s: &str) -> Option<Self> {
        let s = s.strip_prefix("STATE_").unwrap_or(s);
        match s.to_ascii_uppercase().as_str() {
            "PENDING" => Some(Self::Pending),
            "RUNNING" => Some(Self::Running),
            "SUCCESS" => Some(Self::Success),
            "FAILED" => Some(Self::Failed),
            "TIMEOUT" => Some(Self::Timeout),
            _ => None,
        }
    }

    pub fn of(obj: &DynamicObject) -> Option<Self> {
        obj.data.pointer("/status/state").and_then(Json::as_str).and_then(Self::parse)
    }
}

/// Ready on Success; Failed and Timeout are terminal failures.
#[derive(Debug, Clone, Copy, Default)]
pub struct WorkflowFinished;

impl Readiness for WorkflowFinished {
    fn ready(&self, obj: &DynamicObject) -> Result<bool, ReadinessError> {
        match WorkflowState::of(obj) {
            Some(WorkflowState::Success) => Ok(true),
            Some(state @ (WorkflowState::Failed | WorkflowState::Timeout)) => {
                let task = obj
                    .data
                    .pointer("/status/tasks")
                    .and_then(Json::as_array)
                    .and_then(|t| t.first())
                    .and_then(|t| t.get("name"))
                    .and_then(Json::as_str);
                Err(ReadinessError::Failed(match task {
                    Some(t) => format!("workflow state {state:?} (task {t})"),
                    None => format!("workflow state {state:?}"),
                }))
            }
            _ => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn obj(status: Json) -> DynamicObject {
        serde_json::from_value(json!({
            "apiVersion": "bmc.tinkerbell.org/v1alpha1",
            "kind": "Job",
            "metadata": { "name": "x", "namespace": "tink-system" },
            "status": status
        }))
        .unwrap()
    }

    #[test]
    fn empty_conditions_are_not_ready() {
        assert_eq!(LastCondition::COMPLETED.ready(&obj(json!({}))), Ok(false));
        assert_eq!(LastCondition::COMPLETED.ready(&obj(json!({"conditions": []}))), Ok(false));
    }

    #[test]
    fn last_condition_decides() {
        let done = obj(json!({"conditions": [
            {"type": "Running", "status": "True"},
            {"type": "Completed", "status": "True"}
        ]}));
        assert_eq!(LastCondition::COMPLETED.ready(&done), Ok(true));

        let stale = obj(json!({"conditions": [
            {"type": "Completed", "status": "True"},
            {"type": "Running", "status": "True"}
        ]}));
        assert_eq!(LastCondition::COMPLETED.ready(&stale), Ok(false));

        let not_true = obj(json!({"conditions": [{"type": "Completed", "status": "False"}]}));
        assert_eq!(LastCondition::COMPLETED.ready(&not_true), Ok(false));

        let machine = obj(json!({"conditions": [{"type": "Contactable", "status": "true"}]}));
        assert_eq!(LastCondition::CONTACTABLE.ready(&machine), Ok(true));
    }

    #[test]
    fn failed_job_is_terminal() {
        let failed = obj(json!({"conditions": [{"type": "Failed", "status": "True"}], "message": "bmc unreachable"}));
        let err = LastCondition::COMPLETED.ready(&failed).unwrap_err();
        assert_eq!(err, ReadinessError::Failed("condition Failed: bmc unreachable".into()));
        // machines have no failure condition
        assert_eq!(LastCondition::CONTACTABLE.ready(&failed), Ok(false));
    }

    fn deployment(spec_replicas: Option<i32>, status: Json) -> DynamicObject {
        let mut spec = json!({
            "selector": {"matchLabels": {"app": "tink"}},
            "template": {"metadata": {"labels": {"app": "tink"}}}
        });
        if let Some(r) = spec_replicas {
            spec["replicas"] = json!(r);
        }
        serde_json::from_value(json!({
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "metadata": {"name": "tink-server", "namespace": "tink-system"},
            "spec": spec,
            "status": status
        }))
        .unwrap()
    }

    #[test]
    fn deployment_found_needs_a_replica() {
        assert_eq!(DeploymentReady.found(&deployment(Some(2), json!({}))), Ok(false));
        assert_eq!(DeploymentReady.found(&deployment(Some(2), json!({"replicas": 2}))), Ok(true));
    }

    #[test]
    fn deployment_ready_compares_ready_to_desired() {
        assert_eq!(DeploymentReady.ready(&deployment(Some(2), json!({"replicas": 2, "readyReplicas": 1}))), Ok(false));
        assert_eq!(DeploymentReady.ready(&deployment(Some(2), json!({"replicas": 2, "readyReplicas": 2}))), Ok(true));
        let err = DeploymentReady.ready(&deployment(None, json!({"replicas": 1}))).unwrap_err();
        assert!(matches!(err, ReadinessError::Invalid(_)));
    }

    #[test]
    fn workflow_states() {
        assert_eq!(WorkflowState::parse("STATE_RUNNING"), Some(WorkflowState::Running));
        assert_eq!(WorkflowState::parse("Success"), Some(WorkflowState::Success));
        assert_eq!(WorkflowState::parse("bogus"), None);

        assert_eq!(WorkflowFinished.ready(&obj(json!({}))), Ok(false));
        assert_eq!(WorkflowFinished.ready(&obj(json!({"state": "STATE_PENDING"}))), Ok(false));
        assert_eq!(WorkflowFinished.ready(&obj(json!({"state": "STATE_SUCCESS"}))), Ok(true));
        let err = WorkflowFinished
            .ready(&obj(json!({"state": "STATE_FAILED", "tasks": [{"name": "os-installation"}]})))
            .unwrap_err();
        assert_eq!(err, ReadinessError::Failed("workflow state Failed (task os-installation)".into()));
        assert!(WorkflowFinished.ready(&obj(json!({"state": "TIMEOUT"}))).is_err());
    }
}
