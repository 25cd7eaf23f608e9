use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::oneshot;

use crate::error::ApiError;

/// Field names a create response may carry the draft id under.
const DRAFT_ID_FIELDS: &[&str] = &["id", "_id", "applicationId", "application_id", "draftId"];
/// Wrapper objects some responses nest the draft under.
const DRAFT_ID_CONTAINERS: &[&str] = &["application", "data"];

/// `{ success, message, data? }` envelope returned by every Application API call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiEnvelope<T = Value> {
    pub success: bool,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub data: Option<T>,
}

impl<T> ApiEnvelope<T> {
    pub fn ok(message: impl Into<String>, data: T) -> Self {
        Self {
            success: true,
            message: message.into(),
            data: Some(data),
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            data: None,
        }
    }
}

pub type ApiResponse = std::result::Result<ApiEnvelope<Value>, ApiError>;

/// Collapses transport errors and `success: false` into one failure message;
/// on success yields the envelope data.
pub fn into_outcome(response: ApiResponse) -> std::result::Result<Option<Value>, String> {
    match response {
        Ok(envelope) if envelope.success => Ok(envelope.data),
        Ok(envelope) if envelope.message.trim().is_empty() => {
            Err("request was rejected by the server".to_string())
        }
        Ok(envelope) => Err(envelope.message),
        Err(e) => Err(e.to_string()),
    }
}

/// Pulls the server-issued draft id out of a create response.
pub fn extract_draft_id(data: &Value) -> Option<String> {
    let direct = DRAFT_ID_FIELDS
        .iter()
        .find_map(|field| data.get(field).and_then(id_from_value));
    direct.or_else(|| {
        DRAFT_ID_CONTAINERS.iter().find_map(|container| {
            let nested = data.get(container)?;
            DRAFT_ID_FIELDS
                .iter()
                .find_map(|field| nested.get(field).and_then(id_from_value))
        })
    })
}

fn id_from_value(value: &Value) -> Option<String> {
    match value {
        Value::String(id) if !id.trim().is_empty() => Some(id.trim().to_string()),
        Value::Number(id) => Some(id.to_string()),
        _ => None,
    }
}

/// Remote operations the flow controller depends on.
#[async_trait]
pub trait ApplicationApi: Send + Sync {
    async fn create_draft(&self, payload: &Value) -> ApiResponse;
    async fn update_step(&self, draft_id: &str, step: u32, payload: &Value) -> ApiResponse;
    async fn submit(&self, draft_id: &str) -> ApiResponse;
    async fn get_by_id(&self, draft_id: &str) -> ApiResponse;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ApiOperation {
    CreateDraft,
    UpdateStep,
    Submit,
    GetById,
}

/// One-shot failure injected into the next call of an operation.
#[derive(Debug, Clone, PartialEq)]
pub enum ScriptedFailure {
    /// The call fails before reaching the server.
    Transport(String),
    /// The server answers `success: false` with this message.
    Rejected(String),
}

/// Releases a call held back by [`InMemoryApplicationApi::pause_next`].
pub struct PauseHandle {
    release: oneshot::Sender<()>,
}

impl PauseHandle {
    pub fn release(self) {
        let _ = self.release.send(());
    }
}

/// In-memory Application API that records drafts and call counts.
///
/// Used by tests and the demo binary in place of the HTTP backend.
pub struct InMemoryApplicationApi {
    drafts: DashMap<String, Value>,
    calls: DashMap<ApiOperation, usize>,
    failures: DashMap<ApiOperation, ScriptedFailure>,
    paused: DashMap<ApiOperation, oneshot::Receiver<()>>,
    next_id: AtomicU64,
}

impl InMemoryApplicationApi {
    pub fn new() -> Self {
        Self {
            drafts: DashMap::new(),
            calls: DashMap::new(),
            failures: DashMap::new(),
            paused: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn call_count(&self, operation: ApiOperation) -> usize {
        self.calls.get(&operation).map(|count| *count).unwrap_or(0)
    }

    pub fn fail_next(&self, operation: ApiOperation, failure: ScriptedFailure) {
        self.failures.insert(operation, failure);
    }

    /// Holds the next call of `operation` until the returned handle is released.
    pub fn pause_next(&self, operation: ApiOperation) -> PauseHandle {
        let (release, hold) = oneshot::channel();
        self.paused.insert(operation, hold);
        PauseHandle { release }
    }

    pub fn draft(&self, draft_id: &str) -> Option<Value> {
        self.drafts.get(draft_id).map(|entry| entry.clone())
    }

    pub fn draft_count(&self) -> usize {
        self.drafts.len()
    }

    async fn begin(&self, operation: ApiOperation) -> Option<ApiResponse> {
        *self.calls.entry(operation).or_insert(0) += 1;
        if let Some((_, hold)) = self.paused.remove(&operation) {
            let _ = hold.await;
        }
        self.failures
            .remove(&operation)
            .map(|(_, failure)| match failure {
                ScriptedFailure::Transport(message) => Err(ApiError::Transport(message)),
                ScriptedFailure::Rejected(message) => Ok(ApiEnvelope::failure(message)),
            })
    }

    fn not_found(draft_id: &str) -> ApiResponse {
        Ok(ApiEnvelope::failure(format!("Application {draft_id} not found")))
    }
}

impl Default for InMemoryApplicationApi {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ApplicationApi for InMemoryApplicationApi {
    async fn create_draft(&self, payload: &Value) -> ApiResponse {
        if let Some(scripted) = self.begin(ApiOperation::CreateDraft).await {
            return scripted;
        }
        let number = self.next_id.fetch_add(1, Ordering::SeqCst);
        let draft_id = format!("APP-{number:04}");
        let record = json!({
            "_id": draft_id,
            "status": "draft",
            "initial": payload,
            "steps": {},
        });
        self.drafts.insert(draft_id, record.clone());
        Ok(ApiEnvelope::ok("Application draft created", record))
    }

    async fn update_step(&self, draft_id: &str, step: u32, payload: &Value) -> ApiResponse {
        if let Some(scripted) = self.begin(ApiOperation::UpdateStep).await {
            return scripted;
        }
        let Some(mut record) = self.drafts.get_mut(draft_id) else {
            return Self::not_found(draft_id);
        };
        record["steps"][step.to_string()] = payload.clone();
        Ok(ApiEnvelope::ok(
            format!("Step {step} saved"),
            json!({ "_id": draft_id, "step": step }),
        ))
    }

    async fn submit(&self, draft_id: &str) -> ApiResponse {
        if let Some(scripted) = self.begin(ApiOperation::Submit).await {
            return scripted;
        }
        let Some(mut record) = self.drafts.get_mut(draft_id) else {
            return Self::not_found(draft_id);
        };
        record["status"] = json!("submitted");
        Ok(ApiEnvelope::ok("Application submitted", record.clone()))
    }

    async fn get_by_id(&self, draft_id: &str) -> ApiResponse {
        if let Some(scripted) = self.begin(ApiOperation::GetById).await {
            return scripted;
        }
        match self.drafts.get(draft_id) {
            Some(record) => Ok(ApiEnvelope::ok("Application found", record.clone())),
            None => Self::not_found(draft_id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_id_from_common_shapes() {
        assert_eq!(extract_draft_id(&json!({ "id": "A1" })), Some("A1".into()));
        assert_eq!(extract_draft_id(&json!({ "_id": "A2" })), Some("A2".into()));
        assert_eq!(
            extract_draft_id(&json!({ "applicationId": 42 })),
            Some("42".into())
        );
        assert_eq!(
            extract_draft_id(&json!({ "application": { "_id": "A3" } })),
            Some("A3".into())
        );
        assert_eq!(
            extract_draft_id(&json!({ "data": { "application_id": "A4" } })),
            Some("A4".into())
        );
    }

    #[test]
    fn rejects_missing_or_blank_ids() {
        assert_eq!(extract_draft_id(&json!({})), None);
        assert_eq!(extract_draft_id(&json!({ "id": "  " })), None);
        assert_eq!(extract_draft_id(&json!({ "id": null, "_id": "B1" })), Some("B1".into()));
        assert_eq!(extract_draft_id(&json!("A1")), None);
    }

    #[test]
    fn outcome_treats_rejection_as_failure() {
        assert_eq!(
            into_outcome(Ok(ApiEnvelope::failure("Email already used"))),
            Err("Email already used".to_string())
        );
        assert!(into_outcome(Ok(ApiEnvelope::failure(""))).is_err());
        assert_eq!(
            into_outcome(Err(ApiError::Transport("connection refused".into()))),
            Err("request failed: connection refused".to_string())
        );
        assert_eq!(
            into_outcome(Ok(ApiEnvelope::ok("ok", json!({ "id": 1 })))),
            Ok(Some(json!({ "id": 1 })))
        );
    }

    #[test]
    fn envelope_tolerates_missing_fields() {
        let envelope: ApiEnvelope = serde_json::from_str(r#"{ "success": true }"#).unwrap();
        assert!(envelope.success);
        assert!(envelope.message.is_empty());
        assert!(envelope.data.is_none());
    }

    #[tokio::test]
    async fn in_memory_api_records_steps() {
        let api = InMemoryApplicationApi::new();
        let created = api.create_draft(&json!({ "name": "Ann" })).await.unwrap();
        let draft_id = extract_draft_id(created.data.as_ref().unwrap()).unwrap();

        api.update_step(&draft_id, 2, &json!({ "course": "MBA" }))
            .await
            .unwrap();
        let record = api.draft(&draft_id).unwrap();
        assert_eq!(record["steps"]["2"]["course"], "MBA");
        assert_eq!(api.call_count(ApiOperation::CreateDraft), 1);
        assert_eq!(api.call_count(ApiOperation::UpdateStep), 1);

        let missing = api.update_step("APP-9999", 1, &json!({})).await.unwrap();
        assert!(!missing.success);
    }

    #[tokio::test]
    async fn scripted_failures_fire_once() {
        let api = InMemoryApplicationApi::new();
        api.fail_next(
            ApiOperation::CreateDraft,
            ScriptedFailure::Rejected("Agent account suspended".into()),
        );
        let first = api.create_draft(&json!({})).await.unwrap();
        assert!(!first.success);
        assert_eq!(first.message, "Agent account suspended");

        let second = api.create_draft(&json!({})).await.unwrap();
        assert!(second.success);
        assert_eq!(api.draft_count(), 1);
    }
}
