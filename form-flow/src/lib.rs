pub mod answers;
pub mod api;
pub mod config;
pub mod controller;
pub mod error;
#[cfg(feature = "http")]
pub mod http;
pub mod plan;
pub mod postgres;
pub mod resume;
pub mod storage;

// Re-export commonly used types
pub use answers::{StepAnswers, is_structurally_empty, merge_prefill};
pub use api::{
    ApiEnvelope, ApiOperation, ApiResponse, ApplicationApi, InMemoryApplicationApi, PauseHandle,
    ScriptedFailure, extract_draft_id,
};
pub use config::{ApiConfig, FlowConfig};
pub use controller::{DraftStatus, FlowController, FlowProgress, StepOutcome, SubmitOptions};
pub use error::{ApiError, FlowError, Result};
#[cfg(feature = "http")]
pub use http::HttpApplicationApi;
pub use plan::{StepPlan, StepPlanBuilder};
pub use postgres::PostgresFlowStorage;
pub use storage::{
    FlowSnapshot, FlowStorage, InMemoryFlowStorage, JsonFileFlowStorage, StorageKeys,
};
