use thiserror::Error;

/// Errors surfaced by the flow controller and its collaborators.
///
/// Every variant carries a human-readable message; the controller never
/// swallows a failure and stays usable after returning one.
#[derive(Error, Debug)]
pub enum FlowError {
    #[error("Draft creation failed: {0}")]
    DraftCreationFailed(String),

    #[error("Submitting step {step} failed: {message}")]
    StepSubmissionFailed { step: u32, message: String },

    #[error("Step {target} is not accessible until steps {missing:?} are completed")]
    NavigationBlocked { target: u32, missing: Vec<u32> },

    #[error("No application draft available: {0}")]
    MissingDraftReference(String),

    #[error("Application is incomplete; steps {missing:?} still need to be submitted")]
    IncompleteApplication { missing: Vec<u32> },

    #[error("Step {0} is not part of this form")]
    UnknownStep(u32),

    #[error("Application submission failed: {0}")]
    ApplicationSubmissionFailed(String),

    #[error("Fetching application failed: {0}")]
    FetchFailed(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl FlowError {
    /// Whether re-invoking the same operation may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            FlowError::DraftCreationFailed(_)
                | FlowError::StepSubmissionFailed { .. }
                | FlowError::MissingDraftReference(_)
                | FlowError::ApplicationSubmissionFailed(_)
                | FlowError::FetchFailed(_)
                | FlowError::Storage(_)
        )
    }
}

/// Transport-level failure talking to the Application API.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ApiError {
    #[error("request failed: {0}")]
    Transport(String),

    #[error("unexpected response ({status}): {body}")]
    UnexpectedResponse { status: u16, body: String },

    #[error("invalid response body: {0}")]
    Decode(String),
}

pub type Result<T> = std::result::Result<T, FlowError>;
