use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::{FlowError, Result};

pub const DEFAULT_TOTAL_STEPS: u32 = 8;
pub const DEFAULT_NAMESPACE: &str = "application_form";
pub const DEFAULT_QUERY_PARAM: &str = "applicationId";
pub const DEFAULT_API_TIMEOUT_SECS: u64 = 30;

/// Shape of a multi-step form and where its state is kept.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FlowConfig {
    /// Number of the last step. Steps run `first_step..=total_steps`.
    pub total_steps: u32,
    /// 1 for the usual layout, 0 when a separate review step comes first.
    pub first_step: u32,
    /// Steps that do not gate navigation to later steps.
    pub optional_steps: Vec<u32>,
    /// Prefix for every persisted key.
    pub storage_namespace: String,
    /// Query parameter carrying a draft id in resume links.
    pub resume_query_param: String,
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            total_steps: DEFAULT_TOTAL_STEPS,
            first_step: 1,
            optional_steps: Vec::new(),
            storage_namespace: DEFAULT_NAMESPACE.to_string(),
            resume_query_param: DEFAULT_QUERY_PARAM.to_string(),
        }
    }
}

impl FlowConfig {
    pub fn with_total_steps(total_steps: u32) -> Self {
        Self {
            total_steps,
            ..Self::default()
        }
    }

    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: FlowConfig =
            serde_yaml::from_str(yaml).map_err(|e| FlowError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub async fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| FlowError::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_yaml_str(&raw)
    }

    /// Reads `FORM_FLOW_*` variables, keeping defaults for unset ones.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        if let Some(total) = env_parse::<u32>("FORM_FLOW_TOTAL_STEPS")? {
            config.total_steps = total;
        }
        if let Some(first) = env_parse::<u32>("FORM_FLOW_FIRST_STEP")? {
            config.first_step = first;
        }
        if let Ok(namespace) = std::env::var("FORM_FLOW_NAMESPACE") {
            config.storage_namespace = namespace;
        }
        if let Ok(param) = std::env::var("FORM_FLOW_QUERY_PARAM") {
            config.resume_query_param = param;
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.total_steps == 0 {
            return Err(FlowError::Config("total_steps must be at least 1".into()));
        }
        if self.first_step > 1 {
            return Err(FlowError::Config(format!(
                "first_step must be 0 or 1, got {}",
                self.first_step
            )));
        }
        if let Some(step) = self
            .optional_steps
            .iter()
            .find(|s| **s < self.first_step || **s > self.total_steps)
        {
            return Err(FlowError::Config(format!(
                "optional step {} is outside {}..={}",
                step, self.first_step, self.total_steps
            )));
        }
        if self.storage_namespace.trim().is_empty() {
            return Err(FlowError::Config("storage_namespace cannot be empty".into()));
        }
        if self.resume_query_param.trim().is_empty() {
            return Err(FlowError::Config("resume_query_param cannot be empty".into()));
        }
        Ok(())
    }
}

/// Connection settings for the HTTP Application API.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiConfig {
    pub base_url: String,
    pub timeout: Duration,
    pub bearer_token: Option<String>,
}

impl ApiConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            timeout: Duration::from_secs(DEFAULT_API_TIMEOUT_SECS),
            bearer_token: None,
        }
    }

    pub fn from_env() -> Result<Self> {
        let base_url = std::env::var("APPLICATION_API_BASE")
            .map_err(|_| FlowError::Config("APPLICATION_API_BASE must be set".into()))?;
        Self::from_env_with_base(base_url)
    }

    /// Timeout and token from the environment, base URL from the caller.
    pub fn from_env_with_base(base_url: impl Into<String>) -> Result<Self> {
        let base_url = base_url.into();
        let timeout_secs =
            env_parse::<u64>("APPLICATION_API_TIMEOUT_SECS")?.unwrap_or(DEFAULT_API_TIMEOUT_SECS);
        Ok(Self {
            base_url,
            timeout: Duration::from_secs(timeout_secs),
            bearer_token: std::env::var("APPLICATION_API_TOKEN")
                .ok()
                .filter(|t| !t.trim().is_empty()),
        })
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Result<Option<T>>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| FlowError::Config(format!("{name}: {e}"))),
        Err(_) => Ok(None),
    }
}
