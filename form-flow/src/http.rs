//! reqwest-backed [`ApplicationApi`] talking JSON to the application backend.

use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder, header};
use serde_json::{Value, json};
use tracing::debug;
use url::Url;

use crate::{
    api::{ApiEnvelope, ApiResponse, ApplicationApi},
    config::ApiConfig,
    error::{ApiError, FlowError, Result},
};

#[derive(Debug, Clone)]
pub struct HttpApplicationApi {
    base_url: Url,
    http: Client,
}

impl HttpApplicationApi {
    pub fn new(config: &ApiConfig) -> Result<Self> {
        let base_url = parse_base_url(&config.base_url)?;

        let mut default_headers = header::HeaderMap::new();
        default_headers.insert(
            header::ACCEPT,
            header::HeaderValue::from_static("application/json"),
        );
        if let Some(token) = &config.bearer_token {
            let value = header::HeaderValue::from_str(&format!("Bearer {token}"))
                .map_err(|e| FlowError::Config(format!("invalid API token: {e}")))?;
            default_headers.insert(header::AUTHORIZATION, value);
        }

        let http = Client::builder()
            .default_headers(default_headers)
            .timeout(config.timeout)
            .build()
            .map_err(|e| FlowError::Config(format!("failed to build HTTP client: {e}")))?;

        Ok(Self { base_url, http })
    }

    fn request(
        &self,
        method: Method,
        segments: &[&str],
    ) -> std::result::Result<RequestBuilder, ApiError> {
        let url = endpoint(&self.base_url, segments)?;
        debug!(%url, %method, "application api request");
        Ok(self.http.request(method, url))
    }

    async fn send(&self, request: RequestBuilder) -> ApiResponse {
        let response = request
            .send()
            .await
            .map_err(|e| ApiError::Transport(e.to_string()))?;
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| ApiError::Transport(e.to_string()))?;

        match serde_json::from_str::<ApiEnvelope>(&body) {
            Ok(envelope) => Ok(envelope),
            Err(_) if !status.is_success() => Err(ApiError::UnexpectedResponse {
                status: status.as_u16(),
                body,
            }),
            Err(e) => Err(ApiError::Decode(e.to_string())),
        }
    }
}

/// Base URLs must be absolute http(s); a trailing `/` is added so the path
/// prefix survives.
fn parse_base_url(raw: &str) -> Result<Url> {
    let mut normalized = raw.trim().to_string();
    if !normalized.ends_with('/') {
        normalized.push('/');
    }
    let url = Url::parse(&normalized)
        .map_err(|e| FlowError::Config(format!("invalid API base URL '{raw}': {e}")))?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        scheme => Err(FlowError::Config(format!(
            "API base URL must use http or https, got '{scheme}'"
        ))),
    }
}

/// Appends percent-encoded path segments to the base URL.
fn endpoint(base_url: &Url, segments: &[&str]) -> std::result::Result<Url, ApiError> {
    let mut url = base_url.clone();
    url.path_segments_mut()
        .map_err(|_| ApiError::Transport(format!("{base_url} cannot be a base URL")))?
        .pop_if_empty()
        .extend(segments);
    Ok(url)
}

#[async_trait]
impl ApplicationApi for HttpApplicationApi {
    async fn create_draft(&self, payload: &Value) -> ApiResponse {
        let request = self.request(Method::POST, &["applications"])?.json(payload);
        self.send(request).await
    }

    async fn update_step(&self, draft_id: &str, step: u32, payload: &Value) -> ApiResponse {
        let step = step.to_string();
        let request = self
            .request(Method::PUT, &["applications", draft_id, "steps", &step])?
            .json(payload);
        self.send(request).await
    }

    async fn submit(&self, draft_id: &str) -> ApiResponse {
        let request = self
            .request(Method::POST, &["applications", draft_id, "submit"])?
            .json(&json!({}));
        self.send(request).await
    }

    async fn get_by_id(&self, draft_id: &str) -> ApiResponse {
        let request = self.request(Method::GET, &["applications", draft_id])?;
        self.send(request).await
    }
}
