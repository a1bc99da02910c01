use std::time::Duration;

use async_trait::async_trait;
use garde::Validate;
use reqwest::{Client, StatusCode};
use serde::Serialize;

use crate::models::prediction::{ErrorKind, PredictionError, PredictionPayload};

/// Capability that produces a prediction for one scan.
///
/// Implementations may suspend on the network but must keep no cross-call
/// state that would make two calls for the same scan behave differently.
#[async_trait]
pub trait PredictionClient: Send + Sync {
    async fn predict(&self, scan_id: &str) -> Result<PredictionPayload, PredictionError>;
}

/// Client for the HTTP inference endpoint.
pub struct HttpPredictionClient {
    http: Client,
    predict_url: String,
    api_token: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PredictRequest<'a> {
    scan_id: &'a str,
}

impl HttpPredictionClient {
    pub fn new(
        base_url: &str,
        api_token: Option<String>,
        timeout: Duration,
    ) -> Result<Self, ClientError> {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(ClientError::Build)?;

        Ok(Self {
            http,
            predict_url: format!("{}/predict", base_url.trim_end_matches('/')),
            api_token,
        })
    }
}

#[async_trait]
impl PredictionClient for HttpPredictionClient {
    async fn predict(&self, scan_id: &str) -> Result<PredictionPayload, PredictionError> {
        let mut request = self
            .http
            .post(&self.predict_url)
            .json(&PredictRequest { scan_id });
        if let Some(token) = &self.api_token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await.map_err(transport_error)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(PredictionError::new(
                classify_status(status),
                format!("inference service returned {status}: {}", body.trim()),
            ));
        }

        let payload: PredictionPayload = response.json().await.map_err(|e| {
            PredictionError::new(ErrorKind::InvalidResponse, format!("undecodable body: {e}"))
        })?;

        payload.validate().map_err(|e| {
            PredictionError::new(ErrorKind::InvalidResponse, format!("invalid prediction: {e}"))
        })?;

        Ok(payload)
    }
}

/// Map a non-2xx status onto the failure taxonomy.
pub fn classify_status(status: StatusCode) -> ErrorKind {
    match status {
        StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => ErrorKind::Timeout,
        StatusCode::TOO_MANY_REQUESTS => ErrorKind::RateLimited,
        StatusCode::BAD_REQUEST => ErrorKind::MalformedInput,
        StatusCode::UNSUPPORTED_MEDIA_TYPE => ErrorKind::UnsupportedFormat,
        StatusCode::UNPROCESSABLE_ENTITY => ErrorKind::Unprocessable,
        s if s.is_server_error() => ErrorKind::ServerError,
        _ => ErrorKind::Rejected,
    }
}

fn transport_error(err: reqwest::Error) -> PredictionError {
    let kind = if err.is_timeout() {
        ErrorKind::Timeout
    } else {
        ErrorKind::Connection
    };
    PredictionError::new(kind, err.to_string())
}

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("Failed to build HTTP client: {0}")]
    Build(#[from] reqwest::Error),
}
