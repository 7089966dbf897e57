use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;

use inferq_ai::{AiError, AiInvoker, AiResult, AnalysisRequest};

/// Posts each [`AnalysisRequest`] as JSON to `{endpoint}/{dependency}` and
/// expects an [`AiResult`] back.
///
/// Error statuses are mapped onto [`AiError`] variants; retry
/// classification reads the variant, not the message.
#[derive(Debug, Clone)]
pub struct HttpInvoker {
    client: reqwest::Client,
    endpoint: String,
    timeout: Duration,
}

impl HttpInvoker {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            timeout,
        })
    }

    fn url(&self, dependency: &str) -> String {
        format!("{}/{}", self.endpoint, dependency)
    }

    fn transport_error(&self, err: reqwest::Error) -> AiError {
        if err.is_timeout() {
            AiError::Timeout {
                after_ms: self.timeout.as_millis() as u64,
            }
        } else {
            AiError::Network(err.to_string())
        }
    }
}

#[async_trait]
impl AiInvoker for HttpInvoker {
    async fn invoke(&self, dependency: &str, request: &AnalysisRequest) -> Result<AiResult, AiError> {
        let response = self
            .client
            .post(self.url(dependency))
            .json(request)
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;

        let status = response.status();
        if status.is_success() {
            return response
                .json::<AiResult>()
                .await
                .map_err(|e| AiError::Api(format!("unreadable response body: {e}")));
        }

        let body = response.text().await.unwrap_or_default();
        Err(status_error(status, body, self.timeout))
    }
}

fn status_error(status: StatusCode, body: String, timeout: Duration) -> AiError {
    let detail = if body.is_empty() {
        status.to_string()
    } else {
        body
    };

    match status {
        StatusCode::TOO_MANY_REQUESTS => AiError::RateLimited(detail),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => AiError::Authentication(detail),
        StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY => AiError::InvalidInput(detail),
        StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => AiError::Timeout {
            after_ms: timeout.as_millis() as u64,
        },
        _ => AiError::Api(format!("{status}: {detail}")),
    }
}
