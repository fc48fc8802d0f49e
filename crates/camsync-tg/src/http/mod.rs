mod basic_ext;
mod json_ext;

use crate::prelude::*;
use async_trait::async_trait;
use reqwest_retry::policies::ExponentialBackoff;
use reqwest_retry::RetryTransientMiddleware;
use std::time::{Duration, Instant};
use task_local_extensions::Extensions;

pub(crate) mod prelude {
    pub(crate) use super::basic_ext::RequestBuilderBasicExt;
    pub(crate) use super::json_ext::RequestBuilderJsonExt;
}

pub type Client = reqwest_middleware::ClientWithMiddleware;

fn retry_policy() -> ExponentialBackoff {
    ExponentialBackoff::builder()
        .retry_bounds(Duration::from_millis(200), Duration::from_secs(5))
        .build_with_max_retries(4)
}

/// Retries transient failures. Only for requests that are safe to repeat.
pub(crate) fn create_client() -> Client {
    build_client(Some(retry_policy()))
}

/// Sends every request exactly once. Requests that aren't idempotent (album
/// creation) or too expensive to repeat blindly (multi-gigabyte downloads)
/// go through this one.
pub(crate) fn create_single_attempt_client() -> Client {
    build_client(None)
}

fn build_client(retry_policy: Option<ExponentialBackoff>) -> Client {
    // No total request timeout here. Downloads of large files may take hours,
    // so the callers put their own deadlines.
    let client = reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(10))
        .user_agent(concat!("camsync-tg/", env!("CARGO_PKG_VERSION")))
        .build()
        .unwrap_or_else(|err| panic!("BUG: failed to create HTTP client: {err:#?}"));

    // Sees the request once, with all the retries inside
    let mut builder = reqwest_middleware::ClientBuilder::new(client).with(ObservingMiddleware {
        histogram: "http_request_total_duration_seconds",
        attempt: false,
    });

    if let Some(policy) = retry_policy {
        builder = builder.with(RetryTransientMiddleware::new_with_policy(policy));
    }

    builder
        // Sees every attempt
        .with(ObservingMiddleware {
            histogram: "http_request_attempt_duration_seconds",
            attempt: true,
        })
        .build()
}

struct ObservingMiddleware {
    histogram: &'static str,

    /// Attempts are logged individually, while the outer layer only opens
    /// the span for them
    attempt: bool,
}

#[async_trait]
impl reqwest_middleware::Middleware for ObservingMiddleware {
    async fn handle(
        &self,
        request: reqwest::Request,
        extensions: &mut Extensions,
        next: reqwest_middleware::Next<'_>,
    ) -> reqwest_middleware::Result<reqwest::Response> {
        if !self.attempt {
            let span = info_span!(
                "http",
                method = %request.method(),
                host = request.url().host_str().unwrap_or_default(),
                path = request.url().path(),
            );
            return self
                .measure(request, extensions, next)
                .instrument(span)
                .await;
        }

        let start = Instant::now();
        let result = self.measure(request, extensions, next).await;
        let duration = tracing_duration(start.elapsed());

        match &result {
            Ok(response) if response.status().is_success() => {
                debug!(duration, status = %response.status(), "HTTP request succeeded");
            }
            Ok(response) => {
                warn!(duration, status = %response.status(), "HTTP request returned an error status");
            }
            Err(err) => {
                warn!(duration, err = tracing_err(err), "HTTP request failed");
            }
        }

        result
    }
}

impl ObservingMiddleware {
    /// Durations are labeled with the method, host and response status
    async fn measure(
        &self,
        request: reqwest::Request,
        extensions: &mut Extensions,
        next: reqwest_middleware::Next<'_>,
    ) -> reqwest_middleware::Result<reqwest::Response> {
        let method = request.method().to_string();
        let host = request.url().host_str().unwrap_or("unknown").to_owned();

        let start = Instant::now();
        let result = next.run(request, extensions).await;
        let elapsed = start.elapsed();

        let status = match &result {
            Ok(response) => response.status().as_str().to_owned(),
            Err(_) => "network_error".to_owned(),
        };

        metrics::histogram!(
            self.histogram,
            elapsed.as_secs_f64(),
            "method" => method,
            "host" => host,
            "status" => status,
        );

        result
    }
}

/// Errors at the layer of the HTTP API
#[derive(Debug, thiserror::Error)]
pub(crate) enum HttpClientError {
    #[error("HTTP request failed")]
    Request { source: reqwest_middleware::Error },

    #[error("Failed to read HTTP response")]
    ReadPayload { source: reqwest::Error },

    #[error("HTTP request has failed (HTTP status code: {status}):\n{body}")]
    BadResponseStatusCode {
        status: reqwest::StatusCode,
        body: String,
    },

    #[error("Received an unexpected response JSON object")]
    UnexpectedResponseJsonShape { source: serde_json::Error },
}
