use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;

use super::breaker::{BreakerConfig, CircuitBreaker};
use super::retry::{with_retry, RetryConfig};
use super::{PortfolioRecord, PortfolioSource, SecurityRecord, SecuritySource};
use crate::error::{Error, Result};

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

fn classify_reqwest(service: &str, err: reqwest::Error) -> Error {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        Error::TransientIo(format!("{service}: {err}"))
    } else if err.is_decode() {
        Error::Internal(format!("{service} returned an undecodable body: {err}"))
    } else {
        Error::TransientIo(format!("{service}: {err}"))
    }
}

async fn fetch_json<T: DeserializeOwned>(
    client: &reqwest::Client,
    service: &str,
    url: String,
    key: &str,
) -> Result<T> {
    let response = client
        .get(&url)
        .send()
        .await
        .map_err(|e| classify_reqwest(service, e))?;

    let status = response.status();
    if status == reqwest::StatusCode::NOT_FOUND {
        return Err(Error::NotFound {
            entity: "reference record",
            key: key.to_string(),
        });
    }
    if status == reqwest::StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        return Err(Error::TransientIo(format!("{service} answered {status}")));
    }
    if !status.is_success() {
        return Err(Error::Internal(format!("{service} answered {status}")));
    }

    response
        .json::<T>()
        .await
        .map_err(|e| classify_reqwest(service, e))
}

/// HTTP client for the portfolio service, wrapped retry -> breaker -> GET.
pub struct PortfolioServiceClient {
    client: reqwest::Client,
    base_url: String,
    retry: RetryConfig,
    breaker: CircuitBreaker,
}

impl PortfolioServiceClient {
    pub fn new(base_url: String, retry: RetryConfig, breaker: BreakerConfig) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(DEFAULT_REQUEST_TIMEOUT)
                .build()
                .unwrap_or_default(),
            base_url,
            retry,
            breaker: CircuitBreaker::new("portfolio-service", breaker),
        }
    }
}

#[async_trait]
impl PortfolioSource for PortfolioServiceClient {
    async fn get_portfolio(&self, portfolio_id: &str) -> Result<PortfolioRecord> {
        with_retry(&self.retry, "portfolio-service", || {
            self.breaker.call(|| {
                fetch_json::<PortfolioRecord>(
                    &self.client,
                    "portfolio-service",
                    format!("{}/api/v1/portfolio/{portfolio_id}", self.base_url),
                    portfolio_id,
                )
            })
        })
        .await
        .map_err(|err| match err {
            // Re-key the generic 404 onto the entity the caller asked about.
            Error::NotFound { key, .. } => Error::NotFound {
                entity: "portfolio",
                key,
            },
            other => other,
        })
    }
}

/// HTTP client for the security service, wrapped retry -> breaker -> GET.
pub struct SecurityServiceClient {
    client: reqwest::Client,
    base_url: String,
    retry: RetryConfig,
    breaker: CircuitBreaker,
}

impl SecurityServiceClient {
    pub fn new(base_url: String, retry: RetryConfig, breaker: BreakerConfig) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(DEFAULT_REQUEST_TIMEOUT)
                .build()
                .unwrap_or_default(),
            base_url,
            retry,
            breaker: CircuitBreaker::new("security-service", breaker),
        }
    }
}

#[async_trait]
impl SecuritySource for SecurityServiceClient {
    async fn get_security(&self, security_id: &str) -> Result<SecurityRecord> {
        with_retry(&self.retry, "security-service", || {
            self.breaker.call(|| {
                fetch_json::<SecurityRecord>(
                    &self.client,
                    "security-service",
                    format!("{}/api/v1/security/{security_id}", self.base_url),
                    security_id,
                )
            })
        })
        .await
        .map_err(|err| match err {
            Error::NotFound { key, .. } => Error::NotFound {
                entity: "security",
                key,
            },
            other => other,
        })
    }
}
