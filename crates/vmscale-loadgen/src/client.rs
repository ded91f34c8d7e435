//! Load generator control surface.
//!
//! Every control call is retried with a fixed delay until it succeeds,
//! because the load generator (and the targets it checks) may still be
//! booting when the controller first reaches out. Callers bound the loop
//! with a stop predicate.

use std::time::Duration;

use tracing::info;

use vmscale_core::{RetryError, RetryPolicy, retry_until};

use crate::rpc::{RpcError, http_get};

#[derive(Debug, Clone)]
pub struct LoadGenClient {
    /// Load generator address (DNS name or `host:port`).
    address: String,
    timeout: Duration,
    retry: RetryPolicy,
}

impl LoadGenClient {
    pub fn new(address: impl Into<String>, timeout: Duration, retry: RetryPolicy) -> Self {
        Self {
            address: address.into(),
            timeout,
            retry,
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// `GET /test/horizontal?dns=<ws>`: start a test against one web service.
    pub async fn start_horizontal<S>(
        &self,
        web_service_dns: &str,
        should_stop: S,
    ) -> Result<String, RetryError<RpcError>>
    where
        S: AsyncFnMut() -> bool,
    {
        self.call(&format!("/test/horizontal?dns={web_service_dns}"), should_stop)
            .await
    }

    /// `GET /test/horizontal/add?dns=<ws>`: add a target to a running test.
    pub async fn add_horizontal<S>(
        &self,
        web_service_dns: &str,
        should_stop: S,
    ) -> Result<String, RetryError<RpcError>>
    where
        S: AsyncFnMut() -> bool,
    {
        self.call(
            &format!("/test/horizontal/add?dns={web_service_dns}"),
            should_stop,
        )
        .await
    }

    /// `GET /autoscaling?dns=<lb>`: start the scaling test against a balancer.
    pub async fn start_autoscaling<S>(
        &self,
        load_balancer_dns: &str,
        should_stop: S,
    ) -> Result<String, RetryError<RpcError>>
    where
        S: AsyncFnMut() -> bool,
    {
        self.call(&format!("/autoscaling?dns={load_balancer_dns}"), should_stop)
            .await
    }

    /// `GET /warmup?dns=<lb>`: start the warm-up sub-test.
    pub async fn start_warmup<S>(
        &self,
        load_balancer_dns: &str,
        should_stop: S,
    ) -> Result<String, RetryError<RpcError>>
    where
        S: AsyncFnMut() -> bool,
    {
        self.call(&format!("/warmup?dns={load_balancer_dns}"), should_stop)
            .await
    }

    /// `GET /log?name=<log_name>`, single attempt.
    pub async fn fetch_log(&self, log_name: &str) -> Result<String, RpcError> {
        http_get(&self.address, &format!("/log?name={log_name}"), self.timeout).await
    }

    /// Retry a control call until it succeeds and log the response.
    pub async fn call<S>(&self, path: &str, should_stop: S) -> Result<String, RetryError<RpcError>>
    where
        S: AsyncFnMut() -> bool,
    {
        let body = retry_until(
            &self.retry,
            async || http_get(&self.address, path, self.timeout).await,
            should_stop,
        )
        .await?;
        info!(address = %self.address, %path, response = %body.trim(), "load generator call succeeded");
        Ok(body)
    }
}
