//! Gateway REST step handlers: login, request, wait.
//!
//! One `GatewayApi` is created per execution and shared by the family's
//! handlers, so a login in one step carries the session into the next.
//! Nothing here is shared across executions.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use gatebook_engine::{HandlerOutcome, HandlerRegistry, StepContext, StepError, StepHandler};

use crate::params::parse_params;

struct Session {
    base_url: String,
    token: String,
}

/// Per-execution gateway client with an authenticated session.
pub struct GatewayApi {
    http: reqwest::Client,
    session: tokio::sync::Mutex<Option<Session>>,
}

impl GatewayApi {
    pub fn new() -> Self {
        Self {
            http: reqwest::Client::new(),
            session: tokio::sync::Mutex::new(None),
        }
    }

    async fn login(
        &self,
        gateway_url: &str,
        username: &str,
        password: &str,
        cancel: &CancellationToken,
    ) -> Result<(), StepError> {
        let base_url = gateway_url.trim_end_matches('/').to_string();
        let request = self
            .http
            .post(format!("{base_url}/api/auth/login"))
            .json(&serde_json::json!({
                "username": username,
                "password": password,
            }))
            .send();

        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(StepError::Cancelled),
            response = request => response.map_err(|e| StepError::execution(format!("gateway login failed: {e}")))?,
        };
        if !response.status().is_success() {
            return Err(StepError::execution(format!(
                "gateway login rejected with status {}",
                response.status()
            )));
        }

        #[derive(Deserialize)]
        struct LoginResponse {
            token: String,
        }
        let body: LoginResponse = tokio::select! {
            _ = cancel.cancelled() => return Err(StepError::Cancelled),
            body = response.json() => body.map_err(|e| StepError::execution(format!("gateway login response: {e}")))?,
        };

        *self.session.lock().await = Some(Session { base_url, token: body.token });
        Ok(())
    }

    async fn request(
        &self,
        method: &str,
        path: &str,
        body: Option<&Value>,
        cancel: &CancellationToken,
    ) -> Result<(u16, Value), StepError> {
        let (base_url, token) = {
            let session = self.session.lock().await;
            let session = session
                .as_ref()
                .ok_or_else(|| StepError::execution("gateway request before gateway.login"))?;
            (session.base_url.clone(), session.token.clone())
        };

        let method: reqwest::Method = method
            .parse()
            .map_err(|_| StepError::execution(format!("invalid HTTP method: {method}")))?;
        let path = if path.starts_with('/') {
            path.to_string()
        } else {
            format!("/{path}")
        };

        let mut request = self
            .http
            .request(method, format!("{base_url}{path}"))
            .bearer_auth(token);
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(StepError::Cancelled),
            response = request.send() => response.map_err(|e| StepError::execution(format!("gateway request failed: {e}")))?,
        };
        let status = response.status().as_u16();
        let body = tokio::select! {
            _ = cancel.cancelled() => return Err(StepError::Cancelled),
            text = response.text() => text.map_err(|e| StepError::execution(format!("gateway response: {e}")))?,
        };
        let body = serde_json::from_str(&body).unwrap_or(Value::String(body));

        Ok((status, body))
    }
}

impl Default for GatewayApi {
    fn default() -> Self {
        Self::new()
    }
}

/// `gateway.login` — authenticate against the gateway REST API.
pub struct GatewayLoginHandler {
    api: Arc<GatewayApi>,
}

#[derive(Debug, Deserialize)]
struct LoginParams {
    gateway_url: String,
    username: String,
    password: String,
}

#[async_trait]
impl StepHandler for GatewayLoginHandler {
    async fn execute(
        &self,
        params: &HashMap<String, Value>,
        ctx: &StepContext,
    ) -> Result<HandlerOutcome, StepError> {
        let LoginParams {
            gateway_url,
            username,
            password,
        } = parse_params(params)?;

        self.api
            .login(&gateway_url, &username, &password, &ctx.cancel)
            .await?;

        tracing::info!(
            execution_id = %ctx.execution_id,
            gateway_url = %gateway_url,
            "Gateway session established"
        );
        Ok(HandlerOutcome::empty()
            .output_entry("logged_in", serde_json::json!(true))
            .set_variable("gateway_url", serde_json::json!(gateway_url)))
    }
}

/// `gateway.request` — one REST call against the authenticated session.
pub struct GatewayRequestHandler {
    api: Arc<GatewayApi>,
}

#[derive(Debug, Deserialize)]
struct RequestParams {
    path: String,
    #[serde(default = "default_method")]
    method: String,
    #[serde(default)]
    body: Option<Value>,
    /// When set, any other response status fails the step.
    #[serde(default)]
    expect_status: Option<u16>,
}

fn default_method() -> String {
    "GET".to_string()
}

#[async_trait]
impl StepHandler for GatewayRequestHandler {
    async fn execute(
        &self,
        params: &HashMap<String, Value>,
        ctx: &StepContext,
    ) -> Result<HandlerOutcome, StepError> {
        let RequestParams {
            path,
            method,
            body,
            expect_status,
        } = parse_params(params)?;

        let (status, response) = self
            .api
            .request(&method, &path, body.as_ref(), &ctx.cancel)
            .await?;

        if let Some(expected) = expect_status {
            if status != expected {
                return Err(StepError::Execution {
                    message: format!("gateway returned status {status}, expected {expected}"),
                    partial_output: Some(HashMap::from([
                        ("status".to_string(), serde_json::json!(status)),
                        ("body".to_string(), response),
                    ])),
                });
            }
        }

        Ok(HandlerOutcome::empty()
            .output_entry("status", serde_json::json!(status))
            .output_entry("body", response))
    }
}

/// `gateway.wait` — poll an endpoint until it answers with the expected
/// status or a deadline passes.
pub struct GatewayWaitHandler {
    api: Arc<GatewayApi>,
}

#[derive(Debug, Deserialize)]
struct WaitParams {
    path: String,
    #[serde(default = "default_wait_timeout")]
    timeout_seconds: f64,
    #[serde(default = "default_wait_interval")]
    interval_seconds: f64,
    #[serde(default = "default_wait_status")]
    expect_status: u16,
}

fn default_wait_timeout() -> f64 {
    60.0
}

fn default_wait_interval() -> f64 {
    2.0
}

fn default_wait_status() -> u16 {
    200
}

#[async_trait]
impl StepHandler for GatewayWaitHandler {
    async fn execute(
        &self,
        params: &HashMap<String, Value>,
        ctx: &StepContext,
    ) -> Result<HandlerOutcome, StepError> {
        let WaitParams {
            path,
            timeout_seconds,
            interval_seconds,
            expect_status,
        } = parse_params(params)?;
        if !timeout_seconds.is_finite() || timeout_seconds < 0.0 {
            return Err(StepError::execution(format!(
                "invalid wait timeout: {timeout_seconds}"
            )));
        }
        if !interval_seconds.is_finite() || interval_seconds < 0.0 {
            return Err(StepError::execution(format!(
                "invalid poll interval: {interval_seconds}"
            )));
        }

        let deadline = tokio::time::Instant::now() + Duration::from_secs_f64(timeout_seconds);
        let started = std::time::Instant::now();
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            match self.api.request("GET", &path, None, &ctx.cancel).await {
                Ok((status, body)) if status == expect_status => {
                    return Ok(HandlerOutcome::empty()
                        .output_entry("status", serde_json::json!(status))
                        .output_entry("attempts", serde_json::json!(attempts))
                        .output_entry(
                            "waited_ms",
                            serde_json::json!(started.elapsed().as_millis() as u64),
                        )
                        .output_entry("body", body));
                }
                Ok((status, _)) => {
                    tracing::debug!(
                        execution_id = %ctx.execution_id,
                        path = %path,
                        status,
                        attempts,
                        "Gateway not ready yet"
                    );
                }
                Err(StepError::Cancelled) => return Err(StepError::Cancelled),
                // Connection errors while the gateway restarts are part
                // of a normal wait; keep polling.
                Err(e) => {
                    tracing::debug!(
                        execution_id = %ctx.execution_id,
                        path = %path,
                        error = %e,
                        "Gateway unreachable, retrying"
                    );
                }
            }

            if tokio::time::Instant::now() >= deadline {
                return Err(StepError::execution(format!(
                    "gateway did not answer {expect_status} on {path} within {timeout_seconds}s"
                )));
            }
            tokio::select! {
                _ = ctx.cancel.cancelled() => return Err(StepError::Cancelled),
                _ = tokio::time::sleep(Duration::from_secs_f64(interval_seconds)) => {}
            }
        }
    }
}

/// Register the gateway family on a registry with a fresh per-execution
/// client.
pub fn register(registry: &mut HandlerRegistry) {
    let api = Arc::new(GatewayApi::new());
    registry.register(
        "gateway.login",
        Arc::new(GatewayLoginHandler { api: api.clone() }),
    );
    registry.register(
        "gateway.request",
        Arc::new(GatewayRequestHandler { api: api.clone() }),
    );
    registry.register("gateway.wait", Arc::new(GatewayWaitHandler { api }));
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> StepContext {
        StepContext {
            execution_id: "exec-1".to_string(),
            step_id: "step-1".to_string(),
            variables: HashMap::new(),
            cancel: CancellationToken::new(),
        }
    }

    #[tokio::test]
    async fn test_request_before_login_fails() {
        let api = Arc::new(GatewayApi::new());
        let handler = GatewayRequestHandler { api };

        let mut params = HashMap::new();
        params.insert("path".to_string(), serde_json::json!("/api/status"));

        let err = handler.execute(&params, &ctx()).await.unwrap_err();
        assert!(err.to_string().contains("before gateway.login"));
    }

    #[tokio::test]
    async fn test_wait_rejects_negative_durations() {
        let api = Arc::new(GatewayApi::new());
        let handler = GatewayWaitHandler { api };

        for (field, message) in [
            ("timeout_seconds", "invalid wait timeout"),
            ("interval_seconds", "invalid poll interval"),
        ] {
            let mut params = HashMap::new();
            params.insert("path".to_string(), serde_json::json!("/api/status"));
            params.insert(field.to_string(), serde_json::json!(-1.0));

            // Must fail as a parameter error before any request is made.
            let err = handler.execute(&params, &ctx()).await.unwrap_err();
            assert!(err.to_string().contains(message));
        }
    }

    #[test]
    fn test_wait_params_defaults() {
        let params: WaitParams =
            serde_json::from_value(serde_json::json!({"path": "/api/status"})).unwrap();
        assert_eq!(params.timeout_seconds, 60.0);
        assert_eq!(params.interval_seconds, 2.0);
        assert_eq!(params.expect_status, 200);
    }

    #[test]
    fn test_register_installs_family() {
        let mut registry = HandlerRegistry::new();
        register(&mut registry);
        assert!(registry.has("gateway.login"));
        assert!(registry.has("gateway.request"));
        assert!(registry.has("gateway.wait"));
    }
}
