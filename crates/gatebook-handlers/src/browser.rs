//! Browser automation step handlers.
//!
//! The handlers are thin adapters over a [`BrowserDriver`], which the host
//! application implements against its automation backend. The driver is
//! also registered as an external resource so the engine closes the
//! browser exactly once at the end of the run, however the run ends.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use serde::Deserialize;
use serde_json::Value;

use gatebook_engine::{
    ExternalResource, HandlerOutcome, HandlerRegistry, StepContext, StepError, StepHandler,
};

use crate::params::parse_params;

/// Backend contract for the browser family. All methods are expected to be
/// cancellation-safe; the handlers race them against the step's cancel
/// token.
#[async_trait]
pub trait BrowserDriver: Send + Sync {
    async fn navigate(&self, url: &str) -> anyhow::Result<()>;
    async fn click(&self, selector: &str) -> anyhow::Result<()>;
    async fn fill(&self, selector: &str, text: &str) -> anyhow::Result<()>;
    /// Wait until `selector` is present, up to `timeout`.
    async fn wait_for(&self, selector: &str, timeout: Duration) -> anyhow::Result<()>;
    /// Capture the current page as a PNG.
    async fn screenshot(&self) -> anyhow::Result<Vec<u8>>;
    /// Close the browser. Must be idempotent.
    async fn close(&self);
}

/// Adapter that lets the engine tear the browser down with the other
/// external resources.
struct BrowserResource {
    driver: Arc<dyn BrowserDriver>,
}

#[async_trait]
impl ExternalResource for BrowserResource {
    fn name(&self) -> &str {
        "browser"
    }

    async fn release(&self) {
        self.driver.close().await;
    }
}

macro_rules! race_cancel {
    ($ctx:expr, $fut:expr, $what:expr) => {
        tokio::select! {
            _ = $ctx.cancel.cancelled() => return Err(StepError::Cancelled),
            result = $fut => result.map_err(|e| StepError::execution(format!("{}: {}", $what, e)))?,
        }
    };
}

/// `browser.navigate`
pub struct NavigateHandler {
    driver: Arc<dyn BrowserDriver>,
}

#[derive(Debug, Deserialize)]
struct NavigateParams {
    url: String,
}

#[async_trait]
impl StepHandler for NavigateHandler {
    async fn execute(
        &self,
        params: &HashMap<String, Value>,
        ctx: &StepContext,
    ) -> Result<HandlerOutcome, StepError> {
        let NavigateParams { url } = parse_params(params)?;
        race_cancel!(ctx, self.driver.navigate(&url), "navigation failed");
        tracing::debug!(execution_id = %ctx.execution_id, url = %url, "Navigated");
        Ok(HandlerOutcome::empty().output_entry("url", serde_json::json!(url)))
    }
}

/// `browser.click`
pub struct ClickHandler {
    driver: Arc<dyn BrowserDriver>,
}

#[derive(Debug, Deserialize)]
struct ClickParams {
    selector: String,
}

#[async_trait]
impl StepHandler for ClickHandler {
    async fn execute(
        &self,
        params: &HashMap<String, Value>,
        ctx: &StepContext,
    ) -> Result<HandlerOutcome, StepError> {
        let ClickParams { selector } = parse_params(params)?;
        race_cancel!(ctx, self.driver.click(&selector), "click failed");
        Ok(HandlerOutcome::empty().output_entry("selector", serde_json::json!(selector)))
    }
}

/// `browser.fill`
pub struct FillHandler {
    driver: Arc<dyn BrowserDriver>,
}

#[derive(Debug, Deserialize)]
struct FillParams {
    selector: String,
    text: String,
}

#[async_trait]
impl StepHandler for FillHandler {
    async fn execute(
        &self,
        params: &HashMap<String, Value>,
        ctx: &StepContext,
    ) -> Result<HandlerOutcome, StepError> {
        let FillParams { selector, text } = parse_params(params)?;
        race_cancel!(ctx, self.driver.fill(&selector, &text), "fill failed");
        Ok(HandlerOutcome::empty().output_entry("selector", serde_json::json!(selector)))
    }
}

/// `browser.wait`
pub struct WaitHandler {
    driver: Arc<dyn BrowserDriver>,
}

#[derive(Debug, Deserialize)]
struct WaitParams {
    selector: String,
    #[serde(default = "default_wait_timeout")]
    timeout_seconds: f64,
}

fn default_wait_timeout() -> f64 {
    30.0
}

#[async_trait]
impl StepHandler for WaitHandler {
    async fn execute(
        &self,
        params: &HashMap<String, Value>,
        ctx: &StepContext,
    ) -> Result<HandlerOutcome, StepError> {
        let WaitParams {
            selector,
            timeout_seconds,
        } = parse_params(params)?;
        if !timeout_seconds.is_finite() || timeout_seconds < 0.0 {
            return Err(StepError::execution(format!(
                "invalid wait timeout: {timeout_seconds}"
            )));
        }
        let timeout = Duration::from_secs_f64(timeout_seconds);
        race_cancel!(
            ctx,
            self.driver.wait_for(&selector, timeout),
            "wait failed"
        );
        Ok(HandlerOutcome::empty().output_entry("selector", serde_json::json!(selector)))
    }
}

/// `browser.screenshot` — captures a PNG and hands it to the engine's
/// observers through the outcome.
pub struct ScreenshotHandler {
    driver: Arc<dyn BrowserDriver>,
}

#[async_trait]
impl StepHandler for ScreenshotHandler {
    async fn execute(
        &self,
        _params: &HashMap<String, Value>,
        ctx: &StepContext,
    ) -> Result<HandlerOutcome, StepError> {
        let png = race_cancel!(ctx, self.driver.screenshot(), "screenshot failed");
        let mut outcome = HandlerOutcome::empty()
            .output_entry("bytes", serde_json::json!(png.len()))
            .output_entry(
                "data_b64",
                serde_json::json!(base64::engine::general_purpose::STANDARD.encode(&png)),
            );
        outcome.screenshot = Some(png);
        Ok(outcome)
    }
}

/// Register the browser family against one driver instance and tie the
/// driver's lifetime to the execution.
pub fn register(registry: &mut HandlerRegistry, driver: Arc<dyn BrowserDriver>) {
    registry.register(
        "browser.navigate",
        Arc::new(NavigateHandler {
            driver: driver.clone(),
        }),
    );
    registry.register(
        "browser.click",
        Arc::new(ClickHandler {
            driver: driver.clone(),
        }),
    );
    registry.register(
        "browser.fill",
        Arc::new(FillHandler {
            driver: driver.clone(),
        }),
    );
    registry.register(
        "browser.wait",
        Arc::new(WaitHandler {
            driver: driver.clone(),
        }),
    );
    registry.register(
        "browser.screenshot",
        Arc::new(ScreenshotHandler {
            driver: driver.clone(),
        }),
    );
    registry.add_resource(Arc::new(BrowserResource { driver }));
}
