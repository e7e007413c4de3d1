//! `ai.verify` — ask an AI verifier whether the system looks the way a
//! step expects.
//!
//! The verifier itself is host-provided; this crate only defines the
//! contract and adapts the step onto it. When a browser driver is
//! available the handler captures a screenshot as evidence.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;

use gatebook_engine::{HandlerOutcome, StepContext, StepError, StepHandler};

use crate::browser::BrowserDriver;
use crate::params::parse_params;

/// Verdict returned by a verifier.
#[derive(Debug, Clone)]
pub struct Verdict {
    pub passed: bool,
    pub reasoning: String,
}

/// Host-provided verification backend, typically an LLM with vision.
#[async_trait]
pub trait Verifier: Send + Sync {
    async fn verify(&self, prompt: &str, screenshot: Option<&[u8]>) -> anyhow::Result<Verdict>;
}

pub struct AiVerifyHandler {
    verifier: Arc<dyn Verifier>,
    browser: Option<Arc<dyn BrowserDriver>>,
}

#[derive(Debug, Deserialize)]
struct VerifyParams {
    prompt: String,
    /// Capture a screenshot as evidence when a browser is available.
    #[serde(default = "default_with_screenshot")]
    with_screenshot: bool,
    /// Record the verdict without failing the step on a negative answer.
    #[serde(default)]
    soft: bool,
}

fn default_with_screenshot() -> bool {
    true
}

impl AiVerifyHandler {
    pub fn new(verifier: Arc<dyn Verifier>, browser: Option<Arc<dyn BrowserDriver>>) -> Self {
        Self { verifier, browser }
    }
}

#[async_trait]
impl StepHandler for AiVerifyHandler {
    async fn execute(
        &self,
        params: &HashMap<String, Value>,
        ctx: &StepContext,
    ) -> Result<HandlerOutcome, StepError> {
        let VerifyParams {
            prompt,
            with_screenshot,
            soft,
        } = parse_params(params)?;

        let screenshot = match (&self.browser, with_screenshot) {
            (Some(browser), true) => {
                let png = tokio::select! {
                    _ = ctx.cancel.cancelled() => return Err(StepError::Cancelled),
                    png = browser.screenshot() => {
                        png.map_err(|e| StepError::execution(format!("evidence screenshot failed: {e}")))?
                    }
                };
                Some(png)
            }
            _ => None,
        };

        let verdict = tokio::select! {
            _ = ctx.cancel.cancelled() => return Err(StepError::Cancelled),
            verdict = self.verifier.verify(&prompt, screenshot.as_deref()) => {
                verdict.map_err(|e| StepError::execution(format!("verification failed: {e}")))?
            }
        };

        tracing::info!(
            execution_id = %ctx.execution_id,
            step_id = %ctx.step_id,
            passed = verdict.passed,
            "Verification verdict"
        );

        let mut outcome = HandlerOutcome::empty()
            .output_entry("passed", serde_json::json!(verdict.passed))
            .output_entry("reasoning", serde_json::json!(verdict.reasoning));
        outcome.screenshot = screenshot;

        if !verdict.passed && !soft {
            return Err(StepError::Execution {
                message: format!("verification rejected: {}", verdict.reasoning),
                partial_output: Some(outcome.output),
            });
        }
        Ok(outcome)
    }
}
