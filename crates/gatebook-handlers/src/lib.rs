//! Built-in step handler families for the gatebook engine.
//!
//! Handlers are grouped by the surface they drive:
//! - `utility.*` — sleep, variables, logging, assertions
//! - `gateway.*` — REST calls against the gateway API
//! - `browser.*` — browser automation over a host-provided driver
//! - `designer.*` — designer application automation
//! - `playbook.run` — nested playbook execution
//! - `ai.verify` — AI-backed verification
//!
//! [`default_registry`] wires all of them onto a fresh per-execution
//! registry from one [`HandlerDeps`] bundle; families whose backend is
//! absent are simply left out, and the engine reports such steps as
//! unsupported.

pub mod browser;
pub mod designer;
pub mod gateway;
pub mod nested;
mod params;
pub mod utility;
pub mod verify;

use std::sync::Arc;

use gatebook_engine::{CredentialLookup, HandlerRegistry, RegistryFactory, RuntimeConfig};

pub use browser::BrowserDriver;
pub use designer::DesignerDriver;
pub use nested::PlaybookRunHandler;
pub use verify::{Verdict, Verifier};

/// Everything the built-in handlers need from the host.
#[derive(Clone)]
pub struct HandlerDeps {
    pub credentials: Arc<dyn CredentialLookup>,
    pub config: RuntimeConfig,
    pub browser: Option<Arc<dyn BrowserDriver>>,
    pub designer: Option<Arc<dyn DesignerDriver>>,
    pub verifier: Option<Arc<dyn Verifier>>,
}

impl HandlerDeps {
    pub fn new(credentials: Arc<dyn CredentialLookup>, config: RuntimeConfig) -> Self {
        Self {
            credentials,
            config,
            browser: None,
            designer: None,
            verifier: None,
        }
    }

    pub fn with_browser(mut self, browser: Arc<dyn BrowserDriver>) -> Self {
        self.browser = Some(browser);
        self
    }

    pub fn with_designer(mut self, designer: Arc<dyn DesignerDriver>) -> Self {
        self.designer = Some(designer);
        self
    }

    pub fn with_verifier(mut self, verifier: Arc<dyn Verifier>) -> Self {
        self.verifier = Some(verifier);
        self
    }
}

/// Build a registry carrying every family the deps can back.
pub fn default_registry(deps: &HandlerDeps) -> HandlerRegistry {
    let mut registry = HandlerRegistry::new();
    utility::register(&mut registry);
    gateway::register(&mut registry);

    if let Some(browser) = &deps.browser {
        browser::register(&mut registry, browser.clone());
    }
    if let Some(designer) = &deps.designer {
        designer::register(&mut registry, designer.clone());
    }
    if let Some(verifier) = &deps.verifier {
        registry.register(
            "ai.verify",
            Arc::new(verify::AiVerifyHandler::new(
                verifier.clone(),
                deps.browser.clone(),
            )),
        );
    }

    let child_deps = deps.clone();
    registry.register(
        "playbook.run",
        Arc::new(PlaybookRunHandler::new(
            Arc::new(move || default_registry(&child_deps)),
            deps.credentials.clone(),
            deps.config.clone(),
        )),
    );
    registry
}

/// Factory form of [`default_registry`] for the execution manager, which
/// needs a fresh registry per execution.
pub fn registry_factory(deps: HandlerDeps) -> RegistryFactory {
    Box::new(move || default_registry(&deps))
}
