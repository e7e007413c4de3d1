//! Gatebook Playbook Engine
//!
//! Turns a declarative step sequence into a supervised, cancellable,
//! concurrently-running unit of work.
//!
//! This crate provides:
//! - Playbook/execution data model and per-step results
//! - Parameter resolution with credential injection and autofill
//! - Step handler contract and per-execution registry
//! - The playbook engine state machine (pause/resume/cancel)
//! - The execution manager: supervision, run timeouts, TTL cleanup
//!
//! Step handlers themselves live in `gatebook-handlers`; the API layer
//! consuming this engine is a separate concern.

pub mod condition;
pub mod config;
pub mod credentials;
pub mod engine;
pub mod error;
pub mod execution;
pub mod manager;
pub mod observer;
pub mod playbook;
pub mod registry;
pub mod resolver;

pub use config::RuntimeConfig;
pub use credentials::{Credential, CredentialLookup, InMemoryCredentials};
pub use engine::PlaybookEngine;
pub use error::{EngineError, ResolutionError, StepError};
pub use execution::{ExecutionSnapshot, ExecutionStatus, StepOutcome, StepResult};
pub use manager::{ExecutionManager, RegistryFactory};
pub use observer::ExecutionObserver;
pub use playbook::{Condition, Operator, ParamType, ParameterSpec, Playbook, Step};
pub use registry::{ExternalResource, HandlerOutcome, HandlerRegistry, StepContext, StepHandler};
pub use resolver::{ParameterResolver, ResolveContext};
