//! Call orchestration engine.
//!
//! - [`descriptor`] - Method templates and per-call options
//! - [`context`] - Pooled per-call scratch state
//! - [`middleware`] - Request, response and error hooks
//! - [`plugin`] - Plugin contract and registry
//! - [`orchestrator`] - The [`Engine`] itself

pub mod context;
pub mod descriptor;
pub mod middleware;
pub mod orchestrator;
pub mod plugin;

pub use context::CallContext;
pub use descriptor::{BatchCall, CacheOverride, CallOptions, MethodDescriptor};
pub use middleware::{
    ErrorMiddleware, FallbackMiddleware, HeaderMiddleware, MiddlewareChain, RequestIdMiddleware,
    RequestMiddleware, ResponseMiddleware,
};
pub use orchestrator::{CallStats, Engine, EngineBuilder, EngineStats};
pub use plugin::{Plugin, PluginRegistry};
