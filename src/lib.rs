/// Nodeward: secure node execution engine for workflow automation
///
/// Takes one node definition, its parameters and untrusted input, runs it under
/// bounded resources with a capability-scoped helper surface, and returns a
/// normalized output or a typed failure.

// Core configuration and setup
pub mod config;

// Typed engine errors
pub mod error;

// Node definitions, validation, persistence and registry
pub mod node;

// Parameter resolution over `{{ }}` placeholders
pub mod expression;

// Lua sandbox with memory and time ceilings
pub mod sandbox;

// HTTP, credentials and scratch state exposed to node logic
pub mod helpers;

// Dangerous-key stripping on both sides of execution
pub mod sanitize;

// Output shape classification
pub mod output;

// Interfaces of services owned by the embedding application
pub mod collaborators;

// Execution context and the node executor
pub mod runtime;

// Built-in node types
pub mod nodes;

// Registry/store/executor wiring
pub mod bootstrap;

// Tracing subscriber setup
pub mod telemetry;

// Re-export commonly used types for external consumers
pub use bootstrap::{create_executor, Collaborators};
pub use config::{EngineConfig, ExecutionLimits, LimitsOverride};
pub use error::{EngineError, EngineResult, ErrorKind};
pub use node::{Item, NodeDefinition, NodeHandler, NodeLogic, NodeRegistry};
pub use output::StandardizedOutput;
pub use runtime::{ExecuteNodeRequest, ExecutionContext, ExecutionOutcome, NodeExecutor};
