/// Runtime Execution Layer
///
/// This module runs one node per call:
/// - Per-call execution context with the helper surface
/// - Node executor pipeline (sanitize → resolve → run → standardize)

// Per-call context handed to node logic
pub mod context;

// Single-node execution pipeline
pub mod executor;

// Re-export commonly used types
pub use context::{ExecutionContext, ExecutionServices, NodeLogger, RunSettings};
pub use executor::{ExecuteNodeRequest, ExecutionFailure, ExecutionOutcome, NodeExecutor};
