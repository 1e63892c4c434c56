/// Node Management Layer
///
/// This module handles node type definitions, validation, persistence and the
/// in-memory registry:
/// - Type definitions (NodeDefinition, NodeProperty, Item)
/// - Schema validation that reports every violation at once
/// - SQLite persistence with sqlx
/// - Lock-free registry using ArcSwap

// Core node type definitions
pub mod types;

// Definition and parameter validation
pub mod validation;

// SQLite persistence layer for node type schemas
pub mod storage;

// Lock-free registry with store fallback
pub mod registry;

// Re-export commonly used types
pub use registry::{NodeRegistry, RegisteredNode, RegistrationResult};
pub use storage::{NodeTypeRecord, NodeTypeStore, SqliteNodeTypeStore};
pub use types::{
    DisplayOptions, ExecutionCapability, Item, LoadOptions, NodeCredentialDescription, NodeDefinition,
    NodeHandler, NodeLogic, NodeProperty, NodeSchema, OutputEntry, Properties, PropertyOption, PropertyType,
};
