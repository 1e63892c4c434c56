/// Expression & Parameter Resolution
///
/// Resolves `{{ }}` placeholders and cross-node references in node parameters:
/// - `$vars` / `$local` substitution through the variable service
/// - Pure `$` references selected with JSONPath
/// - Everything else evaluated as Lua in a bounded sandbox

// Placeholder parsing
pub mod template;

// JSONPath-backed `$` references
pub mod reference;

// Parameter resolution pipeline
pub mod resolver;

pub use reference::Reference;
pub use resolver::{ExecutionMeta, ExpressionEvaluator, ParameterResolver, ResolveScope, ResolvedParameters};
