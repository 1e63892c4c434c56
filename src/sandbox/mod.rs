/// Sandboxed Script Execution
///
/// Script-form node logic and non-trivial expressions run in embedded Lua 5.4 states:
/// - Fresh state per call with only table/string/math/utf8
/// - Memory ceiling and wall-clock deadline (instruction hook)
/// - Denied-globals policy and JSON-only context
/// - Live-isolate accounting with RAII disposal

// Lua state lifecycle and limits
pub mod isolate;

// JSON <-> Lua value conversion
pub mod convert;

pub use convert::{json_to_lua, lua_to_json};
pub use isolate::{IsolateManager, SandboxContext, SandboxStats, DENIED_GLOBALS, MAX_SCRIPT_BYTES};
