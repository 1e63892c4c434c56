/// Isolate manager: bounded Lua states for untrusted node scripts
///
/// Every call gets a brand-new Lua state. The state only sees the safe standard
/// libraries, a JSON copy of the context and a handful of time helpers. A memory
/// ceiling and an instruction hook bound it; the hook is checked every
/// `HOOK_INSTRUCTION_INTERVAL` VM instructions against the wall-clock deadline.
///
/// The hook never fires inside a single C call, so the library functions whose
/// running time is not bounded by memory (pattern matching, `string.rep`,
/// `table.move`) are wrapped with a cost check that refuses work the deadline
/// could not cover.

use mlua::{HookTriggers, Lua, LuaOptions, MultiValue, StdLib, VmState};
use serde::Serialize;
use serde_json::{Map, Value};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::ExecutionLimits;
use crate::error::{EngineError, EngineResult};
use crate::sandbox::convert::{json_to_lua, lua_to_json};

/// Values copied into the script's global scope
pub type SandboxContext = Map<String, Value>;

/// Globals that must be nil inside every sandbox
pub const DENIED_GLOBALS: &[&str] = &[
    "process",
    "global",
    "require",
    "Buffer",
    "__dirname",
    "__filename",
    "setTimeout",
    "setInterval",
    "setImmediate",
    "clearTimeout",
    "clearInterval",
    "clearImmediate",
    "load",
    "loadstring",
    "dofile",
    "loadfile",
    "collectgarbage",
    "rawget",
    "rawset",
    "rawequal",
    "getmetatable",
    "setmetatable",
    "os",
    "io",
    "debug",
    "package",
];

/// VM instructions between deadline checks
const HOOK_INSTRUCTION_INTERVAL: u32 = 1_000;

/// Extra time the outer backstop waits for the hook to fire
const BACKSTOP_GRACE: Duration = Duration::from_secs(1);

/// Largest script accepted
pub const MAX_SCRIPT_BYTES: usize = 1024 * 1024;

/// Pattern matcher steps granted per millisecond of deadline
const PATTERN_STEPS_PER_MS: f64 = 100_000.0;

/// Size of one Lua array slot, used to bound `table.move`
const TABLE_SLOT_BYTES: usize = 16;

/// Builds the runner that calls the user chunk under pcall and tags the outcome;
/// pcall and tostring are captured before any context value is injected
const WRAPPER: &str = r#"
local raw_pcall, tostring = pcall, tostring
return function(body)
  local ok, result = raw_pcall(body)
  if ok then
    return { success = true, value = result }
  end
  return { success = false, error = tostring(result) }
end
"#;

/// Makes pcall/xpcall re-raise once the deadline has passed
const PCALL_GUARD: &str = r#"
local expired = ...
local raw_pcall, raw_xpcall = pcall, xpcall
local pack, unpack = table.pack, table.unpack
local function rethrow(results)
  if not results[1] and expired() then
    error(results[2], 0)
  end
  return unpack(results, 1, results.n)
end
pcall = function(f, ...) return rethrow(pack(raw_pcall(f, ...))) end
xpcall = function(f, handler, ...) return rethrow(pack(raw_xpcall(f, handler, ...))) end
"#;

/// Totals since the manager was created
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SandboxStats {
    pub live: usize,
    pub created: u64,
    pub disposed: u64,
    pub timeouts: u64,
    pub memory_failures: u64,
}

#[derive(Debug, Default)]
struct Counters {
    live: AtomicUsize,
    created: AtomicU64,
    disposed: AtomicU64,
    timeouts: AtomicU64,
    memory_failures: AtomicU64,
}

/// Keeps the live-isolate count honest on every exit path, panics included
struct IsolateGuard {
    counters: Arc<Counters>,
}

impl IsolateGuard {
    fn acquire(counters: &Arc<Counters>) -> Self {
        counters.live.fetch_add(1, Ordering::SeqCst);
        counters.created.fetch_add(1, Ordering::Relaxed);
        Self {
            counters: Arc::clone(counters),
        }
    }
}

impl Drop for IsolateGuard {
    fn drop(&mut self) {
        self.counters.live.fetch_sub(1, Ordering::SeqCst);
        self.counters.disposed.fetch_add(1, Ordering::Relaxed);
    }
}

/// One Lua state plus its accounting guard; the guard is declared last so it drops last
struct Isolate {
    runner: mlua::Function,
    lua: Lua,
    timed_out: Arc<AtomicBool>,
    /// Set when a guarded library call refused to run
    refused: Arc<AtomicBool>,
    limits: ExecutionLimits,
    _guard: IsolateGuard,
}

impl Isolate {
    fn create(limits: ExecutionLimits, guard: IsolateGuard) -> EngineResult<Self> {
        let lua = Lua::new_with(
            StdLib::TABLE | StdLib::STRING | StdLib::MATH | StdLib::UTF8,
            LuaOptions::default(),
        )
        .map_err(|e| EngineError::SandboxExecution(format!("failed to create Lua state: {}", e)))?;

        lua.set_memory_limit(limits.memory_limit)
            .map_err(|e| EngineError::SandboxExecution(format!("failed to set memory limit: {}", e)))?;

        let timed_out = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&timed_out);
        let started = Instant::now();
        let budget = limits.timeout();
        lua.set_hook(
            HookTriggers::new().every_nth_instruction(HOOK_INSTRUCTION_INTERVAL),
            move |_lua, _debug| {
                if started.elapsed() >= budget {
                    flag.store(true, Ordering::SeqCst);
                    return Err(mlua::Error::runtime("script execution timed out"));
                }
                Ok(VmState::Continue)
            },
        )
        .map_err(|e| EngineError::SandboxExecution(format!("failed to install deadline hook: {}", e)))?;

        let refused = Arc::new(AtomicBool::new(false));
        guard_library(&lua, &limits, &refused)
            .map_err(|e| EngineError::SandboxExecution(format!("failed to guard library: {}", e)))?;

        let runner = install_globals(&lua, &timed_out)
            .map_err(|e| EngineError::SandboxExecution(format!("failed to prepare sandbox: {}", e)))?;

        Ok(Self {
            runner,
            lua,
            timed_out,
            refused,
            limits,
            _guard: guard,
        })
    }

    fn inject(&self, context: &SandboxContext) -> EngineResult<()> {
        let globals = self.lua.globals();
        for (key, value) in context {
            if DENIED_GLOBALS.contains(&key.as_str()) {
                tracing::warn!("🚨 Skipped context key shadowing a denied global: {}", key);
                continue;
            }
            let lua_value = json_to_lua(&self.lua, value).map_err(|e| self.classify(e))?;
            globals.raw_set(key.as_str(), lua_value).map_err(|e| self.classify(e))?;
        }
        Ok(())
    }

    fn run(&self, code: &str) -> EngineResult<Value> {
        let body = self
            .lua
            .load(code)
            .set_name("node_script")
            .into_function()
            .map_err(|e| self.classify(e))?;
        let tagged: mlua::Table = self.runner.call(body).map_err(|e| self.classify(e))?;
        let success: bool = tagged.raw_get("success").map_err(|e| self.classify(e))?;

        if !success {
            let message: String = tagged.raw_get("error").unwrap_or_default();
            return Err(self.classify_message(message));
        }

        let value: mlua::Value = tagged.raw_get("value").map_err(|e| self.classify(e))?;
        let json = lua_to_json(value, self.limits.max_output_size).map_err(|e| match e.downcast::<EngineError>() {
            Ok(engine) => engine,
            Err(other) => EngineError::SandboxExecution(other.to_string()),
        })?;

        let size = serde_json::to_vec(&json).map(|bytes| bytes.len()).unwrap_or(usize::MAX);
        if size > self.limits.max_output_size {
            return Err(EngineError::ResourceLimit(format!(
                "sandbox result is {} bytes, limit is {} bytes",
                size, self.limits.max_output_size
            )));
        }

        Ok(json)
    }

    fn classify(&self, err: mlua::Error) -> EngineError {
        if self.timed_out.load(Ordering::SeqCst) {
            return EngineError::SandboxTimeout(self.limits.timeout_ms);
        }
        if self.refused.load(Ordering::SeqCst) {
            return EngineError::ResourceLimit(err.to_string());
        }
        match err {
            mlua::Error::MemoryError(_) => EngineError::SandboxMemory(self.limits.memory_limit),
            mlua::Error::SyntaxError { message, .. } => {
                EngineError::SandboxExecution(format!("syntax error: {}", message))
            }
            other => self.classify_message(other.to_string()),
        }
    }

    /// Errors caught by pcall only come back as text
    fn classify_message(&self, message: String) -> EngineError {
        if self.timed_out.load(Ordering::SeqCst) {
            EngineError::SandboxTimeout(self.limits.timeout_ms)
        } else if self.refused.load(Ordering::SeqCst) {
            EngineError::ResourceLimit(message)
        } else if message.contains("not enough memory") {
            EngineError::SandboxMemory(self.limits.memory_limit)
        } else {
            EngineError::SandboxExecution(message)
        }
    }
}

/// Replace the library calls that can run unbounded inside C with checked versions
///
/// The originals are only reachable through the Rust closures below.
fn guard_library(lua: &Lua, limits: &ExecutionLimits, refused: &Arc<AtomicBool>) -> mlua::Result<()> {
    let string: mlua::Table = lua.globals().raw_get("string")?;
    let budget = limits.timeout_ms as f64 * PATTERN_STEPS_PER_MS;

    for name in ["find", "match", "gmatch", "gsub"] {
        let original: mlua::Function = string.raw_get(name)?;
        let flag = Arc::clone(refused);
        let guarded = lua.create_function(move |_, args: MultiValue| {
            if let Some(work) = pattern_call_work(name, &args) {
                if work > budget {
                    flag.store(true, Ordering::SeqCst);
                    return Err(mlua::Error::runtime(format!(
                        "string.{} refused: pattern is too expensive for a subject of {} bytes",
                        name,
                        text_len(args.front()).unwrap_or_default()
                    )));
                }
            }
            original.call::<MultiValue>(args)
        })?;
        string.raw_set(name, guarded)?;
    }

    let max_repeats = limits.memory_limit as f64;
    let original_rep: mlua::Function = string.raw_get("rep")?;
    let flag = Arc::clone(refused);
    string.raw_set(
        "rep",
        lua.create_function(move |_, args: MultiValue| {
            if number_arg(args.get(1)).is_some_and(|count| count > max_repeats) {
                flag.store(true, Ordering::SeqCst);
                return Err(mlua::Error::runtime("string.rep refused: repeat count exceeds the memory limit"));
            }
            original_rep.call::<MultiValue>(args)
        })?,
    )?;

    let table: mlua::Table = lua.globals().raw_get("table")?;
    let max_moved = (limits.memory_limit / TABLE_SLOT_BYTES) as f64;
    let original_move: mlua::Function = table.raw_get("move")?;
    let flag = Arc::clone(refused);
    table.raw_set(
        "move",
        lua.create_function(move |_, args: MultiValue| {
            if let (Some(first), Some(last)) = (number_arg(args.get(1)), number_arg(args.get(2))) {
                if last - first + 1.0 > max_moved {
                    flag.store(true, Ordering::SeqCst);
                    return Err(mlua::Error::runtime("table.move refused: range exceeds the memory limit"));
                }
            }
            original_move.call::<MultiValue>(args)
        })?,
    )?;

    Ok(())
}

fn text_len(value: Option<&mlua::Value>) -> Option<usize> {
    match value? {
        mlua::Value::String(s) => Some(s.as_bytes().len()),
        // numbers are coerced to short strings
        mlua::Value::Integer(_) | mlua::Value::Number(_) => Some(32),
        _ => None,
    }
}

fn number_arg(value: Option<&mlua::Value>) -> Option<f64> {
    match value? {
        mlua::Value::Integer(i) => Some(*i as f64),
        mlua::Value::Number(n) => Some(*n),
        mlua::Value::String(s) => s.to_str().ok().and_then(|text| text.trim().parse::<f64>().ok()),
        _ => None,
    }
}

/// Estimated matcher steps for a call to `string.<name>`; `None` when the arguments
/// are not strings and the original will raise its own error
fn pattern_call_work(name: &str, args: &MultiValue) -> Option<f64> {
    let subject = text_len(args.front())?;
    let pattern = match args.get(1)? {
        mlua::Value::String(s) => s.as_bytes().to_vec(),
        _ => return None,
    };
    let plain = name == "find"
        && args
            .get(3)
            .is_some_and(|v| !matches!(v, mlua::Value::Nil | mlua::Value::Boolean(false)));
    // gmatch treats a leading '^' as a literal
    Some(pattern_work(subject, &pattern, name != "gmatch", plain))
}

/// Worst-case step count of a Lua pattern match over `subject_len` bytes
///
/// A `*`, `+` or `-` followed by more pattern may backtrack across the whole
/// subject, a `?` followed by more pattern doubles the attempts, and an unanchored
/// search starts over at every position.
fn pattern_work(subject_len: usize, pattern: &[u8], anchorable: bool, plain: bool) -> f64 {
    let n = subject_len as f64 + 1.0;
    let m = pattern.len().max(1) as f64;
    if plain {
        return n * m;
    }

    let anchored = anchorable && pattern.first() == Some(&b'^');
    let body = if anchored { &pattern[1..] } else { pattern };
    let (backtracking, optional) = count_quantifiers(body);
    let starts = if anchored { 1.0 } else { n };

    starts * m * n.powi(backtracking.min(64) as i32) * 2f64.powi(optional.min(64) as i32)
}

fn count_quantifiers(pattern: &[u8]) -> (usize, usize) {
    let mut backtracking = 0;
    let mut optional = 0;
    let mut i = 0;

    while i < pattern.len() {
        match pattern[i] {
            b'(' | b')' => {
                i += 1;
                continue;
            }
            b'%' => match pattern.get(i + 1) {
                // %bxy and %f[set] take no quantifier
                Some(b'b') => {
                    i += 4;
                    continue;
                }
                Some(b'f') => {
                    i = skip_set(pattern, i + 2);
                    continue;
                }
                Some(_) => i += 2,
                None => i += 1,
            },
            b'[' => i = skip_set(pattern, i),
            _ => i += 1,
        }

        if let Some(&quantifier) = pattern.get(i) {
            if matches!(quantifier, b'*' | b'+' | b'-' | b'?') {
                i += 1;
                if has_more_items(&pattern[i.min(pattern.len())..]) {
                    if quantifier == b'?' {
                        optional += 1;
                    } else {
                        backtracking += 1;
                    }
                }
            }
        }
    }

    (backtracking, optional)
}

/// Index just past the set whose `[` is at `i`
fn skip_set(pattern: &[u8], i: usize) -> usize {
    let mut j = i + 1;
    if pattern.get(j) == Some(&b'^') {
        j += 1;
    }
    // a ']' right after the opening bracket is literal
    if pattern.get(j) == Some(&b']') {
        j += 1;
    }
    while j < pattern.len() {
        match pattern[j] {
            b'%' => j += 2,
            b']' => return j + 1,
            _ => j += 1,
        }
    }
    pattern.len()
}

fn has_more_items(rest: &[u8]) -> bool {
    let rest = rest.strip_suffix(b"$").unwrap_or(rest);
    rest.iter().any(|&b| b != b')')
}

/// Remove escape hatches, add the safe time helpers and build the runner
fn install_globals(lua: &Lua, timed_out: &Arc<AtomicBool>) -> mlua::Result<mlua::Function> {
    let globals = lua.globals();

    for name in DENIED_GLOBALS {
        globals.raw_set(*name, mlua::Value::Nil)?;
    }

    // Safe time functions (replace os.date, os.time)
    globals.raw_set(
        "date",
        lua.create_function(|_, format: String| {
            use std::fmt::Write;
            let mut out = String::new();
            write!(out, "{}", chrono::Utc::now().format(&format))
                .map_err(|_| mlua::Error::runtime(format!("invalid date format '{}'", format)))?;
            Ok(out)
        })?,
    )?;
    globals.raw_set(
        "time",
        lua.create_function(|_, ()| Ok(chrono::Utc::now().timestamp()))?,
    )?;
    globals.raw_set(
        "now",
        lua.create_function(|_, ()| Ok(chrono::Utc::now().to_rfc3339()))?,
    )?;

    let flag = Arc::clone(timed_out);
    let expired = lua.create_function(move |_, ()| Ok(flag.load(Ordering::SeqCst)))?;
    lua.load(PCALL_GUARD).set_name("pcall_guard").call::<()>(expired)?;

    // print goes to the host log instead of stdout
    globals.raw_set(
        "print",
        lua.create_function(|_, args: mlua::Variadic<mlua::Value>| {
            let line = args.iter().map(display_value).collect::<Vec<_>>().join("\t");
            tracing::debug!("🖨️ Sandbox print: {}", line);
            Ok(())
        })?,
    )?;

    lua.load(WRAPPER).set_name("sandbox_wrapper").eval()
}

fn display_value(value: &mlua::Value) -> String {
    match value {
        mlua::Value::Nil => "nil".to_string(),
        mlua::Value::Boolean(b) => b.to_string(),
        mlua::Value::Integer(i) => i.to_string(),
        mlua::Value::Number(n) => n.to_string(),
        mlua::Value::String(s) => s.to_string_lossy().to_string(),
        other => other.type_name().to_string(),
    }
}

/// Creates, runs and disposes sandboxed Lua states
#[derive(Debug, Clone, Default)]
pub struct IsolateManager {
    counters: Arc<Counters>,
}

impl IsolateManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `code` in a fresh isolate on the blocking pool
    ///
    /// The script's return value is converted to JSON. Timeouts, memory exhaustion,
    /// script errors and oversized results map to distinct `EngineError` variants.
    pub async fn execute_in_sandbox(
        &self,
        code: &str,
        context: &SandboxContext,
        limits: &ExecutionLimits,
    ) -> EngineResult<Value> {
        check_script_size(code)?;

        let guard = IsolateGuard::acquire(&self.counters);
        let code = code.to_string();
        let context = context.clone();
        let limits = *limits;

        tracing::debug!("🧪 Spawning sandbox isolate ({} bytes of code)", code.len());
        let handle = tokio::task::spawn_blocking(move || run_isolate(&code, &context, limits, guard));

        let result = match tokio::time::timeout(limits.timeout() + BACKSTOP_GRACE, handle).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_err)) => Err(EngineError::SandboxExecution(format!(
                "sandbox worker failed: {}",
                join_err
            ))),
            Err(_) => {
                tracing::error!("⏰ Sandbox backstop fired after {} ms", limits.timeout_ms);
                Err(EngineError::SandboxTimeout(limits.timeout_ms))
            }
        };

        self.record(&result);
        result
    }

    /// Isolates currently alive
    pub fn live_isolates(&self) -> usize {
        self.counters.live.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> SandboxStats {
        SandboxStats {
            live: self.live_isolates(),
            created: self.counters.created.load(Ordering::Relaxed),
            disposed: self.counters.disposed.load(Ordering::Relaxed),
            timeouts: self.counters.timeouts.load(Ordering::Relaxed),
            memory_failures: self.counters.memory_failures.load(Ordering::Relaxed),
        }
    }

    fn record(&self, result: &EngineResult<Value>) {
        match result {
            Err(EngineError::SandboxTimeout(ms)) => {
                self.counters.timeouts.fetch_add(1, Ordering::Relaxed);
                tracing::warn!("⏰ Sandbox script timed out after {} ms", ms);
            }
            Err(EngineError::SandboxMemory(limit)) => {
                self.counters.memory_failures.fetch_add(1, Ordering::Relaxed);
                tracing::warn!("💥 Sandbox script exceeded memory limit of {} bytes", limit);
            }
            Err(e) => tracing::debug!("❌ Sandbox script failed: {}", e),
            Ok(_) => tracing::debug!("✅ Sandbox script completed"),
        }
    }
}

fn check_script_size(code: &str) -> EngineResult<()> {
    if code.len() > MAX_SCRIPT_BYTES {
        return Err(EngineError::ResourceLimit(format!(
            "script is {} bytes, limit is {} bytes",
            code.len(),
            MAX_SCRIPT_BYTES
        )));
    }
    Ok(())
}

fn run_isolate(
    code: &str,
    context: &SandboxContext,
    limits: ExecutionLimits,
    guard: IsolateGuard,
) -> EngineResult<Value> {
    let isolate = Isolate::create(limits, guard)?;
    isolate.inject(context)?;
    isolate.run(code)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use serde_json::json;

    fn limits() -> ExecutionLimits {
        ExecutionLimits {
            timeout_ms: 500,
            memory_limit: 16 * 1024 * 1024,
            max_output_size: 64 * 1024,
            max_request_timeout_ms: 1_000,
            max_concurrent_requests: 2,
        }
    }

    fn context(value: Value) -> SandboxContext {
        value.as_object().cloned().unwrap_or_default()
    }

    #[tokio::test]
    async fn test_returns_script_value() {
        let manager = IsolateManager::new();
        let ctx = context(json!({"items": [{"n": 1}, {"n": 2}]}));
        let result = manager
            .execute_in_sandbox("local total = 0 for _, it in ipairs(items) do total = total + it.n end return { total = total }", &ctx, &limits())
            .await
            .unwrap();
        assert_eq!(result, json!({"total": 3}));
        assert_eq!(manager.live_isolates(), 0);
    }

    #[tokio::test]
    async fn test_denied_globals_are_nil() {
        let manager = IsolateManager::new();
        let lookups = DENIED_GLOBALS
            .iter()
            .map(|name| format!("{} == nil", name))
            .collect::<Vec<_>>()
            .join(" and ");
        let result = manager
            .execute_in_sandbox(&format!("return {}", lookups), &SandboxContext::new(), &limits())
            .await
            .unwrap();
        assert_eq!(result, json!(true));
    }

    #[tokio::test]
    async fn test_context_cannot_smuggle_denied_globals() {
        let manager = IsolateManager::new();
        let ctx = context(json!({"require": "sneaky", "ok": 1}));
        let result = manager
            .execute_in_sandbox("return { r = require, ok = ok }", &ctx, &limits())
            .await
            .unwrap();
        assert_eq!(result, json!({"ok": 1}));
    }

    #[tokio::test]
    async fn test_infinite_loop_times_out_and_is_disposed() {
        let manager = IsolateManager::new();
        let started = Instant::now();
        let err = manager
            .execute_in_sandbox("while true do end", &SandboxContext::new(), &limits())
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::SandboxTimeout);
        assert!(started.elapsed() < Duration::from_millis(500) + BACKSTOP_GRACE);
        assert_eq!(manager.live_isolates(), 0);
        assert_eq!(manager.stats().timeouts, 1);
    }

    #[tokio::test]
    async fn test_pcall_inside_script_cannot_swallow_timeout() {
        let manager = IsolateManager::new();
        let err = manager
            .execute_in_sandbox(
                "while true do pcall(function() while true do end end) end",
                &SandboxContext::new(),
                &limits(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SandboxTimeout);
    }

    #[tokio::test]
    async fn test_memory_ceiling_is_distinct_from_timeout() {
        let manager = IsolateManager::new();
        let err = manager
            .execute_in_sandbox(
                "local t = {} for i = 1, 10000000 do t[i] = string.rep('x', 64) .. i end return #t",
                &SandboxContext::new(),
                &limits(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SandboxMemory);
        assert_eq!(manager.live_isolates(), 0);
    }

    #[tokio::test]
    async fn test_script_errors_and_syntax_errors() {
        let manager = IsolateManager::new();
        let err = manager
            .execute_in_sandbox("error('bad input')", &SandboxContext::new(), &limits())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SandboxExecution);
        assert!(err.to_string().contains("bad input"));

        let err = manager
            .execute_in_sandbox("return (", &SandboxContext::new(), &limits())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SandboxExecution);
        assert_eq!(manager.live_isolates(), 0);
    }

    #[tokio::test]
    async fn test_oversized_result_is_rejected() {
        let manager = IsolateManager::new();
        let err = manager
            .execute_in_sandbox("return string.rep('a', 100000)", &SandboxContext::new(), &limits())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ResourceLimit);
    }

    #[tokio::test]
    async fn test_catastrophic_pattern_is_refused_before_matching() {
        let manager = IsolateManager::new();
        let started = Instant::now();

        for code in [
            "return string.find(string.rep('a', 20000), '.-.-.-b')",
            "local s = string.rep('a', 20000) return s:match('(a*)*b')",
            "local n = 0 for _ in string.gmatch(string.rep('a', 20000), 'a-a-a-b') do n = n + 1 end return n",
        ] {
            let err = manager
                .execute_in_sandbox(code, &SandboxContext::new(), &limits())
                .await
                .unwrap_err();
            assert_eq!(err.kind(), ErrorKind::ResourceLimit, "{}", code);
        }

        assert!(started.elapsed() < Duration::from_millis(1500));
        assert_eq!(manager.live_isolates(), 0);
        assert_eq!(manager.stats().disposed, 3);
    }

    #[tokio::test]
    async fn test_ordinary_patterns_still_work() {
        let manager = IsolateManager::new();
        let code = r#"
            local text = string.rep("word  ", 2000)
            local squeezed = text:gsub("%s+", " ")
            local parts = 0
            for _ in ("a,b,c"):gmatch("[^,]+") do parts = parts + 1 end
            local trimmed = ("  hi  "):match("^%s*(.-)%s*$")
            return { len = #squeezed, parts = parts, trimmed = trimmed, at = string.find("needle", "dl", 1, true) }
        "#;
        let result = manager
            .execute_in_sandbox(code, &SandboxContext::new(), &limits())
            .await
            .unwrap();
        assert_eq!(result, json!({"len": 10000, "parts": 3, "trimmed": "hi", "at": 4}));
    }

    #[tokio::test]
    async fn test_unbounded_repeat_and_move_are_refused() {
        let manager = IsolateManager::new();
        for code in [
            "return #string.rep('', 1e15)",
            "return #table.move({}, 1, 1e15, 1)",
        ] {
            let err = manager
                .execute_in_sandbox(code, &SandboxContext::new(), &limits())
                .await
                .unwrap_err();
            assert_eq!(err.kind(), ErrorKind::ResourceLimit, "{}", code);
        }
        assert_eq!(manager.live_isolates(), 0);
    }

    #[tokio::test]
    async fn test_shared_subtables_cannot_blow_up_the_result() {
        let manager = IsolateManager::new();
        let err = manager
            .execute_in_sandbox(
                "local t = { x = 1 } for i = 1, 30 do t = { a = t, b = t } end return t",
                &SandboxContext::new(),
                &limits(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ResourceLimit);
        assert_eq!(manager.live_isolates(), 0);
    }

    #[test]
    fn test_pattern_work_estimates() {
        let budget = 500.0 * PATTERN_STEPS_PER_MS;
        assert!(pattern_work(20_000, b".-.-.-b", true, false) > budget);
        assert!(pattern_work(100_000, b"%s+", true, false) < budget);
        assert!(pattern_work(100_000, b"^%s*(.-)%s*$", true, false) > pattern_work(100_000, b"%s*$", true, false));
        assert_eq!(count_quantifiers(b"[%]*]+x"), (1, 0));
        assert_eq!(count_quantifiers(b"%b()a-%f[%w]b?c"), (1, 1));
    }
}
