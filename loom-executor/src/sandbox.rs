//! Fresh-per-invocation Lua sandbox.
//!
//! Every run builds a new Lua state on a blocking thread, installs the host
//! primitives and the mediated `require`, loads the handler chunk, and calls
//! it with `request` and `response`. Nothing outlives the run.

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::sync::Arc;
use std::time::{Duration, Instant};

use indexmap::IndexMap;
use loom_core::ConsoleEntry;
use mlua::{Function, HookTriggers, Lua, LuaOptions, StdLib, Table, Value, VmState};
use tokio::sync::Semaphore;

use crate::builtins::{self, ConsoleCapture};
use crate::config::SandboxLimits;
use crate::convert::{display, json_to_lua, lua_to_json};
use crate::error::ExecutionError;
use crate::executable::Executable;
use crate::invocation::{
    ExecutionReport, HandlerResponse, InvocationContext, InvocationUser, ResponseBody,
};
use crate::resolver::{ModuleResolver, Resolution};

/// Default cap on concurrently running sandboxes.
pub const DEFAULT_MAX_CONCURRENT: usize = 64;

/// Extra time the blocking task gets past the deadline before the caller
/// stops waiting for it.
pub const BACKSTOP_GRACE: Duration = Duration::from_millis(250);

const LOADED_KEY: &str = "loom.loaded";
const DEADLINE_MESSAGE: &str = "execution deadline exceeded";

/// Rebinds `pcall`, `xpcall` and `coroutine.resume` so a caught deadline
/// error is raised again instead of swallowed.
const PROTECTED_CALL_GUARD: &str = r#"
local expired, pcall, xpcall, resume, error, pack, unpack = ...
local function settle(results)
  if expired() then error("execution deadline exceeded", 0) end
  return unpack(results, 1, results.n)
end
return function(f, ...) return settle(pack(pcall(f, ...))) end,
  function(f, handler, ...) return settle(pack(xpcall(f, handler, ...))) end,
  function(co, ...) return settle(pack(resume(co, ...))) end
"#;

/// Runs executables under a concurrency cap.
///
/// Cloning shares the cap.
#[derive(Debug, Clone)]
pub struct Sandbox {
    permits: Arc<Semaphore>,
    grace: Duration,
}

impl Sandbox {
    /// A sandbox allowing at most `max_concurrent` simultaneous runs.
    #[must_use]
    pub fn new(max_concurrent: usize) -> Self {
        Self { permits: Arc::new(Semaphore::new(max_concurrent.max(1))), grace: BACKSTOP_GRACE }
    }

    /// Runs `executable` against `ctx` in a fresh Lua state.
    ///
    /// The deadline is enforced inside the VM every
    /// `limits.instruction_interval` instructions; as a backstop the caller
    /// stops waiting after `limits.timeout` plus a short grace. Time spent
    /// waiting for a concurrency permit is not counted.
    ///
    /// # Cancel Safety
    /// Dropping the future abandons the result; the blocking thread still
    /// runs to its own deadline and then releases its permit.
    pub async fn run(
        &self,
        executable: &Executable,
        ctx: InvocationContext,
        resolver: &ModuleResolver,
        limits: SandboxLimits,
    ) -> ExecutionReport {
        let Ok(permit) = Arc::clone(&self.permits).acquire_owned().await else {
            return ExecutionReport {
                result: Err(ExecutionError::Internal("sandbox is shut down".to_owned())),
                console: Vec::new(),
                execution_time_ms: 0,
            };
        };

        let started = Instant::now();
        let executable = executable.clone();
        let resolver = resolver.clone();
        let task = tokio::task::spawn_blocking(move || {
            let _permit = permit;
            run_blocking(&executable, &ctx, &resolver, limits, started)
        });

        let (result, console) = match tokio::time::timeout(limits.timeout + self.grace, task).await
        {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(join)) => {
                (Err(ExecutionError::Internal(format!("sandbox task failed: {join}"))), Vec::new())
            }
            Err(_) => {
                tracing::warn!(
                    timeout_ms = limits.timeout_ms(),
                    "sandbox missed its in-VM deadline; abandoning the blocking task"
                );
                (Err(ExecutionError::Timeout { after_ms: limits.timeout_ms() }), Vec::new())
            }
        };

        ExecutionReport {
            result,
            console,
            execution_time_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
        }
    }
}

impl Default for Sandbox {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_CONCURRENT)
    }
}

// ── Blocking side ───────────────────────────────────────────────────────────

/// Per-run flags shared between the VM callbacks and the classifier.
#[derive(Default)]
struct RunFlags {
    timed_out: Rc<Cell<bool>>,
}

/// Raised by `require` for a name the resolver does not know. Travels as an
/// external error so a caught miss leaves no trace on the run.
#[derive(Debug, thiserror::Error)]
#[error("dependency '{0}' is not installed for this route")]
struct MissingModule(String);

#[derive(Debug, Default)]
struct ResponseState {
    status: Option<u16>,
    headers: IndexMap<String, String>,
    body: Option<ResponseBody>,
    finished: bool,
}

fn run_blocking(
    executable: &Executable,
    ctx: &InvocationContext,
    resolver: &ModuleResolver,
    limits: SandboxLimits,
    started: Instant,
) -> (Result<HandlerResponse, ExecutionError>, Vec<ConsoleEntry>) {
    let console = ConsoleCapture::default();
    let flags = RunFlags::default();
    let deadline = started + limits.timeout;

    let result = match build_vm(&console, resolver, &flags, limits, deadline) {
        Ok(lua) => invoke(&lua, executable, ctx).map_err(|e| classify(&e, &flags, limits)),
        Err(e) => Err(ExecutionError::Internal(format!("failed to build sandbox: {e}"))),
    };
    (result, console.take())
}

fn build_vm(
    console: &ConsoleCapture,
    resolver: &ModuleResolver,
    flags: &RunFlags,
    limits: SandboxLimits,
    deadline: Instant,
) -> mlua::Result<Lua> {
    let lua = Lua::new_with(
        StdLib::STRING | StdLib::TABLE | StdLib::MATH | StdLib::UTF8 | StdLib::COROUTINE,
        LuaOptions::new(),
    )?;
    builtins::install(&lua, console)?;
    install_require(&lua, resolver.clone())?;
    guard_protected_calls(&lua, &flags.timed_out, deadline)?;
    lua.set_memory_limit(limits.memory_limit_bytes)?;

    let timed_out = Rc::clone(&flags.timed_out);
    lua.set_hook(
        HookTriggers::new().every_nth_instruction(limits.instruction_interval),
        move |_lua, _debug| {
            if timed_out.get() || Instant::now() >= deadline {
                timed_out.set(true);
                return Err(mlua::Error::runtime(DEADLINE_MESSAGE));
            }
            Ok(VmState::Continue)
        },
    )?;
    Ok(lua)
}

fn install_require(lua: &Lua, resolver: ModuleResolver) -> mlua::Result<()> {
    lua.set_named_registry_value(LOADED_KEY, lua.create_table()?)?;
    let require = lua.create_function(move |lua, name: String| {
        let loaded: Table = lua.named_registry_value(LOADED_KEY)?;
        let cached: Value = loaded.raw_get(name.as_str())?;
        if !cached.is_nil() {
            return Ok(cached);
        }
        let module = match resolver.resolve(&name) {
            Some(Resolution::Builtin(builtin)) => Value::Table(builtin.load(lua)?),
            Some(Resolution::Package(source)) => {
                let value: Value =
                    lua.load(&*source).set_name(format!("=module:{name}")).call(name.as_str())?;
                if value.is_nil() {
                    Value::Boolean(true)
                } else {
                    value
                }
            }
            None => return Err(mlua::Error::external(MissingModule(name))),
        };
        loaded.raw_set(name.as_str(), module.clone())?;
        Ok(module)
    })?;
    lua.globals().raw_set("require", require)
}

fn guard_protected_calls(
    lua: &Lua,
    timed_out: &Rc<Cell<bool>>,
    deadline: Instant,
) -> mlua::Result<()> {
    let flag = Rc::clone(timed_out);
    let expired = lua.create_function(move |_, ()| {
        if !flag.get() && Instant::now() >= deadline {
            flag.set(true);
        }
        Ok(flag.get())
    })?;
    let globals = lua.globals();
    let table: Table = globals.get("table")?;
    let coroutine: Table = globals.get("coroutine")?;
    let (pcall, xpcall, resume): (Function, Function, Function) =
        lua.load(PROTECTED_CALL_GUARD).set_name("=loom:guard").call((
            expired,
            globals.get::<Function>("pcall")?,
            globals.get::<Function>("xpcall")?,
            coroutine.get::<Function>("resume")?,
            globals.get::<Function>("error")?,
            table.get::<Function>("pack")?,
            table.get::<Function>("unpack")?,
        ))?;
    globals.raw_set("pcall", pcall)?;
    globals.raw_set("xpcall", xpcall)?;
    coroutine.raw_set("resume", resume)?;
    Ok(())
}

fn invoke(
    lua: &Lua,
    executable: &Executable,
    ctx: &InvocationContext,
) -> mlua::Result<HandlerResponse> {
    let chunk: Value =
        lua.load(executable.source()).set_name(executable.chunk_name()).call(())?;
    let handler = resolve_handler(lua, chunk)?;
    let request = request_table(lua, ctx)?;
    let state = Rc::new(RefCell::new(ResponseState::default()));
    let response = response_object(lua, &state)?;
    let returned: Value = handler.call((request, response))?;
    let state = state.borrow();
    interpret(returned, &state)
}

fn resolve_handler(lua: &Lua, chunk: Value) -> mlua::Result<Function> {
    match chunk {
        Value::Function(f) => return Ok(f),
        Value::Table(t) => {
            if let Value::Function(f) = t.get::<Value>("handler")? {
                return Ok(f);
            }
        }
        _ => {}
    }
    match lua.globals().get::<Value>("handler")? {
        Value::Function(f) => Ok(f),
        _ => Err(mlua::Error::runtime(
            "handler source must return a function, return a table with a `handler` \
             function, or define a global `handler` function",
        )),
    }
}

fn request_table(lua: &Lua, ctx: &InvocationContext) -> mlua::Result<Table> {
    let request = lua.create_table()?;
    request.raw_set("method", ctx.method.as_str())?;
    request.raw_set("path", ctx.path.as_str())?;
    request.raw_set("slug", ctx.slug.as_str())?;
    request.raw_set("ip", ctx.client_ip.as_str())?;

    let headers = lua.create_table()?;
    for (name, value) in &ctx.headers {
        headers.raw_set(name.to_ascii_lowercase(), value.as_str())?;
    }
    request.raw_set("headers", headers)?;

    let query = lua.create_table()?;
    for (name, value) in &ctx.query {
        query.raw_set(name.as_str(), value.as_str())?;
    }
    request.raw_set("query", query)?;
    request.raw_set("body", json_to_lua(lua, &ctx.body)?)?;

    if let Some(InvocationUser { id, plan }) = &ctx.user {
        let user = lua.create_table()?;
        user.raw_set("id", id.as_str())?;
        user.raw_set("plan", plan.as_str())?;
        request.raw_set("user", user)?;
    }
    Ok(request)
}

fn response_object(lua: &Lua, state: &Rc<RefCell<ResponseState>>) -> mlua::Result<Table> {
    let response = lua.create_table()?;

    let s = Rc::clone(state);
    response.raw_set(
        "status",
        lua.create_function(move |_, (this, code): (Table, i64)| {
            s.borrow_mut().status = Some(status_code(code)?);
            Ok(this)
        })?,
    )?;

    let s = Rc::clone(state);
    response.raw_set(
        "header",
        lua.create_function(move |_, (this, name, value): (Table, String, Value)| {
            s.borrow_mut().headers.insert(name.to_ascii_lowercase(), display(&value));
            Ok(this)
        })?,
    )?;

    let s = Rc::clone(state);
    response.raw_set(
        "json",
        lua.create_function(move |_, (this, value): (Table, Value)| {
            let body = ResponseBody::Json(lua_to_json(&value)?);
            finish(&s, Some(body))?;
            Ok(this)
        })?,
    )?;

    let s = Rc::clone(state);
    response.raw_set(
        "send",
        lua.create_function(move |_, (this, value): (Table, Value)| {
            finish(&s, Some(body_from(&value)?))?;
            Ok(this)
        })?,
    )?;

    let s = Rc::clone(state);
    response.raw_set(
        "finish",
        lua.create_function(move |_, this: Table| {
            finish(&s, None)?;
            Ok(this)
        })?,
    )?;

    Ok(response)
}

fn finish(state: &Rc<RefCell<ResponseState>>, body: Option<ResponseBody>) -> mlua::Result<()> {
    let mut state = state.borrow_mut();
    if state.finished {
        return Err(mlua::Error::runtime("response was already sent"));
    }
    state.finished = true;
    state.body = body;
    Ok(())
}

fn status_code(code: i64) -> mlua::Result<u16> {
    u16::try_from(code)
        .ok()
        .filter(|c| (100..=599).contains(c))
        .ok_or_else(|| mlua::Error::runtime(format!("invalid HTTP status code {code}")))
}

fn body_from(value: &Value) -> mlua::Result<ResponseBody> {
    Ok(match value {
        Value::Nil => ResponseBody::Empty,
        Value::String(s) => ResponseBody::Text(String::from(s.to_string_lossy())),
        other => ResponseBody::Json(lua_to_json(other)?),
    })
}

fn interpret(returned: Value, state: &ResponseState) -> mlua::Result<HandlerResponse> {
    let mut headers = state.headers.clone();
    if state.finished {
        return Ok(HandlerResponse {
            status: state.status.unwrap_or(200),
            headers,
            body: state.body.clone().unwrap_or(ResponseBody::Empty),
        });
    }

    match returned {
        Value::Nil => Ok(HandlerResponse {
            status: state.status.unwrap_or(204),
            headers,
            body: ResponseBody::Empty,
        }),
        Value::Table(t) => {
            if let Value::Integer(code) = t.raw_get::<Value>("status")? {
                let status = status_code(code)?;
                let body = body_from(&t.raw_get::<Value>("body")?)?;
                if let Value::Table(extra) = t.raw_get::<Value>("headers")? {
                    for pair in extra.pairs::<String, Value>() {
                        let (name, value) = pair?;
                        headers.insert(name.to_ascii_lowercase(), display(&value));
                    }
                }
                return Ok(HandlerResponse { status, headers, body });
            }
            let body = lua_to_json(&Value::Table(t))?;
            Ok(HandlerResponse {
                status: state.status.unwrap_or(200),
                headers,
                body: ResponseBody::Json(body),
            })
        }
        Value::String(s) => Ok(HandlerResponse {
            status: state.status.unwrap_or(200),
            headers,
            body: ResponseBody::Text(String::from(s.to_string_lossy())),
        }),
        value @ (Value::Integer(_) | Value::Number(_) | Value::Boolean(_)) => Ok(HandlerResponse {
            status: state.status.unwrap_or(200),
            headers,
            body: ResponseBody::Json(lua_to_json(&value)?),
        }),
        other => Err(mlua::Error::runtime(format!(
            "handler returned an unsupported value of type {}",
            other.type_name()
        ))),
    }
}

// ── Error classification ────────────────────────────────────────────────────

fn classify(err: &mlua::Error, flags: &RunFlags, limits: SandboxLimits) -> ExecutionError {
    if flags.timed_out.get() {
        return ExecutionError::Timeout { after_ms: limits.timeout_ms() };
    }
    if let mlua::Error::SyntaxError { message, .. } = err {
        return ExecutionError::Compile { message: message.clone() };
    }
    let (message, stack) = describe(err);
    if let Some(MissingModule(name)) = missing_module(err) {
        return ExecutionError::DependencyMissing { name: name.clone(), stack };
    }
    ExecutionError::Runtime { message, stack }
}

/// The `require` miss that ended the run, if any.
fn missing_module(err: &mlua::Error) -> Option<&MissingModule> {
    match err {
        mlua::Error::CallbackError { cause, .. } | mlua::Error::WithContext { cause, .. } => {
            missing_module(cause)
        }
        other => other.downcast_ref::<MissingModule>(),
    }
}

/// Splits an mlua error into a message and an optional Lua traceback.
fn describe(err: &mlua::Error) -> (String, Option<String>) {
    match err {
        mlua::Error::CallbackError { traceback, cause } => {
            let (message, inner) = describe(cause);
            (message, inner.or_else(|| Some(traceback.clone())))
        }
        mlua::Error::RuntimeError(message) => split_traceback(message),
        mlua::Error::MemoryError(_) => ("memory limit exceeded".to_owned(), None),
        other => split_traceback(&other.to_string()),
    }
}

fn split_traceback(message: &str) -> (String, Option<String>) {
    match message.split_once("\nstack traceback:") {
        Some((head, trace)) => {
            (head.trim_end().to_owned(), Some(format!("stack traceback:{trace}")))
        }
        None => (message.to_owned(), None),
    }
}
