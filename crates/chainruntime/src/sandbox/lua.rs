//! Lua worker thread.
//!
//! Each worker owns one Lua state on a dedicated OS thread. A script never
//! sees the state's globals: it runs against a fresh environment table that
//! holds `input`, `next`, `print`, the pure builtins and one binding per
//! whitelisted capability. Capability calls block the script while the host
//! resolves them; the answer is matched by correlation id.
//!
//! JSON `null` crosses into Lua as `nil`, so a null field reads the same as
//! an absent one.

use super::protocol::{Activate, CapabilityRequest, Interrupt, SandboxActivation, WorkerCommand};
use chaincore::{Next, SandboxError, Value, ERROR, SUCCESS};
use mlua::{
    Function, HookTriggers, Lua, LuaOptions, LuaSerdeExt, SerializeOptions, StdLib, Table,
    Value as LuaValue, Variadic, VmState,
};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, oneshot};

/// Globals copied into every scope. None of them reach outside the VM.
const PURE_GLOBALS: &[&str] = &[
    "assert", "error", "ipairs", "pairs", "pcall", "select", "tonumber", "tostring", "type",
    "xpcall",
];

/// Libraries copied (shallowly) into every scope so scripts cannot patch
/// them for later activations.
const PURE_LIBRARIES: &[&str] = &["string", "table", "math", "utf8"];

/// VM instructions between interrupt checks.
const INTERRUPT_INTERVAL: u32 = 1_000;

/// Wraps a table and a function into a callable table.
const MAKE_CALLABLE: &str = r#"
local t, f = ...
return setmetatable(t, { __call = function(_, ...) return f(...) end })
"#;

/// Raised into Lua when the host reports a capability failure, so the
/// error can be told apart from script errors on the way out.
#[derive(Debug, thiserror::Error)]
#[error("{message}")]
struct CapabilityFailure {
    name: String,
    message: String,
}

/// Start a worker thread and wait until its Lua state is ready.
pub(crate) async fn spawn_worker(
    workflow: &str,
    requests: mpsc::UnboundedSender<CapabilityRequest>,
    interrupt: Arc<Interrupt>,
) -> Result<mpsc::UnboundedSender<WorkerCommand>, SandboxError> {
    let (commands_tx, commands_rx) = mpsc::unbounded_channel();
    let (ready_tx, ready_rx) = oneshot::channel::<Result<(), SandboxError>>();

    std::thread::Builder::new()
        .name(format!("sandbox-{}", workflow))
        .spawn(move || {
            let worker = match LuaWorker::provision(commands_rx, requests, interrupt) {
                Ok(worker) => worker,
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                    return;
                }
            };
            let _ = ready_tx.send(Ok(()));
            worker.run();
        })
        .map_err(|e| SandboxError::Provisioning(e.to_string()))?;

    ready_rx
        .await
        .map_err(|_| SandboxError::Provisioning("worker exited during startup".to_string()))??;

    Ok(commands_tx)
}

/// Commands not yet consumed by the worker.
struct Inbox {
    commands: mpsc::UnboundedReceiver<WorkerCommand>,
    backlog: VecDeque<Activate>,
    closed: bool,
}

impl Inbox {
    fn next_activation(&mut self) -> Option<Activate> {
        if self.closed {
            return None;
        }
        if let Some(activate) = self.backlog.pop_front() {
            return Some(activate);
        }
        loop {
            match self.commands.blocking_recv() {
                Some(WorkerCommand::Activate(activate)) => return Some(activate),
                Some(WorkerCommand::CapabilityResult { id, .. }) => {
                    tracing::debug!(id, "Discarding capability result with no waiting call");
                }
                Some(WorkerCommand::Cancel { .. }) => {}
                Some(WorkerCommand::Shutdown) | None => {
                    self.closed = true;
                    return None;
                }
            }
        }
    }

    /// Block until the result for `id` arrives, or `activation` is cancelled.
    /// Activations arriving in the meantime are queued; results for other ids
    /// are stale and dropped.
    fn wait_for(&mut self, activation: u64, id: u64) -> Result<Value, String> {
        if self.closed {
            return Err("sandbox worker is shutting down".to_string());
        }
        loop {
            match self.commands.blocking_recv() {
                Some(WorkerCommand::CapabilityResult { id: got, result }) if got == id => {
                    return result;
                }
                Some(WorkerCommand::CapabilityResult { id: got, .. }) => {
                    tracing::debug!(id = got, waiting = id, "Discarding stale capability result");
                }
                Some(WorkerCommand::Activate(activate)) => self.backlog.push_back(activate),
                Some(WorkerCommand::Cancel { activation: cancelled }) if cancelled == activation => {
                    return Err("activation was cancelled".to_string());
                }
                Some(WorkerCommand::Cancel { .. }) => {}
                Some(WorkerCommand::Shutdown) | None => {
                    self.closed = true;
                    return Err("sandbox worker is shutting down".to_string());
                }
            }
        }
    }
}

/// Worker-side end of the capability relay.
#[derive(Clone)]
struct HostLink {
    requests: mpsc::UnboundedSender<CapabilityRequest>,
    inbox: Arc<Mutex<Inbox>>,
    next_id: Arc<AtomicU64>,
}

impl HostLink {
    fn call(&self, activation: u64, name: &str, args: Vec<Value>) -> Result<Value, String> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.requests
            .send(CapabilityRequest {
                id,
                activation,
                name: name.to_string(),
                args,
            })
            .map_err(|_| "sandbox host is gone".to_string())?;

        let mut inbox = self
            .inbox
            .lock()
            .map_err(|_| "sandbox inbox is poisoned".to_string())?;
        inbox.wait_for(activation, id)
    }
}

struct LuaWorker {
    lua: Lua,
    make_callable: Function,
    link: HostLink,
    interrupt: Arc<Interrupt>,
}

impl LuaWorker {
    fn provision(
        commands: mpsc::UnboundedReceiver<WorkerCommand>,
        requests: mpsc::UnboundedSender<CapabilityRequest>,
        interrupt: Arc<Interrupt>,
    ) -> Result<Self, SandboxError> {
        let lua = Lua::new_with(
            StdLib::STRING | StdLib::TABLE | StdLib::MATH | StdLib::UTF8,
            LuaOptions::default(),
        )
        .map_err(|e| SandboxError::Provisioning(e.to_string()))?;

        // The call trigger fires outside the callee's `pcall`, so a script
        // cannot swallow the interrupt and keep looping.
        let flags = interrupt.clone();
        lua.set_hook(
            HookTriggers::new()
                .on_calls()
                .every_nth_instruction(INTERRUPT_INTERVAL),
            move |_lua, _debug| {
                if flags.requested() {
                    return Err(mlua::Error::runtime("activation interrupted"));
                }
                Ok(VmState::Continue)
            },
        );

        let make_callable = lua
            .load(MAKE_CALLABLE)
            .set_name("=sandbox")
            .into_function()
            .map_err(|e| SandboxError::Provisioning(e.to_string()))?;

        Ok(Self {
            lua,
            make_callable,
            link: HostLink {
                requests,
                inbox: Arc::new(Mutex::new(Inbox {
                    commands,
                    backlog: VecDeque::new(),
                    closed: false,
                })),
                next_id: Arc::new(AtomicU64::new(1)),
            },
            interrupt,
        })
    }

    fn run(self) {
        loop {
            // The inbox lock must be released before the script runs;
            // capability calls take it again.
            let activate = match self.link.inbox.lock() {
                Ok(mut inbox) => inbox.next_activation(),
                Err(_) => None,
            };
            let Some(activate) = activate else { break };
            if self.interrupt.is_shut_down() {
                break;
            }
            if activate.reply.is_closed() {
                tracing::debug!(id = activate.id, "Skipping abandoned activation");
                continue;
            }

            if self.activate(activate) {
                tracing::error!("Sandbox worker hit an unrecoverable error, stopping");
                break;
            }
        }
        tracing::debug!("Sandbox worker stopped");
    }

    /// Returns whether the worker must stop.
    fn activate(&self, activate: Activate) -> bool {
        self.interrupt.begin(activate.id);
        let logs = Arc::new(Mutex::new(Vec::new()));
        let next = Next::new();

        let outcome = self
            .execute(&activate, &next, &logs)
            .map(|()| next.take_branches());
        let fatal = matches!(&outcome, Err(e) if e.is_fatal());

        let logs = match Arc::try_unwrap(logs) {
            Ok(lines) => lines.into_inner().unwrap_or_default(),
            Err(shared) => shared.lock().map(|l| l.clone()).unwrap_or_default(),
        };
        let _ = activate.reply.send(SandboxActivation { logs, outcome });
        self.interrupt.begin(0);
        fatal
    }

    fn execute(
        &self,
        activate: &Activate,
        next: &Next,
        logs: &Arc<Mutex<Vec<String>>>,
    ) -> Result<(), SandboxError> {
        let scope = self
            .scope(activate, next, logs)
            .map_err(|e| classify(&e))?;

        let logic = self
            .lua
            .load(&*activate.script)
            .set_name(format!("={}/{}", activate.workflow, activate.node))
            .set_environment(scope)
            .into_function()
            .map_err(|e| SandboxError::LogicLoad(error_message(&e)))?;

        logic.call::<()>(()).map_err(|e| classify(&e))
    }

    /// Build the only environment the script can see.
    fn scope(
        &self,
        activate: &Activate,
        next: &Next,
        logs: &Arc<Mutex<Vec<String>>>,
    ) -> mlua::Result<Table> {
        let lua = &self.lua;
        let scope = lua.create_table()?;
        let globals = lua.globals();

        for name in PURE_GLOBALS {
            scope.set(*name, globals.get::<LuaValue>(*name)?)?;
        }
        for name in PURE_LIBRARIES {
            let library: Table = globals.get(*name)?;
            let copy = lua.create_table()?;
            for pair in library.pairs::<LuaValue, LuaValue>() {
                let (key, value) = pair?;
                copy.set(key, value)?;
            }
            scope.set(*name, copy)?;
        }

        scope.set("input", to_lua(lua, &activate.input)?)?;
        scope.set("next", self.continuation(next)?)?;
        scope.set("print", self.printer(logs)?)?;

        for path in &activate.capabilities {
            let binding = self.capability(activate.id, path)?;
            bind(lua, &scope, path, binding)?;
        }

        Ok(scope)
    }

    /// `next(target, data)` plus `next.SUCCESS` / `next.ERROR`.
    fn continuation(&self, next: &Next) -> mlua::Result<Table> {
        let recorder = next.clone();
        let call = self
            .lua
            .create_function(move |lua, (target, data): (String, LuaValue)| {
                let data: Value = lua.from_value(data)?;
                recorder.call(target, data);
                Ok(())
            })?;

        let table = self.lua.create_table()?;
        table.set("SUCCESS", SUCCESS)?;
        table.set("ERROR", ERROR)?;
        self.make_callable.call((table, call))
    }

    fn printer(&self, logs: &Arc<Mutex<Vec<String>>>) -> mlua::Result<Function> {
        let logs = logs.clone();
        self.lua.create_function(move |lua, args: Variadic<LuaValue>| {
            let line = args
                .into_iter()
                .map(|value| render(lua, value))
                .collect::<Vec<_>>()
                .join("\t");
            if let Ok(mut lines) = logs.lock() {
                lines.push(line);
            }
            Ok(())
        })
    }

    fn capability(&self, activation: u64, path: &str) -> mlua::Result<Function> {
        let link = self.link.clone();
        let name = path.to_string();
        self.lua.create_function(move |lua, args: Variadic<LuaValue>| {
            let args = args
                .into_iter()
                .map(|value| lua.from_value::<Value>(value))
                .collect::<mlua::Result<Vec<_>>>()?;

            match link.call(activation, &name, args) {
                Ok(result) => to_lua(lua, &result),
                Err(message) => Err(mlua::Error::external(CapabilityFailure {
                    name: name.clone(),
                    message,
                })),
            }
        })
    }
}

fn to_lua(lua: &Lua, value: &Value) -> mlua::Result<LuaValue> {
    let options = SerializeOptions::new()
        .serialize_none_to_null(false)
        .serialize_unit_to_null(false);
    lua.to_value_with(value, options)
}

/// Place `function` at a dot-path inside `scope`, creating tables on the way.
fn bind(lua: &Lua, scope: &Table, path: &str, function: Function) -> mlua::Result<()> {
    let mut segments: Vec<&str> = path.split('.').collect();
    let leaf = segments.pop().unwrap_or(path);

    let mut table = scope.clone();
    for segment in segments {
        table = match table.get::<LuaValue>(segment)? {
            LuaValue::Table(existing) => existing,
            _ => {
                let created = lua.create_table()?;
                table.set(segment, created.clone())?;
                created
            }
        };
    }
    table.set(leaf, function)
}

fn render(lua: &Lua, value: LuaValue) -> String {
    match value {
        LuaValue::Nil => "nil".to_string(),
        LuaValue::Boolean(b) => b.to_string(),
        LuaValue::Integer(i) => i.to_string(),
        LuaValue::Number(n) => n.to_string(),
        LuaValue::String(s) => s.to_string_lossy().to_string(),
        other => {
            let type_name = other.type_name();
            lua.from_value::<Value>(other)
                .map(|v| v.to_string())
                .unwrap_or_else(|_| format!("<{}>", type_name))
        }
    }
}

fn classify(error: &mlua::Error) -> SandboxError {
    if let Some(failure) = capability_failure(error) {
        return SandboxError::Capability {
            name: failure.name.clone(),
            message: failure.message.clone(),
        };
    }
    match error {
        mlua::Error::MemoryError(message) => {
            SandboxError::WorkerCrashed(format!("out of memory: {}", message))
        }
        other => SandboxError::Script {
            message: error_message(other),
            trace: traceback(other),
        },
    }
}

fn capability_failure(error: &mlua::Error) -> Option<&CapabilityFailure> {
    match error {
        mlua::Error::CallbackError { cause, .. } => capability_failure(cause),
        mlua::Error::WithContext { cause, .. } => capability_failure(cause),
        mlua::Error::ExternalError(inner) => inner.downcast_ref::<CapabilityFailure>(),
        _ => None,
    }
}

const TRACEBACK_MARKER: &str = "\nstack traceback:";

/// The error text without the Lua traceback.
fn error_message(error: &mlua::Error) -> String {
    let text = match error {
        mlua::Error::RuntimeError(message) => message.clone(),
        mlua::Error::SyntaxError { message, .. } => message.clone(),
        mlua::Error::CallbackError { cause, .. } => return error_message(cause),
        mlua::Error::WithContext { cause, .. } => return error_message(cause),
        other => other.to_string(),
    };
    match text.find(TRACEBACK_MARKER) {
        Some(at) => text[..at].to_string(),
        None => text,
    }
}

fn traceback(error: &mlua::Error) -> Option<String> {
    match error {
        mlua::Error::CallbackError { traceback, .. } => Some(traceback.clone()),
        mlua::Error::RuntimeError(message) => message
            .find(TRACEBACK_MARKER)
            .map(|at| message[at + 1..].to_string()),
        _ => None,
    }
}
