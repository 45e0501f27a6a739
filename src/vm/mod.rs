//! Bytecode processor
//!
//! A `Processor` owns a value stack and an execution stack and runs compiled
//! functions over them. Every coroutine gets its own processor; all processors
//! spawned from one root share a `SharedState` (globals, type metatables,
//! source registry, options and the instruction budget).
//!
//! Control never recurses in Rust for script-to-script calls, metamethods
//! that produce a value, or natives that return a tail-call request. The
//! dispatch loop is re-entered only when a native callback calls back into
//! the VM through its `ExecutionContext`, and for comparison metamethods
//! whose boolean result is needed immediately.

mod call;
mod context;
mod coroutine;
mod debug;
mod dispatch;
mod errors;
mod index;
mod ops;
mod stack;

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::{Rc, Weak};
use std::thread::{self, ThreadId};
use std::time::Duration;

use crate::bytecode;
use crate::closure::{Closure, Upvalue};
use crate::config::{LogLevel, ScriptOptions};
use crate::error::{RuntimeError, RuntimeErrorKind, ScriptError, ScriptResult};
use crate::proto::FunctionProto;
use crate::symbol::SymbolRef;
use crate::value::{
    CallbackArguments, CallbackFunction, DataType, HostTask, Table, TableRef, TypeValidationFlags,
    Value,
};

pub use context::ExecutionContext;
pub use coroutine::{Coroutine, CoroutineState};
pub use debug::{Checkpoint, DebugObserver, DynamicExpr};
pub use stack::{CallStackItem, FrameFlags, FrameFunction, FrameHandlers, ValueStack};

pub(crate) use coroutine::CoroutineInner;

/// Host calls may nest native -> script -> native at most this deep
const MAX_NESTED_CALLS: usize = 128;

/// What the dispatch loop should do next
pub(crate) enum Step {
    /// Keep executing the (possibly new) top frame at this instruction
    Continue(usize),
    /// The entry frame returned
    Return(Value),
    /// Execution stopped and can be resumed later
    Suspend(Suspension),
}

pub(crate) enum Suspension {
    Yield(Value),
    ForcedYield,
    Await(HostTask),
}

/// How a suspended processor picks up again
pub(crate) enum Resumption {
    /// Deliver the resume input as the result of this already-popped frame
    Deliver(CallStackItem),
    /// Re-execute from this instruction of the top frame
    Instruction(usize),
}

/// Stack heights at the start of one dispatch-loop invocation; unwinding
/// never pops below them
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct EntryMark {
    pub frames: usize,
    pub stack: usize,
}

/// State shared between a root processor and its coroutines
pub(crate) struct SharedState {
    pub options: ScriptOptions,
    pub globals: TableRef,
    pub sources: RefCell<Vec<Rc<str>>>,
    pub type_metatables: RefCell<HashMap<DataType, TableRef>>,
    /// Coroutines currently being resumed, innermost last
    pub coroutine_stack: RefCell<Vec<Coroutine>>,
    pub owner_thread: Cell<Option<ThreadId>>,
    pub entry_count: Cell<usize>,
    pub debugger: RefCell<Option<Rc<dyn DebugObserver>>>,
    pub debugging: Cell<bool>,
    pub instruction_count: Cell<u64>,
    pub next_coroutine_id: Cell<usize>,
    /// Iterator used by `for ... in t` over plain tables
    pub table_iterator: Value,
    /// Iterator used by `for ... in a..b`
    pub range_iterator: Value,
}

impl SharedState {
    fn new(options: ScriptOptions) -> Self {
        SharedState {
            options,
            globals: Rc::new(RefCell::new(Table::new())),
            sources: RefCell::new(Vec::new()),
            type_metatables: RefCell::new(HashMap::new()),
            coroutine_stack: RefCell::new(Vec::new()),
            owner_thread: Cell::new(None),
            entry_count: Cell::new(0),
            debugger: RefCell::new(None),
            debugging: Cell::new(false),
            instruction_count: Cell::new(0),
            next_coroutine_id: Cell::new(1),
            table_iterator: Value::new_callback(CallbackFunction::new("next", table_next)),
            range_iterator: Value::new_callback(CallbackFunction::new("range", range_next)),
        }
    }
}

fn table_next(_ctx: &mut ExecutionContext<'_>, args: CallbackArguments) -> ScriptResult<Value> {
    let table = args.as_type(0, "next", DataType::Table, TypeValidationFlags::NONE)?;
    let table = table
        .as_table()
        .ok_or_else(|| ScriptError::internal("checked table argument"))?;
    let entry = table.borrow().next(&args.get(1).to_scalar())?;
    Ok(match entry {
        Some(pair) => Value::new_tuple(vec![pair.key, pair.value]),
        None => Value::Nil,
    })
}

fn range_next(_ctx: &mut ExecutionContext<'_>, args: CallbackArguments) -> ScriptResult<Value> {
    let range = match args.get(0) {
        Value::Range(r) => r,
        other => return Err(RuntimeError::bad_argument(1, "range", "range", &other).into()),
    };
    let current = args.get(1).as_number();
    Ok(range.next_after(current).map(Value::Number).unwrap_or(Value::Nil))
}

/// Executes compiled functions
pub struct Processor {
    pub(crate) stack: ValueStack,
    pub(crate) frames: Vec<CallStackItem>,
    pub(crate) shared: Rc<SharedState>,
    /// Owning coroutine, for coroutine processors
    pub(crate) coroutine: Option<Weak<CoroutineInner>>,
    /// Host calls currently nested inside this processor's dispatch loop
    pub(crate) nested_calls: usize,
    pub(crate) async_mode: bool,
    pub(crate) pending: Option<(Resumption, EntryMark)>,
    /// Instructions between forced yields; 0 disables
    pub(crate) auto_yield_budget: u64,
    pub(crate) since_resume: u64,
}

impl Processor {
    /// Create a root processor with a fresh global table
    pub fn new(options: ScriptOptions) -> Self {
        vm_log!(options, LogLevel::Debug, "VM", "creating processor: {:?}", options);
        Processor::with_shared(Rc::new(SharedState::new(options)), None)
    }

    pub(crate) fn with_shared(shared: Rc<SharedState>, coroutine: Option<Weak<CoroutineInner>>) -> Self {
        Processor {
            stack: ValueStack::new(),
            frames: Vec::new(),
            shared,
            coroutine,
            nested_calls: 0,
            async_mode: false,
            pending: None,
            auto_yield_budget: 0,
            since_resume: 0,
        }
    }

    pub fn options(&self) -> &ScriptOptions {
        &self.shared.options
    }

    pub fn globals(&self) -> TableRef {
        self.shared.globals.clone()
    }

    /// Register a chunk name; the returned id goes into `SourceRef::source_id`
    pub fn register_source(&self, name: &str) -> u32 {
        let mut sources = self.shared.sources.borrow_mut();
        sources.push(name.into());
        (sources.len() - 1) as u32
    }

    pub fn source_name(&self, id: u32) -> String {
        self.shared
            .sources
            .borrow()
            .get(id as usize)
            .map(|s| s.to_string())
            .unwrap_or_else(|| format!("chunk_{}", id))
    }

    /// Metatable applied to every value of `data_type` lacking its own
    pub fn set_type_metatable(&self, data_type: DataType, metatable: Option<TableRef>) {
        let mut tables = self.shared.type_metatables.borrow_mut();
        match metatable {
            Some(mt) => tables.insert(data_type, mt),
            None => tables.remove(&data_type),
        };
    }

    pub fn type_metatable(&self, data_type: DataType) -> Option<TableRef> {
        self.shared.type_metatables.borrow().get(&data_type).cloned()
    }

    pub fn attach_debugger(&self, observer: Rc<dyn DebugObserver>) {
        *self.shared.debugger.borrow_mut() = Some(observer);
        self.shared.debugging.set(true);
    }

    pub fn detach_debugger(&self) {
        self.shared.debugging.set(false);
        *self.shared.debugger.borrow_mut() = None;
    }

    /// Instructions executed so far by this processor tree
    pub fn instruction_count(&self) -> u64 {
        self.shared.instruction_count.get()
    }

    /// Current execution stack depth
    pub fn call_depth(&self) -> usize {
        self.frames.len()
    }

    /// The coroutine being resumed right now, if any
    pub fn current_coroutine(&self) -> Option<Coroutine> {
        self.shared.coroutine_stack.borrow().last().cloned()
    }

    /// Whether a native running now may return a yield request
    pub fn is_yieldable(&self) -> bool {
        self.coroutine.is_some() && self.nested_calls == 0
    }

    /// Wrap a compiled chunk into a callable closure.
    ///
    /// Only an `_ENV` capture can be satisfied here; it is bound to the
    /// global table.
    pub fn load(&self, proto: Rc<FunctionProto>) -> ScriptResult<Value> {
        let mut upvalues = Vec::with_capacity(proto.upvalues.len());
        for desc in &proto.upvalues {
            match desc {
                SymbolRef::DefaultEnv => {}
                other if other.name() == "_ENV" => {}
                other => {
                    return Err(ScriptError::runtime(format!(
                        "cannot load function '{}': upvalue '{}' cannot be bound",
                        proto.name,
                        other.name()
                    )))
                }
            }
            upvalues.push(Upvalue::new_closed(Value::Table(self.globals())));
        }
        vm_log!(self.shared.options, LogLevel::Verbose, "VM", "loaded function '{}'", proto.name);
        Ok(Value::new_closure(Closure::new(proto, upvalues)))
    }

    /// Call `function` and wait for its result.
    ///
    /// Host tasks returned by natives are blocked on when `auto_await` is
    /// set; otherwise they raise an error.
    pub fn call(&mut self, function: &Value, args: Vec<Value>) -> ScriptResult<Value> {
        self.enter()?;
        let result = self.call_nested(function.clone(), args);
        self.leave();
        result
    }

    /// `object:method(args...)`
    pub fn this_call(&mut self, object: &Value, method: &str, args: Vec<Value>) -> ScriptResult<Value> {
        self.enter()?;
        let result = self.method_call(object, method, args);
        self.leave();
        result
    }

    fn method_call(&mut self, object: &Value, method: &str, mut args: Vec<Value>) -> ScriptResult<Value> {
        let function = self.index_nested(object.clone(), Value::new_string(method))?;
        args.insert(0, object.clone());
        let argc = args.len();
        self.nested_calls += 1;
        let mark = self.mark();
        self.stack.push(function);
        self.stack.extend(args);
        let first = self.perform_call(
            argc,
            0,
            FrameFlags::CALL_ENTRY_POINT | FrameFlags::METHOD_CALL,
            FrameHandlers::default(),
            Some(method.into()),
        );
        let result = self.run_from(first, mark, 0);
        self.nested_calls -= 1;
        Self::expect_return(result)
    }

    /// Call `function`, suspending on host tasks instead of blocking
    pub async fn call_async(&mut self, function: &Value, args: Vec<Value>) -> ScriptResult<Value> {
        self.enter()?;
        let result = self.drive_async(function.clone(), args).await;
        self.leave();
        result
    }

    /// `object:method(args...)`, suspending on host tasks
    pub async fn this_call_async(
        &mut self,
        object: &Value,
        method: &str,
        mut args: Vec<Value>,
    ) -> ScriptResult<Value> {
        self.enter()?;
        let result = match self.index_nested(object.clone(), Value::new_string(method)) {
            Ok(function) => {
                args.insert(0, object.clone());
                self.drive_async(function, args).await
            }
            Err(e) => Err(e),
        };
        self.leave();
        result
    }

    /// `call_async` bounded by a wall-clock timeout. Must run inside a tokio
    /// runtime with the time driver enabled.
    pub async fn call_async_with_timeout(
        &mut self,
        function: &Value,
        args: Vec<Value>,
        timeout: Duration,
    ) -> ScriptResult<Value> {
        let outcome = tokio::time::timeout(timeout, self.call_async(function, args)).await;
        match outcome {
            Ok(result) => result,
            Err(_) => {
                vm_log!(self.shared.options, LogLevel::Warning, "VM", "script call timed out after {:?}", timeout);
                // the dropped call left its frames and its entry behind
                self.abandon(EntryMark::default());
                self.pending = None;
                self.async_mode = false;
                self.nested_calls = 0;
                self.leave();
                Err(ScriptError::runtime(format!("script call timed out after {:?}", timeout)))
            }
        }
    }

    async fn drive_async(&mut self, function: Value, args: Vec<Value>) -> ScriptResult<Value> {
        if self.nested_calls > 0 || !self.frames.is_empty() {
            return Err(ScriptError::runtime(
                "cannot start an asynchronous call while the processor is running",
            ));
        }
        let previous = std::mem::replace(&mut self.async_mode, true);
        let mut step = self.execute_call(function, args, FrameFlags::NONE);
        let result = loop {
            match step {
                Ok(Step::Suspend(Suspension::Await(task))) => {
                    let input = task.await;
                    step = self.resume_pending(input, true);
                }
                other => break Self::expect_return(other),
            }
        };
        self.async_mode = previous;
        result
    }

    /// Create a coroutine running `function` on a fresh processor
    pub fn create_coroutine(&self, function: Value) -> ScriptResult<Coroutine> {
        Coroutine::new(&self.shared, function)
    }

    /// Serialize a script function
    pub fn dump(&self, function: &Value) -> ScriptResult<Vec<u8>> {
        let closure = match function {
            Value::Function(c) => c,
            other => {
                return Err(ScriptError::runtime(format!(
                    "cannot dump a {} value",
                    other.type_name()
                )))
            }
        };
        let captures_only_env = closure
            .proto()
            .upvalues
            .iter()
            .all(|u| matches!(u, SymbolRef::DefaultEnv) || u.name() == "_ENV");
        if !captures_only_env {
            return Err(ScriptError::runtime(
                "function arguments with upvalues other than _ENV cannot be dumped",
            ));
        }
        let bytes = bytecode::dump(closure.proto())?;
        vm_log!(self.shared.options, LogLevel::Debug, "BYTECODE", "dumped '{}': {} bytes", closure.name(), bytes.len());
        Ok(bytes)
    }

    /// Load a function serialized by `dump`
    pub fn undump(&self, bytes: &[u8]) -> ScriptResult<Value> {
        let proto = bytecode::undump(bytes)?;
        vm_log!(
            self.shared.options,
            LogLevel::Debug,
            "BYTECODE",
            "undumped '{}': {} instructions, {} nested functions",
            proto.name,
            proto.code.len(),
            proto.protos.len()
        );
        self.load(Rc::new(proto))
    }

    /// Soft check that the runtime is driven from one OS thread at a time
    pub(crate) fn enter(&self) -> ScriptResult<()> {
        let shared = &self.shared;
        if shared.options.check_thread_access {
            let me = thread::current().id();
            match shared.owner_thread.get() {
                Some(owner) if owner != me && shared.entry_count.get() > 0 => {
                    vm_log!(shared.options, LogLevel::Warning, "VM", "runtime entered from {:?} while owned by {:?}", me, owner);
                    return Err(ScriptError::ConcurrentAccess);
                }
                _ => shared.owner_thread.set(Some(me)),
            }
        }
        shared.entry_count.set(shared.entry_count.get() + 1);
        Ok(())
    }

    pub(crate) fn leave(&self) {
        let count = self.shared.entry_count.get().saturating_sub(1);
        self.shared.entry_count.set(count);
        if count == 0 {
            self.shared.owner_thread.set(None);
        }
    }

    pub(crate) fn mark(&self) -> EntryMark {
        EntryMark {
            frames: self.frames.len(),
            stack: self.stack.len(),
        }
    }

    /// Run `function` to completion from inside the current activation
    pub(crate) fn call_nested(&mut self, function: Value, args: Vec<Value>) -> ScriptResult<Value> {
        if self.nested_calls >= MAX_NESTED_CALLS {
            return Err(RuntimeError::new(
                RuntimeErrorKind::StackOverflow,
                "stack overflow (too many nested host calls)",
            )
            .into());
        }
        self.nested_calls += 1;
        let result = self.execute_call(function, args, FrameFlags::NONE);
        self.nested_calls -= 1;
        Self::expect_return(result)
    }

    fn expect_return(step: ScriptResult<Step>) -> ScriptResult<Value> {
        match step? {
            Step::Return(value) => Ok(value),
            Step::Suspend(_) => Err(ScriptError::internal("suspension escaped a nested call")),
            Step::Continue(_) => Err(ScriptError::internal("dispatch loop exited early")),
        }
    }
}

impl Default for Processor {
    fn default() -> Self {
        Processor::new(ScriptOptions::default())
    }
}
