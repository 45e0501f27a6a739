//! Coroutines: cooperative threads, each running on its own processor

use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;

use super::{FrameFlags, Processor, SharedState, Step, Suspension};
use crate::config::LogLevel;
use crate::error::{RuntimeError, ScriptError, ScriptResult};
use crate::value::Value;

/// Lifecycle of a coroutine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoroutineState {
    /// Created, never resumed
    NotStarted,
    /// Stopped at a yield
    Suspended,
    /// Stopped by the auto-yield budget
    ForceSuspended,
    /// Currently executing (possibly awaiting a host task)
    Running,
    /// Returned or raised
    Dead,
}

impl fmt::Display for CoroutineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CoroutineState::NotStarted | CoroutineState::Suspended | CoroutineState::ForceSuspended => {
                "suspended"
            }
            CoroutineState::Running => "running",
            CoroutineState::Dead => "dead",
        };
        f.write_str(name)
    }
}

pub(crate) struct CoroutineInner {
    id: usize,
    function: Value,
    shared: Rc<SharedState>,
    state: Cell<CoroutineState>,
    processor: RefCell<Processor>,
}

/// Handle to a coroutine; clones refer to the same coroutine
#[derive(Clone)]
pub struct Coroutine(Rc<CoroutineInner>);

impl Coroutine {
    pub(crate) fn new(shared: &Rc<SharedState>, function: Value) -> ScriptResult<Coroutine> {
        if !function.is_callable_directly() {
            return Err(RuntimeError::bad_argument(1, "create", "function", &function).into());
        }
        let id = shared.next_coroutine_id.get();
        shared.next_coroutine_id.set(id + 1);
        let inner = Rc::new_cyclic(|weak| CoroutineInner {
            id,
            function,
            shared: shared.clone(),
            state: Cell::new(CoroutineState::NotStarted),
            processor: RefCell::new(Processor::with_shared(shared.clone(), Some(weak.clone()))),
        });
        vm_log!(shared.options, LogLevel::Debug, "COROUTINE", "created coroutine #{}", id);
        Ok(Coroutine(inner))
    }

    pub fn id(&self) -> usize {
        self.0.id
    }

    pub fn state(&self) -> CoroutineState {
        self.0.state.get()
    }

    /// The body function
    pub fn function(&self) -> &Value {
        &self.0.function
    }

    /// Force a yield every `instructions` instructions; 0 disables
    pub fn set_auto_yield(&self, instructions: u64) {
        if let Ok(mut processor) = self.0.processor.try_borrow_mut() {
            processor.auto_yield_budget = instructions;
        }
    }

    pub fn ptr_eq(&self, other: &Coroutine) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    pub(crate) fn address(&self) -> usize {
        Rc::as_ptr(&self.0) as *const u8 as usize
    }

    /// Run until the body yields, returns or raises.
    ///
    /// Returns the yielded values (as a tuple when several), the body's
    /// return value once it finishes, or `Void` after a forced yield.
    pub fn resume(&self, args: Vec<Value>) -> ScriptResult<Value> {
        let state = self.begin_resume(&args)?;
        let step = match self.0.processor.try_borrow_mut() {
            Ok(mut processor) => match processor.enter() {
                Ok(()) => {
                    let step = processor.resume_from(&self.0.function, state, args);
                    processor.leave();
                    step
                }
                Err(e) => Err(e),
            },
            Err(_) => Err(ScriptError::internal("coroutine processor already borrowed")),
        };
        self.end_resume(step)
    }

    /// Like `resume`, but host tasks awaited by the body suspend this future
    /// instead of blocking
    pub async fn resume_async(&self, args: Vec<Value>) -> ScriptResult<Value> {
        let state = self.begin_resume(&args)?;
        let mut step = match self.0.processor.try_borrow_mut() {
            Ok(mut processor) => {
                processor.async_mode = true;
                processor.resume_from(&self.0.function, state, args)
            }
            Err(_) => Err(ScriptError::internal("coroutine processor already borrowed")),
        };
        loop {
            match step {
                Ok(Step::Suspend(Suspension::Await(task))) => {
                    let input = task.await;
                    step = match self.0.processor.try_borrow_mut() {
                        Ok(mut processor) => processor.resume_pending(input, true),
                        Err(_) => Err(ScriptError::internal("coroutine processor already borrowed")),
                    };
                }
                other => {
                    if let Ok(mut processor) = self.0.processor.try_borrow_mut() {
                        processor.async_mode = false;
                    }
                    return self.end_resume(other);
                }
            }
        }
    }

    fn begin_resume(&self, args: &[Value]) -> ScriptResult<CoroutineState> {
        let state = self.state();
        match state {
            CoroutineState::ForceSuspended if !args.is_empty() => {
                return Err(RuntimeError::coroutine(
                    "cannot pass values to a coroutine suspended by auto-yield",
                )
                .into())
            }
            CoroutineState::Dead => {
                return Err(RuntimeError::coroutine("cannot resume dead coroutine").into())
            }
            CoroutineState::Running => {
                return Err(RuntimeError::coroutine("cannot resume non-suspended coroutine").into())
            }
            _ => {}
        }
        let shared = &self.0.shared;
        vm_log!(shared.options, LogLevel::Debug, "COROUTINE", "resuming coroutine #{} ({:?})", self.0.id, state);
        self.0.state.set(CoroutineState::Running);
        shared.coroutine_stack.borrow_mut().push(self.clone());
        Ok(state)
    }

    fn end_resume(&self, step: ScriptResult<Step>) -> ScriptResult<Value> {
        let shared = &self.0.shared;
        shared.coroutine_stack.borrow_mut().pop();
        let (state, result) = match step {
            Ok(Step::Return(value)) => (CoroutineState::Dead, Ok(value)),
            Ok(Step::Suspend(Suspension::Yield(values))) => (CoroutineState::Suspended, Ok(values)),
            Ok(Step::Suspend(Suspension::ForcedYield)) => (CoroutineState::ForceSuspended, Ok(Value::Void)),
            Ok(Step::Suspend(Suspension::Await(_))) => (
                CoroutineState::Dead,
                Err(ScriptError::internal("host task escaped a synchronous resume")),
            ),
            Ok(Step::Continue(_)) => (
                CoroutineState::Dead,
                Err(ScriptError::internal("coroutine dispatch loop exited early")),
            ),
            Err(e) => (CoroutineState::Dead, Err(e)),
        };
        vm_log!(shared.options, LogLevel::Debug, "COROUTINE", "coroutine #{} is now {:?}", self.0.id, state);
        self.0.state.set(state);
        result
    }
}

impl fmt::Debug for Coroutine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Coroutine(#{}, {:?})", self.0.id, self.0.state.get())
    }
}

impl Processor {
    /// Start or continue the coroutine body according to `state`
    pub(crate) fn resume_from(
        &mut self,
        function: &Value,
        state: CoroutineState,
        args: Vec<Value>,
    ) -> ScriptResult<Step> {
        self.since_resume = 0;
        match state {
            CoroutineState::NotStarted => {
                self.execute_call(function.clone(), args, FrameFlags::RESUME_ENTRY_POINT)
            }
            CoroutineState::Suspended => self.resume_pending(Ok(Value::new_tuple(args)), false),
            CoroutineState::ForceSuspended => self.resume_pending(Ok(Value::Void), false),
            CoroutineState::Running | CoroutineState::Dead => Err(ScriptError::internal(format!(
                "resume_from called on a {:?} coroutine",
                state
            ))),
        }
    }
}
