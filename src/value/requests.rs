//! Control-flow sentinel payloads returned by native callbacks
//!
//! Natives never re-enter the dispatch loop to perform tail calls, yields or
//! awaits. They return one of these requests and the processor acts on it
//! once the native frame has been popped.

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use futures::future::LocalBoxFuture;

use super::{CallbackFunction, Value};
use crate::error::{ScriptError, ScriptResult};

/// A host asynchronous operation awaited by a script
pub type HostTask = LocalBoxFuture<'static, ScriptResult<Value>>;

/// A call to perform in place of the native that returned it
pub struct TailCallData {
    /// Function to call
    pub function: Value,

    /// Arguments for the call
    pub args: Vec<Value>,

    /// Invoked with the call's result; its return value becomes the result
    pub continuation: Option<Rc<CallbackFunction>>,

    /// Invoked with the error message if the call raises; its return value
    /// becomes the result and execution resumes normally
    pub error_handler: Option<Rc<CallbackFunction>>,

    /// Invoked with the error message before any frame unwinds; its return
    /// value replaces the decorated message
    pub error_handler_before_unwind: Option<Value>,
}

impl TailCallData {
    pub fn new(function: Value, args: Vec<Value>) -> Self {
        TailCallData {
            function,
            args,
            continuation: None,
            error_handler: None,
            error_handler_before_unwind: None,
        }
    }

    pub fn with_continuation(mut self, continuation: CallbackFunction) -> Self {
        self.continuation = Some(Rc::new(continuation));
        self
    }

    pub fn with_error_handler(mut self, handler: CallbackFunction) -> Self {
        self.error_handler = Some(Rc::new(handler));
        self
    }

    pub fn with_unwind_decorator(mut self, decorator: Value) -> Self {
        self.error_handler_before_unwind = Some(decorator);
        self
    }
}

/// Values handed back to the resumer of a coroutine
#[derive(Debug)]
pub struct YieldRequest {
    values: Vec<Value>,
}

impl YieldRequest {
    pub fn new(values: Vec<Value>) -> Self {
        YieldRequest { values }
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }
}

/// A pending host task; it can be taken exactly once
pub struct AwaitRequest {
    task: RefCell<Option<HostTask>>,
}

impl AwaitRequest {
    pub fn new(task: HostTask) -> Self {
        AwaitRequest {
            task: RefCell::new(Some(task)),
        }
    }

    pub(crate) fn take_task(&self) -> ScriptResult<HostTask> {
        self.task
            .borrow_mut()
            .take()
            .ok_or_else(|| ScriptError::internal("await request already consumed"))
    }
}

impl fmt::Debug for AwaitRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let pending = self.task.borrow().is_some();
        write!(f, "AwaitRequest(pending: {})", pending)
    }
}
