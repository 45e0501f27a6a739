//! Value stack and activation records

use std::cell::RefCell;
use std::ops::BitOr;
use std::rc::Rc;

use crate::closure::UpvalueRef;
use crate::error::{ScriptError, ScriptResult};
use crate::value::{CallbackFunction, ClosureRef, Value};

/// Shared operand stack of one processor.
///
/// Open upvalues hold a clone of the handle and index into it, so the VM
/// never keeps a borrow alive across a call that could read an upvalue.
#[derive(Clone, Default)]
pub struct ValueStack(Rc<RefCell<Vec<Value>>>);

impl ValueStack {
    pub fn new() -> Self {
        ValueStack(Rc::new(RefCell::new(Vec::with_capacity(256))))
    }

    pub fn push(&self, value: Value) {
        self.0.borrow_mut().push(value);
    }

    pub fn pop(&self) -> ScriptResult<Value> {
        self.0
            .borrow_mut()
            .pop()
            .ok_or_else(|| ScriptError::internal("value stack underflow"))
    }

    /// Value `offset` slots below the top
    pub fn peek(&self, offset: usize) -> ScriptResult<Value> {
        let stack = self.0.borrow();
        stack
            .len()
            .checked_sub(offset + 1)
            .map(|i| stack[i].clone())
            .ok_or_else(|| ScriptError::internal("value stack underflow"))
    }

    /// Replace the value `offset` slots below the top
    pub fn poke(&self, offset: usize, value: Value) -> ScriptResult<()> {
        let mut stack = self.0.borrow_mut();
        let index = stack
            .len()
            .checked_sub(offset + 1)
            .ok_or_else(|| ScriptError::internal("value stack underflow"))?;
        stack[index] = value;
        Ok(())
    }

    /// Absolute read; out-of-range slots read as nil
    pub fn get(&self, index: usize) -> Value {
        self.0.borrow().get(index).cloned().unwrap_or(Value::Nil)
    }

    /// Absolute write; out-of-range writes are ignored
    pub fn set(&self, index: usize, value: Value) {
        if let Some(slot) = self.0.borrow_mut().get_mut(index) {
            *slot = value;
        }
    }

    pub fn len(&self) -> usize {
        self.0.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.borrow().is_empty()
    }

    pub fn truncate(&self, len: usize) {
        self.0.borrow_mut().truncate(len);
    }

    /// Remove and return everything from `at` upwards
    pub fn split_off(&self, at: usize) -> ScriptResult<Vec<Value>> {
        let mut stack = self.0.borrow_mut();
        if at > stack.len() {
            return Err(ScriptError::internal("value stack underflow"));
        }
        Ok(stack.split_off(at))
    }

    pub fn extend(&self, values: impl IntoIterator<Item = Value>) {
        self.0.borrow_mut().extend(values);
    }

    pub fn swap(&self, a: usize, b: usize) -> ScriptResult<()> {
        let mut stack = self.0.borrow_mut();
        let len = stack.len();
        if a >= len || b >= len {
            return Err(ScriptError::internal("value stack underflow"));
        }
        stack.swap(len - 1 - a, len - 1 - b);
        Ok(())
    }

    pub fn ptr_eq(&self, other: &ValueStack) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

/// Flags on an activation record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FrameFlags(u8);

impl FrameFlags {
    pub const NONE: FrameFlags = FrameFlags(0);
    /// Called with method syntax
    pub const METHOD_CALL: FrameFlags = FrameFlags(1);
    /// Reused a caller frame through tail-call optimization
    pub const TAIL_CALL: FrameFlags = FrameFlags(2);
    /// Bottom frame of one dispatch-loop invocation; returning from it or
    /// unwinding past it leaves the loop
    pub const CALL_ENTRY_POINT: FrameFlags = FrameFlags(4);
    /// First frame of a coroutine body
    pub const RESUME_ENTRY_POINT: FrameFlags = FrameFlags(8);
    /// The caller does not want the result (e.g. `__newindex` handlers)
    pub const DISCARD_RESULT: FrameFlags = FrameFlags(16);
    /// The result is collapsed to a scalar before delivery
    pub const SCALAR_RESULT: FrameFlags = FrameFlags(32);

    /// Flags a replacement frame inherits from the frame it replaces
    pub const INHERITED: FrameFlags = FrameFlags(4 | 8 | 16 | 32);

    pub fn contains(self, other: FrameFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn intersect(self, other: FrameFlags) -> FrameFlags {
        FrameFlags(self.0 & other.0)
    }
}

impl BitOr for FrameFlags {
    type Output = FrameFlags;

    fn bitor(self, rhs: FrameFlags) -> FrameFlags {
        FrameFlags(self.0 | rhs.0)
    }
}

/// What an activation is running
#[derive(Clone)]
pub enum FrameFunction {
    Script(ClosureRef),
    Native(Rc<CallbackFunction>),
}

/// Handlers attached to a frame by a tail-call request
#[derive(Clone, Default)]
pub struct FrameHandlers {
    pub continuation: Option<Rc<CallbackFunction>>,
    pub error_handler: Option<Rc<CallbackFunction>>,
    pub error_handler_before_unwind: Option<Value>,
}

impl FrameHandlers {
    pub fn is_empty(&self) -> bool {
        self.continuation.is_none()
            && self.error_handler.is_none()
            && self.error_handler_before_unwind.is_none()
    }
}

/// One activation record on the execution stack
#[derive(Clone)]
pub struct CallStackItem {
    /// Script frames: slot of local 0 (the function sits just below).
    /// Native frames: stack height once the call's operands were popped.
    pub base_pointer: usize,
    /// Number of arguments the caller passed
    pub argc: usize,
    /// Instruction of the caller to continue at once this frame returns
    pub return_address: usize,
    pub function: FrameFunction,
    /// Name the caller used for the callee, if known
    pub name: Option<Rc<str>>,
    pub open_upvalues: Vec<UpvalueRef>,
    pub handlers: FrameHandlers,
    pub flags: FrameFlags,
}

impl CallStackItem {
    pub fn is_native(&self) -> bool {
        matches!(self.function, FrameFunction::Native(_))
    }

    pub fn closure(&self) -> Option<&ClosureRef> {
        match &self.function {
            FrameFunction::Script(c) => Some(c),
            FrameFunction::Native(_) => None,
        }
    }

    /// Name for stack traces: the caller-side name, else the function's own
    pub fn display_name(&self) -> String {
        if let Some(name) = &self.name {
            return name.to_string();
        }
        match &self.function {
            FrameFunction::Script(c) => c.name().to_string(),
            FrameFunction::Native(cb) => cb.name().to_string(),
        }
    }

    /// Close every open upvalue aliasing a slot at or above `from`
    pub fn close_upvalues(&mut self, from: usize) {
        self.open_upvalues.retain(|up| match up.stack_index() {
            Some(index) if index >= from => {
                up.close();
                false
            }
            Some(_) => true,
            None => false,
        });
    }
}
