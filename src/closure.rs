//! Closures and captured variable cells

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use crate::proto::FunctionProto;
use crate::value::Value;
use crate::vm::ValueStack;

/// Shared handle to an upvalue cell
pub type UpvalueRef = Rc<Upvalue>;

/// Lifecycle state of an upvalue cell
pub enum UpvalueState {
    /// Aliases a live slot of some processor's value stack
    Open { stack: ValueStack, index: usize },

    /// Owns the value after the declaring scope exited
    Closed(Value),
}

/// A captured variable shared by every closure that captured it
pub struct Upvalue {
    state: RefCell<UpvalueState>,
}

impl Upvalue {
    pub fn new_open(stack: ValueStack, index: usize) -> UpvalueRef {
        Rc::new(Upvalue {
            state: RefCell::new(UpvalueState::Open { stack, index }),
        })
    }

    pub fn new_closed(value: Value) -> UpvalueRef {
        Rc::new(Upvalue {
            state: RefCell::new(UpvalueState::Closed(value)),
        })
    }

    pub fn get(&self) -> Value {
        match &*self.state.borrow() {
            UpvalueState::Open { stack, index } => stack.get(*index),
            UpvalueState::Closed(value) => value.clone(),
        }
    }

    pub fn set(&self, value: Value) {
        let mut state = self.state.borrow_mut();
        match &mut *state {
            UpvalueState::Open { stack, index } => stack.set(*index, value),
            UpvalueState::Closed(slot) => *slot = value,
        }
    }

    /// Detach from the stack, taking ownership of the slot's current value.
    /// Closing an already closed cell does nothing.
    pub fn close(&self) {
        let mut state = self.state.borrow_mut();
        let value = match &*state {
            UpvalueState::Open { stack, index } => stack.get(*index),
            UpvalueState::Closed(_) => return,
        };
        *state = UpvalueState::Closed(value);
    }

    pub fn is_open(&self) -> bool {
        matches!(&*self.state.borrow(), UpvalueState::Open { .. })
    }

    /// Stack slot aliased while open
    pub fn stack_index(&self) -> Option<usize> {
        match &*self.state.borrow() {
            UpvalueState::Open { index, .. } => Some(*index),
            UpvalueState::Closed(_) => None,
        }
    }
}

impl fmt::Debug for Upvalue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &*self.state.borrow() {
            UpvalueState::Open { index, .. } => write!(f, "Upvalue(open @{})", index),
            UpvalueState::Closed(v) => write!(f, "Upvalue(closed {:?})", v),
        }
    }
}

/// A compiled function together with its captured upvalues
pub struct Closure {
    proto: Rc<FunctionProto>,
    upvalues: Vec<UpvalueRef>,
}

impl Closure {
    pub fn new(proto: Rc<FunctionProto>, upvalues: Vec<UpvalueRef>) -> Self {
        Closure { proto, upvalues }
    }

    pub fn proto(&self) -> &Rc<FunctionProto> {
        &self.proto
    }

    pub fn upvalues(&self) -> &[UpvalueRef] {
        &self.upvalues
    }

    pub fn upvalue(&self, index: usize) -> Option<&UpvalueRef> {
        self.upvalues.get(index)
    }

    pub fn name(&self) -> &str {
        &self.proto.name
    }
}

impl fmt::Debug for Closure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Closure({}, {} upvalues)", self.proto.name, self.upvalues.len())
    }
}
