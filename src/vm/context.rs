//! Execution context handed to native callbacks

use std::rc::Rc;

use super::{Coroutine, Processor};
use crate::error::ScriptResult;
use crate::value::{CallbackFunction, DataType, TableRef, Value};

/// Access to the running processor from inside a native callback.
///
/// Calls made through the context run to completion before returning; a
/// native that wants the VM to continue with another function (and be able
/// to yield) returns a tail-call request instead.
pub struct ExecutionContext<'a> {
    processor: &'a mut Processor,
    callback: Rc<CallbackFunction>,
}

impl<'a> ExecutionContext<'a> {
    pub(crate) fn new(processor: &'a mut Processor, callback: Rc<CallbackFunction>) -> Self {
        ExecutionContext {
            processor,
            callback,
        }
    }

    /// Name of the callback being executed
    pub fn callback_name(&self) -> &str {
        self.callback.name()
    }

    /// Call a script or native function and wait for its result
    pub fn call(&mut self, function: &Value, args: Vec<Value>) -> ScriptResult<Value> {
        self.processor.call_nested(function.clone(), args)
    }

    /// `object[key]`, honoring `__index`
    pub fn index(&mut self, object: &Value, key: Value) -> ScriptResult<Value> {
        self.processor.index_nested(object.clone(), key)
    }

    pub fn globals(&self) -> TableRef {
        self.processor.globals()
    }

    pub fn metatable(&self, value: &Value) -> Option<TableRef> {
        self.processor.get_metatable(value)
    }

    pub fn metamethod(&self, value: &Value, name: &str) -> Option<Value> {
        self.processor.get_metamethod(value, name)
    }

    pub fn type_metatable(&self, data_type: DataType) -> Option<TableRef> {
        self.processor.type_metatable(data_type)
    }

    pub fn current_coroutine(&self) -> Option<Coroutine> {
        self.processor.current_coroutine()
    }

    pub fn create_coroutine(&self, function: Value) -> ScriptResult<Coroutine> {
        self.processor.create_coroutine(function)
    }

    /// Whether returning a yield request from this callback is allowed
    pub fn is_yieldable(&self) -> bool {
        self.processor.is_yieldable()
    }

    pub fn call_depth(&self) -> usize {
        self.processor.call_depth()
    }

    pub fn processor(&mut self) -> &mut Processor {
        self.processor
    }
}
