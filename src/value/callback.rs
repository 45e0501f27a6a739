//! Native (host) functions callable from scripts

use std::fmt;

use super::{DataType, TypeValidationFlags, Value};
use crate::error::ScriptResult;
use crate::vm::ExecutionContext;

/// Signature of a native callback
pub type NativeFn = dyn Fn(&mut ExecutionContext<'_>, CallbackArguments) -> ScriptResult<Value>;

/// A named native function
pub struct CallbackFunction {
    name: String,
    func: Box<NativeFn>,
}

impl CallbackFunction {
    pub fn new<F>(name: impl Into<String>, func: F) -> Self
    where
        F: Fn(&mut ExecutionContext<'_>, CallbackArguments) -> ScriptResult<Value> + 'static,
    {
        CallbackFunction {
            name: name.into(),
            func: Box::new(func),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn invoke(
        &self,
        ctx: &mut ExecutionContext<'_>,
        args: CallbackArguments,
    ) -> ScriptResult<Value> {
        (self.func)(ctx, args)
    }
}

impl fmt::Debug for CallbackFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CallbackFunction({})", self.name)
    }
}

/// Arguments passed to a native callback.
///
/// A trailing tuple argument is expanded in place, so `f(1, g())` where `g`
/// returns two values presents three arguments.
#[derive(Debug, Clone)]
pub struct CallbackArguments {
    args: Vec<Value>,
    is_method_call: bool,
}

impl CallbackArguments {
    pub fn new(mut args: Vec<Value>, is_method_call: bool) -> Self {
        if let Some(Value::Tuple(last)) = args.last().cloned() {
            args.pop();
            args.extend(last.iter().cloned());
        }
        for arg in args.iter_mut() {
            if let Value::Tuple(_) = arg {
                *arg = arg.to_scalar();
            }
        }
        CallbackArguments { args, is_method_call }
    }

    pub fn len(&self) -> usize {
        self.args.len()
    }

    pub fn is_empty(&self) -> bool {
        self.args.is_empty()
    }

    /// Whether the call was made with method syntax (`obj:m()`)
    pub fn is_method_call(&self) -> bool {
        self.is_method_call
    }

    /// Argument `index` (0-based), `Void` when missing
    pub fn get(&self, index: usize) -> Value {
        self.args.get(index).cloned().unwrap_or(Value::Void)
    }

    /// Argument `index` validated against `expected`
    pub fn as_type(
        &self,
        index: usize,
        func_name: &str,
        expected: DataType,
        flags: TypeValidationFlags,
    ) -> ScriptResult<Value> {
        // `self` is not counted in error messages for method calls
        let arg_num = if self.is_method_call { index } else { index + 1 };
        self.get(index).check_type(func_name, expected, arg_num, flags)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Value> {
        self.args.iter()
    }

    pub fn into_vec(self) -> Vec<Value> {
        self.args
    }

    /// Arguments from `start` on, as a vector
    pub fn tail(&self, start: usize) -> Vec<Value> {
        self.args.iter().skip(start).cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trailing_tuple_expands() {
        let tuple = Value::new_tuple(vec![Value::Number(2.0), Value::Number(3.0)]);
        let args = CallbackArguments::new(vec![Value::Number(1.0), tuple], false);
        assert_eq!(args.len(), 3);
        assert_eq!(args.get(2), Value::Number(3.0));
        assert!(args.get(5).is_void());
    }

    #[test]
    fn test_method_call_argument_numbering() {
        let args = CallbackArguments::new(vec![Value::empty_table(), Value::Nil], true);
        let err = args
            .as_type(1, "push", DataType::Number, TypeValidationFlags::NONE)
            .unwrap_err();
        assert_eq!(err.to_string(), "bad argument #1 to 'push' (number expected, got nil)");
    }
}
