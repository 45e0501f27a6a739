//! Runtime value representation
//!
//! `Value` is the tagged union every instruction operates on. Heap objects
//! (tables, closures, userdata, coroutines) are shared through `Rc` handles,
//! so cloning a `Value` is cheap and never copies the referenced object.

pub mod callback;
pub mod number;
pub mod requests;
pub mod table;
pub mod userdata;

use std::cell::RefCell;
use std::fmt;
use std::ops::BitOr;
use std::rc::Rc;

use crate::closure::Closure;
use crate::error::{RuntimeError, ScriptResult};
use crate::vm::Coroutine;

pub use callback::{CallbackArguments, CallbackFunction};
pub use requests::{AwaitRequest, HostTask, TailCallData, YieldRequest};
pub use table::{Table, TablePair};
pub use userdata::{UserData, UserDataDescriptor};

/// Shared handle to a table
pub type TableRef = Rc<RefCell<Table>>;

/// Shared handle to a closure
pub type ClosureRef = Rc<Closure>;

/// Type tag of a value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DataType {
    Void,
    Nil,
    Boolean,
    Number,
    String,
    Table,
    Function,
    NativeFunction,
    UserData,
    Thread,
    Tuple,
    TailCallRequest,
    YieldRequest,
    AwaitRequest,
    Range,
}

impl DataType {
    /// Name as reported by `type()` and in error messages
    pub fn name(self) -> &'static str {
        match self {
            DataType::Void => "no value",
            DataType::Nil => "nil",
            DataType::Boolean => "boolean",
            DataType::Number => "number",
            DataType::String => "string",
            DataType::Table => "table",
            DataType::Function | DataType::NativeFunction => "function",
            DataType::UserData => "userdata",
            DataType::Thread => "thread",
            DataType::Tuple => "tuple",
            DataType::TailCallRequest => "tailcallrequest",
            DataType::YieldRequest => "yieldrequest",
            DataType::AwaitRequest => "awaitrequest",
            DataType::Range => "range",
        }
    }

    pub(crate) fn from_u8(tag: u8) -> Option<DataType> {
        const ALL: [DataType; 15] = [
            DataType::Void,
            DataType::Nil,
            DataType::Boolean,
            DataType::Number,
            DataType::String,
            DataType::Table,
            DataType::Function,
            DataType::NativeFunction,
            DataType::UserData,
            DataType::Thread,
            DataType::Tuple,
            DataType::TailCallRequest,
            DataType::YieldRequest,
            DataType::AwaitRequest,
            DataType::Range,
        ];
        ALL.get(tag as usize).copied()
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Numeric range value produced by `MkRange` (`from..to[..step]`)
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Range {
    pub from: f64,
    pub to: f64,
    pub step: f64,
}

impl Range {
    /// Next value after `current`, or the first value when `current` is None
    pub fn next_after(&self, current: Option<f64>) -> Option<f64> {
        let next = match current {
            None => self.from,
            Some(v) => v + self.step,
        };
        let inside = if self.step > 0.0 { next <= self.to } else { next >= self.to };
        if inside && self.step != 0.0 {
            Some(next)
        } else {
            None
        }
    }
}

/// Argument validation policy for [`Value::check_type`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TypeValidationFlags(u8);

impl TypeValidationFlags {
    pub const NONE: TypeValidationFlags = TypeValidationFlags(0);
    /// nil (or a missing argument) is accepted and reported as nil
    pub const ALLOW_NIL: TypeValidationFlags = TypeValidationFlags(1);
    /// Numbers and strings coerce to each other, anything coerces to boolean
    pub const AUTO_CONVERT: TypeValidationFlags = TypeValidationFlags(2);
    pub const DEFAULT: TypeValidationFlags = TypeValidationFlags::AUTO_CONVERT;

    pub fn contains(self, other: TypeValidationFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for TypeValidationFlags {
    type Output = TypeValidationFlags;

    fn bitor(self, rhs: TypeValidationFlags) -> TypeValidationFlags {
        TypeValidationFlags(self.0 | rhs.0)
    }
}

/// Main runtime value type
#[derive(Clone)]
pub enum Value {
    /// Absence of a value (e.g. a function returning nothing)
    Void,
    Nil,
    Boolean(bool),
    Number(f64),
    String(Rc<str>),
    Table(TableRef),
    Function(ClosureRef),
    NativeFunction(Rc<CallbackFunction>),
    UserData(Rc<UserData>),
    Thread(Coroutine),
    /// Multiple values; never of length 0 or 1 when built via `new_tuple`
    Tuple(Rc<[Value]>),
    TailCallRequest(Rc<TailCallData>),
    YieldRequest(Rc<YieldRequest>),
    AwaitRequest(Rc<AwaitRequest>),
    Range(Range),
}

impl Value {
    pub fn new_number(n: f64) -> Value {
        Value::Number(n)
    }

    pub fn new_boolean(b: bool) -> Value {
        Value::Boolean(b)
    }

    pub fn new_string(s: impl Into<Rc<str>>) -> Value {
        Value::String(s.into())
    }

    pub fn new_table(table: Table) -> Value {
        Value::Table(Rc::new(RefCell::new(table)))
    }

    /// A fresh empty table with index origin 1
    pub fn empty_table() -> Value {
        Value::new_table(Table::new())
    }

    pub fn new_closure(closure: Closure) -> Value {
        Value::Function(Rc::new(closure))
    }

    pub fn new_callback(callback: CallbackFunction) -> Value {
        Value::NativeFunction(Rc::new(callback))
    }

    pub fn new_userdata(userdata: UserData) -> Value {
        Value::UserData(Rc::new(userdata))
    }

    pub fn new_coroutine(coroutine: Coroutine) -> Value {
        Value::Thread(coroutine)
    }

    /// Build a tuple; zero values collapse to `Void`, one value to itself
    pub fn new_tuple(mut values: Vec<Value>) -> Value {
        match values.len() {
            0 => Value::Void,
            1 => values.pop().unwrap_or(Value::Void),
            _ => Value::Tuple(values.into()),
        }
    }

    /// Build a tuple, splicing a trailing tuple element into the result
    pub fn new_tuple_nested(mut values: Vec<Value>) -> Value {
        if let Some(Value::Tuple(last)) = values.last().cloned() {
            values.pop();
            values.extend(last.iter().cloned());
        }
        Value::new_tuple(values)
    }

    pub fn new_tail_call_request(data: TailCallData) -> Value {
        Value::TailCallRequest(Rc::new(data))
    }

    pub fn new_yield_request(values: Vec<Value>) -> Value {
        Value::YieldRequest(Rc::new(YieldRequest::new(values)))
    }

    pub fn new_await_request(task: HostTask) -> Value {
        Value::AwaitRequest(Rc::new(AwaitRequest::new(task)))
    }

    pub fn new_range(from: f64, to: f64, step: f64) -> Value {
        Value::Range(Range { from, to, step })
    }

    pub fn data_type(&self) -> DataType {
        match self {
            Value::Void => DataType::Void,
            Value::Nil => DataType::Nil,
            Value::Boolean(_) => DataType::Boolean,
            Value::Number(_) => DataType::Number,
            Value::String(_) => DataType::String,
            Value::Table(_) => DataType::Table,
            Value::Function(_) => DataType::Function,
            Value::NativeFunction(_) => DataType::NativeFunction,
            Value::UserData(_) => DataType::UserData,
            Value::Thread(_) => DataType::Thread,
            Value::Tuple(_) => DataType::Tuple,
            Value::TailCallRequest(_) => DataType::TailCallRequest,
            Value::YieldRequest(_) => DataType::YieldRequest,
            Value::AwaitRequest(_) => DataType::AwaitRequest,
            Value::Range(_) => DataType::Range,
        }
    }

    /// Type name used in messages; void reports as nil like Lua does
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Void => "nil",
            other => other.data_type().name(),
        }
    }

    /// True for both `Nil` and `Void`
    pub fn is_nil(&self) -> bool {
        matches!(self, Value::Nil | Value::Void)
    }

    pub fn is_void(&self) -> bool {
        matches!(self, Value::Void)
    }

    pub fn is_callable_directly(&self) -> bool {
        matches!(self, Value::Function(_) | Value::NativeFunction(_))
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_table(&self) -> Option<&TableRef> {
        match self {
            Value::Table(t) => Some(t),
            _ => None,
        }
    }

    /// Tuple elements, or the value itself as a one-element slice
    pub fn tuple_values(&self) -> Vec<Value> {
        match self {
            Value::Tuple(items) => items.to_vec(),
            Value::Void => Vec::new(),
            other => vec![other.clone()],
        }
    }

    /// Collapse a tuple to its first non-tuple leaf (empty tuple gives `Void`)
    pub fn to_scalar(&self) -> Value {
        let mut current = self;
        loop {
            match current {
                Value::Tuple(items) => match items.first() {
                    Some(first) => current = first,
                    None => return Value::Void,
                },
                other => return other.clone(),
            }
        }
    }

    /// Lua truthiness: only nil, void and false are false
    pub fn cast_to_bool(&self) -> bool {
        match self {
            Value::Nil | Value::Void | Value::Boolean(false) => false,
            Value::Tuple(_) => self.to_scalar().cast_to_bool(),
            _ => true,
        }
    }

    /// Numeric coercion: numbers and numeric strings
    pub fn cast_to_number(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            Value::String(s) => number::parse_number(s),
            Value::Tuple(_) => self.to_scalar().cast_to_number(),
            _ => None,
        }
    }

    /// String coercion: strings and numbers
    pub fn cast_to_string(&self) -> Option<Rc<str>> {
        match self {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(number::format_number(*n).into()),
            Value::Tuple(_) => self.to_scalar().cast_to_string(),
            _ => None,
        }
    }

    /// Validate a native callback argument against an expected type.
    ///
    /// `arg_num` is 1-based and only used for the error message.
    pub fn check_type(
        &self,
        func_name: &str,
        expected: DataType,
        arg_num: usize,
        flags: TypeValidationFlags,
    ) -> ScriptResult<Value> {
        let value = self.to_scalar();
        let actual = value.data_type();

        let matches = actual == expected
            || (expected == DataType::Function && actual == DataType::NativeFunction)
            || (expected == DataType::Nil && actual == DataType::Void);
        if matches {
            return Ok(value);
        }

        if flags.contains(TypeValidationFlags::ALLOW_NIL) && value.is_nil() {
            return Ok(Value::Nil);
        }

        if flags.contains(TypeValidationFlags::AUTO_CONVERT) {
            let converted = match expected {
                DataType::Number => value.cast_to_number().map(Value::Number),
                DataType::String => value.cast_to_string().map(Value::String),
                DataType::Boolean => Some(Value::Boolean(value.cast_to_bool())),
                _ => None,
            };
            if let Some(v) = converted {
                return Ok(v);
            }
        }

        Err(RuntimeError::bad_argument(arg_num, func_name, expected.name(), &value).into())
    }

    /// Raw equality: identity for reference types, structural otherwise
    pub fn raw_equals(&self, other: &Value) -> bool {
        match (self, other) {
            (a, b) if a.is_nil() && b.is_nil() => true,
            (Value::Boolean(a), Value::Boolean(b)) => a == b,
            (Value::Number(a), Value::Number(b)) => a == b,
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Table(a), Value::Table(b)) => Rc::ptr_eq(a, b),
            (Value::Function(a), Value::Function(b)) => Rc::ptr_eq(a, b),
            (Value::NativeFunction(a), Value::NativeFunction(b)) => Rc::ptr_eq(a, b),
            (Value::UserData(a), Value::UserData(b)) => {
                Rc::ptr_eq(a, b) || a.descriptor().equals(a, b)
            }
            (Value::Thread(a), Value::Thread(b)) => a.ptr_eq(b),
            (Value::Tuple(a), Value::Tuple(b)) => {
                a.len() == b.len() && a.iter().zip(b.iter()).all(|(x, y)| x.raw_equals(y))
            }
            (Value::TailCallRequest(a), Value::TailCallRequest(b)) => Rc::ptr_eq(a, b),
            (Value::YieldRequest(a), Value::YieldRequest(b)) => Rc::ptr_eq(a, b),
            (Value::AwaitRequest(a), Value::AwaitRequest(b)) => Rc::ptr_eq(a, b),
            (Value::Range(a), Value::Range(b)) => a == b,
            _ => false,
        }
    }

    /// Address used for display of reference types
    fn address(&self) -> usize {
        match self {
            Value::Table(t) => Rc::as_ptr(t) as *const u8 as usize,
            Value::Function(c) => Rc::as_ptr(c) as *const u8 as usize,
            Value::NativeFunction(c) => Rc::as_ptr(c) as *const u8 as usize,
            Value::UserData(u) => Rc::as_ptr(u) as *const u8 as usize,
            Value::Thread(c) => c.address(),
            _ => 0,
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Value) -> bool {
        self.raw_equals(other)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Void | Value::Nil => f.write_str("nil"),
            Value::Boolean(b) => write!(f, "{}", b),
            Value::Number(n) => f.write_str(&number::format_number(*n)),
            Value::String(s) => f.write_str(s),
            Value::Table(_) => write!(f, "table: 0x{:08x}", self.address()),
            Value::Function(_) | Value::NativeFunction(_) => {
                write!(f, "function: 0x{:08x}", self.address())
            }
            Value::UserData(u) => match u.descriptor().as_string(u) {
                Some(s) => f.write_str(&s),
                None => write!(f, "userdata: 0x{:08x}", self.address()),
            },
            Value::Thread(_) => write!(f, "thread: 0x{:08x}", self.address()),
            Value::Tuple(items) => {
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str("\t")?;
                    }
                    write!(f, "{}", item)?;
                }
                Ok(())
            }
            Value::TailCallRequest(_) => f.write_str("(tail call request)"),
            Value::YieldRequest(_) => f.write_str("(yield request)"),
            Value::AwaitRequest(_) => f.write_str("(await request)"),
            Value::Range(r) => write!(
                f,
                "{}..{}..{}",
                number::format_number(r.from),
                number::format_number(r.to),
                number::format_number(r.step)
            ),
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Void => f.write_str("Void"),
            Value::Nil => f.write_str("Nil"),
            Value::Boolean(b) => write!(f, "Boolean({})", b),
            Value::Number(n) => write!(f, "Number({})", n),
            Value::String(s) => write!(f, "String({:?})", s),
            // Tables may be cyclic, print only the handle
            Value::Table(_) => write!(f, "Table(0x{:08x})", self.address()),
            Value::Function(c) => write!(f, "Function({})", c.proto().name),
            Value::NativeFunction(c) => write!(f, "NativeFunction({})", c.name()),
            Value::Tuple(items) => f.debug_tuple("Tuple").field(&items).finish(),
            other => write!(f, "{}", other),
        }
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Number(n)
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Value::Number(n as f64)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Boolean(b)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.into())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tuple_collapse() {
        assert!(Value::new_tuple(vec![]).is_void());
        let single = Value::new_tuple(vec![Value::Number(3.0)]);
        assert!(matches!(single, Value::Number(n) if n == 3.0));
        let pair = Value::new_tuple(vec![Value::Nil, Value::Boolean(true)]);
        assert_eq!(pair.data_type(), DataType::Tuple);
    }

    #[test]
    fn test_to_scalar_nested() {
        let inner = Value::Tuple(vec![Value::from("leaf"), Value::Nil].into());
        let outer = Value::Tuple(vec![inner, Value::Number(2.0)].into());
        let deep = Value::Tuple(vec![outer, Value::Number(9.0)].into());
        assert_eq!(deep.to_scalar(), Value::from("leaf"));

        let empty = Value::Tuple(Vec::new().into());
        assert!(empty.to_scalar().is_void());
    }

    #[test]
    fn test_nil_void_equality() {
        assert_eq!(Value::Nil, Value::Void);
        assert_ne!(Value::Nil.data_type(), Value::Void.data_type());
        assert_ne!(Value::Nil, Value::Boolean(false));
    }

    #[test]
    fn test_reference_identity() {
        let a = Value::empty_table();
        let b = Value::empty_table();
        assert_eq!(a, a.clone());
        assert_ne!(a, b);
    }

    #[test]
    fn test_casts() {
        assert!(!Value::Nil.cast_to_bool());
        assert!(!Value::Boolean(false).cast_to_bool());
        assert!(Value::Number(0.0).cast_to_bool());
        assert!(Value::from("").cast_to_bool());

        assert_eq!(Value::from(" 0x1.8p3 ").cast_to_number(), Some(12.0));
        assert_eq!(Value::from("12a").cast_to_number(), None);
        assert_eq!(Value::Number(2.5).cast_to_string().as_deref(), Some("2.5"));
        assert_eq!(Value::Boolean(true).cast_to_string(), None);
    }

    #[test]
    fn test_check_type() {
        let v = Value::from("10");
        let n = v
            .check_type("f", DataType::Number, 1, TypeValidationFlags::DEFAULT)
            .unwrap();
        assert_eq!(n, Value::Number(10.0));

        let err = v
            .check_type("f", DataType::Number, 1, TypeValidationFlags::NONE)
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "bad argument #1 to 'f' (number expected, got string)"
        );

        let nil = Value::Void
            .check_type("f", DataType::Table, 2, TypeValidationFlags::ALLOW_NIL)
            .unwrap();
        assert!(nil.is_nil());
    }

    #[test]
    fn test_range_iteration() {
        let r = Range { from: 1.0, to: 3.0, step: 1.0 };
        let mut out = Vec::new();
        let mut cur = None;
        while let Some(v) = r.next_after(cur) {
            out.push(v);
            cur = Some(v);
        }
        assert_eq!(out, vec![1.0, 2.0, 3.0]);
    }
}
