//! Metatable lookup, indexing with `__index`/`__newindex` fallback, and
//! symbol access

use std::rc::Rc;

use super::{FrameFlags, FrameHandlers, Processor, Step};
use crate::closure::{Upvalue, UpvalueRef};
use crate::error::{RuntimeError, RuntimeErrorKind, ScriptError, ScriptResult};
use crate::symbol::SymbolRef;
use crate::value::{ClosureRef, TableRef, Value};

/// `__index`/`__newindex` chains longer than this are treated as loops
const MAX_INDEX_CHAIN: usize = 100;

/// Result of an access that may have to run a metamethod
pub(crate) enum Access {
    /// The result (if any) is already on the stack
    Done,
    /// A handler call was started; its result arrives at the return address
    Started(Step),
}

fn index_loop_error(metamethod: &str) -> ScriptError {
    RuntimeError::new(
        RuntimeErrorKind::Index,
        format!("'{}' chain too long; possible loop", metamethod),
    )
    .into()
}

fn is_callable(v: &Value) -> bool {
    matches!(v, Value::Function(_) | Value::NativeFunction(_))
}

impl Processor {
    /// Metatable of a value: its own for tables and userdata, otherwise the
    /// per-type metatable
    pub fn get_metatable(&self, value: &Value) -> Option<TableRef> {
        match value {
            Value::Table(t) => t.borrow().metatable(),
            Value::UserData(ud) => ud
                .metatable()
                .or_else(|| self.type_metatable(value.data_type())),
            Value::Void | Value::Nil => None,
            other => self.type_metatable(other.data_type()),
        }
    }

    /// Handler `name` in the value's metatable
    pub fn get_metamethod(&self, value: &Value, name: &str) -> Option<Value> {
        let mt = self.get_metatable(value)?;
        let handler = mt.borrow().get_str(name);
        if handler.is_nil() {
            None
        } else {
            Some(handler)
        }
    }

    fn intrinsic_metamethod(value: &Value, name: &str) -> Option<Value> {
        match value {
            Value::UserData(ud) => ud.descriptor().meta_index(ud, name).filter(|v| !v.is_nil()),
            _ => None,
        }
    }

    /// Metatable handler, then the userdata's intrinsic one
    pub(crate) fn unary_metamethod(&self, value: &Value, name: &str) -> Option<Value> {
        self.get_metamethod(value, name)
            .or_else(|| Self::intrinsic_metamethod(value, name))
    }

    /// Left metatable, right metatable, left intrinsic, right intrinsic
    pub(crate) fn binary_metamethod(&self, left: &Value, right: &Value, name: &str) -> Option<Value> {
        self.get_metamethod(left, name)
            .or_else(|| self.get_metamethod(right, name))
            .or_else(|| Self::intrinsic_metamethod(left, name))
            .or_else(|| Self::intrinsic_metamethod(right, name))
    }

    /// Push `handler(operands...)` as a call returning to `return_address`
    pub(crate) fn call_metamethod(
        &mut self,
        handler: Value,
        operands: Vec<Value>,
        return_address: usize,
        flags: FrameFlags,
        name: &str,
    ) -> ScriptResult<Step> {
        let argc = operands.len();
        self.stack.push(handler);
        self.stack.extend(operands);
        self.perform_call(argc, return_address, flags, FrameHandlers::default(), Some(name.into()))
    }

    /// `obj[key]` with `__index` fallback; the value is pushed
    pub(crate) fn index_value(&mut self, obj: Value, key: Value, return_address: usize) -> ScriptResult<Access> {
        let mut current = obj;
        for _ in 0..MAX_INDEX_CHAIN {
            let handler = match self.raw_index_step(&current, &key)? {
                Ok(value) => {
                    self.stack.push(value);
                    return Ok(Access::Done);
                }
                Err(handler) => handler,
            };
            if is_callable(&handler) {
                let step = self.call_metamethod(
                    handler,
                    vec![current, key],
                    return_address,
                    FrameFlags::SCALAR_RESULT,
                    "__index",
                )?;
                return Ok(Access::Started(step));
            }
            current = handler;
        }
        Err(index_loop_error("__index"))
    }

    /// `obj[key]` run to completion, calling `__index` functions nested
    pub(crate) fn index_nested(&mut self, obj: Value, key: Value) -> ScriptResult<Value> {
        let mut current = obj;
        for _ in 0..MAX_INDEX_CHAIN {
            let handler = match self.raw_index_step(&current, &key)? {
                Ok(value) => return Ok(value),
                Err(handler) => handler,
            };
            if is_callable(&handler) {
                return Ok(self.call_nested(handler, vec![current, key])?.to_scalar());
            }
            current = handler;
        }
        Err(index_loop_error("__index"))
    }

    /// One level of indexing: `Ok(value)` when resolved here, `Err(handler)`
    /// when the `__index` handler must be consulted
    fn raw_index_step(&self, obj: &Value, key: &Value) -> ScriptResult<Result<Value, Value>> {
        match obj {
            Value::Table(t) => {
                let value = t.borrow().get(key);
                if !value.is_nil() {
                    return Ok(Ok(value));
                }
                match self.get_metamethod(obj, "__index") {
                    Some(handler) => Ok(Err(handler)),
                    None => Ok(Ok(Value::Nil)),
                }
            }
            Value::UserData(ud) => {
                if let Some(value) = ud.descriptor().index(ud, key)? {
                    return Ok(Ok(value));
                }
                match self.unary_metamethod(obj, "__index") {
                    Some(handler) => Ok(Err(handler)),
                    None => Err(RuntimeError::new(
                        RuntimeErrorKind::Index,
                        format!(
                            "cannot access field {} of userdata<{}>",
                            key,
                            ud.descriptor().name()
                        ),
                    )
                    .into()),
                }
            }
            other => match self.get_metamethod(other, "__index") {
                Some(handler) => Ok(Err(handler)),
                None => Err(RuntimeError::index_on(other).into()),
            },
        }
    }

    /// `obj[key] = value` with `__newindex` fallback
    pub(crate) fn set_index_value(
        &mut self,
        obj: Value,
        key: Value,
        value: Value,
        return_address: usize,
    ) -> ScriptResult<Access> {
        let mut current = obj;
        for _ in 0..MAX_INDEX_CHAIN {
            let handler = match &current {
                Value::Table(t) => {
                    let existing = t.borrow().get(&key);
                    let handler = if existing.is_nil() {
                        self.get_metamethod(&current, "__newindex")
                    } else {
                        None
                    };
                    match handler {
                        Some(handler) => handler,
                        None => {
                            t.borrow_mut().set(key, value)?;
                            return Ok(Access::Done);
                        }
                    }
                }
                Value::UserData(ud) => {
                    if ud.descriptor().set_index(ud, &key, value.clone())? {
                        return Ok(Access::Done);
                    }
                    match self.unary_metamethod(&current, "__newindex") {
                        Some(handler) => handler,
                        None => {
                            return Err(RuntimeError::new(
                                RuntimeErrorKind::Index,
                                format!(
                                    "cannot set field {} of userdata<{}>",
                                    key,
                                    ud.descriptor().name()
                                ),
                            )
                            .into())
                        }
                    }
                }
                other => match self.get_metamethod(other, "__newindex") {
                    Some(handler) => handler,
                    None => return Err(RuntimeError::index_on(other).into()),
                },
            };
            if is_callable(&handler) {
                let step = self.call_metamethod(
                    handler,
                    vec![current, key, value],
                    return_address,
                    FrameFlags::DISCARD_RESULT,
                    "__newindex",
                )?;
                return Ok(Access::Started(step));
            }
            current = handler;
        }
        Err(index_loop_error("__newindex"))
    }

    /// Current value of a non-global symbol, or a raw global lookup
    pub(crate) fn read_symbol(&self, sym: &SymbolRef, closure: &ClosureRef, base: usize) -> ScriptResult<Value> {
        match sym {
            SymbolRef::Local { index, .. } => Ok(self.stack.get(base + index)),
            SymbolRef::Upvalue { index, .. } => closure
                .upvalue(*index)
                .map(|cell| cell.get())
                .ok_or_else(|| {
                    ScriptError::internal(format!("upvalue {} out of range in '{}'", index, closure.name()))
                }),
            SymbolRef::DefaultEnv => Ok(Value::Table(self.globals())),
            SymbolRef::Global { name, env } => match self.read_symbol(env, closure, base)? {
                Value::Table(t) => Ok(t.borrow().get_str(name)),
                other => Err(RuntimeError::index_on(&other).into()),
            },
        }
    }

    pub(crate) fn write_symbol(
        &self,
        sym: &SymbolRef,
        closure: &ClosureRef,
        base: usize,
        value: Value,
    ) -> ScriptResult<()> {
        match sym {
            SymbolRef::Local { index, .. } => {
                self.stack.set(base + index, value);
                Ok(())
            }
            SymbolRef::Upvalue { index, .. } => {
                let cell = closure.upvalue(*index).ok_or_else(|| {
                    ScriptError::internal(format!("upvalue {} out of range in '{}'", index, closure.name()))
                })?;
                cell.set(value);
                Ok(())
            }
            SymbolRef::Global { name, env } => match self.read_symbol(env, closure, base)? {
                Value::Table(t) => {
                    t.borrow_mut().set_str(name, value);
                    Ok(())
                }
                other => Err(RuntimeError::index_on(&other).into()),
            },
            SymbolRef::DefaultEnv => Err(ScriptError::internal("the default environment cannot be assigned")),
        }
    }

    /// The open upvalue for an absolute stack slot of the top frame,
    /// created on first capture so sibling closures share it
    pub(crate) fn open_upvalue(&mut self, slot: usize) -> ScriptResult<UpvalueRef> {
        let frame = self
            .frames
            .last_mut()
            .ok_or_else(|| ScriptError::internal("capture with an empty execution stack"))?;
        if let Some(cell) = frame
            .open_upvalues
            .iter()
            .find(|up| up.stack_index() == Some(slot))
        {
            return Ok(Rc::clone(cell));
        }
        let cell = Upvalue::new_open(self.stack.clone(), slot);
        frame.open_upvalues.push(cell.clone());
        Ok(cell)
    }
}
