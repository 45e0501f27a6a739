//! Arithmetic, concatenation, length and comparison with metamethod fallback

use std::rc::Rc;

use super::index::Access;
use super::{FrameFlags, Processor};
use crate::error::{RuntimeError, ScriptResult};
use crate::proto::OpCode;
use crate::value::number::format_number;
use crate::value::Value;

fn metamethod_name(op: OpCode) -> &'static str {
    match op {
        OpCode::Add => "__add",
        OpCode::Sub => "__sub",
        OpCode::Mul => "__mul",
        OpCode::Div => "__div",
        OpCode::Mod => "__mod",
        OpCode::Power => "__pow",
        _ => "__unknown",
    }
}

fn apply(op: OpCode, a: f64, b: f64) -> f64 {
    match op {
        OpCode::Add => a + b,
        OpCode::Sub => a - b,
        OpCode::Mul => a * b,
        OpCode::Div => a / b,
        // floored modulo, sign follows the divisor
        OpCode::Mod => a - (a / b).floor() * b,
        OpCode::Power => a.powf(b),
        _ => f64::NAN,
    }
}

/// String form of a concatenation operand
fn concat_piece(v: &Value) -> Option<Rc<str>> {
    match v {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(format_number(*n).into()),
        _ => None,
    }
}

impl Processor {
    pub(crate) fn arithmetic(&mut self, op: OpCode, return_address: usize) -> ScriptResult<Access> {
        let b = self.stack.pop()?.to_scalar();
        let a = self.stack.pop()?.to_scalar();
        if let (Some(x), Some(y)) = (a.cast_to_number(), b.cast_to_number()) {
            self.stack.push(Value::Number(apply(op, x, y)));
            return Ok(Access::Done);
        }
        let name = metamethod_name(op);
        match self.binary_metamethod(&a, &b, name) {
            Some(handler) => {
                let step = self.call_metamethod(handler, vec![a, b], return_address, FrameFlags::SCALAR_RESULT, name)?;
                Ok(Access::Started(step))
            }
            None => {
                let culprit = if a.cast_to_number().is_none() { &a } else { &b };
                Err(RuntimeError::arithmetic_on(culprit).into())
            }
        }
    }

    pub(crate) fn negate(&mut self, return_address: usize) -> ScriptResult<Access> {
        let a = self.stack.pop()?.to_scalar();
        if let Some(n) = a.cast_to_number() {
            self.stack.push(Value::Number(-n));
            return Ok(Access::Done);
        }
        match self.unary_metamethod(&a, "__unm") {
            Some(handler) => {
                let step = self.call_metamethod(
                    handler,
                    vec![a.clone(), a],
                    return_address,
                    FrameFlags::SCALAR_RESULT,
                    "__unm",
                )?;
                Ok(Access::Started(step))
            }
            None => Err(RuntimeError::arithmetic_on(&a).into()),
        }
    }

    pub(crate) fn concat(&mut self, return_address: usize) -> ScriptResult<Access> {
        let b = self.stack.pop()?.to_scalar();
        let a = self.stack.pop()?.to_scalar();
        if let (Some(x), Some(y)) = (concat_piece(&a), concat_piece(&b)) {
            let mut s = String::with_capacity(x.len() + y.len());
            s.push_str(&x);
            s.push_str(&y);
            self.stack.push(Value::new_string(s));
            return Ok(Access::Done);
        }
        match self.binary_metamethod(&a, &b, "__concat") {
            Some(handler) => {
                let step = self.call_metamethod(
                    handler,
                    vec![a, b],
                    return_address,
                    FrameFlags::SCALAR_RESULT,
                    "__concat",
                )?;
                Ok(Access::Started(step))
            }
            None => {
                let culprit = if concat_piece(&a).is_none() { &a } else { &b };
                Err(RuntimeError::concat_on(culprit).into())
            }
        }
    }

    pub(crate) fn length(&mut self, return_address: usize) -> ScriptResult<Access> {
        let a = self.stack.pop()?.to_scalar();
        if let Value::String(s) = &a {
            self.stack.push(Value::Number(s.len() as f64));
            return Ok(Access::Done);
        }
        if let Some(handler) = self.unary_metamethod(&a, "__len") {
            let step = self.call_metamethod(
                handler,
                vec![a.clone(), a],
                return_address,
                FrameFlags::SCALAR_RESULT,
                "__len",
            )?;
            return Ok(Access::Started(step));
        }
        match &a {
            Value::Table(t) => {
                let n = t.borrow().length();
                self.stack.push(Value::Number(n as f64));
                Ok(Access::Done)
            }
            other => Err(RuntimeError::length_of(other).into()),
        }
    }

    /// `a == b`: raw equality, then `__eq` for two tables or two userdata
    pub(crate) fn values_equal(&mut self, a: &Value, b: &Value) -> ScriptResult<bool> {
        if a.raw_equals(b) {
            return Ok(true);
        }
        let comparable = matches!(
            (a, b),
            (Value::Table(_), Value::Table(_)) | (Value::UserData(_), Value::UserData(_))
        );
        if !comparable {
            return Ok(false);
        }
        match self.binary_metamethod(a, b, "__eq") {
            Some(handler) => Ok(self.call_nested(handler, vec![a.clone(), b.clone()])?.cast_to_bool()),
            None => Ok(false),
        }
    }

    pub(crate) fn less_than(&mut self, a: &Value, b: &Value) -> ScriptResult<bool> {
        match (a, b) {
            (Value::Number(x), Value::Number(y)) => Ok(x < y),
            (Value::String(x), Value::String(y)) => Ok(x.as_bytes() < y.as_bytes()),
            _ => match self.binary_metamethod(a, b, "__lt") {
                Some(handler) => Ok(self.call_nested(handler, vec![a.clone(), b.clone()])?.cast_to_bool()),
                None => Err(RuntimeError::compare(a, b).into()),
            },
        }
    }

    /// `a <= b`; without `__le` falls back to `not (b < a)` through `__lt`
    pub(crate) fn less_equal(&mut self, a: &Value, b: &Value) -> ScriptResult<bool> {
        match (a, b) {
            (Value::Number(x), Value::Number(y)) => Ok(x <= y),
            (Value::String(x), Value::String(y)) => Ok(x.as_bytes() <= y.as_bytes()),
            _ => {
                if let Some(handler) = self.binary_metamethod(a, b, "__le") {
                    return Ok(self.call_nested(handler, vec![a.clone(), b.clone()])?.cast_to_bool());
                }
                match self.binary_metamethod(b, a, "__lt") {
                    Some(handler) => {
                        Ok(!self.call_nested(handler, vec![b.clone(), a.clone()])?.cast_to_bool())
                    }
                    None => Err(RuntimeError::compare(a, b).into()),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_apply_modulo_follows_divisor_sign() {
        assert_eq!(apply(OpCode::Mod, 5.0, 3.0), 2.0);
        assert_eq!(apply(OpCode::Mod, -5.0, 3.0), 1.0);
        assert_eq!(apply(OpCode::Mod, 5.0, -3.0), -1.0);
        assert_eq!(apply(OpCode::Power, 2.0, 10.0), 1024.0);
    }

    #[test]
    fn test_concat_piece() {
        assert_eq!(concat_piece(&Value::Number(3.0)).as_deref(), Some("3"));
        assert_eq!(concat_piece(&Value::from("x")).as_deref(), Some("x"));
        assert!(concat_piece(&Value::Nil).is_none());
    }
}
