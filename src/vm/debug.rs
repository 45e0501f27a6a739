//! Debugger call-outs, symbol lookup by name and watch expressions

use std::rc::Rc;

use super::{FrameFunction, Processor};
use crate::error::{ScriptError, ScriptResult};
use crate::proto::{FunctionProto, SourceRef};
use crate::symbol::SymbolRef;
use crate::value::{ClosureRef, Value};

/// Receives control at every stop point while attached.
///
/// The observer may inspect and modify variables through the processor but
/// must not start new calls on it.
pub trait DebugObserver {
    fn on_checkpoint(&self, processor: &mut Processor, checkpoint: &Checkpoint) -> ScriptResult<()>;
}

/// Where execution is stopped
#[derive(Debug, Clone)]
pub struct Checkpoint {
    /// Instruction about to execute
    pub instruction_pointer: usize,

    pub source_ref: SourceRef,

    /// Name of the running function
    pub function_name: String,

    /// Execution stack depth
    pub call_depth: usize,
}

/// A watch expression.
///
/// Only side-effect free forms are evaluated: calls are rejected.
#[derive(Debug, Clone)]
pub enum DynamicExpr {
    Constant(Value),
    Symbol(String),
    Index(Box<DynamicExpr>, Box<DynamicExpr>),
    Call(Box<DynamicExpr>, Vec<DynamicExpr>),
}

impl Processor {
    pub(crate) fn signal_checkpoint(&mut self, proto: &Rc<FunctionProto>, ip: usize) -> ScriptResult<()> {
        let source_ref = match proto.source_ref(ip) {
            Some(sr) if sr.is_stop_point => *sr,
            _ => return Ok(()),
        };
        let observer = match self.shared.debugger.borrow().as_ref() {
            Some(observer) => observer.clone(),
            None => return Ok(()),
        };
        let checkpoint = Checkpoint {
            instruction_pointer: ip,
            source_ref,
            function_name: proto.name.to_string(),
            call_depth: self.frames.len(),
        };
        observer.on_checkpoint(self, &checkpoint)
    }

    /// Closure and base pointer of the innermost script frame
    fn script_scope(&self) -> Option<(ClosureRef, usize)> {
        self.frames.iter().rev().find_map(|frame| match &frame.function {
            FrameFunction::Script(closure) => Some((closure.clone(), frame.base_pointer)),
            FrameFunction::Native(_) => None,
        })
    }

    /// Resolve `name` the way the compiler would at the current stop point:
    /// innermost local, then upvalue, then a global through `_ENV`
    pub fn find_symbol_by_name(&self, name: &str) -> SymbolRef {
        let Some((closure, _)) = self.script_scope() else {
            return SymbolRef::global(name, SymbolRef::default_env());
        };
        let proto = closure.proto();
        if let Some(local) = proto.locals.iter().rev().find(|l| l.name() == name) {
            return local.clone();
        }
        if let Some(index) = proto.upvalues.iter().position(|u| u.name() == name) {
            return SymbolRef::upvalue(index, name);
        }
        let env = match proto.locals.iter().rev().find(|l| l.name() == "_ENV") {
            Some(local) => local.clone(),
            None => match proto.upvalues.iter().position(|u| u.name() == "_ENV") {
                Some(index) => SymbolRef::upvalue(index, "_ENV"),
                None => SymbolRef::default_env(),
            },
        };
        SymbolRef::global(name, env)
    }

    pub fn get_symbol_value(&self, symbol: &SymbolRef) -> ScriptResult<Value> {
        match self.script_scope() {
            Some((closure, base)) => self.read_symbol(symbol, &closure, base),
            None => match symbol {
                SymbolRef::DefaultEnv => Ok(Value::Table(self.globals())),
                SymbolRef::Global { name, env } if matches!(**env, SymbolRef::DefaultEnv) => {
                    Ok(self.globals().borrow().get_str(name))
                }
                other => Err(ScriptError::DynamicExpression(format!(
                    "'{}' is not accessible without a running function",
                    other.name()
                ))),
            },
        }
    }

    pub fn assign_symbol(&self, symbol: &SymbolRef, value: Value) -> ScriptResult<()> {
        match self.script_scope() {
            Some((closure, base)) => self.write_symbol(symbol, &closure, base, value),
            None => match symbol {
                SymbolRef::Global { name, env } if matches!(**env, SymbolRef::DefaultEnv) => {
                    self.globals().borrow_mut().set_str(name, value);
                    Ok(())
                }
                other => Err(ScriptError::DynamicExpression(format!(
                    "'{}' is not assignable without a running function",
                    other.name()
                ))),
            },
        }
    }

    /// Evaluate a watch expression against the innermost script frame
    pub fn evaluate(&self, expr: &DynamicExpr) -> ScriptResult<Value> {
        match expr {
            DynamicExpr::Constant(value) => Ok(value.clone()),
            DynamicExpr::Symbol(name) => self.get_symbol_value(&self.find_symbol_by_name(name)),
            DynamicExpr::Index(object, key) => {
                let object = self.evaluate(object)?;
                let key = self.evaluate(key)?;
                match object.to_scalar() {
                    Value::Table(t) => Ok(t.borrow().get(&key.to_scalar())),
                    other => Err(ScriptError::DynamicExpression(format!(
                        "cannot index a {} value in a watch expression",
                        other.type_name()
                    ))),
                }
            }
            DynamicExpr::Call(..) => Err(ScriptError::DynamicExpression(
                "function calls are not allowed in dynamic expressions".into(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_globals_without_frame() {
        let processor = Processor::default();
        let sym = processor.find_symbol_by_name("answer");
        assert!(matches!(sym, SymbolRef::Global { .. }));
        processor.assign_symbol(&sym, Value::Number(42.0)).unwrap();
        assert_eq!(processor.get_symbol_value(&sym).unwrap(), Value::Number(42.0));
    }

    #[test]
    fn test_calls_are_rejected() {
        let processor = Processor::default();
        let expr = DynamicExpr::Call(Box::new(DynamicExpr::Symbol("print".into())), vec![]);
        assert!(matches!(
            processor.evaluate(&expr),
            Err(ScriptError::DynamicExpression(_))
        ));
    }

    #[test]
    fn test_index_expression() {
        let processor = Processor::default();
        let t = Value::empty_table();
        if let Value::Table(table) = &t {
            table.borrow_mut().set_str("x", Value::Number(3.0));
        }
        processor.globals().borrow_mut().set_str("t", t);
        let expr = DynamicExpr::Index(
            Box::new(DynamicExpr::Symbol("t".into())),
            Box::new(DynamicExpr::Constant(Value::from("x"))),
        );
        assert_eq!(processor.evaluate(&expr).unwrap(), Value::Number(3.0));
    }
}
