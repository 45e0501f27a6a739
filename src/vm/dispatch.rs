//! Instruction dispatch loop

use std::rc::Rc;

use super::index::Access;
use super::{EntryMark, FrameFlags, FrameFunction, FrameHandlers, Processor, Resumption, Step, Suspension};
use crate::closure::{Closure, Upvalue};
use crate::config::LogLevel;
use crate::error::{RuntimeError, ScriptError, ScriptResult};
use crate::proto::{FunctionProto, Instruction, OpCode, ProtoFlags};
use crate::symbol::SymbolRef;
use crate::value::{table, ClosureRef, Table, Value};

/// Effect of one instruction on the instruction pointer
enum Flow {
    Next,
    Jump(usize),
    /// The frame stack changed; reload the top frame and continue at `ip`
    Switch(usize),
    Exit(Step),
}

impl From<Step> for Flow {
    fn from(step: Step) -> Flow {
        match step {
            Step::Continue(ip) => Flow::Switch(ip),
            other => Flow::Exit(other),
        }
    }
}

impl From<Access> for Flow {
    fn from(access: Access) -> Flow {
        match access {
            Access::Done => Flow::Next,
            Access::Started(step) => Flow::from(step),
        }
    }
}

fn jump_target(a: i32) -> ScriptResult<usize> {
    usize::try_from(a).map_err(|_| ScriptError::internal(format!("invalid jump target {}", a)))
}

fn operand(a: i32) -> usize {
    a.max(0) as usize
}

fn string_operand(proto: &FunctionProto, index: i32) -> ScriptResult<Rc<str>> {
    proto
        .strings
        .get(operand(index))
        .cloned()
        .ok_or_else(|| ScriptError::internal(format!("string constant {} out of range", index)))
}

/// Name the caller used for the callee, for diagnostics
fn call_name(proto: &FunctionProto, b: i32) -> Option<Rc<str>> {
    if b > 0 {
        proto.strings.get((b - 1) as usize).cloned()
    } else {
        None
    }
}

impl Processor {
    /// Execute from `ip` in the top frame until the entry frame returns or
    /// execution suspends. Runtime errors are handed to the unwinder and, if
    /// a handler frame catches them, execution continues where it resumes.
    pub(crate) fn processing_loop(&mut self, ip: usize, mark: EntryMark) -> ScriptResult<Step> {
        let mut ip = ip;
        loop {
            match self.dispatch(&mut ip) {
                Ok(step) => return Ok(step),
                Err(e) => match self.unwind(e, ip, mark)? {
                    Step::Continue(next) => ip = next,
                    other => return Ok(other),
                },
            }
        }
    }

    fn dispatch(&mut self, ip: &mut usize) -> ScriptResult<Step> {
        loop {
            let frame = self
                .frames
                .last()
                .ok_or_else(|| ScriptError::internal("dispatch with an empty execution stack"))?;
            let closure = match &frame.function {
                FrameFunction::Script(c) => c.clone(),
                FrameFunction::Native(cb) => {
                    return Err(ScriptError::internal(format!(
                        "dispatch on native frame '{}'",
                        cb.name()
                    )))
                }
            };
            let base = frame.base_pointer;
            let proto = closure.proto().clone();

            loop {
                let ins = *proto.code.get(*ip).ok_or_else(|| {
                    ScriptError::internal(format!(
                        "instruction pointer {} out of range in '{}'",
                        ip, proto.name
                    ))
                })?;

                self.count_instruction()?;
                if self.auto_yield_budget > 0 && self.nested_calls == 0 && self.coroutine.is_some() {
                    self.since_resume += 1;
                    if self.since_resume > self.auto_yield_budget {
                        vm_log!(self.shared.options, LogLevel::Debug, "COROUTINE", "auto-yield at {} in '{}'", ip, proto.name);
                        self.since_resume = 0;
                        self.pending = Some((Resumption::Instruction(*ip), EntryMark::default()));
                        return Ok(Step::Suspend(Suspension::ForcedYield));
                    }
                }
                if self.shared.debugging.get() {
                    self.signal_checkpoint(&proto, *ip)?;
                }

                match self.execute(ins, &closure, &proto, base, *ip)? {
                    Flow::Next => *ip += 1,
                    Flow::Jump(target) => *ip = target,
                    Flow::Switch(target) => {
                        *ip = target;
                        break;
                    }
                    Flow::Exit(step) => return Ok(step),
                }
            }
        }
    }

    fn count_instruction(&self) -> ScriptResult<()> {
        let count = self.shared.instruction_count.get() + 1;
        self.shared.instruction_count.set(count);
        if let Some(limit) = self.shared.options.instruction_limit {
            if count > limit {
                vm_log!(self.shared.options, LogLevel::Warning, "VM", "instruction limit of {} exceeded", limit);
                return Err(ScriptError::InstructionLimitExceeded);
            }
        }
        Ok(())
    }

    fn execute(
        &mut self,
        ins: Instruction,
        closure: &ClosureRef,
        proto: &Rc<FunctionProto>,
        base: usize,
        ip: usize,
    ) -> ScriptResult<Flow> {
        let stack = self.stack.clone();
        match ins.op {
            OpCode::Nop | OpCode::Debug => {}
            OpCode::Invalid => {
                return Err(ScriptError::internal(format!(
                    "invalid opcode executed at {} in '{}'",
                    ip, proto.name
                )))
            }

            OpCode::Pop => {
                let len = stack.len();
                stack.truncate(len.saturating_sub(operand(ins.a)));
            }
            OpCode::Copy => stack.push(stack.peek(operand(ins.a))?),
            OpCode::Swap => stack.swap(operand(ins.a), operand(ins.b))?,
            OpCode::PushNil => stack.push(Value::Nil),
            OpCode::PushBool => stack.push(Value::Boolean(ins.a != 0)),
            OpCode::PushNumber => {
                let n = proto.numbers.get(operand(ins.a)).copied().ok_or_else(|| {
                    ScriptError::internal(format!("number constant {} out of range", ins.a))
                })?;
                stack.push(Value::Number(n));
            }
            OpCode::PushString => stack.push(Value::String(string_operand(proto, ins.a)?)),

            OpCode::Closure => self.make_closure(closure, proto, base, operand(ins.a))?,
            OpCode::NewTable => stack.push(Value::new_table(Table::with_origin(operand(ins.a)))),
            OpCode::TblInitN => {
                let value = stack.pop()?.to_scalar();
                let key = stack.pop()?.to_scalar();
                let target = stack.peek(0)?;
                let t = target
                    .as_table()
                    .ok_or_else(|| ScriptError::internal("table initializer on a non-table"))?;
                t.borrow_mut().set(key, value)?;
            }
            OpCode::TblInitI => {
                let value = stack.pop()?;
                let target = stack.peek(0)?;
                let t = target
                    .as_table()
                    .ok_or_else(|| ScriptError::internal("table initializer on a non-table"))?;
                let mut t = t.borrow_mut();
                if ins.a != 0 {
                    for v in value.tuple_values() {
                        t.init_next_array_key(v)?;
                    }
                } else {
                    t.init_next_array_key(value.to_scalar())?;
                }
            }

            OpCode::Load => {
                let sym = self.symbol_operand(proto, ins.a)?;
                return match &sym {
                    SymbolRef::Global { name, env } => {
                        let env = self.read_symbol(env, closure, base)?;
                        Ok(self.index_value(env, Value::String(name.clone()), ip + 1)?.into())
                    }
                    other => {
                        stack.push(self.read_symbol(other, closure, base)?);
                        Ok(Flow::Next)
                    }
                };
            }
            OpCode::Store => {
                let sym = self.symbol_operand(proto, ins.a)?;
                let value = if ins.b > 0 {
                    stack
                        .peek(0)?
                        .tuple_values()
                        .get((ins.b - 1) as usize)
                        .map(Value::to_scalar)
                        .unwrap_or(Value::Nil)
                } else {
                    stack.pop()?.to_scalar()
                };
                return match &sym {
                    SymbolRef::Global { name, env } => {
                        let env = self.read_symbol(env, closure, base)?;
                        Ok(self
                            .set_index_value(env, Value::String(name.clone()), value, ip + 1)?
                            .into())
                    }
                    other => {
                        self.write_symbol(other, closure, base, value)?;
                        Ok(Flow::Next)
                    }
                };
            }

            OpCode::Index => {
                let key = if ins.a >= 0 {
                    Value::String(string_operand(proto, ins.a)?)
                } else {
                    stack.pop()?.to_scalar()
                };
                let obj = stack.pop()?.to_scalar();
                return Ok(self.index_value(obj, key, ip + 1)?.into());
            }
            OpCode::IndexSet => {
                let key = if ins.a >= 0 {
                    Value::String(string_operand(proto, ins.a)?)
                } else {
                    stack.pop()?.to_scalar()
                };
                let obj = stack.pop()?.to_scalar();
                let value = stack.pop()?.to_scalar();
                return Ok(self.set_index_value(obj, key, value, ip + 1)?.into());
            }
            OpCode::IndexMulti => {
                let keys: Vec<Value> = stack
                    .split_off(stack.len().saturating_sub(operand(ins.a)))?
                    .iter()
                    .map(Value::to_scalar)
                    .collect();
                let obj = stack.pop()?.to_scalar();
                let t = obj.as_table().ok_or_else(|| RuntimeError::index_on(&obj))?;
                stack.push(table::get_path(t, &keys)?);
            }
            OpCode::SelfIndex => {
                let obj = stack.pop()?.to_scalar();
                let method = self.index_nested(obj.clone(), Value::String(string_operand(proto, ins.a)?))?;
                stack.push(method);
                stack.push(obj);
            }

            OpCode::BeginFn => self.begin_function(proto, base, ins)?,
            OpCode::Call | OpCode::ThisCall => {
                let flags = if ins.op == OpCode::ThisCall {
                    FrameFlags::METHOD_CALL
                } else {
                    FrameFlags::NONE
                };
                let step = self.perform_call(
                    operand(ins.a),
                    ip + 1,
                    flags,
                    FrameHandlers::default(),
                    call_name(proto, ins.b),
                )?;
                return Ok(step.into());
            }
            OpCode::TailCall => return Ok(self.tail_call(operand(ins.a), call_name(proto, ins.b), ip)?.into()),
            OpCode::Ret => {
                let result = if ins.a == 0 { Value::Void } else { stack.pop()? };
                let frame = self.pop_frame()?;
                return Ok(self.finish_frame(frame, result, false)?.into());
            }

            OpCode::Jump => return Ok(Flow::Jump(jump_target(ins.a)?)),
            OpCode::Jf => {
                if !stack.pop()?.cast_to_bool() {
                    return Ok(Flow::Jump(jump_target(ins.a)?));
                }
            }
            OpCode::JNil => {
                if stack.peek(0)?.to_scalar().is_nil() {
                    stack.pop()?;
                    return Ok(Flow::Jump(jump_target(ins.a)?));
                }
            }
            OpCode::JtOrPop => {
                if stack.peek(0)?.cast_to_bool() {
                    return Ok(Flow::Jump(jump_target(ins.a)?));
                }
                stack.pop()?;
            }
            OpCode::JfOrPop => {
                if !stack.peek(0)?.cast_to_bool() {
                    return Ok(Flow::Jump(jump_target(ins.a)?));
                }
                stack.pop()?;
            }

            OpCode::ToNum => {
                let offset = operand(ins.a);
                let v = stack.peek(offset)?;
                let n = v
                    .cast_to_number()
                    .ok_or_else(|| ScriptError::runtime("'for' value must be a number"))?;
                stack.poke(offset, Value::Number(n))?;
            }
            OpCode::Jfor => {
                let var = number_at(&stack, 0)?;
                let step = number_at(&stack, 1)?;
                let limit = number_at(&stack, 2)?;
                let done = if step > 0.0 { var > limit } else { var < limit };
                if done {
                    return Ok(Flow::Jump(jump_target(ins.a)?));
                }
            }
            OpCode::Incr => {
                let var = number_at(&stack, 0)?;
                let step = number_at(&stack, 1)?;
                stack.poke(0, Value::Number(var + step))?;
            }
            OpCode::IterPrep => self.iter_prep()?,
            OpCode::IterUpd => {
                let result = stack.pop()?;
                stack.poke(0, result.to_scalar())?;
                stack.push(result);
            }

            OpCode::Add
            | OpCode::Sub
            | OpCode::Mul
            | OpCode::Div
            | OpCode::Mod
            | OpCode::Power => return Ok(self.arithmetic(ins.op, ip + 1)?.into()),
            OpCode::Neg => return Ok(self.negate(ip + 1)?.into()),
            OpCode::Concat => return Ok(self.concat(ip + 1)?.into()),
            OpCode::Len => return Ok(self.length(ip + 1)?.into()),
            OpCode::Eq => {
                let b = stack.pop()?.to_scalar();
                let a = stack.pop()?.to_scalar();
                let eq = self.values_equal(&a, &b)?;
                stack.push(Value::Boolean(eq));
            }
            OpCode::Less => {
                let b = stack.pop()?.to_scalar();
                let a = stack.pop()?.to_scalar();
                let lt = self.less_than(&a, &b)?;
                stack.push(Value::Boolean(lt));
            }
            OpCode::LessEq => {
                let b = stack.pop()?.to_scalar();
                let a = stack.pop()?.to_scalar();
                let le = self.less_equal(&a, &b)?;
                stack.push(Value::Boolean(le));
            }
            OpCode::Not => {
                let v = stack.pop()?;
                stack.push(Value::Boolean(!v.cast_to_bool()));
            }
            OpCode::CNot => {
                let v = stack.pop()?;
                stack.push(Value::Boolean(v.cast_to_bool() != (ins.a != 0)));
            }
            OpCode::ToBool => {
                let v = stack.pop()?;
                stack.push(Value::Boolean(v.cast_to_bool()));
            }

            OpCode::MkTuple => {
                let mut values = stack.split_off(stack.len().saturating_sub(operand(ins.a)))?;
                // only the last element may contribute several values
                let last = values.len().saturating_sub(1);
                for v in values.iter_mut().take(last) {
                    *v = v.to_scalar();
                }
                stack.push(Value::new_tuple_nested(values));
            }
            OpCode::Scalar => {
                let v = stack.pop()?;
                stack.push(v.to_scalar());
            }
            OpCode::ExpTuple => {
                let mut values: Vec<Value> =
                    stack.pop()?.tuple_values().iter().map(Value::to_scalar).collect();
                if ins.a > 0 {
                    values.resize(operand(ins.a), Value::Nil);
                }
                stack.extend(values);
            }
            OpCode::CloseUp => self.close_locals(base, operand(ins.a), operand(ins.b))?,
            OpCode::MkRange => {
                let step = if ins.a == 3 { Some(stack.pop()?) } else { None };
                let to = stack.pop()?;
                let from = stack.pop()?;
                let number = |v: &Value| {
                    v.cast_to_number()
                        .ok_or_else(|| ScriptError::runtime("range bounds must be numbers"))
                };
                let step = match &step {
                    Some(s) => number(s)?,
                    None => 1.0,
                };
                stack.push(Value::new_range(number(&from)?, number(&to)?, step));
            }
        }
        Ok(Flow::Next)
    }

    fn symbol_operand(&self, proto: &FunctionProto, index: i32) -> ScriptResult<SymbolRef> {
        proto
            .symbols
            .get(operand(index))
            .cloned()
            .ok_or_else(|| ScriptError::internal(format!("symbol {} out of range", index)))
    }

    /// Function prologue: arguments above `base` become parameter slots
    fn begin_function(&mut self, proto: &FunctionProto, base: usize, ins: Instruction) -> ScriptResult<()> {
        let is_method_call = self
            .frames
            .last()
            .map(|f| f.flags.contains(FrameFlags::METHOD_CALL))
            .unwrap_or(false);
        let mut args = self.stack.split_off(base)?;
        if let Some(Value::Tuple(last)) = args.last().cloned() {
            args.pop();
            args.extend(last.iter().cloned());
        }
        if proto.flags.contains(ProtoFlags::IMPLICIT_THIS) && !is_method_call {
            args.insert(0, Value::Nil);
        }

        let params = operand(ins.a);
        let varargs = ins.b != 0;
        let slots = proto.locals.len().max(params + varargs as usize);
        let mut locals = Vec::with_capacity(slots);
        let mut rest = args.into_iter();
        for _ in 0..params {
            locals.push(rest.next().map(|v| v.to_scalar()).unwrap_or(Value::Nil));
        }
        if varargs {
            locals.push(Value::new_tuple(rest.map(|v| v.to_scalar()).collect()));
        }
        locals.resize(slots, Value::Nil);
        self.stack.extend(locals);
        Ok(())
    }

    fn tail_call(&mut self, argc: usize, name: Option<Rc<str>>, ip: usize) -> ScriptResult<Step> {
        let threshold = self.shared.options.tail_call_threshold;
        let eligible = self.stack.len() > threshold
            && self.frames.len() > threshold
            && self.frames.last().map(|f| f.handlers.is_empty()).unwrap_or(false)
            && matches!(self.stack.peek(argc)?, Value::Function(_));
        if !eligible {
            return self.perform_call(argc, ip + 1, FrameFlags::NONE, FrameHandlers::default(), name);
        }

        let operands = self.stack.split_off(self.stack.len() - argc - 1)?;
        let frame = self.pop_frame()?;
        self.stack.extend(operands);
        vm_log!(self.shared.options, LogLevel::Verbose, "VM", "tail call reuses frame of '{}'", frame.display_name());
        let flags = frame.flags.intersect(FrameFlags::INHERITED) | FrameFlags::TAIL_CALL;
        self.perform_call(argc, frame.return_address, flags, FrameHandlers::default(), name)
    }

    fn make_closure(
        &mut self,
        closure: &ClosureRef,
        proto: &FunctionProto,
        base: usize,
        index: usize,
    ) -> ScriptResult<()> {
        let child = proto
            .protos
            .get(index)
            .cloned()
            .ok_or_else(|| ScriptError::internal(format!("nested function {} out of range", index)))?;
        let mut cells = Vec::with_capacity(child.upvalues.len());
        for desc in &child.upvalues {
            let cell = match desc {
                SymbolRef::Local { index, .. } => self.open_upvalue(base + index)?,
                SymbolRef::Upvalue { index, .. } => closure.upvalue(*index).cloned().ok_or_else(|| {
                    ScriptError::internal(format!("upvalue {} out of range in '{}'", index, closure.name()))
                })?,
                SymbolRef::DefaultEnv => Upvalue::new_closed(Value::Table(self.globals())),
                SymbolRef::Global { name, .. } => {
                    return Err(ScriptError::internal(format!("global '{}' cannot be captured", name)))
                }
            };
            cells.push(cell);
        }
        self.stack.push(Value::new_closure(Closure::new(child, cells)));
        Ok(())
    }

    /// Close upvalues over local slots `from..=to` and reset the slots
    fn close_locals(&mut self, base: usize, from: usize, to: usize) -> ScriptResult<()> {
        let frame = self
            .frames
            .last_mut()
            .ok_or_else(|| ScriptError::internal("close with an empty execution stack"))?;
        let (low, high) = (base + from, base + to);
        frame.open_upvalues.retain(|up| match up.stack_index() {
            Some(slot) if slot >= low && slot <= high => {
                up.close();
                false
            }
            Some(_) => true,
            None => false,
        });
        for slot in low..=high {
            self.stack.set(slot, Value::Nil);
        }
        Ok(())
    }

    /// `[iterable] -> [f, s, var]`
    fn iter_prep(&mut self) -> ScriptResult<()> {
        let v = self.stack.pop()?;
        let (f, s, var) = match v {
            Value::Tuple(items) => (
                items.first().map(Value::to_scalar).unwrap_or(Value::Nil),
                items.get(1).map(Value::to_scalar).unwrap_or(Value::Nil),
                items.get(2).map(Value::to_scalar).unwrap_or(Value::Nil),
            ),
            Value::Table(_) if self.unary_metamethod(&v, "__call").is_none() => {
                match self.unary_metamethod(&v, "__iterator") {
                    Some(handler) => {
                        let r = self.call_nested(handler, vec![v])?.tuple_values();
                        (
                            r.first().cloned().unwrap_or(Value::Nil),
                            r.get(1).cloned().unwrap_or(Value::Nil),
                            r.get(2).cloned().unwrap_or(Value::Nil),
                        )
                    }
                    None => (self.shared.table_iterator.clone(), v, Value::Nil),
                }
            }
            Value::Range(_) => (self.shared.range_iterator.clone(), v, Value::Nil),
            other => (other, Value::Nil, Value::Nil),
        };
        self.stack.extend([f, s, var]);
        Ok(())
    }
}

fn number_at(stack: &super::ValueStack, offset: usize) -> ScriptResult<f64> {
    stack
        .peek(offset)?
        .as_number()
        .ok_or_else(|| ScriptError::runtime("'for' value must be a number"))
}
