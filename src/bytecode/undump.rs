//! Function descriptor reader

use std::cell::RefCell;
use std::rc::Rc;

use super::{MAGIC, MAX_NESTING, VERSION};
use crate::error::{ScriptError, ScriptResult};
use crate::proto::{Annotation, FunctionProto, Instruction, OpCode, ProtoFlags, SourceRef};
use crate::symbol::{SymbolKind, SymbolRef};
use crate::value::{DataType, Table, Value};

fn malformed(message: impl Into<String>) -> ScriptError {
    ScriptError::Bytecode(message.into())
}

pub(super) struct BytecodeReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> BytecodeReader<'a> {
    pub(super) fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub(super) fn read_chunk(&mut self) -> ScriptResult<FunctionProto> {
        let magic = self.read_raw(MAGIC.len())?;
        if magic != MAGIC {
            return Err(malformed("not a compiled script (bad magic)"));
        }
        let version = self.read_byte()?;
        if version != VERSION {
            return Err(malformed(format!(
                "unsupported format version {} (expected {})",
                version, VERSION
            )));
        }
        let proto = self.read_function(0)?;
        if self.pos != self.data.len() {
            return Err(malformed(format!(
                "{} trailing bytes after function '{}'",
                self.data.len() - self.pos,
                proto.name
            )));
        }
        Ok(proto)
    }

    fn read_function(&mut self, depth: usize) -> ScriptResult<FunctionProto> {
        if depth > MAX_NESTING {
            return Err(malformed("functions nested too deeply"));
        }
        let mut proto = FunctionProto::new(&self.read_string()?);
        let flags = self.read_byte()?;
        proto.flags =
            ProtoFlags::from_bits(flags).ok_or_else(|| malformed(format!("invalid function flags {:#x}", flags)))?;

        let count = self.read_length()?;
        for _ in 0..count {
            let name: Rc<str> = self.read_string()?.into();
            let value = self.read_value(0)?;
            proto.annotations.push(Annotation { name, value });
        }

        let table = self.read_symbol_table()?;
        proto.locals = self.read_symbol_list(&table)?;
        proto.upvalues = self.read_symbol_list(&table)?;
        proto.symbols = self.read_symbol_list(&table)?;

        let count = self.read_length()?;
        for _ in 0..count {
            proto.protos.push(Rc::new(self.read_function(depth + 1)?));
        }

        let count = self.read_length()?;
        for _ in 0..count {
            proto.strings.push(self.read_string()?.into());
        }
        let count = self.read_length()?;
        for _ in 0..count {
            proto.numbers.push(self.read_f64()?);
        }

        let count = self.read_length()?;
        proto.code.reserve(count);
        for _ in 0..count {
            let byte = self.read_byte()?;
            let op = OpCode::from_u8(byte).ok_or_else(|| malformed(format!("unknown opcode {}", byte)))?;
            let a = self.read_i32()?;
            let b = self.read_i32()?;
            proto.code.push(Instruction::new(op, a, b));
        }

        proto.source_refs = self.read_source_refs(proto.code.len())?;
        Ok(proto)
    }

    fn read_symbol_table(&mut self) -> ScriptResult<Vec<SymbolRef>> {
        let count = self.read_length()?;
        let mut table: Vec<SymbolRef> = Vec::with_capacity(count);
        for _ in 0..count {
            let tag = self.read_byte()?;
            let kind = SymbolKind::from_u8(tag).ok_or_else(|| malformed(format!("unknown symbol kind {}", tag)))?;
            let index = self.read_u32()? as usize;
            let name = self.read_string()?;
            let env_link = self.read_u32()? as usize;
            let symbol = match kind {
                SymbolKind::Local => SymbolRef::local(index, &name),
                SymbolKind::Upvalue => SymbolRef::upvalue(index, &name),
                SymbolKind::DefaultEnv => SymbolRef::default_env(),
                SymbolKind::Global => {
                    let env = env_link
                        .checked_sub(1)
                        .and_then(|i| table.get(i))
                        .cloned()
                        .ok_or_else(|| malformed(format!("global '{}' has an invalid environment link", name)))?;
                    SymbolRef::global(&name, env)
                }
            };
            table.push(symbol);
        }
        Ok(table)
    }

    fn read_symbol_list(&mut self, table: &[SymbolRef]) -> ScriptResult<Vec<SymbolRef>> {
        let count = self.read_length()?;
        let mut list = Vec::with_capacity(count);
        for _ in 0..count {
            let i = self.read_u32()? as usize;
            let symbol = table
                .get(i)
                .cloned()
                .ok_or_else(|| malformed(format!("symbol index {} out of range", i)))?;
            list.push(symbol);
        }
        Ok(list)
    }

    fn read_source_refs(&mut self, count: usize) -> ScriptResult<Option<Vec<Option<SourceRef>>>> {
        match self.read_byte()? {
            0 => return Ok(None),
            1 => {}
            other => return Err(malformed(format!("invalid source table marker {}", other))),
        }
        let mut refs: Vec<Option<SourceRef>> = Vec::with_capacity(count);
        let mut previous: Option<SourceRef> = None;
        for _ in 0..count {
            let current = match self.read_byte()? {
                0 => None,
                1 => Some(previous.ok_or_else(|| malformed("source ref repeats a missing entry"))?),
                2 => Some(SourceRef {
                    source_id: self.read_u32()?,
                    from_line: self.read_u32()?,
                    to_line: self.read_u32()?,
                    from_char: self.read_u32()?,
                    to_char: self.read_u32()?,
                    is_stop_point: self.read_byte()? != 0,
                }),
                other => return Err(malformed(format!("invalid source ref tag {}", other))),
            };
            refs.push(current);
            previous = current;
        }
        Ok(Some(refs))
    }

    fn read_value(&mut self, depth: usize) -> ScriptResult<Value> {
        if depth > MAX_NESTING {
            return Err(malformed("annotation tables nested too deeply"));
        }
        let tag = self.read_byte()?;
        match DataType::from_u8(tag) {
            Some(DataType::Nil) => Ok(Value::Nil),
            Some(DataType::Boolean) => Ok(Value::Boolean(self.read_byte()? != 0)),
            Some(DataType::Number) => Ok(Value::Number(self.read_f64()?)),
            Some(DataType::String) => Ok(Value::new_string(self.read_string()?)),
            Some(DataType::Table) => {
                let count = self.read_length()?;
                let mut table = Table::new();
                for _ in 0..count {
                    let key = self.read_value(depth + 1)?;
                    let value = self.read_value(depth + 1)?;
                    table.set(key, value)?;
                }
                Ok(Value::Table(Rc::new(RefCell::new(table))))
            }
            _ => Err(malformed(format!("invalid annotation value tag {}", tag))),
        }
    }

    fn read_raw(&mut self, len: usize) -> ScriptResult<&'a [u8]> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|&end| end <= self.data.len())
            .ok_or_else(|| malformed("unexpected end of data"))?;
        let bytes = &self.data[self.pos..end];
        self.pos = end;
        Ok(bytes)
    }

    fn read_array<const N: usize>(&mut self) -> ScriptResult<[u8; N]> {
        let mut buf = [0u8; N];
        buf.copy_from_slice(self.read_raw(N)?);
        Ok(buf)
    }

    fn read_byte(&mut self) -> ScriptResult<u8> {
        Ok(self.read_array::<1>()?[0])
    }

    fn read_u32(&mut self) -> ScriptResult<u32> {
        Ok(u32::from_le_bytes(self.read_array()?))
    }

    fn read_i32(&mut self) -> ScriptResult<i32> {
        Ok(i32::from_le_bytes(self.read_array()?))
    }

    fn read_f64(&mut self) -> ScriptResult<f64> {
        Ok(f64::from_le_bytes(self.read_array()?))
    }

    /// A length, bounded by the bytes left so corrupt input cannot force
    /// huge allocations
    fn read_length(&mut self) -> ScriptResult<usize> {
        let len = self.read_u32()? as usize;
        if len > self.data.len() - self.pos {
            return Err(malformed(format!("length {} exceeds remaining data", len)));
        }
        Ok(len)
    }

    fn read_string(&mut self) -> ScriptResult<String> {
        let len = self.read_length()?;
        let bytes = self.read_raw(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| malformed("string is not valid UTF-8"))
    }
}
