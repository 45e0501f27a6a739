//! Function descriptor writer

use std::io::Write;

use super::{MAGIC, MAX_NESTING, VERSION};
use crate::error::{ScriptError, ScriptResult};
use crate::proto::{FunctionProto, SourceRef};
use crate::symbol::SymbolRef;
use crate::value::{DataType, Value};

pub(super) struct BytecodeWriter<W: Write> {
    writer: W,
}

impl<W: Write> BytecodeWriter<W> {
    pub(super) fn new(writer: W) -> Self {
        Self { writer }
    }

    pub(super) fn write_chunk(&mut self, proto: &FunctionProto) -> ScriptResult<()> {
        self.write_raw(&MAGIC)?;
        self.write_byte(VERSION)?;
        self.write_function(proto, 0)?;
        self.writer.flush()?;
        Ok(())
    }

    fn write_function(&mut self, proto: &FunctionProto, depth: usize) -> ScriptResult<()> {
        if depth > MAX_NESTING {
            return Err(ScriptError::Bytecode("functions nested too deeply".into()));
        }
        self.write_string(&proto.name)?;
        self.write_byte(proto.flags.bits())?;

        self.write_length(proto.annotations.len())?;
        for annotation in &proto.annotations {
            self.write_string(&annotation.name)?;
            self.write_value(&annotation.value, 0)?;
        }

        let table = SymbolTable::build(proto);
        self.write_length(table.entries.len())?;
        for (symbol, env_link) in &table.entries {
            self.write_symbol(symbol, *env_link)?;
        }
        for list in [&proto.locals, &proto.upvalues, &proto.symbols] {
            self.write_length(list.len())?;
            for symbol in list {
                self.write_length(table.position(symbol)?)?;
            }
        }

        self.write_length(proto.protos.len())?;
        for child in &proto.protos {
            self.write_function(child, depth + 1)?;
        }

        self.write_length(proto.strings.len())?;
        for s in &proto.strings {
            self.write_string(s)?;
        }
        self.write_length(proto.numbers.len())?;
        for n in &proto.numbers {
            self.write_raw(&n.to_le_bytes())?;
        }

        self.write_length(proto.code.len())?;
        for ins in &proto.code {
            self.write_byte(ins.op as u8)?;
            self.write_raw(&ins.a.to_le_bytes())?;
            self.write_raw(&ins.b.to_le_bytes())?;
        }

        self.write_source_refs(proto)
    }

    fn write_symbol(&mut self, symbol: &SymbolRef, env_link: usize) -> ScriptResult<()> {
        self.write_byte(symbol.kind() as u8)?;
        self.write_length(symbol.index().unwrap_or(0))?;
        self.write_string(symbol.name())?;
        self.write_length(env_link)
    }

    fn write_source_refs(&mut self, proto: &FunctionProto) -> ScriptResult<()> {
        let refs = match &proto.source_refs {
            Some(refs) => refs,
            None => return self.write_byte(0),
        };
        if refs.len() != proto.code.len() {
            return Err(ScriptError::Bytecode(format!(
                "function '{}' has {} source refs for {} instructions",
                proto.name,
                refs.len(),
                proto.code.len()
            )));
        }
        self.write_byte(1)?;
        let mut previous: Option<&SourceRef> = None;
        for current in refs {
            match (current, previous) {
                (None, _) => self.write_byte(0)?,
                (Some(sr), Some(prev)) if sr == prev => self.write_byte(1)?,
                (Some(sr), _) => {
                    self.write_byte(2)?;
                    for n in [sr.source_id, sr.from_line, sr.to_line, sr.from_char, sr.to_char] {
                        self.write_raw(&n.to_le_bytes())?;
                    }
                    self.write_byte(sr.is_stop_point as u8)?;
                }
            }
            previous = current.as_ref();
        }
        Ok(())
    }

    /// Annotation values: nil, booleans, numbers, strings and tables of them
    fn write_value(&mut self, value: &Value, depth: usize) -> ScriptResult<()> {
        if depth > MAX_NESTING {
            return Err(ScriptError::Bytecode("annotation tables nested too deeply".into()));
        }
        match value {
            Value::Nil => self.write_byte(DataType::Nil as u8),
            Value::Boolean(b) => {
                self.write_byte(DataType::Boolean as u8)?;
                self.write_byte(*b as u8)
            }
            Value::Number(n) => {
                self.write_byte(DataType::Number as u8)?;
                self.write_raw(&n.to_le_bytes())
            }
            Value::String(s) => {
                self.write_byte(DataType::String as u8)?;
                self.write_string(s)
            }
            Value::Table(t) => {
                let pairs: Vec<(Value, Value)> = t.borrow().pairs().collect();
                self.write_byte(DataType::Table as u8)?;
                self.write_length(pairs.len())?;
                for (k, v) in &pairs {
                    self.write_value(k, depth + 1)?;
                    self.write_value(v, depth + 1)?;
                }
                Ok(())
            }
            other => Err(ScriptError::Bytecode(format!(
                "cannot serialize a {} annotation value",
                other.type_name()
            ))),
        }
    }

    fn write_byte(&mut self, byte: u8) -> ScriptResult<()> {
        self.write_raw(&[byte])
    }

    fn write_raw(&mut self, data: &[u8]) -> ScriptResult<()> {
        self.writer.write_all(data)?;
        Ok(())
    }

    fn write_length(&mut self, len: usize) -> ScriptResult<()> {
        let len = u32::try_from(len)
            .map_err(|_| ScriptError::Bytecode(format!("length {} does not fit in 32 bits", len)))?;
        self.write_raw(&len.to_le_bytes())
    }

    fn write_string(&mut self, s: &str) -> ScriptResult<()> {
        self.write_length(s.len())?;
        self.write_raw(s.as_bytes())
    }
}

/// Distinct symbols of one function, environments before the globals
/// that use them
struct SymbolTable {
    entries: Vec<(SymbolRef, usize)>,
}

impl SymbolTable {
    fn build(proto: &FunctionProto) -> Self {
        let mut table = SymbolTable { entries: Vec::new() };
        for symbol in proto.locals.iter().chain(&proto.upvalues).chain(&proto.symbols) {
            table.add(symbol);
        }
        table
    }

    fn add(&mut self, symbol: &SymbolRef) -> usize {
        if let Some(i) = self.entries.iter().position(|(s, _)| s == symbol) {
            return i;
        }
        let env_link = match symbol.env() {
            Some(env) => self.add(env) + 1,
            None => 0,
        };
        self.entries.push((symbol.clone(), env_link));
        self.entries.len() - 1
    }

    fn position(&self, symbol: &SymbolRef) -> ScriptResult<usize> {
        self.entries
            .iter()
            .position(|(s, _)| s == symbol)
            .ok_or_else(|| ScriptError::internal(format!("symbol {} missing from table", symbol)))
    }
}
