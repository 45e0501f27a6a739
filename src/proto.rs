//! Compiled function artifacts
//!
//! A `FunctionProto` is what the compiler hands to the VM: a flat
//! instruction array plus the pools its operands refer to. Protos are
//! immutable once built and shared between every closure created from them.
//!
//! The VM is a stack machine. Each instruction carries an opcode and two
//! integer operands whose meaning depends on the opcode (see [`OpCode`]).

use std::fmt;
use std::ops::BitOr;
use std::rc::Rc;

use crate::symbol::SymbolRef;
use crate::value::Value;

/// Instruction opcodes.
///
/// Stack effects are written `[inputs] -> [outputs]`, top of stack last.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum OpCode {
    /// Does nothing
    Nop,
    /// Marker emitted for debugger stop points; does nothing
    Debug,
    /// Pop `a` values
    Pop,
    /// Push a copy of the value `a` slots below the top
    Copy,
    /// Swap the values `a` and `b` slots below the top
    Swap,
    PushNil,
    /// Push `a != 0`
    PushBool,
    /// Push `numbers[a]`
    PushNumber,
    /// Push `strings[a]`
    PushString,
    /// Push a closure over `protos[a]`
    Closure,
    /// Push a new table with index origin `a`
    NewTable,
    /// `[t, k, v] -> [t]`, raw `t[k] = v`
    TblInitN,
    /// `[t, v] -> [t]`, append `v`; when `a != 0` a tuple `v` is spliced
    TblInitI,
    /// Push the value of `symbols[a]`
    Load,
    /// `b == 0`: pop a value into `symbols[a]`; `b > 0`: store element
    /// `b - 1` of the tuple on top into `symbols[a]` without popping
    Store,
    /// `[obj] -> [obj[strings[a]]]`, or `[obj, k] -> [obj[k]]` when `a < 0`
    Index,
    /// `[v, obj] -> []` for `obj[strings[a]] = v`, `[v, obj, k] -> []` when `a < 0`
    IndexSet,
    /// `[obj, k1..ka] -> [obj[k1][k2]..[ka]]`
    IndexMulti,
    /// `[obj] -> [obj[strings[a]], obj]`
    SelfIndex,
    /// Function prologue: bind `a` parameters, `b != 0` collects varargs
    BeginFn,
    /// `[f, args(a)] -> [result]`; `b > 0` names the callee `strings[b - 1]`
    Call,
    /// Same as `Call` with method-call semantics
    ThisCall,
    /// Call in tail position, always followed by `Ret 1`
    TailCall,
    /// Return nothing (`a == 0`) or the popped value (`a == 1`)
    Ret,
    /// Jump to `a`
    Jump,
    /// Pop; jump to `a` if false
    Jf,
    /// If the top is nil pop it and jump to `a`, otherwise leave it
    JNil,
    /// If the top is true jump to `a` keeping it, otherwise pop it
    JtOrPop,
    /// If the top is false jump to `a` keeping it, otherwise pop it
    JfOrPop,
    /// Convert the value `a` slots below the top to a number
    ToNum,
    /// `[limit, step, var]`: jump to `a` when `var` is past `limit`
    Jfor,
    /// `[step, var] -> [step, var + step]`
    Incr,
    /// `[iterable] -> [f, s, var]` for generic `for`
    IterPrep,
    /// `[f, s, var, r] -> [f, s, r[0], r]`
    IterUpd,
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Power,
    Neg,
    Concat,
    Len,
    Not,
    Eq,
    Less,
    LessEq,
    /// Negate the boolean on top when `a != 0`
    CNot,
    /// Convert the top to a boolean
    ToBool,
    /// Pop `a` values and push them as a tuple
    MkTuple,
    /// Collapse the top to a scalar
    Scalar,
    /// Expand the tuple on top; `a > 0` pads or truncates to `a` values
    ExpTuple,
    /// Close upvalues of local slots `a..=b` and reset them to nil
    CloseUp,
    /// `[from, to] -> [range]`, or `[from, to, step]` when `a == 3`
    MkRange,
    /// Raises an internal error
    Invalid,
}

impl OpCode {
    const ALL: [OpCode; 55] = [
        OpCode::Nop,
        OpCode::Debug,
        OpCode::Pop,
        OpCode::Copy,
        OpCode::Swap,
        OpCode::PushNil,
        OpCode::PushBool,
        OpCode::PushNumber,
        OpCode::PushString,
        OpCode::Closure,
        OpCode::NewTable,
        OpCode::TblInitN,
        OpCode::TblInitI,
        OpCode::Load,
        OpCode::Store,
        OpCode::Index,
        OpCode::IndexSet,
        OpCode::IndexMulti,
        OpCode::SelfIndex,
        OpCode::BeginFn,
        OpCode::Call,
        OpCode::ThisCall,
        OpCode::TailCall,
        OpCode::Ret,
        OpCode::Jump,
        OpCode::Jf,
        OpCode::JNil,
        OpCode::JtOrPop,
        OpCode::JfOrPop,
        OpCode::ToNum,
        OpCode::Jfor,
        OpCode::Incr,
        OpCode::IterPrep,
        OpCode::IterUpd,
        OpCode::Add,
        OpCode::Sub,
        OpCode::Mul,
        OpCode::Div,
        OpCode::Mod,
        OpCode::Power,
        OpCode::Neg,
        OpCode::Concat,
        OpCode::Len,
        OpCode::Not,
        OpCode::Eq,
        OpCode::Less,
        OpCode::LessEq,
        OpCode::CNot,
        OpCode::ToBool,
        OpCode::MkTuple,
        OpCode::Scalar,
        OpCode::ExpTuple,
        OpCode::CloseUp,
        OpCode::MkRange,
        OpCode::Invalid,
    ];

    pub fn from_u8(byte: u8) -> Option<OpCode> {
        OpCode::ALL.get(byte as usize).copied()
    }

    pub fn mnemonic(self) -> String {
        format!("{:?}", self).to_uppercase()
    }
}

/// One VM instruction
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Instruction {
    pub op: OpCode,
    pub a: i32,
    pub b: i32,
}

impl Instruction {
    pub fn new(op: OpCode, a: i32, b: i32) -> Self {
        Instruction { op, a, b }
    }
}

/// Source span of an instruction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceRef {
    pub source_id: u32,
    pub from_line: u32,
    pub to_line: u32,
    pub from_char: u32,
    pub to_char: u32,
    /// Debugger checkpoints fire only on stop points
    pub is_stop_point: bool,
}

impl SourceRef {
    pub fn new(source_id: u32, line: u32, from_char: u32, to_char: u32) -> Self {
        SourceRef {
            source_id,
            from_line: line,
            to_line: line,
            from_char,
            to_char,
            is_stop_point: false,
        }
    }

    pub fn stop_point(mut self) -> Self {
        self.is_stop_point = true;
        self
    }

    /// `name:(line,from-to)`, or `name:line` in legacy mode
    pub fn format_location(&self, source_name: &str, legacy: bool) -> String {
        if legacy {
            return format!("{}:{}", source_name, self.from_line);
        }
        if self.from_line == self.to_line {
            if self.from_char == self.to_char {
                format!("{}:({},{})", source_name, self.from_line, self.from_char)
            } else {
                format!(
                    "{}:({},{}-{})",
                    source_name, self.from_line, self.from_char, self.to_char
                )
            }
        } else {
            format!(
                "{}:({},{}-{},{})",
                source_name, self.from_line, self.from_char, self.to_line, self.to_char
            )
        }
    }
}

/// Compiler-attached metadata on a function
#[derive(Debug, Clone, PartialEq)]
pub struct Annotation {
    pub name: Rc<str>,
    pub value: Value,
}

/// Function-level flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ProtoFlags(u8);

impl ProtoFlags {
    pub const NONE: ProtoFlags = ProtoFlags(0);
    /// Top-level chunk of a compiled source
    pub const IS_CHUNK: ProtoFlags = ProtoFlags(1);
    /// Declared with method syntax; the first parameter is `self`
    pub const TAKES_SELF: ProtoFlags = ProtoFlags(2);
    /// A nil `self` is inserted when called without method syntax
    pub const IMPLICIT_THIS: ProtoFlags = ProtoFlags(4);

    pub fn contains(self, other: ProtoFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn bits(self) -> u8 {
        self.0
    }

    pub fn from_bits(bits: u8) -> Option<ProtoFlags> {
        if bits & !7 == 0 {
            Some(ProtoFlags(bits))
        } else {
            None
        }
    }
}

impl BitOr for ProtoFlags {
    type Output = ProtoFlags;

    fn bitor(self, rhs: ProtoFlags) -> ProtoFlags {
        ProtoFlags(self.0 | rhs.0)
    }
}

impl fmt::Display for ProtoFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names = Vec::new();
        if self.contains(ProtoFlags::IS_CHUNK) {
            names.push("chunk");
        }
        if self.contains(ProtoFlags::TAKES_SELF) {
            names.push("self");
        }
        if self.contains(ProtoFlags::IMPLICIT_THIS) {
            names.push("implicit-this");
        }
        write!(f, "[{}]", names.join(","))
    }
}

/// Immutable compiled function
#[derive(Debug, Clone, PartialEq)]
pub struct FunctionProto {
    pub name: Rc<str>,
    pub flags: ProtoFlags,
    pub annotations: Vec<Annotation>,
    /// Local slots; parameters come first
    pub locals: Vec<SymbolRef>,
    /// Capture descriptors, resolved against the creating frame
    pub upvalues: Vec<SymbolRef>,
    /// Operands of `Load` and `Store`
    pub symbols: Vec<SymbolRef>,
    pub protos: Vec<Rc<FunctionProto>>,
    pub strings: Vec<Rc<str>>,
    pub numbers: Vec<f64>,
    pub code: Vec<Instruction>,
    /// One entry per instruction when present
    pub source_refs: Option<Vec<Option<SourceRef>>>,
}

impl FunctionProto {
    pub fn new(name: &str) -> Self {
        FunctionProto {
            name: name.into(),
            flags: ProtoFlags::NONE,
            annotations: Vec::new(),
            locals: Vec::new(),
            upvalues: Vec::new(),
            symbols: Vec::new(),
            protos: Vec::new(),
            strings: Vec::new(),
            numbers: Vec::new(),
            code: Vec::new(),
            source_refs: None,
        }
    }

    pub fn source_ref(&self, ip: usize) -> Option<&SourceRef> {
        self.source_refs.as_ref()?.get(ip)?.as_ref()
    }

    pub fn annotation(&self, name: &str) -> Option<&Value> {
        self.annotations
            .iter()
            .find(|a| &*a.name == name)
            .map(|a| &a.value)
    }

    fn operand_comment(&self, ins: &Instruction) -> Option<String> {
        let string = |i: i32| self.strings.get(i as usize).map(|s| format!("{:?}", s));
        match ins.op {
            OpCode::PushNumber => self.numbers.get(ins.a as usize).map(|n| format!("{:?}", n)),
            OpCode::PushString | OpCode::SelfIndex => string(ins.a),
            OpCode::Index | OpCode::IndexSet if ins.a >= 0 => string(ins.a),
            OpCode::Load | OpCode::Store => self.symbols.get(ins.a as usize).map(|s| s.to_string()),
            OpCode::Closure => self.protos.get(ins.a as usize).map(|p| format!("function {}", p.name)),
            OpCode::Call | OpCode::ThisCall | OpCode::TailCall if ins.b > 0 => string(ins.b - 1),
            _ => None,
        }
    }

    fn write_disassembly(&self, f: &mut fmt::Formatter<'_>, depth: usize) -> fmt::Result {
        let pad = "  ".repeat(depth);
        writeln!(f, "{}function {} {}", pad, self.name, self.flags)?;
        for a in &self.annotations {
            writeln!(f, "{}  .annotation {} = {:?}", pad, a.name, a.value)?;
        }
        fn join(syms: &[SymbolRef]) -> String {
            syms.iter().map(|s| s.to_string()).collect::<Vec<_>>().join(", ")
        }
        writeln!(f, "{}  .locals {}", pad, join(&self.locals))?;
        writeln!(f, "{}  .upvalues {}", pad, join(&self.upvalues))?;
        writeln!(f, "{}  .symbols {}", pad, join(&self.symbols))?;
        writeln!(f, "{}  .strings {:?}", pad, self.strings)?;
        writeln!(f, "{}  .numbers {:?}", pad, self.numbers)?;
        for (ip, ins) in self.code.iter().enumerate() {
            write!(f, "{}  {:04}  {:<10} {:>4} {:>4}", pad, ip, ins.op.mnemonic(), ins.a, ins.b)?;
            if let Some(comment) = self.operand_comment(ins) {
                write!(f, "  ; {}", comment)?;
            }
            if let Some(sr) = self.source_ref(ip) {
                let location = sr.format_location(&format!("#{}", sr.source_id), false);
                write!(f, "  @{}{}", location, if sr.is_stop_point { "!" } else { "" })?;
            }
            writeln!(f)?;
        }
        for child in &self.protos {
            child.write_disassembly(f, depth + 1)?;
        }
        Ok(())
    }
}

/// Human-readable disassembly, nested functions included
impl fmt::Display for FunctionProto {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.write_disassembly(f, 0)
    }
}

/// Assembler for building protos by hand.
///
/// Chunks capture the global table as upvalue 0 (`_ENV`); nested functions
/// capture their parent's upvalue 0, so `global()` symbols resolve the same
/// way at every nesting level.
pub struct ProtoBuilder {
    proto: FunctionProto,
    current_source: Option<SourceRef>,
}

impl ProtoBuilder {
    /// Builder for a top-level chunk
    pub fn chunk(name: &str) -> Self {
        let mut proto = FunctionProto::new(name);
        proto.flags = ProtoFlags::IS_CHUNK;
        proto.upvalues.push(SymbolRef::DefaultEnv);
        ProtoBuilder { proto, current_source: None }
    }

    /// Builder for a function nested in a chunk or another function
    pub fn function(name: &str) -> Self {
        let mut proto = FunctionProto::new(name);
        proto.upvalues.push(SymbolRef::upvalue(0, "_ENV"));
        ProtoBuilder { proto, current_source: None }
    }

    pub fn set_flags(&mut self, flags: ProtoFlags) -> &mut Self {
        self.proto.flags = self.proto.flags | flags;
        self
    }

    pub fn annotate(&mut self, name: &str, value: Value) -> &mut Self {
        self.proto.annotations.push(Annotation { name: name.into(), value });
        self
    }

    /// Declare the next local slot
    pub fn local(&mut self, name: &str) -> SymbolRef {
        let sym = SymbolRef::local(self.proto.locals.len(), name);
        self.proto.locals.push(sym.clone());
        sym
    }

    /// Capture `parent_symbol` from the creating frame as a new upvalue
    pub fn capture(&mut self, parent_symbol: SymbolRef) -> SymbolRef {
        let index = self.proto.upvalues.len();
        let sym = SymbolRef::upvalue(index, parent_symbol.name());
        self.proto.upvalues.push(parent_symbol);
        sym
    }

    /// The `_ENV` upvalue
    pub fn env(&self) -> SymbolRef {
        SymbolRef::upvalue(0, "_ENV")
    }

    /// A global resolved through `_ENV`
    pub fn global(&self, name: &str) -> SymbolRef {
        SymbolRef::global(name, self.env())
    }

    fn symbol_index(&mut self, sym: &SymbolRef) -> i32 {
        match self.proto.symbols.iter().position(|s| s == sym) {
            Some(i) => i as i32,
            None => {
                self.proto.symbols.push(sym.clone());
                (self.proto.symbols.len() - 1) as i32
            }
        }
    }

    pub fn string_index(&mut self, s: &str) -> i32 {
        match self.proto.strings.iter().position(|x| &**x == s) {
            Some(i) => i as i32,
            None => {
                self.proto.strings.push(s.into());
                (self.proto.strings.len() - 1) as i32
            }
        }
    }

    pub fn number_index(&mut self, n: f64) -> i32 {
        match self.proto.numbers.iter().position(|x| x.to_bits() == n.to_bits()) {
            Some(i) => i as i32,
            None => {
                self.proto.numbers.push(n);
                (self.proto.numbers.len() - 1) as i32
            }
        }
    }

    /// Source span attached to instructions emitted from now on
    pub fn source(&mut self, source_ref: Option<SourceRef>) -> &mut Self {
        if self.proto.source_refs.is_none() {
            self.proto.source_refs = Some(vec![None; self.proto.code.len()]);
        }
        self.current_source = source_ref;
        self
    }

    /// Emit an instruction, returning its address
    pub fn emit(&mut self, op: OpCode, a: i32, b: i32) -> usize {
        self.proto.code.push(Instruction::new(op, a, b));
        if let Some(refs) = self.proto.source_refs.as_mut() {
            refs.push(self.current_source);
        }
        self.proto.code.len() - 1
    }

    pub fn op(&mut self, op: OpCode) -> usize {
        self.emit(op, 0, 0)
    }

    /// Address of the next instruction
    pub fn here(&self) -> usize {
        self.proto.code.len()
    }

    pub fn begin_fn(&mut self, params: usize, varargs: bool) -> usize {
        self.emit(OpCode::BeginFn, params as i32, varargs as i32)
    }

    pub fn push_nil(&mut self) -> usize {
        self.op(OpCode::PushNil)
    }

    pub fn push_bool(&mut self, b: bool) -> usize {
        self.emit(OpCode::PushBool, b as i32, 0)
    }

    pub fn push_number(&mut self, n: f64) -> usize {
        let index = self.number_index(n);
        self.emit(OpCode::PushNumber, index, 0)
    }

    pub fn push_string(&mut self, s: &str) -> usize {
        let index = self.string_index(s);
        self.emit(OpCode::PushString, index, 0)
    }

    pub fn load(&mut self, sym: &SymbolRef) -> usize {
        let index = self.symbol_index(sym);
        self.emit(OpCode::Load, index, 0)
    }

    pub fn store(&mut self, sym: &SymbolRef) -> usize {
        let index = self.symbol_index(sym);
        self.emit(OpCode::Store, index, 0)
    }

    /// Store element `item` (0-based) of the tuple on top, leaving it there
    pub fn store_item(&mut self, sym: &SymbolRef, item: usize) -> usize {
        let index = self.symbol_index(sym);
        self.emit(OpCode::Store, index, item as i32 + 1)
    }

    pub fn index(&mut self, key: Option<&str>) -> usize {
        let a = key.map(|k| self.string_index(k)).unwrap_or(-1);
        self.emit(OpCode::Index, a, 0)
    }

    pub fn index_set(&mut self, key: Option<&str>) -> usize {
        let a = key.map(|k| self.string_index(k)).unwrap_or(-1);
        self.emit(OpCode::IndexSet, a, 0)
    }

    pub fn self_index(&mut self, method: &str) -> usize {
        let a = self.string_index(method);
        self.emit(OpCode::SelfIndex, a, 0)
    }

    pub fn new_table(&mut self, origin: usize) -> usize {
        self.emit(OpCode::NewTable, origin as i32, 0)
    }

    pub fn closure(&mut self, child: FunctionProto) -> usize {
        self.proto.protos.push(Rc::new(child));
        let index = self.proto.protos.len() as i32 - 1;
        self.emit(OpCode::Closure, index, 0)
    }

    fn call_op(&mut self, op: OpCode, argc: usize, name: Option<&str>) -> usize {
        let b = name.map(|n| self.string_index(n) + 1).unwrap_or(0);
        self.emit(op, argc as i32, b)
    }

    pub fn call(&mut self, argc: usize, name: Option<&str>) -> usize {
        self.call_op(OpCode::Call, argc, name)
    }

    /// Method call; `argc` counts the receiver
    pub fn this_call(&mut self, argc: usize, name: Option<&str>) -> usize {
        self.call_op(OpCode::ThisCall, argc, name)
    }

    /// Tail call followed by its mandatory `Ret 1`
    pub fn tail_call(&mut self, argc: usize, name: Option<&str>) -> usize {
        let at = self.call_op(OpCode::TailCall, argc, name);
        self.ret(1);
        at
    }

    pub fn ret(&mut self, values: usize) -> usize {
        self.emit(OpCode::Ret, values.min(1) as i32, 0)
    }

    /// Emit a jump with an unresolved target; resolve it with [`patch`](Self::patch)
    pub fn jump(&mut self, op: OpCode) -> usize {
        self.emit(op, -1, 0)
    }

    pub fn jump_to(&mut self, op: OpCode, target: usize) -> usize {
        self.emit(op, target as i32, 0)
    }

    /// Point the jump at `at` to the next instruction
    pub fn patch(&mut self, at: usize) {
        let target = self.here() as i32;
        self.proto.code[at].a = target;
    }

    pub fn build(self) -> FunctionProto {
        self.proto
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opcode_roundtrip() {
        for byte in 0..=54u8 {
            let op = OpCode::from_u8(byte).unwrap();
            assert_eq!(op as u8, byte);
        }
        assert!(OpCode::from_u8(55).is_none());
        assert!(OpCode::from_u8(255).is_none());
    }

    #[test]
    fn test_location_formats() {
        let sr = SourceRef::new(0, 3, 4, 10);
        assert_eq!(sr.format_location("main", false), "main:(3,4-10)");
        assert_eq!(sr.format_location("main", true), "main:3");
        let point = SourceRef::new(0, 1, 2, 2);
        assert_eq!(point.format_location("x", false), "x:(1,2)");
        let multi = SourceRef { to_line: 5, ..sr };
        assert_eq!(multi.format_location("m", false), "m:(3,4-5,10)");
    }

    #[test]
    fn test_builder_pools_dedup() {
        let mut b = ProtoBuilder::chunk("main");
        b.push_string("x");
        b.push_string("x");
        b.push_number(1.0);
        b.push_number(1.0);
        let g = b.global("print");
        b.load(&g);
        b.load(&g);
        let proto = b.build();
        assert_eq!(proto.strings.len(), 1);
        assert_eq!(proto.numbers.len(), 1);
        assert_eq!(proto.symbols.len(), 1);
        assert!(proto.flags.contains(ProtoFlags::IS_CHUNK));
    }

    #[test]
    fn test_disassembly_mentions_operands() {
        let mut b = ProtoBuilder::chunk("main");
        b.begin_fn(0, false);
        b.push_string("hello");
        b.ret(1);
        let text = b.build().to_string();
        assert!(text.contains("function main [chunk]"));
        assert!(text.contains("PUSHSTRING"));
        assert!(text.contains("; \"hello\""));
    }
}
